use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::hw::Hardware;

/// Status LED patterns, one task for the lifetime of the controller:
/// `(on_ms, off_ms)` blinks, `(x, 0)` holds the LED on, `(0, x)` holds it
/// off. Reconfiguring never respawns the task.
pub struct Flasher {
    pattern: watch::Sender<(u64, u64)>,
}

impl Flasher {
    pub fn spawn(hw: Arc<dyn Hardware>, pin: u8) -> Self {
        let (tx, rx) = watch::channel((0u64, 0u64));
        tokio::spawn(run(hw, pin, rx));
        Self { pattern: tx }
    }

    pub fn set_pattern(&self, on_ms: u64, off_ms: u64) {
        let _ = self.pattern.send((on_ms, off_ms));
    }
}

async fn run(hw: Arc<dyn Hardware>, pin: u8, mut pattern: watch::Receiver<(u64, u64)>) {
    let mut lit = false;
    loop {
        let (on_ms, off_ms) = *pattern.borrow_and_update();

        if on_ms > 0 && off_ms > 0 {
            lit = !lit;
            hw.write_level(pin, lit);
            let delay = if lit { on_ms } else { off_ms };
            tokio::select! {
                changed = pattern.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        } else {
            lit = on_ms > 0;
            hw.write_level(pin, lit);
            if pattern.changed().await.is_err() {
                break;
            }
        }
    }

    hw.write_level(pin, false);
}
