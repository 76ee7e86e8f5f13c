use chrono::{DateTime, Utc};

/// Wall-clock source. `None` until the platform time sync (SNTP on the
/// embedded target) has completed; the target resolver refuses to act on an
/// unsynced clock.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> Option<DateTime<Utc>>;
}

/// Host clock: the operating system keeps time for us.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }
}

#[cfg(test)]
pub(crate) struct FixedClock(pub Option<DateTime<Utc>>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now_utc(&self) -> Option<DateTime<Utc>> {
        self.0
    }
}
