#![allow(dead_code)] // parts of the hardware contract are only constructed by embedded ports and tests

use std::collections::HashMap;
use std::sync::Mutex;

/// Pins wired out for device use on the reference board; everything else is
/// strapping, flash, or UART.
pub const ALLOWED_PIN_MASK: u32 = (1 << 0)
    | (1 << 2)
    | (1 << 4)
    | (1 << 5)
    | (1 << 12)
    | (1 << 13)
    | (1 << 14)
    | (1 << 15)
    | (1 << 16);

pub fn pin_allowed(pin: u8) -> bool {
    pin < 32 && ALLOWED_PIN_MASK & (1 << pin) != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtModel {
    Dht11,
    Dht22,
}

#[derive(Debug, Clone, Copy)]
pub struct DhtReading {
    pub humidity: f64,
    pub temperature: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum HwError {
    #[error("pin {0} is not available for device use")]
    PinNotAllowed(u8),
    #[error("gpio configuration failed on pin {0}")]
    Gpio(u8),
    #[error("sensor read failed on pin {0}")]
    ReadFailed(u8),
    #[error("no one-wire devices answered on pin {0}")]
    BusEmpty(u8),
    #[error("{count} one-wire devices on pin {pin}; a sensor address is required")]
    BusAmbiguous { pin: u8, count: usize },
}

/// Electrical boundary. The embedded port supplies the real GPIO, DHT
/// bit-banging, and one-wire drivers behind this trait; the host build runs
/// against [`SimHardware`]. Reads may block for tens of milliseconds, which
/// is why each sensor samples on its own task.
pub trait Hardware: Send + Sync {
    fn configure_output(&self, pin: u8) -> Result<(), HwError>;
    fn configure_bus(&self, pin: u8) -> Result<(), HwError>;
    fn release_pin(&self, pin: u8);
    fn write_level(&self, pin: u8, high: bool);
    fn read_dht(&self, pin: u8, model: DhtModel) -> Result<DhtReading, HwError>;
    fn scan_one_wire(&self, pin: u8) -> Result<Vec<u64>, HwError>;
    fn read_ds18x20(&self, pin: u8, address: u64) -> Result<f64, HwError>;
}

/// Host stand-in: deterministic drifting readings and in-memory pin levels,
/// so the controller runs end-to-end against a real broker with no sensors
/// attached. Replace with the platform driver on an embedded target.
#[derive(Default)]
pub struct SimHardware {
    ticks: Mutex<HashMap<u8, u64>>,
    levels: Mutex<HashMap<u8, bool>>,
}

impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self, pin: u8) -> u64 {
        let mut ticks = self.ticks.lock().expect("sim tick lock");
        let tick = ticks.entry(pin).or_insert(0);
        *tick += 1;
        *tick
    }
}

impl Hardware for SimHardware {
    fn configure_output(&self, _pin: u8) -> Result<(), HwError> {
        Ok(())
    }

    fn configure_bus(&self, _pin: u8) -> Result<(), HwError> {
        Ok(())
    }

    fn release_pin(&self, pin: u8) {
        self.levels.lock().expect("sim level lock").remove(&pin);
    }

    fn write_level(&self, pin: u8, high: bool) {
        self.levels.lock().expect("sim level lock").insert(pin, high);
    }

    fn read_dht(&self, pin: u8, _model: DhtModel) -> Result<DhtReading, HwError> {
        let tick = self.tick(pin);
        Ok(DhtReading {
            humidity: 42.0 + (tick % 6) as f64 * 0.5,
            temperature: 21.0 + (tick % 8) as f64 * 0.2,
        })
    }

    fn scan_one_wire(&self, _pin: u8) -> Result<Vec<u64>, HwError> {
        Ok(vec![0x28_FF_64_1E_0F_3C])
    }

    fn read_ds18x20(&self, pin: u8, _address: u64) -> Result<f64, HwError> {
        let tick = self.tick(pin);
        Ok(19.5 + (tick % 10) as f64 * 0.1)
    }
}
