use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use zonectl_common::{humidex, Calibration, ChangeRule, Value};

use crate::hw::{pin_allowed, DhtModel, Hardware, HwError};
use crate::zone::Zone;

const DEFAULT_DHT_TEMPERATURE_THRESHOLD: f64 = 0.0;
const DEFAULT_DHT_HUMIDITY_THRESHOLD: f64 = 5.0;
const DEFAULT_DHT_HUMIDEX_THRESHOLD: f64 = 0.0;
const DEFAULT_DS18X20_TEMPERATURE_THRESHOLD: f64 = 0.2;

const READ_ATTEMPTS: u32 = 3;
const SCAN_ATTEMPTS: u32 = 3;

/// A device owned by a zone: a driver plus the change rules and calibrations
/// configuration attached to it. The kind is fixed at construction; a kind
/// change is a delete-then-create in the zone.
pub struct Device {
    id: String,
    driver: Driver,
    changes: Vec<ChangeRule>,
    calibrations: Vec<Calibration>,
}

pub enum Driver {
    Dht {
        pin: u8,
        model: DhtModel,
        worker: Option<Worker>,
    },
    Ds18x20 {
        pin: u8,
        address: u64,
        worker: Option<Worker>,
    },
    Switch {
        pin: u8,
        invert: bool,
        is_on: bool,
    },
}

/// Handle of a running sampling task. Stopping always joins, so a worker is
/// never observable alongside its replacement.
pub struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub async fn stop_and_join(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

impl Device {
    pub fn new(id: &str, driver: Driver) -> Self {
        Self::from_parts(id, driver, Vec::new(), Vec::new())
    }

    pub fn from_parts(
        id: &str,
        driver: Driver,
        changes: Vec<ChangeRule>,
        calibrations: Vec<Calibration>,
    ) -> Self {
        Self {
            id: id.to_string(),
            driver,
            changes,
            calibrations,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The wire tag this device answers to. A DHT device answers both `dht11`
    /// and `dht22` (the model is an init parameter, not an identity).
    pub fn kind_matches(&self, tag: &str) -> bool {
        matches!(
            (&self.driver, tag),
            (Driver::Dht { .. }, "dht11" | "dht22")
                | (Driver::Ds18x20 { .. }, "ds18x20")
                | (Driver::Switch { .. }, "gpio")
        )
    }

    pub fn kind_tag(&self) -> &'static str {
        match &self.driver {
            Driver::Dht {
                model: DhtModel::Dht11,
                ..
            } => "dht11",
            Driver::Dht {
                model: DhtModel::Dht22,
                ..
            } => "dht22",
            Driver::Ds18x20 { .. } => "ds18x20",
            Driver::Switch { .. } => "gpio",
        }
    }

    /// Full replacement, never a merge.
    pub fn apply_changes(&mut self, changes: Vec<ChangeRule>) {
        self.changes = changes;
    }

    pub fn apply_calibrations(&mut self, calibrations: Vec<Calibration>) {
        self.calibrations = calibrations;
    }

    pub fn changes(&self) -> &[ChangeRule] {
        &self.changes
    }

    pub fn calibrations(&self) -> &[Calibration] {
        &self.calibrations
    }

    pub fn take_worker(&mut self) -> Option<Worker> {
        match &mut self.driver {
            Driver::Dht { worker, .. } | Driver::Ds18x20 { worker, .. } => worker.take(),
            Driver::Switch { .. } => None,
        }
    }

    pub fn set_worker(&mut self, new: Worker) {
        match &mut self.driver {
            Driver::Dht { worker, .. } | Driver::Ds18x20 { worker, .. } => *worker = Some(new),
            Driver::Switch { .. } => {}
        }
    }

    #[cfg(test)]
    pub fn has_worker(&self) -> bool {
        match &self.driver {
            Driver::Dht { worker, .. } | Driver::Ds18x20 { worker, .. } => worker.is_some(),
            Driver::Switch { .. } => false,
        }
    }

    pub fn sampler(&self) -> Option<Sampler> {
        match &self.driver {
            Driver::Dht { pin, model, .. } => Some(Sampler::Dht {
                pin: *pin,
                model: *model,
            }),
            Driver::Ds18x20 { pin, address, .. } => Some(Sampler::Ds18x20 {
                pin: *pin,
                address: *address,
            }),
            Driver::Switch { .. } => None,
        }
    }

    /// Drive an actuator; sensors ignore this. Returns the new switch state
    /// so the zone can report it.
    pub fn drive(&mut self, hw: &dyn Hardware, on: bool) -> Option<bool> {
        if let Driver::Switch { pin, invert, is_on } = &mut self.driver {
            // Active-low by default: relay modules pull the coil on a low level.
            let level = if *invert { on } else { !on };
            hw.write_level(*pin, level);
            *is_on = on;
            Some(on)
        } else {
            None
        }
    }

    pub fn switch_state(&self) -> Option<bool> {
        match &self.driver {
            Driver::Switch { is_on, .. } => Some(*is_on),
            _ => None,
        }
    }

    /// Driver teardown: outputs parked off, pin released. The worker must
    /// already be stopped. No state report is published for the parked output.
    pub fn shutdown(&mut self, hw: &dyn Hardware) {
        match &mut self.driver {
            Driver::Switch { pin, invert, is_on } => {
                hw.write_level(*pin, !*invert);
                *is_on = false;
                hw.release_pin(*pin);
            }
            Driver::Dht { pin, .. } | Driver::Ds18x20 { pin, .. } => hw.release_pin(*pin),
        }
    }

    pub fn into_lists(self) -> (Vec<ChangeRule>, Vec<Calibration>) {
        (self.changes, self.calibrations)
    }
}

impl Driver {
    pub fn init_dht(hw: &dyn Hardware, pin: u8, model: DhtModel) -> Result<Self, HwError> {
        if !pin_allowed(pin) {
            return Err(HwError::PinNotAllowed(pin));
        }
        hw.configure_bus(pin)?;

        Ok(Self::Dht {
            pin,
            model,
            worker: None,
        })
    }

    pub fn init_ds18x20(hw: &dyn Hardware, pin: u8, address: Option<u64>) -> Result<Self, HwError> {
        if !pin_allowed(pin) {
            return Err(HwError::PinNotAllowed(pin));
        }
        hw.configure_bus(pin)?;

        let address = match address {
            Some(address) => address,
            None => scan_single(hw, pin)?,
        };

        Ok(Self::Ds18x20 {
            pin,
            address,
            worker: None,
        })
    }

    pub fn init_switch(hw: &dyn Hardware, pin: u8, invert: bool) -> Result<Self, HwError> {
        if !pin_allowed(pin) {
            return Err(HwError::PinNotAllowed(pin));
        }
        hw.configure_output(pin)?;
        // Park the output in the off state before anything can observe it.
        hw.write_level(pin, !invert);

        Ok(Self::Switch {
            pin,
            invert,
            is_on: false,
        })
    }
}

/// A bus with several sensors needs an explicit address; an empty bus may
/// just be settling, so empty scans and bus errors are retried.
fn scan_single(hw: &dyn Hardware, pin: u8) -> Result<u64, HwError> {
    let mut last = HwError::BusEmpty(pin);
    for _ in 0..SCAN_ATTEMPTS {
        match hw.scan_one_wire(pin) {
            Ok(addresses) => match addresses.len() {
                1 => return Ok(addresses[0]),
                0 => last = HwError::BusEmpty(pin),
                count => return Err(HwError::BusAmbiguous { pin, count }),
            },
            Err(err) => last = err,
        }
    }
    Err(last)
}

/// Immutable per-worker sampling parameters, captured at spawn. Calibrations
/// are looked up fresh on every cycle.
#[derive(Debug, Clone, Copy)]
pub enum Sampler {
    Dht { pin: u8, model: DhtModel },
    Ds18x20 { pin: u8, address: u64 },
}

pub fn spawn_sampler(
    zone: Arc<Zone>,
    device_id: String,
    sampler: Sampler,
    interval_ms: u64,
) -> Worker {
    let (stop, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(run_sampler(zone, device_id, sampler, interval_ms, stop_rx));
    Worker { stop, handle }
}

async fn run_sampler(
    zone: Arc<Zone>,
    device_id: String,
    sampler: Sampler,
    interval_ms: u64,
    mut stop: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(interval_ms);
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            _ = sample_cycle(&zone, &device_id, sampler) => {}
        }
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(device = %device_id, "sampling worker stopped");
}

async fn sample_cycle(zone: &Arc<Zone>, device_id: &str, sampler: Sampler) {
    let Some(calibrations) = zone.device_calibrations(device_id).await else {
        // Device already removed; our stop signal is on its way.
        return;
    };

    match sampler {
        Sampler::Dht { pin, model } => {
            let reading = match with_retry(|| zone.hw().read_dht(pin, model)) {
                Ok(reading) => reading,
                Err(err) => {
                    warn!(device = %device_id, "sample cycle skipped: {err}");
                    return;
                }
            };

            let (temperature, threshold) = calibrated(
                &calibrations,
                "temperature",
                reading.temperature,
                DEFAULT_DHT_TEMPERATURE_THRESHOLD,
            );
            zone.set_value(
                device_id,
                "temperature",
                Value::Float(temperature),
                "celsius",
                Some(threshold),
            )
            .await;

            let (humidity, threshold) = calibrated(
                &calibrations,
                "humidity",
                reading.humidity,
                DEFAULT_DHT_HUMIDITY_THRESHOLD,
            );
            zone.set_value(
                device_id,
                "humidity",
                Value::Float(humidity),
                "percent",
                Some(threshold),
            )
            .await;

            // Derived from the calibrated pair, then calibrated itself.
            let (index, threshold) = calibrated(
                &calibrations,
                "humidex",
                humidex(temperature, humidity),
                DEFAULT_DHT_HUMIDEX_THRESHOLD,
            );
            zone.set_value(device_id, "humidex", Value::Float(index), "", Some(threshold))
                .await;
        }
        Sampler::Ds18x20 { pin, address } => {
            let raw = match with_retry(|| zone.hw().read_ds18x20(pin, address)) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(device = %device_id, "sample cycle skipped: {err}");
                    return;
                }
            };

            let (temperature, threshold) = calibrated(
                &calibrations,
                "temperature",
                raw,
                DEFAULT_DS18X20_TEMPERATURE_THRESHOLD,
            );
            zone.set_value(
                device_id,
                "temperature",
                Value::Float(temperature),
                "celsius",
                Some(threshold),
            )
            .await;
        }
    }
}

fn calibrated(
    calibrations: &[Calibration],
    reading_type: &str,
    raw: f64,
    default_threshold: f64,
) -> (f64, f64) {
    match calibrations.iter().find(|entry| entry.matches(reading_type)) {
        Some(entry) => (entry.adjust(raw), entry.threshold_value()),
        None => (raw, default_threshold),
    }
}

fn with_retry<T>(mut read: impl FnMut() -> Result<T, HwError>) -> Result<T, HwError> {
    let mut attempt = 0;
    loop {
        match read() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= READ_ATTEMPTS {
                    return Err(err);
                }
            }
        }
    }
}

/// `"<pin>"` or `"<pin>:<rom-hex>"`.
pub fn parse_address(address: &str) -> Option<(u8, Option<u64>)> {
    let mut parts = address.splitn(2, ':');
    let pin = parts.next()?.trim().parse().ok()?;
    let rom = match parts.next() {
        Some(rom) => Some(u64::from_str_radix(rom.trim(), 16).ok()?),
        None => None,
    };
    Some((pin, rom))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockHardware;

    #[test]
    fn rejects_pins_outside_the_mask() {
        let hw = MockHardware::new();
        assert!(matches!(
            Driver::init_dht(&hw, 3, DhtModel::Dht11),
            Err(HwError::PinNotAllowed(3))
        ));
        assert!(matches!(
            Driver::init_switch(&hw, 17, false),
            Err(HwError::PinNotAllowed(17))
        ));
        assert!(Driver::init_switch(&hw, 5, false).is_ok());
    }

    #[test]
    fn dht_answers_both_model_tags() {
        let hw = MockHardware::new();
        let device = Device::new("t1", Driver::init_dht(&hw, 4, DhtModel::Dht22).unwrap());

        assert!(device.kind_matches("dht11"));
        assert!(device.kind_matches("dht22"));
        assert!(!device.kind_matches("ds18x20"));
        assert!(!device.kind_matches("gpio"));
        assert_eq!(device.kind_tag(), "dht22");
    }

    #[test]
    fn one_wire_scan_retries_transient_failures() {
        let hw = MockHardware::new();
        hw.push_scan(Err(HwError::ReadFailed(12)));
        hw.push_scan(Ok(Vec::new()));
        hw.push_scan(Ok(vec![0x28_00_00_01]));

        let driver = Driver::init_ds18x20(&hw, 12, None).unwrap();
        assert!(matches!(driver, Driver::Ds18x20 { address: 0x28_00_00_01, .. }));
        assert_eq!(hw.scans(), 3);
    }

    #[test]
    fn ambiguous_one_wire_bus_fails_without_address() {
        let hw = MockHardware::new();
        hw.push_scan(Ok(vec![0x01, 0x02]));

        assert!(matches!(
            Driver::init_ds18x20(&hw, 12, None),
            Err(HwError::BusAmbiguous { pin: 12, count: 2 })
        ));

        // An explicit address skips the scan entirely.
        let driver = Driver::init_ds18x20(&hw, 12, Some(0x02)).unwrap();
        assert!(matches!(driver, Driver::Ds18x20 { address: 0x02, .. }));
    }

    #[test]
    fn switch_defaults_active_low_and_honours_invert() {
        let hw = MockHardware::new();
        let mut device = Device::new("sw", Driver::init_switch(&hw, 5, false).unwrap());
        // Init parks the output off, which is a high level when active-low.
        assert_eq!(hw.last_level(5), Some(true));

        device.drive(&hw, true);
        assert_eq!(hw.last_level(5), Some(false));
        assert_eq!(device.switch_state(), Some(true));

        device.drive(&hw, false);
        assert_eq!(hw.last_level(5), Some(true));

        let mut inverted = Device::new("sw2", Driver::init_switch(&hw, 4, true).unwrap());
        assert_eq!(hw.last_level(4), Some(false));
        inverted.drive(&hw, true);
        assert_eq!(hw.last_level(4), Some(true));
    }

    #[test]
    fn shutdown_parks_the_output_off() {
        let hw = MockHardware::new();
        let mut device = Device::new("sw", Driver::init_switch(&hw, 5, false).unwrap());
        device.drive(&hw, true);
        device.shutdown(&hw);

        assert_eq!(hw.last_level(5), Some(true));
        assert_eq!(device.switch_state(), Some(false));
    }

    #[test]
    fn sensors_ignore_drive_requests() {
        let hw = MockHardware::new();
        let mut device = Device::new("t1", Driver::init_dht(&hw, 4, DhtModel::Dht11).unwrap());
        assert_eq!(device.drive(&hw, true), None);
        assert!(hw.level_writes().is_empty());
    }

    #[test]
    fn parses_plain_and_rom_addresses() {
        assert_eq!(parse_address("5"), Some((5, None)));
        assert_eq!(parse_address("12:28ff641e"), Some((12, Some(0x28_FF_64_1E))));
        assert_eq!(parse_address(""), None);
        assert_eq!(parse_address("five"), None);
        assert_eq!(parse_address("5:xyz"), None);
    }

    #[test]
    fn calibration_lookup_falls_back_to_kind_defaults() {
        let calibrations: Vec<Calibration> = Vec::new();
        let (value, threshold) = calibrated(&calibrations, "humidity", 48.0, 5.0);
        assert!((value - 48.0).abs() < 1e-9);
        assert!((threshold - 5.0).abs() < 1e-9);
    }
}
