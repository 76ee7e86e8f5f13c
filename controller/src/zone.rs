use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rumqttc::QoS;
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use zonectl_common::{
    classify, drives_on, reading_topic, wants_increase, within_band, Calibration,
    CalibrationConfig, ChangeRule, ChangeRuleConfig, DeviceTarget, Override, OverrideConfig,
    ReadingEnvelope, Schedule, ScheduleConfig, TopicShape, Value, WireQuantity, ZoneProgram,
    DEFAULT_SAMPLE_INTERVAL_MS,
};

use crate::clock::Clock;
use crate::device::{parse_address, spawn_sampler, Device, Driver};
use crate::hw::{DhtModel, Hardware, HwError};
use crate::transport::{CommandSender, TransportCommand};

/// A driven switch re-enters evaluation as a reading, so a cyclic rule set
/// could ping-pong forever under the zone lock. Anything past this many
/// events per originating reading is dropped.
const MAX_ACTUATION_CASCADE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DeviceConfigError {
    #[error("interface section is missing")]
    MissingInterface,
    #[error("interface.type is missing")]
    MissingKind,
    #[error("interface.address is missing")]
    MissingAddress,
    #[error("unknown device kind `{0}`")]
    UnknownKind(String),
    #[error("malformed interface address `{0}`")]
    BadAddress(String),
    #[error(transparent)]
    Init(#[from] HwError),
}

#[derive(Debug, Deserialize)]
struct ZoneConfigPayload {
    schedules: Option<Vec<Json>>,
    overrides: Option<Vec<Json>>,
}

#[derive(Debug, Deserialize)]
struct DeviceConfigPayload {
    interface: Option<InterfaceConfig>,
    changes: Option<Vec<Json>>,
    calibrations: Option<Vec<Json>>,
}

#[derive(Debug, Deserialize)]
struct InterfaceConfig {
    #[serde(rename = "type")]
    kind: Option<String>,
    address: Option<String>,
    interval: Option<u64>,
    #[serde(default)]
    invert: bool,
}

struct ReadingEvent {
    device: String,
    reading_type: String,
    value: Value,
    unit: String,
    threshold: Option<f64>,
}

/// One zone of one home: its devices, schedules and overrides, and the
/// reading path that publishes and actuates. All mutation happens under one
/// lock; sampling workers and the dispatcher share the zone through an `Arc`.
pub struct Zone {
    home_id: String,
    zone_id: String,
    tz: Tz,
    hw: Arc<dyn Hardware>,
    clock: Arc<dyn Clock>,
    commands: CommandSender,
    /// Handed to sampling workers so they can report back without the zone
    /// keeping itself alive.
    weak: Weak<Zone>,
    state: Mutex<ZoneState>,
}

#[derive(Default)]
struct ZoneState {
    devices: HashMap<String, Device>,
    program: ZoneProgram,
}

impl Zone {
    pub fn new(
        home_id: &str,
        zone_id: &str,
        tz: Tz,
        hw: Arc<dyn Hardware>,
        clock: Arc<dyn Clock>,
        commands: CommandSender,
    ) -> Arc<Self> {
        info!(home = home_id, zone = zone_id, "zone created");
        Arc::new_cyclic(|weak| Self {
            home_id: home_id.to_string(),
            zone_id: zone_id.to_string(),
            tz,
            hw,
            clock,
            commands,
            weak: weak.clone(),
            state: Mutex::new(ZoneState::default()),
        })
    }

    pub fn matches(&self, home: &str, zone: &str) -> bool {
        self.home_id == home && self.zone_id == zone
    }

    pub fn hw(&self) -> &dyn Hardware {
        self.hw.as_ref()
    }

    /// Path-addressed configuration entry point; every broker message is
    /// offered to every owned zone.
    pub async fn handle_message(&self, parts: &[&str], payload: &Json) {
        match classify(parts) {
            TopicShape::ZoneConfig { home, zone } if self.matches(home, zone) => {
                self.apply_zone_config(payload).await;
            }
            TopicShape::DeviceMessage {
                home,
                zone,
                device,
                channel,
            } => {
                let local = self.matches(home, zone);
                if local && channel == "config" {
                    self.apply_device_config(device, payload).await;
                } else if !local && channel != "config" {
                    // Hook for cross-zone coordination: remote readings are
                    // observed but not yet consumed.
                    debug!(home, zone, device, channel, "remote device reading observed");
                }
            }
            _ => {}
        }
    }

    async fn apply_zone_config(&self, payload: &Json) {
        let parsed: ZoneConfigPayload = match serde_json::from_value(payload.clone()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(zone = %self.zone_id, "discarding invalid zone config: {err}");
                return;
            }
        };

        let mut state = self.state.lock().await;

        if let Some(entries) = parsed.schedules {
            let schedules = entries
                .into_iter()
                .filter_map(|entry| match serde_json::from_value::<ScheduleConfig>(entry) {
                    Ok(config) => {
                        let schedule = Schedule::from_config(config, &self.home_id, &self.zone_id);
                        if schedule.is_none() {
                            warn!(zone = %self.zone_id, "skipping schedule with malformed start");
                        }
                        schedule
                    }
                    Err(err) => {
                        warn!(zone = %self.zone_id, "skipping malformed schedule: {err}");
                        None
                    }
                })
                .collect();
            state.program.set_schedules(schedules);
        }

        if let Some(entries) = parsed.overrides {
            let overrides = entries
                .into_iter()
                .filter_map(|entry| match serde_json::from_value::<OverrideConfig>(entry) {
                    Ok(config) => {
                        let window = Override::from_config(config, &self.home_id, &self.zone_id);
                        if window.is_none() {
                            warn!(zone = %self.zone_id, "skipping override with malformed window");
                        }
                        window
                    }
                    Err(err) => {
                        warn!(zone = %self.zone_id, "skipping malformed override: {err}");
                        None
                    }
                })
                .collect();
            state.program.set_overrides(overrides);
        }

        info!(
            zone = %self.zone_id,
            schedules = state.program.schedules().len(),
            overrides = state.program.overrides().len(),
            "zone program updated"
        );
    }

    /// Device config application. Invalid config removes the device; a failed
    /// init leaves no partially built device behind.
    pub async fn apply_device_config(&self, device_id: &str, payload: &Json) {
        let parsed: DeviceConfigPayload = match serde_json::from_value(payload.clone()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(device = %device_id, "removing device on invalid config: {err}");
                self.remove_device(device_id).await;
                return;
            }
        };

        let (kind, address, interval, invert) = match validate_interface(parsed.interface) {
            Ok(interface) => interface,
            Err(err) => {
                warn!(device = %device_id, "removing device: {err}");
                self.remove_device(device_id).await;
                return;
            }
        };

        // Pull any existing device out of the zone while it is rebuilt; a
        // failed rebuild must not leave it behind.
        let existing = {
            let mut state = self.state.lock().await;
            state.devices.remove(device_id)
        };

        let mut preserved = (Vec::new(), Vec::new());
        if let Some(mut device) = existing {
            if let Some(worker) = device.take_worker() {
                worker.stop_and_join().await;
            }
            let matches = device.kind_matches(&kind);
            device.shutdown(self.hw.as_ref());
            if matches {
                preserved = device.into_lists();
            } else {
                info!(device = %device_id, kind = %kind, "device kind changed, recreating");
            }
        }

        let driver = match self.build_driver(&kind, &address, invert) {
            Ok(driver) => driver,
            Err(err) => {
                warn!(device = %device_id, "dropping device: {err}");
                return;
            }
        };

        let mut device = Device::from_parts(device_id, driver, preserved.0, preserved.1);

        if let Some(entries) = parsed.changes {
            device.apply_changes(self.parse_changes(entries));
        }
        if let Some(entries) = parsed.calibrations {
            device.apply_calibrations(parse_calibrations(entries));
        }

        let interval = interval.unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS);
        info!(device = %device_id, kind = %kind, interval, "device configured");

        {
            let mut state = self.state.lock().await;
            state.devices.insert(device_id.to_string(), device);
        }
        self.set_sampling_interval(device_id, interval).await;
    }

    fn build_driver(&self, kind: &str, address: &str, invert: bool) -> Result<Driver, DeviceConfigError> {
        let bad_address = || DeviceConfigError::BadAddress(address.to_string());
        let hw = self.hw.as_ref();

        match kind {
            "dht11" | "dht22" => {
                let (pin, _) = parse_address(address).ok_or_else(bad_address)?;
                let model = if kind == "dht11" {
                    DhtModel::Dht11
                } else {
                    DhtModel::Dht22
                };
                Ok(Driver::init_dht(hw, pin, model)?)
            }
            "ds18x20" => {
                let (pin, rom) = parse_address(address).ok_or_else(bad_address)?;
                Ok(Driver::init_ds18x20(hw, pin, rom)?)
            }
            "gpio" => {
                let (pin, _) = parse_address(address).ok_or_else(bad_address)?;
                Ok(Driver::init_switch(hw, pin, invert)?)
            }
            other => Err(DeviceConfigError::UnknownKind(other.to_string())),
        }
    }

    fn parse_changes(&self, entries: Vec<Json>) -> Vec<ChangeRule> {
        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<ChangeRuleConfig>(entry) {
                Ok(config) => Some(ChangeRule::from_config(config, &self.home_id, &self.zone_id)),
                Err(err) => {
                    warn!(zone = %self.zone_id, "skipping malformed change rule: {err}");
                    None
                }
            })
            .collect()
    }

    /// Stop any current worker, then start the replacement. The join happens
    /// before the new worker exists, so two workers are never observable and
    /// the lock is never held across the join.
    pub async fn set_sampling_interval(&self, device_id: &str, interval_ms: u64) {
        let (old_worker, sampler) = {
            let mut state = self.state.lock().await;
            let Some(device) = state.devices.get_mut(device_id) else {
                return;
            };
            (device.take_worker(), device.sampler())
        };

        if let Some(worker) = old_worker {
            worker.stop_and_join().await;
        }

        let Some(sampler) = sampler else {
            return;
        };
        if interval_ms == 0 {
            return;
        }
        let Some(zone) = self.weak.upgrade() else {
            return;
        };

        let worker = spawn_sampler(zone, device_id.to_string(), sampler, interval_ms);
        let orphaned = {
            let mut state = self.state.lock().await;
            match state.devices.get_mut(device_id) {
                Some(device) => {
                    device.set_worker(worker);
                    None
                }
                None => Some(worker),
            }
        };
        if let Some(worker) = orphaned {
            worker.stop_and_join().await;
        }
    }

    pub async fn remove_device(&self, device_id: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            state.devices.remove(device_id)
        };
        if let Some(device) = removed {
            info!(device = %device_id, kind = device.kind_tag(), "device removed");
            self.teardown_device(device).await;
        }
    }

    async fn teardown_device(&self, mut device: Device) {
        if let Some(worker) = device.take_worker() {
            worker.stop_and_join().await;
        }
        if let Some(on) = device.switch_state() {
            debug!(device = %device.id(), was_on = on, "actuator released");
        }
        device.shutdown(self.hw.as_ref());
    }

    /// Destroy every device; used when zone ownership is withdrawn.
    pub async fn teardown(&self) {
        let devices: Vec<Device> = {
            let mut state = self.state.lock().await;
            state.devices.drain().map(|(_, device)| device).collect()
        };
        for device in devices {
            self.teardown_device(device).await;
        }
    }

    /// Calibration snapshot for a sampling cycle; `None` means the device is
    /// gone and the worker should stand down.
    pub async fn device_calibrations(&self, device_id: &str) -> Option<Vec<Calibration>> {
        let state = self.state.lock().await;
        state
            .devices
            .get(device_id)
            .map(|device| device.calibrations().to_vec())
    }

    /// Reading entry point: publish the envelope, resolve the target, and
    /// actuate. Atomic per zone; switch state reports produced by actuation
    /// are processed in the same critical section.
    pub async fn set_value(
        &self,
        device_id: &str,
        reading_type: &str,
        value: Value,
        unit: &str,
        threshold: Option<f64>,
    ) {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;

        let mut queue = VecDeque::new();
        queue.push_back(ReadingEvent {
            device: device_id.to_string(),
            reading_type: reading_type.to_string(),
            value,
            unit: unit.to_string(),
            threshold,
        });

        let mut processed = 0;
        while let Some(event) = queue.pop_front() {
            if processed == MAX_ACTUATION_CASCADE {
                warn!(zone = %self.zone_id, "actuation cascade truncated");
                break;
            }
            processed += 1;
            self.process_reading(&mut state, event, now, &mut queue);
        }
    }

    fn process_reading(
        &self,
        state: &mut ZoneState,
        event: ReadingEvent,
        now: Option<DateTime<Utc>>,
        queue: &mut VecDeque<ReadingEvent>,
    ) {
        let target = now
            .and_then(|now| {
                state.program.resolve(
                    now,
                    self.tz,
                    &self.home_id,
                    &self.zone_id,
                    &event.device,
                    &event.reading_type,
                )
            })
            .cloned();

        self.publish_reading(&event, target.as_ref(), now);

        let Some(target) = target else {
            return;
        };

        match within_band(event.value, target.value.value, event.threshold.unwrap_or(0.0)) {
            Some(true) => {
                debug!(device = %event.device, reading = %event.reading_type, "reading on target");
                return;
            }
            Some(false) => {}
            None => {
                warn!(
                    device = %event.device,
                    reading = %event.reading_type,
                    "target is not comparable with the reading"
                );
                return;
            }
        }

        let Some(rising) = wants_increase(event.value, target.value.value) else {
            return;
        };

        for device in state.devices.values_mut() {
            let drives: Vec<bool> = device
                .changes()
                .iter()
                .filter(|rule| {
                    rule.matches(&self.home_id, &self.zone_id, &event.device, &event.reading_type)
                })
                .map(|rule| drives_on(rule.direction, rising))
                .collect();

            for on in drives {
                if let Some(switched) = device.drive(self.hw.as_ref(), on) {
                    debug!(device = %device.id(), on = switched, "actuator driven");
                    queue.push_back(ReadingEvent {
                        device: device.id().to_string(),
                        reading_type: "switch".to_string(),
                        value: Value::Bool(switched),
                        unit: String::new(),
                        threshold: None,
                    });
                }
            }
        }
    }

    fn publish_reading(
        &self,
        event: &ReadingEvent,
        target: Option<&DeviceTarget>,
        now: Option<DateTime<Utc>>,
    ) {
        let time = now
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();

        let envelope = ReadingEnvelope {
            time,
            value: WireQuantity::new(event.value, &event.unit),
            target: target.map(|target| WireQuantity::new(target.value.value, &target.value.unit)),
            threshold: event
                .threshold
                .map(|threshold| WireQuantity::new(Value::Float(threshold), &event.unit)),
        };

        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("reading envelope serialisation failed: {err}");
                return;
            }
        };

        let topic = reading_topic(&self.home_id, &self.zone_id, &event.device, &event.reading_type);
        let command = TransportCommand::Publish {
            topic,
            payload,
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        if self.commands.send(command).is_err() {
            warn!("transport command channel closed; reading dropped");
        }
    }
}

fn validate_interface(
    interface: Option<InterfaceConfig>,
) -> Result<(String, String, Option<u64>, bool), DeviceConfigError> {
    let interface = interface.ok_or(DeviceConfigError::MissingInterface)?;
    let kind = interface.kind.ok_or(DeviceConfigError::MissingKind)?;
    let address = interface.address.ok_or(DeviceConfigError::MissingAddress)?;
    Ok((kind, address, interface.interval, interface.invert))
}

fn parse_calibrations(entries: Vec<Json>) -> Vec<Calibration> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<CalibrationConfig>(entry) {
            Ok(config) => Some(Calibration::from_config(config)),
            Err(err) => {
                warn!("skipping malformed calibration: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
impl Zone {
    pub(crate) async fn has_device(&self, device_id: &str) -> bool {
        self.state.lock().await.devices.contains_key(device_id)
    }

    pub(crate) async fn device_kind(&self, device_id: &str) -> Option<&'static str> {
        let state = self.state.lock().await;
        state.devices.get(device_id).map(Device::kind_tag)
    }

    pub(crate) async fn device_change_count(&self, device_id: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.devices.get(device_id).map(|device| device.changes().len())
    }

    pub(crate) async fn device_has_worker(&self, device_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .devices
            .get(device_id)
            .map(Device::has_worker)
            .unwrap_or(false)
    }

    pub(crate) async fn switch_state(&self, device_id: &str) -> Option<bool> {
        let state = self.state.lock().await;
        state.devices.get(device_id).and_then(Device::switch_state)
    }

    pub(crate) async fn schedule_count(&self) -> usize {
        self.state.lock().await.program.schedules().len()
    }

    pub(crate) async fn override_count(&self) -> usize {
        self.state.lock().await.program.overrides().len()
    }
}
