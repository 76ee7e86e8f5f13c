pub mod config;
pub mod rules;
pub mod schedule;
pub mod topics;
pub mod value;

pub use config::{mac_matches, ControllerConfig, NetworkConfig, DEFAULT_SAMPLE_INTERVAL_MS};
pub use rules::{
    drives_on, wants_increase, within_band, Calibration, CalibrationConfig, ChangeRule,
    ChangeRuleConfig, Direction,
};
pub use schedule::{
    DeviceTarget, DeviceTargetConfig, Override, OverrideConfig, Schedule, ScheduleConfig,
    ZoneProgram,
};
pub use topics::*;
pub use value::{humidex, Quantity, ReadingEnvelope, Value, WireQuantity};
