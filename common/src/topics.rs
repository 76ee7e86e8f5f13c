/// Broker-wide subscriptions taken on every (re)connect.
pub const HOME_CONFIG_FILTER: &str = "homes/+/config";
pub const ZONE_CONFIG_FILTER: &str = "homes/+/zones/+/config";
pub const DEVICE_EVENT_FILTER: &str = "homes/+/zones/+/devices/+/+";

/// Topic grammar never exceeds seven slash-separated tokens; anything past
/// that stays glued to the last token and fails shape matching.
pub const MAX_TOPIC_SEGMENTS: usize = 7;

pub fn device_config_filter(home: &str, zone: &str) -> String {
    format!("homes/{home}/zones/{zone}/devices/+/config")
}

pub fn reading_topic(home: &str, zone: &str, device: &str, reading_type: &str) -> String {
    format!("homes/{home}/zones/{zone}/devices/{device}/{reading_type}")
}

pub fn split_topic(topic: &str) -> Vec<&str> {
    topic.splitn(MAX_TOPIC_SEGMENTS, '/').collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicShape<'a> {
    HomeConfig {
        home: &'a str,
    },
    ZoneConfig {
        home: &'a str,
        zone: &'a str,
    },
    /// Device config (`channel == "config"`) or a device reading.
    DeviceMessage {
        home: &'a str,
        zone: &'a str,
        device: &'a str,
        channel: &'a str,
    },
    Other,
}

pub fn classify<'a>(parts: &[&'a str]) -> TopicShape<'a> {
    match parts {
        ["homes", home, "config"] => TopicShape::HomeConfig { home },
        ["homes", home, "zones", zone, "config"] => TopicShape::ZoneConfig { home, zone },
        ["homes", home, "zones", zone, "devices", device, channel] => TopicShape::DeviceMessage {
            home,
            zone,
            device,
            channel,
        },
        _ => TopicShape::Other,
    }
}
