use serde::{Deserialize, Serialize};

/// Sampling interval applied when a device config carries no
/// `interface.interval`.
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 60_000;

/// Boot-time network settings. The Wi-Fi fields are opaque to the core and
/// handed to the platform layer; the broker fields feed the MQTT client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub wifi_max_retries: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            wifi_max_retries: 5,
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub network: NetworkConfig,
    /// Controller identity: MAC as uppercase colon-separated hex.
    pub mac: String,
    /// IANA timezone used when matching schedule start times.
    pub timezone: String,
    pub status_led_pin: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            mac: "00:00:00:00:00:00".to_string(),
            timezone: "America/New_York".to_string(),
            status_led_pin: 2,
        }
    }
}

impl ControllerConfig {
    pub fn client_id(&self) -> String {
        format!("zonectl-{}", self.mac.to_ascii_lowercase().replace(':', ""))
    }

    /// Ownership test against the `controller` field of a zone config.
    pub fn owns_mac(&self, claimed: &str) -> bool {
        mac_matches(&self.mac, claimed)
    }
}

pub fn mac_matches(ours: &str, claimed: &str) -> bool {
    ours.eq_ignore_ascii_case(claimed.trim())
}
