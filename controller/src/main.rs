mod clock;
mod device;
mod flasher;
mod hw;
mod registry;
mod transport;
mod zone;

use std::sync::Arc;

use anyhow::anyhow;
use chrono_tz::Tz;
use rumqttc::{AsyncClient, MqttOptions};
use tracing::info;

use zonectl_common::ControllerConfig;

use crate::clock::SystemClock;
use crate::flasher::Flasher;
use crate::hw::SimHardware;
use crate::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config_from_env();
    let tz: Tz = config
        .timezone
        .parse()
        .map_err(|err| anyhow!("invalid timezone {}: {err}", config.timezone))?;

    info!(mac = %config.mac, timezone = %config.timezone, "zone controller starting");

    let hw = Arc::new(SimHardware::new());
    let flasher = Flasher::spawn(hw.clone(), config.status_led_pin);
    flasher.set_pattern(500, 500);

    // Wi-Fi association and time sync belong to the platform; the credentials
    // only pass through here.
    if !config.network.wifi_ssid.is_empty() {
        info!(
            ssid = %config.network.wifi_ssid,
            retries = config.network.wifi_max_retries,
            "network association delegated to the platform"
        );
    }

    let mut options = MqttOptions::new(
        config.client_id(),
        config.network.mqtt_host.clone(),
        config.network.mqtt_port,
    );
    if !config.network.mqtt_user.is_empty() {
        options.set_credentials(
            config.network.mqtt_user.clone(),
            config.network.mqtt_pass.clone(),
        );
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    let (commands, command_rx) = transport::command_channel();
    transport::spawn_command_pump(client.clone(), command_rx);

    let mut registry = Registry::new(config, tz, hw, Arc::new(SystemClock), commands);
    let interrupted = tokio::select! {
        result = registry::run(&mut registry, eventloop, &flasher) => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        info!("shutdown requested");
        registry.shutdown().await;
        let _ = client.disconnect().await;
    }

    Ok(())
}

fn config_from_env() -> ControllerConfig {
    let mut config = ControllerConfig::default();

    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT").ok().and_then(|value| value.parse().ok()) {
        config.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        config.network.mqtt_pass = pass;
    }
    if let Ok(mac) = std::env::var("CONTROLLER_MAC") {
        config.mac = mac;
    }
    if let Ok(timezone) = std::env::var("CONTROLLER_TZ") {
        config.timezone = timezone;
    }
    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        config.network.wifi_ssid = ssid;
    }
    if let Ok(pass) = std::env::var("WIFI_PASS") {
        config.network.wifi_pass = pass;
    }
    if let Some(retries) = std::env::var("WIFI_MAX_RETRIES").ok().and_then(|value| value.parse().ok()) {
        config.network.wifi_max_retries = retries;
    }

    config
}
