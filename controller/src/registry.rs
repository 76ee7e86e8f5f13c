use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use rumqttc::{Event, EventLoop, Incoming, QoS};
use serde_json::Value as Json;
use tracing::{info, warn};

use zonectl_common::{
    classify, device_config_filter, split_topic, ControllerConfig, TopicShape,
    DEVICE_EVENT_FILTER, HOME_CONFIG_FILTER, ZONE_CONFIG_FILTER,
};

use crate::clock::Clock;
use crate::flasher::Flasher;
use crate::hw::Hardware;
use crate::transport::{CommandSender, TransportCommand};
use crate::zone::Zone;

/// The set of zones this controller serves, driven by retained zone-config
/// messages: a `controller` field carrying our MAC claims the zone, anything
/// else relinquishes it. All mutation happens on the transport task.
pub struct Registry {
    config: ControllerConfig,
    tz: Tz,
    hw: Arc<dyn Hardware>,
    clock: Arc<dyn Clock>,
    commands: CommandSender,
    zones: HashMap<(String, String), Arc<Zone>>,
    subscriptions: HashSet<String>,
}

impl Registry {
    pub fn new(
        config: ControllerConfig,
        tz: Tz,
        hw: Arc<dyn Hardware>,
        clock: Arc<dyn Clock>,
        commands: CommandSender,
    ) -> Self {
        Self {
            config,
            tz,
            hw,
            clock,
            commands,
            zones: HashMap::new(),
            subscriptions: HashSet::new(),
        }
    }

    /// (Re)establish every subscription; broker session state is gone after
    /// a reconnect while our zone set is not.
    pub fn on_connected(&mut self) {
        info!("broker session established");

        self.subscriptions.insert(HOME_CONFIG_FILTER.to_string());
        self.subscriptions.insert(ZONE_CONFIG_FILTER.to_string());
        self.subscriptions.insert(DEVICE_EVENT_FILTER.to_string());

        let filters: Vec<String> = self.subscriptions.iter().cloned().collect();
        for filter in filters {
            let qos = Self::filter_qos(&filter);
            let _ = self.commands.send(TransportCommand::Subscribe { filter, qos });
        }
    }

    fn filter_qos(filter: &str) -> QoS {
        if filter == DEVICE_EVENT_FILTER {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        }
    }

    pub async fn handle_publish(&mut self, topic: &str, payload: &[u8]) {
        let json: Json = match serde_json::from_slice(payload) {
            Ok(json) => json,
            Err(err) => {
                warn!(topic, "discarding message with malformed JSON: {err}");
                return;
            }
        };

        let parts = split_topic(topic);

        if let TopicShape::ZoneConfig { home, zone } = classify(&parts) {
            let owned = json
                .get("controller")
                .and_then(Json::as_str)
                .map(|mac| self.config.owns_mac(mac))
                .unwrap_or(false);

            if owned {
                self.add_zone(home, zone);
            } else {
                self.remove_zone(home, zone).await;
            }
        }

        // Every message is offered to every owned zone, including a zone the
        // message itself just created.
        let zones: Vec<Arc<Zone>> = self.zones.values().cloned().collect();
        for zone in zones {
            zone.handle_message(&parts, &json).await;
        }
    }

    fn add_zone(&mut self, home: &str, zone: &str) {
        let key = (home.to_string(), zone.to_string());
        if self.zones.contains_key(&key) {
            return;
        }

        info!(home, zone, "zone ownership acquired");
        self.zones.insert(
            key,
            Zone::new(
                home,
                zone,
                self.tz,
                self.hw.clone(),
                self.clock.clone(),
                self.commands.clone(),
            ),
        );

        let filter = device_config_filter(home, zone);
        if self.subscriptions.insert(filter.clone()) {
            let _ = self.commands.send(TransportCommand::Subscribe {
                filter,
                qos: QoS::AtLeastOnce,
            });
        }
    }

    async fn remove_zone(&mut self, home: &str, zone: &str) {
        let key = (home.to_string(), zone.to_string());
        let Some(removed) = self.zones.remove(&key) else {
            return;
        };

        info!(home, zone, "zone ownership released");
        removed.teardown().await;

        let filter = device_config_filter(home, zone);
        if self.subscriptions.remove(&filter) {
            let _ = self.commands.send(TransportCommand::Unsubscribe { filter });
        }
    }

    /// Controller teardown: destroy every zone and its devices.
    pub async fn shutdown(&mut self) {
        let zones: Vec<Arc<Zone>> = self.zones.drain().map(|(_, zone)| zone).collect();
        for zone in zones {
            zone.teardown().await;
        }
        self.subscriptions.clear();
    }
}

/// Transport loop: deliver broker events to the registry, re-subscribe on
/// every session, and back off briefly on poll errors.
pub async fn run(
    registry: &mut Registry,
    mut eventloop: EventLoop,
    flasher: &Flasher,
) -> anyhow::Result<()> {
    flasher.set_pattern(100, 200);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                flasher.set_pattern(1, 0);
                registry.on_connected();
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                registry
                    .handle_publish(&message.topic, &message.payload)
                    .await;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt poll error: {err}");
                flasher.set_pattern(100, 200);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

#[cfg(test)]
impl Registry {
    pub(crate) fn has_zone(&self, home: &str, zone: &str) -> bool {
        self.zones.contains_key(&(home.to_string(), zone.to_string()))
    }

    pub(crate) fn zone(&self, home: &str, zone: &str) -> Option<Arc<Zone>> {
        self.zones.get(&(home.to_string(), zone.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::hw::mock::MockHardware;
    use crate::transport::{command_channel, CommandReceiver};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const OUR_MAC: &str = "AA:BB:CC:DD:EE:FF";

    fn test_registry() -> (Registry, Arc<MockHardware>, CommandReceiver) {
        let hw = Arc::new(MockHardware::new());
        let (commands, rx) = command_channel();
        let clock = Arc::new(FixedClock(Some(
            Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap(),
        )));
        let config = ControllerConfig {
            mac: OUR_MAC.to_string(),
            ..ControllerConfig::default()
        };
        let registry = Registry::new(config, chrono_tz::UTC, hw.clone(), clock, commands);
        (registry, hw, rx)
    }

    fn drain(rx: &mut CommandReceiver) -> Vec<TransportCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    fn subscribe_filters(commands: &[TransportCommand]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|command| match command {
                TransportCommand::Subscribe { filter, .. } => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    async fn publish(registry: &mut Registry, topic: &str, payload: Json) {
        registry
            .handle_publish(topic, payload.to_string().as_bytes())
            .await;
    }

    #[tokio::test]
    async fn ownership_follows_the_controller_field() {
        let (mut registry, _hw, mut rx) = test_registry();

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": OUR_MAC }),
        )
        .await;

        assert!(registry.has_zone("h1", "z1"));
        let filters = subscribe_filters(&drain(&mut rx));
        assert_eq!(filters, vec!["homes/h1/zones/z1/devices/+/config".to_string()]);

        // Another controller takes over: the zone goes away and we unsubscribe.
        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": "11:22:33:44:55:66" }),
        )
        .await;

        assert!(!registry.has_zone("h1", "z1"));
        let commands = drain(&mut rx);
        assert!(commands.iter().any(|command| matches!(
            command,
            TransportCommand::Unsubscribe { filter } if filter == "homes/h1/zones/z1/devices/+/config"
        )));
    }

    #[tokio::test]
    async fn mac_comparison_is_case_insensitive() {
        let (mut registry, _hw, _rx) = test_registry();

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": "aa:bb:cc:dd:ee:ff" }),
        )
        .await;

        assert!(registry.has_zone("h1", "z1"));
    }

    #[tokio::test]
    async fn missing_controller_field_relinquishes_the_zone() {
        let (mut registry, _hw, _rx) = test_registry();

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": OUR_MAC }),
        )
        .await;
        assert!(registry.has_zone("h1", "z1"));

        publish(&mut registry, "homes/h1/zones/z1/config", json!({})).await;
        assert!(!registry.has_zone("h1", "z1"));
    }

    #[tokio::test]
    async fn connect_establishes_the_standing_subscriptions() {
        let (mut registry, _hw, mut rx) = test_registry();

        registry.on_connected();
        let commands = drain(&mut rx);
        let mut filters = subscribe_filters(&commands);
        filters.sort();
        assert_eq!(
            filters,
            vec![
                "homes/+/config".to_string(),
                "homes/+/zones/+/config".to_string(),
                "homes/+/zones/+/devices/+/+".to_string(),
            ]
        );

        // Device events are QoS 0, config channels QoS 1.
        for command in &commands {
            if let TransportCommand::Subscribe { filter, qos } = command {
                let expected = if filter == DEVICE_EVENT_FILTER {
                    QoS::AtMostOnce
                } else {
                    QoS::AtLeastOnce
                };
                assert_eq!(*qos, expected, "unexpected qos for {filter}");
            }
        }
    }

    #[tokio::test]
    async fn reconnect_restores_zone_subscriptions_too() {
        let (mut registry, _hw, mut rx) = test_registry();

        registry.on_connected();
        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": OUR_MAC }),
        )
        .await;
        drain(&mut rx);

        registry.on_connected();
        let filters = subscribe_filters(&drain(&mut rx));
        assert!(filters.contains(&"homes/h1/zones/z1/devices/+/config".to_string()));
        assert_eq!(filters.len(), 4);
    }

    #[tokio::test]
    async fn claiming_config_also_configures_the_new_zone() {
        let (mut registry, _hw, _rx) = test_registry();

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({
                "controller": OUR_MAC,
                "schedules": [{
                    "days": [0, 1, 2, 3, 4, 5, 6],
                    "start": "06:00",
                    "changes": [{
                        "device": "t1",
                        "type": "temperature",
                        "value": { "value": 21.0, "unit": "celsius" }
                    }]
                }]
            }),
        )
        .await;

        let zone = registry.zone("h1", "z1").unwrap();
        assert_eq!(zone.schedule_count().await, 1);
    }

    #[tokio::test]
    async fn messages_are_fanned_out_to_owned_zones() {
        let (mut registry, _hw, _rx) = test_registry();

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": OUR_MAC }),
        )
        .await;
        publish(
            &mut registry,
            "homes/h1/zones/z1/devices/t1/config",
            json!({ "interface": { "type": "dht22", "address": "4", "interval": 0 } }),
        )
        .await;

        let zone = registry.zone("h1", "z1").unwrap();
        assert!(zone.has_device("t1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_ownership_stops_zone_workers() {
        let (mut registry, hw, _rx) = test_registry();

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": OUR_MAC }),
        )
        .await;
        publish(
            &mut registry,
            "homes/h1/zones/z1/devices/t1/config",
            json!({ "interface": { "type": "dht22", "address": "4", "interval": 60000 } }),
        )
        .await;

        let zone = registry.zone("h1", "z1").unwrap();
        for _ in 0..25 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hw.dht_reads(), 1);
        assert!(zone.device_has_worker("t1").await);

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": "11:22:33:44:55:66" }),
        )
        .await;

        assert!(!registry.has_zone("h1", "z1"));
        assert!(!zone.has_device("t1").await);

        let reads = hw.dht_reads();
        tokio::time::advance(Duration::from_secs(300)).await;
        for _ in 0..25 {
            tokio::task::yield_now().await;
        }
        assert_eq!(hw.dht_reads(), reads);
    }

    #[tokio::test]
    async fn malformed_json_is_discarded() {
        let (mut registry, _hw, _rx) = test_registry();
        registry
            .handle_publish("homes/h1/zones/z1/config", b"{not json")
            .await;
        assert!(!registry.has_zone("h1", "z1"));
    }

    #[tokio::test]
    async fn home_level_config_is_reserved_and_ignored() {
        let (mut registry, _hw, mut rx) = test_registry();
        publish(&mut registry, "homes/h1/config", json!({ "name": "home" })).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let (mut registry, _hw, _rx) = test_registry();

        publish(
            &mut registry,
            "homes/h1/zones/z1/config",
            json!({ "controller": OUR_MAC }),
        )
        .await;
        publish(
            &mut registry,
            "homes/h1/zones/z2/config",
            json!({ "controller": OUR_MAC }),
        )
        .await;

        registry.shutdown().await;
        assert!(!registry.has_zone("h1", "z1"));
        assert!(!registry.has_zone("h1", "z2"));
    }
}
