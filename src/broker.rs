//! ==============================================================================
//! broker.rs - mqtt bridge
//! ==============================================================================
//!
//! purpose:
//!     the only component that talks to the broker.
//!     - inbound: sensor telemetry on `broker.sensor_topic` (json object)
//!     - outbound: motor commands on `broker.command_topic` (plain string)
//!
//! relationships:
//!     - feeds: hub.rs (via TelemetryIngest)
//!     - beats: heartbeat.rs (every accepted reading)
//!     - offers readings to: notify.rs (alert rule)
//!     - implements: command.rs CommandPublisher
//!
//! failure model:
//!     rumqttc reconnects on the next poll after an error, we only log and
//!     back off. the subscription is re-issued on every ConnAck because a
//!     clean session forgets it. messages missed while disconnected are gone.
//!
//! ==============================================================================

use crate::command::CommandPublisher;
use crate::config::BrokerConfig;
use crate::domain::{MotorCommand, SensorReading};
use crate::heartbeat::Heartbeat;
use crate::hub::Hub;
use crate::notify::Notifier;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub struct MqttBridge {
    client: AsyncClient,
    sensor_topic: String,
    reconnect_delay: Duration,
}

impl MqttBridge {
    /// build the client; nothing touches the network until the event loop is polled
    pub fn connect(config: &BrokerConfig) -> (Self, EventLoop) {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("plant-relay-{}", Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
        (Self::with_client(client, config), eventloop)
    }

    fn with_client(client: AsyncClient, config: &BrokerConfig) -> Self {
        Self {
            client,
            sensor_topic: config.sensor_topic.clone(),
            reconnect_delay: config.reconnect_delay(),
        }
    }

    /// drive the event loop until shutdown flips to true
    pub async fn run(&self, mut eventloop: EventLoop, ingest: TelemetryIngest, mut shutdown: watch::Receiver<bool>) {
        // set on ConnAck, cleared once the subscribe request is queued
        let mut resubscribe_pending = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("[BROKER] shutdown signal received");
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("[BROKER] connected, subscribing to {}", self.sensor_topic);
                        resubscribe_pending = true;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        ingest.ingest(&publish.topic, &publish.payload);
                    }
                    Ok(other) => tracing::trace!("[BROKER] {:?}", other),
                    Err(e) => {
                        tracing::warn!("[BROKER] connection error: {} (retrying in {:?})", e, self.reconnect_delay);
                        resubscribe_pending = false;
                        tokio::select! {
                            _ = shutdown.changed() => {
                                tracing::info!("[BROKER] shutdown signal received");
                                break;
                            }
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }

            if resubscribe_pending && self.resubscribe() {
                resubscribe_pending = false;
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("[BROKER] disconnect: {}", e);
        }
    }

    /// queue the sensor subscription without waiting for channel space
    /// this task is the only one draining the request channel, so a full
    /// channel is retried after the next poll instead of awaited
    fn resubscribe(&self) -> bool {
        match self.client.try_subscribe(self.sensor_topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("[BROKER] subscribe to {} deferred: {}", self.sensor_topic, e);
                false
            }
        }
    }
}

#[async_trait]
impl CommandPublisher for MqttBridge {
    async fn publish_command(&self, topic: &str, command: MotorCommand) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, command.as_str().as_bytes())
            .await
            .with_context(|| format!("publish {} to {}", command, topic))
    }
}

// ==============================================================================
// ingest - what happens to one inbound message
// ==============================================================================

pub struct TelemetryIngest {
    hub: Hub,
    heartbeat: Arc<Heartbeat>,
    notifier: Option<Arc<Notifier>>,
    sensor_filter: String,
    show_data: bool,
}

impl TelemetryIngest {
    pub fn new(
        hub: Hub,
        heartbeat: Arc<Heartbeat>,
        notifier: Option<Arc<Notifier>>,
        sensor_filter: impl Into<String>,
        show_data: bool,
    ) -> Self {
        Self { hub, heartbeat, notifier, sensor_filter: sensor_filter.into(), show_data }
    }

    /// decode, cache and broadcast, then offer to the notifier
    /// returns false when the message was dropped
    pub fn ingest(&self, topic: &str, payload: &[u8]) -> bool {
        if !topic_matches(&self.sensor_filter, topic) {
            tracing::debug!("[BROKER] ignoring message on {}", topic);
            return false;
        }

        let reading = match SensorReading::from_payload(payload) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(
                    "[BROKER] dropping malformed payload on {} ({} bytes): {:#}",
                    topic,
                    payload.len(),
                    e
                );
                return false;
            }
        };

        self.heartbeat.beat();
        if self.show_data {
            tracing::info!("[SENSOR] {}: {}", topic, serde_json::to_string(&reading).unwrap_or_default());
        } else {
            tracing::debug!("[SENSOR] {} fields on {}", reading.len(), topic);
        }

        self.hub.publish_reading(reading.clone());
        if let Some(notifier) = &self.notifier {
            notifier.observe(&reading);
        }
        true
    }
}

/// mqtt topic filter match (`+` one level, `#` the rest)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            exact => {
                if topic_levels.next() != Some(exact) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServerEvent;
    use crate::config::NotificationsConfig;
    use crate::store::MemoryStore;
    use rumqttc::Request;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    /// bridge whose request channel the test holds the other end of
    fn bridge_with_queue(capacity: usize) -> (MqttBridge, flume::Receiver<Request>) {
        let (tx, rx) = flume::bounded(capacity);
        let bridge = MqttBridge::with_client(AsyncClient::from_senders(tx), &BrokerConfig::default());
        (bridge, rx)
    }

    fn ingest_with(filter: &str) -> (Hub, Arc<Heartbeat>, TelemetryIngest) {
        let hub = Hub::new(Arc::new(MemoryStore::new()), 16);
        let heartbeat = Arc::new(Heartbeat::spawn(Duration::from_secs(10)));
        let ingest = TelemetryIngest::new(hub.clone(), heartbeat.clone(), None, filter, false);
        (hub, heartbeat, ingest)
    }

    #[tokio::test]
    async fn valid_payload_reaches_clients_exactly() {
        let (hub, heartbeat, ingest) = ingest_with("plant/sensors");
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        let payload = br#"{"plant_status":"RUNNING","motor1_status":"ON"}"#;
        assert!(ingest.ingest("plant/sensors", payload));

        let expected = json!({"plant_status": "RUNNING", "motor1_status": "ON"});
        for sub in [&mut a, &mut b] {
            match sub.events.recv().await.unwrap() {
                ServerEvent::SensorData(reading) => assert_eq!(serde_json::to_value(reading).unwrap(), expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(heartbeat.last_beat_ms().is_some());
    }

    #[tokio::test]
    async fn malformed_payload_is_invisible() {
        let (hub, heartbeat, ingest) = ingest_with("plant/sensors");
        ingest.ingest("plant/sensors", br#"{"seq":1}"#);
        let mut client = hub.subscribe();

        assert!(!ingest.ingest("plant/sensors", b"<html>oops</html>"));
        assert!(!ingest.ingest("plant/sensors", b"\xff\xfe"));
        assert!(!ingest.ingest("plant/sensors", b"17"));

        assert!(matches!(client.events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(serde_json::to_value(hub.latest()).unwrap(), json!({"seq": 1}));
        assert!(heartbeat.last_beat_ms().is_some());
    }

    #[tokio::test]
    async fn bad_payload_does_not_beat() {
        let (_, heartbeat, ingest) = ingest_with("plant/sensors");
        ingest.ingest("plant/sensors", b"garbage");
        assert!(heartbeat.last_beat_ms().is_none());
    }

    #[tokio::test]
    async fn foreign_topics_are_ignored() {
        let (hub, _, ingest) = ingest_with("plants/+/sensors");
        assert!(ingest.ingest("plants/north/sensors", br#"{"a":1}"#));
        assert!(!ingest.ingest("plants/north/motor", br#"{"a":2}"#));
        assert_eq!(serde_json::to_value(hub.latest()).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn topic_filter_matching() {
        assert!(topic_matches("plant/sensors", "plant/sensors"));
        assert!(!topic_matches("plant/sensors", "plant/sensors/extra"));
        assert!(!topic_matches("plant/sensors", "plant"));
        assert!(topic_matches("plants/+/sensors", "plants/a1/sensors"));
        assert!(!topic_matches("plants/+/sensors", "plants/sensors"));
        assert!(topic_matches("plants/#", "plants/a1/sensors/raw"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[tokio::test]
    async fn command_goes_out_as_plain_qos0_publish() {
        let (bridge, requests) = bridge_with_queue(4);
        bridge.publish_command("plant/motor", MotorCommand::Off).await.unwrap();

        match requests.try_recv().unwrap() {
            Request::Publish(publish) => {
                assert_eq!(publish.topic, "plant/motor");
                assert_eq!(publish.qos, QoS::AtMostOnce);
                assert!(!publish.retain);
                assert_eq!(&publish.payload[..], b"OFF");
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_publish_is_reported_once() {
        let (bridge, requests) = bridge_with_queue(4);
        drop(requests);
        assert!(bridge.publish_command("plant/motor", MotorCommand::On).await.is_err());
    }

    #[test]
    fn resubscribe_waits_for_room_in_a_full_queue() {
        let (bridge, requests) = bridge_with_queue(2);
        for _ in 0..2 {
            bridge.client.try_publish("plant/motor", QoS::AtMostOnce, false, "ON").unwrap();
        }
        assert!(!bridge.resubscribe());

        // the event loop drains the queued commands
        assert!(matches!(requests.try_recv(), Ok(Request::Publish(_))));
        assert!(matches!(requests.try_recv(), Ok(Request::Publish(_))));

        assert!(bridge.resubscribe());
        match requests.try_recv().unwrap() {
            Request::Subscribe(subscribe) => {
                assert_eq!(subscribe.filters.len(), 1);
                assert_eq!(subscribe.filters[0].path, "plant/sensors");
                assert_eq!(subscribe.filters[0].qos, QoS::AtMostOnce);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_during_backoff() {
        // nothing listens on port 1, so every poll fails and the loop backs off
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            reconnect_delay_seconds: 3600,
            ..BrokerConfig::default()
        };
        let (bridge, eventloop) = MqttBridge::connect(&config);
        let (_, _, ingest) = ingest_with("plant/sensors");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move { bridge.run(eventloop, ingest, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn reading_is_broadcast_with_notifier_attached() {
        let hub = Hub::new(Arc::new(MemoryStore::new()), 16);
        let heartbeat = Arc::new(Heartbeat::spawn(Duration::from_secs(10)));
        let notifier = Arc::new(
            Notifier::new(NotificationsConfig::default(), Arc::new(MemoryStore::new())).unwrap(),
        );
        let ingest = TelemetryIngest::new(hub.clone(), heartbeat, Some(notifier), "plant/sensors", false);
        let mut client = hub.subscribe();

        assert!(ingest.ingest("plant/sensors", br#"{"plant_status":"FAULT"}"#));
        assert!(matches!(client.events.try_recv(), Ok(ServerEvent::SensorData(_))));
        assert_eq!(serde_json::to_value(hub.latest()).unwrap(), json!({"plant_status": "FAULT"}));
    }
}
