use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use uuid::Uuid;

use crate::classifier::{self, PayloadKind};
use crate::db::DatabaseService;
use crate::models::{now_timestamp, BrokerTarget};
use crate::registry::DeviceRegistry;
use crate::router;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("'{0}' is not a valid port number")]
    InvalidPort(String),
    #[error("failed to connect to MQTT broker: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("broker request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("not connected to an MQTT broker")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Lifecycle notifications, delivered at least once per state transition.
/// A remote disconnect and an explicit teardown emit the same event.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { broker: String },
    Disconnected { broker: String },
}

/// The active subscription set. Set semantics: re-subscribing to an active
/// topic and unsubscribing from an inactive one are no-ops.
#[derive(Debug, Default)]
struct SubscriptionSet {
    active: HashSet<String>,
}

impl SubscriptionSet {
    /// Returns false when the topic was already active.
    fn activate(&mut self, topic: &str) -> bool {
        self.active.insert(topic.to_string())
    }

    /// Returns false when the topic was not active.
    fn deactivate(&mut self, topic: &str) -> bool {
        self.active.remove(topic)
    }

    fn clear(&mut self) {
        self.active.clear();
    }

    fn len(&self) -> usize {
        self.active.len()
    }
}

/// One broker session: owns the connection lifecycle, the subscription set
/// and the inbound delivery path from broker to store.
pub struct MqttService {
    state: Mutex<SessionState>,
    client: Mutex<Option<AsyncClient>>,
    subscriptions: Mutex<SubscriptionSet>,
    broker_name: Mutex<String>,
    events: broadcast::Sender<SessionEvent>,
    registry: Arc<DeviceRegistry>,
    db: Arc<DatabaseService>,
    unmatched: AtomicU64,
    /// Bumped on every connect; a delivery loop from an older connection
    /// carries a stale generation and must not tear the current session down.
    generation: AtomicU64,
}

impl MqttService {
    pub fn new(registry: Arc<DeviceRegistry>, db: Arc<DatabaseService>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Mutex::new(SessionState::Disconnected),
            client: Mutex::new(None),
            subscriptions: Mutex::new(SubscriptionSet::default()),
            broker_name: Mutex::new(String::new()),
            events,
            registry,
            db,
            unmatched: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// Register for connect/disconnect notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Messages dropped because no registered device matched either key.
    pub fn unmatched_count(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    fn validate_port(port: &str) -> Result<u16, SessionError> {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(SessionError::InvalidPort(port.to_string())),
        }
    }

    /// Connects to the target broker. The handshake result is reported
    /// synchronously; failures are never retried here.
    pub async fn connect(self: &Arc<Self>, target: &BrokerTarget) -> Result<(), SessionError> {
        let port = Self::validate_port(&target.port)?;

        if self.state().await != SessionState::Disconnected {
            self.disconnect().await;
        }

        let generation = {
            let mut state = self.state.lock().await;
            *state = SessionState::Connecting;
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let client_id = if target.client_id.is_empty() {
            format!("fleetflux_{}", Uuid::new_v4())
        } else {
            target.client_id.clone()
        };

        debug!("Configuring MQTT broker at {}:{}...", target.host, port);
        let mut mqtt_options = MqttOptions::new(client_id, &target.host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(10));
        mqtt_options.set_clean_session(true);
        if !target.username.is_empty() {
            mqtt_options.set_credentials(&target.username, &target.password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

        // Drive the event loop until the broker acknowledges the session.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(event) => {
                    debug!("Pre-connect event: {:?}", event);
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    *state = SessionState::Disconnected;
                    return Err(SessionError::Connection(e));
                }
            }
        }

        {
            let mut client_lock = self.client.lock().await;
            *client_lock = Some(client);
        }
        {
            let mut state = self.state.lock().await;
            *state = SessionState::Connected;
        }
        {
            let mut broker_name = self.broker_name.lock().await;
            *broker_name = target.name.clone();
        }

        info!("Connected to MQTT broker '{}' ({}:{}).", target.name, target.host, port);
        let _ = self.events.send(SessionEvent::Connected {
            broker: target.name.clone(),
        });

        let session = self.clone();
        tokio::spawn(async move {
            session.run_delivery(eventloop, generation).await;
        });

        Ok(())
    }

    /// Inbound delivery loop for one connection. Runs until the transport
    /// drops, either remotely or through `disconnect()`. The loop is not
    /// restarted; reconnect policy belongs to the caller.
    async fn run_delivery(self: Arc<Self>, mut eventloop: EventLoop, generation: u64) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Handled in line so per-topic delivery order is kept;
                    // only the slow image decode leaves this path.
                    self.handle_publish(&publish.topic, &publish.payload).await;
                }
                Ok(event) => {
                    debug!("Unhandled event: {:?}", event);
                }
                Err(e) => {
                    if self.state().await == SessionState::Connected {
                        error!("Error in MQTT event loop: {:?}", e);
                    }
                    break;
                }
            }
        }
        self.finish_disconnect(generation).await;
    }

    /// Explicit teardown. Ends `Disconnected` and emits the event whether or
    /// not the remote end also closes cleanly.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnecting;
        }

        let client = self.client.lock().await.clone();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        self.finish_disconnect(generation).await;
    }

    /// Idempotent landing point for both explicit and remote disconnects.
    /// A stale generation means a newer connection owns the session state.
    async fn finish_disconnect(&self, generation: u64) {
        {
            let mut state = self.state.lock().await;
            if generation != self.generation.load(Ordering::SeqCst) {
                return;
            }
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }

        self.client.lock().await.take();
        self.subscriptions.lock().await.clear();

        let broker = self.broker_name.lock().await.clone();
        info!("Disconnected from MQTT broker '{}'.", broker);
        let _ = self.events.send(SessionEvent::Disconnected { broker });
    }

    async fn connected_client(&self) -> Result<AsyncClient, SessionError> {
        if *self.state.lock().await != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.client
            .lock()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), SessionError> {
        let client = self.connected_client().await?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await?;
        info!("Message published to '{}'.", topic);
        Ok(())
    }

    /// Subscribes to a topic. Returns false when the topic was already in
    /// the active set and nothing was sent to the broker.
    pub async fn subscribe(&self, topic: &str) -> Result<bool, SessionError> {
        let client = self.connected_client().await?;

        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.activate(topic) {
            debug!("Already subscribed to '{}'.", topic);
            return Ok(false);
        }

        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            subscriptions.deactivate(topic);
            return Err(e.into());
        }
        info!("Subscribed to topic '{}'.", topic);
        Ok(true)
    }

    /// Unsubscribes from a topic. A no-op returning false when the topic was
    /// not active.
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool, SessionError> {
        let client = self.connected_client().await?;

        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.deactivate(topic) {
            return Ok(false);
        }

        client.unsubscribe(topic).await?;
        info!("Unsubscribed from topic '{}'.", topic);
        Ok(true)
    }

    pub async fn active_subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// One inbound message: classify, parse, route, persist. Oversized
    /// payloads are treated as hex-encoded images; their decode runs on its
    /// own task so it never stalls later deliveries, while the hex rendition
    /// still flows through routing like any other payload.
    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let text = match classifier::classify(payload) {
            PayloadKind::Binary => {
                let hex_payload = hex::encode(payload);
                let decode_input = hex_payload.clone();
                let decode_topic = topic.to_string();
                tokio::spawn(async move {
                    match classifier::decode_image(&decode_input) {
                        Ok(decoded) => info!(
                            "Decoded image on '{}': {}x{} (display {}x{}).",
                            decode_topic,
                            decoded.width,
                            decoded.height,
                            decoded.display_width,
                            decoded.display_height
                        ),
                        Err(e) => warn!(
                            "Dropping undecodable image payload on '{}': {}",
                            decode_topic, e
                        ),
                    }
                });
                hex_payload
            }
            PayloadKind::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping message on '{}': payload is not valid UTF-8: {}", topic, e);
                    return;
                }
            },
        };

        let parsed = match classifier::parse_text(text.as_bytes()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping message on '{}': {}", topic, e);
                return;
            }
        };
        if parsed.malformed > 0 {
            debug!(
                "Skipped {} malformed line(s) in message on '{}'.",
                parsed.malformed, topic
            );
        }

        let received_at = now_timestamp();
        let outcome = router::route(
            &self.registry,
            &parsed.imei,
            topic,
            &parsed.lines,
            &text,
            &received_at,
        );

        if outcome.is_empty() {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped unmatched message on '{}'.", topic);
            return;
        }

        if let Err(e) = self
            .db
            .insert_batch(&outcome.telemetry, &outcome.commands)
        {
            error!("Failed to persist message batch from '{}': {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{QueryField, RecordTable};
    use crate::models::Device;

    fn service_with_device(imei: &str, read_topic: &str) -> Arc<MqttService> {
        let db = Arc::new(DatabaseService::new(":memory:").unwrap());
        db.initialize_db().unwrap();
        let registry = Arc::new(DeviceRegistry::new(db.clone()));
        registry
            .register(Device {
                imei: imei.to_string(),
                read_topic: read_topic.to_string(),
                comment: String::new(),
                registered_at: "2024-01-01 00:00:00".to_string(),
            })
            .unwrap();
        MqttService::new(registry, db)
    }

    fn target(port: &str) -> BrokerTarget {
        BrokerTarget {
            name: "test".to_string(),
            host: "localhost".to_string(),
            port: port.to_string(),
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
        }
    }

    #[test]
    fn subscription_set_is_idempotent() {
        let mut set = SubscriptionSet::default();
        assert!(set.activate("a/b"));
        assert!(!set.activate("a/b"));
        assert_eq!(set.len(), 1);

        assert!(set.deactivate("a/b"));
        assert!(!set.deactivate("a/b"));
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn connect_rejects_invalid_port() {
        let service = service_with_device("123", "cmd/123");
        for port in ["", "abc", "0", "70000", "-1"] {
            match service.connect(&target(port)).await {
                Err(SessionError::InvalidPort(p)) => assert_eq!(p, port),
                other => panic!("expected InvalidPort for {:?}, got {:?}", port, other.err()),
            }
        }
        assert_eq!(service.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn stale_delivery_loop_cannot_tear_down_a_newer_session() {
        let service = service_with_device("123", "cmd/123");

        // A reconnect bumped the generation to 2 while a delivery loop from
        // generation 1 was still draining its event loop.
        {
            *service.state.lock().await = SessionState::Connected;
        }
        service.subscriptions.lock().await.activate("cmd/123");
        service.generation.store(2, Ordering::SeqCst);

        service.finish_disconnect(1).await;
        assert_eq!(service.state().await, SessionState::Connected);
        assert_eq!(service.active_subscription_count().await, 1);

        // The current generation still tears down normally.
        service.finish_disconnect(2).await;
        assert_eq!(service.state().await, SessionState::Disconnected);
        assert_eq!(service.active_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn publish_and_subscribe_require_a_connection() {
        let service = service_with_device("123", "cmd/123");
        assert!(matches!(
            service.publish("t", b"x", false).await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            service.subscribe("t").await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            service.unsubscribe("t").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn delivery_persists_both_record_classes() {
        let service = service_with_device("123", "cmd/123");
        service
            .handle_publish("cmd/123", b"123\n2024-01-01T00:00:00,+40.7,-74.0")
            .await;

        let data = service
            .db
            .query(RecordTable::Data, QueryField::Imei, "123")
            .unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].message, "2024-01-01T00:00:00,+40.7,-74.0");
        assert_eq!(data[0].topic, "cmd/123");

        let commands = service.db.commands_for_imei("123").unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].message, "123\n2024-01-01T00:00:00,+40.7,-74.0");
    }

    #[tokio::test]
    async fn unmatched_delivery_is_counted_and_dropped() {
        let service = service_with_device("123", "cmd/123");
        service
            .handle_publish("noise/topic", b"999\n2024-01-01T00:00:00,+1.0,-1.0")
            .await;

        assert_eq!(service.unmatched_count(), 1);
        let data = service
            .db
            .query(RecordTable::Data, QueryField::Topic, "noise/topic")
            .unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_delivery_is_dropped() {
        let service = service_with_device("123", "cmd/123");
        service.handle_publish("cmd/123", &[0xff, 0xfe, 0x01]).await;
        assert!(service.db.commands_for_imei("123").unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_routes_as_hex_command() {
        let service = service_with_device("123", "cmd/123");
        let payload = vec![0xab; 2500];
        service.handle_publish("cmd/123", &payload).await;

        let commands = service.db.commands_for_imei("123").unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].message, hex::encode(&payload));
    }
}
