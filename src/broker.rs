//! MQTT broker connections
//!
//! Two flavors wrap the same client primitive: a subscriber that feeds the
//! pipeline's bounded queue and a publisher that forwards validated
//! messages. Each owns a driver task polling its event loop; transport
//! failures move the connection to `Reconnecting` and retry with
//! exponential backoff and full jitter (base 1 s, cap 60 s, reset after
//! 60 s of stable connection). The subscriber re-issues its subscriptions
//! on every CONNACK.

use crate::config::{BrokerConfig, TransportKind};
use crate::error::PublishError;
use crate::metrics::{BrokerRole, MetricsRegistry};
use crate::pipeline::Message;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const STABLE_RESET: Duration = Duration::from_secs(60);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// Forwarding seam between the pipeline and the publisher connection.
#[async_trait]
pub trait MessageForwarder: Send + Sync {
    async fn forward(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), PublishError>;
}

/// One MQTT connection with its driver task.
pub struct BrokerClient {
    client: AsyncClient,
    role: BrokerRole,
    state: Arc<RwLock<ConnectionState>>,
    subscriptions: Arc<RwLock<Vec<String>>>,
}

impl BrokerClient {
    /// Subscriber connection: incoming publishes are pushed into `intake`
    /// with a bounded wait; messages that cannot be enqueued within
    /// `enqueue_timeout` are dropped and counted (QoS>0 redelivery is left
    /// to the broker on reconnect).
    pub fn subscriber(
        config: &BrokerConfig,
        client_id: &str,
        max_message_size: usize,
        filters: Vec<String>,
        intake: mpsc::Sender<Message>,
        enqueue_timeout: Duration,
        metrics: MetricsRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, std::io::Error> {
        let options = build_options(config, client_id, max_message_size)?;
        let (client, eventloop) = AsyncClient::new(options, 64);

        let broker = Self {
            client: client.clone(),
            role: BrokerRole::Subscriber,
            state: Arc::new(RwLock::new(ConnectionState::Connecting)),
            subscriptions: Arc::new(RwLock::new(filters)),
        };

        let driver = Driver {
            client,
            role: BrokerRole::Subscriber,
            state: broker.state.clone(),
            subscriptions: broker.subscriptions.clone(),
            intake: Some(intake),
            enqueue_timeout,
            metrics,
            shutdown,
        };
        tokio::spawn(driver.run(eventloop));
        Ok(broker)
    }

    /// Publisher connection: no subscriptions, just a driven event loop and
    /// a bounded outgoing queue.
    pub fn publisher(
        config: &BrokerConfig,
        client_id: &str,
        max_message_size: usize,
        metrics: MetricsRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, std::io::Error> {
        let options = build_options(config, client_id, max_message_size)?;
        let (client, eventloop) = AsyncClient::new(options, 64);

        let broker = Self {
            client: client.clone(),
            role: BrokerRole::Publisher,
            state: Arc::new(RwLock::new(ConnectionState::Connecting)),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
        };

        let driver = Driver {
            client,
            role: BrokerRole::Publisher,
            state: broker.state.clone(),
            subscriptions: broker.subscriptions.clone(),
            intake: None,
            enqueue_timeout: Duration::ZERO,
            metrics,
            shutdown,
        };
        tokio::spawn(driver.run(eventloop));
        Ok(broker)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Replace the subscription set (hot reload). New filters are issued
    /// immediately; the full set is re-issued on the next CONNACK.
    pub fn set_subscriptions(&self, filters: Vec<String>) {
        for filter in &filters {
            if let Err(e) = self.client.try_subscribe(filter, QoS::AtLeastOnce) {
                warn!(filter = %filter, error = %e, "subscribe request not queued");
            }
        }
        *self.subscriptions.write() = filters;
    }

    /// Fire-and-wait publish for the replay path.
    pub async fn publish_blocking(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    ) -> Result<(), PublishError> {
        self.client
            .publish(topic, to_qos(qos), retain, payload)
            .await
            .map_err(|e| PublishError::Client(e.to_string()))
    }

    /// Request a clean disconnect.
    pub async fn stop(&self) {
        *self.state.write() = ConnectionState::Disconnecting;
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl MessageForwarder for BrokerClient {
    /// Non-blocking publish. Saturation of the outgoing queue surfaces
    /// immediately as a transient error, distinct from validation
    /// rejection.
    async fn forward(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client
            .try_publish(topic, to_qos(qos), retain, payload.to_vec())
            .map_err(|_| PublishError::QueueFull)
    }
}

struct Driver {
    client: AsyncClient,
    role: BrokerRole,
    state: Arc<RwLock<ConnectionState>>,
    subscriptions: Arc<RwLock<Vec<String>>>,
    intake: Option<mpsc::Sender<Message>>,
    enqueue_timeout: Duration,
    metrics: MetricsRegistry,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self, mut eventloop: EventLoop) {
        let mut backoff = Backoff::new();
        let mut connected_since: Option<Instant> = None;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(role = self.role.as_str(), "broker connected");
                    *self.state.write() = ConnectionState::Connected;
                    self.metrics.set_broker_connected(self.role, true);
                    connected_since = Some(Instant::now());
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(intake) = &self.intake {
                        self.enqueue(intake, publish).await;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    debug!(role = self.role.as_str(), "broker sent DISCONNECT");
                }
                Ok(_) => {}
                Err(e) => {
                    if *self.shutdown.borrow() {
                        break;
                    }

                    {
                        let mut state = self.state.write();
                        if *state == ConnectionState::Connected {
                            *state = ConnectionState::Reconnecting;
                        }
                    }
                    self.metrics.set_broker_connected(self.role, false);

                    // A long stable connection resets the backoff window
                    if connected_since
                        .take()
                        .is_some_and(|t| t.elapsed() >= STABLE_RESET)
                    {
                        backoff.reset();
                    }

                    self.metrics.broker_reconnect(self.role);
                    let delay = backoff.next_delay();
                    warn!(
                        role = self.role.as_str(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "broker connection lost, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }

        *self.state.write() = ConnectionState::Disconnected;
        self.metrics.set_broker_connected(self.role, false);
        debug!(role = self.role.as_str(), "broker driver stopped");
    }

    fn resubscribe(&self) {
        let filters = self.subscriptions.read().clone();
        for filter in filters {
            if let Err(e) = self.client.try_subscribe(&filter, QoS::AtLeastOnce) {
                warn!(filter = %filter, error = %e, "resubscribe request not queued");
            } else {
                debug!(filter = %filter, "subscribed");
            }
        }
    }

    async fn enqueue(&self, intake: &mpsc::Sender<Message>, publish: rumqttc::Publish) {
        let message = Message {
            topic: publish.topic.clone(),
            payload: Bytes::from(publish.payload.to_vec()),
            qos: from_qos(publish.qos),
            retain: publish.retain,
            client_id: String::new(),
            received_at: Utc::now(),
            enqueued_at: Instant::now(),
        };

        match intake.send_timeout(message, self.enqueue_timeout).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(m)) => {
                // QoS>0 messages come back on reconnect per MQTT semantics
                self.metrics.dropped_backpressure();
                warn!(topic = %m.topic, "work queue full, message dropped");
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!("pipeline intake closed");
            }
        }
    }
}

struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Full jitter: uniform in [0, min(cap, base * 2^attempt)].
    fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(BACKOFF_CAP);
        self.attempt = self.attempt.saturating_add(1);

        let max_ms = exp.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

fn build_options(
    config: &BrokerConfig,
    client_id: &str,
    max_message_size: usize,
) -> Result<MqttOptions, std::io::Error> {
    let mut options = match config.transport {
        TransportKind::Websocket => {
            let ws = config.websocket.clone().unwrap_or_default();
            let scheme = if ws.secure { "wss" } else { "ws" };
            let url = format!("{scheme}://{}:{}{}", config.host, config.port, ws.path);
            MqttOptions::new(client_id, url, config.port)
        }
        _ => MqttOptions::new(client_id, &config.host, config.port),
    };

    options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
    options.set_clean_session(config.clean_session);
    // Leave room past the size limit so oversize payloads reach the
    // pipeline and quarantine as PayloadTooLarge instead of vanishing at
    // the codec.
    options.set_max_packet_size(max_message_size * 2 + 4096, max_message_size * 2 + 4096);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    let needs_tls = config.transport == TransportKind::Tls
        || (config.transport == TransportKind::Websocket
            && config.websocket.as_ref().is_some_and(|w| w.secure));

    if needs_tls {
        let tls = config.tls.clone().unwrap_or_default();
        let ca = match &tls.ca_file {
            Some(path) => std::fs::read(path)?,
            None => Vec::new(),
        };
        let client_auth = match (&tls.cert_file, &tls.key_file) {
            (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
            _ => None,
        };
        let tls_config = TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        };
        match config.transport {
            TransportKind::Websocket => options.set_transport(Transport::Wss(tls_config)),
            _ => options.set_transport(Transport::Tls(tls_config)),
        };
    } else if config.transport == TransportKind::Websocket {
        options.set_transport(Transport::Ws);
    }

    Ok(options)
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn from_qos(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(from_qos(to_qos(0)), 0);
        assert_eq!(from_qos(to_qos(1)), 1);
        assert_eq!(from_qos(to_qos(2)), 2);
        // Out-of-range input degrades to at-least-once
        assert_eq!(from_qos(to_qos(7)), 1);
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let mut backoff = Backoff::new();
        let mut max_seen = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= BACKOFF_CAP);
            max_seen = max_seen.max(delay);
        }
        // With full jitter each delay is random, but the envelope is capped
        assert!(max_seen <= BACKOFF_CAP);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        for _ in 0..8 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt, 0);
        // First post-reset delay is drawn from the base window
        assert!(backoff.next_delay() <= BACKOFF_BASE);
    }

    #[test]
    fn test_build_options_tcp() {
        let config = BrokerConfig::default();
        let options = build_options(&config, "proxy-subscriber", 1024 * 1024).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }
}
