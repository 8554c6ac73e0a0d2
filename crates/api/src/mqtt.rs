//! Broker connection layer and the passive push backend.
//!
//! The connection owns a rumqttc client plus its event-loop task and exposes
//! wait-able `connected`/`subscribed` signals. An idle supervisor watches the
//! last-message timestamp and reconnects with capped exponential backoff when
//! the channel goes quiet.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ecoflow_core::config::MqttConfig;
use ecoflow_core::{DeviceCatalog, DeviceInfo, QuotaMap};
use ecoflow_metrics::Analytics;

use crate::auth::{CredentialBroker, MqttCredentials};
use crate::backend::Backend;
use crate::cache::QuotaCache;
use crate::error::ApiError;
use crate::proto;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 64;

const CLIENT_TYPE: &str = "mqtt";

/// Topic a device publishes its property updates on.
pub(crate) fn data_topic(sn: &str) -> String {
    format!("/app/device/property/{}", sn)
}

// ── Signal ───────────────────────────────────────────────────────────

/// A clearable boolean event that tasks can await with a timeout.
#[derive(Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is set, up to `timeout`. Returns whether it was
    /// set in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async move {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

// ── Reconnect backoff ────────────────────────────────────────────────

/// Exponential reconnect backoff: doubles on failure, capped, reset on
/// success.
#[derive(Debug)]
pub(crate) struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, delay: base }
    }

    pub fn reset(&mut self) {
        self.delay = self.base;
    }

    /// Double the delay (capped) and return the new value.
    pub fn advance(&mut self) -> Duration {
        self.delay = std::cmp::min(self.delay * 2, self.max);
        self.delay
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// Consumer of raw broker messages; implementations route payloads into the
/// quota cache. Invoked from the event-loop task.
pub(crate) trait MessageSink: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// One logical broker session: client, event-loop task, and the signals the
/// supervisor waits on. Reconnecting rebuilds the client in place.
pub(crate) struct MqttConnection {
    credentials: MqttCredentials,
    keepalive: Duration,
    topics: Vec<String>,
    sink: Arc<dyn MessageSink>,
    pub connected: Signal,
    pub subscribed: Signal,
    last_message: Mutex<Option<Instant>>,
    client: Mutex<Option<AsyncClient>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    pub fn new(
        credentials: MqttCredentials,
        keepalive: Duration,
        topics: Vec<String>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            credentials,
            keepalive,
            topics,
            sink,
            connected: Signal::new(),
            subscribed: Signal::new(),
            last_message: Mutex::new(None),
            client: Mutex::new(None),
            event_task: Mutex::new(None),
        }
    }

    /// Build a fresh client session and start its event loop. Any previous
    /// session is torn down first.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ApiError> {
        self.connected.clear();
        self.subscribed.clear();

        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
        let previous = self.client.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.disconnect().await.ok();
        }

        let mut options = MqttOptions::new(
            self.credentials.client_id.clone(),
            self.credentials.host.clone(),
            self.credentials.port,
        );
        options.set_credentials(
            self.credentials.username.clone(),
            self.credentials.password.clone(),
        );
        options.set_keep_alive(self.keepalive);
        options.set_transport(Transport::tls_with_default_config());

        info!(
            "Connecting to MQTT broker {}:{}",
            self.credentials.host, self.credentials.port
        );
        let (client, event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        *self.client.lock().unwrap() = Some(client.clone());

        let connection = self.clone();
        let task = tokio::spawn(async move { connection.run_event_loop(event_loop, client).await });
        *self.event_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Connect and wait for the handshake: fail unless the broker accepts
    /// within 10 s, warn and proceed unless the subscription is confirmed
    /// within 5 s.
    pub async fn establish(self: &Arc<Self>) -> Result<(), ApiError> {
        self.connect().await?;
        if !self.connected.wait_timeout(CONNECT_TIMEOUT).await {
            return Err(ApiError::Timeout("MQTT broker connection".to_string()));
        }
        if !self.subscribed.wait_timeout(SUBSCRIBE_TIMEOUT).await {
            warn!("Subscription confirmation not received, proceeding anyway");
        }
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>, mut event_loop: EventLoop, client: AsyncClient) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.touch();
                    if ack.code == ConnectReturnCode::Success {
                        for topic in &self.topics {
                            if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                error!("Subscribe to {} failed: {}", topic, e);
                            }
                        }
                        self.connected.set();
                        info!("Subscribed to MQTT topics: {:?}", self.topics);
                    } else {
                        self.connected.clear();
                        error!("MQTT connection failed: {:?}", ack.code);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    self.subscribed.set();
                    debug!("Subscription confirmed");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.touch();
                    self.sink.on_message(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    let was_connected = self.connected.is_set();
                    self.connected.clear();
                    self.subscribed.clear();
                    if was_connected {
                        error!("Unexpected MQTT disconnection: {}", e);
                    } else {
                        debug!("MQTT event loop error: {}", e);
                    }
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Publish at QoS 1.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ApiError> {
        let client = self.client.lock().unwrap().clone();
        match client {
            Some(client) => {
                client
                    .publish(topic, QoS::AtLeastOnce, false, payload)
                    .await?;
                Ok(())
            }
            None => Err(ApiError::NotConnected),
        }
    }

    /// Tear the session down. Signals are cleared immediately so status
    /// metrics go to 0 before the broker notices.
    pub async fn disconnect(&self) {
        self.connected.clear();
        self.subscribed.clear();
        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            client.disconnect().await.ok();
        }
        debug!("MQTT connection closed");
    }

    pub fn touch(&self) {
        *self.last_message.lock().unwrap() = Some(Instant::now());
    }

    /// Time since the last broker activity, if any was ever seen.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_message.lock().unwrap().map(|t| t.elapsed())
    }
}

// ── Idle supervision ─────────────────────────────────────────────────

/// Watch the connection for silence and reconnect under a join timeout.
///
/// A hung reconnect cannot wedge supervision: the attempt is abandoned after
/// [`RECONNECT_TIMEOUT`] and backoff applies. Running the attempt inline in
/// this single task keeps reconnects one-in-flight.
pub(crate) fn spawn_idle_supervisor(
    connection: Arc<MqttConnection>,
    mqtt: MqttConfig,
    analytics: Arc<Analytics>,
    client_type: &'static str,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff =
            ReconnectBackoff::new(mqtt.idle_check_interval, mqtt.max_reconnect_delay);
        let mut ticker = tokio::time::interval(mqtt.idle_check_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(idle) = connection.idle_for() else { continue };
                    if idle <= mqtt.timeout {
                        continue;
                    }

                    warn!(
                        "No MQTT messages for {} seconds, reconnecting...",
                        idle.as_secs()
                    );
                    analytics
                        .mqtt_reconnections_total
                        .with_label_values(&[client_type])
                        .inc();

                    let reconnected = tokio::time::timeout(RECONNECT_TIMEOUT, async {
                        if let Err(e) = connection.connect().await {
                            error!("MQTT reconnection error: {}", e);
                            return false;
                        }
                        connection.connected.wait_timeout(CONNECT_TIMEOUT).await
                    })
                    .await
                    .unwrap_or_else(|_| {
                        error!("MQTT reconnection timed out");
                        false
                    });

                    // Either way, push the idle clock forward so the next tick
                    // does not immediately re-trigger.
                    connection.touch();
                    if reconnected {
                        info!("MQTT reconnection successful");
                        backoff.reset();
                    } else {
                        let delay = backoff.advance();
                        error!(
                            "MQTT reconnection failed, next attempt in {} seconds",
                            delay.as_secs()
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

// ── Message ingestion ────────────────────────────────────────────────

/// Routes broker payloads into the quota cache: UTF-8 payloads parse as JSON
/// with a top-level `params` object, anything else goes through the frame
/// decoder.
pub(crate) struct PushSink {
    pub cache: Arc<QuotaCache>,
    pub analytics: Arc<Analytics>,
    pub client_type: &'static str,
    /// Whether text updates also stamp the push timestamp (used by the
    /// request/reply backend to suppress redundant quota requests).
    pub track_push: bool,
}

impl PushSink {
    pub fn handle_text(&self, payload: &str) {
        self.analytics
            .mqtt_messages_total
            .with_label_values(&[self.client_type, "text"])
            .inc();

        match serde_json::from_str::<Value>(payload) {
            Ok(value) => {
                let Some(params) = value.get("params").and_then(Value::as_object) else {
                    debug!("MQTT message without params object");
                    return;
                };
                self.cache.apply(params);
                if self.track_push {
                    self.cache.mark_push();
                }
                debug!("Updated cache with {} parameters", params.len());
            }
            Err(e) => {
                error!("Failed to parse MQTT payload: {}", e);
                self.analytics
                    .mqtt_message_errors_total
                    .with_label_values(&[self.client_type])
                    .inc();
            }
        }
    }

    pub fn handle_binary(&self, payload: &[u8]) {
        self.analytics
            .mqtt_messages_total
            .with_label_values(&[self.client_type, "protobuf"])
            .inc();

        let params = proto::decode(payload);
        if params.is_empty() {
            return;
        }
        self.cache.apply(&params);
        debug!("Updated cache with {} protobuf parameters", params.len());
    }
}

impl MessageSink for PushSink {
    fn on_message(&self, _topic: &str, payload: &[u8]) {
        match std::str::from_utf8(payload) {
            Ok(text) => self.handle_text(text),
            Err(_) => self.handle_binary(payload),
        }
    }
}

// ── Push backend ─────────────────────────────────────────────────────

/// Passive push backend: subscribes to the device property topic and serves
/// the Worker from the quota cache.
pub struct MqttBackend {
    device_sn: String,
    device_name: Option<String>,
    catalog: DeviceCatalog,
    broker: CredentialBroker,
    mqtt: MqttConfig,
    cache: Arc<QuotaCache>,
    analytics: Arc<Analytics>,
    connection: tokio::sync::Mutex<Option<Arc<MqttConnection>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl MqttBackend {
    pub fn new(
        device_sn: String,
        device_name: Option<String>,
        catalog: DeviceCatalog,
        broker: CredentialBroker,
        mqtt: MqttConfig,
        analytics: Arc<Analytics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            device_sn,
            device_name,
            catalog,
            broker,
            mqtt,
            cache: Arc::new(QuotaCache::new()),
            analytics,
            connection: tokio::sync::Mutex::new(None),
            supervisor: Mutex::new(None),
            shutdown,
        }
    }

    async fn authorize(&self) -> Result<MqttCredentials, ApiError> {
        let timer = self.analytics.time_auth(CLIENT_TYPE);
        let result = self.broker.authorize().await;
        drop(timer);

        let status = if result.is_ok() { "success" } else { "error" };
        self.analytics
            .auth_requests_total
            .with_label_values(&[CLIENT_TYPE, status])
            .inc();
        result
    }

    async fn device_info(&self) -> DeviceInfo {
        let connected = match self.connection.lock().await.as_ref() {
            Some(connection) => connection.connected.is_set(),
            None => false,
        };
        let online = match self.cache.age() {
            Some(age) => connected && age < self.mqtt.timeout,
            None => connected,
        };

        DeviceInfo {
            sn: self.device_sn.clone(),
            name: self
                .device_name
                .clone()
                .unwrap_or_else(|| self.device_sn.clone()),
            product_name: self
                .catalog
                .product_name(&self.device_sn)
                .unwrap_or_else(|| "Unknown".to_string()),
            online,
        }
    }
}

#[async_trait]
impl Backend for MqttBackend {
    async fn connect(&self) -> Result<(), ApiError> {
        let credentials = self.authorize().await?;

        let sink = Arc::new(PushSink {
            cache: self.cache.clone(),
            analytics: self.analytics.clone(),
            client_type: CLIENT_TYPE,
            track_push: false,
        });
        let connection = Arc::new(MqttConnection::new(
            credentials,
            self.mqtt.keepalive,
            vec![data_topic(&self.device_sn)],
            sink,
        ));
        if let Err(e) = connection.establish().await {
            connection.disconnect().await;
            return Err(e);
        }

        self.shutdown.send_replace(false);
        {
            let mut slot = self.connection.lock().await;
            if let Some(old) = slot.take() {
                old.disconnect().await;
            }
            *slot = Some(connection.clone());
        }

        let supervisor = spawn_idle_supervisor(
            connection,
            self.mqtt.clone(),
            self.analytics.clone(),
            CLIENT_TYPE,
            self.shutdown.subscribe(),
        );
        if let Some(old) = self.supervisor.lock().unwrap().replace(supervisor) {
            old.abort();
        }

        self.analytics
            .mqtt_connected
            .with_label_values(&[CLIENT_TYPE])
            .set(1);
        info!("Connected to EcoFlow MQTT broker");
        Ok(())
    }

    async fn disconnect(&self) {
        // Periodic ticks stop before the broker session closes.
        self.shutdown.send_replace(true);
        if let Some(supervisor) = self.supervisor.lock().unwrap().take() {
            supervisor.abort();
        }
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
        self.analytics
            .mqtt_connected
            .with_label_values(&[CLIENT_TYPE])
            .set(0);
    }

    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, ApiError> {
        Ok(vec![self.device_info().await])
    }

    async fn get_device(&self, sn: &str) -> Result<Option<DeviceInfo>, ApiError> {
        if sn == self.device_sn {
            Ok(Some(self.device_info().await))
        } else {
            Ok(None)
        }
    }

    async fn get_device_quota(&self, sn: &str) -> Result<QuotaMap, ApiError> {
        if sn != self.device_sn {
            return Ok(QuotaMap::new());
        }
        Ok(self.cache.snapshot())
    }
}
