//! Request/reply backend over the private MQTT channel.
//!
//! A superset of the push backend: in addition to the property topic it
//! subscribes to the per-user `get_reply` topic and periodically publishes
//! quota requests on the `get` topic, but only when the device is not
//! already streaming push data.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use ecoflow_core::config::MqttConfig;
use ecoflow_core::{DeviceCatalog, DeviceInfo, QuotaMap};
use ecoflow_metrics::Analytics;

use crate::auth::{CredentialBroker, MqttCredentials};
use crate::backend::Backend;
use crate::cache::QuotaCache;
use crate::error::ApiError;
use crate::mqtt::{data_topic, spawn_idle_supervisor, MessageSink, MqttConnection, PushSink};

const CLIENT_TYPE: &str = "device";

fn get_topic(user_id: &str, sn: &str) -> String {
    format!("/app/{}/{}/thing/property/get", user_id, sn)
}

fn get_reply_topic(user_id: &str, sn: &str) -> String {
    format!("/app/{}/{}/thing/property/get_reply", user_id, sn)
}

/// Random request id in the range the devices expect.
fn gen_request_id() -> u64 {
    rand::thread_rng().gen_range(999_910_000..1_000_000_000)
}

/// The quota request envelope published on the `get` topic.
fn quota_request_envelope() -> Value {
    json!({
        "from": "PrometheusExporter",
        "id": gen_request_id().to_string(),
        "version": "1.0",
        "moduleType": 0,
        "operateType": "latestQuotas",
        "params": {},
    })
}

/// Whether a quota request should go out, given the age of the last push.
///
/// A device that is already streaming makes polling redundant.
fn should_request(push_age: Option<Duration>, interval: Duration) -> bool {
    match push_age {
        Some(age) => age >= interval,
        None => true,
    }
}

// ── Reply ingestion ──────────────────────────────────────────────────

/// Routes the two subscribed topics: replies parse the `latestQuotas`
/// envelope, push data and binary frames go through the shared sink.
struct DeviceSink {
    push: PushSink,
    data_topic: String,
    reply_topic: String,
}

impl DeviceSink {
    fn handle_quota_reply(&self, payload: &str) {
        self.push
            .analytics
            .mqtt_messages_total
            .with_label_values(&[CLIENT_TYPE, "text"])
            .inc();

        let data: Value = match serde_json::from_str(payload) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to parse quota reply: {}", e);
                self.push
                    .analytics
                    .mqtt_message_errors_total
                    .with_label_values(&[CLIENT_TYPE])
                    .inc();
                return;
            }
        };

        if data.get("operateType").and_then(Value::as_str) != Some("latestQuotas") {
            debug!(
                "Quota reply with operateType: {:?}",
                data.get("operateType")
            );
            return;
        }

        let message_data = data.get("data").cloned().unwrap_or_else(|| json!({}));
        let online = message_data
            .get("online")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if online != 1 {
            info!("Device is offline (from quota reply)");
            return;
        }

        if let Some(quota_map) = message_data.get("quotaMap").and_then(Value::as_object) {
            self.push.cache.apply(quota_map);
            debug!("Received quota data with {} parameters", quota_map.len());
        }
    }
}

impl MessageSink for DeviceSink {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        match std::str::from_utf8(payload) {
            Ok(text) if topic == self.reply_topic => self.handle_quota_reply(text),
            Ok(text) if topic == self.data_topic => self.push.handle_text(text),
            Ok(_) => debug!("Message on unknown topic: {}", topic),
            Err(_) => self.push.handle_binary(payload),
        }
    }
}

// ── Quota request loop ───────────────────────────────────────────────

async fn request_quota(
    connection: &MqttConnection,
    cache: &QuotaCache,
    analytics: &Analytics,
    topic: &str,
    suppress_within: Duration,
) {
    if !connection.connected.is_set() {
        debug!("Not connected, skipping quota request");
        return;
    }

    if !should_request(cache.push_age(), suppress_within) {
        debug!(
            "Skipping quota request, received push data {:.1}s ago",
            cache.push_age().unwrap_or_default().as_secs_f64()
        );
        analytics
            .quota_requests_total
            .with_label_values(&["skipped"])
            .inc();
        return;
    }

    let payload = quota_request_envelope().to_string().into_bytes();
    match connection.publish(topic, payload).await {
        Ok(()) => {
            analytics
                .quota_requests_total
                .with_label_values(&["sent"])
                .inc();
            debug!("Sent quota request to {}", topic);
        }
        Err(e) => error!("Failed to send quota request: {}", e),
    }
}

fn spawn_quota_requester(
    connection: Arc<MqttConnection>,
    cache: Arc<QuotaCache>,
    analytics: Arc<Analytics>,
    topic: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick is redundant: the initial request went out
        // right after the subscription was confirmed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    request_quota(&connection, &cache, &analytics, &topic, interval).await;
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

// ── Backend ──────────────────────────────────────────────────────────

/// Request/reply backend using the private per-user topics.
pub struct DeviceBackend {
    device_sn: String,
    device_name: Option<String>,
    catalog: DeviceCatalog,
    broker: CredentialBroker,
    mqtt: MqttConfig,
    cache: Arc<QuotaCache>,
    analytics: Arc<Analytics>,
    connection: tokio::sync::Mutex<Option<Arc<MqttConnection>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl DeviceBackend {
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
            tasks: Mutex::new(Vec::new()),
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

    fn stop_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Backend for DeviceBackend {
    async fn connect(&self) -> Result<(), ApiError> {
        let credentials = self.authorize().await?;
        let user_id = credentials.user_id.clone();

        let data = data_topic(&self.device_sn);
        let reply = get_reply_topic(&user_id, &self.device_sn);
        let get = get_topic(&user_id, &self.device_sn);

        let sink = Arc::new(DeviceSink {
            push: PushSink {
                cache: self.cache.clone(),
                analytics: self.analytics.clone(),
                client_type: CLIENT_TYPE,
                track_push: true,
            },
            data_topic: data.clone(),
            reply_topic: reply.clone(),
        });
        let connection = Arc::new(MqttConnection::new(
            credentials,
            self.mqtt.keepalive,
            vec![data, reply],
            sink,
        ));
        if let Err(e) = connection.establish().await {
            connection.disconnect().await;
            return Err(e);
        }

        // Subscription confirmed (or warned): issue the initial request now.
        request_quota(
            &connection,
            &self.cache,
            &self.analytics,
            &get,
            self.mqtt.quota_request_interval,
        )
        .await;

        self.shutdown.send_replace(false);
        {
            let mut slot = self.connection.lock().await;
            if let Some(old) = slot.take() {
                old.disconnect().await;
            }
            *slot = Some(connection.clone());
        }

        self.stop_tasks();
        let supervisor = spawn_idle_supervisor(
            connection.clone(),
            self.mqtt.clone(),
            self.analytics.clone(),
            CLIENT_TYPE,
            self.shutdown.subscribe(),
        );
        let requester = spawn_quota_requester(
            connection,
            self.cache.clone(),
            self.analytics.clone(),
            get,
            self.mqtt.quota_request_interval,
            self.shutdown.subscribe(),
        );
        self.tasks.lock().unwrap().extend([supervisor, requester]);

        self.analytics
            .mqtt_connected
            .with_label_values(&[CLIENT_TYPE])
            .set(1);
        info!("Connected to EcoFlow Device API (private MQTT)");
        Ok(())
    }

    async fn disconnect(&self) {
        // Periodic ticks stop before the broker session closes.
        self.shutdown.send_replace(true);
        self.stop_tasks();
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
