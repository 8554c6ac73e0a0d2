//! Signed polling backend over the developer REST API.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use ecoflow_core::config::HttpConfig;
use ecoflow_core::{DeviceInfo, QuotaMap};
use ecoflow_metrics::Analytics;

use crate::backend::Backend;
use crate::error::ApiError;
use crate::signature;

const DEVICE_LIST_ENDPOINT: &str = "/iot-open/sign/device/list";
const QUOTA_ENDPOINT: &str = "/iot-open/sign/device/quota/all";

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const POOL_SIZE: usize = 10;

/// Developer-API backend: every call is a signed GET with automatic retry
/// on transient statuses; the device list is cached for a short TTL.
pub struct RestBackend {
    access_key: String,
    secret_key: String,
    api_host: String,
    http: HttpConfig,
    analytics: Arc<Analytics>,
    client: Mutex<Option<reqwest::Client>>,
    devices_cache: Mutex<Option<(Vec<DeviceInfo>, Instant)>>,
}

impl RestBackend {
    pub fn new(
        access_key: String,
        secret_key: String,
        api_host: String,
        http: HttpConfig,
        analytics: Arc<Analytics>,
    ) -> Self {
        Self {
            access_key,
            secret_key,
            api_host,
            http,
            analytics,
            client: Mutex::new(None),
            devices_cache: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<reqwest::Client, ApiError> {
        self.client
            .lock()
            .unwrap()
            .clone()
            .ok_or(ApiError::NotConnected)
    }

    /// Execute one signed GET with retry on transient statuses.
    async fn request(&self, endpoint: &str, params: &[(String, String)]) -> Result<Value, ApiError> {
        let client = self.client()?;
        let url = format!("https://{}{}", self.api_host, endpoint);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let signed = signature::signed_request(&self.access_key, &self.secret_key, params);
            let mut request = client.get(&url).header("sign", signed.signature.as_str());
            for (key, value) in &signed.params {
                request = request.header(key.as_str(), value.as_str());
            }
            if !params.is_empty() {
                request = request.query(params);
            }

            let timer = self.analytics.time_http_request(endpoint);
            let result = request.send().await;
            drop(timer);

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    self.count_http(endpoint, "error");
                    return Err(e.into());
                }
            };

            let status = response.status();
            if RETRYABLE_STATUSES.contains(&status.as_u16()) && attempt <= self.http.retries {
                self.count_http(endpoint, "error");
                let delay = self.http.backoff_factor * 2f64.powi(attempt as i32 - 1);
                warn!(
                    "HTTP {} from {}, retry {}/{} in {:.1}s",
                    status.as_u16(),
                    endpoint,
                    attempt,
                    self.http.retries,
                    delay
                );
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                continue;
            }

            if !status.is_success() {
                self.count_http(endpoint, "error");
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::api(status.as_u16().to_string(), body));
            }

            let json: Value = match response.json().await {
                Ok(json) => json,
                Err(e) => {
                    self.count_http(endpoint, "error");
                    return Err(e.into());
                }
            };
            debug!("Payload from {}: {}", endpoint, json);
            self.count_http(endpoint, "success");
            return unwrap_response(json);
        }
    }

    fn count_http(&self, endpoint: &str, status: &str) {
        self.analytics
            .http_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
    }

    fn count_cache(&self, result: &str) {
        self.analytics
            .cache_operations_total
            .with_label_values(&[result])
            .inc();
    }

    fn cached_devices(&self) -> Option<Vec<DeviceInfo>> {
        let cache = self.devices_cache.lock().unwrap();
        cache.as_ref().and_then(|(devices, ts)| {
            (ts.elapsed() <= self.http.device_list_cache_ttl).then(|| devices.clone())
        })
    }
}

/// Extract `data` from a developer-API response; success iff `code == "0"`.
fn unwrap_response(response: Value) -> Result<Value, ApiError> {
    let code = match response.get("code") {
        Some(Value::String(code)) => code.clone(),
        Some(Value::Number(code)) => code.to_string(),
        _ => String::new(),
    };
    if code == "0" {
        Ok(response
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(QuotaMap::new())))
    } else {
        Err(ApiError::api(
            code,
            response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        ))
    }
}

fn parse_device(data: &Value) -> DeviceInfo {
    DeviceInfo {
        sn: data
            .get("sn")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        name: data
            .get("deviceName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        product_name: data
            .get("productName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        online: data.get("online").and_then(Value::as_i64) == Some(1),
    }
}

#[async_trait]
impl Backend for RestBackend {
    /// Validate credentials by building the session and fetching the device
    /// list once.
    async fn connect(&self) -> Result<(), ApiError> {
        let client = reqwest::Client::builder()
            .timeout(self.http.timeout)
            .pool_max_idle_per_host(POOL_SIZE)
            .build()?;
        *self.client.lock().unwrap() = Some(client);
        *self.devices_cache.lock().unwrap() = None;

        let devices = self.get_devices().await?;
        info!("Connected to EcoFlow API. Found {} device(s)", devices.len());
        Ok(())
    }

    async fn disconnect(&self) {
        *self.client.lock().unwrap() = None;
        *self.devices_cache.lock().unwrap() = None;
    }

    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, ApiError> {
        let data = self.request(DEVICE_LIST_ENDPOINT, &[]).await?;
        let devices: Vec<DeviceInfo> = data
            .as_array()
            .map(|list| list.iter().map(parse_device).collect())
            .unwrap_or_default();
        *self.devices_cache.lock().unwrap() = Some((devices.clone(), Instant::now()));
        Ok(devices)
    }

    async fn get_device(&self, sn: &str) -> Result<Option<DeviceInfo>, ApiError> {
        let devices = match self.cached_devices() {
            Some(devices) => {
                self.count_cache("hit");
                devices
            }
            None => {
                self.count_cache("miss");
                self.get_devices().await?
            }
        };
        Ok(devices.into_iter().find(|d| d.sn == sn))
    }

    async fn get_device_quota(&self, sn: &str) -> Result<QuotaMap, ApiError> {
        let data = self
            .request(QUOTA_ENDPOINT, &[("sn".to_string(), sn.to_string())])
            .await?;
        match data {
            Value::Object(map) => Ok(map),
            _ => Ok(QuotaMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwrap_accepts_code_zero_only() {
        let data = unwrap_response(json!({"code": "0", "data": {"soc": 85}})).unwrap();
        assert_eq!(data["soc"], json!(85));

        let err = unwrap_response(json!({"code": "8521", "message": "device offline"}))
            .unwrap_err();
        match err {
            ApiError::Api { code, message } => {
                assert_eq!(code, "8521");
                assert_eq!(message, "device offline");
            }
            other => panic!("unexpected error: {other}"),
        }

        // The "Success" message form belongs to the account API, not here.
        assert!(unwrap_response(json!({"message": "Success"})).is_err());
    }

    #[test]
    fn unwrap_tolerates_numeric_codes() {
        assert!(unwrap_response(json!({"code": 0, "data": {}})).is_ok());
        assert!(unwrap_response(json!({"code": 401})).is_err());
    }

    #[test]
    fn unwrap_defaults_missing_data_to_empty_object() {
        let data = unwrap_response(json!({"code": "0"})).unwrap();
        assert_eq!(data, json!({}));
    }

    #[test]
    fn parses_device_entries() {
        let device = parse_device(&json!({
            "sn": "DEV1",
            "deviceName": "D",
            "productName": "Delta",
            "online": 1,
        }));
        assert_eq!(
            device,
            DeviceInfo {
                sn: "DEV1".into(),
                name: "D".into(),
                product_name: "Delta".into(),
                online: true,
            }
        );

        let offline = parse_device(&json!({"sn": "DEV2", "online": 0}));
        assert!(!offline.online);
        assert_eq!(offline.name, "");
    }
}
