use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env_opt(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::invalid(key, v)),
        None => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    match env_opt(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::invalid(key, v)),
        None => Ok(default),
    }
}

fn env_u16(key: &str, default: u16) -> Result<u16, ConfigError> {
    match env_opt(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::invalid(key, v)),
        None => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64, ConfigError> {
    match env_opt(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::invalid(key, v)),
        None => Ok(default),
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    env_u64(key, default).map(Duration::from_secs)
}

// ── Backend selection ─────────────────────────────────────────

/// Which data-acquisition backend the environment selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Signed polling over the developer REST API.
    Rest,
    /// Passive push over the public MQTT broker.
    Mqtt,
    /// Request/reply over the private MQTT channel.
    Device,
}

impl BackendKind {
    /// Label used by the analytics metrics (`client_type`).
    pub fn client_type(&self) -> &'static str {
        match self {
            BackendKind::Rest => "rest",
            BackendKind::Mqtt => "mqtt",
            BackendKind::Device => "device",
        }
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub device: DeviceConfig,
    pub credentials: CredentialsConfig,
    pub http: HttpConfig,
    pub mqtt: MqttConfig,
    pub worker: WorkerConfig,
    pub exporter: ExporterConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_host: env_or("ECOFLOW_API_HOST", "api.ecoflow.com"),
            device: DeviceConfig::from_env(),
            credentials: CredentialsConfig::from_env()?,
            http: HttpConfig::from_env()?,
            mqtt: MqttConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
            exporter: ExporterConfig::from_env()?,
        })
    }

    /// Which backend the credential environment selects.
    ///
    /// Exactly one credential pair must be present; push-family backends
    /// additionally require a device serial.
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        let creds = &self.credentials;
        let has_rest = creds.access_key.is_some() && creds.secret_key.is_some();
        let has_account = creds.account_user.is_some() && creds.account_password.is_some();

        match (has_rest, has_account) {
            (true, true) => Err(ConfigError::ConflictingCredentials),
            (true, false) => Ok(BackendKind::Rest),
            (false, true) => {
                if self.device.sn.is_none() {
                    return Err(ConfigError::MissingDeviceSn);
                }
                Ok(creds.api_type)
            }
            (false, false) => Err(ConfigError::MissingCredentials),
        }
    }

    /// Validate the full configuration before any side effect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_kind()?;
        if self.device.sn.is_none() {
            return Err(ConfigError::MissingDeviceSn);
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  api:      host={}", self.api_host);
        tracing::info!(
            "  device:   sn={}",
            self.device.sn.as_deref().unwrap_or("(unset)")
        );
        tracing::info!(
            "  http:     timeout={}s, retries={}",
            self.http.timeout.as_secs(),
            self.http.retries
        );
        tracing::info!(
            "  mqtt:     timeout={}s, keepalive={}s, idle_check={}s",
            self.mqtt.timeout.as_secs(),
            self.mqtt.keepalive.as_secs(),
            self.mqtt.idle_check_interval.as_secs()
        );
        tracing::info!(
            "  worker:   interval={}s, retry={}s",
            self.worker.collecting_interval.as_secs(),
            self.worker.retry_timeout.as_secs()
        );
        tracing::info!(
            "  exporter: port={}, prefix={}",
            self.exporter.port,
            self.exporter.metrics_prefix
        );
    }
}

// ── Device ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub sn: Option<String>,
    /// Friendly name override (`ECOFLOW_DEVICE_NAME`).
    pub name: Option<String>,
    /// Product name override (`ECOFLOW_PRODUCT_NAME`).
    pub product_name: Option<String>,
    /// General key override (`ECOFLOW_DEVICE_GENERAL_KEY`).
    pub general_key: Option<String>,
    /// Path to the static device catalog (`ECOFLOW_DEVICES_JSON`).
    pub devices_json: Option<PathBuf>,
}

impl DeviceConfig {
    fn from_env() -> Self {
        Self {
            sn: env_opt("ECOFLOW_DEVICE_SN"),
            name: env_opt("ECOFLOW_DEVICE_NAME"),
            product_name: env_opt("ECOFLOW_PRODUCT_NAME"),
            general_key: env_opt("ECOFLOW_DEVICE_GENERAL_KEY"),
            devices_json: env_opt("ECOFLOW_DEVICES_JSON").map(PathBuf::from),
        }
    }
}

// ── Credentials ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CredentialsConfig {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub account_user: Option<String>,
    pub account_password: Option<String>,
    /// Which push-family backend account credentials select.
    pub api_type: BackendKind,
}

impl CredentialsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let api_type = match env_or("ECOFLOW_API_TYPE", "mqtt").as_str() {
            "mqtt" => BackendKind::Mqtt,
            "device" => BackendKind::Device,
            other => return Err(ConfigError::invalid("ECOFLOW_API_TYPE", other)),
        };
        Ok(Self {
            access_key: env_opt("ECOFLOW_ACCESS_KEY"),
            secret_key: env_opt("ECOFLOW_SECRET_KEY"),
            account_user: env_opt("ECOFLOW_ACCOUNT_USER"),
            account_password: env_opt("ECOFLOW_ACCOUNT_PASSWORD"),
            api_type,
        })
    }
}

// ── HTTP ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_factor: f64,
    pub device_list_cache_ttl: Duration,
}

impl HttpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            timeout: env_secs("HTTP_TIMEOUT", 30)?,
            retries: env_u32("HTTP_RETRIES", 3)?,
            backoff_factor: env_f64("HTTP_BACKOFF_FACTOR", 0.5)?,
            device_list_cache_ttl: env_secs("DEVICE_LIST_CACHE_TTL", 60)?,
        })
    }
}

// ── MQTT ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Idle threshold: no message for this long marks the channel dead.
    pub timeout: Duration,
    pub keepalive: Duration,
    pub idle_check_interval: Duration,
    pub max_reconnect_delay: Duration,
    pub quota_request_interval: Duration,
}

impl MqttConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            timeout: env_secs("MQTT_TIMEOUT", 60)?,
            keepalive: env_secs("MQTT_KEEPALIVE", 60)?,
            idle_check_interval: env_secs("IDLE_CHECK_INTERVAL", 30)?,
            max_reconnect_delay: env_secs("MAX_RECONNECT_DELAY", 300)?,
            quota_request_interval: env_secs("QUOTA_REQUEST_INTERVAL", 30)?,
        })
    }
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub collecting_interval: Duration,
    pub retry_timeout: Duration,
    pub establish_attempts: u32,
}

impl WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            collecting_interval: env_secs("COLLECTING_INTERVAL", 10)?,
            retry_timeout: env_secs("RETRY_TIMEOUT", 30)?,
            establish_attempts: env_u32("ESTABLISH_ATTEMPTS", 5)?,
        })
    }
}

// ── Exporter ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub port: u16,
    pub metrics_prefix: String,
    pub log_level: String,
}

impl ExporterConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_u16("EXPORTER_PORT", 9090)?,
            metrics_prefix: env_or("METRICS_PREFIX", "ecoflow"),
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}
