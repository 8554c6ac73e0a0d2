//! Backend selection and wiring.

use std::sync::Arc;

use tracing::info;

use ecoflow_core::config::BackendKind;
use ecoflow_core::{Config, ConfigError, DeviceCatalog};
use ecoflow_metrics::Analytics;

use crate::auth::CredentialBroker;
use crate::backend::Backend;
use crate::device::DeviceBackend;
use crate::error::ApiError;
use crate::mqtt::MqttBackend;
use crate::rest::RestBackend;

/// Build the backend the configuration selects.
///
/// Exactly one credential pair must be present; push-family backends require
/// a device serial. Both rules are enforced by [`Config::backend_kind`].
pub fn create_backend(
    config: &Config,
    catalog: DeviceCatalog,
    analytics: Arc<Analytics>,
) -> Result<Arc<dyn Backend>, ApiError> {
    let kind = config.backend_kind()?;
    let creds = &config.credentials;

    match kind {
        BackendKind::Rest => {
            let (Some(access_key), Some(secret_key)) =
                (creds.access_key.clone(), creds.secret_key.clone())
            else {
                return Err(ConfigError::MissingCredentials.into());
            };
            info!("Using REST API backend (developer tokens)");
            Ok(Arc::new(RestBackend::new(
                access_key,
                secret_key,
                config.api_host.clone(),
                config.http.clone(),
                analytics,
            )))
        }
        BackendKind::Mqtt | BackendKind::Device => {
            let (Some(user), Some(password)) =
                (creds.account_user.clone(), creds.account_password.clone())
            else {
                return Err(ConfigError::MissingCredentials.into());
            };
            let Some(sn) = config.device.sn.clone() else {
                return Err(ConfigError::MissingDeviceSn.into());
            };
            let broker =
                CredentialBroker::new(&config.api_host, &user, &password, config.http.timeout)?;

            if kind == BackendKind::Mqtt {
                info!("Using MQTT backend (account credentials)");
                Ok(Arc::new(MqttBackend::new(
                    sn,
                    config.device.name.clone(),
                    catalog,
                    broker,
                    config.mqtt.clone(),
                    analytics,
                )))
            } else {
                info!("Using Device API backend (private MQTT)");
                Ok(Arc::new(DeviceBackend::new(
                    sn,
                    config.device.name.clone(),
                    catalog,
                    broker,
                    config.mqtt.clone(),
                    analytics,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecoflow_core::config::{
        CredentialsConfig, DeviceConfig, ExporterConfig, HttpConfig, MqttConfig, WorkerConfig,
    };
    use prometheus::Registry;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            api_host: "api.ecoflow.com".into(),
            device: DeviceConfig {
                sn: Some("DEV1".into()),
                name: None,
                product_name: None,
                general_key: None,
                devices_json: None,
            },
            credentials: CredentialsConfig {
                access_key: None,
                secret_key: None,
                account_user: None,
                account_password: None,
                api_type: BackendKind::Mqtt,
            },
            http: HttpConfig {
                timeout: Duration::from_secs(30),
                retries: 3,
                backoff_factor: 0.5,
                device_list_cache_ttl: Duration::from_secs(60),
            },
            mqtt: MqttConfig {
                timeout: Duration::from_secs(60),
                keepalive: Duration::from_secs(60),
                idle_check_interval: Duration::from_secs(30),
                max_reconnect_delay: Duration::from_secs(300),
                quota_request_interval: Duration::from_secs(30),
            },
            worker: WorkerConfig {
                collecting_interval: Duration::from_secs(10),
                retry_timeout: Duration::from_secs(30),
                establish_attempts: 5,
            },
            exporter: ExporterConfig {
                port: 9090,
                metrics_prefix: "ecoflow".into(),
                log_level: "info".into(),
            },
        }
    }

    fn analytics() -> Arc<Analytics> {
        Arc::new(Analytics::new(&Registry::new(), "ecoflow").unwrap())
    }

    #[test]
    fn selects_rest_for_developer_tokens() {
        let mut config = config();
        config.credentials.access_key = Some("ak".into());
        config.credentials.secret_key = Some("sk".into());
        assert!(create_backend(&config, DeviceCatalog::default(), analytics()).is_ok());
    }

    #[test]
    fn selects_push_backends_for_account_credentials() {
        let mut config = config();
        config.credentials.account_user = Some("user@example.com".into());
        config.credentials.account_password = Some("pw".into());
        assert!(create_backend(&config, DeviceCatalog::default(), analytics()).is_ok());

        config.credentials.api_type = BackendKind::Device;
        assert!(create_backend(&config, DeviceCatalog::default(), analytics()).is_ok());
    }

    #[test]
    fn rejects_conflicting_credentials() {
        let mut config = config();
        config.credentials.access_key = Some("ak".into());
        config.credentials.secret_key = Some("sk".into());
        config.credentials.account_user = Some("user@example.com".into());
        config.credentials.account_password = Some("pw".into());

        let err = create_backend(&config, DeviceCatalog::default(), analytics()).err().unwrap();
        assert!(matches!(
            err,
            ApiError::Config(ConfigError::ConflictingCredentials)
        ));
    }

    #[test]
    fn rejects_push_config_without_device_sn() {
        let mut config = config();
        config.device.sn = None;
        config.credentials.account_user = Some("user@example.com".into());
        config.credentials.account_password = Some("pw".into());

        let err = create_backend(&config, DeviceCatalog::default(), analytics()).err().unwrap();
        assert!(matches!(err, ApiError::Config(ConfigError::MissingDeviceSn)));
    }

    #[test]
    fn rejects_missing_credentials() {
        let err = create_backend(&config(), DeviceCatalog::default(), analytics()).err().unwrap();
        assert!(matches!(
            err,
            ApiError::Config(ConfigError::MissingCredentials)
        ));
    }
}
