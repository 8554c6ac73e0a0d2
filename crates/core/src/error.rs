use thiserror::Error;

/// Configuration errors, reported to the operator before any side effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "missing credentials: set ECOFLOW_ACCESS_KEY and ECOFLOW_SECRET_KEY for the \
         developer REST API, or ECOFLOW_ACCOUNT_USER and ECOFLOW_ACCOUNT_PASSWORD \
         for the account MQTT APIs"
    )]
    MissingCredentials,

    #[error(
        "both credential pairs are set: unset either ECOFLOW_ACCESS_KEY/ECOFLOW_SECRET_KEY \
         or ECOFLOW_ACCOUNT_USER/ECOFLOW_ACCOUNT_PASSWORD to select a single backend"
    )]
    ConflictingCredentials,

    #[error("ECOFLOW_DEVICE_SN must be set")]
    MissingDeviceSn,

    #[error("invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },
}

impl ConfigError {
    pub fn invalid(key: &str, value: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.into(),
        }
    }
}
