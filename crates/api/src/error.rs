use thiserror::Error;

/// Errors surfaced by the data-acquisition backends.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("configuration error: {0}")]
    Config(#[from] ecoflow_core::ConfigError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    #[error("missing key '{0}' in response")]
    MissingField(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,
}

impl ApiError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn missing(field: &str) -> Self {
        Self::MissingField(field.to_string())
    }
}
