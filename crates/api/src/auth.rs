//! Account login and broker-credential retrieval for the push backends.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;

/// Broker session credentials handed out by the IoT-auth endpoint.
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub user_id: String,
    pub user_name: String,
}

/// Exchanges account credentials for a session token and broker credentials.
pub struct CredentialBroker {
    client: reqwest::Client,
    api_host: String,
    email: String,
    password: String,
}

impl CredentialBroker {
    pub fn new(
        api_host: &str,
        email: &str,
        password: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_host: api_host.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        })
    }

    /// Log in and fetch broker credentials in one go.
    pub async fn authorize(&self) -> Result<MqttCredentials, ApiError> {
        let (token, user_id, user_name) = self.login().await?;
        self.fetch_broker_credentials(&token, &user_id, user_name)
            .await
    }

    /// POST the account credentials; returns `(token, user_id, user_name)`.
    pub async fn login(&self) -> Result<(String, String, String), ApiError> {
        let url = format!("https://{}/auth/login", self.api_host);
        let body = json!({
            "email": self.email,
            "password": BASE64.encode(self.password.as_bytes()),
            "scene": "IOT_APP",
            "userType": "ECOFLOW",
        });

        info!("Logging in to EcoFlow API at {}", url);
        let response = self
            .client
            .post(&url)
            .header("lang", "en_US")
            .json(&body)
            .send()
            .await?;
        let json = parse_response(response).await?;

        let data = json.get("data").ok_or_else(|| ApiError::missing("data"))?;
        let token = str_field(data, "token", "data.token")?;
        let user = data
            .get("user")
            .ok_or_else(|| ApiError::missing("data.user"))?;
        let user_id = str_field(user, "userId", "data.user.userId")?;
        let user_name = str_field(user, "name", "data.user.name")?;

        info!("Successfully logged in as: {}", user_name);
        Ok((token, user_id, user_name))
    }

    /// GET the broker credentials for an authenticated user.
    pub async fn fetch_broker_credentials(
        &self,
        token: &str,
        user_id: &str,
        user_name: String,
    ) -> Result<MqttCredentials, ApiError> {
        let url = format!("https://{}/iot-auth/app/certification", self.api_host);

        info!("Requesting MQTT credentials from {}", url);
        let response = self
            .client
            .get(&url)
            .header("lang", "en_US")
            .bearer_auth(token)
            .query(&[("userId", user_id)])
            .send()
            .await?;
        let json = parse_response(response).await?;

        let data = json.get("data").ok_or_else(|| ApiError::missing("data"))?;
        let host = str_field(data, "url", "data.url")?;
        let port = port_field(data)?;
        let username = str_field(data, "certificateAccount", "data.certificateAccount")?;
        let password = str_field(data, "certificatePassword", "data.certificatePassword")?;
        let client_id = format!(
            "ANDROID_{}_{}",
            Uuid::new_v4().to_string().to_uppercase(),
            user_id
        );

        info!("MQTT credentials obtained for account: {}", username);
        Ok(MqttCredentials {
            host,
            port,
            username,
            password,
            client_id,
            user_id: user_id.to_string(),
            user_name,
        })
    }
}

/// Validate status and the API's success envelope.
///
/// The account endpoints answer with either `code == "0"` or
/// `message == "Success"` depending on the API variant; both are accepted.
async fn parse_response(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Auth(format!("HTTP {}: {}", status.as_u16(), body)));
    }

    let json: Value = response.json().await?;
    if is_success(&json) {
        Ok(json)
    } else {
        Err(ApiError::api(
            json.get("code").and_then(Value::as_str).unwrap_or(""),
            json.get("message").and_then(Value::as_str).unwrap_or(""),
        ))
    }
}

fn is_success(json: &Value) -> bool {
    if json.get("code").and_then(Value::as_str) == Some("0") {
        return true;
    }
    json.get("message")
        .and_then(Value::as_str)
        .is_some_and(|m| m.eq_ignore_ascii_case("success"))
}

fn str_field(value: &Value, key: &str, path: &str) -> Result<String, ApiError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::missing(path))
}

/// The port arrives as a number or a numeric string depending on the API
/// variant.
fn port_field(data: &Value) -> Result<u16, ApiError> {
    match data.get("port") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ApiError::missing("data.port")),
        Some(Value::String(s)) => s.parse().map_err(|_| ApiError::missing("data.port")),
        _ => Err(ApiError::missing("data.port")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_both_success_forms() {
        assert!(is_success(&json!({"code": "0", "message": "ok"})));
        assert!(is_success(&json!({"message": "Success"})));
        assert!(is_success(&json!({"message": "success"})));
        assert!(!is_success(&json!({"code": "401", "message": "auth failed"})));
        assert!(!is_success(&json!({})));
    }

    #[test]
    fn port_accepts_number_and_string() {
        assert_eq!(port_field(&json!({"port": 8883})).unwrap(), 8883);
        assert_eq!(port_field(&json!({"port": "8883"})).unwrap(), 8883);
        assert!(port_field(&json!({"port": "abc"})).is_err());
        assert!(port_field(&json!({})).is_err());
    }

    #[test]
    fn missing_fields_name_the_key() {
        let err = str_field(&json!({}), "token", "data.token").unwrap_err();
        assert!(err.to_string().contains("data.token"));
    }
}
