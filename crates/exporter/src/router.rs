//! Prometheus text exposition over axum.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry)
}

/// Encode the registry in the Prometheus text format.
fn render(registry: &Registry) -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    match render(&registry) {
        Ok((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntGauge, Opts};

    #[test]
    fn renders_registered_metrics_as_text() {
        let registry = Registry::new();
        let gauge = IntGauge::with_opts(Opts::new("ecoflow_online", "1 if device is online"))
            .unwrap();
        registry.register(Box::new(gauge.clone())).unwrap();
        gauge.set(1);

        let (content_type, body) = render(&registry).unwrap();
        assert!(content_type.starts_with("text/plain"));

        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("# HELP ecoflow_online 1 if device is online"));
        assert!(text.contains("ecoflow_online 1"));
    }

    #[test]
    fn renders_an_empty_registry() {
        let (_, body) = render(&Registry::new()).unwrap();
        assert!(body.is_empty());
    }
}
