//! Operational metrics for the exporter itself: scrape outcomes, HTTP and
//! auth latencies, broker connection state, message/error counters.
//!
//! One `Analytics` instance is constructed at startup and shared by `Arc`
//! into every component; tests build their own instance over a fresh
//! registry for isolation.

use prometheus::{
    HistogramOpts, HistogramTimer, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

use crate::shaper::DeviceLabels;

const HTTP_DURATION_BUCKETS: &[f64] =
    &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const AUTH_DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const SCRAPE_DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Outcome of one Worker scrape iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeStatus {
    Success,
    Offline,
    NotFound,
    Error,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Success => "success",
            ScrapeStatus::Offline => "offline",
            ScrapeStatus::NotFound => "not_found",
            ScrapeStatus::Error => "error",
        }
    }
}

pub struct Analytics {
    pub scrape_duration: HistogramVec,
    pub scrape_requests_total: IntCounterVec,
    pub metrics_collected: IntGaugeVec,

    pub http_request_duration: HistogramVec,
    pub http_requests_total: IntCounterVec,
    pub cache_operations_total: IntCounterVec,

    pub auth_duration: HistogramVec,
    pub auth_requests_total: IntCounterVec,

    pub mqtt_connected: IntGaugeVec,
    pub mqtt_messages_total: IntCounterVec,
    pub mqtt_reconnections_total: IntCounterVec,
    pub mqtt_message_errors_total: IntCounterVec,

    pub quota_requests_total: IntCounterVec,
}

impl Analytics {
    pub fn new(registry: &Registry, prefix: &str) -> Result<Self, prometheus::Error> {
        let device = &DeviceLabels::NAMES[..];
        let device_status = ["device", "device_name", "product_name", "device_general_key", "status"];

        let scrape_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_scrape_duration_seconds", prefix),
                "Time spent collecting device data",
            )
            .buckets(SCRAPE_DURATION_BUCKETS.to_vec()),
            device,
        )?;
        let scrape_requests_total = IntCounterVec::new(
            Opts::new(
                format!("{}_scrape_requests_total", prefix),
                "Total number of scrape attempts",
            ),
            &device_status,
        )?;
        let metrics_collected = IntGaugeVec::new(
            Opts::new(
                format!("{}_metrics_collected", prefix),
                "Number of metrics collected in last scrape",
            ),
            device,
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_http_request_duration_seconds", prefix),
                "HTTP request latency in seconds",
            )
            .buckets(HTTP_DURATION_BUCKETS.to_vec()),
            &["endpoint"],
        )?;
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                format!("{}_http_requests_total", prefix),
                "Total number of HTTP requests",
            ),
            &["endpoint", "status"],
        )?;
        let cache_operations_total = IntCounterVec::new(
            Opts::new(
                format!("{}_cache_operations_total", prefix),
                "Device list cache operations",
            ),
            &["result"],
        )?;

        let auth_duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_auth_duration_seconds", prefix),
                "Authentication duration (login + credentials retrieval)",
            )
            .buckets(AUTH_DURATION_BUCKETS.to_vec()),
            &["client_type"],
        )?;
        let auth_requests_total = IntCounterVec::new(
            Opts::new(
                format!("{}_auth_requests_total", prefix),
                "Total number of authentication attempts",
            ),
            &["client_type", "status"],
        )?;

        let mqtt_connected = IntGaugeVec::new(
            Opts::new(
                format!("{}_mqtt_connected", prefix),
                "MQTT connection status (1=connected, 0=disconnected)",
            ),
            &["client_type"],
        )?;
        let mqtt_messages_total = IntCounterVec::new(
            Opts::new(
                format!("{}_mqtt_messages_total", prefix),
                "Total number of MQTT messages received",
            ),
            &["client_type", "type"],
        )?;
        let mqtt_reconnections_total = IntCounterVec::new(
            Opts::new(
                format!("{}_mqtt_reconnections_total", prefix),
                "Total number of MQTT reconnection attempts",
            ),
            &["client_type"],
        )?;
        let mqtt_message_errors_total = IntCounterVec::new(
            Opts::new(
                format!("{}_mqtt_message_errors_total", prefix),
                "Total number of MQTT message processing errors",
            ),
            &["client_type"],
        )?;

        let quota_requests_total = IntCounterVec::new(
            Opts::new(
                format!("{}_quota_requests_total", prefix),
                "Total number of quota request operations",
            ),
            &["status"],
        )?;

        for collector in [
            Box::new(scrape_duration.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(scrape_requests_total.clone()),
            Box::new(metrics_collected.clone()),
            Box::new(http_request_duration.clone()),
            Box::new(http_requests_total.clone()),
            Box::new(cache_operations_total.clone()),
            Box::new(auth_duration.clone()),
            Box::new(auth_requests_total.clone()),
            Box::new(mqtt_connected.clone()),
            Box::new(mqtt_messages_total.clone()),
            Box::new(mqtt_reconnections_total.clone()),
            Box::new(mqtt_message_errors_total.clone()),
            Box::new(quota_requests_total.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            scrape_duration,
            scrape_requests_total,
            metrics_collected,
            http_request_duration,
            http_requests_total,
            cache_operations_total,
            auth_duration,
            auth_requests_total,
            mqtt_connected,
            mqtt_messages_total,
            mqtt_reconnections_total,
            mqtt_message_errors_total,
            quota_requests_total,
        })
    }

    /// Start timing a scrape; the duration is observed when the timer drops.
    pub fn time_scrape(&self, labels: &DeviceLabels) -> HistogramTimer {
        self.scrape_duration
            .with_label_values(&labels.values())
            .start_timer()
    }

    /// Start timing an HTTP request against a named endpoint.
    pub fn time_http_request(&self, endpoint: &str) -> HistogramTimer {
        self.http_request_duration
            .with_label_values(&[endpoint])
            .start_timer()
    }

    /// Start timing an authentication flow for the given client type.
    pub fn time_auth(&self, client_type: &str) -> HistogramTimer {
        self.auth_duration
            .with_label_values(&[client_type])
            .start_timer()
    }

    pub fn record_scrape(&self, labels: &DeviceLabels, status: ScrapeStatus) {
        let values = labels.values();
        self.scrape_requests_total
            .with_label_values(&[values[0], values[1], values[2], values[3], status.as_str()])
            .inc();
    }
}
