//! The periodic scrape loop: backend → quota map → metric shaper.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{GaugeVec, Opts, Registry};
use tracing::{debug, error, info, warn};

use ecoflow_api::Backend;
use ecoflow_core::config::WorkerConfig;
use ecoflow_metrics::{Analytics, DeviceLabels, MetricShaper, ScrapeStatus};

/// Collects device data on a fixed interval and projects it into metrics.
///
/// No error escapes the loop: every iteration ends with an accounted scrape
/// status and an appropriate sleep.
pub struct Worker {
    backend: Arc<dyn Backend>,
    labels: DeviceLabels,
    shaper: MetricShaper,
    online: GaugeVec,
    analytics: Arc<Analytics>,
    collecting_interval: Duration,
    retry_timeout: Duration,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: &Registry,
        prefix: &str,
        labels: DeviceLabels,
        analytics: Arc<Analytics>,
        config: &WorkerConfig,
    ) -> Result<Self, prometheus::Error> {
        let online = GaugeVec::new(
            Opts::new(format!("{}_online", prefix), "1 if device is online"),
            &DeviceLabels::NAMES,
        )?;
        registry.register(Box::new(online.clone()))?;

        Ok(Self {
            backend,
            shaper: MetricShaper::new(registry.clone(), prefix, labels.clone()),
            labels,
            online,
            analytics,
            collecting_interval: config.collecting_interval,
            retry_timeout: config.retry_timeout,
        })
    }

    pub async fn run(mut self) {
        loop {
            let sleep = self.collect_once().await;
            debug!("Sleeping for {} seconds", sleep.as_secs());
            tokio::time::sleep(sleep).await;
        }
    }

    /// One scrape iteration; returns how long to sleep before the next.
    pub(crate) async fn collect_once(&mut self) -> Duration {
        debug!("Collecting data for device {}", self.labels.device);
        let _timer = self.analytics.time_scrape(&self.labels);

        let device = match self.backend.get_device(&self.labels.device).await {
            Ok(device) => device,
            Err(e) => return self.fail(&e),
        };

        let Some(device) = device else {
            warn!("Device {} not found", self.labels.device);
            self.set_online(false);
            self.finish(ScrapeStatus::NotFound, 0);
            return self.retry_timeout;
        };

        self.set_online(device.online);
        if !device.online {
            info!("Device {} is offline", self.labels.device);
            self.shaper.reset();
            self.finish(ScrapeStatus::Offline, 0);
            return self.collecting_interval;
        }

        let quota = match self.backend.get_device_quota(&self.labels.device).await {
            Ok(quota) => quota,
            Err(e) => return self.fail(&e),
        };

        let mut count = 0;
        for (key, value) in &quota {
            match self.shaper.project(key, value) {
                Ok(n) => count += n,
                Err(e) => return self.fail(&e),
            }
        }

        self.finish(ScrapeStatus::Success, count as i64);
        self.collecting_interval
    }

    fn set_online(&self, online: bool) {
        self.online
            .with_label_values(&self.labels.values())
            .set(if online { 1.0 } else { 0.0 });
    }

    fn finish(&self, status: ScrapeStatus, collected: i64) {
        self.analytics.record_scrape(&self.labels, status);
        self.analytics
            .metrics_collected
            .with_label_values(&self.labels.values())
            .set(collected);
    }

    fn fail(&self, e: &dyn std::fmt::Display) -> Duration {
        error!(
            "Error collecting data for device {}: {}",
            self.labels.device, e
        );
        self.set_online(false);
        self.shaper.reset();
        self.finish(ScrapeStatus::Error, 0);
        self.retry_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ecoflow_api::ApiError;
    use ecoflow_core::{DeviceInfo, QuotaMap};
    use serde_json::json;
    use std::sync::Mutex;

    /// What the scripted backend answers on the next call.
    enum Script {
        NotFound,
        Offline,
        Online(QuotaMap),
        Fail,
    }

    struct FakeBackend {
        script: Mutex<Script>,
    }

    impl FakeBackend {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }

        fn set(&self, script: Script) {
            *self.script.lock().unwrap() = script;
        }

        fn device(online: bool) -> DeviceInfo {
            DeviceInfo {
                sn: "DEV1".into(),
                name: "D".into(),
                product_name: "Delta".into(),
                online,
            }
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn connect(&self) -> Result<(), ApiError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn get_devices(&self) -> Result<Vec<DeviceInfo>, ApiError> {
            Ok(vec![])
        }

        async fn get_device(&self, _sn: &str) -> Result<Option<DeviceInfo>, ApiError> {
            match &*self.script.lock().unwrap() {
                Script::NotFound => Ok(None),
                Script::Offline => Ok(Some(Self::device(false))),
                Script::Online(_) => Ok(Some(Self::device(true))),
                Script::Fail => Err(ApiError::NotConnected),
            }
        }

        async fn get_device_quota(&self, _sn: &str) -> Result<QuotaMap, ApiError> {
            match &*self.script.lock().unwrap() {
                Script::Online(quota) => Ok(quota.clone()),
                _ => Err(ApiError::NotConnected),
            }
        }
    }

    fn labels() -> DeviceLabels {
        DeviceLabels {
            device: "DEV1".into(),
            device_name: "D".into(),
            product_name: "Delta".into(),
            general_key: "delta".into(),
        }
    }

    fn quota(pairs: &[(&str, serde_json::Value)]) -> QuotaMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        worker: Worker,
        registry: Registry,
        analytics: Arc<Analytics>,
    }

    fn harness(script: Script) -> Harness {
        let registry = Registry::new();
        let analytics = Arc::new(Analytics::new(&registry, "ecoflow").unwrap());
        let backend = FakeBackend::new(script);
        let worker = Worker::new(
            backend.clone(),
            &registry,
            "ecoflow",
            labels(),
            analytics.clone(),
            &WorkerConfig {
                collecting_interval: Duration::from_secs(10),
                retry_timeout: Duration::from_secs(30),
                establish_attempts: 5,
            },
        )
        .unwrap();
        Harness {
            backend,
            worker,
            registry,
            analytics,
        }
    }

    fn gauge_value(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|f| f.get_name() == name)
            .and_then(|f| f.get_metric().first())
            .map(|m| m.get_gauge().get_value())
    }

    fn scrape_count(analytics: &Analytics, status: &str) -> u64 {
        analytics
            .scrape_requests_total
            .with_label_values(&["DEV1", "D", "Delta", "delta", status])
            .get()
    }

    #[tokio::test]
    async fn successful_scrape_projects_quota_metrics() {
        let mut h = harness(Script::Online(quota(&[
            ("soc", json!(85)),
            ("bms", json!({"temp": 25})),
        ])));

        let sleep = h.worker.collect_once().await;
        assert_eq!(sleep, Duration::from_secs(10));

        assert_eq!(gauge_value(&h.registry, "ecoflow_soc"), Some(85.0));
        assert_eq!(gauge_value(&h.registry, "ecoflow_bms_temp"), Some(25.0));
        assert_eq!(gauge_value(&h.registry, "ecoflow_online"), Some(1.0));
        assert_eq!(scrape_count(&h.analytics, "success"), 1);

        let collected = h
            .analytics
            .metrics_collected
            .with_label_values(&["DEV1", "D", "Delta", "delta"])
            .get();
        assert_eq!(collected, 2);
    }

    #[tokio::test]
    async fn scrape_metrics_carry_the_device_labels() {
        let mut h = harness(Script::Online(quota(&[("soc", json!(85))])));
        h.worker.collect_once().await;

        let families = h.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "ecoflow_soc")
            .unwrap();
        let labels: Vec<(String, String)> = family.get_metric()[0]
            .get_label()
            .iter()
            .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
            .collect();
        assert!(labels.contains(&("device".to_string(), "DEV1".to_string())));
        assert!(labels.contains(&("device_general_key".to_string(), "delta".to_string())));
    }

    #[tokio::test]
    async fn missing_device_accounts_not_found_and_backs_off() {
        let mut h = harness(Script::NotFound);

        let sleep = h.worker.collect_once().await;
        assert_eq!(sleep, Duration::from_secs(30));
        assert_eq!(gauge_value(&h.registry, "ecoflow_online"), Some(0.0));
        assert_eq!(scrape_count(&h.analytics, "not_found"), 1);
    }

    #[tokio::test]
    async fn offline_device_resets_previously_seen_metrics() {
        let mut h = harness(Script::Online(quota(&[("soc", json!(85))])));
        h.worker.collect_once().await;
        assert_eq!(gauge_value(&h.registry, "ecoflow_soc"), Some(85.0));

        h.backend.set(Script::Offline);
        let sleep = h.worker.collect_once().await;
        assert_eq!(sleep, Duration::from_secs(10));

        // Label sets are cleared; the family is empty until data returns.
        let families = h.registry.gather();
        let soc = families.iter().find(|f| f.get_name() == "ecoflow_soc");
        assert!(soc.map_or(true, |f| f.get_metric().is_empty()));
        assert_eq!(gauge_value(&h.registry, "ecoflow_online"), Some(0.0));
        assert_eq!(scrape_count(&h.analytics, "offline"), 1);
    }

    #[tokio::test]
    async fn backend_errors_account_an_error_scrape() {
        let mut h = harness(Script::Fail);

        let sleep = h.worker.collect_once().await;
        assert_eq!(sleep, Duration::from_secs(30));
        assert_eq!(gauge_value(&h.registry, "ecoflow_online"), Some(0.0));
        assert_eq!(scrape_count(&h.analytics, "error"), 1);
    }

    #[tokio::test]
    async fn scrape_duration_is_observed_every_iteration() {
        let mut h = harness(Script::NotFound);
        h.worker.collect_once().await;
        h.worker.collect_once().await;

        let count = h
            .analytics
            .scrape_duration
            .with_label_values(&["DEV1", "D", "Delta", "delta"])
            .get_sample_count();
        assert_eq!(count, 2);
    }
}
