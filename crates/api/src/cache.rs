//! In-memory quota cache shared between broker callbacks and the Worker.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use ecoflow_core::QuotaMap;

#[derive(Debug, Default)]
struct CacheInner {
    quota: QuotaMap,
    last_update: Option<Instant>,
    last_push: Option<Instant>,
}

/// Mapping from device parameter to its last observed value.
///
/// Append-biased: later writes to the same key overwrite, keys are never
/// removed within a session. All mutations are serialized by the mutex, so
/// readers always observe whole-message updates.
#[derive(Debug, Default)]
pub struct QuotaCache {
    inner: Mutex<CacheInner>,
}

impl QuotaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current quota map. Mutating the returned map never
    /// affects subsequent calls.
    pub fn snapshot(&self) -> QuotaMap {
        self.inner.lock().unwrap().quota.clone()
    }

    /// Merge `delta` into the cache and stamp the update time.
    pub fn apply(&self, delta: &QuotaMap) {
        let mut inner = self.inner.lock().unwrap();
        for (key, value) in delta {
            inner.quota.insert(key.clone(), value.clone());
        }
        inner.last_update = Some(Instant::now());
    }

    /// Record that data arrived on the push topic (as opposed to a reply).
    pub fn mark_push(&self) {
        self.inner.lock().unwrap().last_push = Some(Instant::now());
    }

    /// Time since the last update, if any update was ever applied.
    pub fn age(&self) -> Option<Duration> {
        self.inner.lock().unwrap().last_update.map(|t| t.elapsed())
    }

    /// Time since the last push-topic message.
    pub fn push_age(&self) -> Option<Duration> {
        self.inner.lock().unwrap().last_push.map(|t| t.elapsed())
    }

    /// Whether the cache has seen an update and it is older than `max_age`.
    pub fn stale(&self, max_age: Duration) -> bool {
        self.age().is_some_and(|age| age > max_age)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().quota.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn map(pairs: &[(&str, serde_json::Value)]) -> QuotaMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn later_writes_overwrite_same_key() {
        let cache = QuotaCache::new();
        cache.apply(&map(&[("soc", json!(80))]));
        cache.apply(&map(&[("soc", json!(85)), ("wattsIn", json!(200))]));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot["soc"], json!(85));
        assert_eq!(snapshot["wattsIn"], json!(200));
    }

    #[test]
    fn missing_keys_are_not_removed() {
        let cache = QuotaCache::new();
        cache.apply(&map(&[("soc", json!(80)), ("wattsOut", json!(55))]));
        cache.apply(&map(&[("soc", json!(81))]));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot["wattsOut"], json!(55));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn snapshot_is_isolated() {
        let cache = QuotaCache::new();
        cache.apply(&map(&[("soc", json!(80))]));

        let mut snapshot = cache.snapshot();
        snapshot.insert("soc".to_string(), json!(0));
        snapshot.insert("injected".to_string(), json!(1));

        let fresh = cache.snapshot();
        assert_eq!(fresh["soc"], json!(80));
        assert!(!fresh.contains_key("injected"));
    }

    #[test]
    fn staleness_tracks_updates() {
        let cache = QuotaCache::new();
        // Never updated: not stale, age unknown.
        assert!(!cache.stale(Duration::from_secs(0)));
        assert!(cache.age().is_none());

        cache.apply(&map(&[("soc", json!(80))]));
        assert!(!cache.stale(Duration::from_secs(60)));
        assert!(cache.stale(Duration::from_nanos(1)));
    }

    #[test]
    fn concurrent_writers_produce_the_union() {
        let cache = Arc::new(QuotaCache::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let mut delta = QuotaMap::new();
                    delta.insert(format!("w{}.k{}", worker, i), json!(worker * 1000 + i));
                    cache.apply(&delta);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 8 * 50);
    }
}
