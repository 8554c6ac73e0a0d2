//! Derives stable Prometheus identities from the dotted/indexed keys the
//! devices report and keeps one gauge handle per derived name.
//!
//! A key like `bms.cells[3].voltage` and `bms.cells[7].voltage` map to the
//! same metric (`{prefix}_bms_cells_voltage`); the bracketed indices become
//! `index_0`, `index_1`, … label values.

use std::collections::HashMap;

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde_json::Value;
use tracing::debug;

/// Recursion guard for nested payloads; device data is bounded and
/// non-cyclic but the wire is not trusted.
const MAX_PROJECTION_DEPTH: usize = 32;

/// The fixed label tuple every device metric carries.
#[derive(Debug, Clone)]
pub struct DeviceLabels {
    pub device: String,
    pub device_name: String,
    pub product_name: String,
    pub general_key: String,
}

impl DeviceLabels {
    pub const NAMES: [&'static str; 4] =
        ["device", "device_name", "product_name", "device_general_key"];

    pub fn values(&self) -> [&str; 4] {
        [
            &self.device,
            &self.device_name,
            &self.product_name,
            &self.general_key,
        ]
    }
}

/// Derive the metric shape name and index label values from a raw key.
///
/// Bracketed numeric indices are extracted in order of appearance; dots and
/// brackets fold to underscores, runs collapse, and camelCase becomes
/// snake_case.
pub fn shape_name(key: &str) -> (String, Vec<String>) {
    let (stripped, indices) = extract_indices(key);
    (to_snake_case(&stripped), indices)
}

fn extract_indices(key: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(key.len());
    let mut indices = Vec::new();
    let mut rest = key;

    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        match after.find(']') {
            Some(close)
                if close > 0 && after[..close].bytes().all(|b| b.is_ascii_digit()) =>
            {
                out.push_str(&rest[..open]);
                indices.push(after[..close].to_string());
                rest = &after[close + 1..];
            }
            _ => {
                // Non-numeric bracket content stays in the name and folds to
                // underscores later.
                out.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    out.push_str(rest);

    (out, indices)
}

fn to_snake_case(key: &str) -> String {
    // Fold separators, collapse runs, trim.
    let mut folded = String::with_capacity(key.len());
    let mut last_underscore = true;
    for c in key.chars() {
        let c = match c {
            '.' | '[' | ']' | '_' => '_',
            other => other,
        };
        if c == '_' {
            if !last_underscore {
                folded.push('_');
            }
            last_underscore = true;
        } else {
            folded.push(c);
            last_underscore = false;
        }
    }
    while folded.ends_with('_') {
        folded.pop();
    }

    // camelCase / PascalCase → snake_case.
    let chars: Vec<char> = folded.chars().collect();
    let mut out = String::with_capacity(folded.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower_or_digit = i > 0
                && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let acronym_end = i > 0
                && chars[i - 1].is_ascii_uppercase()
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev_lower_or_digit || acronym_end {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Collector type requested at registration time. The request is honored
/// only for the first registration of a shape name; later registrations
/// reuse whatever exists and ignore the spec (including histogram buckets).
#[derive(Debug, Clone, Copy)]
pub enum MetricSpec<'a> {
    Gauge,
    Counter,
    Histogram(&'a [f64]),
}

/// A pooled collector handle, one per shape name.
#[derive(Clone)]
pub enum MetricHandle {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Histogram(HistogramVec),
}

impl MetricHandle {
    fn reset(&self) {
        match self {
            MetricHandle::Gauge(vec) => vec.reset(),
            MetricHandle::Counter(vec) => vec.reset(),
            MetricHandle::Histogram(vec) => vec.reset(),
        }
    }
}

/// Interning registry of device metrics.
///
/// A given shape name is registered at most once; later requests for the
/// same shape reuse the handle even when the source keys differ in their
/// bracketed indices.
pub struct MetricShaper {
    registry: Registry,
    prefix: String,
    labels: DeviceLabels,
    pool: HashMap<String, MetricHandle>,
}

impl MetricShaper {
    pub fn new(registry: Registry, prefix: impl Into<String>, labels: DeviceLabels) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
            labels,
            pool: HashMap::new(),
        }
    }

    /// Register (or look up) the collector for `key`.
    ///
    /// The first registration of a shape name decides the collector type;
    /// later registrations return the pooled handle no matter what `spec`
    /// asks for.
    pub fn register(&mut self, key: &str, spec: MetricSpec) -> Result<MetricHandle, prometheus::Error> {
        let (name, indices) = shape_name(key);
        if let Some(existing) = self.pool.get(&name) {
            return Ok(existing.clone());
        }

        let mut label_names: Vec<String> = DeviceLabels::NAMES.iter().map(|s| s.to_string()).collect();
        for i in 0..indices.len() {
            label_names.push(format!("index_{}", i));
        }
        let label_refs: Vec<&str> = label_names.iter().map(|s| s.as_str()).collect();

        let full_name = format!("{}_{}", self.prefix, name);
        let help = format!("Device parameter {}", name);
        let handle = match spec {
            MetricSpec::Gauge => {
                MetricHandle::Gauge(GaugeVec::new(Opts::new(full_name, help), &label_refs)?)
            }
            MetricSpec::Counter => {
                MetricHandle::Counter(CounterVec::new(Opts::new(full_name, help), &label_refs)?)
            }
            MetricSpec::Histogram(buckets) => MetricHandle::Histogram(HistogramVec::new(
                HistogramOpts::new(full_name, help).buckets(buckets.to_vec()),
                &label_refs,
            )?),
        };

        match &handle {
            MetricHandle::Gauge(vec) => self.registry.register(Box::new(vec.clone()))?,
            MetricHandle::Counter(vec) => self.registry.register(Box::new(vec.clone()))?,
            MetricHandle::Histogram(vec) => self.registry.register(Box::new(vec.clone()))?,
        }
        self.pool.insert(name, handle.clone());
        Ok(handle)
    }

    /// Set the gauge derived from `key` to `value`.
    pub fn set(&mut self, key: &str, value: f64) -> Result<(), prometheus::Error> {
        let (_, indices) = shape_name(key);
        let handle = self.register(key, MetricSpec::Gauge)?;

        let device_values = self.labels.values();
        let mut values: Vec<&str> = device_values.to_vec();
        for index in &indices {
            values.push(index);
        }

        match handle {
            MetricHandle::Gauge(vec) => vec.with_label_values(&values).set(value),
            // The name was first registered as something else; keep the
            // existing handle and drop the observation.
            _ => debug!("Skipping gauge set on non-gauge metric '{}'", key),
        }
        Ok(())
    }

    /// Project one quota entry into metrics, recursing through sequences and
    /// nested records. Returns the number of scalars set.
    pub fn project(&mut self, key: &str, value: &Value) -> Result<usize, prometheus::Error> {
        self.project_at(key, value, 0)
    }

    fn project_at(
        &mut self,
        key: &str,
        value: &Value,
        depth: usize,
    ) -> Result<usize, prometheus::Error> {
        if depth > MAX_PROJECTION_DEPTH {
            debug!("Skipping '{}': nesting exceeds {}", key, MAX_PROJECTION_DEPTH);
            return Ok(0);
        }

        match value {
            Value::Number(n) => {
                let Some(v) = n.as_f64() else {
                    debug!("Skipping metric '{}' with non-finite value", key);
                    return Ok(0);
                };
                self.set(key, v)?;
                Ok(1)
            }
            Value::Bool(b) => {
                self.set(key, if *b { 1.0 } else { 0.0 })?;
                Ok(1)
            }
            Value::Array(items) => {
                let mut count = 0;
                for (i, item) in items.iter().enumerate() {
                    count += self.project_at(&format!("{}[{}]", key, i), item, depth + 1)?;
                }
                Ok(count)
            }
            Value::Object(map) => {
                let mut count = 0;
                for (sub_key, sub_value) in map {
                    count += self.project_at(&format!("{}.{}", key, sub_key), sub_value, depth + 1)?;
                }
                Ok(count)
            }
            other => {
                debug!("Skipping metric '{}' with value '{}'", key, other);
                Ok(0)
            }
        }
    }

    /// Clear every label set on every interned metric (device offline).
    pub fn reset(&self) {
        for handle in self.pool.values() {
            handle.reset();
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels() -> DeviceLabels {
        DeviceLabels {
            device: "DEV1".into(),
            device_name: "Garage".into(),
            product_name: "RIVER 2 Pro".into(),
            general_key: "river2Pro".into(),
        }
    }

    fn shaper() -> MetricShaper {
        MetricShaper::new(Registry::new(), "ecoflow", labels())
    }

    #[test]
    fn derives_snake_case_names() {
        assert_eq!(shape_name("wattsIn").0, "watts_in");
        assert_eq!(shape_name("bms.temp").0, "bms_temp");
        assert_eq!(shape_name("pd.soc").0, "pd_soc");
        assert_eq!(shape_name("bmsMaster.cellTemp").0, "bms_master_cell_temp");
    }

    #[test]
    fn extracts_bracketed_indices_as_labels() {
        let (name, indices) = shape_name("bms.cells[3].voltage");
        assert_eq!(name, "bms_cells_voltage");
        assert_eq!(indices, vec!["3"]);

        let (name, indices) = shape_name("a[1].b[12].c");
        assert_eq!(name, "a_b_c");
        assert_eq!(indices, vec!["1", "12"]);
    }

    #[test]
    fn indexed_and_plain_keys_share_a_shape() {
        let with_index = shape_name("bms.cells[3].voltage").0;
        let without = shape_name("bms.cells.voltage").0;
        assert_eq!(with_index, without);
    }

    #[test]
    fn collapses_separator_runs() {
        assert_eq!(shape_name("inv..cfgAcOutVol").0, "inv_cfg_ac_out_vol");
        assert_eq!(shape_name(".soc.").0, "soc");
    }

    #[test]
    fn conflicting_type_registrations_reuse_the_first_handle() {
        let mut shaper = shaper();
        let first = shaper.register("cycles", MetricSpec::Counter).unwrap();
        assert!(matches!(first, MetricHandle::Counter(_)));

        // A later request with a different type (and type-specific
        // parameters) gets the existing handle back.
        let second = shaper
            .register("cycles", MetricSpec::Histogram(&[1.0, 2.0]))
            .unwrap();
        assert!(matches!(second, MetricHandle::Counter(_)));
        let third = shaper.register("cycles", MetricSpec::Gauge).unwrap();
        assert!(matches!(third, MetricHandle::Counter(_)));

        // Only one family was ever registered.
        assert_eq!(shaper.pool.len(), 1);
    }

    #[test]
    fn same_shape_reuses_the_handle() {
        let mut shaper = shaper();
        shaper.set("bms.cells[0].vol", 3.29).unwrap();
        shaper.set("bms.cells[1].vol", 3.31).unwrap();
        assert_eq!(shaper.pool.len(), 1);

        let families = shaper.registry().gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "ecoflow_bms_cells_vol");
        // Two label sets, one per index value.
        assert_eq!(families[0].get_metric().len(), 2);
    }

    #[test]
    fn projects_nested_structures() {
        let mut shaper = shaper();
        let value = json!({"temp": 25, "cells": [3.29, 3.31], "state": {"chg": 1}});
        let count = shaper.project("bms", &value).unwrap();
        assert_eq!(count, 4);

        let names: Vec<String> = shaper
            .registry()
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"ecoflow_bms_temp".to_string()));
        assert!(names.contains(&"ecoflow_bms_cells".to_string()));
        assert!(names.contains(&"ecoflow_bms_state_chg".to_string()));
    }

    #[test]
    fn skips_non_numeric_scalars() {
        let mut shaper = shaper();
        assert_eq!(shaper.project("fw", &json!("1.0.2")).unwrap(), 0);
        assert_eq!(shaper.project("x", &json!(null)).unwrap(), 0);
        assert_eq!(shaper.project("flag", &json!(true)).unwrap(), 1);
    }

    #[test]
    fn reset_clears_all_label_sets() {
        let mut shaper = shaper();
        shaper.set("soc", 85.0).unwrap();
        shaper.set("bms.cells[0].vol", 3.3).unwrap();
        assert!(shaper
            .registry()
            .gather()
            .iter()
            .all(|f| !f.get_metric().is_empty()));

        shaper.reset();
        assert!(shaper
            .registry()
            .gather()
            .iter()
            .all(|f| f.get_metric().is_empty()));
    }
}
