use serde::{Deserialize, Serialize};

/// Live device parameters as last observed on the wire, keyed by dotted
/// parameter name. Nesting is preserved verbatim; the metric shaper flattens
/// it at projection time.
pub type QuotaMap = serde_json::Map<String, serde_json::Value>;

/// Identity of a single power station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub sn: String,
    pub name: String,
    pub product_name: String,
    pub online: bool,
}
