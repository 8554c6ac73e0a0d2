//! Static device catalog: friendly names and general keys by serial prefix.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

/// One catalog entry. The `sn` field is a serial-number prefix identifying
/// a product family.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub sn: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "generalKey")]
    pub general_key: Option<String>,
}

/// Device definitions loaded from a `devices.json` file.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    entries: Vec<CatalogEntry>,
}

impl DeviceCatalog {
    /// Load the catalog from disk. A missing or malformed file yields an
    /// empty catalog; lookups then fall back to their defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("devices.json not readable at {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Vec<CatalogEntry>>(&raw) {
            Ok(entries) => {
                debug!("Loaded {} device definitions from {}", entries.len(), path.display());
                Self { entries }
            }
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    fn find(&self, sn: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| !e.sn.is_empty() && sn.starts_with(&e.sn))
    }

    /// Product name by serial prefix.
    pub fn product_name(&self, sn: &str) -> Option<String> {
        self.find(sn)
            .map(|e| e.name.clone())
            .filter(|name| !name.is_empty())
    }

    /// Resolve the general key for a device.
    ///
    /// Precedence: explicit override, then prefix match, then `"unknown"`.
    pub fn resolve_general_key(&self, sn: &str, override_key: Option<&str>) -> String {
        if let Some(key) = override_key {
            return key.to_string();
        }
        match self.find(sn).and_then(|e| e.general_key.clone()) {
            Some(key) => key,
            None => {
                warn!("No matching device found for SN {}, using 'unknown'", sn);
                "unknown".to_string()
            }
        }
    }

    /// Resolve a friendly device name.
    ///
    /// Precedence: explicit override; an API-supplied name that differs from
    /// the serial; `"{catalog name}-{last 4 of SN}"`; the serial itself.
    pub fn resolve_device_name(
        &self,
        sn: &str,
        api_name: Option<&str>,
        override_name: Option<&str>,
    ) -> String {
        if let Some(name) = override_name {
            return name.to_string();
        }
        if let Some(name) = api_name {
            if !name.is_empty() && name != sn {
                return name.to_string();
            }
        }
        if let Some(friendly) = self.product_name(sn) {
            let suffix = if sn.len() >= 4 { &sn[sn.len() - 4..] } else { sn };
            return format!("{}-{}", friendly, suffix);
        }
        sn.to_string()
    }
}
