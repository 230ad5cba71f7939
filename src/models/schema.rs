//! Export and import schema configuration records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One configured delivery sink. `module_type` selects the implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSchemaConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub module_type: String,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl ExportSchemaConfig {
    pub fn new(name: &str, module_type: &str) -> Self {
        Self {
            name: name.to_string(),
            module_type: module_type.to_string(),
            settings: HashMap::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }
}

/// One configured import source, polled every `interval_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSchemaConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub module_type: String,
    /// Stable identity of the source, used as the dirty-state key.
    pub fingerprint: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

fn default_interval() -> u64 {
    60
}

impl ImportSchemaConfig {
    pub fn new(name: &str, module_type: &str, fingerprint: &str, interval_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            module_type: module_type.to_string(),
            fingerprint: fingerprint.to_string(),
            interval_secs,
            settings: HashMap::new(),
        }
    }

    pub fn with_setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }
}
