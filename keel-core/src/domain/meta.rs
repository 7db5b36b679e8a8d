//! Object metadata shared by all stored resources

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The subset of resource metadata the controllers care about.
///
/// Maps are ordered so that two equal resources always serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Sets a label, returning true when the stored value changed
    pub fn ensure_label(&mut self, key: &str, value: &str) -> bool {
        if value.is_empty() || self.label(key) == Some(value) {
            return false;
        }
        self.labels.insert(key.to_string(), value.to_string());
        true
    }
}
