//! Environment domain types
//!
//! Environments are promotion targets. Each one is backed by a git repository
//! that promotions open pull requests against; the development environment also
//! carries team-wide settings such as where build logs are stored.

use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;

/// Name of the environment holding team settings
pub const DEV_ENVIRONMENT: &str = "dev";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub metadata: ObjectMeta,
    pub spec: EnvironmentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentSpec {
    pub label: String,
    pub namespace: String,
    /// `Auto`, `Manual` or `Never`
    pub promotion_strategy: String,
    pub source: EnvironmentRepository,
    pub order: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_settings: Option<TeamSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentRepository {
    pub url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamSettings {
    pub storage_locations: Vec<StorageLocation>,
}

/// Where artifacts of one classification are kept
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageLocation {
    pub classifier: String,
    pub git_url: String,
    pub git_branch: String,
    pub bucket_url: String,
}

impl Environment {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_auto_promote(&self) -> bool {
        self.spec.promotion_strategy.eq_ignore_ascii_case("auto")
    }

    /// Branch promotion pull requests target
    pub fn base_branch(&self) -> &str {
        if self.spec.source.git_ref.is_empty() {
            "master"
        } else {
            &self.spec.source.git_ref
        }
    }
}

impl TeamSettings {
    /// Location for `classifier`, falling back to the `default` location
    pub fn storage_location(&self, classifier: &str) -> Option<&StorageLocation> {
        self.storage_locations
            .iter()
            .find(|location| location.classifier == classifier)
            .or_else(|| {
                self.storage_locations
                    .iter()
                    .find(|location| location.classifier == "default")
            })
    }
}

impl StorageLocation {
    pub fn is_empty(&self) -> bool {
        self.git_url.is_empty() && self.bucket_url.is_empty()
    }
}
