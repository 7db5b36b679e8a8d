//! Activity status values
//!
//! One enum is shared by pipelines, stages, steps and promotion sub-steps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of an activity, stage, step or promotion
///
/// Serialized as the bare string the stored resources use; the empty string
/// (and anything unrecognised) reads back as [`ActivityStatus::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityStatus {
    #[default]
    None,
    Pending,
    Running,
    Succeeded,
    Failed,
    NotExecuted,
    Error,
    Aborted,
    WaitingForApproval,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::NotExecuted => "NotExecuted",
            Self::Error => "Error",
            Self::Aborted => "Aborted",
            Self::WaitingForApproval => "WaitingForApproval",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Error | Self::Aborted
        )
    }

    /// Terminal, or skipped because an earlier step failed
    pub fn is_finished(&self) -> bool {
        self.is_terminated() || *self == Self::NotExecuted
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Aborted)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ActivityStatus {
    fn from(value: &str) -> Self {
        match value {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "NotExecuted" => Self::NotExecuted,
            "Error" => Self::Error,
            "Aborted" => Self::Aborted,
            "WaitingForApproval" => Self::WaitingForApproval,
            _ => Self::None,
        }
    }
}

impl From<String> for ActivityStatus {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<ActivityStatus> for String {
    fn from(value: ActivityStatus) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_set() {
        for status in [
            ActivityStatus::Succeeded,
            ActivityStatus::Failed,
            ActivityStatus::Error,
            ActivityStatus::Aborted,
        ] {
            assert!(status.is_terminated(), "{status} should be terminal");
        }
        for status in [
            ActivityStatus::None,
            ActivityStatus::Pending,
            ActivityStatus::Running,
            ActivityStatus::NotExecuted,
            ActivityStatus::WaitingForApproval,
        ] {
            assert!(!status.is_terminated(), "{status:?} should not be terminal");
        }
        assert!(ActivityStatus::NotExecuted.is_finished());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&ActivityStatus::NotExecuted).unwrap();
        assert_eq!(json, "\"NotExecuted\"");

        let none = serde_json::to_string(&ActivityStatus::None).unwrap();
        assert_eq!(none, "\"\"");
    }

    #[test]
    fn test_unknown_status_reads_as_none() {
        let status: ActivityStatus = serde_json::from_str("\"Exploded\"").unwrap();
        assert_eq!(status, ActivityStatus::None);
        let status: ActivityStatus = serde_json::from_str("\"Aborted\"").unwrap();
        assert_eq!(status, ActivityStatus::Aborted);
    }
}
