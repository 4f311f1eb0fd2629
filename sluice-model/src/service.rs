use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256 as Hasher};
use uuid::Uuid;

use crate::ids::{Sha256, Sid};

/// A file surfaced by an analyzer while processing its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFile {
    pub sha256: Sha256,
    pub name: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub size: u64,
}

/// Outcome reported by an analyzer that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResult {
    pub sha256: Sha256,
    pub service_name: String,
    #[serde(default)]
    pub score: i64,
    /// When set, no later schedule stage runs against this file.
    #[serde(default)]
    pub drop_file: bool,
    #[serde(default)]
    pub extracted: Vec<ExtractedFile>,
}

/// How a service failure should be treated by the dispatcher.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Non-recoverable; the service is done with this file.
    Terminal,
    Timeout,
    Crash,
    /// The service was disabled while the task was queued.
    Disabled,
}

impl ErrorCategory {
    /// Terminal categories resolve the (file, service) pair outright;
    /// the others only count toward the failure limit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorCategory::Terminal | ErrorCategory::Disabled)
    }
}

/// Error record written when a service fails on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub sid: Sid,
    pub sha256: Sha256,
    pub service_name: String,
    pub category: ErrorCategory,
    pub message: String,
}

/// Key under which a service result is stored.
///
/// Depends only on (file, service, config) so equivalent work across
/// submissions lands on the same record.
pub fn build_result_key(
    sha256: &Sha256,
    service_name: &str,
    service_config: &serde_json::Value,
) -> String {
    let mut hasher = Hasher::new();
    hasher.update(sha256.as_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(service_name.as_bytes());
    hasher.update(b"\x00");
    // Value -> String is deterministic for the map types we store.
    hasher.update(service_config.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Keys for error records are unique per occurrence.
pub fn build_error_key(sha256: &Sha256, service_name: &str) -> String {
    format!("{}.{}.{}", sha256, service_name, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_keys_are_stable() {
        let sha = Sha256::of_bytes(b"content");
        let config = serde_json::json!({"deep": true});
        assert_eq!(
            build_result_key(&sha, "av", &config),
            build_result_key(&sha, "av", &config),
        );
    }

    #[test]
    fn result_keys_depend_on_service_and_config() {
        let sha = Sha256::of_bytes(b"content");
        let config = serde_json::json!({});
        let a = build_result_key(&sha, "av", &config);
        let b = build_result_key(&sha, "extract", &config);
        let c = build_result_key(&sha, "av", &serde_json::json!({"x": 1}));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn error_keys_are_unique() {
        let sha = Sha256::of_bytes(b"content");
        assert_ne!(
            build_error_key(&sha, "av"),
            build_error_key(&sha, "av"),
        );
    }
}
