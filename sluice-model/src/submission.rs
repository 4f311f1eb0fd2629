use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256 as Hasher};

use crate::ids::{ScanKey, Sha256, Sid};

/// Caller-supplied knobs that shape how a submission is processed.
///
/// Everything that changes analyzer output participates in the scan key;
/// purely operational flags (priority, never_drop, alerting) do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionParams {
    /// Services the file should be scheduled through.
    #[serde(default)]
    pub selected: Vec<String>,
    /// Services added on a stochastic resubmission of a high-scoring file.
    #[serde(default)]
    pub resubmit_to: Vec<String>,
    #[serde(default = "default_max_extraction_depth")]
    pub max_extraction_depth: u32,
    #[serde(default = "default_max_extracted")]
    pub max_extracted: u32,
    /// Explicit priority; `None` lets the ingester resolve one.
    #[serde(default)]
    pub priority: Option<u32>,
    pub classification: String,
    pub submitter: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub ignore_cache: bool,
    #[serde(default)]
    pub ignore_size: bool,
    #[serde(default)]
    pub never_drop: bool,
    #[serde(default)]
    pub generate_alert: bool,
    /// Parent submission id when this request is a resubmission.
    #[serde(default)]
    pub psid: Option<Sid>,
    #[serde(default)]
    pub description: String,
}

fn default_max_extraction_depth() -> u32 {
    6
}

fn default_max_extracted() -> u32 {
    500
}

impl SubmissionParams {
    pub fn new(submitter: impl Into<String>) -> Self {
        SubmissionParams {
            selected: Vec::new(),
            resubmit_to: Vec::new(),
            max_extraction_depth: default_max_extraction_depth(),
            max_extracted: default_max_extracted(),
            priority: None,
            classification: "U".to_string(),
            submitter: submitter.into(),
            groups: Vec::new(),
            ignore_cache: false,
            ignore_size: false,
            never_drop: false,
            generate_alert: false,
            psid: None,
            description: String::new(),
        }
    }

    /// Fingerprint this parameter set together with a file digest.
    ///
    /// Service selection is hashed order-independently so callers listing the
    /// same services in a different order still fold together.
    pub fn scan_key(&self, sha256: &Sha256) -> ScanKey {
        let mut selected: Vec<&str> =
            self.selected.iter().map(String::as_str).collect();
        selected.sort_unstable();

        let mut hasher = Hasher::new();
        hasher.update(sha256.as_str().as_bytes());
        for service in selected {
            hasher.update(b"\x00");
            hasher.update(service.as_bytes());
        }
        hasher.update(b"\x01");
        hasher.update(self.max_extraction_depth.to_le_bytes());
        hasher.update(self.max_extracted.to_le_bytes());
        hasher.update(self.classification.as_bytes());

        ScanKey::from_digest(hex::encode(hasher.finalize()))
    }
}

/// One file named by a submission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub sha256: Sha256,
    pub size: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default = "unknown_file_type")]
    pub file_type: String,
}

fn unknown_file_type() -> String {
    "unknown".to_string()
}

/// Where to tell the caller about the outcome, and above what score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Suffix of the notification queue (`nq-<suffix>`).
    pub queue: String,
    #[serde(default)]
    pub threshold: Option<i64>,
}

/// Immutable snapshot of what a caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub files: Vec<FileEntry>,
    pub params: SubmissionParams,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub notification: Option<Notification>,
    pub ingest_time: DateTime<Utc>,
}

impl SubmissionRequest {
    /// The root file driving the schedule. Requests are validated non-empty
    /// before anything downstream runs.
    pub fn root(&self) -> Option<&FileEntry> {
        self.files.first()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Submitted,
    Completed,
}

/// Persisted state of one submission owned by the dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub sid: Sid,
    pub scan_key: ScanKey,
    pub files: Vec<FileEntry>,
    pub params: SubmissionParams,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub notification: Option<Notification>,
    /// Result keys accumulated as services finish.
    #[serde(default)]
    pub results: Vec<String>,
    /// Error keys accumulated as services fail terminally.
    #[serde(default)]
    pub errors: Vec<String>,
    pub state: SubmissionState,
    #[serde(default)]
    pub score: Option<i64>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubmissionRecord {
    pub fn root(&self) -> Option<&FileEntry> {
        self.files.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sha() -> Sha256 {
        Sha256::of_bytes(b"sample")
    }

    #[test]
    fn scan_key_ignores_selection_order() {
        let sha = sample_sha();
        let mut a = SubmissionParams::new("user");
        a.selected = vec!["extract".into(), "av".into()];
        let mut b = SubmissionParams::new("user");
        b.selected = vec!["av".into(), "extract".into()];

        assert_eq!(a.scan_key(&sha), b.scan_key(&sha));
    }

    #[test]
    fn scan_key_changes_with_parameters() {
        let sha = sample_sha();
        let a = SubmissionParams::new("user");
        let mut b = SubmissionParams::new("user");
        b.max_extracted = 10_000;

        assert_ne!(a.scan_key(&sha), b.scan_key(&sha));
    }

    #[test]
    fn scan_key_changes_with_file() {
        let params = SubmissionParams::new("user");
        let a = params.scan_key(&Sha256::of_bytes(b"one"));
        let b = params.scan_key(&Sha256::of_bytes(b"two"));

        assert_ne!(a, b);
    }

    #[test]
    fn scan_key_ignores_operational_flags() {
        let sha = sample_sha();
        let a = SubmissionParams::new("user");
        let mut b = SubmissionParams::new("user");
        b.priority = Some(200);
        b.never_drop = true;
        b.generate_alert = true;

        assert_eq!(a.scan_key(&sha), b.scan_key(&sha));
    }
}
