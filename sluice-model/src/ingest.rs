use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ScanKey, Sha256, Sid};
use crate::submission::{FileEntry, SubmissionRequest};

/// The ingester's internal envelope around a submission request.
///
/// Carries everything the intake pipeline resolves on top of the raw
/// request: the scan key, the effective priority, retry bookkeeping, a
/// failure reason once the task is routed to the drop queue, and the score
/// recovered from the cache when one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestTask {
    pub request: SubmissionRequest,
    #[serde(default)]
    pub scan_key: Option<ScanKey>,
    /// Effective priority once resolved; mirrors `request.params.priority`
    /// when the caller set one.
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: String,
    #[serde(default)]
    pub score: Option<i64>,
    /// The submission this task resolved to, filled in at finalization so
    /// notifications identify their submission.
    #[serde(default)]
    pub sid: Option<Sid>,
}

impl IngestTask {
    pub fn new(request: SubmissionRequest) -> Self {
        IngestTask {
            request,
            scan_key: None,
            priority: None,
            retries: 0,
            retry_at: None,
            failure: String::new(),
            score: None,
            sid: None,
        }
    }

    pub fn root(&self) -> Option<&FileEntry> {
        self.request.root()
    }

    pub fn root_sha256(&self) -> Option<&Sha256> {
        self.request.root().map(|f| &f.sha256)
    }

    pub fn file_size(&self) -> u64 {
        self.request.root().map(|f| f.size).unwrap_or(0)
    }

    /// Stamp and return the scan key, computing it from the root file and
    /// parameters on first use.
    pub fn stamp_scan_key(&mut self) -> Option<ScanKey> {
        if self.scan_key.is_none() {
            let sha = self.root_sha256()?.clone();
            self.scan_key = Some(self.request.params.scan_key(&sha));
        }
        self.scan_key.clone()
    }
}
