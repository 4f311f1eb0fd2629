use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{ScanKey, Sha256, Sid};
use crate::ingest::IngestTask;

/// Broadcast on `m-complete` when a submission finishes; the ingester uses
/// it to update the score cache and drain folded duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub scan_key: ScanKey,
    pub sid: Sid,
    #[serde(default)]
    pub psid: Option<Sid>,
    pub score: i64,
    pub root_sha256: Sha256,
    pub size: u64,
    #[serde(default)]
    pub error_count: usize,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Pushed on `m-alert` when a completed submission scores at or above the
/// critical threshold and the caller asked for alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub sid: Sid,
    pub score: i64,
    pub task: IngestTask,
}
