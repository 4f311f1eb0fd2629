use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Sid;

/// Persisted score-cache record keyed by scan key.
///
/// Written when a submission completes; consulted by the ingester to fold
/// duplicates and to seed priorities from past scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileScoreEntry {
    #[serde(default)]
    pub psid: Option<Sid>,
    pub sid: Sid,
    pub score: i64,
    /// Error count at completion; non-zero entries age out faster.
    #[serde(default)]
    pub errors: usize,
    pub time: DateTime<Utc>,
}
