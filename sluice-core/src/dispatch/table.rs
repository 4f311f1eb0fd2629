//! Per-submission dispatch state.
//!
//! One broker hash per submission tracks, for every (file, service) pair,
//! whether a task is in flight or finished, plus the file set discovered
//! through extraction, the extraction budget, synthetic extraction errors,
//! and the completion sentinel.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use sluice_model::{FileTask, Sha256, Sid};

use crate::broker::Broker;
use crate::error::Result;

const CELL_PREFIX: &str = "svc:";
const FILE_PREFIX: &str = "file:";
const EXTRACTION_ERROR_PREFIX: &str = "exerr:";
const EXTRACTED_COUNT_KEY: &str = "extracted-count";
const COMPLETION_SENT_KEY: &str = "completion-sent";

/// State of one (file, service) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Cell {
    Dispatched { at_ms: i64 },
    Finished(FinishedCell),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedCell {
    /// Result key or error key resolving this pair.
    pub key: String,
    pub is_error: bool,
    /// Set when the result asked for later schedule stages to be skipped.
    pub drop_file: bool,
}

/// A file registered against the submission, minus the sid.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FilePoint {
    sha256: Sha256,
    file_type: String,
    depth: u32,
}

pub struct DispatchTable {
    broker: Arc<dyn Broker>,
    sid: Sid,
    name: String,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable").field("name", &self.name).finish()
    }
}

fn cell_key(sha256: &Sha256, service: &str) -> String {
    format!("{CELL_PREFIX}{sha256}:{service}")
}

impl DispatchTable {
    pub fn open(broker: Arc<dyn Broker>, sid: Sid) -> Self {
        DispatchTable {
            broker,
            sid,
            name: format!("dispatch-{sid}"),
        }
    }

    /// Add a file to the submission's file set. Returns whether the file
    /// was new.
    pub async fn register_file(&self, task: &FileTask) -> Result<bool> {
        let point = FilePoint {
            sha256: task.sha256.clone(),
            file_type: task.file_type.clone(),
            depth: task.depth,
        };
        self.broker
            .hash_set_if_absent(
                &self.name,
                &format!("{FILE_PREFIX}{}", task.sha256),
                serde_json::to_string(&point)?,
            )
            .await
    }

    /// Every file registered so far, as re-dispatchable tasks.
    pub async fn files(&self) -> Result<Vec<FileTask>> {
        let mut files = Vec::new();
        for (key, value) in self.broker.hash_get_all(&self.name).await? {
            if !key.starts_with(FILE_PREFIX) {
                continue;
            }
            let point: FilePoint = serde_json::from_str(&value)?;
            files.push(FileTask {
                sid: self.sid,
                sha256: point.sha256,
                file_type: point.file_type,
                depth: point.depth,
            });
        }
        files.sort_by(|a, b| a.sha256.cmp(&b.sha256));
        Ok(files)
    }

    async fn cell(
        &self,
        sha256: &Sha256,
        service: &str,
    ) -> Result<Option<Cell>> {
        match self
            .broker
            .hash_get(&self.name, &cell_key(sha256, service))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn finished(
        &self,
        sha256: &Sha256,
        service: &str,
    ) -> Result<Option<FinishedCell>> {
        Ok(match self.cell(sha256, service).await? {
            Some(Cell::Finished(cell)) => Some(cell),
            _ => None,
        })
    }

    /// Resolve a (file, service) pair. Finishing is monotonic: once a pair
    /// is finished the first resolution sticks and re-finishing is a no-op.
    pub async fn finish(
        &self,
        sha256: &Sha256,
        service: &str,
        key: impl Into<String>,
        is_error: bool,
        drop_file: bool,
    ) -> Result<()> {
        if self.finished(sha256, service).await?.is_some() {
            return Ok(());
        }
        let cell = Cell::Finished(FinishedCell {
            key: key.into(),
            is_error,
            drop_file,
        });
        self.broker
            .hash_set(
                &self.name,
                &cell_key(sha256, service),
                serde_json::to_string(&cell)?,
            )
            .await
    }

    /// Stamp a dispatch; the timestamp drives the timeout guard.
    pub async fn dispatch(&self, sha256: &Sha256, service: &str) -> Result<()> {
        self.dispatch_at(sha256, service, Utc::now().timestamp_millis())
            .await
    }

    pub async fn dispatch_at(
        &self,
        sha256: &Sha256,
        service: &str,
        at_ms: i64,
    ) -> Result<()> {
        let cell = Cell::Dispatched { at_ms };
        self.broker
            .hash_set(
                &self.name,
                &cell_key(sha256, service),
                serde_json::to_string(&cell)?,
            )
            .await
    }

    /// Forget an in-flight dispatch so the next file task re-dispatches
    /// immediately. Used on crash/timeout errors reported by workers.
    pub async fn clear_dispatch(
        &self,
        sha256: &Sha256,
        service: &str,
    ) -> Result<()> {
        if let Some(Cell::Dispatched { .. }) =
            self.cell(sha256, service).await?
        {
            self.broker
                .hash_remove(&self.name, &cell_key(sha256, service))
                .await?;
        }
        Ok(())
    }

    pub async fn dispatch_time(
        &self,
        sha256: &Sha256,
        service: &str,
    ) -> Result<Option<i64>> {
        Ok(match self.cell(sha256, service).await? {
            Some(Cell::Dispatched { at_ms }) => Some(at_ms),
            _ => None,
        })
    }

    /// All finished cells, as (file, service, cell).
    pub async fn finished_cells(
        &self,
    ) -> Result<Vec<(Sha256, String, FinishedCell)>> {
        let mut cells = Vec::new();
        for (key, value) in self.broker.hash_get_all(&self.name).await? {
            let Some(rest) = key.strip_prefix(CELL_PREFIX) else {
                continue;
            };
            let Some((sha, service)) = rest.split_once(':') else {
                continue;
            };
            if let Cell::Finished(cell) = serde_json::from_str(&value)? {
                let sha = Sha256::parse(sha).map_err(|err| {
                    crate::error::CoreError::Internal(err.to_string())
                })?;
                cells.push((sha, service.to_string(), cell));
            }
        }
        cells.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        Ok(cells)
    }

    /// Claim one slot of the submission's extraction budget.
    pub async fn reserve_extraction_slot(&self, max: u32) -> Result<bool> {
        let taken = self
            .broker
            .hash_incr(&self.name, EXTRACTED_COUNT_KEY, 1)
            .await?;
        if taken > max as i64 {
            self.broker
                .hash_incr(&self.name, EXTRACTED_COUNT_KEY, -1)
                .await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Record the error key for a child that could not be dispatched.
    pub async fn add_extraction_error(&self, error_key: &str) -> Result<()> {
        self.broker
            .hash_set(
                &self.name,
                &format!("{EXTRACTION_ERROR_PREFIX}{error_key}"),
                "1".to_string(),
            )
            .await
    }

    pub async fn extraction_errors(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .broker
            .hash_keys(&self.name)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(EXTRACTION_ERROR_PREFIX)
                    .map(str::to_string)
            })
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// First caller wins the right to enqueue the submission-complete
    /// message; retries and races all observe one send.
    pub async fn mark_completion_sent(&self) -> Result<bool> {
        self.broker
            .hash_set_if_absent(
                &self.name,
                COMPLETION_SENT_KEY,
                "1".to_string(),
            )
            .await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.broker.hash_delete(&self.name).await
    }
}
