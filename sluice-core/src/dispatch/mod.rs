//! File and submission dispatching.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use sluice_model::{
    ServiceError, Sha256, Sid, SubmissionRecord,
};

use crate::broker::{Broker, HashTable};
use crate::capabilities::Capabilities;
use crate::error::Result;

mod client;
mod file;
mod submission;
mod table;

pub use client::DispatchClient;
pub use file::FileDispatcher;
pub use submission::SubmissionDispatcher;
pub use table::{Cell, DispatchTable, FinishedCell};

pub const SUBMISSION_TABLE: &str = "submissions";
pub const RESULT_TABLE: &str = "results";

/// Payload of the `submission` queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMessage {
    pub sid: Sid,
}

pub(crate) fn error_table(
    broker: Arc<dyn Broker>,
    sid: Sid,
) -> HashTable<ServiceError> {
    HashTable::new(broker, format!("errors-{sid}"))
}

/// Watch key guarding a submission's global deadline.
pub(crate) fn submission_watch_key(sid: Sid) -> String {
    format!("submission-{sid}")
}

/// Lock key serializing read-modify-write access to one submission's
/// dispatch table.
pub(crate) fn submission_lock_key(sid: Sid) -> String {
    format!("dispatch-{sid}")
}

/// Whether one file's schedule is fully resolved.
///
/// A group finishing with a `drop_file` result completes the file outright;
/// later groups never run against it.
pub(crate) async fn file_finished(
    table: &DispatchTable,
    sha256: &Sha256,
    schedule: &[Vec<String>],
) -> Result<bool> {
    for group in schedule {
        let mut dropped = false;
        for service in group {
            match table.finished(sha256, service).await? {
                Some(cell) => dropped |= cell.drop_file,
                None => return Ok(false),
            }
        }
        if dropped {
            return Ok(true);
        }
    }
    Ok(true)
}

/// Whether every file registered against the submission has a fully
/// resolved schedule. An empty file set means the root file task has not
/// been handled yet, which is never finished.
pub(crate) async fn submission_finished(
    table: &DispatchTable,
    record: &SubmissionRecord,
    caps: &dyn Capabilities,
) -> Result<bool> {
    let files = table.files().await?;
    if files.is_empty() {
        return Ok(false);
    }
    for file in files {
        let schedule = caps.build_schedule(record, &file.file_type);
        if !file_finished(table, &file.sha256, &schedule).await? {
            return Ok(false);
        }
    }
    Ok(true)
}
