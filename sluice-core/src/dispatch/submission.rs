//! Submission-level aggregation: turn a fully dispatched submission into a
//! completed record, a cache entry, and a completion broadcast.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sluice_config::CoreConfig;
use tracing::{debug, info, warn};

use sluice_model::{
    CompletionMessage, FileScoreEntry, FileTask, ServiceResult,
    SubmissionRecord, SubmissionState,
};

use super::{
    DispatchTable, SubmissionMessage, submission_finished,
    submission_lock_key, submission_watch_key,
};
use crate::broker::{
    Broker, COMPLETE_QUEUE, FILE_DISPATCH_QUEUE, HashTable, NamedQueue,
    SUBMISSION_QUEUE,
};
use crate::capabilities::Capabilities;
use crate::error::Result;
use crate::locks::KeyedLock;
use crate::runtime::Worker;
use crate::watcher::WatcherClient;

const POP_TIMEOUT: Duration = Duration::from_millis(250);

/// Consumes the `submission` queue.
///
/// A message arrives either because a file dispatcher saw everything
/// finish, or because the watcher gave up waiting. The incomplete case
/// re-drives every known file; the complete case finalizes exactly once.
pub struct SubmissionDispatcher {
    config: Arc<CoreConfig>,
    caps: Arc<dyn Capabilities>,
    persistent: Arc<dyn Broker>,
    watcher: WatcherClient,
    submissions: HashTable<SubmissionRecord>,
    results: HashTable<ServiceResult>,
    file_queue: NamedQueue<FileTask>,
    submission_queue: NamedQueue<SubmissionMessage>,
    complete_queue: NamedQueue<CompletionMessage>,
    filescore: HashTable<FileScoreEntry>,
}

impl std::fmt::Debug for SubmissionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionDispatcher").finish_non_exhaustive()
    }
}

impl SubmissionDispatcher {
    pub fn new(
        config: Arc<CoreConfig>,
        caps: Arc<dyn Capabilities>,
        volatile: Arc<dyn Broker>,
        persistent: Arc<dyn Broker>,
    ) -> Self {
        SubmissionDispatcher {
            submissions: HashTable::new(
                persistent.clone(),
                super::SUBMISSION_TABLE,
            ),
            results: HashTable::new(persistent.clone(), super::RESULT_TABLE),
            file_queue: NamedQueue::new(
                persistent.clone(),
                FILE_DISPATCH_QUEUE,
            ),
            submission_queue: NamedQueue::new(
                persistent.clone(),
                SUBMISSION_QUEUE,
            ),
            complete_queue: NamedQueue::new(volatile, COMPLETE_QUEUE),
            filescore: HashTable::new(
                persistent.clone(),
                crate::cache::FILESCORE_TABLE,
            ),
            watcher: WatcherClient::new(persistent.clone()),
            config,
            caps,
            persistent,
        }
    }

    pub async fn handle(&self, message: SubmissionMessage) -> Result<()> {
        let sid = message.sid;
        let Some(mut record) = self.submissions.get(&sid.to_string()).await?
        else {
            warn!(%sid, "completion check for unknown submission");
            return Ok(());
        };
        if record.state == SubmissionState::Completed {
            // Duplicate completion flags and late watcher firings land here.
            return Ok(());
        }

        let _lock =
            KeyedLock::acquire(self.persistent.clone(), &submission_lock_key(sid))
                .await?;
        let table = DispatchTable::open(self.persistent.clone(), sid);
        if !submission_finished(&table, &record, &*self.caps).await? {
            // Timed out or re-opened: push every known file back through
            // the dispatcher, which re-dispatches anything expired.
            debug!(%sid, "submission incomplete, re-driving files");
            let files = table.files().await?;
            if files.is_empty() {
                // The root file task was lost before it built the table.
                if let Some(root) = record.root() {
                    self.file_queue
                        .push(&FileTask {
                            sid,
                            sha256: root.sha256.clone(),
                            file_type: root.file_type.clone(),
                            depth: 0,
                        })
                        .await?;
                }
            }
            for file in files {
                self.file_queue.push(&file).await?;
            }
            self.watcher
                .touch(
                    &submission_watch_key(sid),
                    Duration::from_secs(
                        self.config.submission.max_time_seconds,
                    ),
                    SUBMISSION_QUEUE,
                    &SubmissionMessage { sid },
                )
                .await?;
            return Ok(());
        }

        let Some(root) = record.root().cloned() else {
            warn!(%sid, "completed submission has no files, discarding");
            return Ok(());
        };

        // Aggregate the table into the record. Result keys can repeat when
        // several submissions share cached work, hence the sets.
        let mut result_keys = BTreeSet::new();
        let mut error_keys = BTreeSet::new();
        for (_, _, cell) in table.finished_cells().await? {
            if cell.is_error {
                error_keys.insert(cell.key);
            } else {
                result_keys.insert(cell.key);
            }
        }
        for key in table.extraction_errors().await? {
            error_keys.insert(key);
        }

        let mut results = Vec::with_capacity(result_keys.len());
        for key in &result_keys {
            if let Some(result) = self.results.get(key).await? {
                results.push(result);
            }
        }
        let score = self.caps.score(&results);
        let file_count = table.files().await?.len();

        record.results = result_keys.into_iter().collect();
        record.errors = error_keys.into_iter().collect();
        record.score = Some(score);
        record.state = SubmissionState::Completed;
        record.completed_at = Some(Utc::now());
        self.submissions.set(&sid.to_string(), &record).await?;

        let entry = FileScoreEntry {
            psid: record.params.psid,
            sid,
            score,
            errors: record.errors.len(),
            time: Utc::now(),
        };
        self.filescore
            .set(record.scan_key.as_str(), &entry)
            .await?;

        self.complete_queue
            .push(&CompletionMessage {
                scan_key: record.scan_key.clone(),
                sid,
                psid: record.params.psid,
                score,
                root_sha256: root.sha256.clone(),
                size: root.size,
                error_count: record.errors.len(),
                file_count,
                metadata: record.metadata.clone(),
            })
            .await?;

        self.watcher.cancel(&submission_watch_key(sid)).await?;
        table.destroy().await?;

        info!(
            %sid,
            score,
            results = record.results.len(),
            errors = record.errors.len(),
            "submission completed"
        );
        Ok(())
    }
}

#[async_trait]
impl Worker for SubmissionDispatcher {
    fn name(&self) -> &'static str {
        "submission-dispatcher"
    }

    async fn handle_one(&self) -> Result<bool> {
        match self.submission_queue.pop(POP_TIMEOUT).await? {
            Some(message) => {
                self.handle(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
