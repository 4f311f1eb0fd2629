//! Consumes the unique priority queue: highest priority first, FIFO within
//! a priority. Each task either becomes a new submission or folds onto the
//! one already in flight for its scan key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sluice_config::CoreConfig;
use tracing::{debug, warn};

use sluice_model::{
    FileTask, IngestTask, ScanKey, Sid, SubmissionRecord, SubmissionState,
};

use super::Ingester;
use crate::broker::{
    Broker, FILE_DISPATCH_QUEUE, HashTable, NamedQueue, SUBMISSION_QUEUE,
    duplicate_queue_name,
};
use crate::dispatch::{SubmissionMessage, submission_watch_key};
use crate::error::Result;
use crate::locks::KeyedLock;
use crate::runtime::Worker;
use crate::watcher::WatcherClient;

const POP_TIMEOUT: Duration = Duration::from_millis(250);

pub struct Submitter {
    config: Arc<CoreConfig>,
    ingester: Arc<Ingester>,
    submissions: HashTable<SubmissionRecord>,
    file_queue: NamedQueue<FileTask>,
    watcher: WatcherClient,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter").finish_non_exhaustive()
    }
}

impl Submitter {
    pub fn new(
        config: Arc<CoreConfig>,
        ingester: Arc<Ingester>,
        persistent: Arc<dyn Broker>,
    ) -> Self {
        Submitter {
            submissions: HashTable::new(
                persistent.clone(),
                crate::dispatch::SUBMISSION_TABLE,
            ),
            file_queue: NamedQueue::new(
                persistent.clone(),
                FILE_DISPATCH_QUEUE,
            ),
            watcher: WatcherClient::new(persistent),
            config,
            ingester,
        }
    }

    /// Promote one unique-queue task to a submission, or fold it.
    ///
    /// The scanning-table insert decides, under the scan-key lock: the
    /// first writer owns the submission, every later arrival for the same
    /// key lands on the duplicate queue until completion drains it.
    pub async fn submit(
        &self,
        task: &mut IngestTask,
        scan_key: &ScanKey,
    ) -> Result<()> {
        {
            let _lock = KeyedLock::acquire(
                self.ingester.persistent().clone(),
                scan_key.as_str(),
            )
            .await?;
            if !self
                .ingester
                .scanning()
                .add(scan_key.as_str(), task)
                .await?
            {
                debug!(scan_key = %scan_key, "folding duplicate submission");
                self.ingester.counters().increment("ingest.duplicates");
                NamedQueue::<IngestTask>::new(
                    self.ingester.persistent().clone(),
                    duplicate_queue_name(scan_key.as_str()),
                )
                .push(task)
                .await?;
                return Ok(());
            }
        }

        let Some(root) = task.root().cloned() else {
            warn!("unique-queue task without files discarded");
            return Ok(());
        };

        let sid = Sid::new();
        let record = SubmissionRecord {
            sid,
            scan_key: scan_key.clone(),
            files: task.request.files.clone(),
            params: task.request.params.clone(),
            metadata: task.request.metadata.clone(),
            notification: task.request.notification.clone(),
            results: Vec::new(),
            errors: Vec::new(),
            state: SubmissionState::Submitted,
            score: None,
            submitted_at: Utc::now(),
            completed_at: None,
        };
        self.submissions.set(&sid.to_string(), &record).await?;

        self.file_queue
            .push(&FileTask {
                sid,
                sha256: root.sha256.clone(),
                file_type: root.file_type.clone(),
                depth: 0,
            })
            .await?;

        self.watcher
            .touch(
                &submission_watch_key(sid),
                Duration::from_secs(self.config.submission.max_time_seconds),
                SUBMISSION_QUEUE,
                &SubmissionMessage { sid },
            )
            .await?;

        debug!(%sid, scan_key = %scan_key, "submission created");
        Ok(())
    }
}

#[async_trait]
impl Worker for Submitter {
    fn name(&self) -> &'static str {
        "submitter"
    }

    async fn handle_one(&self) -> Result<bool> {
        let Some(mut task) =
            self.ingester.unique_queue().pop(POP_TIMEOUT).await?
        else {
            return Ok(false);
        };

        let Some(scan_key) = task.stamp_scan_key() else {
            warn!("unique-queue task without files discarded");
            return Ok(true);
        };

        if let Err(err) = self.submit(&mut task, &scan_key).await {
            self.ingester.retry(task, Some(scan_key), &err).await?;
        }
        Ok(true)
    }
}
