//! Per-file scheduling: walk the service schedule for one (submission,
//! file) and dispatch whatever the dispatch table says is still owed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sluice_config::CoreConfig;
use tracing::{debug, warn};

use sluice_model::{
    ErrorCategory, FileTask, ServiceError, ServiceResult, ServiceTask,
    Sha256, SubmissionRecord, SubmissionState, build_error_key,
    build_result_key,
};

use super::{
    DispatchTable, SubmissionMessage, error_table, submission_finished,
    submission_lock_key, submission_watch_key,
};
use crate::broker::{
    Broker, FILE_DISPATCH_QUEUE, HashTable, NamedQueue, SUBMISSION_QUEUE,
    service_queue_name,
};
use crate::capabilities::Capabilities;
use crate::error::Result;
use crate::locks::KeyedLock;
use crate::runtime::Worker;
use crate::watcher::WatcherClient;

const POP_TIMEOUT: Duration = Duration::from_millis(250);

/// Consumes `dispatch-file` and drives one file through its schedule.
///
/// Handling is idempotent: redelivering the same task only re-dispatches
/// services whose previous dispatch has timed out.
pub struct FileDispatcher {
    config: Arc<CoreConfig>,
    caps: Arc<dyn Capabilities>,
    persistent: Arc<dyn Broker>,
    volatile: Arc<dyn Broker>,
    watcher: WatcherClient,
    submissions: HashTable<SubmissionRecord>,
    results: HashTable<ServiceResult>,
    file_queue: NamedQueue<FileTask>,
    submission_queue: NamedQueue<SubmissionMessage>,
}

impl std::fmt::Debug for FileDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDispatcher").finish_non_exhaustive()
    }
}

impl FileDispatcher {
    pub fn new(
        config: Arc<CoreConfig>,
        caps: Arc<dyn Capabilities>,
        volatile: Arc<dyn Broker>,
        persistent: Arc<dyn Broker>,
    ) -> Self {
        FileDispatcher {
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
            watcher: WatcherClient::new(persistent.clone()),
            config,
            caps,
            persistent,
            volatile,
        }
    }

    fn service_timeout_ms(&self, service: &str) -> i64 {
        self.caps
            .service_timeout(service)
            .unwrap_or(Duration::from_secs(
                self.config.dispatcher.service_timeout_seconds,
            ))
            .as_millis() as i64
    }

    fn service_failure_limit(&self, service: &str) -> u32 {
        self.caps
            .service_failure_limit(service)
            .unwrap_or(self.config.dispatcher.service_failure_limit)
    }

    /// Handle one file task: refresh the submission watch, resolve whatever
    /// the stores already answer, dispatch the first incomplete stage, and
    /// raise the completion flag when nothing is left anywhere.
    pub async fn handle(&self, task: FileTask) -> Result<()> {
        let sid = task.sid;
        self.watcher
            .touch(
                &submission_watch_key(sid),
                Duration::from_secs(self.config.submission.max_time_seconds),
                SUBMISSION_QUEUE,
                &SubmissionMessage { sid },
            )
            .await?;

        let Some(record) = self.submissions.get(&sid.to_string()).await?
        else {
            warn!(%sid, "file task for unknown submission dropped");
            return Ok(());
        };
        if record.state == SubmissionState::Completed {
            return Ok(());
        }

        let _lock =
            KeyedLock::acquire(self.persistent.clone(), &submission_lock_key(sid))
                .await?;
        let table = DispatchTable::open(self.persistent.clone(), sid);
        table.register_file(&task).await?;

        let schedule = self.caps.build_schedule(&record, &task.file_type);
        let errors = error_table(self.persistent.clone(), sid);

        // Walk stages in order, resolving services that a prior result or a
        // terminal error already answers. Stop at the first stage that still
        // has work, or as soon as a finished result says to drop the file.
        let mut outstanding: Vec<(String, serde_json::Value)> = Vec::new();
        for group in &schedule {
            let mut dropped = false;
            for service in group {
                if let Some(cell) =
                    table.finished(&task.sha256, service).await?
                {
                    dropped |= cell.drop_file;
                    continue;
                }

                let config =
                    self.caps.build_service_config(service, &record);
                let result_key =
                    build_result_key(&task.sha256, service, &config);
                if let Some(result) = self.results.get(&result_key).await? {
                    table
                        .finish(
                            &task.sha256,
                            service,
                            result_key,
                            false,
                            result.drop_file,
                        )
                        .await?;
                    dropped |= result.drop_file;
                    continue;
                }

                if let Some(error_key) =
                    find_terminal_error(&errors, &task.sha256, service)
                        .await?
                {
                    table
                        .finish(&task.sha256, service, error_key, true, false)
                        .await?;
                    continue;
                }

                let failures =
                    count_failures(&errors, &task.sha256, service).await?;
                let limit = self.service_failure_limit(service);
                if failures > limit {
                    let error = ServiceError {
                        sid,
                        sha256: task.sha256.clone(),
                        service_name: service.clone(),
                        category: ErrorCategory::Terminal,
                        message: format!(
                            "service failed {failures} times, limit is {limit}"
                        ),
                    };
                    let error_key = build_error_key(&task.sha256, service);
                    errors.set(&error_key, &error).await?;
                    table
                        .finish(&task.sha256, service, error_key, true, false)
                        .await?;
                    continue;
                }

                outstanding.push((service.clone(), config));
            }

            if !outstanding.is_empty() || dropped {
                break;
            }
        }

        if outstanding.is_empty() {
            if submission_finished(&table, &record, &*self.caps).await?
                && table.mark_completion_sent().await?
            {
                debug!(%sid, "all services finished, flagging completion");
                self.submission_queue
                    .push(&SubmissionMessage { sid })
                    .await?;
            }
            return Ok(());
        }

        let now_ms = Utc::now().timestamp_millis();
        for (service, config) in outstanding {
            match table.dispatch_time(&task.sha256, &service).await? {
                Some(at_ms)
                    if now_ms - at_ms < self.service_timeout_ms(&service) =>
                {
                    // A task is already out for this pair; leave it alone.
                    continue;
                }
                Some(_) => {
                    // The previous dispatch expired. Count it against the
                    // service, then send the work out again.
                    let error = ServiceError {
                        sid,
                        sha256: task.sha256.clone(),
                        service_name: service.clone(),
                        category: ErrorCategory::Timeout,
                        message: "service dispatch timed out".to_string(),
                    };
                    errors
                        .set(&build_error_key(&task.sha256, &service), &error)
                        .await?;
                }
                None => {}
            }

            debug!(%sid, %service, sha256 = %task.sha256, "dispatching");
            let service_task =
                ServiceTask::from_file_task(&task, &service, config);
            NamedQueue::<ServiceTask>::new(
                self.volatile.clone(),
                service_queue_name(&service),
            )
            .push(&service_task)
            .await?;
            table.dispatch(&task.sha256, &service).await?;
        }

        Ok(())
    }
}

async fn find_terminal_error(
    errors: &HashTable<ServiceError>,
    sha256: &Sha256,
    service: &str,
) -> Result<Option<String>> {
    for (key, error) in errors.entries().await? {
        if error.category.is_terminal()
            && error.sha256 == *sha256
            && error.service_name == service
        {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

async fn count_failures(
    errors: &HashTable<ServiceError>,
    sha256: &Sha256,
    service: &str,
) -> Result<u32> {
    let mut count = 0;
    for (_, error) in errors.entries().await? {
        if matches!(
            error.category,
            ErrorCategory::Timeout | ErrorCategory::Crash
        ) && error.sha256 == *sha256
            && error.service_name == service
        {
            count += 1;
        }
    }
    Ok(count)
}

#[async_trait]
impl Worker for FileDispatcher {
    fn name(&self) -> &'static str {
        "file-dispatcher"
    }

    async fn handle_one(&self) -> Result<bool> {
        match self.file_queue.pop(POP_TIMEOUT).await? {
            Some(task) => {
                self.handle(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
