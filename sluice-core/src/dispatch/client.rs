//! The interface analyzer workers drive.
//!
//! Workers pull tasks off their service queue and report back through this
//! client, which persists the outcome, keeps the dispatch table honest, and
//! re-queues the file so the dispatcher can advance its schedule. Extracted
//! children enter the pipeline here, bounded by the submission's depth and
//! count budgets.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use sluice_model::{
    ErrorCategory, FileTask, ServiceError, ServiceResult, ServiceTask,
    SubmissionRecord, build_error_key, build_result_key,
};

use super::{DispatchTable, error_table, submission_lock_key};
use crate::broker::{
    Broker, FILE_DISPATCH_QUEUE, HashTable, NamedQueue, service_queue_name,
};
use crate::error::Result;
use crate::locks::KeyedLock;

#[derive(Clone)]
pub struct DispatchClient {
    volatile: Arc<dyn Broker>,
    persistent: Arc<dyn Broker>,
    submissions: HashTable<SubmissionRecord>,
    results: HashTable<ServiceResult>,
    file_queue: NamedQueue<FileTask>,
}

impl std::fmt::Debug for DispatchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchClient").finish_non_exhaustive()
    }
}

impl DispatchClient {
    pub fn new(
        volatile: Arc<dyn Broker>,
        persistent: Arc<dyn Broker>,
    ) -> Self {
        DispatchClient {
            submissions: HashTable::new(
                persistent.clone(),
                super::SUBMISSION_TABLE,
            ),
            results: HashTable::new(persistent.clone(), super::RESULT_TABLE),
            file_queue: NamedQueue::new(
                persistent.clone(),
                FILE_DISPATCH_QUEUE,
            ),
            volatile,
            persistent,
        }
    }

    /// Block up to `timeout` for the next task on a service's queue.
    pub async fn request_work(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<Option<ServiceTask>> {
        NamedQueue::<ServiceTask>::new(
            self.volatile.clone(),
            service_queue_name(service),
        )
        .pop(timeout)
        .await
    }

    /// Record a successful service run.
    ///
    /// Persists the result, admits extracted children within the
    /// submission's budgets, resolves the dispatch-table cell, and pushes
    /// the file back through the dispatcher.
    pub async fn service_finished(
        &self,
        task: &ServiceTask,
        result: ServiceResult,
    ) -> Result<()> {
        let sid = task.sid;
        let result_key = build_result_key(
            &task.sha256,
            &task.service_name,
            &task.service_config,
        );
        self.results.set(&result_key, &result).await?;

        let Some(record) = self.submissions.get(&sid.to_string()).await?
        else {
            warn!(%sid, "result for unknown submission dropped");
            return Ok(());
        };

        let _lock =
            KeyedLock::acquire(self.persistent.clone(), &submission_lock_key(sid))
                .await?;
        let table = DispatchTable::open(self.persistent.clone(), sid);
        let errors = error_table(self.persistent.clone(), sid);

        let child_depth = task.depth + 1;
        for child in &result.extracted {
            let rejection = if child_depth
                >= record.params.max_extraction_depth
            {
                Some("max extraction depth exceeded")
            } else if !table
                .reserve_extraction_slot(record.params.max_extracted)
                .await?
            {
                Some("too many extracted files")
            } else {
                None
            };

            if let Some(message) = rejection {
                debug!(%sid, child = %child.sha256, message, "child rejected");
                let error = ServiceError {
                    sid,
                    sha256: task.sha256.clone(),
                    service_name: task.service_name.clone(),
                    category: ErrorCategory::Terminal,
                    message: message.to_string(),
                };
                let error_key =
                    build_error_key(&task.sha256, &task.service_name);
                errors.set(&error_key, &error).await?;
                table.add_extraction_error(&error_key).await?;
                continue;
            }

            let child_task = FileTask {
                sid,
                sha256: child.sha256.clone(),
                file_type: if child.file_type.is_empty() {
                    "unknown".to_string()
                } else {
                    child.file_type.clone()
                },
                depth: child_depth,
            };
            if table.register_file(&child_task).await? {
                self.file_queue.push(&child_task).await?;
            }
        }

        table
            .finish(
                &task.sha256,
                &task.service_name,
                result_key,
                false,
                result.drop_file,
            )
            .await?;
        self.file_queue.push(&task.file_task()).await
    }

    /// Record a failed service run.
    ///
    /// Terminal categories resolve the cell with the error key; timeouts
    /// and crashes only clear the in-flight stamp so the next file task
    /// re-dispatches, with the failure counted toward the service's limit.
    pub async fn service_failed(
        &self,
        task: &ServiceTask,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Result<()> {
        let sid = task.sid;
        let error = ServiceError {
            sid,
            sha256: task.sha256.clone(),
            service_name: task.service_name.clone(),
            category,
            message: message.into(),
        };
        let error_key = build_error_key(&task.sha256, &task.service_name);
        let _lock =
            KeyedLock::acquire(self.persistent.clone(), &submission_lock_key(sid))
                .await?;
        error_table(self.persistent.clone(), sid)
            .set(&error_key, &error)
            .await?;

        let table = DispatchTable::open(self.persistent.clone(), sid);
        if category.is_terminal() {
            table
                .finish(
                    &task.sha256,
                    &task.service_name,
                    error_key,
                    true,
                    false,
                )
                .await?;
        } else {
            table.clear_dispatch(&task.sha256, &task.service_name).await?;
        }
        self.file_queue.push(&task.file_task()).await
    }
}
