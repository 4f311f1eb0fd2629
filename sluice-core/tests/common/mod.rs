//! Shared harness for the integrated-core tests: every component running as
//! a worker pool over one in-memory broker, plus a mock analyzer fleet that
//! reads its instructions from the file body.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

use sluice_config::CoreConfig;
use sluice_core::broker::{
    Broker, HashTable, INGEST_QUEUE, MemoryBroker, NamedQueue,
    notification_queue_name, service_queue_name,
};
use sluice_core::dispatch::{
    DispatchClient, FileDispatcher, SUBMISSION_TABLE, SubmissionDispatcher,
};
use sluice_core::ingest::{
    CompletionLoop, DropLoop, IngestLoop, Ingester, RetryLoop, Submitter,
};
use sluice_core::plumber::Plumber;
use sluice_core::registry::{ServiceDef, StageRegistry};
use sluice_core::runtime::{Supervisor, Worker};
use sluice_core::watcher::WatcherServer;
use sluice_core::{CoreError, Result};
use sluice_model::{
    ErrorCategory, ExtractedFile, FileEntry, IngestTask, Notification,
    ServiceError, ServiceResult, Sha256, Sid, SubmissionParams,
    SubmissionRecord, SubmissionRequest,
};

pub const SERVICES: [&str; 4] = ["pre", "core-a", "core-b", "finish"];

/// Stand-in for the external byte store: the pipeline itself only ever
/// sees digests.
#[derive(Debug, Default)]
pub struct Filestore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl Filestore {
    pub fn put(&self, sha256: &Sha256, body: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap()
            .insert(sha256.as_str().to_string(), body);
    }

    pub fn get(&self, sha256: &Sha256) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(sha256.as_str()).cloned()
    }
}

/// Replaces everything past the dispatcher: pops its service queue and
/// follows the instructions embedded in the file body under its own name.
pub struct MockAnalyzer {
    pub service: String,
    client: DispatchClient,
    filestore: Arc<Filestore>,
    pub hits: DashMap<String, u64>,
    pub drops: DashMap<String, u64>,
    gate: Arc<Notify>,
}

#[async_trait]
impl Worker for MockAnalyzer {
    fn name(&self) -> &'static str {
        "mock-analyzer"
    }

    async fn handle_one(&self) -> Result<bool> {
        let Some(task) = self
            .client
            .request_work(&self.service, Duration::from_millis(100))
            .await?
        else {
            return Ok(false);
        };

        let sha = task.sha256.as_str().to_string();
        let hits = {
            let mut entry = self.hits.entry(sha.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let body = self.filestore.get(&task.sha256).unwrap_or_default();
        let doc: serde_json::Value =
            serde_json::from_slice(&body).unwrap_or_default();
        let instructions = doc
            .get(&self.service)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        if instructions.get("semaphore").is_some() {
            // Park until the test opens the gate; the task is neither
            // finished nor failed, exactly like a hung analyzer.
            self.gate.notified().await;
            return Ok(true);
        }

        if let Some(n) = instructions.get("drop").and_then(|v| v.as_u64()) {
            if n >= hits {
                *self.drops.entry(sha).or_insert(0) += 1;
                return Ok(true);
            }
        }

        if instructions
            .get("failure")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            let message = instructions
                .get("error_message")
                .and_then(|v| v.as_str())
                .unwrap_or("mock analyzer failure");
            self.client
                .service_failed(&task, ErrorCategory::Terminal, message)
                .await?;
            return Ok(true);
        }

        let result_spec = instructions
            .get("result")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let mut extracted = Vec::new();
        if let Some(children) =
            instructions.get("extracted").and_then(|v| v.as_array())
        {
            for child in children {
                let Some(hex) = child.as_str() else { continue };
                let sha256 = Sha256::parse(hex)
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
                let size = self
                    .filestore
                    .get(&sha256)
                    .map(|body| body.len() as u64)
                    .unwrap_or(0);
                extracted.push(ExtractedFile {
                    sha256,
                    name: hex.to_string(),
                    file_type: "unknown".to_string(),
                    size,
                });
            }
        }

        let result = ServiceResult {
            sha256: task.sha256.clone(),
            service_name: self.service.clone(),
            score: result_spec
                .get("score")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            drop_file: result_spec
                .get("drop_file")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            extracted,
        };
        self.client.service_finished(&task, result).await?;
        Ok(true)
    }
}

/// The integrated core: every worker pool over one shared memory broker.
pub struct Harness {
    pub broker: Arc<dyn Broker>,
    pub caps: Arc<StageRegistry>,
    pub ingester: Arc<Ingester>,
    pub filestore: Arc<Filestore>,
    pub analyzers: HashMap<String, Arc<MockAnalyzer>>,
    pub gate: Arc<Notify>,
    supervisor: Supervisor,
}

impl Harness {
    pub async fn start() -> Harness {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let mut config = CoreConfig::default();
        // Compressed timings so recovery paths complete within seconds.
        config.submission.max_time_seconds = 1;
        config.watcher.poll_interval_ms = 50;
        config.dispatcher.service_timeout_seconds = 1;
        config.dispatcher.service_failure_limit = 1;
        let config = Arc::new(config);

        let caps = Arc::new(StageRegistry::new(
            vec!["pre".into(), "core".into(), "post".into()],
            vec![
                service_def("pre", "pre"),
                service_def("core-a", "core"),
                service_def("core-b", "core"),
                service_def("finish", "post"),
            ],
        ));

        let ingester = Arc::new(Ingester::new(
            config.clone(),
            caps.clone(),
            broker.clone(),
            broker.clone(),
        ));
        let submitter = Arc::new(Submitter::new(
            config.clone(),
            ingester.clone(),
            broker.clone(),
        ));
        let file_dispatcher = Arc::new(FileDispatcher::new(
            config.clone(),
            caps.clone(),
            broker.clone(),
            broker.clone(),
        ));
        let submission_dispatcher = Arc::new(SubmissionDispatcher::new(
            config.clone(),
            caps.clone(),
            broker.clone(),
            broker.clone(),
        ));
        let watcher = Arc::new(WatcherServer::new(
            broker.clone(),
            Duration::from_millis(config.watcher.poll_interval_ms),
        ));
        let client = DispatchClient::new(broker.clone(), broker.clone());
        let plumber = Arc::new(Plumber::new(
            caps.clone(),
            client.clone(),
            Duration::from_millis(100),
        ));

        let filestore = Arc::new(Filestore::default());
        let gate = Arc::new(Notify::new());

        let mut supervisor = Supervisor::new();
        supervisor.spawn(Arc::new(IngestLoop::new(ingester.clone())), 2);
        supervisor.spawn(Arc::new(CompletionLoop::new(ingester.clone())), 1);
        supervisor.spawn(Arc::new(RetryLoop::new(ingester.clone())), 1);
        supervisor.spawn(Arc::new(DropLoop::new(ingester.clone())), 1);
        supervisor.spawn(submitter, 1);
        supervisor.spawn(file_dispatcher, 2);
        supervisor.spawn(submission_dispatcher, 1);
        supervisor.spawn(watcher, 1);
        supervisor.spawn(plumber, 1);

        let mut analyzers = HashMap::new();
        for service in SERVICES {
            let analyzer = Arc::new(MockAnalyzer {
                service: service.to_string(),
                client: client.clone(),
                filestore: filestore.clone(),
                hits: DashMap::new(),
                drops: DashMap::new(),
                gate: gate.clone(),
            });
            supervisor.spawn(analyzer.clone(), 1);
            analyzers.insert(service.to_string(), analyzer);
        }

        Harness {
            broker,
            caps,
            ingester,
            filestore,
            analyzers,
            gate,
            supervisor,
        }
    }

    pub async fn shutdown(self) {
        // Unblock any analyzer parked on the gate first.
        self.gate.notify_waiters();
        self.supervisor.shutdown().await;
    }

    /// Store a body whose JSON content doubles as analyzer instructions.
    pub fn ready_body(&self, extra: serde_json::Value) -> (Sha256, u64) {
        let mut doc = serde_json::json!({
            "salt": Uuid::new_v4().to_string(),
        });
        if let (Some(doc), Some(extra)) =
            (doc.as_object_mut(), extra.as_object())
        {
            for (key, value) in extra {
                doc.insert(key.clone(), value.clone());
            }
        }
        let body = serde_json::to_vec(&doc).unwrap();
        let sha256 = Sha256::of_bytes(&body);
        let size = body.len() as u64;
        self.filestore.put(&sha256, body);
        (sha256, size)
    }

    /// A body instructing `pre` to extract the given children.
    pub fn ready_extract(&self, children: &[Sha256]) -> (Sha256, u64) {
        let hexes: Vec<String> = children
            .iter()
            .map(|sha| sha.as_str().to_string())
            .collect();
        self.ready_body(serde_json::json!({
            "pre": { "extracted": hexes }
        }))
    }

    pub async fn submit(
        &self,
        sha256: &Sha256,
        size: u64,
        queue: &str,
        configure: impl FnOnce(&mut SubmissionParams),
    ) {
        let mut params = SubmissionParams::new("user");
        configure(&mut params);
        let request = SubmissionRequest {
            files: vec![FileEntry {
                sha256: sha256.clone(),
                size,
                name: "abc123".to_string(),
                file_type: "unknown".to_string(),
            }],
            params,
            metadata: BTreeMap::new(),
            notification: Some(Notification {
                queue: queue.to_string(),
                threshold: Some(0),
            }),
            ingest_time: Utc::now(),
        };
        NamedQueue::<SubmissionRequest>::new(
            self.broker.clone(),
            INGEST_QUEUE,
        )
        .push(&request)
        .await
        .unwrap();
    }

    pub async fn pop_notification(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Option<IngestTask> {
        NamedQueue::<IngestTask>::new(
            self.broker.clone(),
            notification_queue_name(queue),
        )
        .pop(timeout)
        .await
        .unwrap()
    }

    pub async fn submission(&self, sid: Sid) -> SubmissionRecord {
        HashTable::<SubmissionRecord>::new(
            self.broker.clone(),
            SUBMISSION_TABLE,
        )
        .get(&sid.to_string())
        .await
        .unwrap()
        .expect("submission record")
    }

    pub async fn error_record(
        &self,
        sid: Sid,
        error_key: &str,
    ) -> Option<ServiceError> {
        HashTable::<ServiceError>::new(
            self.broker.clone(),
            format!("errors-{sid}"),
        )
        .get(error_key)
        .await
        .unwrap()
    }

    pub async fn service_queue_length(&self, service: &str) -> u64 {
        self.broker
            .queue_length(&service_queue_name(service))
            .await
            .unwrap()
    }

    pub fn hits(&self, service: &str, sha256: &Sha256) -> u64 {
        self.analyzers[service]
            .hits
            .get(sha256.as_str())
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn drops(&self, service: &str, sha256: &Sha256) -> u64 {
        self.analyzers[service]
            .drops
            .get(sha256.as_str())
            .map(|v| *v)
            .unwrap_or(0)
    }
}

fn service_def(name: &str, stage: &str) -> ServiceDef {
    ServiceDef {
        name: name.to_string(),
        stage: stage.to_string(),
        timeout: None,
        failure_limit: None,
        enabled: true,
    }
}
