//! Schedule-walk behavior of the file dispatcher over an in-memory broker:
//! population of the dispatch table, idempotent redelivery, timeout
//! redispatch, advancement on prior results, and error-based resolution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use sluice_config::CoreConfig;
use sluice_core::broker::{
    Broker, MemoryBroker, HashTable, service_queue_name,
};
use sluice_core::capabilities::{Capabilities, Schedule};
use sluice_core::dispatch::{
    DispatchTable, FileDispatcher, RESULT_TABLE, SUBMISSION_TABLE,
    SubmissionMessage,
};
use sluice_model::{
    ErrorCategory, FileEntry, FileTask, ScanKey, ServiceError,
    ServiceResult, Sha256, Sid, SubmissionParams, SubmissionRecord,
    SubmissionState, build_error_key, build_result_key,
};

struct FixedCaps;

impl Capabilities for FixedCaps {
    fn services(&self) -> Vec<String> {
        ["extract", "wrench", "av-a", "av-b", "frankenstrings", "xerox"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn build_schedule(
        &self,
        _record: &SubmissionRecord,
        _file_type: &str,
    ) -> Schedule {
        vec![
            vec!["extract".to_string(), "wrench".to_string()],
            vec![
                "av-a".to_string(),
                "av-b".to_string(),
                "frankenstrings".to_string(),
            ],
            vec!["xerox".to_string()],
        ]
    }

    fn service_timeout(&self, _service: &str) -> Option<Duration> {
        Some(Duration::from_secs(600))
    }

    fn service_failure_limit(&self, _service: &str) -> Option<u32> {
        Some(4)
    }
}

struct Fixture {
    broker: Arc<dyn Broker>,
    dispatcher: FileDispatcher,
    sid: Sid,
    sha256: Sha256,
}

impl Fixture {
    async fn new() -> Self {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let config = Arc::new(CoreConfig::default());
        let dispatcher = FileDispatcher::new(
            config,
            Arc::new(FixedCaps),
            broker.clone(),
            broker.clone(),
        );

        let sid = Sid::new();
        let sha256 = Sha256::of_bytes(b"totally a legit file");
        let params = SubmissionParams::new("user");
        let scan_key: ScanKey = params.scan_key(&sha256);
        let record = SubmissionRecord {
            sid,
            scan_key,
            files: vec![FileEntry {
                sha256: sha256.clone(),
                size: 64,
                name: "legit".to_string(),
                file_type: "unknown".to_string(),
            }],
            params,
            metadata: BTreeMap::new(),
            notification: None,
            results: Vec::new(),
            errors: Vec::new(),
            state: SubmissionState::Submitted,
            score: None,
            submitted_at: Utc::now(),
            completed_at: None,
        };
        HashTable::<SubmissionRecord>::new(broker.clone(), SUBMISSION_TABLE)
            .set(&sid.to_string(), &record)
            .await
            .unwrap();

        Fixture {
            broker,
            dispatcher,
            sid,
            sha256,
        }
    }

    fn task(&self) -> FileTask {
        FileTask {
            sid: self.sid,
            sha256: self.sha256.clone(),
            file_type: "unknown".to_string(),
            depth: 0,
        }
    }

    fn table(&self) -> DispatchTable {
        DispatchTable::open(self.broker.clone(), self.sid)
    }

    fn errors(&self) -> HashTable<ServiceError> {
        HashTable::new(self.broker.clone(), format!("errors-{}", self.sid))
    }

    async fn queue_len(&self, service: &str) -> u64 {
        self.broker
            .queue_length(&service_queue_name(service))
            .await
            .unwrap()
    }

    async fn flush_queue(&self, service: &str) {
        self.broker
            .queue_delete(&service_queue_name(service))
            .await
            .unwrap();
    }

    fn error(&self, service: &str, category: ErrorCategory) -> ServiceError {
        ServiceError {
            sid: self.sid,
            sha256: self.sha256.clone(),
            service_name: service.to_string(),
            category,
            message: "analyzer says no".to_string(),
        }
    }
}

#[tokio::test]
async fn dispatcher_drives_schedule_to_completion() {
    let fx = Fixture::new().await;
    let table = fx.table();

    // First delivery dispatches the whole first stage.
    fx.dispatcher.handle(fx.task()).await.unwrap();
    assert!(table
        .dispatch_time(&fx.sha256, "extract")
        .await
        .unwrap()
        .is_some());
    assert!(table
        .dispatch_time(&fx.sha256, "wrench")
        .await
        .unwrap()
        .is_some());
    assert_eq!(fx.queue_len("extract").await, 1);
    assert_eq!(fx.queue_len("wrench").await, 1);
    assert_eq!(fx.queue_len("av-a").await, 0);

    // Redelivery while both dispatches are fresh changes nothing.
    fx.dispatcher.handle(fx.task()).await.unwrap();
    assert_eq!(fx.queue_len("extract").await, 1);
    assert_eq!(fx.queue_len("wrench").await, 1);

    // Back-dating the extract dispatch simulates a timeout; only extract
    // goes out again.
    fx.flush_queue("extract").await;
    fx.flush_queue("wrench").await;
    table.dispatch_at(&fx.sha256, "extract", 0).await.unwrap();

    fx.dispatcher.handle(fx.task()).await.unwrap();
    assert_eq!(fx.queue_len("extract").await, 1);
    assert_eq!(fx.queue_len("wrench").await, 0);

    // Finish extract in the table and give wrench a stored result; the
    // walk advances to the second stage.
    fx.flush_queue("extract").await;
    table
        .finish(&fx.sha256, "extract", "extract-result", false, false)
        .await
        .unwrap();
    let wrench_key = build_result_key(
        &fx.sha256,
        "wrench",
        &serde_json::json!({}),
    );
    HashTable::<ServiceResult>::new(fx.broker.clone(), RESULT_TABLE)
        .set(
            &wrench_key,
            &ServiceResult {
                sha256: fx.sha256.clone(),
                service_name: "wrench".to_string(),
                score: 0,
                drop_file: false,
                extracted: Vec::new(),
            },
        )
        .await
        .unwrap();

    fx.dispatcher.handle(fx.task()).await.unwrap();
    assert!(table.finished(&fx.sha256, "wrench").await.unwrap().is_some());
    assert_eq!(fx.queue_len("av-a").await, 1);
    assert_eq!(fx.queue_len("av-b").await, 1);
    assert_eq!(fx.queue_len("frankenstrings").await, 1);

    // av-a fails terminally, av-b exceeds the crash limit, frankenstrings
    // finishes normally; the third stage dispatches.
    fx.flush_queue("av-a").await;
    fx.flush_queue("av-b").await;
    fx.flush_queue("frankenstrings").await;

    let errors = fx.errors();
    let terminal_key = build_error_key(&fx.sha256, "av-a");
    errors
        .set(&terminal_key, &fx.error("av-a", ErrorCategory::Terminal))
        .await
        .unwrap();
    for _ in 0..5 {
        errors
            .set(
                &build_error_key(&fx.sha256, "av-b"),
                &fx.error("av-b", ErrorCategory::Crash),
            )
            .await
            .unwrap();
    }
    table
        .finish(&fx.sha256, "frankenstrings", "franken-result", false, false)
        .await
        .unwrap();

    fx.dispatcher.handle(fx.task()).await.unwrap();
    let av_a = table.finished(&fx.sha256, "av-a").await.unwrap().unwrap();
    assert!(av_a.is_error);
    assert_eq!(av_a.key, terminal_key);
    let av_b = table.finished(&fx.sha256, "av-b").await.unwrap().unwrap();
    assert!(av_b.is_error);
    assert_eq!(fx.queue_len("xerox").await, 1);

    // Finishing xerox completes the file; exactly one completion message
    // is enqueued, no matter how often the task is redelivered.
    table
        .finish(&fx.sha256, "xerox", "xerox-result", false, false)
        .await
        .unwrap();
    fx.dispatcher.handle(fx.task()).await.unwrap();
    assert_eq!(
        fx.broker.queue_length("submission").await.unwrap(),
        1
    );

    fx.dispatcher.handle(fx.task()).await.unwrap();
    assert_eq!(
        fx.broker.queue_length("submission").await.unwrap(),
        1
    );

    let message: SubmissionMessage = serde_json::from_str(
        &fx.broker
            .queue_pop("submission", Duration::ZERO)
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(message.sid, fx.sid);
}

#[tokio::test]
async fn drop_file_skips_later_stages() {
    let fx = Fixture::new().await;
    let table = fx.table();

    // Stage one finishes with a drop_file result on extract.
    table
        .finish(&fx.sha256, "extract", "extract-result", false, true)
        .await
        .unwrap();
    table
        .finish(&fx.sha256, "wrench", "wrench-result", false, false)
        .await
        .unwrap();

    fx.dispatcher.handle(fx.task()).await.unwrap();

    // No second-stage dispatches, and the submission is complete.
    assert_eq!(fx.queue_len("av-a").await, 0);
    assert_eq!(fx.queue_len("av-b").await, 0);
    assert_eq!(fx.queue_len("frankenstrings").await, 0);
    assert_eq!(fx.broker.queue_length("submission").await.unwrap(), 1);
}
