//! The integrated core running in one process: ingest through dispatch to
//! completion, against a mock analyzer fleet {pre, core-a, core-b, finish}
//! whose behavior is scripted in the file bodies.

mod common;

use std::time::Duration;

use common::Harness;
use sluice_model::Sid;

const NOTIFY_WAIT: Duration = Duration::from_secs(20);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deduplication_folds_identical_submissions() {
    let harness = Harness::start().await;
    let (sha, size) = harness.ready_body(serde_json::json!({}));

    for _ in 0..2 {
        harness.submit(&sha, size, "dedupe", |_| {}).await;
    }

    let first = harness
        .pop_notification("dedupe", NOTIFY_WAIT)
        .await
        .expect("first notification");
    let second = harness
        .pop_notification("dedupe", NOTIFY_WAIT)
        .await
        .expect("second notification");

    let first_sid = first.sid.expect("sid on notification");
    assert_eq!(second.sid, Some(first_sid));

    let record = harness.submission(first_sid).await;
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.results.len(), 4);
    assert_eq!(record.errors.len(), 0);

    // Changing a parameter that shapes analyzer output misses the cache
    // and produces a fresh submission.
    harness
        .submit(&sha, size, "dedupe-2", |params| {
            params.max_extracted = 10_000;
        })
        .await;
    let third = harness
        .pop_notification("dedupe-2", NOTIFY_WAIT)
        .await
        .expect("third notification");
    let third_sid = third.sid.expect("sid on notification");
    assert_ne!(third_sid, first_sid);

    let record = harness.submission(third_sid).await;
    assert_eq!(record.results.len(), 4);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watcher_recovers_a_dropped_task() {
    let harness = Harness::start().await;
    let (sha, size) = harness.ready_body(serde_json::json!({
        "pre": { "drop": 1 }
    }));

    harness.submit(&sha, size, "recover", |_| {}).await;

    let task = harness
        .pop_notification("recover", NOTIFY_WAIT)
        .await
        .expect("notification after recovery");
    let record = harness.submission(task.sid.unwrap()).await;
    assert_eq!(record.results.len(), 4);
    assert_eq!(record.errors.len(), 0);
    assert_eq!(harness.drops("pre", &sha), 1);
    assert_eq!(harness.hits("pre", &sha), 2);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_exceeding_retry_limit_fails_terminally() {
    let harness = Harness::start().await;
    let (sha, size) = harness.ready_body(serde_json::json!({
        "pre": { "drop": 3 }
    }));

    harness.submit(&sha, size, "retry-limit", |_| {}).await;

    let task = harness
        .pop_notification("retry-limit", NOTIFY_WAIT)
        .await
        .expect("notification after giving up");
    let record = harness.submission(task.sid.unwrap()).await;
    assert_eq!(record.results.len(), 3);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(harness.drops("pre", &sha), 3);
    assert_eq!(harness.hits("pre", &sha), 3);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drop_file_short_circuits_later_stages() {
    let harness = Harness::start().await;
    let (sha, size) = harness.ready_body(serde_json::json!({
        "pre": { "result": { "drop_file": true } }
    }));

    harness.submit(&sha, size, "drop-early", |_| {}).await;

    let task = harness
        .pop_notification("drop-early", NOTIFY_WAIT)
        .await
        .expect("notification");
    let record = harness.submission(task.sid.unwrap()).await;
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.results.len(), 1);
    assert_eq!(record.errors.len(), 0);
    assert_eq!(harness.hits("core-a", &sha), 0);
    assert_eq!(harness.hits("finish", &sha), 0);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminal_service_error_is_recorded() {
    let harness = Harness::start().await;
    let (sha, size) = harness.ready_body(serde_json::json!({
        "core-a": { "failure": true, "error_message": "words" }
    }));

    harness.submit(&sha, size, "svc-error", |_| {}).await;

    let task = harness
        .pop_notification("svc-error", NOTIFY_WAIT)
        .await
        .expect("notification");
    let record = harness.submission(task.sid.unwrap()).await;
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.results.len(), 3);
    assert_eq!(record.errors.len(), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn extracted_children_run_the_full_schedule() {
    let harness = Harness::start().await;
    let (child, _) = harness.ready_body(serde_json::json!({}));
    let (sha, size) = harness.ready_extract(std::slice::from_ref(&child));

    harness.submit(&sha, size, "extracted", |_| {}).await;

    let task = harness
        .pop_notification("extracted", NOTIFY_WAIT)
        .await
        .expect("notification");
    let record = harness.submission(task.sid.unwrap()).await;
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.results.len(), 8);
    assert_eq!(record.errors.len(), 0);
    assert_eq!(harness.hits("finish", &child), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn extraction_depth_is_bounded() {
    let harness = Harness::start().await;
    let max_depth = 3;

    // A chain one deeper than the limit; the innermost links never run.
    let (mut sha, mut size) = harness.ready_body(serde_json::json!({}));
    for _ in 0..(max_depth + 1) {
        let wrapped = harness.ready_extract(std::slice::from_ref(&sha));
        sha = wrapped.0;
        size = wrapped.1;
    }

    harness
        .submit(&sha, size, "depth-limit", |params| {
            params.max_extraction_depth = max_depth;
            params.max_extracted = max_depth + 10;
        })
        .await;

    let task = harness
        .pop_notification("depth-limit", NOTIFY_WAIT)
        .await
        .expect("notification");
    let record = harness.submission(task.sid.unwrap()).await;
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.results.len(), (4 * max_depth) as usize);
    assert_eq!(record.errors.len(), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn extraction_count_is_bounded() {
    let harness = Harness::start().await;
    let children: Vec<_> = (0..5)
        .map(|_| harness.ready_body(serde_json::json!({})).0)
        .collect();
    let (sha, size) = harness.ready_extract(&children);

    harness
        .submit(&sha, size, "max-extracted", |params| {
            params.max_extracted = 3;
        })
        .await;

    let task = harness
        .pop_notification("max-extracted", NOTIFY_WAIT)
        .await
        .expect("notification");
    let record = harness.submission(task.sid.unwrap()).await;
    assert_eq!(record.files.len(), 1);
    // The parent plus three admitted children run all four services; the
    // two surplus children each record one error.
    assert_eq!(record.results.len(), 4 * (1 + 3));
    assert_eq!(record.errors.len(), 2);

    harness.shutdown().await;
}

/// Submit the body once and report (sid, cache_miss, cache_hit_local,
/// cache_hit) deltas for the run.
async fn cached_run(
    harness: &Harness,
    sha: &sluice_model::Sha256,
    size: u64,
    queue: &str,
) -> (Sid, u64, u64, u64) {
    let counters = harness.ingester.counters();
    let before = counters.snapshot();
    harness.submit(sha, size, queue, |_| {}).await;
    let task = harness
        .pop_notification(queue, NOTIFY_WAIT)
        .await
        .expect("notification");
    let after = counters.snapshot();
    let delta = |name: &str| {
        after.get(name).copied().unwrap_or(0)
            - before.get(name).copied().unwrap_or(0)
    };
    (
        task.sid.expect("sid"),
        delta("ingest.cache_miss"),
        delta("ingest.cache_hit_local"),
        delta("ingest.cache_hit"),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_tiers_serve_repeat_submissions() {
    let harness = Harness::start().await;
    let (sha, size) = harness.ready_body(serde_json::json!({}));

    let (sid1, miss, local, remote) =
        cached_run(&harness, &sha, size, "cache-1").await;
    assert_eq!((miss, local, remote), (1, 0, 0));
    let record = harness.submission(sid1).await;
    assert_eq!(record.results.len(), 4);

    let (sid2, miss, local, remote) =
        cached_run(&harness, &sha, size, "cache-2").await;
    assert_eq!((miss, local, remote), (0, 1, 0));
    assert_eq!(sid2, sid1);

    harness.ingester.clear_local_cache();

    let (sid3, miss, local, remote) =
        cached_run(&harness, &sha, size, "cache-3").await;
    assert_eq!((miss, local, remote), (0, 0, 1));
    assert_eq!(sid3, sid1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn plumber_clears_disabled_service_queue() {
    let harness = Harness::start().await;
    let (sha, size) = harness.ready_body(serde_json::json!({
        "pre": { "semaphore": true }
    }));

    harness.submit(&sha, size, "plumber", |_| {}).await;

    // The analyzer grabs the first task and parks; wait for the timeout
    // redispatch to land a second copy on the queue, then disable the
    // service so the plumber clears it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while harness.service_queue_length("pre").await == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no queued task appeared for pre"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    harness.caps.set_enabled("pre", false);

    let task = harness
        .pop_notification("plumber", NOTIFY_WAIT)
        .await
        .expect("notification");
    let sid: Sid = task.sid.unwrap();
    let record = harness.submission(sid).await;
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.results.len(), 3);
    assert_eq!(record.errors.len(), 1);

    let error = harness
        .error_record(sid, &record.errors[0])
        .await
        .expect("error record");
    assert!(error.message.contains("disabled"));

    harness.caps.set_enabled("pre", true);
    harness.shutdown().await;
}
