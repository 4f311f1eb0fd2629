//! The ingester: everything between raw submission requests and the unique
//! priority queue, plus the completion side that updates the cache and
//! drains folded duplicates.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use sluice_config::CoreConfig;
use tracing::{debug, error, info, warn};

use sluice_model::{
    AlertMessage, CompletionMessage, FileScoreEntry, IngestTask, ScanKey,
    Sid, SubmissionRequest,
};

use crate::broker::{
    ALERT_QUEUE, Broker, COMPLETE_QUEUE, DROP_QUEUE, DUPLICATE_QUEUE_PREFIX,
    INGEST_QUEUE, HashTable, NamedQueue, PriorityQueue, RETRY_QUEUE,
    SCANNING_TABLE, UNIQUE_QUEUE, duplicate_queue_name,
    notification_queue_name,
};
use crate::cache::{CacheTier, ScoreCache};
use crate::capabilities::Capabilities;
use crate::counters::Counters;
use crate::error::{CoreError, Result};
use crate::locks::KeyedLock;
use crate::runtime::Worker;
use crate::watcher::WatcherClient;

const MIN_PRIORITY: u32 = 1;
const POP_TIMEOUT: Duration = Duration::from_millis(250);

/// Probability of shedding an entry given a queue depth and the sampling
/// threshold for its band: zero at or below the threshold, 0.76 at 1.5x,
/// 0.96 at 2x, approaching one from there.
pub fn drop_chance(length: u64, maximum: u64) -> f64 {
    let maximum = maximum.max(1) as f64;
    ((length as f64 - maximum) / maximum * 2.0).tanh()
}

pub fn must_drop(length: u64, maximum: u64) -> bool {
    rand::random::<f64>() < drop_chance(length, maximum)
}

/// The expanded service selection for a resubmission, or `None` when the
/// current selection already covers everything resubmission would add.
pub fn determine_resubmit_selected(
    selected: &[String],
    resubmit_to: &[String],
) -> Option<Vec<String>> {
    let selected: BTreeSet<&String> = selected.iter().collect();
    let resubmit: BTreeSet<&String> = resubmit_to.iter().collect();
    if resubmit.is_subset(&selected) {
        return None;
    }
    Some(
        selected
            .union(&resubmit)
            .map(|service| (*service).clone())
            .collect(),
    )
}

/// Stochastic resubmission: certain above 400, decaying by a factor of ten
/// per hundred points below that, never below zero.
pub fn should_resubmit(score: i64) -> bool {
    if score < 0 {
        return false;
    }
    if score > 400 {
        return true;
    }
    let probability = 1.0 / 10f64.powf((500 - score) as f64 / 100.0);
    rand::random::<f64>() < probability
}

/// Accepted payloads on the ingest queue: fresh requests from callers, or
/// tasks the pipeline re-queued for retry.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IngestMessage {
    Task(IngestTask),
    Request(SubmissionRequest),
}

/// What the cache said about a scan key.
#[derive(Debug, Default, Clone)]
struct CacheProbe {
    psid: Option<Sid>,
    sid: Option<Sid>,
    score: Option<i64>,
}

pub struct Ingester {
    config: Arc<CoreConfig>,
    caps: Arc<dyn Capabilities>,
    counters: Arc<Counters>,
    persistent: Arc<dyn Broker>,
    cache: ScoreCache,
    whitelisted: DashMap<String, String>,
    user_groups: DashMap<String, Vec<String>>,
    ingest_queue: NamedQueue<IngestTask>,
    unique_queue: PriorityQueue<IngestTask>,
    drop_queue: NamedQueue<IngestTask>,
    retry_queue: NamedQueue<IngestTask>,
    complete_queue: NamedQueue<CompletionMessage>,
    alert_queue: NamedQueue<AlertMessage>,
    scanning: HashTable<IngestTask>,
    watcher: WatcherClient,
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester").finish_non_exhaustive()
    }
}

impl Ingester {
    pub fn new(
        config: Arc<CoreConfig>,
        caps: Arc<dyn Capabilities>,
        volatile: Arc<dyn Broker>,
        persistent: Arc<dyn Broker>,
    ) -> Self {
        Ingester {
            counters: Counters::new("ingester"),
            cache: ScoreCache::new(persistent.clone()),
            whitelisted: DashMap::new(),
            user_groups: DashMap::new(),
            ingest_queue: NamedQueue::new(persistent.clone(), INGEST_QUEUE),
            unique_queue: PriorityQueue::new(
                persistent.clone(),
                UNIQUE_QUEUE,
            ),
            drop_queue: NamedQueue::new(persistent.clone(), DROP_QUEUE),
            retry_queue: NamedQueue::new(persistent.clone(), RETRY_QUEUE),
            complete_queue: NamedQueue::new(volatile.clone(), COMPLETE_QUEUE),
            alert_queue: NamedQueue::new(volatile, ALERT_QUEUE),
            scanning: HashTable::new(persistent.clone(), SCANNING_TABLE),
            watcher: WatcherClient::new(persistent.clone()),
            config,
            caps,
            persistent,
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub(crate) fn scanning(&self) -> &HashTable<IngestTask> {
        &self.scanning
    }

    pub(crate) fn unique_queue(&self) -> &PriorityQueue<IngestTask> {
        &self.unique_queue
    }

    pub(crate) fn persistent(&self) -> &Arc<dyn Broker> {
        &self.persistent
    }

    /// Drop the process-local cache tier. Mostly for tests and operator
    /// tooling; the persistent tier is untouched.
    pub fn clear_local_cache(&self) {
        self.cache.clear_local();
    }

    /// Run one request through intake: validate, deduplicate against the
    /// cache, prioritize, shed, whitelist, and finally admit to the unique
    /// queue.
    pub async fn ingest(&self, mut task: IngestTask) -> Result<()> {
        if task.request.params.groups.is_empty() {
            let submitter = task.request.params.submitter.clone();
            match self.resolve_groups(&submitter).await? {
                Some(groups) => task.request.params.groups = groups,
                None => {
                    let failure =
                        format!("User not found [{submitter}] ingest failed");
                    self.send_notification(&mut task, Some(failure)).await?;
                    return Ok(());
                }
            }
        }

        self.counters
            .increment_by("ingest.bytes_ingested", task.file_size());
        self.counters.increment("ingest.submissions_ingested");

        let Some(root) = task.root().cloned() else {
            self.drop_invalid(task, "No files in submission".to_string())
                .await?;
            return Ok(());
        };
        if !root.sha256.is_valid() {
            self.drop_invalid(task, "Invalid sha256".to_string()).await?;
            return Ok(());
        }
        let classification = task.request.params.classification.clone();
        if !self.caps.valid_classification(&classification) {
            self.drop_invalid(
                task,
                format!("Invalid classification {classification}"),
            )
            .await?;
            return Ok(());
        }

        let max_length = self.config.ingest.max_metadata_length;
        let sha256 = root.sha256.clone();
        task.request.metadata.retain(|key, value| {
            if value.len() > max_length {
                info!(%key, %sha256, "removing oversized metadata value");
                false
            } else {
                true
            }
        });

        let metadata_total: usize = task
            .request
            .metadata
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum();
        if metadata_total > self.config.ingest.max_value_size {
            self.drop_invalid(
                task,
                format!(
                    "Metadata too large ({metadata_total} > {})",
                    self.config.ingest.max_value_size
                ),
            )
            .await?;
            return Ok(());
        }

        let max_file_size = self.config.ingest.max_file_size;
        if root.size > max_file_size
            && !task.request.params.ignore_size
            && !task.request.params.never_drop
        {
            task.failure =
                format!("File too large ({} > {max_file_size})", root.size);
            self.drop_queue.push(&task).await?;
            self.counters.increment("ingest.skipped");
            return Ok(());
        }

        let probe = if task.request.params.ignore_cache {
            CacheProbe::default()
        } else {
            self.check(&mut task).await?
        };

        let priority = self.resolve_priority(&task, probe.score);
        task.priority = Some(priority);
        task.request.params.priority = Some(priority);

        // Folding must come after priority assignment so a resubmission of
        // the folded task is not starved.
        if let Some(sid) = probe.sid {
            self.counters.increment("ingest.duplicates");
            self.finalize(probe.psid, sid, probe.score.unwrap_or(0), &mut task)
                .await?;
            return Ok(());
        }

        if self.should_shed(&mut task).await? {
            return Ok(());
        }
        if self.is_whitelisted(&mut task).await? {
            return Ok(());
        }

        self.unique_queue.push(priority, &task).await
    }

    /// Route a request that failed validation to the drop queue. These are
    /// never retried; the drop worker announces the failure to the caller.
    async fn drop_invalid(
        &self,
        mut task: IngestTask,
        failure: String,
    ) -> Result<()> {
        warn!(
            %failure,
            sha256 = ?task.root_sha256(),
            "rejecting invalid submission"
        );
        task.failure = failure;
        self.drop_queue.push(&task).await?;
        self.counters.increment("ingest.error");
        Ok(())
    }

    async fn resolve_groups(
        &self,
        submitter: &str,
    ) -> Result<Option<Vec<String>>> {
        if let Some(groups) = self.user_groups.get(submitter) {
            return Ok(Some(groups.clone()));
        }
        match self.caps.user_groups(submitter).await? {
            Some(groups) => {
                self.user_groups
                    .insert(submitter.to_string(), groups.clone());
                Ok(Some(groups))
            }
            None => Ok(None),
        }
    }

    fn expired(&self, age_seconds: i64, errors: usize) -> bool {
        let window = if errors > 0 {
            self.config.ingest.incomplete_expire_after_seconds
        } else {
            self.config.ingest.expire_after
        };
        age_seconds >= window as i64
    }

    fn stale(&self, age_seconds: i64, errors: usize) -> bool {
        let window = if errors > 0 {
            self.config.ingest.incomplete_stale_after_seconds
        } else {
            self.config.ingest.stale_after_seconds
        };
        age_seconds >= window as i64
    }

    /// Probe both cache tiers for this task's scan key.
    ///
    /// Expired entries are evicted and treated as misses. Stale entries
    /// surface only their score, which may steer priority but must not fold
    /// the task onto an old submission.
    async fn check(&self, task: &mut IngestTask) -> Result<CacheProbe> {
        let Some(key) = task.stamp_scan_key() else {
            return Ok(CacheProbe::default());
        };

        let Some((entry, tier)) = self.cache.probe(&key).await? else {
            self.counters.increment("ingest.cache_miss");
            return Ok(CacheProbe::default());
        };

        let age_seconds = (Utc::now() - entry.time).num_seconds();
        if self.expired(age_seconds, entry.errors) {
            self.counters.increment("ingest.cache_expired");
            self.cache.evict(&key).await?;
            return Ok(CacheProbe::default());
        }
        if self.stale(age_seconds, entry.errors) {
            self.counters.increment("ingest.cache_stale");
            return Ok(CacheProbe {
                psid: None,
                sid: None,
                score: Some(entry.score),
            });
        }

        self.counters.increment(match tier {
            CacheTier::Local => "ingest.cache_hit_local",
            CacheTier::Remote => "ingest.cache_hit",
        });
        Ok(CacheProbe {
            psid: entry.psid,
            sid: Some(entry.sid),
            score: Some(entry.score),
        })
    }

    fn resolve_priority(
        &self,
        task: &IngestTask,
        cached_score: Option<i64>,
    ) -> u32 {
        let priorities = &self.config.priorities;
        let medium = priorities.value("medium").unwrap_or(200);
        let low = priorities.value("low").unwrap_or(100);

        let mut priority = match task.request.params.priority {
            Some(explicit) => explicit,
            None => match cached_score {
                Some(score) => {
                    let mut resolved = low;
                    for entry in &priorities.score_thresholds {
                        if score >= entry.threshold {
                            resolved =
                                priorities.value(&entry.name).unwrap_or(low);
                            break;
                        }
                    }
                    resolved
                }
                None if self.caps.is_low_priority(task) => low,
                None => medium,
            },
        };

        // Ingests that sat around past the expiry window lose an order of
        // magnitude of urgency.
        let age_seconds =
            (Utc::now() - task.request.ingest_time).num_seconds();
        if priority > 0 && self.expired(age_seconds, 0) {
            priority = (priority / 10).max(1);
        }

        priority
    }

    /// Admission control. Minimum-priority tasks always shed; everything
    /// else samples against its band's unique-queue depth. Oversize and
    /// empty files shed here as a backstop. `never_drop` overrides it all.
    async fn should_shed(&self, task: &mut IngestTask) -> Result<bool> {
        let priority = task.priority.unwrap_or(0);

        let mut dropped = priority <= MIN_PRIORITY;
        if !dropped {
            if let Some((band, (lo, hi))) =
                self.config.priorities.band_of(priority)
            {
                if let Some(&threshold) =
                    self.config.ingest.sampling_at.get(band)
                {
                    let depth = self.unique_queue.count(lo, hi).await?;
                    dropped = must_drop(depth, threshold);
                }
            }

            if !dropped {
                let size = task.file_size();
                dropped =
                    size > self.config.ingest.max_file_size || size == 0;
            }
        }

        if task.request.params.never_drop || !dropped {
            return Ok(false);
        }

        task.failure = "Skipped".to_string();
        self.drop_queue.push(task).await?;
        self.counters.increment("ingest.skipped");
        Ok(true)
    }

    async fn is_whitelisted(&self, task: &mut IngestTask) -> Result<bool> {
        let verdict = self.caps.whitelist_verdict(task).await?;
        let sha256 = match task.root_sha256() {
            Some(sha256) => sha256.as_str().to_string(),
            None => return Ok(false),
        };

        let (reason, hit) = match verdict {
            Some(hit) => (Some(hit.reason), format!("{:?}", hit.hit)),
            None => match self.whitelisted.get(&sha256) {
                Some(cached) => {
                    (Some(cached.clone()), "cached".to_string())
                }
                None => (None, String::new()),
            },
        };

        let Some(reason) = reason else {
            return Ok(false);
        };

        if hit != "cached" {
            self.whitelisted.insert(sha256, reason.clone());
        }
        task.failure = format!("Whitelisting due to reason {reason} ({hit})");
        self.drop_queue.push(task).await?;
        self.counters.increment("ingest.whitelisted");
        self.counters.increment(&format!("whitelist.{reason}"));
        Ok(true)
    }

    /// Invoked for every completion broadcast.
    ///
    /// Under the scan-key lock: pop the scanning entry, refresh both cache
    /// tiers, finalize the primary task, then drain the duplicate queue.
    /// The drain snapshots the queue before finalizing anything because
    /// `finalize` may itself fold new duplicates onto the same key.
    pub async fn completed(&self, message: CompletionMessage) -> Result<()> {
        let scan_key = message.scan_key.clone();
        let _lock =
            KeyedLock::acquire(self.persistent.clone(), scan_key.as_str())
                .await?;

        let Some(mut primary) =
            self.scanning.pop(scan_key.as_str()).await?
        else {
            warn!(
                score = message.score,
                sha256 = %message.root_sha256,
                "completion for untracked submission"
            );
            if let Some(raw) = message.metadata.get("replay_task") {
                match serde_json::from_str::<IngestTask>(raw) {
                    Ok(mut task) => {
                        info!(sid = %message.sid, "replaying lost submission");
                        self.finalize(
                            message.psid,
                            message.sid,
                            message.score,
                            &mut task,
                        )
                        .await?;
                    }
                    Err(err) => {
                        warn!(error = %err, "malformed replay task ignored");
                    }
                }
            }
            return Ok(());
        };

        self.counters.increment("ingest.submissions_completed");
        self.counters
            .increment_by("ingest.files_completed", message.file_count as u64);
        self.counters
            .increment_by("ingest.bytes_completed", message.size);

        let entry = FileScoreEntry {
            psid: message.psid,
            sid: message.sid,
            score: message.score,
            errors: message.error_count,
            time: Utc::now(),
        };
        self.cache.save(&scan_key, &entry).await?;

        self.finalize(message.psid, message.sid, message.score, &mut primary)
            .await?;

        let duplicates = NamedQueue::<IngestTask>::new(
            self.persistent.clone(),
            duplicate_queue_name(scan_key.as_str()),
        );
        let mut folded = Vec::new();
        while let Some(task) = duplicates.pop(Duration::ZERO).await? {
            folded.push(task);
        }
        for mut task in folded {
            self.finalize(
                message.psid,
                message.sid,
                message.score,
                &mut task,
            )
            .await?;
        }

        Ok(())
    }

    /// Emit the caller-visible outcome for a task: an alert if warranted, a
    /// notification, and possibly a stochastic resubmission with expanded
    /// service selection.
    pub async fn finalize(
        &self,
        psid: Option<Sid>,
        sid: Sid,
        score: i64,
        task: &mut IngestTask,
    ) -> Result<()> {
        debug!(%sid, score, "finalizing");
        if psid.is_some() {
            task.request.params.psid = psid;
        }
        task.score = Some(score);
        task.sid = Some(sid);

        let resubmit_selected = determine_resubmit_selected(
            &task.request.params.selected,
            &task.request.params.resubmit_to,
        );
        let will_resubmit =
            resubmit_selected.is_some() && should_resubmit(score);
        if will_resubmit {
            task.request.params.psid = None;
        }

        if self.is_alert(task, score) {
            self.alert_queue
                .push(&AlertMessage {
                    sid,
                    score,
                    task: task.clone(),
                })
                .await?;
        }

        self.send_notification(task, None).await?;

        if will_resubmit {
            task.request.params.psid = Some(sid);
            task.request.params.resubmit_to.clear();
            if let Some(selected) = resubmit_selected {
                task.request.params.selected = selected;
            }
            task.scan_key = None;
            let priority = task.priority.unwrap_or_else(|| {
                self.config.priorities.value("medium").unwrap_or(200)
            });
            info!(%sid, score, "resubmitting with expanded services");
            self.unique_queue.push(priority, task).await?;
        }

        Ok(())
    }

    fn is_alert(&self, task: &IngestTask, score: i64) -> bool {
        task.request.params.generate_alert
            && score >= self.config.priorities.critical_score
    }

    /// Deliver the task to its notification queue, if it has one and the
    /// score threshold is met. A failure reason is recorded on the task
    /// first so the caller sees why nothing more will happen.
    pub async fn send_notification(
        &self,
        task: &mut IngestTask,
        failure: Option<String>,
    ) -> Result<()> {
        if let Some(failure) = failure {
            task.failure = failure;
        }
        if !task.failure.is_empty() {
            info!(
                failure = %task.failure,
                sha256 = ?task.root_sha256(),
                "task failed"
            );
        }

        let Some(notification) = task.request.notification.clone() else {
            return Ok(());
        };
        if let (Some(threshold), Some(score)) =
            (notification.threshold, task.score)
        {
            if score < threshold {
                return Ok(());
            }
        }

        NamedQueue::<IngestTask>::new(
            self.persistent.clone(),
            notification_queue_name(&notification.queue),
        )
        .push(task)
        .await
    }

    /// Route a transiently failed task back through the ingest queue after
    /// a delay, or drop it (and its duplicate queue) once the retry budget
    /// or the expiry window runs out.
    pub async fn retry(
        &self,
        mut task: IngestTask,
        scan_key: Option<ScanKey>,
        reason: &CoreError,
    ) -> Result<()> {
        let retries = task.retries + 1;
        let age_seconds =
            (Utc::now() - task.request.ingest_time).num_seconds();

        if retries > self.config.ingest.max_retries {
            error!(
                sha256 = ?task.root_sha256(),
                %reason,
                "max retries exceeded"
            );
            self.delete_duplicates(scan_key).await?;
        } else if self.expired(age_seconds, 0) {
            info!(
                sha256 = ?task.root_sha256(),
                "not retrying expired submission"
            );
            self.delete_duplicates(scan_key).await?;
        } else {
            info!(sha256 = ?task.root_sha256(), %reason, retries, "requeuing");
            task.retries = retries;
            task.retry_at =
                Some(Utc::now() + self.config.ingest.retry_delay());
            self.retry_queue.push(&task).await?;
        }
        Ok(())
    }

    async fn delete_duplicates(
        &self,
        scan_key: Option<ScanKey>,
    ) -> Result<()> {
        if let Some(key) = scan_key {
            self.persistent
                .queue_delete(&duplicate_queue_name(key.as_str()))
                .await?;
        }
        Ok(())
    }

    /// Startup recovery: a duplicate queue whose scan key is no longer in
    /// the scanning table has lost its primary submission. Push its entries
    /// back through ingest so they fold against the cache or run fresh.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        let pattern = format!("{DUPLICATE_QUEUE_PREFIX}*");
        for queue_name in self.persistent.scan_keys(&pattern).await? {
            let Some(scan_key) =
                queue_name.strip_prefix(DUPLICATE_QUEUE_PREFIX)
            else {
                continue;
            };
            if self.scanning.exists(scan_key).await? {
                continue;
            }
            let _lock =
                KeyedLock::acquire(self.persistent.clone(), scan_key).await?;
            let duplicates = NamedQueue::<IngestTask>::new(
                self.persistent.clone(),
                queue_name.clone(),
            );
            while let Some(task) = duplicates.pop(Duration::ZERO).await? {
                self.ingest_queue.push(&task).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "re-ingested orphaned duplicates");
        }
        Ok(recovered)
    }

    /// Arm the watcher to re-ingest a retry-queue entry once its delay has
    /// passed.
    async fn schedule_retry(&self, task: IngestTask) -> Result<()> {
        let delay = task
            .retry_at
            .map(|at| (at - Utc::now()).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let watch_key = format!(
            "retry-{}-{}",
            task.scan_key
                .as_ref()
                .map(|key| key.as_str().to_string())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            task.retries
        );
        self.watcher
            .touch(
                &watch_key,
                Duration::from_millis(delay),
                INGEST_QUEUE,
                &task,
            )
            .await
    }
}

/// Pops the ingest queue and runs intake.
pub struct IngestLoop {
    ingester: Arc<Ingester>,
}

impl IngestLoop {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        IngestLoop { ingester }
    }
}

impl std::fmt::Debug for IngestLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestLoop").finish_non_exhaustive()
    }
}

#[async_trait]
impl Worker for IngestLoop {
    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn handle_one(&self) -> Result<bool> {
        let raw = self
            .ingester
            .persistent
            .queue_pop(INGEST_QUEUE, POP_TIMEOUT)
            .await?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let task = match serde_json::from_str::<IngestMessage>(&raw) {
            Ok(IngestMessage::Task(task)) => task,
            Ok(IngestMessage::Request(request)) => IngestTask::new(request),
            Err(err) => {
                warn!(error = %err, "malformed ingest payload dropped");
                return Ok(true);
            }
        };

        let scan_key = task.scan_key.clone();
        if let Err(err) = self.ingester.ingest(task.clone()).await {
            self.ingester.retry(task, scan_key, &err).await?;
        }
        Ok(true)
    }
}

/// Pops completion broadcasts and runs the cache/duplicate fan-out.
pub struct CompletionLoop {
    ingester: Arc<Ingester>,
}

impl CompletionLoop {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        CompletionLoop { ingester }
    }
}

impl std::fmt::Debug for CompletionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionLoop").finish_non_exhaustive()
    }
}

#[async_trait]
impl Worker for CompletionLoop {
    fn name(&self) -> &'static str {
        "ingest-complete"
    }

    async fn handle_one(&self) -> Result<bool> {
        match self.ingester.complete_queue.pop(POP_TIMEOUT).await? {
            Some(message) => {
                self.ingester.completed(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Moves retry-queue entries onto watcher schedules.
pub struct RetryLoop {
    ingester: Arc<Ingester>,
}

impl RetryLoop {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        RetryLoop { ingester }
    }
}

impl std::fmt::Debug for RetryLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryLoop").finish_non_exhaustive()
    }
}

#[async_trait]
impl Worker for RetryLoop {
    fn name(&self) -> &'static str {
        "ingest-retry"
    }

    async fn handle_one(&self) -> Result<bool> {
        match self.ingester.retry_queue.pop(POP_TIMEOUT).await? {
            Some(task) => {
                self.ingester.schedule_retry(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Notifies callers about dropped tasks.
pub struct DropLoop {
    ingester: Arc<Ingester>,
}

impl DropLoop {
    pub fn new(ingester: Arc<Ingester>) -> Self {
        DropLoop { ingester }
    }
}

impl std::fmt::Debug for DropLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropLoop").finish_non_exhaustive()
    }
}

#[async_trait]
impl Worker for DropLoop {
    fn name(&self) -> &'static str {
        "ingest-drop"
    }

    async fn handle_one(&self) -> Result<bool> {
        match self.ingester.drop_queue.pop(POP_TIMEOUT).await? {
            Some(mut task) => {
                self.ingester.send_notification(&mut task, None).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
