//! Queue and shared-state backend abstraction.
//!
//! Every component talks to named FIFO queues, one priority queue, hash
//! tables, and a deadline set through this trait so the whole core can run
//! against Redis in deployment and against [`MemoryBroker`] in tests or a
//! single-process setup.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod queues;
mod redis_broker;

pub use memory::MemoryBroker;
pub use queues::{HashTable, NamedQueue, PriorityQueue};
pub use redis_broker::RedisBroker;

pub const INGEST_QUEUE: &str = "m-ingest";
pub const UNIQUE_QUEUE: &str = "m-unique";
pub const COMPLETE_QUEUE: &str = "m-complete";
pub const DROP_QUEUE: &str = "m-drop";
pub const RETRY_QUEUE: &str = "m-retry";
pub const ALERT_QUEUE: &str = "m-alert";
pub const FILE_DISPATCH_QUEUE: &str = "dispatch-file";
pub const SUBMISSION_QUEUE: &str = "submission";
pub const SCANNING_TABLE: &str = "m-scanning-table";

pub const DUPLICATE_QUEUE_PREFIX: &str = "w-m-";

pub fn service_queue_name(service: &str) -> String {
    format!("service-queue-{service}")
}

pub fn notification_queue_name(suffix: &str) -> String {
    format!("nq-{suffix}")
}

pub fn duplicate_queue_name(scan_key: &str) -> String {
    format!("{DUPLICATE_QUEUE_PREFIX}{scan_key}")
}

/// Backend contract for queues, hashes, deadlines, and locks.
///
/// Queue pops accept a timeout; `Duration::ZERO` means "poll once". All
/// payloads are opaque strings; the typed fronts in [`queues`] handle JSON.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn queue_push(&self, queue: &str, payload: String) -> Result<()>;

    async fn queue_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    async fn queue_length(&self, queue: &str) -> Result<u64>;

    async fn queue_delete(&self, queue: &str) -> Result<()>;

    /// Push onto the priority queue. Higher priorities pop first; entries
    /// sharing a priority pop in FIFO order.
    async fn priority_push(
        &self,
        queue: &str,
        priority: u32,
        payload: String,
    ) -> Result<()>;

    async fn priority_pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Number of queued entries with priority in `[lo, hi]`.
    async fn priority_count(&self, queue: &str, lo: u32, hi: u32)
        -> Result<u64>;

    async fn hash_set(
        &self,
        hash: &str,
        key: &str,
        value: String,
    ) -> Result<()>;

    /// Set only when the field is absent. Returns whether the write won.
    async fn hash_set_if_absent(
        &self,
        hash: &str,
        key: &str,
        value: String,
    ) -> Result<bool>;

    async fn hash_get(&self, hash: &str, key: &str) -> Result<Option<String>>;

    /// Atomic get-and-delete of one field.
    async fn hash_pop(&self, hash: &str, key: &str) -> Result<Option<String>>;

    async fn hash_remove(&self, hash: &str, key: &str) -> Result<()>;

    async fn hash_incr(&self, hash: &str, key: &str, delta: i64)
        -> Result<i64>;

    async fn hash_len(&self, hash: &str) -> Result<u64>;

    async fn hash_keys(&self, hash: &str) -> Result<Vec<String>>;

    async fn hash_get_all(&self, hash: &str)
        -> Result<Vec<(String, String)>>;

    async fn hash_delete(&self, hash: &str) -> Result<()>;

    /// Scan top-level keys matching a glob pattern. Recovery only; not a
    /// hot-path operation.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Arm (or re-arm) a deadline for `key` in the named set.
    async fn deadline_set(&self, set: &str, key: &str, at_ms: i64)
        -> Result<()>;

    async fn deadline_remove(&self, set: &str, key: &str) -> Result<()>;

    /// Atomically claim every key whose deadline is at or before `now_ms`.
    /// A key is returned to exactly one caller.
    async fn deadline_pop_due(
        &self,
        set: &str,
        now_ms: i64,
    ) -> Result<Vec<String>>;

    /// Try to take a named lock for `ttl`. Returns a release token on
    /// success; the lock self-expires if the holder dies.
    async fn lock_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<String>>;

    async fn lock_release(&self, name: &str, token: &str) -> Result<()>;
}
