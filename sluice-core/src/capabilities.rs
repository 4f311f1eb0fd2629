//! Polymorphism points injected into the core components.
//!
//! Scheduling, scoring, whitelisting, and the service registry live outside
//! the control plane; components receive one capability set at construction
//! instead of reaching for globally registered hooks.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use sluice_model::{IngestTask, ServiceResult, SubmissionRecord};

use crate::error::Result;

/// Ordered service groups for one file. Services within a group run in
/// parallel; a later group starts only when the previous one is done.
pub type Schedule = Vec<Vec<String>>;

/// A whitelist match: the rule that fired and what it matched on.
#[derive(Debug, Clone)]
pub struct WhitelistHit {
    pub reason: String,
    pub hit: BTreeMap<String, String>,
}

#[async_trait]
pub trait Capabilities: Send + Sync + 'static {
    /// Every service the registry knows about, enabled or not.
    fn services(&self) -> Vec<String>;

    /// Compute the schedule for a file of the given type under this
    /// submission's parameters.
    fn build_schedule(
        &self,
        record: &SubmissionRecord,
        file_type: &str,
    ) -> Schedule;

    fn build_service_config(
        &self,
        _service: &str,
        _record: &SubmissionRecord,
    ) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Per-service dispatch timeout; `None` falls back to the configured
    /// default.
    fn service_timeout(&self, _service: &str) -> Option<Duration> {
        None
    }

    /// Crash/timeout count beyond which a service is treated as terminally
    /// failed for a file; `None` falls back to the configured default.
    fn service_failure_limit(&self, _service: &str) -> Option<u32> {
        None
    }

    fn service_enabled(&self, _service: &str) -> bool {
        true
    }

    fn is_low_priority(&self, _task: &IngestTask) -> bool {
        false
    }

    async fn whitelist_verdict(
        &self,
        _task: &IngestTask,
    ) -> Result<Option<WhitelistHit>> {
        Ok(None)
    }

    /// Group membership for a submitter; `None` means the user is unknown
    /// and the submission is rejected.
    async fn user_groups(&self, _user: &str) -> Result<Option<Vec<String>>> {
        Ok(Some(Vec::new()))
    }

    fn valid_classification(&self, classification: &str) -> bool {
        !classification.is_empty()
    }

    /// Aggregate score over the results of a completed submission.
    fn score(&self, results: &[ServiceResult]) -> i64 {
        results.iter().map(|result| result.score).sum()
    }
}
