use std::collections::BTreeMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Intake limits, cache windows, shedding thresholds, and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Largest file accepted without `ignore_size`/`never_drop`, in bytes.
    pub max_file_size: u64,
    /// Longest permitted metadata value; longer values are removed.
    pub max_metadata_length: usize,
    /// Cap on the combined size of the metadata map; larger maps fail the
    /// whole request.
    pub max_value_size: usize,
    /// Per-priority-band unique-queue depth at which sampling starts.
    pub sampling_at: BTreeMap<String, u64>,
    /// Cache entries older than this are evicted (seconds).
    pub expire_after: u64,
    /// Cache entries older than this are only used for prioritization.
    pub stale_after_seconds: u64,
    /// Shorter expiry window for cache entries recorded with errors.
    pub incomplete_expire_after_seconds: u64,
    pub incomplete_stale_after_seconds: u64,
    pub max_retries: u32,
    /// Delay before a transiently failed task is ingested again (seconds).
    pub retry_delay_seconds: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            max_file_size: 104_857_600,
            max_metadata_length: 4096,
            max_value_size: 32_768,
            sampling_at: BTreeMap::from([
                ("low".to_string(), 10_000_000),
                ("medium".to_string(), 2_000_000),
                ("high".to_string(), 1_000_000),
                ("critical".to_string(), 500_000),
            ]),
            expire_after: 15 * 24 * 60 * 60,
            stale_after_seconds: 24 * 60 * 60,
            incomplete_expire_after_seconds: 3600,
            incomplete_stale_after_seconds: 1800,
            max_retries: 10,
            retry_delay_seconds: 180,
        }
    }
}

impl IngestConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::seconds(self.retry_delay_seconds as i64)
    }
}

/// Extraction bounds and the global completion deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub max_extraction_depth: u32,
    pub max_extracted: u32,
    /// How long a submission may stay in flight before the watcher
    /// re-injects it (seconds).
    pub max_time_seconds: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        SubmissionConfig {
            max_extraction_depth: 6,
            max_extracted: 500,
            max_time_seconds: 2 * 24 * 60 * 60,
        }
    }
}

/// Priority names, their numeric values, the bands used for sampling, and
/// the score thresholds that map a cached score back to a priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub values: BTreeMap<String, u32>,
    /// Inclusive `[lo, hi]` value bands keyed by priority name.
    pub ranges: BTreeMap<String, (u32, u32)>,
    /// Ordered high-to-low; the first threshold at or below a score wins.
    pub score_thresholds: Vec<ScoreThreshold>,
    /// Completed submissions scoring at or above this raise alerts.
    pub critical_score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreThreshold {
    pub name: String,
    pub threshold: i64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        PriorityConfig {
            values: BTreeMap::from([
                ("low".to_string(), 100),
                ("medium".to_string(), 200),
                ("high".to_string(), 300),
                ("critical".to_string(), 400),
            ]),
            ranges: BTreeMap::from([
                ("low".to_string(), (0, 100)),
                ("medium".to_string(), (101, 200)),
                ("high".to_string(), (201, 300)),
                ("critical".to_string(), (301, 400)),
            ]),
            score_thresholds: vec![
                ScoreThreshold {
                    name: "critical".to_string(),
                    threshold: 500,
                },
                ScoreThreshold {
                    name: "high".to_string(),
                    threshold: 100,
                },
            ],
            critical_score: 500,
        }
    }
}

impl PriorityConfig {
    pub fn value(&self, name: &str) -> Option<u32> {
        self.values.get(name).copied()
    }

    /// The band covering a priority value, if any.
    pub fn band_of(&self, priority: u32) -> Option<(&str, (u32, u32))> {
        self.ranges
            .iter()
            .find(|(_, (lo, hi))| (*lo..=*hi).contains(&priority))
            .map(|(name, range)| (name.as_str(), *range))
    }
}

/// Fallbacks used when the capability set has no per-service answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub service_timeout_seconds: u64,
    pub service_failure_limit: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            service_timeout_seconds: 30 * 60,
            service_failure_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            poll_interval_ms: 500,
        }
    }
}

/// The analyzer fleet as configuration: ordered stages and the services
/// assigned to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub stages: Vec<String>,
    pub entries: Vec<ServiceEntry>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        ServicesConfig {
            stages: vec![
                "pre".to_string(),
                "core".to_string(),
                "post".to_string(),
            ],
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub stage: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub failure_limit: Option<u32>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// Connection targets for the volatile and persistent brokers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub persistent_url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1:6379/0".to_string(),
            persistent_url: "redis://127.0.0.1:6379/1".to_string(),
        }
    }
}

/// Everything the core components read at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub ingest: IngestConfig,
    pub submission: SubmissionConfig,
    pub priorities: PriorityConfig,
    pub dispatcher: DispatcherConfig,
    pub watcher: WatcherConfig,
    pub services: ServicesConfig,
    pub redis: RedisConfig,
}
