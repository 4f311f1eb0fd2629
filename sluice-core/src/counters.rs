//! Process-wide named counters with periodic export through tracing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Named monotonic counters for one component.
///
/// Increment is cheap enough for hot paths; `snapshot` is for the exporter
/// and for tests asserting pipeline behavior.
#[derive(Debug, Default)]
pub struct Counters {
    name: String,
    values: DashMap<String, u64>,
}

impl Counters {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Counters {
            name: name.into(),
            values: DashMap::new(),
        })
    }

    pub fn increment(&self, counter: &str) {
        self.increment_by(counter, 1);
    }

    pub fn increment_by(&self, counter: &str, amount: u64) {
        *self.values.entry(counter.to_string()).or_insert(0) += amount;
    }

    pub fn get(&self, counter: &str) -> u64 {
        self.values.get(counter).map(|value| *value).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Log a snapshot at a fixed interval until cancelled.
    pub fn start_export(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let counters = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let snapshot = counters.snapshot();
                if !snapshot.is_empty() {
                    info!(
                        component = %counters.name,
                        counters = ?snapshot,
                        "counter export"
                    );
                }
            }
        })
    }
}
