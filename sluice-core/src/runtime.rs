//! Worker-pool supervision.
//!
//! Each component implements [`Worker`]; the [`Supervisor`] owns the
//! shutdown token and the join handles for every replica it spawns. Workers
//! finish their in-flight unit before exiting, so queue messages are never
//! acknowledged without their state writes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;

/// One unit-of-work loop body.
///
/// `handle_one` should block at most briefly (pop timeouts, poll sleeps) so
/// cancellation stays responsive. Returning `Ok(false)` signals an idle
/// pass; errors are logged and the loop backs off before retrying.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle_one(&self) -> Result<bool>;
}

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Spawns and tracks worker replicas for one process.
#[derive(Debug, Default)]
pub struct Supervisor {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<W: Worker>(&mut self, worker: Arc<W>, replicas: usize) {
        for replica in 0..replicas {
            let worker = worker.clone();
            let token = self.token.clone();
            self.handles.push(tokio::spawn(async move {
                let name = worker.name();
                info!(worker = name, replica, "worker started");
                while !token.is_cancelled() {
                    match worker.handle_one().await {
                        Ok(_) => {}
                        Err(err) => {
                            error!(worker = name, error = %err, "worker error");
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
                info!(worker = name, replica, "worker stopped");
            }));
        }
    }

    /// Cancel every worker and wait for in-flight units to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.join().await;
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingWorker {
        count: AtomicU64,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle_one(&self) -> Result<bool> {
            self.count.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn workers_run_until_shutdown() {
        let worker = Arc::new(CountingWorker {
            count: AtomicU64::new(0),
        });
        let mut supervisor = Supervisor::new();
        supervisor.spawn(worker.clone(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.shutdown().await;

        let done = worker.count.load(Ordering::SeqCst);
        assert!(done > 0);

        // No further work after shutdown.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.count.load(Ordering::SeqCst), done);
    }
}
