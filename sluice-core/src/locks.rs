use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::broker::Broker;
use crate::error::{CoreError, Result};

const LOCK_TTL: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_millis(25);

/// Broker-backed mutual exclusion for a named key.
///
/// Used per scan key around the scanning-table/cache/duplicate-drain
/// sequence. The lock self-expires after a TTL so a crashed holder cannot
/// wedge the pipeline; release happens on drop.
pub struct KeyedLock {
    broker: Arc<dyn Broker>,
    name: String,
    token: Option<String>,
}

impl std::fmt::Debug for KeyedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLock").field("name", &self.name).finish()
    }
}

impl KeyedLock {
    pub async fn acquire(
        broker: Arc<dyn Broker>,
        key: &str,
    ) -> Result<KeyedLock> {
        let name = format!("lock-{key}");
        let deadline = tokio::time::Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            if let Some(token) = broker.lock_acquire(&name, LOCK_TTL).await? {
                return Ok(KeyedLock {
                    broker,
                    name,
                    token: Some(token),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::LockTimeout(name));
            }
            sleep(RETRY_DELAY).await;
        }
    }
}

impl Drop for KeyedLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let broker = self.broker.clone();
        let name = std::mem::take(&mut self.name);
        // Drop cannot await; hand the release to the runtime. The TTL covers
        // the case where no runtime is available to run it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = broker.lock_release(&name, &token).await {
                    warn!(%name, %error, "failed to release lock");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn locks_are_exclusive_until_dropped() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let held = KeyedLock::acquire(broker.clone(), "key").await.unwrap();
        assert!(broker
            .lock_acquire("lock-key", LOCK_TTL)
            .await
            .unwrap()
            .is_none());

        drop(held);
        // Release is spawned; give it a tick to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker
            .lock_acquire("lock-key", LOCK_TTL)
            .await
            .unwrap()
            .is_some());
    }
}
