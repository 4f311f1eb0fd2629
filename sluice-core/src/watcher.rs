//! Timer service: deliver a stored message to a queue at a deadline unless
//! the schedule is touched again or cancelled first.
//!
//! Schedules persist in the broker, so pending deliveries survive a crash;
//! on startup the serve loop immediately fires anything already due. Every
//! stage of the pipeline leans on this for submission deadlines, retry
//! scheduling, and recovery after a dispatch host dies mid-flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::Result;
use crate::runtime::Worker;

const WATCH_DEADLINES: &str = "m-watcher";
const WATCH_BODIES: &str = "m-watcher-body";

#[derive(Debug, Serialize, Deserialize)]
struct WatchBody {
    queue: String,
    message: String,
}

/// Handle used by components to arm and cancel watches.
#[derive(Clone)]
pub struct WatcherClient {
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for WatcherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherClient").finish_non_exhaustive()
    }
}

impl WatcherClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        WatcherClient { broker }
    }

    /// Schedule `message` onto `queue` after `timeout`, replacing any
    /// schedule already held for `key`.
    pub async fn touch<T: Serialize>(
        &self,
        key: &str,
        timeout: Duration,
        queue: &str,
        message: &T,
    ) -> Result<()> {
        let body = WatchBody {
            queue: queue.to_string(),
            message: serde_json::to_string(message)?,
        };
        let at_ms = Utc::now().timestamp_millis() + timeout.as_millis() as i64;
        self.broker
            .hash_set(WATCH_BODIES, key, serde_json::to_string(&body)?)
            .await?;
        self.broker.deadline_set(WATCH_DEADLINES, key, at_ms).await
    }

    pub async fn cancel(&self, key: &str) -> Result<()> {
        self.broker.deadline_remove(WATCH_DEADLINES, key).await?;
        self.broker.hash_remove(WATCH_BODIES, key).await
    }
}

/// Serve loop popping due watches and delivering their messages.
pub struct WatcherServer {
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
}

impl std::fmt::Debug for WatcherServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherServer")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl WatcherServer {
    pub fn new(broker: Arc<dyn Broker>, poll_interval: Duration) -> Self {
        WatcherServer {
            broker,
            poll_interval,
        }
    }

    /// Fire everything due right now. Returns the number delivered.
    pub async fn fire_due(&self) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let due = self
            .broker
            .deadline_pop_due(WATCH_DEADLINES, now_ms)
            .await?;
        let mut delivered = 0;
        for key in due {
            let Some(raw) = self.broker.hash_pop(WATCH_BODIES, &key).await?
            else {
                // Cancelled between the pop and here; nothing to deliver.
                continue;
            };
            match serde_json::from_str::<WatchBody>(&raw) {
                Ok(body) => {
                    debug!(%key, queue = %body.queue, "watch expired");
                    self.broker.queue_push(&body.queue, body.message).await?;
                    delivered += 1;
                }
                Err(error) => {
                    warn!(%key, %error, "malformed watch body dropped");
                }
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl Worker for WatcherServer {
    fn name(&self) -> &'static str {
        "watcher"
    }

    async fn handle_one(&self) -> Result<bool> {
        let delivered = self.fire_due().await?;
        if delivered == 0 {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(delivered > 0)
    }
}
