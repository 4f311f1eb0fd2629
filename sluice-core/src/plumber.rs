//! Queue hygiene for disabled services.
//!
//! Tasks queued for a service that has since been disabled would otherwise
//! sit until the submission deadline. The plumber sweeps every known
//! service queue and fails stranded tasks with a terminal "disabled" error
//! so their submissions complete promptly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use sluice_model::ErrorCategory;

use crate::capabilities::Capabilities;
use crate::dispatch::DispatchClient;
use crate::error::Result;
use crate::runtime::Worker;

pub struct Plumber {
    caps: Arc<dyn Capabilities>,
    client: DispatchClient,
    delay: Duration,
}

impl std::fmt::Debug for Plumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plumber").field("delay", &self.delay).finish()
    }
}

impl Plumber {
    pub fn new(
        caps: Arc<dyn Capabilities>,
        client: DispatchClient,
        delay: Duration,
    ) -> Self {
        Plumber {
            caps,
            client,
            delay,
        }
    }

    /// One sweep over every disabled service's queue. Returns how many
    /// tasks were cleared.
    pub async fn sweep(&self) -> Result<usize> {
        let mut cleared = 0;
        for service in self.caps.services() {
            if self.caps.service_enabled(&service) {
                continue;
            }
            while let Some(task) = self
                .client
                .request_work(&service, Duration::ZERO)
                .await?
            {
                info!(
                    %service,
                    sid = %task.sid,
                    "clearing task for disabled service"
                );
                self.client
                    .service_failed(
                        &task,
                        ErrorCategory::Disabled,
                        format!("service {service} is disabled"),
                    )
                    .await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

#[async_trait]
impl Worker for Plumber {
    fn name(&self) -> &'static str {
        "plumber"
    }

    async fn handle_one(&self) -> Result<bool> {
        let cleared = self.sweep().await?;
        tokio::time::sleep(self.delay).await;
        Ok(cleared > 0)
    }
}
