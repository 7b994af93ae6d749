//! Queue janitor: evicts advertisements that sat unclaimed past the
//! staleness window. A job removed this way is never requeued by this core.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::QueueStore;
use crate::config::ExpirePolicy;
use crate::error::Result;
use crate::scheduler::job::JobStatus;

pub struct Janitor {
    broker: Arc<dyn QueueStore>,
    window: Duration,
    policy: ExpirePolicy,
}

impl Janitor {
    pub fn new(broker: Arc<dyn QueueStore>, window: Duration, policy: ExpirePolicy) -> Self {
        Self {
            broker,
            window,
            policy,
        }
    }

    /// One sweep. Returns the number of entries removed.
    pub async fn sweep(&self) -> Result<usize> {
        // Cheap short-circuit before snapshotting the whole queue.
        if self.broker.queue_len().await? == 0 {
            return Ok(0);
        }

        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.window)
                .map_err(|e| crate::error::SchedulerError::Internal(e.to_string()))?;
        let mut removed = 0usize;
        for entry in self.broker.queue_snapshot().await? {
            if entry.published_at >= cutoff {
                continue;
            }
            if self.broker.take_entry(entry.job_id).await?.is_none() {
                // Claimed between snapshot and removal.
                continue;
            }
            removed += 1;
            tracing::debug!(
                job_id = %entry.job_id,
                published_at = %entry.published_at,
                "Evicted stale queue entry"
            );
            if self.policy == ExpirePolicy::MarkFailed {
                self.broker
                    .transition_job(
                        entry.job_id,
                        &[JobStatus::Created, JobStatus::Claimed],
                        JobStatus::Failed,
                        None,
                    )
                    .await?;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Janitor sweep removed stale queue entries");
        }
        Ok(removed)
    }

    /// Periodic sweeps until shutdown.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Janitor sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Janitor shutting down");
                    break;
                }
            }
        }
    }
}
