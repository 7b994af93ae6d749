//! Claim coordinator: the protocol run when a node wants to execute a job.
//!
//! Competing nodes observe the same advertisement near-simultaneously, so the
//! coordinator jitters each attempt before the award. The award itself is the
//! broker's atomic `take_entry`; the jitter only spreads attempts in time, it
//! is not what makes the claim safe.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::broker::{QueueStore, CHANNEL_BUILD};
use crate::error::{Result, SchedulerError};
use crate::registry::NodeRegistry;
use crate::scheduler::job::{
    BuildChannelMessage, ClaimRequest, ClaimResult, JobStatus, JobUpdateRequest, QueueEntry,
};
use crate::scheduler::queue::BuildQueue;

pub struct ClaimCoordinator {
    registry: Arc<NodeRegistry>,
    queue: BuildQueue,
    broker: Arc<dyn QueueStore>,
    jitter_max_ms: u64,
}

impl ClaimCoordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        broker: Arc<dyn QueueStore>,
        jitter_max_ms: u64,
    ) -> Self {
        Self {
            registry,
            queue: BuildQueue::new(broker.clone()),
            broker,
            jitter_max_ms,
        }
    }

    /// Run the full claim protocol for a node request: authenticate,
    /// validate, jitter, award. Exactly one of N competing claims for the
    /// same job succeeds; the rest get `Gone`.
    pub async fn claim(
        &self,
        node_id: Option<&str>,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Result<QueueEntry> {
        let node = self.registry.authenticate(node_id, authorization).await?;

        let request: ClaimRequest = serde_json::from_slice(body)
            .map_err(|_| SchedulerError::BadRequest("Invalid body"))?;

        if let Err(e) = self.registry.mark_seen(&node.node_id).await {
            tracing::debug!(node_id = %node.node_id, error = %e, "Failed to refresh node liveness");
        }

        // Collision mitigation only; the atomic take below is what decides.
        if self.jitter_max_ms > 0 {
            let delay = rand::thread_rng().gen_range(0..self.jitter_max_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let entry = self
            .broker
            .take_entry(request.job_id)
            .await?
            .ok_or(SchedulerError::Gone("Failed to award update to node"))?;

        let claimed = self
            .broker
            .transition_job(
                request.job_id,
                &[JobStatus::Created],
                JobStatus::Claimed,
                Some(&node.node_id),
            )
            .await?;
        if !claimed {
            // The award is conditioned on the row still being created. A
            // failed transition means the job was canceled (or otherwise
            // moved on) while its advertisement was still queued; the node
            // must not build it.
            tracing::warn!(
                job_id = %request.job_id,
                node_id = %node.node_id,
                "Job row was not in created state at award time, award withdrawn"
            );
            return Err(match self.broker.get_job(request.job_id).await? {
                Some(job) => SchedulerError::Conflict(format!(
                    "Job {} is already {}",
                    request.job_id, job.status
                )),
                None => SchedulerError::Gone("Failed to award update to node"),
            });
        }

        let response = BuildChannelMessage::Claim {
            job_id: entry.job_id,
            builder_id: entry.builder_id.clone(),
            target: node.node_id.clone(),
            result: ClaimResult::Approved,
        };
        self.broker
            .publish(CHANNEL_BUILD, &serde_json::to_string(&response)?)
            .await?;

        tracing::info!(
            job_id = %entry.job_id,
            node_id = %node.node_id,
            "Awarded build job to node"
        );
        Ok(entry)
    }

    /// Apply a node's progress report to the job row: status moving through
    /// claimed → running → finished/failed, optionally appending a chunk of
    /// build output. Only the node the job was awarded to may report.
    pub async fn update_progress(
        &self,
        node_id: Option<&str>,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        let node = self.registry.authenticate(node_id, authorization).await?;

        let update: JobUpdateRequest = serde_json::from_slice(body)
            .map_err(|_| SchedulerError::NotAcceptable("Invalid body"))?;

        if let Err(e) = self.registry.mark_seen(&node.node_id).await {
            tracing::debug!(node_id = %node.node_id, error = %e, "Failed to refresh node liveness");
        }

        let job = self
            .broker
            .get_job(update.job_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("Job {} does not exist", update.job_id)))?;
        if job.claimed_by.as_deref() != Some(node.node_id.as_str()) {
            return Err(SchedulerError::Conflict(format!(
                "Job {} is not claimed by node {}",
                update.job_id, node.node_id
            )));
        }

        let from: &[JobStatus] = match update.status {
            JobStatus::Running | JobStatus::Finished | JobStatus::Failed => {
                &[JobStatus::Claimed, JobStatus::Running]
            }
            // Created/claimed are controller-owned, canceled goes through
            // the cancel endpoint.
            JobStatus::Created | JobStatus::Claimed | JobStatus::Canceled => {
                return Err(SchedulerError::NotAcceptable("Invalid target status"));
            }
        };
        let moved = self
            .broker
            .transition_job(update.job_id, from, update.status, None)
            .await?;
        if !moved {
            // Re-read: the row may have moved since the ownership check.
            let status = self
                .broker
                .get_job(update.job_id)
                .await?
                .map(|j| j.status)
                .unwrap_or(job.status);
            return Err(SchedulerError::Conflict(format!(
                "Job {} is already {status}",
                update.job_id
            )));
        }

        if let Some(chunk) = &update.log {
            self.broker.append_log(update.job_id, chunk).await?;
        }
        tracing::debug!(
            job_id = %update.job_id,
            node_id = %node.node_id,
            status = %update.status,
            "Applied job progress report"
        );
        Ok(())
    }

    /// Cancel a job out-of-band. Exactly one terminal transition lands: a
    /// cancel racing a natural exit loses if the executor's terminal state
    /// was already written.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let job = self
            .broker
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("Job {job_id} does not exist")))?;

        let canceled = self
            .broker
            .transition_job(
                job_id,
                &[JobStatus::Created, JobStatus::Claimed, JobStatus::Running],
                JobStatus::Canceled,
                None,
            )
            .await?;
        if !canceled {
            return Err(SchedulerError::Conflict(format!(
                "Job {job_id} is already {}",
                job.status
            )));
        }

        // A queued advertisement for a canceled job must never be claimed.
        let _ = self.queue.remove(job_id).await?;

        let notice = BuildChannelMessage::Cancel { job_id };
        self.broker
            .publish(CHANNEL_BUILD, &serde_json::to_string(&notice)?)
            .await?;
        tracing::info!(%job_id, "Canceled build job");
        Ok(())
    }
}
