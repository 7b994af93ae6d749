use std::sync::Arc;

use uuid::Uuid;

use crate::broker::{QueueStore, CHANNEL_BUILD};
use crate::error::Result;
use crate::scheduler::job::{BuildChannelMessage, Job, QueueEntry};

/// The ordered collection of advertised-but-unclaimed build jobs.
#[derive(Clone)]
pub struct BuildQueue {
    broker: Arc<dyn QueueStore>,
}

impl BuildQueue {
    pub fn new(broker: Arc<dyn QueueStore>) -> Self {
        Self { broker }
    }

    /// Push a queue entry for the job and announce it on the build channel
    /// so idle nodes can race to claim it.
    pub async fn advertise(&self, job: &Job) -> Result<QueueEntry> {
        let entry = QueueEntry::for_job(job);
        self.broker.push_entry(&entry).await?;

        let advert = BuildChannelMessage::Queue {
            job_id: job.id,
            builder_id: job.builder_id.clone(),
        };
        self.broker
            .publish(CHANNEL_BUILD, &serde_json::to_string(&advert)?)
            .await?;
        tracing::debug!(job_id = %job.id, builder_id = %job.builder_id, "Advertised build job");
        Ok(entry)
    }

    pub async fn len(&self) -> Result<usize> {
        self.broker.queue_len().await
    }

    pub async fn snapshot(&self) -> Result<Vec<QueueEntry>> {
        self.broker.queue_snapshot().await
    }

    /// Atomic remove-by-id; returns the entry to exactly one caller.
    pub async fn remove(&self, job_id: Uuid) -> Result<Option<QueueEntry>> {
        self.broker.take_entry(job_id).await
    }
}
