//! Job ingestion: how a webhook callback or manual trigger becomes an
//! advertised job. Both triggers share the same contract: require a
//! registered node that supports the builder's architecture, create the job
//! row in `created`, then advertise it on the queue. If the advertisement
//! fails after the row exists, the caller sees a failure; an un-advertised
//! job can never be claimed.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::QueueStore;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;
use crate::scheduler::queue::BuildQueue;

/// A build configuration owned by the external relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub id: String,
    pub name: String,
    pub arch: String,
    pub command: String,
    /// Opaque token resolving a webhook callback to this builder.
    #[serde(default)]
    pub webhook_token: Option<String>,
}

/// Read side of the external store for builder configurations.
#[async_trait]
pub trait BuilderStore: Send + Sync {
    async fn resolve_hook(&self, token: &str) -> Result<Option<BuilderConfig>>;
    async fn get_builder(&self, id: &str) -> Result<Option<BuilderConfig>>;
    async fn list_builders(&self) -> Result<Vec<BuilderConfig>>;
}

/// Builder configurations loaded from a JSON file. Stands in for the
/// relational store, which is outside this core.
pub struct FileBuilderStore {
    builders: Vec<BuilderConfig>,
}

impl FileBuilderStore {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Internal(format!("Failed to read builders file: {e}")))?;
        let builders = serde_json::from_str(&raw)?;
        Ok(Self { builders })
    }

    pub fn from_builders(builders: Vec<BuilderConfig>) -> Self {
        Self { builders }
    }

    pub fn empty() -> Self {
        Self {
            builders: Vec::new(),
        }
    }
}

#[async_trait]
impl BuilderStore for FileBuilderStore {
    async fn resolve_hook(&self, token: &str) -> Result<Option<BuilderConfig>> {
        Ok(self
            .builders
            .iter()
            .find(|b| b.webhook_token.as_deref() == Some(token))
            .cloned())
    }

    async fn get_builder(&self, id: &str) -> Result<Option<BuilderConfig>> {
        Ok(self.builders.iter().find(|b| b.id == id).cloned())
    }

    async fn list_builders(&self) -> Result<Vec<BuilderConfig>> {
        Ok(self.builders.clone())
    }
}

pub struct Ingestor {
    store: Arc<dyn BuilderStore>,
    broker: Arc<dyn QueueStore>,
    queue: BuildQueue,
}

impl Ingestor {
    pub fn new(store: Arc<dyn BuilderStore>, broker: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            queue: BuildQueue::new(broker.clone()),
            broker,
        }
    }

    /// Webhook trigger, keyed by an opaque hook token.
    pub async fn trigger_webhook(&self, token: &str) -> Result<(BuilderConfig, Job)> {
        let builder = self
            .store
            .resolve_hook(token)
            .await?
            .ok_or_else(|| SchedulerError::NotFound("Builder not found".to_string()))?;
        let job = self.start_job(&builder).await?;
        Ok((builder, job))
    }

    /// Manual trigger for a known builder.
    pub async fn trigger_manual(&self, builder_id: &str) -> Result<(BuilderConfig, Job)> {
        let builder = self
            .store
            .get_builder(builder_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound("Builder not found".to_string()))?;
        let job = self.start_job(&builder).await?;
        Ok((builder, job))
    }

    async fn start_job(&self, builder: &BuilderConfig) -> Result<Job> {
        // A job only enters the queue when a registered node can build it.
        let nodes = self.broker.list_nodes().await?;
        if nodes.is_empty() {
            tracing::warn!(
                builder_id = %builder.id,
                "No nodes registered, cannot publish build job"
            );
            return Err(SchedulerError::Internal(
                "Failed to publish build to queue".to_string(),
            ));
        }
        if !nodes.iter().any(|n| n.arch.iter().any(|a| a == &builder.arch)) {
            tracing::warn!(
                builder_id = %builder.id,
                arch = %builder.arch,
                "No registered node supports this architecture"
            );
            return Err(SchedulerError::Internal(
                "Failed to publish build to queue".to_string(),
            ));
        }

        let job = Job::new(&builder.id);
        self.broker.put_job(&job).await?;

        if let Err(e) = self.queue.advertise(&job).await {
            // The row persists but was never advertised, so it can never be
            // claimed. Operators must re-advertise or delete it manually.
            tracing::error!(job_id = %job.id, error = %e, "Failed to publish build job to queue");
            return Err(SchedulerError::Internal(
                "Failed to publish build to queue".to_string(),
            ));
        }
        tracing::info!(job_id = %job.id, builder_id = %builder.id, "Created and advertised build job");
        Ok(job)
    }
}
