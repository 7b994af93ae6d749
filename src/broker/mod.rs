//! Shared queue store abstraction.
//!
//! All cross-node coordination goes through one broker: node records, the
//! pending job queue, job rows and the pub/sub channels used for job
//! advertisement, claim responses and cancellation. No in-process lock is
//! assumed to be visible across nodes; the broker's atomic primitives
//! (`take_entry`, `transition_job`) are the only ordering authority.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus, QueueEntry};

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

/// Channel carrying build advertisements, claim responses and cancels.
pub const CHANNEL_BUILD: &str = "build";
/// Channel carrying node liveness control messages.
pub const CHANNEL_NODE: &str = "node";

/// A registered build node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub psk: String,
    pub arch: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    // Node records. The registry is the sole writer.
    async fn put_node(&self, node: NodeRecord) -> Result<()>;
    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>>;
    async fn remove_node(&self, node_id: &str) -> Result<()>;
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;

    // Job rows.
    async fn put_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;
    async fn remove_job(&self, job_id: Uuid) -> Result<()>;

    /// Append one chunk of build output (plus a newline) to the job's log.
    /// A no-op when the row does not exist.
    async fn append_log(&self, job_id: Uuid, chunk: &str) -> Result<()>;

    // Pending job queue.
    async fn push_entry(&self, entry: &QueueEntry) -> Result<()>;
    async fn queue_len(&self) -> Result<usize>;
    async fn queue_snapshot(&self) -> Result<Vec<QueueEntry>>;

    /// Atomically remove the entry for `job_id` and return it. Under
    /// contention exactly one caller receives `Some`; this is the award
    /// primitive of the claim protocol.
    async fn take_entry(&self, job_id: Uuid) -> Result<Option<QueueEntry>>;

    /// Compare-and-set the job's status: succeeds iff the current status is
    /// one of `from`. Returns whether the transition landed. `claimed_by`
    /// and `updated_at` are written together with the status.
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        claimed_by: Option<&str>,
    ) -> Result<bool>;

    // Pub/sub.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}
