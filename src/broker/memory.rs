//! In-memory broker used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus, QueueEntry};

use super::{NodeRecord, QueueStore};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, NodeRecord>,
    jobs: HashMap<Uuid, Job>,
    queue: Vec<QueueEntry>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; the data is
        // plain maps, so continuing with it is safe.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        let mut inner = self.lock();
        inner
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl QueueStore for MemoryBroker {
    async fn put_node(&self, node: NodeRecord) -> Result<()> {
        self.lock().nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.lock().nodes.get(node_id).cloned())
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.lock().nodes.remove(node_id);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn put_job(&self, job: &Job) -> Result<()> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn remove_job(&self, job_id: Uuid) -> Result<()> {
        self.lock().jobs.remove(&job_id);
        Ok(())
    }

    async fn append_log(&self, job_id: Uuid, chunk: &str) -> Result<()> {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.log.push_str(chunk);
            job.log.push('\n');
        }
        Ok(())
    }

    async fn push_entry(&self, entry: &QueueEntry) -> Result<()> {
        self.lock().queue.push(entry.clone());
        Ok(())
    }

    async fn queue_len(&self) -> Result<usize> {
        Ok(self.lock().queue.len())
    }

    async fn queue_snapshot(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.lock().queue.clone())
    }

    async fn take_entry(&self, job_id: Uuid) -> Result<Option<QueueEntry>> {
        let mut inner = self.lock();
        let pos = inner.queue.iter().position(|e| e.job_id == job_id);
        Ok(pos.map(|i| inner.queue.remove(i)))
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        claimed_by: Option<&str>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = to;
        if let Some(node_id) = claimed_by {
            job.claimed_by = Some(node_id.to_string());
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // A send error just means nobody is subscribed right now.
        let _ = self.channel(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self.channel(channel).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }
}
