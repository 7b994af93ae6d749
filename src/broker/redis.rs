//! Redis-backed broker.
//!
//! Key layout: `node:{id}:info` for node records, `job:{id}` for job rows,
//! the list `build_queue` for pending advertisements. `take_entry` relies on
//! `LREM key 1 value` returning the removed count, so under contention
//! exactly one caller observes 1. The status compare-and-set runs as a Lua
//! script so the read-check-write is a single step on the server.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus, QueueEntry};

use super::{NodeRecord, QueueStore};

const QUEUE_KEY: &str = "build_queue";

const TRANSITION_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local job = cjson.decode(raw)
local allowed = false
for from in string.gmatch(ARGV[1], '([^,]+)') do
  if job.status == from then allowed = true end
end
if not allowed then return 0 end
job.status = ARGV[2]
if ARGV[3] ~= '' then job.claimed_by = ARGV[3] end
job.updated_at = ARGV[4]
redis.call('SET', KEYS[1], cjson.encode(job))
return 1
"#;

const APPEND_LOG_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local job = cjson.decode(raw)
job.log = job.log .. ARGV[1] .. '\n'
redis.call('SET', KEYS[1], cjson.encode(job))
return 1
"#;

pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    transition: redis::Script,
    append_log: redis::Script,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to queue store");
        Ok(Self {
            client,
            conn,
            transition: redis::Script::new(TRANSITION_SCRIPT),
            append_log: redis::Script::new(APPEND_LOG_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn node_key(node_id: &str) -> String {
        format!("node:{node_id}:info")
    }

    fn job_key(job_id: Uuid) -> String {
        format!("job:{job_id}")
    }
}

#[async_trait]
impl QueueStore for RedisBroker {
    async fn put_node(&self, node: NodeRecord) -> Result<()> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(&node)?;
        let _: () = conn.set(Self::node_key(&node.node_id), payload).await?;
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(Self::node_key(node_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(Self::node_key(node_id)).await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.keys("node:*:info").await?;
        let mut nodes = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                nodes.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(nodes)
    }

    async fn put_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(job)?;
        let _: () = conn.set(Self::job_key(job.id), payload).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(Self::job_key(job_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove_job(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(Self::job_key(job_id)).await?;
        Ok(())
    }

    async fn append_log(&self, job_id: Uuid, chunk: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i32 = self
            .append_log
            .key(Self::job_key(job_id))
            .arg(chunk)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_entry(&self, entry: &QueueEntry) -> Result<()> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(entry)?;
        // RPUSH keeps snapshots oldest-first, matching the in-memory broker.
        let _: () = conn.rpush(QUEUE_KEY, payload).await?;
        Ok(())
    }

    async fn queue_len(&self) -> Result<usize> {
        let mut conn = self.conn();
        let len: usize = conn.llen(QUEUE_KEY).await?;
        Ok(len)
    }

    async fn queue_snapshot(&self) -> Result<Vec<QueueEntry>> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn.lrange(QUEUE_KEY, 0, -1).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            entries.push(serde_json::from_str(&item)?);
        }
        Ok(entries)
    }

    async fn take_entry(&self, job_id: Uuid) -> Result<Option<QueueEntry>> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn.lrange(QUEUE_KEY, 0, -1).await?;
        for item in raw {
            let entry: QueueEntry = serde_json::from_str(&item)?;
            if entry.job_id != job_id {
                continue;
            }
            // LREM is the decider: concurrent callers all find the same
            // serialized value, but only one removal returns 1.
            let removed: i64 = conn.lrem(QUEUE_KEY, 1, item).await?;
            if removed == 1 {
                return Ok(Some(entry));
            }
            return Ok(None);
        }
        Ok(None)
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        claimed_by: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let from_list = from
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let result: i32 = self
            .transition
            .key(Self::job_key(job_id))
            .arg(from_list)
            .arg(to.to_string())
            .arg(claimed_by.unwrap_or(""))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}
