use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Claimed,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal states are never transitioned out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Claimed => write!(f, "claimed"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// One build execution moving through created → claimed → running → terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub builder_id: String,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Append-only streamed output, executor-owned while running.
    pub log: String,
}

impl Job {
    pub fn new(builder_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            builder_id: builder_id.into(),
            status: JobStatus::Created,
            claimed_by: None,
            started_at: now,
            updated_at: now,
            log: String::new(),
        }
    }
}

/// Queue-visible advertisement of a pending, unclaimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub builder_id: String,
    pub published_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            builder_id: job.builder_id.clone(),
            published_at: Utc::now(),
        }
    }
}

/// Body of a node's claim request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimRequest {
    pub job_id: Uuid,
}

/// Body of a node's progress report for a job it executes: the status the
/// executor observed, plus an optional chunk of build output to append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobUpdateRequest {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimResult {
    Approved,
    Rejected,
}

/// Messages carried on the `build` channel: advertisements, claim
/// responses targeted at the winning node, and cancellation broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildChannelMessage {
    Queue {
        job_id: Uuid,
        builder_id: String,
    },
    Claim {
        job_id: Uuid,
        builder_id: String,
        target: String,
        result: ClaimResult,
    },
    Cancel {
        job_id: Uuid,
    },
}

/// Messages carried on the `node` channel (liveness control).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeChannelMessage {
    HealthCheck { sender: String, target: String },
    Deregister { sender: String, target: String },
}
