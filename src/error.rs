use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Missing or invalid node credentials. The optional cause ("Invalid PSK",
    /// "Invalid node ID") is surfaced for observability; callers must not
    /// depend on it being present.
    #[error("Unauthorized")]
    Unauthorized { cause: Option<&'static str> },

    #[error("Bad request: {0}")]
    BadRequest(&'static str),

    /// A well-formed request whose content cannot be processed (unparsable
    /// or disallowed job update).
    #[error("Not acceptable: {0}")]
    NotAcceptable(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The job is no longer available to be awarded (already claimed or
    /// removed from the queue).
    #[error("Gone: {0}")]
    Gone(&'static str),

    /// The requested transition conflicts with the job's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Queue store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
