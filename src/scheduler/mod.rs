pub mod claim;
pub mod janitor;
pub mod job;
pub mod queue;

pub use claim::ClaimCoordinator;
pub use janitor::Janitor;
pub use job::{Job, JobStatus, QueueEntry};
pub use queue::BuildQueue;
