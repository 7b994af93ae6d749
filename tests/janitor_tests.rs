use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use iglu_scheduler::broker::{MemoryBroker, QueueStore};
use iglu_scheduler::config::ExpirePolicy;
use iglu_scheduler::registry::NodeRegistry;
use iglu_scheduler::scheduler::job::{ClaimRequest, Job, JobStatus, QueueEntry};
use iglu_scheduler::scheduler::{ClaimCoordinator, Janitor};

const WINDOW: Duration = Duration::from_secs(15 * 60);

fn setup(policy: ExpirePolicy) -> (Arc<MemoryBroker>, Janitor) {
    let broker = Arc::new(MemoryBroker::new());
    let janitor = Janitor::new(broker.clone(), WINDOW, policy);
    (broker, janitor)
}

/// Seed a job whose queue entry was published `age` ago.
async fn seed_entry(broker: &Arc<MemoryBroker>, age: Duration) -> Job {
    let job = Job::new("b1");
    broker.put_job(&job).await.unwrap();
    broker
        .push_entry(&QueueEntry {
            job_id: job.id,
            builder_id: job.builder_id.clone(),
            published_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
        })
        .await
        .unwrap();
    job
}

#[tokio::test]
async fn sweep_removes_only_entries_past_the_window() {
    let (broker, janitor) = setup(ExpirePolicy::LeaveCreated);

    seed_entry(&broker, Duration::from_secs(16 * 60)).await;
    seed_entry(&broker, Duration::from_secs(20 * 60)).await;
    let fresh = seed_entry(&broker, Duration::from_secs(60)).await;

    let removed = janitor.sweep().await.unwrap();
    assert_eq!(removed, 2);

    let snapshot = broker.queue_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].job_id, fresh.id);
}

#[tokio::test]
async fn sweep_on_empty_queue_is_a_no_op() {
    let (_, janitor) = setup(ExpirePolicy::LeaveCreated);
    assert_eq!(janitor.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn entry_just_inside_the_window_survives_and_stays_claimable() {
    let (broker, janitor) = setup(ExpirePolicy::LeaveCreated);
    let job = seed_entry(&broker, Duration::from_secs(14 * 60)).await;

    assert_eq!(janitor.sweep().await.unwrap(), 0);
    assert_eq!(broker.queue_len().await.unwrap(), 1);

    // Still claimable after the sweep.
    let registry = Arc::new(NodeRegistry::new(
        broker.clone() as Arc<dyn QueueStore>
    ));
    registry.register("n1", "psk1", vec![]).await.unwrap();
    let coordinator = ClaimCoordinator::new(registry, broker.clone(), 0);
    let body = serde_json::to_vec(&ClaimRequest { job_id: job.id }).unwrap();
    let entry = coordinator
        .claim(Some("n1"), Some("psk1"), &body)
        .await
        .unwrap();
    assert_eq!(entry.job_id, job.id);
}

#[tokio::test]
async fn default_policy_leaves_the_job_row_created() {
    let (broker, janitor) = setup(ExpirePolicy::LeaveCreated);
    let job = seed_entry(&broker, Duration::from_secs(16 * 60)).await;

    assert_eq!(janitor.sweep().await.unwrap(), 1);
    let row = broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Created);
}

#[tokio::test]
async fn mark_failed_policy_fails_the_job_row() {
    let (broker, janitor) = setup(ExpirePolicy::MarkFailed);
    let job = seed_entry(&broker, Duration::from_secs(16 * 60)).await;

    assert_eq!(janitor.sweep().await.unwrap(), 1);
    let row = broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
}

#[tokio::test]
async fn repeated_sweeps_are_idempotent() {
    let (broker, janitor) = setup(ExpirePolicy::LeaveCreated);
    seed_entry(&broker, Duration::from_secs(16 * 60)).await;

    assert_eq!(janitor.sweep().await.unwrap(), 1);
    assert_eq!(janitor.sweep().await.unwrap(), 0);
    assert_eq!(broker.queue_len().await.unwrap(), 0);
}
