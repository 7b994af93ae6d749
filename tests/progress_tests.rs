use std::sync::Arc;

use iglu_scheduler::broker::{MemoryBroker, QueueStore};
use iglu_scheduler::error::SchedulerError;
use iglu_scheduler::registry::NodeRegistry;
use iglu_scheduler::scheduler::job::{ClaimRequest, Job, JobStatus, JobUpdateRequest};
use iglu_scheduler::scheduler::{BuildQueue, ClaimCoordinator};
use uuid::Uuid;

struct Harness {
    broker: Arc<MemoryBroker>,
    registry: Arc<NodeRegistry>,
    coordinator: Arc<ClaimCoordinator>,
}

fn harness() -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let registry = Arc::new(NodeRegistry::new(broker.clone()));
    let coordinator = Arc::new(ClaimCoordinator::new(registry.clone(), broker.clone(), 0));
    Harness {
        broker,
        registry,
        coordinator,
    }
}

/// Register `n1`, advertise a job and let `n1` win the claim.
async fn claimed_job(h: &Harness) -> Job {
    h.registry.register("n1", "psk1", vec![]).await.unwrap();
    let job = Job::new("b1");
    h.broker.put_job(&job).await.unwrap();
    BuildQueue::new(h.broker.clone()).advertise(&job).await.unwrap();
    let body = serde_json::to_vec(&ClaimRequest { job_id: job.id }).unwrap();
    h.coordinator
        .claim(Some("n1"), Some("psk1"), &body)
        .await
        .unwrap();
    job
}

fn update_body(job_id: Uuid, status: JobStatus, log: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(&JobUpdateRequest {
        job_id,
        status,
        log: log.map(str::to_string),
    })
    .unwrap()
}

#[tokio::test]
async fn running_update_moves_row_and_appends_log() {
    let h = harness();
    let job = claimed_job(&h).await;

    h.coordinator
        .update_progress(
            Some("n1"),
            Some("psk1"),
            &update_body(job.id, JobStatus::Running, Some("unpacking sources")),
        )
        .await
        .unwrap();

    let row = h.broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Running);
    assert_eq!(row.log, "unpacking sources\n");
}

#[tokio::test]
async fn repeated_running_updates_accumulate_log() {
    let h = harness();
    let job = claimed_job(&h).await;

    for line in ["unpacking sources", "building", "installing"] {
        h.coordinator
            .update_progress(
                Some("n1"),
                Some("psk1"),
                &update_body(job.id, JobStatus::Running, Some(line)),
            )
            .await
            .unwrap();
    }

    let row = h.broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Running);
    assert_eq!(row.log, "unpacking sources\nbuilding\ninstalling\n");
}

#[tokio::test]
async fn terminal_update_finishes_the_job() {
    let h = harness();
    let job = claimed_job(&h).await;

    h.coordinator
        .update_progress(
            Some("n1"),
            Some("psk1"),
            &update_body(job.id, JobStatus::Running, None),
        )
        .await
        .unwrap();
    h.coordinator
        .update_progress(
            Some("n1"),
            Some("psk1"),
            &update_body(job.id, JobStatus::Finished, Some("Build was successful")),
        )
        .await
        .unwrap();

    let row = h.broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Finished);
    assert!(row.log.contains("Build was successful"));
}

#[tokio::test]
async fn failed_update_lands_directly_from_claimed() {
    let h = harness();
    let job = claimed_job(&h).await;

    h.coordinator
        .update_progress(
            Some("n1"),
            Some("psk1"),
            &update_body(job.id, JobStatus::Failed, Some("spawn failed")),
        )
        .await
        .unwrap();

    let row = h.broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
}

#[tokio::test]
async fn update_from_non_owner_node_is_refused() {
    let h = harness();
    let job = claimed_job(&h).await;
    h.registry.register("n2", "psk2", vec![]).await.unwrap();

    let err = h
        .coordinator
        .update_progress(
            Some("n2"),
            Some("psk2"),
            &update_body(job.id, JobStatus::Running, None),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(_)));

    let row = h.broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Claimed);
}

#[tokio::test]
async fn update_after_cancel_is_conflict() {
    let h = harness();
    let job = claimed_job(&h).await;
    h.coordinator.cancel(job.id).await.unwrap();

    let err = h
        .coordinator
        .update_progress(
            Some("n1"),
            Some("psk1"),
            &update_body(job.id, JobStatus::Finished, None),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(_)));

    // Cancel keeps the terminal state.
    let row = h.broker.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Canceled);
}

#[tokio::test]
async fn controller_owned_target_statuses_are_not_acceptable() {
    let h = harness();
    let job = claimed_job(&h).await;

    for status in [JobStatus::Created, JobStatus::Claimed, JobStatus::Canceled] {
        let err = h
            .coordinator
            .update_progress(
                Some("n1"),
                Some("psk1"),
                &update_body(job.id, status, None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotAcceptable(_)));
    }
}

#[tokio::test]
async fn malformed_update_body_is_not_acceptable() {
    let h = harness();
    claimed_job(&h).await;

    let err = h
        .coordinator
        .update_progress(Some("n1"), Some("psk1"), b"{\"nope\": true}")
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NotAcceptable("Invalid body")));
}

#[tokio::test]
async fn update_for_unknown_job_is_not_found() {
    let h = harness();
    h.registry.register("n1", "psk1", vec![]).await.unwrap();

    let err = h
        .coordinator
        .update_progress(
            Some("n1"),
            Some("psk1"),
            &update_body(Uuid::new_v4(), JobStatus::Running, None),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound(_)));
}

#[tokio::test]
async fn update_with_wrong_psk_is_unauthorized() {
    let h = harness();
    let job = claimed_job(&h).await;

    let err = h
        .coordinator
        .update_progress(
            Some("n1"),
            Some("wrong"),
            &update_body(job.id, JobStatus::Running, None),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Unauthorized {
            cause: Some("Invalid PSK")
        }
    ));
}
