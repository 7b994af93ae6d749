use std::sync::Arc;

use futures::StreamExt;
use iglu_scheduler::broker::{MemoryBroker, QueueStore, CHANNEL_BUILD};
use iglu_scheduler::scheduler::job::{BuildChannelMessage, Job};
use iglu_scheduler::scheduler::BuildQueue;

fn setup() -> (Arc<MemoryBroker>, BuildQueue) {
    let broker = Arc::new(MemoryBroker::new());
    let queue = BuildQueue::new(broker.clone());
    (broker, queue)
}

#[tokio::test]
async fn advertise_pushes_entry_with_publish_time() {
    let (_, queue) = setup();
    let job = Job::new("b1");

    let before = chrono::Utc::now();
    let entry = queue.advertise(&job).await.unwrap();
    let after = chrono::Utc::now();

    assert_eq!(entry.job_id, job.id);
    assert_eq!(entry.builder_id, "b1");
    assert!(entry.published_at >= before && entry.published_at <= after);

    assert_eq!(queue.len().await.unwrap(), 1);
    let snapshot = queue.snapshot().await.unwrap();
    assert_eq!(snapshot, vec![entry]);
}

#[tokio::test]
async fn advertise_announces_on_build_channel() {
    let (broker, queue) = setup();
    let mut adverts = broker.subscribe(CHANNEL_BUILD).await.unwrap();

    let job = Job::new("b1");
    queue.advertise(&job).await.unwrap();

    let msg = tokio::time::timeout(std::time::Duration::from_secs(1), adverts.next())
        .await
        .expect("advert should arrive")
        .expect("channel open");
    match serde_json::from_str::<BuildChannelMessage>(&msg).unwrap() {
        BuildChannelMessage::Queue { job_id, builder_id } => {
            assert_eq!(job_id, job.id);
            assert_eq!(builder_id, "b1");
        }
        other => panic!("expected queue advert, got {other:?}"),
    }
}

#[tokio::test]
async fn remove_returns_entry_exactly_once() {
    let (_, queue) = setup();
    let job = Job::new("b1");
    queue.advertise(&job).await.unwrap();

    let first = queue.remove(job.id).await.unwrap();
    assert!(first.is_some());
    let second = queue.remove(job.id).await.unwrap();
    assert!(second.is_none());
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn remove_unknown_job_is_none() {
    let (_, queue) = setup();
    let job = Job::new("b1");
    queue.advertise(&job).await.unwrap();

    let removed = queue.remove(uuid::Uuid::new_v4()).await.unwrap();
    assert!(removed.is_none());
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn queue_orders_multiple_advertisements() {
    let (_, queue) = setup();
    let jobs: Vec<Job> = (0..3).map(|i| Job::new(format!("b{i}"))).collect();
    for job in &jobs {
        queue.advertise(job).await.unwrap();
    }

    assert_eq!(queue.len().await.unwrap(), 3);
    let snapshot = queue.snapshot().await.unwrap();
    let ids: Vec<_> = snapshot.iter().map(|e| e.job_id).collect();
    assert_eq!(ids, jobs.iter().map(|j| j.id).collect::<Vec<_>>());
}
