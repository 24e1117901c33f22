use leasequeue::{
    store::{AckOutcome, JobStore, MemoryStore},
    Error, NewJob, Result,
};
use serde_json::json;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::time;

async fn connected_store() -> Result<Arc<MemoryStore>> {
    let store = Arc::new(MemoryStore::new());
    store.connect().await?;
    Ok(store)
}

#[tokio::test]
async fn test_add_requires_connection() {
    let store = MemoryStore::new();
    let result = store.add("jobs", NewJob::new(json!({"n": 1}), 1)).await;
    assert!(matches!(result, Err(Error::StoreUnavailable(_))));
}

#[tokio::test]
async fn test_add_and_lease() -> Result<()> {
    let store = connected_store().await?;

    let added = store.add("jobs", NewJob::new(json!({"n": 1}), 3)).await?;
    assert_eq!(added.attempts_left, 3);
    assert!(added.reserved_until.is_none());
    assert!(added.former_queue.is_none());

    let leased = store
        .lease_next("jobs", Duration::from_secs(30))
        .await?
        .expect("job should be eligible");
    assert_eq!(leased.id, added.id);
    assert_eq!(leased.data, json!({"n": 1}));
    assert_eq!(leased.attempts_left, 2);
    assert!(leased.reserved_until.is_some());

    // still stored while leased
    assert_eq!(store.length("jobs").await?, 1);
    assert!(store.lease_next("jobs", Duration::from_secs(30)).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_lease_order_is_oldest_first() -> Result<()> {
    let store = connected_store().await?;
    let first = store.add("jobs", NewJob::new(json!(1), 1)).await?;
    let second = store.add("jobs", NewJob::new(json!(2), 1)).await?;
    let third = store.add("jobs", NewJob::new(json!(3), 1)).await?;

    let visibility = Duration::from_secs(30);
    let ids: Vec<String> = vec![
        store.lease_next("jobs", visibility).await?.unwrap().id,
        store.lease_next("jobs", visibility).await?.unwrap().id,
        store.lease_next("jobs", visibility).await?.unwrap().id,
    ];
    assert_eq!(ids, vec![first.id, second.id, third.id]);
    Ok(())
}

#[tokio::test]
async fn test_delayed_job_is_not_eligible() -> Result<()> {
    let store = connected_store().await?;
    store
        .add(
            "jobs",
            NewJob::new(json!({}), 1).delay(Duration::from_millis(80)),
        )
        .await?;

    assert!(store.lease_next("jobs", Duration::from_secs(1)).await?.is_none());
    time::sleep(Duration::from_millis(120)).await;
    assert!(store.lease_next("jobs", Duration::from_secs(1)).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_lease_exclusivity_under_concurrency() -> Result<()> {
    let store = connected_store().await?;
    for n in 0..20 {
        store.add("jobs", NewJob::new(json!({"n": n}), 1)).await?;
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(job) = store.lease_next("jobs", Duration::from_secs(30)).await? {
                ids.push(job.id);
            }
            Ok::<_, Error>(ids)
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.expect("lease task panicked")? {
            assert!(seen.insert(id), "job leased twice");
        }
    }
    assert_eq!(seen.len(), 20);
    Ok(())
}

#[tokio::test]
async fn test_attempts_decrease_with_each_lease() -> Result<()> {
    let store = connected_store().await?;
    store.add("jobs", NewJob::new(json!({}), 3)).await?;

    for expected in [2, 1, 0, 0] {
        let job = store
            .lease_next("jobs", Duration::from_millis(1))
            .await?
            .expect("expired lease should be reclaimed");
        assert_eq!(job.attempts_left, expected);
        time::sleep(Duration::from_millis(5)).await;
        store.release_expired_leases("jobs").await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_lease_expiry_reclaim() -> Result<()> {
    let store = connected_store().await?;
    let added = store.add("jobs", NewJob::new(json!({}), 2)).await?;

    store.lease_next("jobs", Duration::from_millis(100)).await?;
    assert_eq!(store.release_expired_leases("jobs").await?, 0);
    assert!(store.lease_next("jobs", Duration::from_secs(1)).await?.is_none());

    time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.release_expired_leases("jobs").await?, 1);
    assert!(store.snapshot("jobs")[0].reserved_until.is_none());

    let again = store.lease_next("jobs", Duration::from_secs(1)).await?.unwrap();
    assert_eq!(again.id, added.id);
    assert_eq!(again.attempts_left, 0);
    Ok(())
}

#[tokio::test]
async fn test_ack_outcomes() -> Result<()> {
    let store = connected_store().await?;
    let added = store.add("jobs", NewJob::new(json!({}), 1)).await?;

    assert_eq!(store.ack("jobs", &added.id).await?, AckOutcome::NotLeased);
    assert_eq!(store.ack("jobs", "missing").await?, AckOutcome::NotFound);
    assert_eq!(store.ack("other", &added.id).await?, AckOutcome::NotFound);

    store.lease_next("jobs", Duration::from_secs(30)).await?;
    assert_eq!(store.ack("jobs", &added.id).await?, AckOutcome::Removed);
    assert_eq!(store.ack("jobs", &added.id).await?, AckOutcome::NotFound);
    assert_eq!(store.length("jobs").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_take_next_removes() -> Result<()> {
    let store = connected_store().await?;
    store.add("jobs", NewJob::new(json!({"name": "lenon"}), 2)).await?;

    let job = store.take_next("jobs").await?.unwrap();
    assert_eq!(job.data, json!({"name": "lenon"}));
    assert_eq!(job.attempts_left, 1);
    assert_eq!(store.length("jobs").await?, 0);
    assert!(store.take_next("jobs").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_reschedule_clears_lease() -> Result<()> {
    let store = connected_store().await?;
    store.add("jobs", NewJob::new(json!({}), 2)).await?;
    let job = store.lease_next("jobs", Duration::from_secs(30)).await?.unwrap();

    store
        .reschedule("jobs", &job, Duration::from_millis(60))
        .await?;
    let stored = &store.snapshot("jobs")[0];
    assert!(stored.reserved_until.is_none());
    assert!(stored.available_at >= job.available_at + 60);

    assert!(store.lease_next("jobs", Duration::from_secs(30)).await?.is_none());
    time::sleep(Duration::from_millis(100)).await;
    assert!(store.lease_next("jobs", Duration::from_secs(30)).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_queues_are_isolated_and_truncate() -> Result<()> {
    let store = connected_store().await?;
    store.add("a", NewJob::new(json!(1), 1)).await?;
    store.add("a", NewJob::new(json!(2), 1)).await?;
    store.add("b", NewJob::new(json!(3), 1)).await?;

    assert_eq!(store.length("a").await?, 2);
    assert_eq!(store.length("b").await?, 1);
    assert_eq!(store.length("c").await?, 0);

    store.truncate("a").await?;
    assert_eq!(store.length("a").await?, 0);
    assert_eq!(store.length("b").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_close_makes_store_unavailable() -> Result<()> {
    let store = connected_store().await?;
    store.add("jobs", NewJob::new(json!({}), 1)).await?;
    store.close().await?;

    assert!(!store.is_connected());
    assert!(matches!(
        store.length("jobs").await,
        Err(Error::StoreUnavailable(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_stale_lease_cannot_settle() -> Result<()> {
    let store = connected_store().await?;
    store.add("jobs", NewJob::new(json!({}), 3)).await?;

    let stale = store.lease_next("jobs", Duration::from_millis(20)).await?.unwrap();
    time::sleep(Duration::from_millis(40)).await;
    let current = store.lease_next("jobs", Duration::from_secs(30)).await?.unwrap();
    assert_eq!(current.id, stale.id);

    assert_eq!(store.ack_leased("jobs", &stale).await?, AckOutcome::LeaseLost);
    assert!(!store.reschedule("jobs", &stale, Duration::ZERO).await?);
    assert_eq!(store.snapshot("jobs")[0].reserved_until, current.reserved_until);

    assert_eq!(store.ack_leased("jobs", &current).await?, AckOutcome::Removed);
    assert_eq!(store.ack_leased("jobs", &current).await?, AckOutcome::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_released_lease_cannot_settle() -> Result<()> {
    let store = connected_store().await?;
    store.add("jobs", NewJob::new(json!({}), 3)).await?;

    let leased = store.lease_next("jobs", Duration::from_millis(20)).await?.unwrap();
    time::sleep(Duration::from_millis(40)).await;
    store.release_expired_leases("jobs").await?;

    assert_eq!(store.ack_leased("jobs", &leased).await?, AckOutcome::NotLeased);
    assert!(!store.reschedule("jobs", &leased, Duration::ZERO).await?);
    assert_eq!(store.length("jobs").await?, 1);
    Ok(())
}
