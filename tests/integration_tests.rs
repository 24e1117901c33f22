//! Tests against a live Redis server at `LEASEQUEUE_REDIS_URL` (default
//! `redis://127.0.0.1:6379`). Run with `cargo test -- --ignored`.

use leasequeue::{
    handler_fn,
    store::{AckOutcome, JobStore, RedisStore},
    BackoffPolicy, ConnectionConfig, Delivery, Error, NewJob, Payload, PayloadHandler,
    ProcessOutcome, Queue, Result, WorkerOptions, WorkerScheduler,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct TestJob {
    id: String,
    should_succeed: bool,
}

impl TestJob {
    fn new(id: &str, should_succeed: bool) -> Self {
        Self {
            id: id.to_string(),
            should_succeed,
        }
    }
}

#[async_trait::async_trait]
impl Payload for TestJob {
    async fn process(&self) -> Result<()> {
        if self.should_succeed {
            println!("✅ Test job {} succeeded", self.id);
            Ok(())
        } else {
            println!("❌ Test job {} failed", self.id);
            Err(Error::HandlerFailure(format!(
                "Test job {} intentionally failed",
                self.id
            )))
        }
    }
}

fn redis_url() -> String {
    std::env::var("LEASEQUEUE_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Each test gets its own key prefix so tests can run in parallel
async fn setup_test_queue(prefix: &str, config: ConnectionConfig) -> Result<Queue> {
    let _ = env_logger::builder().is_test(true).try_init();
    let queue = Queue::builder()
        .connection(
            "default",
            config
                .key_prefix(format!("leasequeue-test-{}", prefix))
                .queue("jobs")
                .deadletter("dlq")
                .worker_interval(Duration::from_millis(1)),
        )
        .build()
        .await?;

    // Clear queues before each test
    queue.truncate().await?;
    Ok(queue)
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_basic_round_trip() -> Result<()> {
    let queue = setup_test_queue("round-trip", ConnectionConfig::redis(redis_url())).await?;

    queue.add(&json!({"name": "lenon"})).await?;
    assert_eq!(queue.length().await?, 1);

    let job = queue.pop().await?.expect("job should be available");
    assert_eq!(job.data, json!({"name": "lenon"}));
    assert_eq!(queue.length().await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_peek_and_ack() -> Result<()> {
    let queue = setup_test_queue("peek", ConnectionConfig::redis(redis_url()).attempts(2)).await?;
    let added = queue.add(&json!({"n": 1})).await?;

    let peeked = queue.peek().await?.expect("job should be available");
    assert_eq!(peeked.id, added.id);
    assert_eq!(peeked.attempts_left, 1);
    assert!(queue.peek().await?.is_none());
    assert_eq!(queue.length().await?, 1);

    queue.ack_strict(&peeked.id).await?;
    queue.ack(&peeked.id).await?;
    assert!(queue.is_empty().await?);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_ack_strict_on_unleased_job() -> Result<()> {
    let queue = setup_test_queue("strict", ConnectionConfig::redis(redis_url())).await?;
    let added = queue.add(&json!({})).await?;

    assert!(matches!(
        queue.ack_strict(&added.id).await,
        Err(Error::JobNotLeased(_))
    ));
    assert!(matches!(
        queue.ack_strict("missing").await,
        Err(Error::JobNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_lease_expiry_reclaim() -> Result<()> {
    let config = ConnectionConfig::redis(redis_url())
        .attempts(3)
        .visibility_timeout(Duration::from_millis(100));
    let queue = setup_test_queue("expiry", config).await?;
    let added = queue.add(&json!({})).await?;

    queue.peek().await?.unwrap();
    assert!(queue.peek().await?.is_none());

    time::sleep(Duration::from_millis(150)).await;
    let again = queue.peek().await?.unwrap();
    assert_eq!(again.id, added.id);
    assert_eq!(again.attempts_left, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_retry_then_recover() -> Result<()> {
    let config = ConnectionConfig::redis(redis_url())
        .attempts(2)
        .backoff(BackoffPolicy::fixed(Duration::from_millis(200)));
    let queue = setup_test_queue("retry", config).await?;
    queue.add(&json!({"n": 1})).await?;

    let attempts = Arc::new(Mutex::new(0));
    let handler = {
        let attempts = attempts.clone();
        handler_fn(move |delivery: Delivery| {
            let attempts = attempts.clone();
            async move {
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    *attempts += 1;
                    *attempts
                };
                if attempt == 1 {
                    return Err(Error::HandlerFailure("first attempt".to_string()));
                }
                delivery.ack().await
            }
        })
    };

    assert!(matches!(
        queue.process(&handler).await?,
        ProcessOutcome::Retrying { .. }
    ));
    assert_eq!(queue.process(&handler).await?, ProcessOutcome::Idle);

    time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        queue.process(&handler).await?,
        ProcessOutcome::Completed { .. }
    ));
    assert!(queue.is_empty().await?);
    assert_eq!(queue.queue("dlq").length().await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_dead_letter_queue() -> Result<()> {
    let queue = setup_test_queue("dlq", ConnectionConfig::redis(redis_url())).await?;
    queue.add(&TestJob::new("dlq_job", false)).await?;

    let outcome = queue.process(&PayloadHandler::<TestJob>::new()).await?;
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));

    let dlq = queue.queue("dlq");
    assert_eq!(dlq.length().await?, 1);
    let dead = dlq.pop().await?.unwrap();
    assert_eq!(dead.former_queue.as_deref(), Some("jobs"));
    assert_eq!(dead.attempts_left, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_concurrent_workers() -> Result<()> {
    let queue = setup_test_queue("concurrent", ConnectionConfig::redis(redis_url())).await?;
    for i in 0..10 {
        queue.add(&TestJob::new(&format!("concurrent_job_{}", i), true)).await?;
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        handler_fn(move |delivery: Delivery| {
            let seen = seen.clone();
            async move {
                let job: TestJob = delivery.data()?;
                seen.lock().unwrap().push(job.id);
                delivery.ack().await
            }
        })
    };

    let scheduler = WorkerScheduler::new(queue.registry().clone());
    let worker = scheduler.register_worker(
        "concurrent",
        WorkerOptions::new()
            .concurrency(3)
            .interval(Duration::from_millis(10))
            .initial_offset(Duration::ZERO),
        Arc::new(handler),
    );
    worker.start().await?;

    let deadline = time::Instant::now() + Duration::from_secs(5);
    while !queue.is_empty().await? && time::Instant::now() < deadline {
        time::sleep(Duration::from_millis(20)).await;
    }
    worker.stop();

    let seen = seen.lock().unwrap();
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(seen.len(), 10);
    assert_eq!(unique.len(), 10);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_stale_lease_cannot_settle() -> Result<()> {
    let store = RedisStore::open(&redis_url(), "leasequeue-test-stale")?;
    store.connect().await?;
    store.truncate("jobs").await?;
    store.add("jobs", NewJob::new(json!({}), 3)).await?;

    let stale = store.lease_next("jobs", Duration::from_millis(100)).await?.unwrap();
    time::sleep(Duration::from_millis(150)).await;
    let current = store.lease_next("jobs", Duration::from_secs(30)).await?.unwrap();
    assert_eq!(current.id, stale.id);

    assert_eq!(store.ack_leased("jobs", &stale).await?, AckOutcome::LeaseLost);
    assert!(!store.reschedule("jobs", &stale, Duration::ZERO).await?);
    assert!(store.lease_next("jobs", Duration::from_secs(30)).await?.is_none());

    assert_eq!(store.ack_leased("jobs", &current).await?, AckOutcome::Removed);
    assert_eq!(store.length("jobs").await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn test_connection_state_follows_connect_and_close() -> Result<()> {
    let store = Arc::new(RedisStore::open(&redis_url(), "leasequeue-test-state")?);
    store.connect().await?;
    assert!(store.is_connected());

    // a reconnect holds the connection slot for writing
    let reconnect = {
        let store = store.clone();
        tokio::spawn(async move { store.connect().await })
    };
    assert!(store.is_connected());
    reconnect
        .await
        .map_err(|e| Error::HandlerFailure(e.to_string()))??;
    assert!(store.is_connected());

    store.close().await?;
    assert!(!store.is_connected());
    Ok(())
}
