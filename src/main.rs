use leasequeue::{
    BackoffPolicy, ConnectionConfig, Payload, PayloadHandler, Queue, Result, WorkerOptions,
    WorkerScheduler,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::signal;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct DemoJob {
    id: String,
    message: String,
    should_fail: bool,
}

#[async_trait::async_trait]
impl Payload for DemoJob {
    async fn process(&self) -> Result<()> {
        println!("🔄 Processing demo job: {} - {}", self.id, self.message);

        // Simulate some work
        tokio::time::sleep(Duration::from_millis(200)).await;

        if self.should_fail {
            println!("❌ Job {} intentionally failed", self.id);
            Err(leasequeue::Error::HandlerFailure(
                "Intentional failure for demo".to_string(),
            ))
        } else {
            println!("✅ Job {} completed successfully", self.id);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("🚀 LeaseQueue Demo");
    println!("==================");

    let queue = Queue::builder()
        .connection(
            "default",
            ConnectionConfig::memory()
                .queue("demo")
                .deadletter("demo_failed")
                .attempts(3)
                .backoff(BackoffPolicy::exponential(Duration::from_secs(1)))
                .worker_interval(Duration::from_millis(250)),
        )
        .build()
        .await?;

    let demo_jobs = vec![
        DemoJob {
            id: "job_1".to_string(),
            message: "This job will succeed".to_string(),
            should_fail: false,
        },
        DemoJob {
            id: "job_2".to_string(),
            message: "This job will fail and retry".to_string(),
            should_fail: true,
        },
        DemoJob {
            id: "job_3".to_string(),
            message: "Another successful job".to_string(),
            should_fail: false,
        },
    ];

    for job in &demo_jobs {
        let added = queue.add(job).await?;
        println!("📝 Enqueued job: {}", added.id);
    }

    println!("📊 Jobs in queue: {}", queue.length().await?);

    let scheduler = WorkerScheduler::new(queue.registry().clone());
    let worker = scheduler.register_worker(
        "demo",
        WorkerOptions::new().concurrency(2),
        Arc::new(PayloadHandler::<DemoJob>::new()),
    );

    println!("\n🔄 Starting worker...");
    println!("Note: Failed jobs will be retried with exponential backoff");
    println!("Press Ctrl+C to stop\n");
    worker.start().await?;

    match signal::ctrl_c().await {
        Ok(()) => {
            println!("\n🛑 Received Ctrl+C signal. Shutting down gracefully...");
        }
        Err(err) => {
            eprintln!("Unable to listen for shutdown signal: {}", err);
        }
    }

    worker.stop();
    println!(
        "📊 Jobs in dead letter queue: {}",
        queue.queue("demo_failed").length().await?
    );
    queue.close().await?;

    println!("✅ Shutdown complete.");
    Ok(())
}
