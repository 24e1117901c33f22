//! # LeaseQueue - Pluggable Job Queue Library
//!
//! Lease-based job processing over interchangeable backends (in-process
//! memory, a relational table, a remote message-queue service, Redis) with
//! attempt budgets, retry backoff, dead letter queues and a polling worker
//! scheduler.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use leasequeue::{
//!     handler_fn, BackoffPolicy, ConnectionConfig, Queue, WorkerOptions, WorkerScheduler,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() -> leasequeue::Result<()> {
//!     let queue = Queue::builder()
//!         .connection(
//!             "default",
//!             ConnectionConfig::memory()
//!                 .queue("emails")
//!                 .deadletter("emails_failed")
//!                 .attempts(3)
//!                 .backoff(BackoffPolicy::exponential(Duration::from_secs(1))),
//!         )
//!         .build()
//!         .await?;
//!
//!     queue.add(&serde_json::json!({"to": "user@example.com"})).await?;
//!
//!     let scheduler = WorkerScheduler::new(queue.registry().clone());
//!     let worker = scheduler.register_worker(
//!         "mailer",
//!         WorkerOptions::new(),
//!         Arc::new(handler_fn(|delivery: leasequeue::Delivery| async move {
//!             println!("Sending email to: {}", delivery.job().data["to"]);
//!             delivery.ack().await
//!         })),
//!     );
//!     worker.start().await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     worker.stop();
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod driver;
pub mod error;
pub mod job;
pub mod queue;
pub mod registry;
pub mod store;
pub mod worker;

pub use backoff::{BackoffKind, BackoffPolicy};
pub use config::{ConnectionConfig, DriverKind, QueueConfig, QueueConfigBuilder};
pub use driver::{AddOptions, Driver, FailureRecord, ProcessOutcome};
pub use error::{Error, Result};
pub use job::{handler_fn, Delivery, Job, JobHandler, NewJob, Payload, PayloadHandler};
pub use queue::{Queue, QueueBuilder};
pub use registry::{ConnectionRegistry, StoreFactory};
pub use store::{AckOutcome, JobStore};
pub use worker::{WorkerHandle, WorkerOptions, WorkerScheduler};

// Re-export commonly used types
pub use serde_json::Value as JsonValue;
