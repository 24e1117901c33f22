//! Job stores: the physical representation of one backend kind.
//!
//! A store holds every logical queue of one connection, addressed by name.
//! All stores share the eligibility rule of [`Job::is_eligible`]: a job may be
//! leased when `available_at <= now` and it carries no live lease.

use crate::{
    error::Result,
    job::{Job, NewJob},
};
use async_trait::async_trait;
use std::time::Duration;

pub mod database;
pub mod local_remote;
pub mod memory;
pub mod redis;
pub mod remote;
pub mod table;

pub use database::DatabaseStore;
pub use local_remote::LocalRemoteQueue;
pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use remote::{RemoteMessage, RemoteQueueClient, RemoteStore};
pub use table::{Column, Filter, JobRow, MemoryTable, RowUpdate, TableOps};

/// Result of acknowledging a job id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The job was leased and is now gone
    Removed,
    NotFound,
    /// The job exists but carries no lease
    NotLeased,
    /// The job is held under a newer lease than the one presented
    LeaseLost,
}

/// Storage contract every backend implements
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Backend kind, used in logs
    fn kind(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Insert a new job, available after `job.delay`
    async fn add(&self, queue: &str, job: NewJob) -> Result<Job>;

    /// Lease the oldest eligible job: decrement its attempts, hide it for
    /// `visibility` and return a copy. Never hands one job to two callers.
    async fn lease_next(&self, queue: &str, visibility: Duration) -> Result<Option<Job>>;

    /// Lease the oldest eligible job and remove it in the same step
    async fn take_next(&self, queue: &str) -> Result<Option<Job>>;

    /// Whether `lease_next` can serve a non-consuming peek
    fn supports_peek(&self) -> bool {
        true
    }

    /// Smallest requeue delay the backend resolves
    fn min_delay(&self) -> Duration {
        Duration::from_millis(1)
    }

    /// Largest requeue delay the backend accepts
    fn max_delay(&self) -> Option<Duration> {
        None
    }

    /// Remove a leased job. Unknown or unleased ids are reported, never raised.
    async fn ack(&self, queue: &str, job_id: &str) -> Result<AckOutcome>;

    /// Remove `job` only while it is still held under the lease it was
    /// returned with. A job re-leased since reports `LeaseLost`.
    async fn ack_leased(&self, queue: &str, job: &Job) -> Result<AckOutcome>;

    /// Clear the lease of `job` and make it eligible again after `delay`.
    /// Returns `false`, changing nothing, when the job is gone or held under
    /// another lease.
    async fn reschedule(&self, queue: &str, job: &Job, delay: Duration) -> Result<bool>;

    /// Clear every lease that expired, returning how many were cleared
    async fn release_expired_leases(&self, queue: &str) -> Result<u64>;

    /// Number of jobs in the queue, leased ones included
    async fn length(&self, queue: &str) -> Result<u64>;

    /// Remove every job of the queue
    async fn truncate(&self, queue: &str) -> Result<()>;
}
