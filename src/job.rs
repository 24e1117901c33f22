use crate::{
    driver::Driver,
    error::Result,
    store::AckOutcome,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt::Debug,
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn add_millis(at: i64, delay: Duration) -> i64 {
    at.saturating_add(delay.as_millis().min(i64::MAX as u128) as i64)
}

/// A unit of work stored in a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub data: serde_json::Value,
    /// Attempt budget the job was created with
    pub attempts: u32,
    pub attempts_left: u32,
    pub available_at: i64,
    pub reserved_until: Option<i64>,
    pub created_at: i64,
    /// Origin queue, set on dead-lettered copies only
    pub former_queue: Option<String>,
}

impl Job {
    pub(crate) fn from_new(id: String, queue: &str, new: NewJob, now: i64) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            data: new.data,
            attempts: new.attempts,
            attempts_left: new.attempts,
            available_at: add_millis(now, new.delay),
            reserved_until: None,
            created_at: now,
            former_queue: new.former_queue,
        }
    }

    /// Eligible for lease: available and not under a live lease
    pub fn is_eligible(&self, now: i64) -> bool {
        self.available_at <= now && self.reserved_until.map_or(true, |until| until <= now)
    }

    /// Held by a live lease
    pub fn is_leased(&self, now: i64) -> bool {
        self.reserved_until.is_some_and(|until| until > now)
    }

    /// Whether this stored job is still under the lease `leased` was granted
    pub fn same_lease(&self, leased: &Job) -> bool {
        self.reserved_until.is_some()
            && self.reserved_until == leased.reserved_until
            && self.attempts_left == leased.attempts_left
    }

    /// Attempts used so far
    pub fn attempts_consumed(&self) -> u32 {
        self.attempts.saturating_sub(self.attempts_left)
    }

    pub(crate) fn grant_lease(&mut self, now: i64, visibility: Duration) {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        self.reserved_until = Some(add_millis(now, visibility));
    }

    pub(crate) fn reschedule(&mut self, available_at: i64) {
        self.reserved_until = None;
        self.available_at = available_at;
    }

    /// Deserialize the payload into a typed value
    pub fn deserialize_data<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Insert request for a job store
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub data: serde_json::Value,
    pub attempts: u32,
    pub delay: Duration,
    pub former_queue: Option<String>,
}

impl NewJob {
    pub fn new(data: serde_json::Value, attempts: u32) -> Self {
        Self {
            data,
            attempts,
            delay: Duration::ZERO,
            former_queue: None,
        }
    }

    /// Make the job unavailable for `delay`
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Dead-letter copy of `job`: no attempts left, origin recorded
    pub fn dead_letter_of(job: &Job) -> Self {
        Self {
            data: job.data.clone(),
            attempts: 0,
            delay: Duration::ZERO,
            former_queue: Some(job.queue.clone()),
        }
    }
}

/// A leased job handed to a handler, with the means to acknowledge it.
/// Clones share the acknowledgement.
#[derive(Clone)]
pub struct Delivery {
    job: Job,
    driver: Driver,
    acked: Arc<AtomicBool>,
}

impl Delivery {
    pub(crate) fn new(job: Job, driver: Driver) -> Self {
        Self {
            job,
            driver,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn acked_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.acked)
    }

    /// Whether this delivery has been acknowledged
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Deserialize the payload into a typed value
    pub fn data<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.job.deserialize_data()
    }

    /// Acknowledge the job, removing it from its queue. A no-op once the
    /// lease has passed to another worker.
    pub async fn ack(&self) -> Result<()> {
        if self.driver.ack_leased(&self.job).await? == AckOutcome::Removed {
            self.acked.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("job", &self.job)
            .field("connection", &self.driver.connection_name())
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Processing logic invoked once per leased job.
///
/// Returning `Err` schedules a retry or dead-letters the job. Returning `Ok`
/// without calling `Delivery::ack` releases the job for redelivery.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<()>;
}

/// Handler backed by an async closure, see `handler_fn`
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a `JobHandler`
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        (self.f)(delivery).await
    }
}

/// Typed job payload that knows how to process itself
#[async_trait]
pub trait Payload: Send + Sync + Debug {
    /// Process the payload. Return Ok(()) if successful, Err if it should be retried
    async fn process(&self) -> Result<()>;
}

/// Handler that deserializes `T` from the job data, processes it and acks on success
pub struct PayloadHandler<T>
where
    T: Payload + for<'de> Deserialize<'de>,
{
    _phantom: PhantomData<fn() -> T>,
}

impl<T> PayloadHandler<T>
where
    T: Payload + for<'de> Deserialize<'de>,
{
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for PayloadHandler<T>
where
    T: Payload + for<'de> Deserialize<'de>,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> JobHandler for PayloadHandler<T>
where
    T: Payload + for<'de> Deserialize<'de> + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        let payload: T = delivery.data()?;
        payload.process().await?;
        delivery.ack().await
    }
}
