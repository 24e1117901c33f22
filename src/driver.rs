use crate::{
    backoff,
    config::ConnectionConfig,
    error::{Error, Result},
    job::{Delivery, Job, JobHandler, NewJob},
    store::{AckOutcome, JobStore},
};
use serde::Serialize;
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

/// Per-job overrides for `add_with`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddOptions {
    pub attempts: Option<u32>,
    pub delay: Duration,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the connection's attempt budget
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Keep the job unavailable for `delay`
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What one `process` cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No eligible job
    Idle,
    /// The handler acked the job
    Completed { job_id: String },
    /// The handler returned without acking; the job comes back after `delay`
    Released { job_id: String, delay: Duration },
    /// The handler failed with attempts left; the job comes back after `delay`
    Retrying { job_id: String, delay: Duration },
    /// The handler failed on the last attempt; the job left the queue
    DeadLettered {
        job_id: String,
        deadletter: Option<String>,
    },
    /// The job was no longer under this delivery's lease when the cycle went
    /// to settle it. Whoever holds it now keeps it.
    LeaseLost { job_id: String },
}

/// Structured record emitted for every failed handler invocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub message: String,
    pub queue_name: String,
    pub deadletter_name: Option<String>,
    pub error_name: &'static str,
    pub error_code: &'static str,
    /// The error followed by its source chain
    pub stack: Vec<String>,
    pub job: Option<Job>,
}

impl FailureRecord {
    pub fn new(error: &Error, queue: &str, deadletter: Option<&str>, job: Option<&Job>) -> Self {
        let mut stack = vec![error.to_string()];
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = std::error::Error::source(cause);
        }

        Self {
            message: error.to_string(),
            queue_name: queue.to_string(),
            deadletter_name: deadletter.map(str::to_string),
            error_name: error.name(),
            error_code: error.code(),
            stack,
            job: job.cloned(),
        }
    }

    /// Emit the record as one JSON line
    pub fn log(&self) {
        match serde_json::to_string(self) {
            Ok(line) => log::error!(target: "leasequeue::failure", "{}", line),
            Err(e) => log::error!(
                target: "leasequeue::failure",
                "{} (queue {}; record not serializable: {})",
                self.message,
                self.queue_name,
                e
            ),
        }
    }
}

struct DriverInner {
    connection: String,
    queue: String,
    config: ConnectionConfig,
    store: Arc<dyn JobStore>,
}

/// One logical queue on one job store.
///
/// Cloning shares the instance; `with_queue` creates a new instance on the
/// same store.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    pub fn new<S: Into<String>>(
        connection: S,
        config: ConnectionConfig,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let queue = config.queue.clone();
        Self::build(connection.into(), queue, config, store)
    }

    fn build(
        connection: String,
        queue: String,
        config: ConnectionConfig,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                connection,
                queue,
                config,
                store,
            }),
        }
    }

    /// Driver for another logical queue of the same store
    pub fn with_queue<S: Into<String>>(&self, queue: S) -> Self {
        Self::build(
            self.inner.connection.clone(),
            queue.into(),
            self.inner.config.clone(),
            Arc::clone(&self.inner.store),
        )
    }

    pub fn connection_name(&self) -> &str {
        &self.inner.connection
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    pub fn deadletter_name(&self) -> Option<&str> {
        self.inner.config.deadletter.as_deref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub async fn connect(&self) -> Result<()> {
        self.inner.store.connect().await
    }

    /// Close the underlying store. Other drivers sharing the connection lose
    /// it too.
    pub async fn close(&self) -> Result<()> {
        self.inner.store.close().await
    }

    /// Enqueue a job with the connection's attempt budget
    pub async fn add<T>(&self, data: &T) -> Result<Job>
    where
        T: Serialize + ?Sized,
    {
        self.add_with(data, AddOptions::default()).await
    }

    /// Enqueue a job with per-job overrides
    pub async fn add_with<T>(&self, data: &T, options: AddOptions) -> Result<Job>
    where
        T: Serialize + ?Sized,
    {
        let attempts = options.attempts.unwrap_or(self.inner.config.attempts);
        let new = NewJob::new(serde_json::to_value(data)?, attempts).delay(options.delay);
        let job = self.inner.store.add(self.queue_name(), new).await?;

        log::info!(
            "Added job {} to queue {} ({} attempts, available in {:?})",
            job.id,
            job.queue,
            attempts,
            options.delay
        );
        Ok(job)
    }

    /// Lease the next eligible job and remove it from the queue
    pub async fn pop(&self) -> Result<Option<Job>> {
        let store = &self.inner.store;
        store.release_expired_leases(self.queue_name()).await?;
        store.take_next(self.queue_name()).await
    }

    /// Lease the next eligible job without removing it. The job stays hidden
    /// for the visibility timeout and must be acked. Backends without
    /// non-destructive reads return `None`.
    pub async fn peek(&self) -> Result<Option<Job>> {
        let store = &self.inner.store;
        if !store.supports_peek() {
            log::debug!(
                "peek is not supported by the {} backend of connection {}",
                store.kind(),
                self.connection_name()
            );
            return Ok(None);
        }
        self.lease().await
    }

    async fn lease(&self) -> Result<Option<Job>> {
        let store = &self.inner.store;
        store.release_expired_leases(self.queue_name()).await?;
        store
            .lease_next(self.queue_name(), self.inner.config.visibility_timeout)
            .await
    }

    /// Acknowledge a leased job. Unknown or unleased ids are a no-op.
    pub async fn ack(&self, job_id: &str) -> Result<()> {
        match self.inner.store.ack(self.queue_name(), job_id).await? {
            AckOutcome::Removed => {
                log::debug!("Acked job {} on queue {}", job_id, self.queue_name());
            }
            outcome => log::debug!(
                "Ignoring ack of job {} on queue {}: {:?}",
                job_id,
                self.queue_name(),
                outcome
            ),
        }
        Ok(())
    }

    /// Acknowledge a leased job, reporting unknown or unleased ids
    pub async fn ack_strict(&self, job_id: &str) -> Result<()> {
        match self.inner.store.ack(self.queue_name(), job_id).await? {
            AckOutcome::Removed => Ok(()),
            AckOutcome::NotFound => Err(Error::JobNotFound(job_id.to_string())),
            AckOutcome::NotLeased | AckOutcome::LeaseLost => {
                Err(Error::JobNotLeased(job_id.to_string()))
            }
        }
    }

    /// Acknowledge `job` under the lease it was leased with
    pub(crate) async fn ack_leased(&self, job: &Job) -> Result<AckOutcome> {
        let outcome = self.inner.store.ack_leased(self.queue_name(), job).await?;
        match outcome {
            AckOutcome::Removed => {
                log::debug!("Acked job {} on queue {}", job.id, self.queue_name())
            }
            AckOutcome::LeaseLost => log::warn!(
                "Ignoring ack of job {} on queue {}: it was leased again",
                job.id,
                self.queue_name()
            ),
            outcome => log::debug!(
                "Ignoring ack of job {} on queue {}: {:?}",
                job.id,
                self.queue_name(),
                outcome
            ),
        }
        Ok(outcome)
    }

    pub async fn length(&self) -> Result<u64> {
        self.inner.store.length(self.queue_name()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.length().await? == 0)
    }

    /// Empty the queue and its dead letter queue
    pub async fn truncate(&self) -> Result<()> {
        self.inner.store.truncate(self.queue_name()).await?;
        if let Some(deadletter) = self.deadletter_name() {
            self.inner.store.truncate(deadletter).await?;
        }
        Ok(())
    }

    /// Requeue jitter plus floor and cap of the backend
    fn requeue_delay(&self, delay: Duration) -> Duration {
        let store = &self.inner.store;
        let delay = delay + backoff::requeue_jitter(self.inner.config.worker_interval);
        let delay = delay.max(store.min_delay());
        match store.max_delay() {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Lease one job and run `handler` on it.
    ///
    /// Handler errors never escape: they are logged and turn into a retry or
    /// a dead-letter move. Store errors are returned to the caller.
    pub async fn process(&self, handler: &dyn JobHandler) -> Result<ProcessOutcome> {
        let Some(job) = self.lease().await? else {
            return Ok(ProcessOutcome::Idle);
        };

        log::debug!(
            "Processing job {} from queue {} ({} attempts left)",
            job.id,
            self.queue_name(),
            job.attempts_left
        );

        let delivery = Delivery::new(job.clone(), self.clone());
        let acked = delivery.acked_flag();
        let result = handler.handle(delivery).await;
        let acked = acked.load(Ordering::SeqCst);

        match result {
            Ok(()) if acked => {
                log::info!("Job {} processed successfully!", job.id);
                Ok(ProcessOutcome::Completed { job_id: job.id })
            }
            Ok(()) => self.release_unacked(job).await,
            Err(error) => self.handle_failure(job, error, acked).await,
        }
    }

    fn lease_lost(&self, job: Job) -> ProcessOutcome {
        log::warn!(
            "Lease on job {} from queue {} ended before the job was settled; leaving it to its current holder",
            job.id,
            self.queue_name()
        );
        ProcessOutcome::LeaseLost { job_id: job.id }
    }

    async fn release_unacked(&self, job: Job) -> Result<ProcessOutcome> {
        let delay = self.requeue_delay(self.inner.config.no_ack_delay);
        if !self
            .inner
            .store
            .reschedule(self.queue_name(), &job, delay)
            .await?
        {
            return Ok(self.lease_lost(job));
        }

        log::info!(
            "Job {} returned without ack; redelivering in {:?}",
            job.id,
            delay
        );
        Ok(ProcessOutcome::Released {
            job_id: job.id,
            delay,
        })
    }

    async fn handle_failure(
        &self,
        job: Job,
        error: Error,
        acked: bool,
    ) -> Result<ProcessOutcome> {
        FailureRecord::new(&error, self.queue_name(), self.deadletter_name(), Some(&job)).log();

        if acked {
            log::warn!("Job {} failed after it was acked; not retrying", job.id);
            return Ok(ProcessOutcome::Completed { job_id: job.id });
        }

        if job.attempts_left > 0 {
            let backoff_delay =
                backoff::delay(job.attempts_consumed(), self.inner.config.backoff.as_ref());
            let delay = self.requeue_delay(backoff_delay);
            if !self
                .inner
                .store
                .reschedule(self.queue_name(), &job, delay)
                .await?
            {
                return Ok(self.lease_lost(job));
            }

            log::info!(
                "Job {} failed. Retrying in {:?} ({} attempts left)",
                job.id,
                delay,
                job.attempts_left
            );
            return Ok(ProcessOutcome::Retrying {
                job_id: job.id,
                delay,
            });
        }

        let outcome = self.inner.store.ack_leased(self.queue_name(), &job).await?;
        if outcome != AckOutcome::Removed {
            return Ok(self.lease_lost(job));
        }

        let deadletter = self.deadletter_name().map(str::to_string);
        match &deadletter {
            Some(name) => {
                self.inner
                    .store
                    .add(name, NewJob::dead_letter_of(&job))
                    .await?;
                log::warn!(
                    "Moving job {} to dead letter queue {} after {} failed attempts",
                    job.id,
                    name,
                    job.attempts
                );
            }
            None => log::warn!(
                "Discarding job {} after {} failed attempts (no dead letter queue)",
                job.id,
                job.attempts
            ),
        }

        Ok(ProcessOutcome::DeadLettered {
            job_id: job.id,
            deadletter,
        })
    }
}
