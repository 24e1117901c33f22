use crate::{
    error::{Error, Result},
    job::{add_millis, now_millis, Job, NewJob},
    store::{AckOutcome, JobStore},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

/// Ephemeral in-process backend.
///
/// Every operation runs under one lock and never awaits while holding it, so a
/// lease is granted and recorded in a single step.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, Vec<Job>>>,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the jobs currently held for `queue`, in insertion order
    pub fn snapshot(&self, queue: &str) -> Vec<Job> {
        self.lock().get(queue).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Job>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected_queues(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Job>>>> {
        if !self.is_connected() {
            return Err(Error::StoreUnavailable(
                "memory store is not connected".to_string(),
            ));
        }
        Ok(self.lock())
    }
}

/// Index of the oldest eligible job, ties broken by creation then insertion order
fn next_eligible(jobs: &[Job], now: i64) -> Option<usize> {
    jobs.iter()
        .enumerate()
        .filter(|(_, job)| job.is_eligible(now))
        .min_by_key(|(index, job)| (job.available_at, job.created_at, *index))
        .map(|(index, _)| index)
}

#[async_trait]
impl JobStore for MemoryStore {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add(&self, queue: &str, new: NewJob) -> Result<Job> {
        let job = Job::from_new(uuid::Uuid::now_v7().to_string(), queue, new, now_millis());
        self.connected_queues()?
            .entry(queue.to_string())
            .or_default()
            .push(job.clone());
        Ok(job)
    }

    async fn lease_next(&self, queue: &str, visibility: Duration) -> Result<Option<Job>> {
        let now = now_millis();
        let mut queues = self.connected_queues()?;
        let Some(jobs) = queues.get_mut(queue) else {
            return Ok(None);
        };

        Ok(next_eligible(jobs, now).map(|index| {
            let job = &mut jobs[index];
            job.grant_lease(now, visibility);
            job.clone()
        }))
    }

    async fn take_next(&self, queue: &str) -> Result<Option<Job>> {
        let now = now_millis();
        let mut queues = self.connected_queues()?;
        let Some(jobs) = queues.get_mut(queue) else {
            return Ok(None);
        };

        Ok(next_eligible(jobs, now).map(|index| {
            let mut job = jobs.remove(index);
            job.grant_lease(now, Duration::ZERO);
            job
        }))
    }

    async fn ack(&self, queue: &str, job_id: &str) -> Result<AckOutcome> {
        let mut queues = self.connected_queues()?;
        let Some(jobs) = queues.get_mut(queue) else {
            return Ok(AckOutcome::NotFound);
        };

        match jobs.iter().position(|job| job.id == job_id) {
            None => Ok(AckOutcome::NotFound),
            Some(index) if jobs[index].reserved_until.is_none() => Ok(AckOutcome::NotLeased),
            Some(index) => {
                jobs.remove(index);
                Ok(AckOutcome::Removed)
            }
        }
    }

    async fn ack_leased(&self, queue: &str, job: &Job) -> Result<AckOutcome> {
        let mut queues = self.connected_queues()?;
        let Some(jobs) = queues.get_mut(queue) else {
            return Ok(AckOutcome::NotFound);
        };

        match jobs.iter().position(|stored| stored.id == job.id) {
            None => Ok(AckOutcome::NotFound),
            Some(index) if jobs[index].reserved_until.is_none() => Ok(AckOutcome::NotLeased),
            Some(index) if !jobs[index].same_lease(job) => Ok(AckOutcome::LeaseLost),
            Some(index) => {
                jobs.remove(index);
                Ok(AckOutcome::Removed)
            }
        }
    }

    async fn reschedule(&self, queue: &str, job: &Job, delay: Duration) -> Result<bool> {
        let available_at = add_millis(now_millis(), delay);
        let mut queues = self.connected_queues()?;
        match queues
            .get_mut(queue)
            .and_then(|jobs| jobs.iter_mut().find(|stored| stored.id == job.id))
        {
            Some(stored) if stored.same_lease(job) => {
                stored.reschedule(available_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_expired_leases(&self, queue: &str) -> Result<u64> {
        let now = now_millis();
        let mut queues = self.connected_queues()?;
        let mut released = 0;
        for job in queues.get_mut(queue).into_iter().flatten() {
            if job.reserved_until.is_some_and(|until| until <= now) {
                job.reserved_until = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn length(&self, queue: &str) -> Result<u64> {
        Ok(self
            .connected_queues()?
            .get(queue)
            .map_or(0, |jobs| jobs.len() as u64))
    }

    async fn truncate(&self, queue: &str) -> Result<()> {
        self.connected_queues()?.remove(queue);
        Ok(())
    }
}
