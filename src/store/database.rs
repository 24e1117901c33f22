use crate::{
    error::{Error, Result},
    job::{add_millis, now_millis, Job, NewJob},
    store::{
        table::{Column, Filter, JobRow, RowUpdate, TableOps},
        AckOutcome, JobStore,
    },
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

const ELIGIBLE_ORDER: [Column; 3] = [Column::AvailableAt, Column::CreatedAt, Column::Id];
const LEASE_RETRIES: usize = 5;
/// Lease held between the claim and the delete of a `take_next`
const TAKE_LEASE: Duration = Duration::from_secs(30);

/// Persistent backend over a shared jobs table.
///
/// Leases are claimed with a conditional update that re-checks eligibility,
/// so two workers racing for the same row cannot both win. Lease and delete
/// are separate statements: a worker that dies in between leaves a lease that
/// simply expires.
pub struct DatabaseStore {
    table: String,
    ops: Arc<dyn TableOps>,
    connected: AtomicBool,
}

impl DatabaseStore {
    pub fn new<S: Into<String>>(table: S, ops: Arc<dyn TableOps>) -> Self {
        Self {
            table: table.into(),
            ops,
            connected: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Empty the whole table, every queue included
    pub async fn truncate_table(&self) -> Result<()> {
        self.ensure_connected()?;
        self.ops.truncate(&self.table).await
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(format!(
                "database store for table '{}' is not connected",
                self.table
            )))
        }
    }
}

fn row_from_job(job: &Job) -> Result<JobRow> {
    Ok(JobRow {
        id: job.id.clone(),
        queue: job.queue.clone(),
        payload: serde_json::to_string(&job.data)?,
        attempts: job.attempts as i64,
        attempts_left: job.attempts_left as i64,
        available_at: job.available_at,
        reserved_until: job.reserved_until,
        created_at: job.created_at,
        former_queue: job.former_queue.clone(),
    })
}

/// Rows of `job` still under the lease it was returned with
fn lease_filter(queue: &str, job: &Job, until: i64) -> Filter {
    Filter::new()
        .id(job.id.clone())
        .queue(queue)
        .attempts_left(job.attempts_left as i64)
        .leased_until(until)
}

fn job_from_row(row: JobRow) -> Result<Job> {
    Ok(Job {
        data: serde_json::from_str(&row.payload)?,
        id: row.id,
        queue: row.queue,
        attempts: u32::try_from(row.attempts.max(0)).unwrap_or(u32::MAX),
        attempts_left: u32::try_from(row.attempts_left.max(0)).unwrap_or(u32::MAX),
        available_at: row.available_at,
        reserved_until: row.reserved_until,
        created_at: row.created_at,
        former_queue: row.former_queue,
    })
}

#[async_trait]
impl JobStore for DatabaseStore {
    fn kind(&self) -> &str {
        "database"
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
        self.ensure_connected()?;
        let job = Job::from_new(uuid::Uuid::now_v7().to_string(), queue, new, now_millis());
        self.ops.create(&self.table, row_from_job(&job)?).await?;
        Ok(job)
    }

    async fn lease_next(&self, queue: &str, visibility: Duration) -> Result<Option<Job>> {
        self.ensure_connected()?;

        for _ in 0..LEASE_RETRIES {
            let now = now_millis();
            let candidate = self
                .ops
                .find_one(
                    &self.table,
                    &Filter::new().queue(queue).eligible_at(now),
                    &ELIGIBLE_ORDER,
                )
                .await?;
            let Some(row) = candidate else {
                return Ok(None);
            };

            let seen_attempts_left = row.attempts_left;
            let mut job = job_from_row(row)?;
            job.grant_lease(now, visibility);

            let claimed = self
                .ops
                .update(
                    &self.table,
                    &Filter::new()
                        .id(job.id.clone())
                        .queue(queue)
                        .attempts_left(seen_attempts_left)
                        .eligible_at(now),
                    &RowUpdate {
                        attempts_left: Some(job.attempts_left as i64),
                        reserved_until: Some(job.reserved_until),
                        ..RowUpdate::default()
                    },
                )
                .await?;

            if claimed > 0 {
                return Ok(Some(job));
            }
            log::debug!("Lost lease race for job {} on queue {}", job.id, queue);
        }

        Ok(None)
    }

    async fn take_next(&self, queue: &str) -> Result<Option<Job>> {
        let Some(job) = self.lease_next(queue, TAKE_LEASE).await? else {
            return Ok(None);
        };
        self.ops
            .delete(&self.table, &Filter::new().id(job.id.clone()).queue(queue))
            .await?;
        Ok(Some(job))
    }

    async fn ack(&self, queue: &str, job_id: &str) -> Result<AckOutcome> {
        self.ensure_connected()?;
        let by_id = Filter::new().id(job_id).queue(queue);

        match self.ops.find_one(&self.table, &by_id, &[]).await? {
            None => Ok(AckOutcome::NotFound),
            Some(row) if row.reserved_until.is_none() => Ok(AckOutcome::NotLeased),
            Some(_) => {
                let deleted = self.ops.delete(&self.table, &by_id.reserved(true)).await?;
                Ok(if deleted > 0 {
                    AckOutcome::Removed
                } else {
                    AckOutcome::NotLeased
                })
            }
        }
    }

    async fn ack_leased(&self, queue: &str, job: &Job) -> Result<AckOutcome> {
        self.ensure_connected()?;
        let Some(until) = job.reserved_until else {
            return Ok(AckOutcome::NotLeased);
        };

        let deleted = self
            .ops
            .delete(&self.table, &lease_filter(queue, job, until))
            .await?;
        if deleted > 0 {
            return Ok(AckOutcome::Removed);
        }

        let by_id = Filter::new().id(job.id.clone()).queue(queue);
        Ok(match self.ops.find_one(&self.table, &by_id, &[]).await? {
            None => AckOutcome::NotFound,
            Some(row) if row.reserved_until.is_none() => AckOutcome::NotLeased,
            Some(_) => AckOutcome::LeaseLost,
        })
    }

    async fn reschedule(&self, queue: &str, job: &Job, delay: Duration) -> Result<bool> {
        self.ensure_connected()?;
        let Some(until) = job.reserved_until else {
            return Ok(false);
        };

        let changed = self
            .ops
            .update(
                &self.table,
                &lease_filter(queue, job, until),
                &RowUpdate {
                    available_at: Some(add_millis(now_millis(), delay)),
                    reserved_until: Some(None),
                    ..RowUpdate::default()
                },
            )
            .await?;
        Ok(changed > 0)
    }

    async fn release_expired_leases(&self, queue: &str) -> Result<u64> {
        self.ensure_connected()?;
        self.ops
            .update(
                &self.table,
                &Filter::new().queue(queue).lease_expired_at(now_millis()),
                &RowUpdate {
                    reserved_until: Some(None),
                    ..RowUpdate::default()
                },
            )
            .await
    }

    async fn length(&self, queue: &str) -> Result<u64> {
        self.ensure_connected()?;
        self.ops
            .count(&self.table, &Filter::new().queue(queue))
            .await
    }

    async fn truncate(&self, queue: &str) -> Result<()> {
        self.ensure_connected()?;
        self.ops
            .delete(&self.table, &Filter::new().queue(queue))
            .await?;
        Ok(())
    }
}
