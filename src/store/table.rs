//! The narrow table-operations contract the database backend needs from its
//! data-access layer, plus an in-process table implementing it.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// One row of the jobs table. Jobs of every queue share the table and are
/// told apart by `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub queue: String,
    /// Job data serialized as JSON text
    pub payload: String,
    pub attempts: i64,
    pub attempts_left: i64,
    pub available_at: i64,
    pub reserved_until: Option<i64>,
    pub created_at: i64,
    pub former_queue: Option<String>,
}

/// Sortable columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    Queue,
    AttemptsLeft,
    AvailableAt,
    ReservedUntil,
    CreatedAt,
}

impl Column {
    fn compare(self, a: &JobRow, b: &JobRow) -> Ordering {
        match self {
            Column::Id => a.id.cmp(&b.id),
            Column::Queue => a.queue.cmp(&b.queue),
            Column::AttemptsLeft => a.attempts_left.cmp(&b.attempts_left),
            Column::AvailableAt => a.available_at.cmp(&b.available_at),
            // NULLS FIRST
            Column::ReservedUntil => a.reserved_until.cmp(&b.reserved_until),
            Column::CreatedAt => a.created_at.cmp(&b.created_at),
        }
    }
}

/// Conjunction of row conditions. Unset fields match every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub id: Option<String>,
    pub queue: Option<String>,
    pub attempts_left: Option<i64>,
    /// `available_at <= t AND (reserved_until IS NULL OR reserved_until <= t)`
    pub eligible_at: Option<i64>,
    /// `reserved_until IS NOT NULL AND reserved_until <= t`
    pub lease_expired_at: Option<i64>,
    /// `reserved_until IS [NOT] NULL`
    pub reserved: Option<bool>,
    /// `reserved_until = t`
    pub reserved_until: Option<i64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn attempts_left(mut self, attempts_left: i64) -> Self {
        self.attempts_left = Some(attempts_left);
        self
    }

    pub fn eligible_at(mut self, now: i64) -> Self {
        self.eligible_at = Some(now);
        self
    }

    pub fn lease_expired_at(mut self, now: i64) -> Self {
        self.lease_expired_at = Some(now);
        self
    }

    pub fn reserved(mut self, reserved: bool) -> Self {
        self.reserved = Some(reserved);
        self
    }

    /// Only rows still under the lease that expires at `until`
    pub fn leased_until(mut self, until: i64) -> Self {
        self.reserved_until = Some(until);
        self
    }

    pub fn matches(&self, row: &JobRow) -> bool {
        if self.id.as_ref().is_some_and(|id| *id != row.id) {
            return false;
        }
        if self.queue.as_ref().is_some_and(|queue| *queue != row.queue) {
            return false;
        }
        if self.attempts_left.is_some_and(|left| left != row.attempts_left) {
            return false;
        }
        if let Some(now) = self.eligible_at {
            let unreserved = row.reserved_until.map_or(true, |until| until <= now);
            if row.available_at > now || !unreserved {
                return false;
            }
        }
        if let Some(now) = self.lease_expired_at {
            if !row.reserved_until.is_some_and(|until| until <= now) {
                return false;
            }
        }
        if let Some(reserved) = self.reserved {
            if row.reserved_until.is_some() != reserved {
                return false;
            }
        }
        if self
            .reserved_until
            .is_some_and(|until| row.reserved_until != Some(until))
        {
            return false;
        }
        true
    }
}

/// Column assignments of an UPDATE. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    pub attempts_left: Option<i64>,
    pub available_at: Option<i64>,
    /// `Some(None)` sets the column to NULL
    pub reserved_until: Option<Option<i64>>,
}

impl RowUpdate {
    pub fn apply(&self, row: &mut JobRow) {
        if let Some(attempts_left) = self.attempts_left {
            row.attempts_left = attempts_left;
        }
        if let Some(available_at) = self.available_at {
            row.available_at = available_at;
        }
        if let Some(reserved_until) = self.reserved_until {
            row.reserved_until = reserved_until;
        }
    }
}

/// Data-access operations over a jobs table
#[async_trait]
pub trait TableOps: Send + Sync {
    async fn create(&self, table: &str, row: JobRow) -> Result<()>;

    /// First matching row under `order_by` (ascending, left to right)
    async fn find_one(
        &self,
        table: &str,
        filter: &Filter,
        order_by: &[Column],
    ) -> Result<Option<JobRow>>;

    /// Update matching rows, returning how many changed. A single statement:
    /// the filter is evaluated and the update applied atomically.
    async fn update(&self, table: &str, filter: &Filter, update: &RowUpdate) -> Result<u64>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64>;

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64>;

    async fn truncate(&self, table: &str) -> Result<()>;
}

/// In-process table with statement-level atomicity, for tests and
/// single-process deployments without a database server.
#[derive(Debug, Default)]
pub struct MemoryTable {
    tables: Mutex<HashMap<String, Vec<JobRow>>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<JobRow>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TableOps for MemoryTable {
    async fn create(&self, table: &str, row: JobRow) -> Result<()> {
        self.lock().entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    async fn find_one(
        &self,
        table: &str,
        filter: &Filter,
        order_by: &[Column],
    ) -> Result<Option<JobRow>> {
        let tables = self.lock();
        let Some(rows) = tables.get(table) else {
            return Ok(None);
        };

        // min_by keeps the first of equal rows, so insertion order breaks ties
        Ok(rows
            .iter()
            .filter(|row| filter.matches(row))
            .min_by(|a, b| {
                order_by
                    .iter()
                    .map(|column| column.compare(a, b))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            })
            .cloned())
    }

    async fn update(&self, table: &str, filter: &Filter, update: &RowUpdate) -> Result<u64> {
        let mut tables = self.lock();
        let mut changed = 0;
        for row in tables.get_mut(table).into_iter().flatten() {
            if filter.matches(row) {
                update.apply(row);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64> {
        let mut tables = self.lock();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !filter.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64> {
        Ok(self.lock().get(table).map_or(0, |rows| {
            rows.iter().filter(|row| filter.matches(row)).count() as u64
        }))
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        self.lock().remove(table);
        Ok(())
    }
}
