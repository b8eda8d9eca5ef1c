//! TaskStore port: the persisted task table, source of truth for every row.
//!
//! All mutation goes through this trait. The two operations that carry the
//! concurrency guarantees are:
//! - `claim_batch`: select-and-claim in one atomic step, so concurrent
//!   callers never receive overlapping rows.
//! - `renew`, `mark_done` and `mark_failed`: only apply while the caller's
//!   lease still holds.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Decision, Lease, NewTask, TaskId, TaskRow};

/// Errors raised by a store implementation.
///
/// None of these are attributed to a row: a failed store call never
/// increments `fail_count`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing database could not be reached (connection, pool, lock timeout).
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("task store query failed: {0}")]
    Database(String),

    /// A persisted row could not be decoded.
    #[error("corrupt task row: {0}")]
    Corrupt(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Row counts by logical state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Pending and eligible now.
    pub ready: u64,

    /// Pending but waiting for `run_at` (backoff or delayed enqueue).
    pub scheduled: u64,

    pub claimed: u64,
    pub done: u64,
    pub dead: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.ready + self.scheduled + self.claimed + self.done + self.dead
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new pending row.
    async fn insert(&self, task: NewTask) -> Result<TaskRow, StoreError>;

    /// Claim up to `limit` eligible rows, oldest `created_at` first.
    ///
    /// Eligible rows are pending rows with `run_at <= now`, plus claimed rows
    /// whose claim is older than `claim_timeout` (abandoned by a crashed or
    /// aborted worker). Claimed rows come back with `state = Claimed` and
    /// `claimed_at = now`, ordered by creation. A claimed row that cannot be
    /// decoded is dead-lettered in place instead of being returned.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<Vec<TaskRow>, StoreError>;

    /// Move the claim forward to `now`.
    ///
    /// Returns the refreshed lease, or `None` when the lease no longer holds
    /// (another worker reclaimed the row, or it already finished).
    async fn renew(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError>;

    /// Claimed -> Done.
    ///
    /// Returns `false` (and changes nothing) when the lease no longer holds,
    /// e.g. the row is already done.
    async fn mark_done(&self, lease: &Lease, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Record a failed attempt and apply `decision`.
    ///
    /// Increments `fail_count`, sets `failed_at = now` and `last_error`, and
    /// clears `claimed_at`. `Retry` returns the row to pending with the new
    /// `run_at`; `Dead` makes it terminal. Returns `false` when the lease no
    /// longer holds.
    async fn mark_failed(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
        decision: &Decision,
    ) -> Result<bool, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError>;

    /// Distinct names of rows that may still be dispatched.
    async fn pending_names(&self) -> Result<Vec<String>, StoreError>;

    /// Most recently dead-lettered rows first.
    async fn list_dead(&self, limit: usize) -> Result<Vec<TaskRow>, StoreError>;

    /// Operator intervention: Dead -> Pending with a fresh retry budget.
    ///
    /// Returns `false` if the row exists but is not dead.
    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Delete done/dead rows that finished before `before`. Returns the number deleted.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
