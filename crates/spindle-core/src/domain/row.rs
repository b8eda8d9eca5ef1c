//! Task rows: the persisted unit of work and its state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Lifecycle state of a task row.
///
/// State transitions:
/// - Pending -> Claimed (claim_batch)
/// - Claimed -> Done (mark_done)
/// - Claimed -> Pending (mark_failed, retries left; `run_at` pushed out by backoff)
/// - Claimed -> Dead (mark_failed, retries exhausted or permanent error)
/// - Claimed -> Claimed (stale claim taken over by another worker)
/// - Dead -> Pending (operator requeue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting to be claimed once `run_at` has passed.
    Pending,

    /// Owned by a worker since `claimed_at`.
    Claimed,

    /// Processed successfully.
    Done,

    /// Retries exhausted; needs operator intervention.
    Dead,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Done => "done",
            TaskState::Dead => "dead",
        }
    }

    /// Is this a terminal state (never claimed again)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Dead)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid task state: {0}")]
pub struct ParseTaskStateError(String);

impl FromStr for TaskState {
    type Err = ParseTaskStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "claimed" => Ok(TaskState::Claimed),
            "done" => Ok(TaskState::Done),
            "dead" => Ok(TaskState::Dead),
            other => Err(ParseTaskStateError(other.to_string())),
        }
    }
}

/// A row as the producer hands it to the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub name: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,

    /// Earliest time the row may be claimed (`created_at` unless delayed).
    pub run_at: DateTime<Utc>,
}

/// One persisted task row.
///
/// The store is the single source of truth; this is a snapshot of the row
/// as of the operation that returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub name: String,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    /// Number of failed attempts so far.
    pub fail_count: u32,

    pub last_error: Option<String>,

    /// When the row reached `Done` or `Dead`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    pub fn from_new(task: NewTask) -> Self {
        Self {
            id: task.id,
            name: task.name,
            payload: task.payload,
            state: TaskState::Pending,
            created_at: task.created_at,
            run_at: task.run_at,
            claimed_at: None,
            failed_at: None,
            fail_count: 0,
            last_error: None,
            finished_at: None,
        }
    }

    /// The claim held on this row, if it is currently claimed.
    pub fn lease(&self) -> Option<Lease> {
        match (self.state, self.claimed_at) {
            (TaskState::Claimed, Some(claimed_at)) => Some(Lease {
                id: self.id,
                claimed_at,
            }),
            _ => None,
        }
    }
}

/// Proof of a claim on one row.
///
/// Completion calls only apply while the row still carries this exact
/// `claimed_at`; once a stale claim has been taken over by another worker
/// the first holder's completion becomes a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: TaskId,
    pub claimed_at: DateTime<Utc>,
}
