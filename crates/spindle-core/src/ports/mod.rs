//! Ports: the seams between the queue logic and the outside world.
//!
//! - `TaskStore`: the persisted task table (SQLite in production, in-memory for tests).
//! - `Clock`: the source of "now".

pub mod clock;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::task_store::{QueueCounts, StoreError, TaskStore};
