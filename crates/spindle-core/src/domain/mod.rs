//! Domain model (ids, rows, retry policy, decisions, outcomes, errors).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod retry;
pub mod row;
pub mod time;

pub use decision::Decision;
pub use errors::{ErrorKind, HandlerError};
pub use ids::TaskId;
pub use outcome::BatchOutcome;
pub use retry::{Backoff, RetryPolicy};
pub use row::{Lease, NewTask, TaskRow, TaskState};
