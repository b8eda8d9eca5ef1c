//! spindle-core
//!
//! An embedded task queue backed by a relational table.
//!
//! # Modules
//! - **domain**: task rows, ids, handler errors, retry policy and decisions
//! - **ports**: `TaskStore` and `Clock` abstractions
//! - **impls**: `SqliteTaskStore` and `InMemoryTaskStore`
//! - **typed**: `Task` / `Handler<T>` API and the `TaskRegistry`
//! - **app**: `TaskQueue`, the dispatcher and worker loops
//! - **config**: `QueueConfig`, loaded from file and `SPINDLE_*` environment variables

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{
    DispatchReport, EnqueueOptions, LoopSummary, TaskQueue, TaskQueueBuilder, WorkerHandle,
    WorkerOptions,
};
pub use crate::config::QueueConfig;
pub use crate::domain::{
    Backoff, BatchOutcome, Decision, ErrorKind, HandlerError, RetryPolicy, TaskId, TaskRow,
    TaskState,
};
pub use crate::error::QueueError;
pub use crate::impls::{InMemoryTaskStore, SqliteTaskStore};
pub use crate::ports::{Clock, ManualClock, QueueCounts, StoreError, SystemClock, TaskStore};
pub use crate::typed::{Handler, Task, TaskContext, TaskDefinition, TaskRegistry};
