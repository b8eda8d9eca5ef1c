//! Application layer: wires the ports together.
//!
//! - **TaskQueueBuilder**: registration and startup validation
//! - **TaskQueue**: enqueue API, worker startup, operator queries
//! - **Dispatcher**: runs claimed rows through handlers and records outcomes
//! - **WorkerLoop**: poll -> claim -> dispatch, with graceful stop

pub mod builder;
pub mod dispatcher;
pub mod queue;
pub mod worker_loop;

pub use self::builder::TaskQueueBuilder;
pub use self::dispatcher::{DispatchReport, Dispatcher};
pub use self::queue::{EnqueueOptions, TaskQueue};
pub use self::worker_loop::{LoopSummary, WorkerHandle, WorkerOptions};
