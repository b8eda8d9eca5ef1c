//! Typed task API.
//!
//! - **Surface**: `Task` and `Handler<T>`, where the payload type is checked at compile time.
//! - **Erased**: `DynHandler`, object-safe, stored in the `TaskRegistry` by name.

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{DynHandler, Handler, TypedHandler};
pub use self::registry::{RegisteredTask, TaskDefinition, TaskRegistry};
pub use self::task::{Task, TaskContext};
