//! Implementations of the `TaskStore` port.
//!
//! - **SqliteTaskStore**: durable store on SQLite (sqlx).
//! - **InMemoryTaskStore**: same semantics without persistence, for tests and embedding.

pub mod memory_store;
pub mod sqlite_store;

pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
