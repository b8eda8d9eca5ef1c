#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use spindle_core::domain::NewTask;
use spindle_core::{InMemoryTaskStore, SqliteTaskStore, Task, TaskId, TaskStore};
use tempfile::TempDir;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(secs)
}

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    /// File-backed database with a multi-connection pool.
    Sqlite,
}

/// A store plus whatever keeps it alive (the temp dir for SQLite).
pub struct TestStore {
    pub store: Arc<dyn TaskStore>,
    _dir: Option<TempDir>,
}

impl std::ops::Deref for TestStore {
    type Target = dyn TaskStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

pub async fn open(backend: Backend) -> TestStore {
    match backend {
        Backend::Memory => TestStore {
            store: Arc::new(InMemoryTaskStore::new()),
            _dir: None,
        },
        Backend::Sqlite => {
            let dir = tempfile::tempdir().unwrap();
            let url = format!("sqlite://{}", dir.path().join("tasks.db").display());
            let store = SqliteTaskStore::connect(&url, 5).await.unwrap();
            TestStore {
                store: Arc::new(store),
                _dir: Some(dir),
            }
        }
    }
}

pub fn new_task(name: &str, created_at: DateTime<Utc>) -> NewTask {
    NewTask {
        id: TaskId::generate(created_at),
        name: name.to_string(),
        payload: serde_json::json!({}),
        created_at,
        run_at: created_at,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmail {
    pub to: String,
}

impl Task for SendEmail {
    const NAME: &'static str = "send-email";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Noop {
    pub n: u32,
}

impl Task for Noop {
    const NAME: &'static str = "noop";
}
