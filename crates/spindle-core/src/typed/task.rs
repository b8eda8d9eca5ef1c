//! Task trait - task 名と payload 型を結びつける
//!
//! # 学習ポイント
//! - 関連定数 (`const NAME`) による型レベルの名前付け
//! - serde (Serialize + DeserializeOwned) で payload を JSON として永続化

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{TaskId, TaskRow};

/// A payload type that can be enqueued and handled.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const NAME: &'static str = "send-email";
/// }
/// ```
///
/// `NAME` is what gets persisted in the row's `name` column, so renaming it
/// strands rows already in the table.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Row metadata handed to a handler alongside the decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub id: TaskId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,

    /// Failed attempts before this one.
    pub fail_count: u32,

    pub last_error: Option<String>,
}

impl TaskContext {
    pub fn from_row(row: &TaskRow) -> Self {
        Self {
            id: row.id,
            name: row.name.clone(),
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            fail_count: row.fail_count,
            last_error: row.last_error.clone(),
        }
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.fail_count.saturating_add(1)
    }
}
