//! TaskRegistry - task 名から handler / batch_size / retry policy を引く
//!
//! # 学習ポイント
//! - HashMap<String, RegisteredTask> による名前解決
//! - 重複登録は DuplicateTaskName で拒否
//! - 起動前に一度だけ組み立て、以降は Arc<TaskRegistry> で読み取り専用共有 (ロック不要)

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::{Backoff, RetryPolicy};
use crate::error::QueueError;

/// One task's registration, before defaults are applied.
///
/// # 使用例
/// ```ignore
/// let def = TaskDefinition::new::<SendEmail, _>(SendEmailHandler)
///     .max_retries(3)
///     .backoff(Backoff::Fixed(Duration::from_secs(30)));
/// registry.register(def)?;
/// ```
pub struct TaskDefinition {
    name: &'static str,
    handler: Arc<dyn DynHandler>,
    batch_size: Option<usize>,
    max_retries: Option<u32>,
    backoff: Option<Backoff>,
}

impl TaskDefinition {
    pub fn new<T: Task, H: Handler<T>>(handler: H) -> Self {
        Self {
            name: T::NAME,
            handler: Arc::new(TypedHandler::<T, H>::new(handler)),
            batch_size: None,
            max_retries: None,
            backoff: None,
        }
    }

    /// Rows handed to the handler per call. Values below 1 are treated as 1.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A registered task with defaults resolved.
#[derive(Clone)]
pub struct RegisteredTask {
    name: &'static str,
    batch_size: usize,
    retry: RetryPolicy,
    handler: Arc<dyn DynHandler>,
}

impl RegisteredTask {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_batched(&self) -> bool {
        self.batch_size > 1
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn handler(&self) -> &Arc<dyn DynHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

pub struct TaskRegistry {
    tasks: HashMap<&'static str, RegisteredTask>,
    default_batch_size: usize,
    default_retry: RetryPolicy,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_defaults(1, RetryPolicy::default())
    }

    /// Defaults applied to definitions that leave batch size or retry unset.
    pub fn with_defaults(default_batch_size: usize, default_retry: RetryPolicy) -> Self {
        Self {
            tasks: HashMap::new(),
            default_batch_size: default_batch_size.max(1),
            default_retry,
        }
    }

    pub fn register(&mut self, def: TaskDefinition) -> Result<(), QueueError> {
        if self.tasks.contains_key(def.name) {
            return Err(QueueError::DuplicateTaskName(def.name.to_string()));
        }

        let mut retry = self.default_retry.clone();
        if let Some(max_retries) = def.max_retries {
            retry.max_retries = max_retries;
        }
        if let Some(backoff) = def.backoff {
            retry.backoff = backoff;
        }

        let task = RegisteredTask {
            name: def.name,
            batch_size: def.batch_size.unwrap_or(self.default_batch_size),
            retry,
            handler: def.handler,
        };
        self.tasks.insert(def.name, task);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&RegisteredTask, QueueError> {
        self.tasks
            .get(name)
            .ok_or_else(|| QueueError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tasks.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Largest batch size across registrations (at least 1).
    pub fn max_batch_size(&self) -> usize {
        self.tasks
            .values()
            .map(RegisteredTask::batch_size)
            .max()
            .unwrap_or(1)
    }

    /// Policy used for rows whose name has no registration.
    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
