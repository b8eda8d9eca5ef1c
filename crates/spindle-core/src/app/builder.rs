//! TaskQueueBuilder - TaskQueue の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: expect_tasks の不足は build() で検出
//! - 設定 (QueueConfig) から registry のデフォルトを引き継ぐ

use std::sync::Arc;

use super::queue::TaskQueue;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::ports::{Clock, SystemClock, TaskStore};
use crate::typed::{TaskDefinition, TaskRegistry};

/// Builds a `TaskQueue`.
///
/// # 使用例
/// ```ignore
/// let queue = TaskQueueBuilder::from_config(store, &config)
///     .register(TaskDefinition::new::<SendEmail, _>(SendEmailHandler))?
///     .expect_tasks(&["send-email"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task 名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば MissingTaskNames を返す
pub struct TaskQueueBuilder {
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    expected: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl TaskQueueBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_registry(store, TaskRegistry::new())
    }

    /// Registry defaults (batch size, retry policy) taken from `config`.
    pub fn from_config(store: Arc<dyn TaskStore>, config: &QueueConfig) -> Self {
        Self::with_registry(
            store,
            TaskRegistry::with_defaults(config.default_batch_size, config.retry_policy()),
        )
    }

    pub fn with_registry(store: Arc<dyn TaskStore>, registry: TaskRegistry) -> Self {
        Self {
            store,
            registry,
            expected: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn register(mut self, def: TaskDefinition) -> Result<Self, QueueError> {
        self.registry.register(def)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected.extend(names.iter().map(|name| name.to_string()));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<TaskQueue, QueueError> {
        let mut missing: Vec<String> = self
            .expected
            .into_iter()
            .filter(|name| !self.registry.contains(name))
            .collect();
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(QueueError::MissingTaskNames(missing));
        }
        Ok(TaskQueue::from_parts(self.store, self.registry, self.clock))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::domain::HandlerError;
    use crate::impls::InMemoryTaskStore;
    use crate::typed::task::fixtures::{Noop, SendEmail};
    use crate::typed::{Handler, TaskContext};

    struct Accept;

    #[async_trait]
    impl Handler<SendEmail> for Accept {
        async fn handle(&self, _task: SendEmail, _ctx: &TaskContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<Noop> for Accept {
        async fn handle(&self, _task: Noop, _ctx: &TaskContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn store() -> Arc<dyn TaskStore> {
        Arc::new(InMemoryTaskStore::new())
    }

    #[test]
    fn build_succeeds_when_expected_tasks_are_registered() {
        let queue = TaskQueueBuilder::new(store())
            .register(TaskDefinition::new::<SendEmail, _>(Accept))
            .unwrap()
            .expect_tasks(&["send-email"])
            .build()
            .unwrap();
        assert_eq!(queue.registry().names(), vec!["send-email"]);
    }

    #[test]
    fn build_reports_missing_tasks() {
        let result = TaskQueueBuilder::new(store())
            .register(TaskDefinition::new::<SendEmail, _>(Accept))
            .unwrap()
            .expect_tasks(&["send-email", "noop", "resize-image"])
            .build();
        assert!(matches!(
            result,
            Err(QueueError::MissingTaskNames(missing)) if missing == vec!["noop".to_string(), "resize-image".to_string()]
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let result = TaskQueueBuilder::new(store())
            .register(TaskDefinition::new::<Noop, _>(Accept))
            .unwrap()
            .register(TaskDefinition::new::<Noop, _>(Accept));
        assert!(matches!(result, Err(QueueError::DuplicateTaskName(_))));
    }

    #[test]
    fn config_defaults_flow_into_registrations() {
        let config = QueueConfig {
            default_batch_size: 5,
            default_max_retries: 9,
            ..Default::default()
        };
        let queue = TaskQueueBuilder::from_config(store(), &config)
            .register(TaskDefinition::new::<Noop, _>(Accept))
            .unwrap()
            .build()
            .unwrap();

        let noop = queue.registry().resolve("noop").unwrap();
        assert_eq!(noop.batch_size(), 5);
        assert_eq!(noop.retry().max_retries, 9);
    }
}
