//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>): アプリが実装するのはこちら
//! - Object-safe trait (DynHandler): registry が保持する形
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)
//! - payload の decode 失敗はその行だけの失敗になる (バッチ全体は巻き込まない)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::{Task, TaskContext};
use crate::domain::{BatchOutcome, Decision, HandlerError, TaskId, TaskRow};

/// Processes tasks of payload type `T`.
///
/// # 使用例
/// ```ignore
/// struct SendEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendEmail> for SendEmailHandler {
///     async fn handle(&self, task: SendEmail, _ctx: &TaskContext) -> Result<(), HandlerError> {
///         mailer::send(&task.to).await.map_err(|e| HandlerError::transient(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync + 'static {
    async fn handle(&self, task: T, ctx: &TaskContext) -> Result<(), HandlerError>;

    /// Process several rows at once (used when the task's batch size is > 1).
    ///
    /// The default runs `handle` row by row and reports per-row outcomes.
    /// Override it to do real bulk work; returning `BatchOutcome::Failure`
    /// fails every row in the batch.
    async fn handle_batch(&self, batch: Vec<(TaskContext, T)>) -> BatchOutcome {
        let mut results = Vec::with_capacity(batch.len());
        for (ctx, task) in batch {
            let result = self.handle(task, &ctx).await;
            results.push((ctx.id, result));
        }
        BatchOutcome::PerRow(results)
    }

    /// Runs after a successful attempt, before the row is marked done.
    async fn on_success(&self, _ctx: &TaskContext) {}

    /// Runs after a failed attempt, before the failure is recorded.
    /// `decision` says whether the row will be retried or dead-lettered.
    async fn on_failure(&self, _ctx: &TaskContext, _error: &HandlerError, _decision: &Decision) {}
}

/// Object-safe handler over raw rows.
#[async_trait]
pub trait DynHandler: Send + Sync {
    /// Run the handler over `rows`, one result per row in input order.
    ///
    /// Rows whose payload does not decode fail individually; the rest are
    /// handed to `handle` (unbatched) or `handle_batch` (batched).
    async fn run(&self, rows: &[TaskRow], batched: bool) -> Vec<(TaskId, Result<(), HandlerError>)>;

    async fn on_success(&self, row: &TaskRow);

    async fn on_failure(&self, row: &TaskRow, error: &HandlerError, decision: &Decision);

    fn task_name(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn run(&self, rows: &[TaskRow], batched: bool) -> Vec<(TaskId, Result<(), HandlerError>)> {
        let mut results: Vec<(TaskId, Result<(), HandlerError>)> = Vec::with_capacity(rows.len());
        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<T>(row.payload.clone()) {
                Ok(task) => decoded.push((TaskContext::from_row(row), task)),
                Err(e) => results.push((row.id, Err(HandlerError::from(e)))),
            }
        }

        if batched && !decoded.is_empty() {
            let ids: Vec<TaskId> = decoded.iter().map(|(ctx, _)| ctx.id).collect();
            let outcome = self.handler.handle_batch(decoded).await;
            results.extend(outcome.into_results(&ids));
        } else {
            for (ctx, task) in decoded {
                let result = self.handler.handle(task, &ctx).await;
                results.push((ctx.id, result));
            }
        }

        // Back to input order (decode failures were pushed first).
        let position = |id: &TaskId| rows.iter().position(|row| row.id == *id);
        results.sort_by_key(|(id, _)| position(id));
        results
    }

    async fn on_success(&self, row: &TaskRow) {
        self.handler.on_success(&TaskContext::from_row(row)).await
    }

    async fn on_failure(&self, row: &TaskRow, error: &HandlerError, decision: &Decision) {
        self.handler
            .on_failure(&TaskContext::from_row(row), error, decision)
            .await
    }

    fn task_name(&self) -> &'static str {
        T::NAME
    }
}
