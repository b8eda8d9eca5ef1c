//! Demo task set used by `spindle run` and `spindle enqueue`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spindle_core::{
    BatchOutcome, Handler, HandlerError, QueueError, Task, TaskContext, TaskDefinition,
    TaskQueueBuilder,
};
use tracing::info;

/// `{"name": "..."}`: logs a greeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

impl Task for Hello {
    const NAME: &'static str = "hello";
}

/// `{"fail_times": n}`: fails its first `n` attempts, then succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flaky {
    pub fail_times: u32,
}

impl Task for Flaky {
    const NAME: &'static str = "flaky";
}

/// `{"n": ...}`: does nothing, in batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Noop {
    #[serde(default)]
    pub n: u64,
}

impl Task for Noop {
    const NAME: &'static str = "noop";
}

pub struct HelloHandler;

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn handle(&self, task: Hello, ctx: &TaskContext) -> Result<(), HandlerError> {
        info!(task_id = %ctx.id, "Hello, {}!", task.name);
        Ok(())
    }
}

pub struct FlakyHandler;

#[async_trait]
impl Handler<Flaky> for FlakyHandler {
    async fn handle(&self, task: Flaky, ctx: &TaskContext) -> Result<(), HandlerError> {
        if ctx.fail_count < task.fail_times {
            return Err(HandlerError::transient(format!(
                "intentional failure {} of {}",
                ctx.attempt(),
                task.fail_times
            )));
        }
        Ok(())
    }
}

pub struct NoopHandler;

#[async_trait]
impl Handler<Noop> for NoopHandler {
    async fn handle(&self, _task: Noop, _ctx: &TaskContext) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle_batch(&self, batch: Vec<(TaskContext, Noop)>) -> BatchOutcome {
        info!(rows = batch.len(), "noop batch");
        BatchOutcome::Success
    }
}

pub fn register(builder: TaskQueueBuilder) -> Result<TaskQueueBuilder, QueueError> {
    builder
        .register(TaskDefinition::new::<Hello, _>(HelloHandler))?
        .register(TaskDefinition::new::<Flaky, _>(FlakyHandler).max_retries(5))?
        .register(TaskDefinition::new::<Noop, _>(NoopHandler).batch_size(10))
        .map(|builder| builder.expect_tasks(&[Hello::NAME, Flaky::NAME, Noop::NAME]))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use spindle_core::{
        EnqueueOptions, InMemoryTaskStore, TaskQueue, TaskState, WorkerOptions,
    };

    use super::*;

    fn queue() -> TaskQueue {
        register(TaskQueueBuilder::new(Arc::new(InMemoryTaskStore::new())))
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn demo_tasks_are_registered() {
        let queue = queue();
        assert_eq!(queue.registry().names(), vec!["flaky", "hello", "noop"]);
        assert_eq!(queue.registry().max_batch_size(), 10);
    }

    #[tokio::test]
    async fn flaky_succeeds_after_its_failures() {
        let queue = queue();
        let id = queue
            .enqueue_raw("flaky", serde_json::json!({ "fail_times": 1 }), EnqueueOptions::default())
            .await
            .unwrap();

        let options = WorkerOptions::default();
        assert_eq!(queue.run_once(&options).await.unwrap().retried, vec![id]);

        // Wait out the first backoff (2s by default).
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(queue.run_once(&options).await.unwrap().succeeded, vec![id]);

        let row = queue.get(id).await.unwrap().unwrap();
        assert_eq!(row.state, TaskState::Done);
        assert_eq!(row.fail_count, 1);
    }
}
