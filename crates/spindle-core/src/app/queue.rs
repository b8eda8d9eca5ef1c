//! TaskQueue: the producer API and the entry point for starting workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::builder::TaskQueueBuilder;
use super::dispatcher::{DispatchReport, Dispatcher};
use super::worker_loop::{self, LoopContext, WorkerHandle, WorkerOptions};
use crate::domain::{NewTask, TaskId, TaskRow, time};
use crate::error::QueueError;
use crate::ports::{Clock, QueueCounts, SystemClock, TaskStore};
use crate::typed::{Task, TaskRegistry};

/// Per-enqueue options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Earliest time the task may run, relative to now.
    pub delay: Duration,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self { delay }
    }
}

/// Cheap to clone; clones share the store, registry and wake signal.
///
/// # 使用例
/// ```ignore
/// let queue = TaskQueue::builder(store)
///     .register(TaskDefinition::new::<SendEmail, _>(SendEmailHandler))?
///     .build()?;
///
/// queue.enqueue(&SendEmail { to: "a@example.com".into() }).await?;
/// let workers = queue.start_worker(WorkerOptions::default()).await?;
/// // ...
/// workers.stop().await;
/// ```
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    wake: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, registry: TaskRegistry) -> Self {
        Self::from_parts(store, registry, Arc::new(SystemClock))
    }

    pub fn builder(store: Arc<dyn TaskStore>) -> TaskQueueBuilder {
        TaskQueueBuilder::new(store)
    }

    pub(crate) fn from_parts(
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(registry);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        Self {
            store,
            registry,
            clock,
            dispatcher,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Enqueue `task` for immediate execution.
    pub async fn enqueue<T: Task>(&self, task: &T) -> Result<TaskId, QueueError> {
        self.enqueue_with(task, EnqueueOptions::default()).await
    }

    pub async fn enqueue_with<T: Task>(
        &self,
        task: &T,
        options: EnqueueOptions,
    ) -> Result<TaskId, QueueError> {
        let payload = serde_json::to_value(task)?;
        self.enqueue_raw(T::NAME, payload, options).await
    }

    /// Enqueue an already-encoded payload under `name`.
    ///
    /// The name must be registered; the payload is not checked against the
    /// handler's type until dispatch.
    pub async fn enqueue_raw(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<TaskId, QueueError> {
        if !self.registry.contains(name) {
            return Err(QueueError::UnknownTask(name.to_string()));
        }

        let now = self.clock.now();
        let row = self
            .store
            .insert(NewTask {
                id: TaskId::generate(now),
                name: name.to_string(),
                payload,
                created_at: now,
                run_at: time::later(now, options.delay),
            })
            .await?;

        debug!(task_id = %row.id, task_name = name, delay_ms = options.delay.as_millis() as u64, "task enqueued");
        if options.delay.is_zero() {
            self.wake.notify_one();
        }
        Ok(row.id)
    }

    /// Start `options.concurrency` worker loops in the background.
    pub async fn start_worker(&self, options: WorkerOptions) -> Result<WorkerHandle, QueueError> {
        check_options(&options)?;

        match self.store.pending_names().await {
            Ok(names) => {
                for name in names.iter().filter(|name| !self.registry.contains(name)) {
                    error!(task_name = %name, "pending tasks have no registered handler; they will fail");
                }
            }
            Err(e) => warn!(error = %e, "could not list pending task names"),
        }

        let claim_limit = self.claim_limit(&options);
        info!(tasks = ?self.registry.names(), "starting workers");
        Ok(worker_loop::spawn(
            options,
            claim_limit,
            LoopContext {
                store: Arc::clone(&self.store),
                dispatcher: Arc::clone(&self.dispatcher),
                clock: Arc::clone(&self.clock),
                wake: Arc::clone(&self.wake),
            },
        ))
    }

    /// Run a single claim/dispatch cycle on the calling task.
    pub async fn run_once(&self, options: &WorkerOptions) -> Result<DispatchReport, QueueError> {
        check_options(options)?;
        let rows = self
            .store
            .claim_batch(self.claim_limit(options), self.clock.now(), options.claim_timeout)
            .await?;
        if rows.is_empty() {
            return Ok(DispatchReport::default());
        }
        Ok(self.dispatcher.dispatch(rows).await)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRow>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(self.store.counts(self.clock.now()).await?)
    }

    pub async fn list_dead(&self, limit: usize) -> Result<Vec<TaskRow>, QueueError> {
        Ok(self.store.list_dead(limit).await?)
    }

    /// Give a dead task a fresh retry budget. `false` if it is not dead.
    pub async fn requeue_dead(&self, id: TaskId) -> Result<bool, QueueError> {
        let requeued = self.store.requeue_dead(id, self.clock.now()).await?;
        if requeued {
            info!(task_id = %id, "dead task requeued");
            self.wake.notify_one();
        }
        Ok(requeued)
    }

    /// Delete done and dead tasks that finished more than `older_than` ago.
    pub async fn purge_finished(&self, older_than: Duration) -> Result<u64, QueueError> {
        let before = time::earlier(self.clock.now(), older_than);
        let purged = self.store.purge_finished(before).await?;
        info!(purged, "finished tasks purged");
        Ok(purged)
    }

    fn claim_limit(&self, options: &WorkerOptions) -> usize {
        options
            .claim_limit
            .unwrap_or_else(|| self.registry.max_batch_size())
    }
}

/// Same limits `QueueConfig::validate` puts on the equivalent settings.
fn check_options(options: &WorkerOptions) -> Result<(), QueueError> {
    let invalid = |msg: &str| -> Result<(), QueueError> { Err(QueueError::InvalidConfig(msg.to_string())) };

    if options.concurrency == 0 {
        return invalid("concurrency must be at least 1");
    }
    if options.claim_limit == Some(0) {
        return invalid("claim_limit must be at least 1 when set");
    }
    // A zero timeout would treat every in-flight claim as abandoned.
    if options.claim_timeout.is_zero() {
        return invalid("claim_timeout must be positive");
    }
    Ok(())
}
