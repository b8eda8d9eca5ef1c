//! Dispatcher: runs a claimed batch through its handlers and records outcomes.
//!
//! Flow per claimed batch:
//! 1. group rows by task name (claim order preserved)
//! 2. resolve the registration; unknown names fail every row of the group
//! 3. run the handler per row, or per chunk of `batch_size` for batched tasks,
//!    renewing the claim just before; rows already reclaimed elsewhere are skipped
//! 4. success: `on_success` -> `mark_done`; failure: decide -> `on_failure` -> `mark_failed`
//!
//! Handler panics are caught at the row (or chunk) boundary and recorded as
//! failures. Store errors during completion leave the row claimed; it is
//! picked up again once its claim goes stale.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::domain::{Decision, HandlerError, RetryPolicy, TaskId, TaskRow};
use crate::error::QueueError;
use crate::ports::{Clock, TaskStore};
use crate::typed::{DynHandler, RegisteredTask, TaskRegistry};

/// What happened to each row of a dispatched batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: Vec<TaskId>,

    /// Failed and scheduled for another attempt.
    pub retried: Vec<TaskId>,

    /// Failed and dead-lettered.
    pub dead: Vec<TaskId>,

    /// Outcome not recorded: the lease was gone or the store call failed.
    pub lost: Vec<TaskId>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.retried.len() + self.dead.len() + self.lost.len()
    }
}

pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(registry: Arc<TaskRegistry>, store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    pub async fn dispatch(&self, rows: Vec<TaskRow>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (name, group) in group_by_name(rows) {
            match self.registry.resolve(&name) {
                Ok(task) => self.dispatch_group(task, group, &mut report).await,
                Err(err) => self.fail_unknown(&err, group, &mut report).await,
            }
        }
        report
    }

    async fn dispatch_group(&self, task: &RegisteredTask, rows: Vec<TaskRow>, report: &mut DispatchReport) {
        let handler = task.handler();

        if task.is_batched() {
            for chunk in rows.chunks(task.batch_size()) {
                let held = self.renew(chunk, report).await;
                if held.is_empty() {
                    continue;
                }
                debug!(task_name = task.name(), rows = held.len(), "dispatching batch");
                let results = run_guarded(handler.as_ref(), &held, true).await;
                self.complete_all(task, &held, results, report).await;
            }
        } else {
            for row in &rows {
                let held = self.renew(std::slice::from_ref(row), report).await;
                if held.is_empty() {
                    continue;
                }
                let results = run_guarded(handler.as_ref(), &held, false).await;
                self.complete_all(task, &held, results, report).await;
            }
        }
    }

    /// Refresh each row's claim right before its handler runs.
    ///
    /// Rows queued behind slow siblings may have gone stale and been
    /// reclaimed by another loop; those are dropped without running.
    async fn renew(&self, rows: &[TaskRow], report: &mut DispatchReport) -> Vec<TaskRow> {
        let now = self.clock.now();
        let mut held = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(lease) = row.lease() else {
                error!(task_id = %row.id, task_name = %row.name, "row was dispatched without a claim");
                report.lost.push(row.id);
                continue;
            };
            match self.store.renew(&lease, now).await {
                Ok(Some(lease)) => {
                    let mut row = row.clone();
                    row.claimed_at = Some(lease.claimed_at);
                    held.push(row);
                }
                Ok(None) => {
                    warn!(task_id = %row.id, task_name = %row.name, "claim taken over before the handler ran; skipping");
                    report.lost.push(row.id);
                }
                Err(e) => {
                    error!(task_id = %row.id, task_name = %row.name, error = %e, "failed to renew claim; skipping");
                    report.lost.push(row.id);
                }
            }
        }
        held
    }

    async fn complete_all(
        &self,
        task: &RegisteredTask,
        rows: &[TaskRow],
        results: Vec<(TaskId, Result<(), HandlerError>)>,
        report: &mut DispatchReport,
    ) {
        let mut by_id: HashMap<TaskId, Result<(), HandlerError>> = results.into_iter().collect();
        for row in rows {
            let result = by_id.remove(&row.id).unwrap_or_else(|| {
                Err(HandlerError::transient("handler reported no outcome for this task"))
            });
            match result {
                Ok(()) => self.complete_success(task.handler().as_ref(), row, report).await,
                Err(err) => {
                    self.complete_failure(Some(task.handler().as_ref()), task.retry(), row, &err, report)
                        .await
                }
            }
        }
    }

    async fn complete_success(&self, handler: &dyn DynHandler, row: &TaskRow, report: &mut DispatchReport) {
        if AssertUnwindSafe(handler.on_success(row)).catch_unwind().await.is_err() {
            error!(task_id = %row.id, task_name = %row.name, "on_success hook panicked");
        }

        let Some(lease) = row.lease() else {
            error!(task_id = %row.id, task_name = %row.name, "row was dispatched without a claim");
            report.lost.push(row.id);
            return;
        };

        match self.store.mark_done(&lease, self.clock.now()).await {
            Ok(true) => {
                debug!(task_id = %row.id, task_name = %row.name, "task done");
                report.succeeded.push(row.id);
            }
            Ok(false) => {
                warn!(task_id = %row.id, task_name = %row.name, "claim lost before completion; outcome discarded");
                report.lost.push(row.id);
            }
            Err(e) => {
                error!(task_id = %row.id, task_name = %row.name, error = %e, "failed to mark task done");
                report.lost.push(row.id);
            }
        }
    }

    async fn complete_failure(
        &self,
        handler: Option<&dyn DynHandler>,
        retry: &RetryPolicy,
        row: &TaskRow,
        err: &HandlerError,
        report: &mut DispatchReport,
    ) {
        let now = self.clock.now();
        let decision = retry.decide(row.fail_count, err, now);

        if let Some(handler) = handler {
            let hook = AssertUnwindSafe(handler.on_failure(row, err, &decision)).catch_unwind();
            if hook.await.is_err() {
                error!(task_id = %row.id, task_name = %row.name, "on_failure hook panicked");
            }
        }

        let Some(lease) = row.lease() else {
            error!(task_id = %row.id, task_name = %row.name, "row was dispatched without a claim");
            report.lost.push(row.id);
            return;
        };

        let fail_count = row.fail_count.saturating_add(1);
        match self.store.mark_failed(&lease, err.message(), now, &decision).await {
            Ok(true) => match decision {
                Decision::Retry { delay, .. } => {
                    warn!(
                        task_id = %row.id,
                        task_name = %row.name,
                        fail_count,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed; will retry"
                    );
                    report.retried.push(row.id);
                }
                Decision::Dead => {
                    error!(
                        task_id = %row.id,
                        task_name = %row.name,
                        fail_count,
                        kind = %err.kind(),
                        error = %err,
                        "task dead-lettered"
                    );
                    report.dead.push(row.id);
                }
            },
            Ok(false) => {
                warn!(task_id = %row.id, task_name = %row.name, "claim lost before failure was recorded");
                report.lost.push(row.id);
            }
            Err(e) => {
                error!(task_id = %row.id, task_name = %row.name, error = %e, "failed to record task failure");
                report.lost.push(row.id);
            }
        }
    }

    async fn fail_unknown(&self, err: &QueueError, rows: Vec<TaskRow>, report: &mut DispatchReport) {
        let failure = HandlerError::transient(err.to_string());
        for row in &rows {
            error!(task_id = %row.id, task_name = %row.name, "no handler registered for claimed task");
            self.complete_failure(None, self.registry.default_retry(), row, &failure, report)
                .await;
        }
    }
}

/// Group rows by name, keeping first-seen order of names and claim order within each group.
fn group_by_name(rows: Vec<TaskRow>) -> Vec<(String, Vec<TaskRow>)> {
    let mut groups: Vec<(String, Vec<TaskRow>)> = Vec::new();
    for row in rows {
        match groups.iter_mut().find(|(name, _)| *name == row.name) {
            Some((_, group)) => group.push(row),
            None => groups.push((row.name.clone(), vec![row])),
        }
    }
    groups
}

/// Run the handler, turning a panic into a failure of every row handed in.
async fn run_guarded(
    handler: &dyn DynHandler,
    rows: &[TaskRow],
    batched: bool,
) -> Vec<(TaskId, Result<(), HandlerError>)> {
    match AssertUnwindSafe(handler.run(rows, batched)).catch_unwind().await {
        Ok(results) => results,
        Err(panic) => {
            let err = HandlerError::transient(format!("handler panicked: {}", panic_message(&*panic)));
            rows.iter().map(|row| (row.id, Err(err.clone()))).collect()
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
