//! Worker loops: poll -> claim -> dispatch, until told to stop.
//!
//! - `WorkerHandle::stop()` flips the shutdown flag; loops finish the batch in
//!   hand and exit without claiming again.
//! - Dropping the handle without calling `stop()` also stops the loops, after
//!   the batch in hand; nothing waits for them.
//! - Loops still running after `shutdown_grace` are aborted. Their rows stay
//!   claimed and are reclaimed by a later claim once `claim_timeout` passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::dispatcher::{DispatchReport, Dispatcher};
use crate::ports::{Clock, TaskStore};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Idle wait between polls that found nothing.
    pub poll_interval: Duration,

    /// Number of independent loops.
    pub concurrency: usize,

    /// Rows claimed per poll. `None` uses the largest registered batch size.
    pub claim_limit: Option<usize>,

    pub claim_timeout: Duration,
    pub shutdown_grace: Duration,

    /// First delay after a failed poll; doubles up to `store_retry_max`.
    pub store_retry_base: Duration,
    pub store_retry_max: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            concurrency: 1,
            claim_limit: None,
            claim_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            store_retry_base: Duration::from_millis(500),
            store_retry_max: Duration::from_secs(30),
        }
    }
}

/// Per-loop totals, returned by `WorkerHandle::stop`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub worker_id: usize,
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead: u64,
    pub lost: u64,
    pub store_errors: u64,

    /// The loop did not exit within the grace period and was aborted.
    pub aborted: bool,
}

impl LoopSummary {
    fn record(&mut self, report: &DispatchReport) {
        self.succeeded += report.succeeded.len() as u64;
        self.retried += report.retried.len() as u64;
        self.dead += report.dead.len() as u64;
        self.lost += report.lost.len() as u64;
    }
}

/// Handle to a running pool of worker loops.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<(usize, JoinHandle<LoopSummary>)>,
    grace: Duration,
}

impl WorkerHandle {
    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Ask every loop to stop after its current batch. Does not wait.
    pub fn request_stop(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop and wait for the loops, aborting any still running after the grace period.
    pub async fn stop(self) -> Vec<LoopSummary> {
        self.request_stop();
        let deadline = Instant::now() + self.grace;

        let mut summaries = Vec::with_capacity(self.joins.len());
        for (worker_id, mut join) in self.joins {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => {
                    error!(worker_id, error = %e, "worker loop terminated abnormally");
                    summaries.push(LoopSummary {
                        worker_id,
                        aborted: true,
                        ..Default::default()
                    });
                }
                Err(_) => {
                    warn!(worker_id, "worker loop did not stop within grace period; aborting");
                    join.abort();
                    summaries.push(LoopSummary {
                        worker_id,
                        aborted: true,
                        ..Default::default()
                    });
                }
            }
        }
        info!(loops = summaries.len(), "workers stopped");
        summaries
    }
}

/// Shared pieces every loop needs.
pub(crate) struct LoopContext {
    pub store: Arc<dyn TaskStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<dyn Clock>,
    pub wake: Arc<Notify>,
}

/// Spawn `options.concurrency` loops claiming `claim_limit` rows per poll.
pub(crate) fn spawn(options: WorkerOptions, claim_limit: usize, ctx: LoopContext) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(ctx);
    let concurrency = options.concurrency.max(1);

    let mut joins = Vec::with_capacity(concurrency);
    for worker_id in 0..concurrency {
        let worker = WorkerLoop {
            worker_id,
            claim_limit: claim_limit.max(1),
            options: options.clone(),
            ctx: Arc::clone(&ctx),
            shutdown_rx: shutdown_rx.clone(),
            summary: LoopSummary {
                worker_id,
                ..Default::default()
            },
        };
        joins.push((worker_id, tokio::spawn(worker.run())));
    }
    info!(concurrency, claim_limit, "workers started");

    WorkerHandle {
        shutdown_tx,
        joins,
        grace: options.shutdown_grace,
    }
}

struct WorkerLoop {
    worker_id: usize,
    claim_limit: usize,
    options: WorkerOptions,
    ctx: Arc<LoopContext>,
    shutdown_rx: watch::Receiver<bool>,
    summary: LoopSummary,
}

impl WorkerLoop {
    async fn run(mut self) -> LoopSummary {
        let worker_id = self.worker_id;
        let mut store_delay = self.options.store_retry_base;

        loop {
            // `has_changed` errors once the handle has been dropped.
            if *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err() {
                break;
            }

            let now = self.ctx.clock.now();
            let claimed = self
                .ctx
                .store
                .claim_batch(self.claim_limit, now, self.options.claim_timeout)
                .await;

            match claimed {
                Ok(rows) if rows.is_empty() => {
                    store_delay = self.options.store_retry_base;
                    if !self.pause(self.options.poll_interval, true).await {
                        break;
                    }
                }
                Ok(rows) => {
                    store_delay = self.options.store_retry_base;
                    debug!(worker_id, rows = rows.len(), "claimed batch");
                    self.summary.claimed += rows.len() as u64;

                    let report = self.ctx.dispatcher.dispatch(rows).await;
                    self.summary.record(&report);
                }
                Err(e) => {
                    self.summary.store_errors += 1;
                    warn!(
                        worker_id,
                        error = %e,
                        retry_in_ms = store_delay.as_millis() as u64,
                        "claim failed; backing off"
                    );
                    if !self.pause(store_delay, false).await {
                        break;
                    }
                    store_delay = (store_delay * 2).min(self.options.store_retry_max);
                }
            }
        }

        debug!(worker_id, "worker loop exiting");
        self.summary
    }

    /// Wait for `delay`, the shutdown signal, or (when `wakeable`) an enqueue.
    /// Returns `false` when the handle is gone and the loop should exit.
    async fn pause(&mut self, delay: Duration, wakeable: bool) -> bool {
        let wake = Arc::clone(&self.ctx.wake);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wake.notified(), if wakeable => true,
            changed = self.shutdown_rx.changed() => changed.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    use super::*;
    use crate::domain::{Decision, HandlerError, Lease, NewTask, TaskId, TaskRow, TaskState};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{QueueCounts, StoreError, SystemClock};
    use crate::typed::task::fixtures::Noop;
    use crate::typed::{Handler, TaskContext, TaskDefinition, TaskRegistry};

    /// Store whose `claim_batch` fails while `down` is set.
    struct FlakyStore {
        inner: InMemoryTaskStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn insert(&self, task: NewTask) -> Result<TaskRow, StoreError> {
            self.inner.insert(task).await
        }

        async fn claim_batch(
            &self,
            limit: usize,
            now: DateTime<Utc>,
            claim_timeout: Duration,
        ) -> Result<Vec<TaskRow>, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.claim_batch(limit, now, claim_timeout).await
        }

        async fn renew(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError> {
            self.inner.renew(lease, now).await
        }

        async fn mark_done(&self, lease: &Lease, now: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.mark_done(lease, now).await
        }

        async fn mark_failed(
            &self,
            lease: &Lease,
            error: &str,
            now: DateTime<Utc>,
            decision: &Decision,
        ) -> Result<bool, StoreError> {
            self.inner.mark_failed(lease, error, now, decision).await
        }

        async fn get(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
            self.inner.get(id).await
        }

        async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError> {
            self.inner.counts(now).await
        }

        async fn pending_names(&self) -> Result<Vec<String>, StoreError> {
            self.inner.pending_names().await
        }

        async fn list_dead(&self, limit: usize) -> Result<Vec<TaskRow>, StoreError> {
            self.inner.list_dead(limit).await
        }

        async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.requeue_dead(id, now).await
        }

        async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.purge_finished(before).await
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl Handler<Noop> for Sleepy {
        async fn handle(&self, _task: Noop, _ctx: &TaskContext) -> Result<(), HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_secs(3600),
            store_retry_base: Duration::from_millis(5),
            store_retry_max: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn start(store: Arc<FlakyStore>, handler_delay: Duration, options: WorkerOptions) -> (WorkerHandle, Arc<Notify>) {
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDefinition::new::<Noop, _>(Sleepy(handler_delay)))
            .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let wake = Arc::new(Notify::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), store.clone(), clock.clone()));
        let handle = spawn(
            options,
            1,
            LoopContext {
                store,
                dispatcher,
                clock,
                wake: wake.clone(),
            },
        );
        (handle, wake)
    }

    fn flaky(down: bool) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: InMemoryTaskStore::new(),
            down: AtomicBool::new(down),
        })
    }

    async fn insert(store: &FlakyStore) -> TaskId {
        let now = Utc::now();
        let row = store
            .insert(NewTask {
                id: TaskId::generate(now),
                name: "noop".into(),
                payload: json!({ "n": 1 }),
                created_at: now,
                run_at: now,
            })
            .await
            .unwrap();
        row.id
    }

    async fn wait_for_state(store: &FlakyStore, id: TaskId, state: TaskState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.get(id).await.unwrap().unwrap().state == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task {id} never reached {state}"));
    }

    #[tokio::test]
    async fn store_outage_leaves_rows_untouched() {
        let store = flaky(true);
        let id = insert(&store).await;
        let (handle, _wake) = start(store.clone(), Duration::ZERO, options());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.state, TaskState::Pending);
        assert_eq!(row.fail_count, 0);
        assert_eq!(row.claimed_at, None);

        store.down.store(false, Ordering::SeqCst);
        wait_for_state(&store, id, TaskState::Done).await;

        let summaries = handle.stop().await;
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].store_errors >= 1);
        assert_eq!(summaries[0].succeeded, 1);
    }

    #[tokio::test]
    async fn enqueue_notify_wakes_an_idle_loop() {
        let store = flaky(false);
        let (handle, wake) = start(store.clone(), Duration::ZERO, options());

        // Let the loop find nothing and go idle on the hour-long poll interval.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = insert(&store).await;
        wake.notify_one();

        wait_for_state(&store, id, TaskState::Done).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_finishes_the_batch_in_hand() {
        let store = flaky(false);
        let id = insert(&store).await;
        let (handle, _wake) = start(store.clone(), Duration::from_millis(100), options());

        wait_for_state(&store, id, TaskState::Claimed).await;
        let summaries = handle.stop().await;

        assert!(!summaries[0].aborted);
        assert_eq!(summaries[0].succeeded, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().state, TaskState::Done);
    }

    #[tokio::test]
    async fn dropped_handle_stops_a_busy_loop() {
        let store = flaky(false);
        for _ in 0..200 {
            insert(&store).await;
        }
        let (handle, _wake) = start(store.clone(), Duration::from_millis(5), options());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let WorkerHandle { shutdown_tx, mut joins, .. } = handle;
        drop(shutdown_tx);

        let (_, join) = joins.remove(0);
        let summary = tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("loop should exit once the handle is gone")
            .unwrap();
        assert!(summary.succeeded < 200);
        assert!(store.counts(Utc::now()).await.unwrap().ready > 0);
    }

    #[tokio::test]
    async fn stop_aborts_after_grace_period() {
        let store = flaky(false);
        let id = insert(&store).await;
        let options = WorkerOptions {
            shutdown_grace: Duration::from_millis(50),
            ..options()
        };
        let (handle, _wake) = start(store.clone(), Duration::from_secs(3600), options);

        wait_for_state(&store, id, TaskState::Claimed).await;
        let summaries = handle.stop().await;

        assert!(summaries[0].aborted);
        // Left claimed; a later claim past the timeout picks it up again.
        assert_eq!(store.get(id).await.unwrap().unwrap().state, TaskState::Claimed);
    }
}
