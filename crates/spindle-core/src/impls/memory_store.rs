//! InMemoryTaskStore - TaskStore のインメモリ実装
//!
//! # 学習ポイント
//! - tokio::sync::Mutex 一つで全操作を直列化 → claim が自然に atomic になる
//! - BTreeMap<seq, TaskRow> で挿入順 (FIFO のタイブレーク) を保持
//! - SQLite 実装と同じ契約 (永続性だけがない)。テストと組み込み用途向け

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Decision, Lease, NewTask, TaskId, TaskRow, TaskState, time};
use crate::ports::{QueueCounts, StoreError, TaskStore};

#[derive(Default)]
struct MemoryState {
    /// Rows keyed by insertion sequence (the FIFO tiebreak).
    rows: BTreeMap<u64, TaskRow>,

    index: HashMap<TaskId, u64>,

    next_seq: u64,
}

impl MemoryState {
    fn row_mut(&mut self, id: TaskId) -> Option<&mut TaskRow> {
        let seq = self.index.get(&id)?;
        self.rows.get_mut(seq)
    }

    /// Row still held under exactly this lease.
    fn leased_mut(&mut self, lease: &Lease) -> Option<&mut TaskRow> {
        self.row_mut(lease.id).filter(|row| {
            row.state == TaskState::Claimed && row.claimed_at == Some(lease.claimed_at)
        })
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Number of rows currently held, in any state.
    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: NewTask) -> Result<TaskRow, StoreError> {
        let mut state = self.state.lock().await;
        if state.index.contains_key(&task.id) {
            return Err(StoreError::Database(format!("duplicate task id {}", task.id)));
        }
        let seq = state.next_seq;
        state.next_seq += 1;

        let row = TaskRow::from_new(task);
        state.index.insert(row.id, seq);
        state.rows.insert(seq, row.clone());
        Ok(row)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<Vec<TaskRow>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stale_before = time::earlier(now, claim_timeout);
        let mut state = self.state.lock().await;

        let mut eligible: Vec<(DateTime<Utc>, u64)> = state
            .rows
            .iter()
            .filter(|(_, row)| match row.state {
                TaskState::Pending => row.run_at <= now,
                TaskState::Claimed => row.claimed_at.is_some_and(|at| at <= stale_before),
                TaskState::Done | TaskState::Dead => false,
            })
            .map(|(seq, row)| (row.created_at, *seq))
            .collect();
        eligible.sort();
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, seq) in eligible {
            if let Some(row) = state.rows.get_mut(&seq) {
                row.state = TaskState::Claimed;
                row.claimed_at = Some(now);
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn renew(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.leased_mut(lease) else {
            return Ok(None);
        };
        row.claimed_at = Some(now);
        Ok(Some(Lease {
            id: lease.id,
            claimed_at: now,
        }))
    }

    async fn mark_done(&self, lease: &Lease, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.leased_mut(lease) else {
            return Ok(false);
        };
        row.state = TaskState::Done;
        row.finished_at = Some(now);
        Ok(true)
    }

    async fn mark_failed(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
        decision: &Decision,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.leased_mut(lease) else {
            return Ok(false);
        };
        row.fail_count = row.fail_count.saturating_add(1);
        row.failed_at = Some(now);
        row.last_error = Some(error.to_string());
        row.claimed_at = None;
        match decision {
            Decision::Retry { run_at, .. } => {
                row.state = TaskState::Pending;
                row.run_at = *run_at;
            }
            Decision::Dead => {
                row.state = TaskState::Dead;
                row.finished_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .index
            .get(&id)
            .and_then(|seq| state.rows.get(seq))
            .cloned())
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for row in state.rows.values() {
            match row.state {
                TaskState::Pending if row.run_at <= now => counts.ready += 1,
                TaskState::Pending => counts.scheduled += 1,
                TaskState::Claimed => counts.claimed += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    async fn pending_names(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .rows
            .values()
            .filter(|row| !row.state.is_terminal())
            .map(|row| row.name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<TaskRow>, StoreError> {
        let state = self.state.lock().await;
        let mut dead: Vec<(Option<DateTime<Utc>>, u64, &TaskRow)> = state
            .rows
            .iter()
            .filter(|(_, row)| row.state == TaskState::Dead)
            .map(|(seq, row)| (row.finished_at, *seq, row))
            .collect();
        dead.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(dead
            .into_iter()
            .take(limit)
            .map(|(_, _, row)| row.clone())
            .collect())
    }

    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.row_mut(id) else {
            return Err(StoreError::NotFound(id));
        };
        if row.state != TaskState::Dead {
            return Ok(false);
        }
        row.state = TaskState::Pending;
        row.fail_count = 0;
        row.run_at = now;
        row.claimed_at = None;
        row.finished_at = None;
        Ok(true)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<(u64, TaskId)> = state
            .rows
            .iter()
            .filter(|(_, row)| {
                row.state.is_terminal() && row.finished_at.is_some_and(|at| at < before)
            })
            .map(|(seq, row)| (*seq, row.id))
            .collect();
        for (seq, id) in &doomed {
            state.rows.remove(seq);
            state.index.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandlerError;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn new_task(name: &str, created: DateTime<Utc>) -> NewTask {
        NewTask {
            id: TaskId::generate(created),
            name: name.to_string(),
            payload: serde_json::json!({ "n": 1 }),
            created_at: created,
            run_at: created,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn insert_and_counts() {
        let store = InMemoryTaskStore::new();
        store.insert(new_task("a", at(0))).await.unwrap();

        let counts = store.counts(at(0)).await.unwrap();
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.claimed, 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn claim_transitions_to_claimed() {
        let store = InMemoryTaskStore::new();
        let row = store.insert(new_task("a", at(0))).await.unwrap();

        let claimed = store.claim_batch(10, at(1), TIMEOUT).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, row.id);
        assert_eq!(claimed[0].state, TaskState::Claimed);
        assert_eq!(claimed[0].claimed_at, Some(at(1)));

        let counts = store.counts(at(1)).await.unwrap();
        assert_eq!(counts.ready, 0);
        assert_eq!(counts.claimed, 1);
    }

    #[tokio::test]
    async fn retry_decision_returns_row_to_pending() {
        let store = InMemoryTaskStore::new();
        store.insert(new_task("a", at(0))).await.unwrap();
        let row = store.claim_batch(1, at(0), TIMEOUT).await.unwrap().remove(0);
        let lease = row.lease().unwrap();

        let decision = Decision::Retry {
            delay: Duration::from_secs(5),
            run_at: at(5),
        };
        assert!(store.mark_failed(&lease, "oops", at(0), &decision).await.unwrap());

        let row = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(row.state, TaskState::Pending);
        assert_eq!(row.fail_count, 1);
        assert_eq!(row.failed_at, Some(at(0)));
        assert_eq!(row.last_error.as_deref(), Some("oops"));
        assert_eq!(row.claimed_at, None);
        assert_eq!(row.run_at, at(5));

        let counts = store.counts(at(1)).await.unwrap();
        assert_eq!(counts.scheduled, 1);
    }

    #[tokio::test]
    async fn failures_against_a_released_lease_are_ignored() {
        let store = InMemoryTaskStore::new();
        store.insert(new_task("a", at(0))).await.unwrap();
        let row = store.claim_batch(1, at(0), TIMEOUT).await.unwrap().remove(0);
        let lease = row.lease().unwrap();

        let err = HandlerError::transient("x");
        let decision = crate::domain::RetryPolicy::default().decide(0, &err, at(0));
        assert!(store.mark_failed(&lease, "x", at(0), &decision).await.unwrap());
        assert!(!store.mark_failed(&lease, "x", at(0), &decision).await.unwrap());

        let row = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(row.fail_count, 1);
    }

    #[tokio::test]
    async fn requeue_of_unknown_id_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::generate(at(0));
        assert_eq!(
            store.requeue_dead(id, at(0)).await.unwrap_err(),
            StoreError::NotFound(id)
        );
    }
}
