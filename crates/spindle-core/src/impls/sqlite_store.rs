//! SQLite task store (sqlx).
//!
//! All rows live in one table, `spindle_tasks`. Timestamps are stored as
//! Unix milliseconds so that eligibility checks are plain integer
//! comparisons the `(state, run_at, created_at)` index can serve.
//!
//! Claiming is a single `UPDATE ... WHERE seq IN (SELECT ... LIMIT n)
//! RETURNING ...` statement. SQLite runs it under the database write lock,
//! so two pollers (in this process or another one sharing the file) can
//! never both claim the same row.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use tracing::{debug, error, info, warn};

use crate::domain::{Decision, Lease, NewTask, TaskId, TaskRow, TaskState, time};
use crate::ports::{QueueCounts, StoreError, TaskStore};

const COLUMNS: &str = "seq, id, name, payload, state, created_at, run_at, claimed_at, \
                       failed_at, fail_count, last_error, finished_at";

/// SQLite-backed task store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (creating if missing) the database at `url` and ensure the schema.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `sqlite://spindle.db`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(url, max_connections, "connected to task store");
        Self::from_pool(pool).await
    }

    /// A private in-memory database.
    ///
    /// Pinned to a single connection that is never recycled, since every
    /// SQLite connection to `:memory:` opens its own empty database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the table and index if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spindle_tasks (
                seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                id           TEXT    NOT NULL UNIQUE,
                name         TEXT    NOT NULL,
                payload      TEXT    NOT NULL,
                state        TEXT    NOT NULL DEFAULT 'pending',
                created_at   INTEGER NOT NULL,
                run_at       INTEGER NOT NULL,
                claimed_at   INTEGER NULL,
                failed_at    INTEGER NULL,
                fail_count   INTEGER NOT NULL DEFAULT 0,
                last_error   TEXT    NULL,
                finished_at  INTEGER NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS spindle_tasks_eligible
                ON spindle_tasks (state, run_at, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("task store schema ready");
        Ok(())
    }

    /// Dead-letter a row this poll just claimed but cannot decode.
    ///
    /// Left claimed, it would come back on every stale reclaim and fail the
    /// whole claim each time. A failure here only leaves it for the next reclaim.
    async fn bury_undecodable(&self, seq: i64, now: DateTime<Utc>, err: &StoreError) {
        error!(seq, error = %err, "claimed row cannot be decoded; dead-lettering it");
        let result = sqlx::query(
            r#"
            UPDATE spindle_tasks
               SET state       = 'dead',
                   fail_count  = fail_count + 1,
                   failed_at   = ?1,
                   last_error  = ?2,
                   claimed_at  = NULL,
                   finished_at = ?1
             WHERE seq = ?3 AND state = 'claimed' AND claimed_at = ?1
            "#,
        )
        .bind(millis(now))
        .bind(err.to_string())
        .bind(seq)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(seq, error = %e, "could not dead-letter undecodable row");
        }
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|ms| from_millis(ms, column)).transpose()
}

fn decode_row(row: &SqliteRow) -> Result<TaskRow, StoreError> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    let fail_count: i64 = row.try_get("fail_count")?;

    Ok(TaskRow {
        id: id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("id {id:?}: {e}")))?,
        name: row.try_get("name")?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::Corrupt(format!("payload of {id}: {e}")))?,
        state: state
            .parse::<TaskState>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: from_millis(row.try_get("created_at")?, "created_at")?,
        run_at: from_millis(row.try_get("run_at")?, "run_at")?,
        claimed_at: opt_from_millis(row.try_get("claimed_at")?, "claimed_at")?,
        failed_at: opt_from_millis(row.try_get("failed_at")?, "failed_at")?,
        fail_count: u32::try_from(fail_count)
            .map_err(|_| StoreError::Corrupt(format!("fail_count of {id}: {fail_count}")))?,
        last_error: row.try_get("last_error")?,
        finished_at: opt_from_millis(row.try_get("finished_at")?, "finished_at")?,
    })
}

/// SQLite result codes that mean "try again later" rather than "bad query".
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";
const SQLITE_CANTOPEN: &str = "14";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code();
                let code = code.as_deref().unwrap_or_default();
                // Extended codes carry the primary code in the low byte.
                let primary = code
                    .parse::<u32>()
                    .map(|c| (c & 0xff).to_string())
                    .unwrap_or_default();
                if [SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN].contains(&primary.as_str()) {
                    StoreError::Unavailable(err.to_string())
                } else {
                    StoreError::Database(err.to_string())
                }
            }
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: NewTask) -> Result<TaskRow, StoreError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| StoreError::Database(format!("payload encode: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO spindle_tasks (id, name, payload, state, created_at, run_at, fail_count)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 0)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.name)
        .bind(payload)
        .bind(millis(task.created_at))
        .bind(millis(task.run_at))
        .execute(&self.pool)
        .await?;

        Ok(TaskRow::from_new(task))
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
        let query = format!(
            r#"
            UPDATE spindle_tasks
               SET state = 'claimed', claimed_at = ?1
             WHERE seq IN (
                   SELECT seq FROM spindle_tasks
                    WHERE (state = 'pending' AND run_at <= ?1)
                       OR (state = 'claimed' AND claimed_at <= ?2)
                    ORDER BY created_at ASC, seq ASC
                    LIMIT ?3
             )
            RETURNING {COLUMNS}
            "#
        );

        let rows = sqlx::query(&query)
            .bind(millis(now))
            .bind(millis(stale_before))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("seq")?;
            match decode_row(row) {
                Ok(task) => claimed.push((seq, task)),
                Err(err) => self.bury_undecodable(seq, now, &err).await,
            }
        }

        // RETURNING order is unspecified; restore claim order.
        claimed.sort_by(|(seq_a, a), (seq_b, b)| (a.created_at, seq_a).cmp(&(b.created_at, seq_b)));
        Ok(claimed.into_iter().map(|(_, row)| row).collect())
    }

    async fn renew(&self, lease: &Lease, now: DateTime<Utc>) -> Result<Option<Lease>, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE spindle_tasks
               SET claimed_at = ?1
             WHERE id = ?2 AND state = 'claimed' AND claimed_at = ?3
            "#,
        )
        .bind(millis(now))
        .bind(lease.id.to_string())
        .bind(millis(lease.claimed_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }
        Ok(Some(Lease {
            id: lease.id,
            claimed_at: from_millis(millis(now), "claimed_at")?,
        }))
    }

    async fn mark_done(&self, lease: &Lease, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE spindle_tasks
               SET state = 'done', finished_at = ?1
             WHERE id = ?2 AND state = 'claimed' AND claimed_at = ?3
            "#,
        )
        .bind(millis(now))
        .bind(lease.id.to_string())
        .bind(millis(lease.claimed_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        lease: &Lease,
        error: &str,
        now: DateTime<Utc>,
        decision: &Decision,
    ) -> Result<bool, StoreError> {
        let (state, run_at, finished_at) = match decision {
            Decision::Retry { run_at, .. } => (TaskState::Pending, Some(millis(*run_at)), None),
            Decision::Dead => (TaskState::Dead, None, Some(millis(now))),
        };

        let result = sqlx::query(
            r#"
            UPDATE spindle_tasks
               SET state       = ?1,
                   fail_count  = fail_count + 1,
                   failed_at   = ?2,
                   last_error  = ?3,
                   claimed_at  = NULL,
                   run_at      = COALESCE(?4, run_at),
                   finished_at = ?5
             WHERE id = ?6 AND state = 'claimed' AND claimed_at = ?7
            "#,
        )
        .bind(state.as_str())
        .bind(millis(now))
        .bind(error)
        .bind(run_at)
        .bind(finished_at)
        .bind(lease.id.to_string())
        .bind(millis(lease.claimed_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRow>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM spindle_tasks WHERE id = ?1");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<QueueCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' AND run_at <= ?1 THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN state = 'pending' AND run_at >  ?1 THEN 1 ELSE 0 END), 0) AS scheduled,
                COALESCE(SUM(CASE WHEN state = 'claimed' THEN 1 ELSE 0 END), 0) AS claimed,
                COALESCE(SUM(CASE WHEN state = 'done'    THEN 1 ELSE 0 END), 0) AS done,
                COALESCE(SUM(CASE WHEN state = 'dead'    THEN 1 ELSE 0 END), 0) AS dead
            FROM spindle_tasks
            "#,
        )
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let n: i64 = row.try_get(column)?;
            Ok(u64::try_from(n).unwrap_or(0))
        };
        Ok(QueueCounts {
            ready: count("ready")?,
            scheduled: count("scheduled")?,
            claimed: count("claimed")?,
            done: count("done")?,
            dead: count("dead")?,
        })
    }

    async fn pending_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT name FROM spindle_tasks
             WHERE state IN ('pending', 'claimed')
             ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<TaskRow>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM spindle_tasks WHERE state = 'dead' \
             ORDER BY finished_at DESC, seq DESC LIMIT ?1"
        );
        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        // Undecodable rows end up here too; skip them rather than hide every other dead row.
        Ok(rows
            .iter()
            .filter_map(|row| match decode_row(row) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable dead row");
                    None
                }
            })
            .collect())
    }

    async fn requeue_dead(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE spindle_tasks
               SET state = 'pending', fail_count = 0, run_at = ?1,
                   claimed_at = NULL, finished_at = NULL
             WHERE id = ?2 AND state = 'dead'
            "#,
        )
        .bind(millis(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM spindle_tasks
             WHERE state IN ('done', 'dead') AND finished_at < ?1
            "#,
        )
        .bind(millis(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
