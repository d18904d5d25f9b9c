//! SQLite adapter for the durable queue and cost ledger
//!
//! Both live in one database file so a single `SqliteDatabase` handle can be
//! shared by every queue, worker and the ledger of a deployment.
//!
//! Timestamps are stored as INTEGER microseconds since the epoch. Job leasing
//! runs inside an IMMEDIATE transaction, which takes the write lock before the
//! candidate row is read; two processes can never lease the same job.
//!
//! rusqlite is synchronous: every statement runs on tokio's blocking pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

use crate::domain::{
    apply_release, apply_stall, JobRecord, JobStatus, LedgerBackend, LedgerEntry, QueueBackend,
    QueueCounts, ReclaimOutcome, Release,
};
use crate::{Result, StorageError};

const JOB_COLUMNS: &str = "seq, id, queue, data, priority, status, attempts, max_attempts, stalls,
     lease_owner, lease_expiry, available_at, enqueued_at, updated_at, last_error, result";

/// Shared SQLite connection.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open (or create) a database file
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                data TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                stalls INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_expiry INTEGER,
                available_at INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_error TEXT,
                result TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_lease
                ON jobs(queue, status, priority DESC, seq);

            CREATE INDEX IF NOT EXISTS idx_jobs_expiry
                ON jobs(status, lease_expiry);

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                amount_micros INTEGER NOT NULL,
                run_id TEXT,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_timestamp
                ON ledger_entries(timestamp);

            CREATE INDEX IF NOT EXISTS idx_ledger_run
                ON ledger_entries(run_id);",
        )?;

        Ok(())
    }

    pub fn queue(&self) -> SqliteQueue {
        SqliteQueue { db: self.clone() }
    }

    pub fn ledger(&self) -> SqliteLedger {
        SqliteLedger { db: self.clone() }
    }

    /// Run `f` against the connection on the blocking pool, so a busy
    /// database never stalls an async worker thread.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
            .await
            .map_err(StorageError::task_failed)?
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StorageError::serialization(format!("Timestamp out of range: {}", value)))
}

/// Raw column values of one `jobs` row
struct JobRow {
    seq: i64,
    id: String,
    queue: String,
    data: String,
    priority: i32,
    status: String,
    attempts: u32,
    max_attempts: u32,
    stalls: u32,
    lease_owner: Option<String>,
    lease_expiry: Option<i64>,
    available_at: i64,
    enqueued_at: i64,
    updated_at: i64,
    last_error: Option<String>,
    result: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            queue: row.get(2)?,
            data: row.get(3)?,
            priority: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            max_attempts: row.get(7)?,
            stalls: row.get(8)?,
            lease_owner: row.get(9)?,
            lease_expiry: row.get(10)?,
            available_at: row.get(11)?,
            enqueued_at: row.get(12)?,
            updated_at: row.get(13)?,
            last_error: row.get(14)?,
            result: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| StorageError::serialization(format!("Invalid job id: {}", e)))?,
            seq: self.seq,
            queue: self.queue,
            data: serde_json::from_str(&self.data)?,
            priority: self.priority,
            status: JobStatus::from_str(&self.status)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            stalls: self.stalls,
            lease_owner: self.lease_owner,
            lease_expiry: self.lease_expiry.map(from_micros).transpose()?,
            available_at: from_micros(self.available_at)?,
            enqueued_at: from_micros(self.enqueued_at)?,
            updated_at: from_micros(self.updated_at)?,
            last_error: self.last_error,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

fn fetch_job(conn: &Connection, id: Uuid) -> Result<Option<JobRecord>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
    conn.query_row(&sql, params![id.to_string()], JobRow::from_row)
        .optional()?
        .map(JobRow::into_record)
        .transpose()
}

fn fetch_leased(tx: &Transaction<'_>, id: Uuid, worker: &str) -> Result<JobRecord> {
    let job = fetch_job(tx, id)?.ok_or_else(|| StorageError::job_not_found(id))?;
    job.ensure_leased_by(worker)?;
    Ok(job)
}

/// Write back every mutable column of a job
fn store_job(conn: &Connection, job: &JobRecord) -> Result<()> {
    let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE jobs SET status = ?2, attempts = ?3, stalls = ?4, lease_owner = ?5,
                lease_expiry = ?6, available_at = ?7, updated_at = ?8, last_error = ?9,
                result = ?10
         WHERE id = ?1",
        params![
            job.id.to_string(),
            job.status.as_str(),
            job.attempts,
            job.stalls,
            job.lease_owner,
            job.lease_expiry.map(micros),
            micros(job.available_at),
            micros(job.updated_at),
            job.last_error,
            result,
        ],
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SqliteQueue {
    db: SqliteDatabase,
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn ping(&self) -> Result<()> {
        self.db
            .call(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
    }

    async fn insert(&self, mut job: JobRecord) -> Result<JobRecord> {
        let data = serde_json::to_string(&job.data)?;
        let row = job.clone();
        let seq = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (id, queue, data, priority, status, attempts, max_attempts,
                                       stalls, available_at, enqueued_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        row.id.to_string(),
                        row.queue,
                        data,
                        row.priority,
                        row.status.as_str(),
                        row.attempts,
                        row.max_attempts,
                        row.stalls,
                        micros(row.available_at),
                        micros(row.enqueued_at),
                        micros(row.updated_at),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        job.seq = seq;
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        self.db.call(move |conn| fetch_job(conn, id)).await
    }

    async fn lease_next(
        &self,
        queue: &str,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let queue = queue.to_string();
        let worker = worker.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let sql = format!(
                    "SELECT {} FROM jobs
                     WHERE queue = ?1 AND status = 'waiting' AND available_at <= ?2
                     ORDER BY priority DESC, seq ASC
                     LIMIT 1",
                    JOB_COLUMNS
                );
                let candidate = tx
                    .query_row(&sql, params![queue, micros(now)], JobRow::from_row)
                    .optional()?;

                let Some(row) = candidate else {
                    return Ok(None);
                };

                let mut job = row.into_record()?;
                job.status = JobStatus::Active;
                job.lease_owner = Some(worker);
                job.lease_expiry = Some(lease_until);
                job.updated_at = now;
                store_job(&tx, &job)?;
                tx.commit()?;

                Ok(Some(job))
            })
            .await
    }

    async fn complete(
        &self,
        id: Uuid,
        worker: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let worker = worker.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut job = fetch_leased(&tx, id, &worker)?;
                job.status = JobStatus::Completed;
                job.lease_owner = None;
                job.lease_expiry = None;
                job.result = result;
                job.updated_at = now;
                store_job(&tx, &job)?;
                tx.commit()?;

                Ok(job)
            })
            .await
    }

    async fn release(
        &self,
        id: Uuid,
        worker: &str,
        release: Release,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let worker = worker.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut job = fetch_leased(&tx, id, &worker)?;
                apply_release(&mut job, release, now);
                store_job(&tx, &job)?;
                tx.commit()?;

                Ok(job)
            })
            .await
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        stall_ceiling: u32,
    ) -> Result<ReclaimOutcome> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let sql = format!(
                    "SELECT {} FROM jobs WHERE status = 'active' AND lease_expiry < ?1 ORDER BY seq",
                    JOB_COLUMNS
                );
                let rows = {
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![micros(now)], JobRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                let mut outcome = ReclaimOutcome::default();
                for row in rows {
                    let mut job = row.into_record()?;
                    if apply_stall(&mut job, stall_ceiling, now) {
                        outcome.dead_lettered.push(job.id);
                    } else {
                        outcome.requeued.push(job.id);
                    }
                    store_job(&tx, &job)?;
                }
                tx.commit()?;

                Ok(outcome)
            })
            .await
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let worker = worker.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut job = fetch_leased(&tx, id, &worker)?;
                job.lease_expiry = Some(lease_until);
                job.updated_at = now;
                store_job(&tx, &job)?;
                tx.commit()?;

                Ok(job)
            })
            .await
    }

    async fn remove_pending(&self, id: Uuid) -> Result<bool> {
        self.db
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM jobs WHERE id = ?1 AND status = 'waiting'",
                    params![id.to_string()],
                )?;
                Ok(removed > 0)
            })
            .await
    }

    async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<JobRecord> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let mut job =
                    fetch_job(&tx, id)?.ok_or_else(|| StorageError::job_not_found(id))?;
                if job.status != JobStatus::Dead {
                    return Err(StorageError::job_conflict(
                        id,
                        format_args!("is {}, not dead", job.status),
                    ));
                }
                job.status = JobStatus::Waiting;
                job.attempts = 0;
                job.stalls = 0;
                job.available_at = now;
                job.updated_at = now;
                store_job(&tx, &job)?;
                tx.commit()?;

                Ok(job)
            })
            .await
    }

    async fn list(&self, queue: &str, status: JobStatus) -> Result<Vec<JobRecord>> {
        let queue = queue.to_string();
        self.db
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM jobs WHERE queue = ?1 AND status = ?2 ORDER BY seq",
                    JOB_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![queue, status.as_str()], JobRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                rows.into_iter().map(JobRow::into_record).collect()
            })
            .await
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let queue = queue.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status")?;
                let rows = stmt
                    .query_map(params![queue], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut counts = QueueCounts::default();
                for (status, count) in rows {
                    let n = usize::try_from(count).unwrap_or(0);
                    match JobStatus::from_str(&status)? {
                        JobStatus::Waiting => counts.waiting = n,
                        JobStatus::Active => counts.active = n,
                        JobStatus::Completed => counts.completed = n,
                        JobStatus::Failed => counts.failed = n,
                        JobStatus::Dead => counts.dead = n,
                    }
                }
                Ok(counts)
            })
            .await
    }

    async fn queues(&self) -> Result<Vec<String>> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT queue FROM jobs ORDER BY queue")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(names)
            })
            .await
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        self.db
            .call(move |conn| {
                let purged = conn.execute(
                    "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
                    params![micros(before)],
                )?;
                Ok(purged)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ledger
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SqliteLedger {
    db: SqliteDatabase,
}

fn read_entries(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, service_id, amount, run_id, timestamp)| {
            Ok(LedgerEntry {
                id: Uuid::parse_str(&id).map_err(|e| {
                    StorageError::serialization(format!("Invalid entry id: {}", e))
                })?,
                service_id,
                amount_micros: u64::try_from(amount).map_err(|_| {
                    StorageError::serialization(format!("Negative amount: {}", amount))
                })?,
                run_id,
                timestamp: from_micros(timestamp)?,
            })
        })
        .collect()
}

#[async_trait]
impl LedgerBackend for SqliteLedger {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let amount = i64::try_from(entry.amount_micros).map_err(|_| {
            StorageError::serialization(format!("Amount out of range: {}", entry.amount_micros))
        })?;
        let entry = entry.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO ledger_entries (id, service_id, amount_micros, run_id, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        entry.id.to_string(),
                        entry.service_id,
                        amount,
                        entry.run_id,
                        micros(entry.timestamp),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        self.db
            .call(move |conn| {
                read_entries(
                    conn,
                    "SELECT id, service_id, amount_micros, run_id, timestamp
                     FROM ledger_entries WHERE timestamp >= ?1 ORDER BY timestamp, rowid",
                    params![micros(since)],
                )
            })
            .await
    }

    async fn entries_for_run(&self, run_id: &str) -> Result<Vec<LedgerEntry>> {
        let run_id = run_id.to_string();
        self.db
            .call(move |conn| {
                read_entries(
                    conn,
                    "SELECT id, service_id, amount_micros, run_id, timestamp
                     FROM ledger_entries WHERE run_id = ?1 ORDER BY timestamp, rowid",
                    params![run_id],
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn job(queue: &str, priority: i32) -> JobRecord {
        JobRecord::new(queue, serde_json::json!({"stage": "WRITE"}), priority, 3)
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let db = SqliteDatabase::in_memory().unwrap();
        let queue = db.queue();

        let stored = queue.insert(job("stages", 0)).await.unwrap();
        assert!(stored.seq > 0);

        let loaded = queue.get(stored.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, serde_json::json!({"stage": "WRITE"}));
        assert_eq!(loaded.status, JobStatus::Waiting);
        assert_eq!(
            loaded.available_at.timestamp_micros(),
            stored.available_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_lease_priority_then_fifo() {
        let db = SqliteDatabase::in_memory().unwrap();
        let queue = db.queue();
        let low = queue.insert(job("q", 0)).await.unwrap();
        let high = queue.insert(job("q", 9)).await.unwrap();

        let now = Utc::now();
        let until = now + ChronoDuration::seconds(30);
        let first = queue.lease_next("q", "w", now, until).await.unwrap().unwrap();
        let second = queue.lease_next("q", "w", now, until).await.unwrap().unwrap();

        assert_eq!(first.id, high.id);
        assert_eq!(second.id, low.id);
        assert_eq!(first.lease_owner.as_deref(), Some("w"));
        assert!(queue.lease_next("q", "w", now, until).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_then_dead_letter() {
        let db = SqliteDatabase::in_memory().unwrap();
        let queue = db.queue();
        let stored = queue.insert(job("q", 0)).await.unwrap();

        let mut now = Utc::now();
        for round in 1..=3 {
            let until = now + ChronoDuration::seconds(1);
            queue.lease_next("q", "w", now, until).await.unwrap().unwrap();
            now = now + ChronoDuration::seconds(5);
            let outcome = queue.reclaim_expired(now, 2).await.unwrap();
            if round < 3 {
                assert_eq!(outcome.requeued, vec![stored.id]);
            } else {
                assert_eq!(outcome.dead_lettered, vec![stored.id]);
            }
        }

        let dead = queue.list("q", JobStatus::Dead).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].stalls, 3);

        let replayed = queue.requeue_dead(stored.id, now).await.unwrap();
        assert_eq!(replayed.status, JobStatus::Waiting);
        assert_eq!(replayed.stalls, 0);
    }

    #[tokio::test]
    async fn test_release_by_stranger_is_rejected() {
        let db = SqliteDatabase::in_memory().unwrap();
        let queue = db.queue();
        let stored = queue.insert(job("q", 0)).await.unwrap();
        let now = Utc::now();
        queue
            .lease_next("q", "owner", now, now + ChronoDuration::seconds(30))
            .await
            .unwrap();

        let err = queue
            .release(
                stored.id,
                "stranger",
                Release::Fail {
                    reason: "x".to_string(),
                },
                now,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::JobConflict);

        let counts = queue.counts("q").await.unwrap();
        assert_eq!(counts.active, 1);
    }

    #[tokio::test]
    async fn test_ledger_entries_since() {
        let db = SqliteDatabase::in_memory().unwrap();
        let ledger = db.ledger();
        let now = Utc::now();

        ledger
            .append(&LedgerEntry::new("llm", 1_500, None, now - ChronoDuration::days(2)))
            .await
            .unwrap();
        ledger
            .append(&LedgerEntry::new("llm", 2_000, Some("run-1".to_string()), now))
            .await
            .unwrap();

        let recent = ledger
            .entries_since(now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].amount_micros, 2_000);
        assert_eq!(recent[0].run_id.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_extend_lease_and_remove_pending() {
        let db = SqliteDatabase::in_memory().unwrap();
        let queue = db.queue();
        let leased = queue.insert(job("q", 1)).await.unwrap();
        let waiting = queue.insert(job("q", 0)).await.unwrap();

        let now = Utc::now();
        queue
            .lease_next("q", "w", now, now + ChronoDuration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        let extended = queue
            .extend_lease(leased.id, "w", now + ChronoDuration::seconds(60), now)
            .await
            .unwrap();
        assert_eq!(
            extended.lease_expiry.map(|t| t.timestamp_micros()),
            Some((now + ChronoDuration::seconds(60)).timestamp_micros())
        );

        let outcome = queue
            .reclaim_expired(now + ChronoDuration::seconds(5), 2)
            .await
            .unwrap();
        assert!(outcome.requeued.is_empty());

        assert!(!queue.remove_pending(leased.id).await.unwrap());
        assert!(queue.remove_pending(waiting.id).await.unwrap());
        assert_eq!(queue.counts("q").await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_ledger_entries_for_run_span_months() {
        let db = SqliteDatabase::in_memory().unwrap();
        let ledger = db.ledger();
        let now = Utc::now();
        ledger
            .append(&LedgerEntry::new("llm", 700, Some("run-1".to_string()), now - ChronoDuration::days(45)))
            .await
            .unwrap();
        ledger
            .append(&LedgerEntry::new("llm", 300, Some("run-1".to_string()), now))
            .await
            .unwrap();
        ledger
            .append(&LedgerEntry::new("llm", 999, Some("run-2".to_string()), now))
            .await
            .unwrap();

        let entries = ledger.entries_for_run("run-1").await.unwrap();
        let total: u64 = entries.iter().map(|e| e.amount_micros).sum();
        assert_eq!(entries.len(), 2);
        assert_eq!(total, 1_000);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let id = {
            let db = SqliteDatabase::open(&path).unwrap();
            db.queue().insert(job("q", 0)).await.unwrap().id
        };

        let db = SqliteDatabase::open(&path).unwrap();
        let loaded = db.queue().get(id).await.unwrap();
        assert!(loaded.is_some());
    }
}
