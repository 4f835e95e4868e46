//! SQLite queue store.
//!
//! Two tables: `jobs` (one row per phase of a run) and `run_locks`
//! (per-run worker leases). All mutation in the system goes through this
//! store; workers on separate processes coordinate purely through its
//! transactions. Timestamps are RFC 3339 UTC strings with millisecond
//! precision, so lexicographic order in SQL equals chronological order;
//! staleness decisions parse them in Rust and treat unparseable values
//! as stale.

use chrono::{DateTime, SecondsFormat, Utc};
use conveyor_core::{Id, Job, JobStatus, Phase, QueueStats, RecoveryReport};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Explicit column list for job queries, so row mapping survives
/// ALTER TABLE migrations appending columns.
const JOBS_COLUMNS: &str = "id, run_id, phase, status, attempt, created_at, updated_at, last_error";

/// Default `last_error` stamped on jobs requeued by the recovery sweep.
pub const RECOVERED_ERROR: &str = "Recovered stale in_progress job.";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job not found: {0}")]
    JobNotFound(i64),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Durable job queue and lease table over embedded SQLite.
pub struct QueueStore {
    pool: Pool<Sqlite>,
    lease_timeout: Duration,
}

/// Current wall-clock as the canonical persisted timestamp string.
fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Compare as milliseconds since epoch; unparseable is stale.
fn is_stale(ts: &str, now: DateTime<Utc>, timeout: Duration) -> bool {
    match parse_ts(ts) {
        Some(t) => now.timestamp_millis() - t.timestamp_millis() > timeout.as_millis() as i64,
        None => true,
    }
}

impl QueueStore {
    /// Open (or create) the store at `db_path` with WAL mode enabled.
    pub async fn new(db_path: &Path, lease_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            lease_timeout,
        })
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Job operations ---

    /// Insert one queued job. Does not enforce at-most-one-per-run; the
    /// worker preserves that by enqueueing the next phase only after the
    /// previous one completed.
    pub async fn enqueue(&self, run_id: &Id, phase: Phase) -> Result<Job> {
        let now = now_ts();
        let result = sqlx::query(
            "INSERT INTO jobs (run_id, phase, status, attempt, created_at, updated_at) \
             VALUES (?1, ?2, 'queued', 0, ?3, ?3)",
        )
        .bind(run_id.as_ref())
        .bind(phase.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_job(result.last_insert_rowid()).await
    }

    /// Get a job by id.
    pub async fn get_job(&self, job_id: i64) -> Result<Job> {
        let query = format!("SELECT {JOBS_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;
        Ok(row.into_job())
    }

    /// List all jobs of a run in insertion order.
    pub async fn list_jobs(&self, run_id: &Id) -> Result<Vec<Job>> {
        let query = format!("SELECT {JOBS_COLUMNS} FROM jobs WHERE run_id = ?1 ORDER BY id ASC");
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(run_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.into_job()).collect())
    }

    /// Claim the oldest queued job (FIFO, ties broken by id) and move it
    /// to `in_progress` with `attempt` incremented. The conditional
    /// update is the single-claim guard: a row that raced to another
    /// worker affects zero rows here and the next candidate is tried.
    pub async fn claim_one(&self) -> Result<Option<Job>> {
        loop {
            let candidate: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM jobs WHERE status = 'queued' \
                 ORDER BY created_at ASC, id ASC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some((job_id,)) = candidate else {
                return Ok(None);
            };

            let result = sqlx::query(
                "UPDATE jobs SET status = 'in_progress', attempt = attempt + 1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'queued'",
            )
            .bind(now_ts())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(Some(self.get_job(job_id).await?));
            }
        }
    }

    /// Return a claimed job to the queue (lease-denied path). The
    /// attempt count is preserved.
    pub async fn requeue(&self, job_id: i64) -> Result<()> {
        self.update_status(job_id, "queued", None).await
    }

    pub async fn mark_done(&self, job_id: i64) -> Result<()> {
        self.update_status(job_id, "done", None).await
    }

    pub async fn mark_failed(&self, job_id: i64, error: &str) -> Result<()> {
        self.update_status(job_id, "failed", Some(error)).await
    }

    async fn update_status(&self, job_id: i64, status: &str, error: Option<&str>) -> Result<()> {
        let result = match error {
            Some(error) => {
                sqlx::query(
                    "UPDATE jobs SET status = ?1, updated_at = ?2, last_error = ?3 WHERE id = ?4",
                )
                .bind(status)
                .bind(now_ts())
                .bind(error)
                .bind(job_id)
                .execute(&self.pool)
                .await?
            }
            None => sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(status)
                .bind(now_ts())
                .bind(job_id)
                .execute(&self.pool)
                .await?,
        };

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Heartbeat: bump `updated_at` without a status change.
    pub async fn touch(&self, job_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2")
            .bind(now_ts())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Cancel every live job of a run. Terminal rows are untouched.
    pub async fn cancel_run(&self, run_id: &Id) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?1 \
             WHERE run_id = ?2 AND status IN ('queued', 'in_progress')",
        )
        .bind(now_ts())
        .bind(run_id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- Lease operations ---

    /// Acquire the per-run lease: insert if absent, steal if the holder's
    /// clock is past the lease timeout, otherwise deny. The steal is a
    /// compare-and-swap on the observed `locked_at`.
    pub async fn acquire_lease(&self, run_id: &Id, owner: &Id) -> Result<bool> {
        loop {
            let inserted = sqlx::query(
                "INSERT INTO run_locks (run_id, locked_at, owner) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(run_id) DO NOTHING",
            )
            .bind(run_id.as_ref())
            .bind(now_ts())
            .bind(owner.as_ref())
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 1 {
                return Ok(true);
            }

            let row: Option<(String,)> =
                sqlx::query_as("SELECT locked_at FROM run_locks WHERE run_id = ?1")
                    .bind(run_id.as_ref())
                    .fetch_optional(&self.pool)
                    .await?;

            let Some((locked_at,)) = row else {
                // Holder released between our insert and select; retry.
                continue;
            };

            if !is_stale(&locked_at, Utc::now(), self.lease_timeout) {
                return Ok(false);
            }

            let stolen = sqlx::query(
                "UPDATE run_locks SET owner = ?1, locked_at = ?2 \
                 WHERE run_id = ?3 AND locked_at = ?4",
            )
            .bind(owner.as_ref())
            .bind(now_ts())
            .bind(run_id.as_ref())
            .bind(&locked_at)
            .execute(&self.pool)
            .await?;

            return Ok(stolen.rows_affected() == 1);
        }
    }

    /// Release the lease iff `owner` still holds it.
    pub async fn release_lease(&self, run_id: &Id, owner: &Id) -> Result<()> {
        sqlx::query("DELETE FROM run_locks WHERE run_id = ?1 AND owner = ?2")
            .bind(run_id.as_ref())
            .bind(owner.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Heartbeat the lease iff `owner` still holds it.
    pub async fn touch_lease(&self, run_id: &Id, owner: &Id) -> Result<()> {
        sqlx::query("UPDATE run_locks SET locked_at = ?1 WHERE run_id = ?2 AND owner = ?3")
            .bind(now_ts())
            .bind(run_id.as_ref())
            .bind(owner.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unconditional lease delete (cancellation path).
    pub async fn force_release_lease(&self, run_id: &Id) -> Result<()> {
        sqlx::query("DELETE FROM run_locks WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let queued: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        let in_progress: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'in_progress'")
                .fetch_one(&self.pool)
                .await?;
        let leases: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM run_locks")
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueStats {
            queued: queued.0 as u64,
            in_progress: in_progress.0 as u64,
            lease_count: leases.0 as u64,
        })
    }

    /// Requeue `in_progress` jobs whose last touch is past the lease
    /// timeout and drop the leases of those runs, plus any lease that is
    /// stale by its own clock. One transaction; idempotent. After commit
    /// every live in-progress job has a live lease again.
    pub async fn recover_stale(&self) -> Result<RecoveryReport> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let in_progress: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, run_id, updated_at FROM jobs WHERE status = 'in_progress'")
                .fetch_all(&mut *tx)
                .await?;

        let mut requeued_jobs = 0u64;
        let mut release_runs: BTreeSet<String> = BTreeSet::new();
        for (job_id, run_id, updated_at) in in_progress {
            if !is_stale(&updated_at, now, self.lease_timeout) {
                continue;
            }
            let result = sqlx::query(
                "UPDATE jobs SET status = 'queued', updated_at = ?1, \
                 last_error = COALESCE(last_error, ?2) \
                 WHERE id = ?3 AND status = 'in_progress'",
            )
            .bind(now_ts())
            .bind(RECOVERED_ERROR)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            requeued_jobs += result.rows_affected();
            release_runs.insert(run_id);
        }

        // Leases stale by their own clock are released independently of
        // job recovery; either condition is sufficient.
        let leases: Vec<(String, String)> =
            sqlx::query_as("SELECT run_id, locked_at FROM run_locks")
                .fetch_all(&mut *tx)
                .await?;
        for (run_id, locked_at) in leases {
            if is_stale(&locked_at, now, self.lease_timeout) {
                release_runs.insert(run_id);
            }
        }

        let mut released_leases = 0u64;
        for run_id in &release_runs {
            let result = sqlx::query("DELETE FROM run_locks WHERE run_id = ?1")
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
            released_leases += result.rows_affected();
        }

        tx.commit().await?;

        Ok(RecoveryReport {
            requeued_jobs,
            released_leases,
        })
    }
}

#[cfg(test)]
impl QueueStore {
    /// Test hook: rewrite a job's `updated_at` to simulate a worker that
    /// died mid-phase.
    pub(crate) async fn set_job_updated_at(&self, job_id: i64, ts: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2")
            .bind(ts)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    run_id: String,
    phase: String,
    status: String,
    attempt: i64,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            run_id: Id::from_string(self.run_id),
            phase: Phase::parse(&self.phase).unwrap_or(Phase::Plan),
            status: JobStatus::parse(&self.status).unwrap_or(JobStatus::Failed),
            attempt: self.attempt as u32,
            created_at: parse_ts(&self.created_at).unwrap_or(DateTime::UNIX_EPOCH),
            updated_at: parse_ts(&self.updated_at).unwrap_or(DateTime::UNIX_EPOCH),
            last_error: self.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const LEASE_TIMEOUT: Duration = Duration::from_secs(300);

    struct TestStore {
        store: QueueStore,
        _dir: TempDir,
    }

    async fn create_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::new(&dir.path().join("queue.db"), LEASE_TIMEOUT)
            .await
            .unwrap();
        store.migrate_embedded().await.unwrap();
        TestStore { store, _dir: dir }
    }

    fn stale_ts() -> String {
        (Utc::now() - chrono::Duration::seconds(400)).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    async fn backdate_job(store: &QueueStore, job_id: i64, ts: &str) {
        sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2")
            .bind(ts)
            .bind(job_id)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    async fn backdate_lease(store: &QueueStore, run_id: &Id, ts: &str) {
        sqlx::query("UPDATE run_locks SET locked_at = ?1 WHERE run_id = ?2")
            .bind(ts)
            .bind(run_id.as_ref())
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let ts = create_test_store().await;
        ts.store.migrate_embedded().await.unwrap();
        ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
    }

    #[tokio::test]
    async fn claim_returns_none_on_empty_queue() {
        let ts = create_test_store().await;
        assert!(ts.store.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_and_claim_increments_attempt() {
        let ts = create_test_store().await;
        let run = Id::new();
        let job = ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);

        let claimed = ts.store.claim_one().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.phase, Phase::Plan);
        assert_eq!(claimed.run_id, run);
    }

    #[tokio::test]
    async fn claim_is_fifo_by_created_at() {
        let ts = create_test_store().await;
        let a = ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();

        assert_eq!(ts.store.claim_one().await.unwrap().unwrap().id, a.id);
        assert_eq!(ts.store.claim_one().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn claim_ties_broken_by_id() {
        let ts = create_test_store().await;
        let a = ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
        let b = ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();

        // Force identical created_at so only the id decides.
        let shared = now_ts();
        for id in [a.id, b.id] {
            sqlx::query("UPDATE jobs SET created_at = ?1 WHERE id = ?2")
                .bind(&shared)
                .bind(id)
                .execute(&ts.store.pool)
                .await
                .unwrap();
        }

        assert_eq!(ts.store.claim_one().await.unwrap().unwrap().id, a.id);
        assert_eq!(ts.store.claim_one().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let ts = create_test_store().await;
        for _ in 0..5 {
            ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
        }

        let store = Arc::new(ts.store);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.claim_one().await }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            let job = handle.await.unwrap().unwrap().unwrap();
            claimed.push(job.id);
        }
        claimed.sort_unstable();
        claimed.dedup();
        assert_eq!(claimed.len(), 5, "every claimer got a distinct job");
        assert!(store.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_preserves_attempt() {
        let ts = create_test_store().await;
        ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();

        let claimed = ts.store.claim_one().await.unwrap().unwrap();
        ts.store.requeue(claimed.id).await.unwrap();

        let again = ts.store.claim_one().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn mark_failed_persists_last_error() {
        let ts = create_test_store().await;
        ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
        let claimed = ts.store.claim_one().await.unwrap().unwrap();

        ts.store.mark_failed(claimed.id, "boom").await.unwrap();
        let job = ts.store.get_job(claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn touch_bumps_updated_at_without_status_change() {
        let ts = create_test_store().await;
        ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
        let claimed = ts.store.claim_one().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        ts.store.touch(claimed.id).await.unwrap();

        let job = ts.store.get_job(claimed.id).await.unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.updated_at > claimed.updated_at);
    }

    #[tokio::test]
    async fn missing_job_operations_error() {
        let ts = create_test_store().await;
        assert!(matches!(
            ts.store.get_job(99).await,
            Err(QueueError::JobNotFound(99))
        ));
        assert!(matches!(
            ts.store.touch(99).await,
            Err(QueueError::JobNotFound(99))
        ));
        assert!(matches!(
            ts.store.mark_done(99).await,
            Err(QueueError::JobNotFound(99))
        ));
    }

    #[tokio::test]
    async fn cancel_run_cancels_live_jobs_only() {
        let ts = create_test_store().await;
        let run = Id::new();

        let done = ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        ts.store.claim_one().await.unwrap();
        ts.store.mark_done(done.id).await.unwrap();

        let queued = ts.store.enqueue(&run, Phase::Implement).await.unwrap();
        let affected = ts.store.cancel_run(&run).await.unwrap();
        assert_eq!(affected, 1);

        let jobs = ts.store.list_jobs(&run).await.unwrap();
        assert_eq!(jobs[0].id, done.id);
        assert_eq!(jobs[0].status, JobStatus::Done);
        assert_eq!(jobs[1].id, queued.id);
        assert_eq!(jobs[1].status, JobStatus::Cancelled);

        // A cancelled job is never claimable again.
        assert!(ts.store.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_acquire_then_deny() {
        let ts = create_test_store().await;
        let run = Id::new();
        let a = Id::new();
        let b = Id::new();

        assert!(ts.store.acquire_lease(&run, &a).await.unwrap());
        assert!(!ts.store.acquire_lease(&run, &b).await.unwrap());
        // Re-acquire by the same owner is still a deny; the lease is held.
        assert!(!ts.store.acquire_lease(&run, &a).await.unwrap());
    }

    #[tokio::test]
    async fn lease_release_requires_owner() {
        let ts = create_test_store().await;
        let run = Id::new();
        let a = Id::new();
        let b = Id::new();

        assert!(ts.store.acquire_lease(&run, &a).await.unwrap());
        ts.store.release_lease(&run, &b).await.unwrap();
        assert!(!ts.store.acquire_lease(&run, &b).await.unwrap());

        ts.store.release_lease(&run, &a).await.unwrap();
        assert!(ts.store.acquire_lease(&run, &b).await.unwrap());
    }

    #[tokio::test]
    async fn stale_lease_is_stolen() {
        let ts = create_test_store().await;
        let run = Id::new();
        let a = Id::new();
        let b = Id::new();

        assert!(ts.store.acquire_lease(&run, &a).await.unwrap());
        backdate_lease(&ts.store, &run, &stale_ts()).await;

        assert!(ts.store.acquire_lease(&run, &b).await.unwrap());
        // b now holds a fresh lease; a cannot take it back.
        assert!(!ts.store.acquire_lease(&run, &a).await.unwrap());
    }

    #[tokio::test]
    async fn touch_lease_requires_owner_and_defers_steal() {
        let ts = create_test_store().await;
        let run = Id::new();
        let a = Id::new();
        let b = Id::new();

        assert!(ts.store.acquire_lease(&run, &a).await.unwrap());
        backdate_lease(&ts.store, &run, &stale_ts()).await;

        // A non-owner heartbeat is a no-op; the lease stays stale.
        ts.store.touch_lease(&run, &b).await.unwrap();
        // The owner's heartbeat refreshes it, so b cannot steal.
        ts.store.touch_lease(&run, &a).await.unwrap();
        assert!(!ts.store.acquire_lease(&run, &b).await.unwrap());
    }

    #[tokio::test]
    async fn force_release_drops_any_owner() {
        let ts = create_test_store().await;
        let run = Id::new();
        let a = Id::new();
        let b = Id::new();

        assert!(ts.store.acquire_lease(&run, &a).await.unwrap());
        ts.store.force_release_lease(&run).await.unwrap();
        assert!(ts.store.acquire_lease(&run, &b).await.unwrap());
    }

    #[tokio::test]
    async fn stats_counts_jobs_and_leases() {
        let ts = create_test_store().await;
        let run = Id::new();

        ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
        ts.store.claim_one().await.unwrap();
        ts.store
            .acquire_lease(&run, &Id::new())
            .await
            .unwrap();

        let stats = ts.store.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.lease_count, 1);
    }

    #[tokio::test]
    async fn recover_stale_on_clean_state_is_noop() {
        let ts = create_test_store().await;
        ts.store.enqueue(&Id::new(), Phase::Plan).await.unwrap();
        ts.store.claim_one().await.unwrap();

        let report = ts.store.recover_stale().await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn recover_stale_requeues_job_and_releases_lease() {
        let ts = create_test_store().await;
        let run = Id::new();
        let owner = Id::new();

        ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        let claimed = ts.store.claim_one().await.unwrap().unwrap();
        assert!(ts.store.acquire_lease(&run, &owner).await.unwrap());

        // Worker dies: both clocks go stale.
        backdate_job(&ts.store, claimed.id, &stale_ts()).await;
        backdate_lease(&ts.store, &run, &stale_ts()).await;

        let report = ts.store.recover_stale().await.unwrap();
        assert_eq!(report.requeued_jobs, 1);
        assert_eq!(report.released_leases, 1);

        // Idempotent: the second sweep finds nothing.
        let again = ts.store.recover_stale().await.unwrap();
        assert_eq!(again, RecoveryReport::default());

        // The job comes back with its attempt history intact.
        let recovered = ts.store.claim_one().await.unwrap().unwrap();
        assert_eq!(recovered.id, claimed.id);
        assert_eq!(recovered.attempt, 2);
        assert_eq!(recovered.last_error.as_deref(), Some(RECOVERED_ERROR));

        // And the lease is free for the recovering worker.
        assert!(ts.store.acquire_lease(&run, &Id::new()).await.unwrap());
    }

    #[tokio::test]
    async fn recover_preserves_existing_last_error() {
        let ts = create_test_store().await;
        let run = Id::new();

        let job = ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        ts.store.claim_one().await.unwrap();
        ts.store.mark_failed(job.id, "first failure").await.unwrap();

        // Re-claim after a manual requeue, then go stale.
        ts.store.requeue(job.id).await.unwrap();
        ts.store.claim_one().await.unwrap();
        backdate_job(&ts.store, job.id, &stale_ts()).await;

        ts.store.recover_stale().await.unwrap();
        let recovered = ts.store.get_job(job.id).await.unwrap();
        assert_eq!(recovered.last_error.as_deref(), Some("first failure"));
    }

    #[tokio::test]
    async fn recover_releases_lease_of_recovered_run_even_if_lease_is_fresh() {
        let ts = create_test_store().await;
        let run = Id::new();

        let job = ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        ts.store.claim_one().await.unwrap();
        assert!(ts.store.acquire_lease(&run, &Id::new()).await.unwrap());

        // Job stale, lease freshly touched: the lease still goes, so the
        // requeued job is immediately workable.
        backdate_job(&ts.store, job.id, &stale_ts()).await;

        let report = ts.store.recover_stale().await.unwrap();
        assert_eq!(report.requeued_jobs, 1);
        assert_eq!(report.released_leases, 1);
    }

    #[tokio::test]
    async fn recover_releases_stale_lease_without_stale_job() {
        let ts = create_test_store().await;
        let run = Id::new();

        assert!(ts.store.acquire_lease(&run, &Id::new()).await.unwrap());
        backdate_lease(&ts.store, &run, &stale_ts()).await;

        let report = ts.store.recover_stale().await.unwrap();
        assert_eq!(report.requeued_jobs, 0);
        assert_eq!(report.released_leases, 1);
    }

    #[tokio::test]
    async fn unparseable_timestamps_are_treated_stale() {
        let ts = create_test_store().await;
        let run = Id::new();

        let job = ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        ts.store.claim_one().await.unwrap();
        backdate_job(&ts.store, job.id, "not-a-timestamp").await;

        let report = ts.store.recover_stale().await.unwrap();
        assert_eq!(report.requeued_jobs, 1);

        let recovered = ts.store.get_job(job.id).await.unwrap();
        assert_eq!(recovered.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn list_jobs_returns_insertion_order() {
        let ts = create_test_store().await;
        let run = Id::new();
        ts.store.enqueue(&run, Phase::Plan).await.unwrap();
        ts.store.enqueue(&run, Phase::Implement).await.unwrap();

        let jobs = ts.store.list_jobs(&run).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].phase, Phase::Plan);
        assert_eq!(jobs[1].phase, Phase::Implement);
    }
}
