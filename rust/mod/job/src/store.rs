use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use vidforge_core::{now_rfc3339, seconds_between, ListResult, ServiceError};

use crate::model::{Job, JobListQuery, JobStatus, StatusCounts};

/// SQL schema for the jobs table.
///
/// The full record lives in the `data` JSON column; the remaining
/// columns mirror fields we filter or guard on.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id                TEXT PRIMARY KEY,
    data              TEXT NOT NULL,
    task_type         TEXT NOT NULL,
    status            TEXT NOT NULL,
    progress          INTEGER NOT NULL DEFAULT 0,
    cancel_requested  INTEGER NOT NULL DEFAULT 0,
    created_by        TEXT,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_job_task_type ON jobs(task_type);
CREATE INDEX IF NOT EXISTS idx_job_created_at ON jobs(created_at);
";

/// Durable job storage backed by SQLite.
///
/// All access is serialized through a single connection guarded by a
/// mutex, so each read-check-write method is atomic with respect to
/// every other caller in this process. That property is what makes the
/// guarded transitions below safe against duplicate queue deliveries.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self, ServiceError> {
        let conn = Connection::open(path)
            .map_err(|e| ServiceError::Storage(format!("open {}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| ServiceError::Storage(format!("set WAL: {e}")))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ServiceError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServiceError::Storage(format!("open in-memory: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ServiceError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("job schema init: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ServiceError> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Internal("job store lock poisoned".into()))
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Insert a new job.
    pub fn create(&self, job: &Job) -> Result<(), ServiceError> {
        let data = serde_json::to_string(job).map_err(|e| ServiceError::Internal(e.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, data, task_type, status, progress, cancel_requested, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id,
                data,
                job.kind().as_str(),
                job.status.as_str(),
                job.progress as i64,
                job.cancel_requested as i64,
                job.created_by,
                job.created_at,
            ],
        )
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a job by ID.
    pub fn get(&self, id: &str) -> Result<Job, ServiceError> {
        let conn = self.lock()?;
        get_locked(&conn, id)
    }

    /// List jobs with optional filters, newest first.
    pub fn list(&self, query: &JobListQuery) -> Result<ListResult<Job>, ServiceError> {
        let conn = self.lock()?;

        use rusqlite::types::Value as SqlValue;

        let mut where_clauses: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(ref t) = query.task_type {
            where_clauses.push(format!("task_type = ?{}", args.len() + 1));
            args.push(SqlValue::Text(t.clone()));
        }
        if let Some(ref s) = query.status {
            where_clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(SqlValue::Text(s.clone()));
        }
        if let Some(ref cb) = query.created_by {
            where_clauses.push(format!("created_by = ?{}", args.len() + 1));
            args.push(SqlValue::Text(cb.clone()));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {where_sql}");
        let total: i64 = conn
            .query_row(&count_sql, rusqlite::params_from_iter(args.iter()), |r| r.get(0))
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let select_sql = format!(
            "SELECT data FROM jobs {where_sql} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            args.len() + 1,
            args.len() + 2
        );
        let mut stmt = conn
            .prepare(&select_sql)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let mut select_args = args;
        select_args.push(SqlValue::Integer(query.limit as i64));
        select_args.push(SqlValue::Integer(query.offset as i64));

        let items = stmt
            .query_map(rusqlite::params_from_iter(select_args.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .iter()
            .map(|json| decode_job(json))
            .collect::<Result<Vec<Job>, _>>()?;

        Ok(ListResult { items, total: total as usize })
    }

    // -----------------------------------------------------------------------
    // Guarded transitions
    // -----------------------------------------------------------------------

    /// Claim a job for execution: `pending` or `retry` -> `running`.
    ///
    /// This is the compare-and-swap that makes duplicate queue deliveries
    /// harmless. Returns Conflict if the job is in any other state.
    pub fn begin_running(&self, id: &str) -> Result<Job, ServiceError> {
        self.transition(id, &[JobStatus::Pending, JobStatus::Retry], |job| {
            job.status = JobStatus::Running;
            job.progress = 0;
            job.current_step = None;
            job.started_at = Some(now_rfc3339());
        })
    }

    /// Record a progress milestone for a running job.
    ///
    /// Returns `Ok(false)` without writing when the update is stale: the
    /// job is no longer running, or the reported percentage is below what
    /// is already recorded. Progress never moves backwards within an
    /// attempt.
    pub fn set_progress(&self, id: &str, pct: u8, step: &str) -> Result<bool, ServiceError> {
        let conn = self.lock()?;
        let mut job = get_locked(&conn, id)?;
        if job.status != JobStatus::Running || pct < job.progress {
            return Ok(false);
        }
        job.progress = pct.min(100);
        job.current_step = Some(step.to_string());
        job.updated_at = now_rfc3339();
        write_locked(&conn, &job)?;
        Ok(true)
    }

    /// `running` -> `success`, recording the result.
    pub fn complete(
        &self,
        id: &str,
        result_location: &str,
        result_metadata: Option<Value>,
    ) -> Result<Job, ServiceError> {
        self.transition(id, &[JobStatus::Running], |job| {
            job.status = JobStatus::Success;
            job.progress = 100;
            job.current_step = None;
            job.result_location = Some(result_location.to_string());
            job.result_metadata = result_metadata.clone();
            finish(job);
        })
    }

    /// `running` -> `failed`, recording the error.
    pub fn fail(&self, id: &str, message: &str, error_type: &str) -> Result<Job, ServiceError> {
        self.transition(id, &[JobStatus::Running], |job| {
            job.status = JobStatus::Failed;
            job.current_step = None;
            job.error_message = Some(message.to_string());
            job.error_type = Some(error_type.to_string());
            finish(job);
        })
    }

    /// `running` -> `retry`: the attempt failed but another will follow.
    ///
    /// Increments the retry counter and resets progress so the next
    /// attempt reports from zero. The last error is kept visible while
    /// the job waits for its backoff delay.
    pub fn mark_retry(&self, id: &str, message: &str, error_type: &str) -> Result<Job, ServiceError> {
        self.transition(id, &[JobStatus::Running], |job| {
            job.status = JobStatus::Retry;
            job.progress = 0;
            job.current_step = None;
            job.error_message = Some(message.to_string());
            job.error_type = Some(error_type.to_string());
            job.retry_count += 1;
        })
    }

    /// Move a non-terminal job to `cancelled`.
    pub fn mark_cancelled(&self, id: &str) -> Result<Job, ServiceError> {
        self.transition(
            id,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Retry],
            |job| {
                job.status = JobStatus::Cancelled;
                job.current_step = None;
                finish(job);
            },
        )
    }

    /// Flag a job for cooperative cancellation.
    ///
    /// Terminal jobs cannot be cancelled; the request is idempotent for
    /// everything else.
    pub fn request_cancel(&self, id: &str) -> Result<Job, ServiceError> {
        let conn = self.lock()?;
        let mut job = get_locked(&conn, id)?;
        if job.status.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "job {id} is already {}",
                job.status.as_str()
            )));
        }
        if !job.cancel_requested {
            job.cancel_requested = true;
            job.updated_at = now_rfc3339();
            write_locked(&conn, &job)?;
        }
        Ok(job)
    }

    /// Whether cancellation has been requested for a job.
    pub fn cancel_requested(&self, id: &str) -> Result<bool, ServiceError> {
        let conn = self.lock()?;
        let flag: Option<i64> = conn
            .query_row("SELECT cancel_requested FROM jobs WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        flag.map(|v| v != 0)
            .ok_or_else(|| ServiceError::NotFound(format!("job {id}")))
    }

    // -----------------------------------------------------------------------
    // Engine helpers
    // -----------------------------------------------------------------------

    /// Reset jobs left `running` by a previous process back to `pending`.
    ///
    /// Called once at startup, before workers start. Returns the IDs of
    /// the jobs that were reset so they can be re-enqueued.
    pub fn reset_abandoned(&self) -> Result<Vec<String>, ServiceError> {
        let conn = self.lock()?;
        let ids = ids_with_status(&conn, JobStatus::Running)?;
        for id in &ids {
            let mut job = get_locked(&conn, id)?;
            job.status = JobStatus::Pending;
            job.progress = 0;
            job.current_step = None;
            job.started_at = None;
            job.updated_at = now_rfc3339();
            write_locked(&conn, &job)?;
        }
        Ok(ids)
    }

    /// Fetch all jobs in any of the given states, oldest first.
    pub fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, ServiceError> {
        let conn = self.lock()?;
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT data FROM jobs WHERE status IN ({placeholders}) ORDER BY created_at ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| ServiceError::Storage(e.to_string()))?;
        let args: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        rows.iter().map(|json| decode_job(json)).collect()
    }

    /// Per-status counts for the stats endpoint.
    pub fn count_by_status(&self) -> Result<StatusCounts, ServiceError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let n = n as u64;
            counts.total += n;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = n,
                Some(JobStatus::Running) => counts.running = n,
                Some(JobStatus::Success) => counts.success = n,
                Some(JobStatus::Failed) => counts.failed = n,
                Some(JobStatus::Cancelled) => counts.cancelled = n,
                Some(JobStatus::Retry) => counts.retry = n,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Liveness check for the health endpoint.
    pub fn ping(&self) -> Result<(), ServiceError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }

    /// Guarded read-modify-write: apply `mutate` only when the job is in
    /// one of the expected states, otherwise return Conflict. Atomic
    /// because the connection mutex is held across read and write.
    fn transition(
        &self,
        id: &str,
        expected: &[JobStatus],
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job, ServiceError> {
        let conn = self.lock()?;
        let mut job = get_locked(&conn, id)?;
        if !expected.contains(&job.status) {
            return Err(ServiceError::Conflict(format!(
                "job {id} is {}, expected one of [{}]",
                job.status.as_str(),
                expected.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }
        mutate(&mut job);
        job.updated_at = now_rfc3339();
        write_locked(&conn, &job)?;
        Ok(job)
    }
}

/// Stamp completion time and derived duration on a job entering a
/// terminal state.
fn finish(job: &mut Job) {
    let now = now_rfc3339();
    job.completed_at = Some(now.clone());
    if let Some(started) = &job.started_at {
        job.duration_seconds = seconds_between(started, &now);
    }
}

fn get_locked(conn: &Connection, id: &str) -> Result<Job, ServiceError> {
    let json: Option<String> = conn
        .query_row("SELECT data FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
        .optional()
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
    match json {
        Some(json) => decode_job(&json),
        None => Err(ServiceError::NotFound(format!("job {id}"))),
    }
}

fn write_locked(conn: &Connection, job: &Job) -> Result<(), ServiceError> {
    let data = serde_json::to_string(job).map_err(|e| ServiceError::Internal(e.to_string()))?;
    let affected = conn
        .execute(
            "UPDATE jobs SET data = ?1, status = ?2, progress = ?3, cancel_requested = ?4 \
             WHERE id = ?5",
            params![
                data,
                job.status.as_str(),
                job.progress as i64,
                job.cancel_requested as i64,
                job.id,
            ],
        )
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
    if affected == 0 {
        return Err(ServiceError::NotFound(format!("job {}", job.id)));
    }
    Ok(())
}

fn ids_with_status(conn: &Connection, status: JobStatus) -> Result<Vec<String>, ServiceError> {
    let mut stmt = conn
        .prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at ASC")
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
    let ids = stmt
        .query_map(params![status.as_str()], |row| row.get(0))
        .map_err(|e| ServiceError::Storage(e.to_string()))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| ServiceError::Storage(e.to_string()))?;
    Ok(ids)
}

fn decode_job(json: &str) -> Result<Job, ServiceError> {
    serde_json::from_str(json).map_err(|e| ServiceError::Storage(format!("bad job json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobParams;

    fn test_store() -> JobStore {
        JobStore::open_in_memory().unwrap()
    }

    fn make_job(created_by: Option<&str>) -> Job {
        Job::new(
            JobParams::GenerateFromImage {
                image_path: "/in/cat.png".into(),
                prompt: "a cat surfing".into(),
                duration_secs: 8,
            },
            created_by.map(String::from),
        )
    }

    #[test]
    fn create_and_get() {
        let store = test_store();
        let job = make_job(Some("alice"));
        store.create(&job).unwrap();

        let got = store.get(&job.id).unwrap();
        assert_eq!(got.id, job.id);
        assert_eq!(got.status, JobStatus::Pending);
        assert_eq!(got.created_by.as_deref(), Some("alice"));
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(store.get("nope"), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn begin_running_claims_once() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();

        let claimed = store.begin_running(&job.id).unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        // A second claim (duplicate delivery) must conflict.
        assert!(matches!(
            store.begin_running(&job.id),
            Err(ServiceError::Conflict(_))
        ));
    }

    #[test]
    fn progress_is_monotonic() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();
        store.begin_running(&job.id).unwrap();

        assert!(store.set_progress(&job.id, 30, "starting provider job").unwrap());
        assert!(!store.set_progress(&job.id, 10, "stale").unwrap());

        let got = store.get(&job.id).unwrap();
        assert_eq!(got.progress, 30);
        assert_eq!(got.current_step.as_deref(), Some("starting provider job"));
    }

    #[test]
    fn progress_ignored_when_not_running() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();
        assert!(!store.set_progress(&job.id, 10, "too early").unwrap());
    }

    #[test]
    fn complete_records_result_and_duration() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();
        store.begin_running(&job.id).unwrap();

        let done = store
            .complete(&job.id, "/out/video.mp4", Some(serde_json::json!({"frames": 192})))
            .unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result_location.as_deref(), Some("/out/video.mp4"));
        assert!(done.completed_at.is_some());
        assert!(done.duration_seconds.is_some());

        // Completing twice must conflict.
        assert!(store.complete(&job.id, "/out/other.mp4", None).is_err());
    }

    #[test]
    fn fail_records_error() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();
        store.begin_running(&job.id).unwrap();

        let failed = store.fail(&job.id, "content policy violation", "provider_fatal_error").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("content policy violation"));
        assert_eq!(failed.error_type.as_deref(), Some("provider_fatal_error"));
    }

    #[test]
    fn retry_increments_and_resets_progress() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();
        store.begin_running(&job.id).unwrap();
        store.set_progress(&job.id, 40, "waiting on provider").unwrap();

        let retried = store.mark_retry(&job.id, "connection reset", "provider_transient_error").unwrap();
        assert_eq!(retried.status, JobStatus::Retry);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.progress, 0);

        // The next attempt claims the job again from retry.
        let again = store.begin_running(&job.id).unwrap();
        assert_eq!(again.status, JobStatus::Running);
        assert_eq!(again.retry_count, 1);
    }

    #[test]
    fn cancel_request_and_mark() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();

        let flagged = store.request_cancel(&job.id).unwrap();
        assert!(flagged.cancel_requested);
        assert!(store.cancel_requested(&job.id).unwrap());

        // Idempotent.
        store.request_cancel(&job.id).unwrap();

        let cancelled = store.mark_cancelled(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // Terminal jobs reject further cancel requests.
        assert!(matches!(
            store.request_cancel(&job.id),
            Err(ServiceError::Conflict(_))
        ));
    }

    #[test]
    fn reset_abandoned_running_jobs() {
        let store = test_store();
        let job = make_job(None);
        store.create(&job).unwrap();
        store.begin_running(&job.id).unwrap();

        let reset = store.reset_abandoned().unwrap();
        assert_eq!(reset, vec![job.id.clone()]);

        let got = store.get(&job.id).unwrap();
        assert_eq!(got.status, JobStatus::Pending);
        assert_eq!(got.progress, 0);
        assert!(got.started_at.is_none());
    }

    #[test]
    fn jobs_with_status_returns_matching_jobs() {
        let store = test_store();
        let a = make_job(None);
        let b = make_job(None);
        let c = make_job(None);
        store.create(&a).unwrap();
        store.create(&b).unwrap();
        store.create(&c).unwrap();
        store.begin_running(&b.id).unwrap();
        store.begin_running(&c.id).unwrap();
        store.fail(&c.id, "boom", "provider_fatal_error").unwrap();

        let waiting = store
            .jobs_with_status(&[JobStatus::Pending, JobStatus::Running])
            .unwrap();
        let ids: Vec<&str> = waiting.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(waiting.len(), 2);
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&b.id.as_str()));
    }

    #[test]
    fn list_with_filters() {
        let store = test_store();
        let a = make_job(Some("alice"));
        let b = make_job(Some("bob"));
        store.create(&a).unwrap();
        store.create(&b).unwrap();
        store.begin_running(&b.id).unwrap();

        let all = store.list(&JobListQuery::default()).unwrap();
        assert_eq!(all.total, 2);

        let running = store
            .list(&JobListQuery { status: Some("running".into()), ..Default::default() })
            .unwrap();
        assert_eq!(running.total, 1);
        assert_eq!(running.items[0].id, b.id);

        let alices = store
            .list(&JobListQuery { created_by: Some("alice".into()), ..Default::default() })
            .unwrap();
        assert_eq!(alices.total, 1);
    }

    #[test]
    fn status_counts() {
        let store = test_store();
        let a = make_job(None);
        let b = make_job(None);
        store.create(&a).unwrap();
        store.create(&b).unwrap();
        store.begin_running(&b.id).unwrap();

        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
    }
}
