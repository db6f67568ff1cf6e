use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use vidforge_core::{ListResult, ServiceError};

use crate::handlers::HandlerRegistry;
use crate::model::{CreateJobRequest, Job, JobKind, JobListQuery, JobStatus, StatusCounts};
use crate::queue::{QueueDepth, TaskQueue};
use crate::retry::RetryPolicy;
use crate::store::JobStore;

/// Execution limits and retry budget for one job kind.
#[derive(Debug, Clone, Copy)]
pub struct TaskTypeConfig {
    /// Delay between provider polls.
    pub poll_interval: Duration,
    /// Cooperative limit, enforced at handler checkpoints.
    pub soft_time_limit: Duration,
    /// Hard limit; the attempt future is aborted when it passes.
    pub hard_time_limit: Duration,
    pub retry: RetryPolicy,
}

/// Per-kind configuration table.
#[derive(Debug, Clone, Copy)]
pub struct TaskTypeConfigs {
    pub generate_from_image: TaskTypeConfig,
    pub extract_frames: TaskTypeConfig,
    pub edit_video: TaskTypeConfig,
}

impl TaskTypeConfigs {
    pub fn for_kind(&self, kind: JobKind) -> TaskTypeConfig {
        match kind {
            JobKind::GenerateFromImage => self.generate_from_image,
            JobKind::ExtractFrames => self.extract_frames,
            JobKind::EditVideo => self.edit_video,
        }
    }
}

impl Default for TaskTypeConfigs {
    fn default() -> Self {
        let retry = RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_secs(30),
            backoff_ceiling: Duration::from_secs(300),
        };
        TaskTypeConfigs {
            // Provider generations are expensive and not idempotent on
            // the provider side, so they get no automatic retries.
            generate_from_image: TaskTypeConfig {
                poll_interval: Duration::from_secs(15),
                soft_time_limit: Duration::from_secs(900),
                hard_time_limit: Duration::from_secs(1200),
                retry: RetryPolicy { max_retries: 0, ..retry },
            },
            extract_frames: TaskTypeConfig {
                poll_interval: Duration::from_secs(1),
                soft_time_limit: Duration::from_secs(120),
                hard_time_limit: Duration::from_secs(180),
                retry,
            },
            edit_video: TaskTypeConfig {
                poll_interval: Duration::from_secs(15),
                soft_time_limit: Duration::from_secs(60),
                hard_time_limit: Duration::from_secs(120),
                retry,
            },
        }
    }
}

/// Response body for a job submission.
#[derive(Debug, Serialize)]
pub struct SubmitReceipt {
    pub job: Job,
    pub task_id: String,
}

/// Health snapshot: storage liveness plus queue depth.
#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub queue: QueueDepth,
}

/// Orchestrates the job lifecycle: accepts submissions, hands work to
/// the queue, and answers reads. Workers drive execution; the engine
/// owns the shared pieces they need.
pub struct JobEngine {
    pub(crate) store: Arc<JobStore>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) config: TaskTypeConfigs,
    /// Pinged after every observable job update; long-polls wait on it.
    pub(crate) notify: Arc<Notify>,
}

impl JobEngine {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<TaskQueue>,
        registry: HandlerRegistry,
        config: TaskTypeConfigs,
    ) -> Self {
        JobEngine { store, queue, registry, config, notify: Arc::new(Notify::new()) }
    }

    /// Validate and persist a new job, then queue it for execution.
    pub fn submit(&self, req: CreateJobRequest) -> Result<SubmitReceipt, ServiceError> {
        req.params.validate()?;
        let job = Job::new(req.params, req.created_by);
        self.store.create(&job)?;
        let task_id = self.queue.enqueue(&job.id, None);
        info!(job_id = %job.id, task_type = %job.kind().as_str(), "job submitted");
        self.notify.notify_waiters();
        Ok(SubmitReceipt { job, task_id })
    }

    pub fn get(&self, id: &str) -> Result<Job, ServiceError> {
        self.store.get(id)
    }

    pub fn list(&self, query: &JobListQuery) -> Result<ListResult<Job>, ServiceError> {
        self.store.list(query)
    }

    pub fn stats(&self) -> Result<StatusCounts, ServiceError> {
        self.store.count_by_status()
    }

    /// Request cancellation of a job.
    ///
    /// Jobs not currently executing are finalized immediately; a running
    /// job keeps its flag and stops at its next checkpoint.
    pub fn cancel(&self, id: &str) -> Result<Job, ServiceError> {
        let job = self.store.request_cancel(id)?;
        let job = if matches!(job.status, JobStatus::Pending | JobStatus::Retry) {
            // May lose the race with a worker claiming the job; the
            // worker then observes the flag itself.
            match self.store.mark_cancelled(id) {
                Ok(job) => job,
                Err(ServiceError::Conflict(_)) => self.store.get(id)?,
                Err(e) => return Err(e),
            }
        } else {
            job
        };
        info!(job_id = %id, status = %job.status.as_str(), "cancellation requested");
        self.notify.notify_waiters();
        Ok(job)
    }

    /// Long-poll: wait until the job changes or the timeout passes, then
    /// return its current state. Terminal jobs return immediately.
    pub async fn poll(&self, id: &str, timeout: Duration) -> Result<Job, ServiceError> {
        let deadline = Instant::now() + timeout;
        let first = self.store.get(id)?;
        if first.status.is_terminal() {
            return Ok(first);
        }
        loop {
            let notified = self.notify.notified();
            let job = self.store.get(id)?;
            if job.status.is_terminal() || job.updated_at != first.updated_at {
                return Ok(job);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(job);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub fn health(&self) -> Result<HealthSnapshot, ServiceError> {
        self.store.ping()?;
        Ok(HealthSnapshot { queue: self.queue.depth() })
    }

    /// Rebuild queue state from the store after a restart: jobs left
    /// `running` by a dead process go back to `pending`, then every
    /// `pending` and `retry` job is re-enqueued. Call before starting
    /// workers.
    pub fn recover(&self) -> Result<usize, ServiceError> {
        let reset = self.store.reset_abandoned()?;
        if !reset.is_empty() {
            warn!(count = reset.len(), "reset jobs abandoned mid-run");
        }

        let waiting = self.store.jobs_with_status(&[JobStatus::Pending, JobStatus::Retry])?;
        for job in &waiting {
            self.queue.enqueue(&job.id, None);
        }
        if !waiting.is_empty() {
            info!(count = waiting.len(), "re-enqueued persisted jobs");
            self.notify.notify_waiters();
        }
        Ok(waiting.len())
    }
}
