use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vidforge_core::ServiceError;

use crate::engine::JobEngine;
use crate::error::JobError;
use crate::handlers::JobContext;
use crate::queue::Lease;
use crate::retry::{classify, Disposition};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Concurrent execution slots.
    pub slots: usize,
    /// Tasks a slot processes before its loop is torn down and
    /// respawned fresh.
    pub recycle_after: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig { slots: 4, recycle_after: 10 }
    }
}

/// Spawn the worker pool. Dropping the returned token does nothing;
/// cancel it to drain the pool.
pub fn start(engine: Arc<JobEngine>, config: WorkerConfig) -> CancellationToken {
    let cancel = CancellationToken::new();
    for slot in 0..config.slots {
        let engine = engine.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            info!(slot, "worker slot started");
            loop {
                run_slot(&engine, &token, config.recycle_after).await;
                if token.is_cancelled() {
                    break;
                }
                debug!(slot, "worker slot recycled");
            }
            info!(slot, "worker slot stopped");
        });
    }
    cancel
}

/// One slot incarnation: process up to `recycle_after` tasks, then
/// return so the caller can start over with fresh loop state.
async fn run_slot(engine: &Arc<JobEngine>, token: &CancellationToken, recycle_after: u32) {
    for _ in 0..recycle_after.max(1) {
        let lease = tokio::select! {
            _ = token.cancelled() => return,
            lease = engine.queue.dequeue() => lease,
        };
        process_one(engine, lease).await;
    }
}

async fn process_one(engine: &Arc<JobEngine>, lease: Lease) {
    let job_id = lease.msg.job_id.clone();

    let job = match engine.store.get(&job_id) {
        Ok(job) => job,
        Err(ServiceError::NotFound(_)) => {
            warn!(job_id = %job_id, "queued job no longer exists");
            engine.queue.ack(&lease);
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "failed to load queued job");
            engine.queue.nack(&lease, Duration::from_secs(5));
            return;
        }
    };

    if job.status.is_terminal() {
        engine.queue.ack(&lease);
        return;
    }

    if job.cancel_requested {
        finalize(engine, &job_id, |e| e.store.mark_cancelled(&job_id).map(|_| ()));
        engine.queue.ack(&lease);
        return;
    }

    // Claim the job. Losing here means a duplicate delivery or a racing
    // cancel already settled it; either way this delivery is done.
    let job = match engine.store.begin_running(&job_id) {
        Ok(job) => job,
        Err(ServiceError::Conflict(msg)) => {
            debug!(job_id = %job_id, %msg, "skipping duplicate delivery");
            engine.queue.ack(&lease);
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "failed to claim job");
            engine.queue.nack(&lease, Duration::from_secs(5));
            return;
        }
    };
    engine.notify.notify_waiters();

    let kind = job.kind();
    let cfg = engine.config.for_kind(kind);
    let ctx = JobContext::new(
        &job_id,
        engine.store.clone(),
        engine.notify.clone(),
        cfg.soft_time_limit,
        cfg.poll_interval,
    );
    let handler = engine.registry.get(kind);

    info!(
        job_id = %job_id,
        task_type = %kind.as_str(),
        attempt = lease.msg.attempt,
        retry_count = job.retry_count,
        "job attempt started"
    );

    let result = tokio::time::timeout(cfg.hard_time_limit, handler.run(&ctx, &job.params)).await;

    match result {
        Err(_) => {
            warn!(job_id = %job_id, "hard time limit exceeded, aborting attempt");
            finalize(engine, &job_id, |e| {
                e.store.fail(&job_id, "hard time limit exceeded", "timeout_error").map(|_| ())
            });
            engine.queue.ack(&lease);
        }
        Ok(Ok(outcome)) => {
            info!(job_id = %job_id, result = %outcome.result_location, "job succeeded");
            finalize(engine, &job_id, |e| {
                e.store
                    .complete(&job_id, &outcome.result_location, outcome.result_metadata.clone())
                    .map(|_| ())
            });
            engine.queue.ack(&lease);
        }
        Ok(Err(JobError::Cancelled)) => {
            info!(job_id = %job_id, "job cancelled mid-run");
            finalize(engine, &job_id, |e| e.store.mark_cancelled(&job_id).map(|_| ()));
            engine.queue.ack(&lease);
        }
        Ok(Err(JobError::Conflict(msg))) => {
            // Someone else took over the job row; stop touching it.
            debug!(job_id = %job_id, %msg, "abandoning superseded attempt");
            engine.queue.ack(&lease);
        }
        Ok(Err(err)) => {
            let retryable = classify(&err) == Disposition::Retryable
                && cfg.retry.budget_remaining(job.retry_count);
            if retryable {
                match engine.store.mark_retry(&job_id, &err.to_string(), err.error_type()) {
                    Ok(retried) => {
                        let delay = cfg.retry.next_delay(retried.retry_count);
                        warn!(
                            job_id = %job_id,
                            error = %err,
                            retry = retried.retry_count,
                            delay_secs = delay.as_secs(),
                            "attempt failed, scheduling retry"
                        );
                        engine.notify.notify_waiters();
                        if !engine.queue.nack(&lease, delay) {
                            // The lease expired mid-attempt and its
                            // redelivery may already be acked away; queue
                            // a fresh message so the retry is not stranded.
                            engine.queue.enqueue(&job_id, Some(delay));
                        }
                    }
                    Err(e) => {
                        debug!(job_id = %job_id, error = %e, "retry transition lost its race");
                        engine.queue.ack(&lease);
                    }
                }
            } else {
                warn!(job_id = %job_id, error = %err, error_type = err.error_type(), "job failed");
                finalize(engine, &job_id, |e| {
                    e.store.fail(&job_id, &err.to_string(), err.error_type()).map(|_| ())
                });
                engine.queue.ack(&lease);
            }
        }
    }
}

/// Apply a terminal transition, tolerating a lost race, and wake pollers.
fn finalize(
    engine: &Arc<JobEngine>,
    job_id: &str,
    op: impl FnOnce(&Arc<JobEngine>) -> Result<(), ServiceError>,
) {
    match op(engine) {
        Ok(()) => {}
        Err(ServiceError::Conflict(msg)) => {
            debug!(job_id = %job_id, %msg, "terminal transition lost its race");
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "terminal transition failed");
        }
    }
    engine.notify.notify_waiters();
}
