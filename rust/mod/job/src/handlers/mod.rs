mod edit;
mod extract;
mod generate;

pub use edit::EditVideoHandler;
pub use extract::{ExtractFramesHandler, ExtractedFrames, FfmpegFrameExtractor, FrameExtractor, FrameInfo};
pub use generate::GenerateFromImageHandler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::JobError;
use crate::model::{JobKind, JobParams};
use crate::store::JobStore;

/// What a successful handler run produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub result_location: String,
    pub result_metadata: Option<Value>,
}

/// Per-attempt execution context handed to a handler.
///
/// Handlers are expected to call `checkpoint` or `progress` between
/// phases of work; those calls are where cancellation and the soft time
/// limit take effect.
pub struct JobContext {
    pub job_id: String,
    store: Arc<JobStore>,
    notify: Arc<Notify>,
    soft_deadline: Instant,
    poll_interval: Duration,
}

impl JobContext {
    pub fn new(
        job_id: &str,
        store: Arc<JobStore>,
        notify: Arc<Notify>,
        soft_limit: Duration,
        poll_interval: Duration,
    ) -> Self {
        JobContext {
            job_id: job_id.to_string(),
            store,
            notify,
            soft_deadline: Instant::now() + soft_limit,
            poll_interval,
        }
    }

    /// How long to wait between provider polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Suspension point: bail out if the soft time limit has passed or
    /// cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if Instant::now() >= self.soft_deadline {
            return Err(JobError::Timeout("soft time limit exceeded".into()));
        }
        if self.store.cancel_requested(&self.job_id)? {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Record a progress milestone, checkpointing first.
    ///
    /// Stale updates (attempt superseded, or percentage behind the
    /// stored value) are discarded without error.
    pub fn progress(&self, pct: u8, step: &str) -> Result<(), JobError> {
        self.checkpoint()?;
        let applied = self.store.set_progress(&self.job_id, pct, step)?;
        if applied {
            self.notify.notify_waiters();
        } else {
            debug!(job_id = %self.job_id, pct, step, "discarded stale progress update");
        }
        Ok(())
    }
}

/// Executes one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext, params: &JobParams) -> Result<JobOutcome, JobError>;
}

/// Handler lookup by job kind. One handler per kind, fixed at startup.
pub struct HandlerRegistry {
    pub generate_from_image: Arc<dyn JobHandler>,
    pub extract_frames: Arc<dyn JobHandler>,
    pub edit_video: Arc<dyn JobHandler>,
}

impl HandlerRegistry {
    pub fn get(&self, kind: JobKind) -> Arc<dyn JobHandler> {
        match kind {
            JobKind::GenerateFromImage => self.generate_from_image.clone(),
            JobKind::ExtractFrames => self.extract_frames.clone(),
            JobKind::EditVideo => self.edit_video.clone(),
        }
    }
}
