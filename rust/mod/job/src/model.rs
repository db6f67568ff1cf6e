use serde::{Deserialize, Serialize};
use serde_json::Value;

use vidforge_core::{new_id, now_rfc3339, ServiceError};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Retry,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "retry" => Some(JobStatus::Retry),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Legal state machine edges. Every store-level status change is
    /// guarded by a conditional update that enforces this graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Retry)
                | (Retry, Pending)
                | (Retry, Running)
                | (Retry, Cancelled)
        )
    }
}

/// What kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    GenerateFromImage,
    ExtractFrames,
    EditVideo,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::GenerateFromImage => "generate_from_image",
            JobKind::ExtractFrames => "extract_frames",
            JobKind::EditVideo => "edit_video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generate_from_image" => Some(JobKind::GenerateFromImage),
            "extract_frames" => Some(JobKind::ExtractFrames),
            "edit_video" => Some(JobKind::EditVideo),
            _ => None,
        }
    }
}

fn default_duration_secs() -> u32 {
    8
}

fn default_frame_count() -> u32 {
    6
}

/// Typed parameters per job kind. Serialized with the kind as the
/// discriminant so a submission body reads
/// `{"task_type": "generate_from_image", "params": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "params", rename_all = "snake_case")]
pub enum JobParams {
    GenerateFromImage {
        image_path: String,
        prompt: String,
        #[serde(default = "default_duration_secs")]
        duration_secs: u32,
    },
    ExtractFrames {
        video_path: String,
        #[serde(default = "default_frame_count")]
        frame_count: u32,
    },
    EditVideo {
        video_path: String,
        prompt: String,
    },
}

impl JobParams {
    pub fn kind(&self) -> JobKind {
        match self {
            JobParams::GenerateFromImage { .. } => JobKind::GenerateFromImage,
            JobParams::ExtractFrames { .. } => JobKind::ExtractFrames,
            JobParams::EditVideo { .. } => JobKind::EditVideo,
        }
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        match self {
            JobParams::GenerateFromImage { image_path, prompt, duration_secs } => {
                if image_path.trim().is_empty() {
                    return Err(ServiceError::Validation("image_path is required".into()));
                }
                if prompt.trim().is_empty() {
                    return Err(ServiceError::Validation("prompt is required".into()));
                }
                if !(1..=8).contains(duration_secs) {
                    return Err(ServiceError::Validation(
                        "duration_secs must be between 1 and 8".into(),
                    ));
                }
            }
            JobParams::ExtractFrames { video_path, frame_count } => {
                if video_path.trim().is_empty() {
                    return Err(ServiceError::Validation("video_path is required".into()));
                }
                if !(1..=60).contains(frame_count) {
                    return Err(ServiceError::Validation(
                        "frame_count must be between 1 and 60".into(),
                    ));
                }
            }
            JobParams::EditVideo { video_path, prompt } => {
                if video_path.trim().is_empty() {
                    return Err(ServiceError::Validation("video_path is required".into()));
                }
                if prompt.trim().is_empty() {
                    return Err(ServiceError::Validation("prompt is required".into()));
                }
            }
        }
        Ok(())
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(flatten)]
    pub params: JobParams,
    pub status: JobStatus,
    /// 0..=100, monotonically non-decreasing within one attempt.
    pub progress: u8,
    pub current_step: Option<String>,
    pub result_location: Option<String>,
    pub result_metadata: Option<Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub retry_count: u32,
    pub cancel_requested: bool,
    pub created_by: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
    pub duration_seconds: Option<f64>,
}

impl Job {
    pub fn new(params: JobParams, created_by: Option<String>) -> Self {
        let now = now_rfc3339();
        Job {
            id: new_id(),
            params,
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            result_location: None,
            result_metadata: None,
            error_message: None,
            error_type: None,
            retry_count: 0,
            cancel_requested: false,
            created_by,
            created_at: now.clone(),
            started_at: None,
            completed_at: None,
            updated_at: now,
            duration_seconds: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.params.kind()
    }
}

/// Submission body for `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(flatten)]
    pub params: JobParams,
    pub created_by: Option<String>,
}

fn default_limit() -> usize {
    50
}

/// Query string for `GET /jobs`.
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub created_by: Option<String>,
}

impl Default for JobListQuery {
    fn default() -> Self {
        JobListQuery {
            limit: default_limit(),
            offset: 0,
            status: None,
            task_type: None,
            created_by: None,
        }
    }
}

fn default_poll_timeout() -> u64 {
    30
}

/// Query string for `GET /jobs/{id}/@poll`.
#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Long-poll timeout in seconds, capped by the API layer.
    #[serde(default = "default_poll_timeout")]
    pub timeout: u64,
}

/// Per-status job counts for the stats endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retry: u64,
}
