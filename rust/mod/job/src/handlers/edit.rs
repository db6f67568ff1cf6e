use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::JobError;
use crate::model::JobParams;
use crate::provider::{drive_to_completion, GenerationRequest, VideoProvider};

use super::{JobContext, JobHandler, JobOutcome};

/// Re-generates a video from an existing clip and an edit prompt.
pub struct EditVideoHandler {
    provider: Arc<dyn VideoProvider>,
}

impl EditVideoHandler {
    pub fn new(provider: Arc<dyn VideoProvider>) -> Self {
        EditVideoHandler { provider }
    }
}

#[async_trait]
impl JobHandler for EditVideoHandler {
    async fn run(&self, ctx: &JobContext, params: &JobParams) -> Result<JobOutcome, JobError> {
        let (video_path, prompt) = match params {
            JobParams::EditVideo { video_path, prompt } => (video_path, prompt),
            _ => return Err(JobError::Validation("wrong params for edit_video".into())),
        };

        ctx.progress(10, "starting provider job")?;
        let req = GenerationRequest {
            prompt: prompt.clone(),
            reference_path: Some(video_path.clone()),
            duration_secs: 8,
        };
        let handle = self.provider.start(&req).await?;
        info!(job_id = %ctx.job_id, handle = %handle.0, "provider edit started");

        ctx.progress(20, "video edit in progress")?;
        let (uri, provider_meta) = drive_to_completion(self.provider.as_ref(), &handle, ctx).await?;

        ctx.progress(95, "saving result")?;
        Ok(JobOutcome {
            result_location: uri,
            result_metadata: Some(serde_json::json!({
                "prompt": prompt,
                "source_video": video_path,
                "provider": provider_meta,
            })),
        })
    }
}
