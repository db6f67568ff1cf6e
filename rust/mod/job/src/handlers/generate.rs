use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::JobError;
use crate::model::JobParams;
use crate::provider::{drive_to_completion, GenerationRequest, VideoProvider};

use super::{JobContext, JobHandler, JobOutcome};

/// Generates a video from a reference image and a prompt via the
/// configured provider.
pub struct GenerateFromImageHandler {
    provider: Arc<dyn VideoProvider>,
}

impl GenerateFromImageHandler {
    pub fn new(provider: Arc<dyn VideoProvider>) -> Self {
        GenerateFromImageHandler { provider }
    }
}

#[async_trait]
impl JobHandler for GenerateFromImageHandler {
    async fn run(&self, ctx: &JobContext, params: &JobParams) -> Result<JobOutcome, JobError> {
        let (image_path, prompt, duration_secs) = match params {
            JobParams::GenerateFromImage { image_path, prompt, duration_secs } => {
                (image_path, prompt, *duration_secs)
            }
            _ => return Err(JobError::Validation("wrong params for generate_from_image".into())),
        };

        ctx.progress(5, "preparing reference image")?;
        let req = GenerationRequest {
            prompt: prompt.clone(),
            reference_path: Some(image_path.clone()),
            duration_secs,
        };

        ctx.progress(10, "starting provider job")?;
        let handle = self.provider.start(&req).await?;
        info!(job_id = %ctx.job_id, handle = %handle.0, "provider generation started");

        ctx.progress(20, "video generation in progress")?;
        let (uri, provider_meta) = drive_to_completion(self.provider.as_ref(), &handle, ctx).await?;

        ctx.progress(95, "saving result")?;
        Ok(JobOutcome {
            result_location: uri,
            result_metadata: Some(serde_json::json!({
                "prompt": prompt,
                "reference_image": image_path,
                "duration_secs": duration_secs,
                "provider": provider_meta,
            })),
        })
    }
}
