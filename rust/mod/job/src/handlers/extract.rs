use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::info;

use crate::error::JobError;
use crate::model::JobParams;

use super::{JobContext, JobHandler, JobOutcome};

/// One extracted frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameInfo {
    pub frame_id: u32,
    pub path: String,
    /// Position in the source video.
    pub seconds: f64,
}

/// Result of a frame extraction run.
#[derive(Debug, Serialize)]
pub struct ExtractedFrames {
    pub frames_dir: String,
    pub frames: Vec<FrameInfo>,
}

/// Pulls still frames out of a video file.
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, video_path: &str, frame_count: u32) -> Result<ExtractedFrames, JobError>;
}

/// Extracts frames evenly spaced across the video.
pub struct ExtractFramesHandler {
    extractor: Arc<dyn FrameExtractor>,
}

impl ExtractFramesHandler {
    pub fn new(extractor: Arc<dyn FrameExtractor>) -> Self {
        ExtractFramesHandler { extractor }
    }
}

#[async_trait]
impl JobHandler for ExtractFramesHandler {
    async fn run(&self, ctx: &JobContext, params: &JobParams) -> Result<JobOutcome, JobError> {
        let (video_path, frame_count) = match params {
            JobParams::ExtractFrames { video_path, frame_count } => (video_path, *frame_count),
            _ => return Err(JobError::Validation("wrong params for extract_frames".into())),
        };

        ctx.progress(10, "analyzing video")?;
        ctx.progress(30, &format!("extracting {frame_count} frames"))?;
        let extracted = self.extractor.extract(video_path, frame_count).await?;
        info!(
            job_id = %ctx.job_id,
            frames = extracted.frames.len(),
            "frame extraction finished"
        );

        ctx.progress(90, "saving results")?;
        let metadata = serde_json::to_value(&extracted)
            .map_err(|e| JobError::Storage(format!("encode frame metadata: {e}")))?;
        Ok(JobOutcome { result_location: extracted.frames_dir.clone(), result_metadata: Some(metadata) })
    }
}

/// Frame extraction backed by the ffmpeg and ffprobe binaries.
pub struct FfmpegFrameExtractor {
    output_root: PathBuf,
}

impl FfmpegFrameExtractor {
    pub fn new(output_root: &Path) -> Self {
        FfmpegFrameExtractor { output_root: output_root.to_path_buf() }
    }

    async fn probe_duration(&self, video_path: &str) -> Result<f64, JobError> {
        let output = Command::new("ffprobe")
            .args([
                "-v", "error",
                "-show_entries", "format=duration",
                "-of", "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(video_path)
            .output()
            .await
            .map_err(|e| JobError::ProviderFatal(format!("run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(JobError::ProviderFatal(format!(
                "ffprobe failed for {video_path}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|e| JobError::ProviderFatal(format!("parse video duration: {e}")))
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract(&self, video_path: &str, frame_count: u32) -> Result<ExtractedFrames, JobError> {
        let duration = self.probe_duration(video_path).await?;

        let stem = Path::new(video_path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let frames_dir = self.output_root.join(format!("{stem}_frames"));
        tokio::fs::create_dir_all(&frames_dir)
            .await
            .map_err(|e| JobError::Storage(format!("create {}: {e}", frames_dir.display())))?;

        let mut frames = Vec::with_capacity(frame_count as usize);
        for i in 0..frame_count {
            // Sample points away from the very start and end of the clip.
            let seconds = duration * (i as f64 + 0.5) / frame_count as f64;
            let frame_path = frames_dir.join(format!("frame_{:03}.jpg", i + 1));

            let status = Command::new("ffmpeg")
                .args(["-v", "error", "-ss", &format!("{seconds:.3}")])
                .args(["-i", video_path])
                .args(["-frames:v", "1", "-q:v", "2", "-y"])
                .arg(&frame_path)
                .status()
                .await
                .map_err(|e| JobError::ProviderFatal(format!("run ffmpeg: {e}")))?;

            if !status.success() {
                return Err(JobError::ProviderFatal(format!(
                    "ffmpeg failed extracting frame {} of {video_path}",
                    i + 1
                )));
            }

            frames.push(FrameInfo {
                frame_id: i + 1,
                path: frame_path.to_string_lossy().to_string(),
                seconds,
            });
        }

        Ok(ExtractedFrames { frames_dir: frames_dir.to_string_lossy().to_string(), frames })
    }
}
