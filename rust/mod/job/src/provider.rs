use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::error::JobError;
use crate::handlers::JobContext;

/// Provider-side failure, split by whether a retry could help.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => JobError::ProviderTransient(msg),
            ProviderError::Fatal(msg) => JobError::ProviderFatal(msg),
        }
    }
}

/// A generation request handed to a provider.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Local path of a reference image or video, if the job has one.
    pub reference_path: Option<String>,
    pub duration_secs: u32,
}

/// Opaque provider-side identifier for a started generation.
#[derive(Debug, Clone)]
pub struct JobHandle(pub String);

/// One poll of a provider-side generation.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    InProgress,
    Completed { uri: String, metadata: Value },
    Failed { message: String },
}

/// An external video-generation backend.
///
/// Implementations start a generation, answer polls about it, and may
/// optionally support stopping it early. `stop` is best-effort; the
/// default says the provider cannot stop work once started.
#[async_trait]
pub trait VideoProvider: Send + Sync {
    async fn start(&self, req: &GenerationRequest) -> Result<JobHandle, ProviderError>;

    async fn poll(&self, handle: &JobHandle) -> Result<PollOutcome, ProviderError>;

    async fn stop(&self, _handle: &JobHandle) -> Result<bool, ProviderError> {
        Ok(false)
    }
}

/// Poll a started generation until it completes or fails, honoring
/// cancellation and the soft time limit between polls.
///
/// Progress creeps from 20 toward 90 while waiting; the provider gives
/// no percentage of its own, so elapsed polls are the only signal.
pub async fn drive_to_completion(
    provider: &dyn VideoProvider,
    handle: &JobHandle,
    ctx: &JobContext,
) -> Result<(String, Value), JobError> {
    let mut ticks: u32 = 0;
    loop {
        ctx.checkpoint()?;
        match provider.poll(handle).await? {
            PollOutcome::InProgress => {
                ticks += 1;
                let pct = (20 + ticks.saturating_mul(5)).min(90) as u8;
                ctx.progress(pct, "waiting on provider")?;
                tokio::time::sleep(ctx.poll_interval()).await;
            }
            PollOutcome::Completed { uri, metadata } => return Ok((uri, metadata)),
            PollOutcome::Failed { message } => return Err(JobError::ProviderFatal(message)),
        }
    }
}

// ---------------------------------------------------------------------------
// Veo (Gemini API) client
// ---------------------------------------------------------------------------

/// Client for Google's Veo long-running generation API.
pub struct VeoClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl VeoClient {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        VeoClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn read_reference_image(&self, path: &str) -> Result<(String, String), ProviderError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::Fatal(format!("read reference image {path}: {e}")))?;
        let mime = match path.rsplit('.').next() {
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            _ => "image/jpeg",
        };
        Ok((base64::engine::general_purpose::STANDARD.encode(bytes), mime.to_string()))
    }
}

#[async_trait]
impl VideoProvider for VeoClient {
    async fn start(&self, req: &GenerationRequest) -> Result<JobHandle, ProviderError> {
        let mut instance = serde_json::json!({ "prompt": req.prompt });
        if let Some(path) = &req.reference_path {
            let (encoded, mime) = self.read_reference_image(path).await?;
            instance["image"] = serde_json::json!({
                "bytesBase64Encoded": encoded,
                "mimeType": mime,
            });
        }
        let body = serde_json::json!({
            "instances": [instance],
            "parameters": { "durationSeconds": req.duration_secs },
        });

        let url = format!("{}/models/{}:predictLongRunning", self.base_url, self.model);
        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("start request: {e}")))?;

        let status = resp.status();
        let payload: Value = read_json(resp).await?;
        if !status.is_success() {
            return Err(classify_http(status, &payload));
        }
        parse_start_response(&payload)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollOutcome, ProviderError> {
        let url = format!("{}/{}", self.base_url, handle.0);
        let resp = self
            .http
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("poll request: {e}")))?;

        let status = resp.status();
        let payload: Value = read_json(resp).await?;
        if !status.is_success() {
            return Err(classify_http(status, &payload));
        }
        parse_poll_response(&payload)
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value, ProviderError> {
    resp.json()
        .await
        .map_err(|e| ProviderError::Transient(format!("read response body: {e}")))
}

/// Map an HTTP error status to a provider error. Rate limits, request
/// timeouts and server errors are worth retrying; everything else in
/// the 4xx range is a request we should not repeat.
fn classify_http(status: reqwest::StatusCode, payload: &Value) -> ProviderError {
    let message = payload
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("no error detail")
        .to_string();
    let msg = format!("provider returned {status}: {message}");
    if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(msg)
    } else {
        ProviderError::Fatal(msg)
    }
}

fn parse_start_response(payload: &Value) -> Result<JobHandle, ProviderError> {
    payload
        .get("name")
        .and_then(Value::as_str)
        .map(|name| JobHandle(name.to_string()))
        .ok_or_else(|| ProviderError::Fatal("start response missing operation name".into()))
}

fn parse_poll_response(payload: &Value) -> Result<PollOutcome, ProviderError> {
    if !payload.get("done").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(PollOutcome::InProgress);
    }
    if let Some(err) = payload.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("generation failed without detail")
            .to_string();
        return Ok(PollOutcome::Failed { message });
    }

    // Content filtering reports through raiMediaFilteredCount rather
    // than the error field.
    let filtered = payload
        .pointer("/response/generateVideoResponse/raiMediaFilteredCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if filtered > 0 {
        return Ok(PollOutcome::Failed {
            message: format!("{filtered} sample(s) filtered by content policy"),
        });
    }

    let samples = payload
        .pointer("/response/generateVideoResponse/generatedSamples")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Fatal("completed operation has no generated samples".into()))?;
    let uri = samples
        .first()
        .and_then(|s| s.pointer("/video/uri"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Fatal("generated sample has no video uri".into()))?;

    Ok(PollOutcome::Completed {
        uri: uri.to_string(),
        metadata: serde_json::json!({ "samples": samples.len() }),
    })
}

// ---------------------------------------------------------------------------
// Demo provider
// ---------------------------------------------------------------------------

/// Fake provider for local development: every generation "runs" for a
/// fixed wall-clock delay, then completes with a canned result.
pub struct DemoProvider {
    delay: Duration,
    result_uri: String,
    started: Mutex<HashMap<String, Instant>>,
    counter: Mutex<u64>,
}

impl DemoProvider {
    pub fn new(delay: Duration, result_uri: &str) -> Self {
        DemoProvider {
            delay,
            result_uri: result_uri.to_string(),
            started: Mutex::new(HashMap::new()),
            counter: Mutex::new(0),
        }
    }
}

#[async_trait]
impl VideoProvider for DemoProvider {
    async fn start(&self, req: &GenerationRequest) -> Result<JobHandle, ProviderError> {
        let id = {
            let mut counter = self
                .counter
                .lock()
                .map_err(|_| ProviderError::Fatal("demo counter poisoned".into()))?;
            *counter += 1;
            format!("demo-{}", *counter)
        };
        debug!(handle = %id, prompt = %req.prompt, "demo generation started");
        self.started
            .lock()
            .map_err(|_| ProviderError::Fatal("demo state poisoned".into()))?
            .insert(id.clone(), Instant::now());
        Ok(JobHandle(id))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollOutcome, ProviderError> {
        let started = self
            .started
            .lock()
            .map_err(|_| ProviderError::Fatal("demo state poisoned".into()))?
            .get(&handle.0)
            .copied()
            .ok_or_else(|| ProviderError::Fatal(format!("unknown demo handle {}", handle.0)))?;

        if started.elapsed() < self.delay {
            Ok(PollOutcome::InProgress)
        } else {
            Ok(PollOutcome::Completed {
                uri: self.result_uri.clone(),
                metadata: serde_json::json!({ "demo_mode": true }),
            })
        }
    }

    async fn stop(&self, handle: &JobHandle) -> Result<bool, ProviderError> {
        self.started
            .lock()
            .map_err(|_| ProviderError::Fatal("demo state poisoned".into()))?
            .remove(&handle.0);
        Ok(true)
    }
}
