pub mod api;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod model;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;

use vidforge_core::Module;

use engine::{JobEngine, TaskTypeConfigs};
use handlers::{
    EditVideoHandler, ExtractFramesHandler, FrameExtractor, GenerateFromImageHandler,
    HandlerRegistry,
};
use provider::VideoProvider;
use queue::TaskQueue;
use store::JobStore;
use worker::WorkerConfig;

/// Configuration for the whole module.
#[derive(Debug, Clone, Copy)]
pub struct JobModuleConfig {
    pub worker: WorkerConfig,
    pub types: TaskTypeConfigs,
    /// Lease visibility timeout. Generous on purpose: an expired lease
    /// redelivers, and the claim check makes redelivery a no-op for a
    /// job that is still being worked on elsewhere.
    pub queue_visibility: Duration,
}

impl Default for JobModuleConfig {
    fn default() -> Self {
        JobModuleConfig {
            worker: WorkerConfig::default(),
            types: TaskTypeConfigs::default(),
            queue_visibility: Duration::from_secs(1800),
        }
    }
}

/// The job module — durable video job orchestration.
///
/// Owns the store, queue, handler registry, and worker pool. Embed it
/// in a service binary to get submission, progress long-polling,
/// retry with backoff, and cooperative cancellation.
pub struct JobModule {
    engine: Arc<JobEngine>,
    worker_cancel: CancellationToken,
}

impl JobModule {
    /// Build the module, recover persisted work, and start workers.
    pub fn new(
        store: Arc<JobStore>,
        provider: Arc<dyn VideoProvider>,
        extractor: Arc<dyn FrameExtractor>,
        config: JobModuleConfig,
    ) -> Result<Self, vidforge_core::ServiceError> {
        let queue = Arc::new(TaskQueue::new(config.queue_visibility));
        let registry = HandlerRegistry {
            generate_from_image: Arc::new(GenerateFromImageHandler::new(provider.clone())),
            extract_frames: Arc::new(ExtractFramesHandler::new(extractor)),
            edit_video: Arc::new(EditVideoHandler::new(provider)),
        };
        let engine = Arc::new(JobEngine::new(store, queue, registry, config.types));

        engine.recover()?;
        let worker_cancel = worker::start(Arc::clone(&engine), config.worker);

        Ok(Self { engine, worker_cancel })
    }

    pub fn engine(&self) -> &Arc<JobEngine> {
        &self.engine
    }

    /// Stop the worker pool. In-flight attempts finish; no new work is
    /// picked up.
    pub fn shutdown(&self) {
        self.worker_cancel.cancel();
    }
}

impl Module for JobModule {
    fn name(&self) -> &str {
        "api"
    }

    fn routes(&self) -> Router {
        api::router(Arc::clone(&self.engine))
    }
}
