//! # Application State
//!
//! Shared state handed to every request handler: configuration, the job
//! store pool, the model coordinator and the worker's job counters. All of
//! it is reference-counted, so cloning the state per worker thread is cheap.

use crate::config::AppConfig;
use crate::models::coordinator::ResourceCoordinator;
use crate::models::embedder::SentenceEmbedder;
use crate::models::generator::TextGenerator;
use crate::models::whisper::WhisperModel;
use crate::worker::{JobMetrics, WorkerContext};
use sqlx::SqlitePool;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The coordinator instantiated with the production model backends.
pub type AppCoordinator = ResourceCoordinator<WhisperModel, TextGenerator, SentenceEmbedder>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: SqlitePool,
    pub coordinator: Arc<AppCoordinator>,
    pub metrics: Arc<RwLock<JobMetrics>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, pool: SqlitePool, coordinator: Arc<AppCoordinator>) -> Self {
        Self {
            config,
            pool,
            coordinator,
            metrics: Arc::new(RwLock::new(JobMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// The view of this state the background worker needs.
    pub fn worker_context(&self) -> WorkerContext<WhisperModel, TextGenerator, SentenceEmbedder> {
        WorkerContext::new(
            self.pool.clone(),
            self.coordinator.clone(),
            self.config.clone(),
            self.metrics.clone(),
        )
    }

    /// Copy of the worker's counters; the lock is released immediately.
    pub fn metrics_snapshot(&self) -> JobMetrics {
        self.metrics.read().map(|m| *m).unwrap_or_default()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
