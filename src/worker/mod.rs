//! # Background Worker
//!
//! The single cooperative scheduler loop and the two job pipelines it
//! drives. Everything here is generic over the model backends so the
//! pipelines can be exercised in tests with scripted stand-ins.

pub mod answer;
pub mod scheduler;
pub mod transcribe;

use crate::config::AppConfig;
use crate::models::coordinator::ResourceCoordinator;
use crate::models::{ChatModel, EmbeddingModel, SpeechModel};
use sqlx::SqlitePool;
use std::sync::{Arc, RwLock};

/// Counters the scheduler keeps about its own work, surfaced by the
/// metrics endpoint.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct JobMetrics {
    pub transcriptions_completed: u64,
    pub transcriptions_failed: u64,
    pub answers_completed: u64,
    pub answers_failed: u64,
}

/// Everything a pipeline needs to process a job.
pub struct WorkerContext<S, C, E> {
    pub pool: SqlitePool,
    pub coordinator: Arc<ResourceCoordinator<S, C, E>>,
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<JobMetrics>>,
}

impl<S, C, E> Clone for WorkerContext<S, C, E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S, C, E> WorkerContext<S, C, E>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    pub fn new(
        pool: SqlitePool,
        coordinator: Arc<ResourceCoordinator<S, C, E>>,
        config: Arc<AppConfig>,
        metrics: Arc<RwLock<JobMetrics>>,
    ) -> Self {
        Self {
            pool,
            coordinator,
            config,
            metrics,
        }
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut JobMetrics)) {
        if let Ok(mut metrics) = self.metrics.write() {
            update(&mut metrics);
        }
    }
}
