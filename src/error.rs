//! # Error Handling
//!
//! Two error layers live here:
//!
//! - **`JobError`**: typed failures raised while processing a transcription
//!   or Q&A job (model artifact missing, accelerator out of memory, context
//!   over the generation budget, store unreachable). Pipelines match on these
//!   variants to decide between retrying, re-queueing and giving up.
//! - **`AppError`**: HTTP-facing errors returned by request handlers and
//!   converted to JSON responses via actix's `ResponseError` trait.
//!
//! ## Propagation policy:
//! - Resource-load and accelerator failures abort the current job only; the
//!   job is marked `Error` and is never retried automatically.
//! - `ContextTooLarge` is retried locally by the Q&A pipeline's threshold
//!   loop before being surfaced.
//! - Store failures at the scheduler level are logged and the loop sleeps
//!   and continues; they are never fatal to the process.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failure classes for job processing.
///
/// ## Variant mapping:
/// - `ResourceLoad`: model artifact missing, corrupt, or undownloadable
/// - `AcceleratorExhausted`: out-of-memory during model load or inference
/// - `ContextTooLarge`: the generation model rejected the prompt size;
///   retryable by shrinking the retrieved context
/// - `Inference`: any other failure inside a model call
/// - `Store`: the job store was unreachable or a query failed
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("model load failed: {0}")]
    ResourceLoad(String),

    #[error("accelerator out of memory: {0}")]
    AcceleratorExhausted(String),

    #[error("context too large for generation: {0}")]
    ContextTooLarge(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("job store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl JobError {
    /// Classify a raw model-backend error by message.
    ///
    /// Accelerator OOM surfaces from the backend as a plain runtime error;
    /// the message text is the only discriminator available.
    pub fn from_backend(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("out of memory") || lower.contains("oom") {
            JobError::AcceleratorExhausted(msg)
        } else {
            JobError::Inference(msg)
        }
    }

    /// True when the Q&A pipeline may retry this failure with a smaller
    /// context instead of failing the job.
    pub fn is_retryable_with_smaller_context(&self) -> bool {
        matches!(self, JobError::ContextTooLarge(_))
    }
}

/// HTTP-facing error types returned by request handlers.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (500)
    Internal(String),

    /// Client sent invalid or malformed data (400)
    BadRequest(String),

    /// Requested resource doesn't exist (404)
    NotFound(String),

    /// Resource already exists, e.g. duplicate upload filename (409)
    Conflict(String),

    /// Configuration file or environment variable problems (500)
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Conflict(msg) => (
                actix_web::http::StatusCode::CONFLICT,
                "conflict",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(format!("store error: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}
