//! Health and metrics endpoints: uptime, process memory, queue depths,
//! model residency and the worker's job counters.

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let residency = state.coordinator.residency().await;
    let (queued_questions, queued_transcriptions) =
        crate::store::jobs::queued_counts(&state.pool).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "queue": {
            "questions": queued_questions,
            "transcriptions": queued_transcriptions
        },
        "models": {
            "whisper": {
                "model": state.config.models.whisper_model,
                "resident": residency.speech
            },
            "llm": {
                "model": state.config.models.llm_file,
                "resident": residency.chat
            },
            "embedder": {
                "model": state.config.models.embedding_repo,
                "resident": residency.embedder
            }
        }
    })))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let metrics = state.metrics_snapshot();
    let (queued_questions, queued_transcriptions) =
        crate::store::jobs::queued_counts(&state.pool).await?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "jobs": {
            "transcriptions_completed": metrics.transcriptions_completed,
            "transcriptions_failed": metrics.transcriptions_failed,
            "answers_completed": metrics.answers_completed,
            "answers_failed": metrics.answers_failed,
            "queued_questions": queued_questions,
            "queued_transcriptions": queued_transcriptions
        },
        "memory": memory_info()
    })))
}

/// Resident/virtual memory of this process, read from procfs when available.
fn memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0u64;
            let mut vm_size = 0u64;

            for line in status.lines() {
                if let Some(kb) = line.strip_prefix("VmRSS:") {
                    vm_rss = parse_kb(kb);
                } else if let Some(kb) = line.strip_prefix("VmSize:") {
                    vm_size = parse_kb(kb);
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    let _ = pid;
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

#[cfg(target_os = "linux")]
fn parse_kb(field: &str) -> u64 {
    field
        .split_whitespace()
        .next()
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}
