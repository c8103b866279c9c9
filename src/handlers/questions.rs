//! Q&A endpoints: enqueue ad-hoc questions against a transcript, list the
//! answers, delete entries.

use crate::error::AppError;
use crate::state::AppState;
use crate::store::jobs::{self, QAJob};
use actix_web::{web, HttpResponse};
use serde_json::json;
use uuid::Uuid;

/// `POST /api/transcripts/{id}/questions`: body is a JSON array of
/// question strings; each becomes a queued Q&A job.
pub async fn create(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<Vec<String>>,
) -> Result<HttpResponse, AppError> {
    let transcript_id = *path;

    if jobs::get_transcription(&state.pool, transcript_id)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound("Transcript not found".to_string()));
    }

    let questions: Vec<String> = body
        .into_inner()
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();

    if questions.is_empty() {
        return Err(AppError::BadRequest("No questions provided".to_string()));
    }

    let count = questions.len();
    for question in questions {
        let job = QAJob::new(transcript_id, question);
        jobs::create_qa(&state.pool, &job).await?;
    }

    Ok(HttpResponse::Ok().json(json!({
        "message": format!("Added {} questions to queue", count)
    })))
}

/// `GET /api/transcripts/{id}/questions`
pub async fn list(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let entries = jobs::list_qa_for_transcript(&state.pool, *path).await?;
    Ok(HttpResponse::Ok().json(entries))
}

/// `DELETE /api/questions/{id}`
pub async fn delete(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = *path;

    if jobs::get_qa(&state.pool, id).await?.is_none() {
        return Err(AppError::NotFound("Q&A entry not found".to_string()));
    }

    jobs::delete_qa(&state.pool, id).await?;

    Ok(HttpResponse::Ok().json(json!({ "message": "Deleted successfully" })))
}
