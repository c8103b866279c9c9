//! Transcript endpoints: upload, record, lifecycle control and downloads.

use crate::error::AppError;
use crate::handlers::sanitize_filename;
use crate::state::AppState;
use crate::store::jobs::{self, JobStatus, TranscriptionJob};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde_json::json;
use uuid::Uuid;

/// `POST /api/transcripts/upload`: multipart audio upload.
///
/// The file is stored under its (sanitized) original name and the job is
/// created **Pending**: transcription only starts after an explicit
/// `/start`, so an operator can review the queue first.
pub async fn upload(
    state: web::Data<AppState>,
    mut payload: actix_multipart::Multipart,
) -> Result<HttpResponse, AppError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::BadRequest("Missing content disposition".to_string()))?;

        if content_disposition.get_name() == Some("file") {
            original_name = content_disposition.get_filename().map(|s| s.to_string());
            file_bytes = Some(read_field(&mut field).await?);
        }
    }

    let file_bytes =
        file_bytes.ok_or_else(|| AppError::BadRequest("No file field provided".to_string()))?;
    let original_name =
        original_name.ok_or_else(|| AppError::BadRequest("Upload has no filename".to_string()))?;

    if jobs::find_transcription_by_filename(&state.pool, &original_name)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict(format!(
            "File '{}' sudah ada di sistem.",
            original_name
        )));
    }

    let extension = std::path::Path::new(&original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("wav")
        .to_string();

    let mut safe_name = sanitize_filename(&original_name);
    if safe_name.is_empty() {
        safe_name = format!("upload_{}.{}", Uuid::new_v4(), extension);
    }

    let upload_dir = state.config.storage.upload_dir();
    std::fs::create_dir_all(&upload_dir)?;
    let save_path = upload_dir.join(&safe_name);
    std::fs::write(&save_path, &file_bytes)?;

    let job = TranscriptionJob::new(
        original_name,
        save_path.to_string_lossy().into_owned(),
        JobStatus::Pending,
        "Uploaded. Waiting for approval...",
    );
    jobs::create_transcription(&state.pool, &job).await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": "File uploaded",
        "id": job.id
    })))
}

/// `POST /api/transcripts/record`: store a recorded capture blob.
///
/// Multipart fields: `file` (the audio bytes), `filename`, and an optional
/// `transcribe` flag (default true). When the flag is set the job goes
/// straight to **Queued**; recordings come from the live session, nobody
/// reviews them first.
pub async fn record(
    state: web::Data<AppState>,
    mut payload: actix_multipart::Multipart,
) -> Result<HttpResponse, AppError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut transcribe = true;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::BadRequest("Missing content disposition".to_string()))?;
        let field_name = content_disposition.get_name().map(|s| s.to_string());

        match field_name.as_deref() {
            Some("file") => file_bytes = Some(read_field(&mut field).await?),
            Some("filename") => {
                filename = Some(String::from_utf8_lossy(&read_field(&mut field).await?).into_owned())
            }
            Some("transcribe") => {
                let raw = String::from_utf8_lossy(&read_field(&mut field).await?).into_owned();
                transcribe = raw.trim() != "false";
            }
            _ => {}
        }
    }

    let file_bytes =
        file_bytes.ok_or_else(|| AppError::BadRequest("No file field provided".to_string()))?;
    let filename =
        filename.ok_or_else(|| AppError::BadRequest("No filename field provided".to_string()))?;

    let mut safe_name = sanitize_filename(&filename);
    if safe_name.is_empty() {
        safe_name = format!("recording_{}", Uuid::new_v4());
    }
    if !safe_name.ends_with(".wav") && !safe_name.ends_with(".pcm") {
        safe_name.push_str(".wav");
    }

    let recorded_dir = state.config.storage.recorded_dir();
    std::fs::create_dir_all(&recorded_dir)?;

    let mut save_path = recorded_dir.join(&safe_name);
    if save_path.exists() {
        let stamp = chrono::Local::now().format("%H%M%S");
        save_path = recorded_dir.join(format!("{}_{}", stamp, safe_name));
    }

    std::fs::write(&save_path, &file_bytes)?;

    if !transcribe {
        return Ok(HttpResponse::Ok().json(json!({
            "message": "Recording saved",
            "path": save_path.to_string_lossy()
        })));
    }

    let job = TranscriptionJob::new(
        save_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(safe_name),
        save_path.to_string_lossy().into_owned(),
        JobStatus::Queued,
        "Queued from recording...",
    );
    jobs::create_transcription(&state.pool, &job).await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": "Recording saved and queued",
        "id": job.id
    })))
}

/// `GET /api/transcripts`: all jobs, newest first.
pub async fn list(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let transcripts = jobs::list_transcriptions(&state.pool).await?;
    Ok(HttpResponse::Ok().json(transcripts))
}

/// `GET /api/transcripts/{id}`
pub async fn get(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let job = fetch(&state, *path).await?;
    Ok(HttpResponse::Ok().json(job))
}

/// `POST /api/transcripts/{id}/start`: Pending → Queued.
pub async fn start(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    requeue(&state, *path, "Queued for processing...").await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Transcription started" })))
}

/// `POST /api/transcripts/{id}/retry`: Error/Completed → Queued.
pub async fn retry(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    requeue(&state, *path, "Retrying...").await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Retrying" })))
}

/// `DELETE /api/transcripts/{id}`: remove the audio file (best effort),
/// the job row and every Q&A row hanging off it.
pub async fn delete(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let job = fetch(&state, *path).await?;

    if let Err(e) = std::fs::remove_file(&job.file_path) {
        // The row still goes; the file may already be gone.
        tracing::warn!("Could not delete audio file {}: {}", job.file_path, e);
    }

    jobs::delete_transcription(&state.pool, job.id).await?;

    Ok(HttpResponse::Ok().json(json!({ "message": "Deleted successfully" })))
}

/// `GET /api/transcripts/{id}/text`: download the raw transcript.
pub async fn download_text(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let job = fetch(&state, *path).await?;
    let text = job
        .raw_text
        .ok_or_else(|| AppError::NotFound("Transcript text not available".to_string()))?;

    Ok(attachment(&format!("{}.txt", job.filename), text))
}

/// `GET /api/transcripts/{id}/report`: download a plain-text Q&A report.
pub async fn download_report(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let job = fetch(&state, *path).await?;
    let entries = jobs::list_qa_for_transcript(&state.pool, job.id).await?;

    if entries.is_empty() {
        return Err(AppError::BadRequest("No Q&A data to download".to_string()));
    }

    let mut report = String::new();
    report.push_str(&format!("Laporan Analisis: {}\n", job.filename));
    report.push_str(&format!("ID Transkrip: {}\n", job.id));
    report.push_str(&format!(
        "Tanggal: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M")
    ));
    report.push_str(&"-".repeat(50));
    report.push_str("\n\nDaftar Tanya Jawab Medis\n\n");

    for (index, entry) in entries.iter().enumerate() {
        report.push_str(&format!("Pertanyaan #{}\n", index + 1));
        report.push_str(&format!("Q: {}\n", entry.question));
        report.push_str(&format!(
            "A: {}\n",
            entry.answer.as_deref().unwrap_or("Belum dijawab")
        ));
        if let Some(confidence) = entry.confidence {
            report.push_str(&format!("Skor keyakinan: {:.2}\n", confidence));
        }
        if let Some(context) = &entry.context_used {
            let preview: String = context.chars().take(500).collect();
            report.push_str(&format!("Konteks: {}\n", preview));
        }
        report.push_str(&format!("{}\n\n", "_".repeat(20)));
    }

    Ok(attachment(&format!("Laporan_QA_{}.txt", job.filename), report))
}

async fn fetch(state: &AppState, id: Uuid) -> Result<TranscriptionJob, AppError> {
    jobs::get_transcription(&state.pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound("Transcript not found".to_string()))
}

/// Move a job back onto the queue, honoring the transition set.
async fn requeue(state: &AppState, id: Uuid, step: &str) -> Result<(), AppError> {
    let mut job = fetch(state, id).await?;

    match job.status {
        JobStatus::Processing => Err(AppError::Conflict(
            "Transcript is currently being processed".to_string(),
        )),
        JobStatus::Queued => Ok(()),
        _ => {
            job.requeue(step);
            jobs::update_transcription(&state.pool, &job).await?;
            Ok(())
        }
    }
}

fn attachment(filename: &str, body: String) -> HttpResponse {
    let safe_name = sanitize_filename(filename);
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", safe_name),
        ))
        .body(body)
}

async fn read_field(field: &mut actix_multipart::Field) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
