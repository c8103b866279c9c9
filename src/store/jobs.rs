//! Job entities and their store operations.
//!
//! Both job types share one status enum with a fixed transition set:
//! Pending → Queued → Processing → {Completed, Error}, plus
//! {Completed, Error} → Queued on explicit retry. The transition helpers on
//! the entities are the only places that move a job between states.
//!
//! Queue ordering is FIFO by submission time with the id as a stable
//! tie-break, which is all the scheduler needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state shared by transcription and Q&A jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Uploaded but waiting for an explicit start
    Pending,
    /// Waiting for the scheduler to pick it up
    Queued,
    /// Currently running in a pipeline
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    /// The legal transition set.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Error)
                | (Completed, Queued)
                | (Error, Queued)
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audio recording on its way to becoming a transcript.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionJob {
    pub id: Uuid,
    pub filename: String,
    pub file_path: String,
    pub status: JobStatus,
    pub progress: i64,
    pub current_step: String,
    pub raw_text: Option<String>,
    pub upload_date: DateTime<Utc>,
    pub process_start: Option<DateTime<Utc>>,
    pub process_end: Option<DateTime<Utc>>,
}

impl TranscriptionJob {
    pub fn new(filename: String, file_path: String, status: JobStatus, step: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename,
            file_path,
            status,
            progress: 0,
            current_step: step.to_string(),
            raw_text: None,
            upload_date: Utc::now(),
            process_start: None,
            process_end: None,
        }
    }

    /// Queued → Processing: clock the start time and label the step.
    pub fn begin_processing(&mut self, step: &str) {
        debug_assert!(self.status.can_transition_to(JobStatus::Processing));
        self.status = JobStatus::Processing;
        self.process_start = Some(Utc::now());
        self.current_step = step.to_string();
    }

    /// Processing → Completed with the produced text.
    pub fn complete(&mut self, text: String) {
        debug_assert!(self.status.can_transition_to(JobStatus::Completed));
        self.status = JobStatus::Completed;
        self.raw_text = Some(text);
        self.progress = 100;
        self.current_step = "Done.".to_string();
        self.process_end = Some(Utc::now());
    }

    /// Processing → Error; the failure message becomes the step label.
    pub fn fail(&mut self, message: &str) {
        debug_assert!(self.status.can_transition_to(JobStatus::Error));
        self.status = JobStatus::Error;
        self.current_step = format!("Error: {}", message);
        self.process_end = Some(Utc::now());
    }

    /// Back onto the queue (explicit start or user-triggered retry).
    pub fn requeue(&mut self, step: &str) {
        self.status = JobStatus::Queued;
        self.progress = 0;
        self.current_step = step.to_string();
    }
}

/// One question asked against a transcript.
#[derive(Debug, Clone, Serialize)]
pub struct QAJob {
    pub id: Uuid,
    pub transcript_id: Uuid,
    pub question: String,
    pub answer: Option<String>,
    pub context_used: Option<String>,
    pub confidence: Option<f64>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl QAJob {
    pub fn new(transcript_id: Uuid, question: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            transcript_id,
            question,
            answer: None,
            context_used: None,
            confidence: None,
            status: JobStatus::Queued,
            created_at: Utc::now(),
        }
    }

    pub fn begin_processing(&mut self) {
        debug_assert!(self.status.can_transition_to(JobStatus::Processing));
        self.status = JobStatus::Processing;
    }

    pub fn complete(&mut self, answer: String, confidence: f64) {
        debug_assert!(self.status.can_transition_to(JobStatus::Completed));
        self.status = JobStatus::Completed;
        self.answer = Some(answer);
        self.confidence = Some(confidence);
    }

    /// The failure detail is stored in the answer field so the operator can
    /// see what went wrong next to the question that caused it.
    pub fn fail(&mut self, detail: String) {
        debug_assert!(self.status.can_transition_to(JobStatus::Error));
        self.status = JobStatus::Error;
        self.answer = Some(detail);
    }
}

// --- transcription job queries ---

pub async fn create_transcription(pool: &SqlitePool, job: &TranscriptionJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO transcription_jobs (
            id, filename, file_path, status, progress, current_step,
            raw_text, upload_date, process_start, process_end
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.filename)
    .bind(&job.file_path)
    .bind(job.status.as_str())
    .bind(job.progress)
    .bind(&job.current_step)
    .bind(&job.raw_text)
    .bind(job.upload_date.to_rfc3339())
    .bind(job.process_start.map(|t| t.to_rfc3339()))
    .bind(job.process_end.map(|t| t.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_transcription(
    pool: &SqlitePool,
    id: Uuid,
) -> Result<Option<TranscriptionJob>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM transcription_jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(transcription_from_row).transpose()
}

pub async fn find_transcription_by_filename(
    pool: &SqlitePool,
    filename: &str,
) -> Result<Option<TranscriptionJob>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM transcription_jobs WHERE filename = ?")
        .bind(filename)
        .fetch_optional(pool)
        .await?;

    row.map(transcription_from_row).transpose()
}

/// All transcription jobs, newest upload first.
pub async fn list_transcriptions(pool: &SqlitePool) -> Result<Vec<TranscriptionJob>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM transcription_jobs ORDER BY upload_date DESC")
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(transcription_from_row).collect()
}

/// The oldest queued transcription job, if any (FIFO with id tie-break).
pub async fn next_queued_transcription(
    pool: &SqlitePool,
) -> Result<Option<TranscriptionJob>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT * FROM transcription_jobs
        WHERE status = 'queued'
        ORDER BY upload_date ASC, id ASC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.map(transcription_from_row).transpose()
}

pub async fn update_transcription(
    pool: &SqlitePool,
    job: &TranscriptionJob,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE transcription_jobs SET
            filename = ?, file_path = ?, status = ?, progress = ?,
            current_step = ?, raw_text = ?, process_start = ?, process_end = ?
        WHERE id = ?
        "#,
    )
    .bind(&job.filename)
    .bind(&job.file_path)
    .bind(job.status.as_str())
    .bind(job.progress)
    .bind(&job.current_step)
    .bind(&job.raw_text)
    .bind(job.process_start.map(|t| t.to_rfc3339()))
    .bind(job.process_end.map(|t| t.to_rfc3339()))
    .bind(job.id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a transcription job and every Q&A job hanging off it.
pub async fn delete_transcription(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM qa_jobs WHERE transcript_id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    sqlx::query("DELETE FROM transcription_jobs WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

// --- Q&A job queries ---

pub async fn create_qa(pool: &SqlitePool, job: &QAJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO qa_jobs (
            id, transcript_id, question, answer, context_used,
            confidence, status, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.transcript_id.to_string())
    .bind(&job.question)
    .bind(&job.answer)
    .bind(&job.context_used)
    .bind(job.confidence)
    .bind(job.status.as_str())
    .bind(job.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_qa(pool: &SqlitePool, id: Uuid) -> Result<Option<QAJob>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM qa_jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(qa_from_row).transpose()
}

/// All questions for one transcript, oldest first.
pub async fn list_qa_for_transcript(
    pool: &SqlitePool,
    transcript_id: Uuid,
) -> Result<Vec<QAJob>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM qa_jobs WHERE transcript_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(transcript_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(qa_from_row).collect()
}

/// The oldest queued Q&A job, if any (FIFO with id tie-break).
pub async fn next_queued_qa(pool: &SqlitePool) -> Result<Option<QAJob>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT * FROM qa_jobs
        WHERE status = 'queued'
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.map(qa_from_row).transpose()
}

pub async fn update_qa(pool: &SqlitePool, job: &QAJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE qa_jobs SET
            question = ?, answer = ?, context_used = ?, confidence = ?, status = ?
        WHERE id = ?
        "#,
    )
    .bind(&job.question)
    .bind(&job.answer)
    .bind(&job.context_used)
    .bind(job.confidence)
    .bind(job.status.as_str())
    .bind(job.id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_qa(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM qa_jobs WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Queue depth per job type, for the metrics endpoint.
pub async fn queued_counts(pool: &SqlitePool) -> Result<(i64, i64), sqlx::Error> {
    let transcriptions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM transcription_jobs WHERE status = 'queued'")
            .fetch_one(pool)
            .await?;

    let questions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM qa_jobs WHERE status = 'queued'")
        .fetch_one(pool)
        .await?;

    Ok((questions, transcriptions))
}

// --- row mapping ---

fn transcription_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TranscriptionJob, sqlx::Error> {
    Ok(TranscriptionJob {
        id: parse_uuid(row.get("id"))?,
        filename: row.get("filename"),
        file_path: row.get("file_path"),
        status: parse_status(row.get("status"))?,
        progress: row.get("progress"),
        current_step: row.get("current_step"),
        raw_text: row.get("raw_text"),
        upload_date: parse_timestamp(row.get("upload_date"))?,
        process_start: parse_optional_timestamp(row.get("process_start"))?,
        process_end: parse_optional_timestamp(row.get("process_end"))?,
    })
}

fn qa_from_row(row: sqlx::sqlite::SqliteRow) -> Result<QAJob, sqlx::Error> {
    Ok(QAJob {
        id: parse_uuid(row.get("id"))?,
        transcript_id: parse_uuid(row.get("transcript_id"))?,
        question: row.get("question"),
        answer: row.get("answer"),
        context_used: row.get("context_used"),
        confidence: row.get("confidence"),
        status: parse_status(row.get("status"))?,
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

fn parse_uuid(raw: String) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_status(raw: String) -> Result<JobStatus, sqlx::Error> {
    raw.parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(e.into()))
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    raw.map(parse_timestamp).transpose()
}
