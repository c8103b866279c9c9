//! # Job Store
//!
//! SQLite-backed persistence for transcription and Q&A jobs. The rest of the
//! application treats this module as a plain record store: create, fetch by
//! id, fetch the next queued job of a type, update, delete. No transactional
//! multi-row guarantees are needed beyond a single job's status update.

pub mod jobs;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (or create) the job database and make sure the schema exists.
pub async fn init_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to job store: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// An in-memory store with the full schema, for tests.
///
/// Capped at a single connection: every SQLite `:memory:` connection is its
/// own database, so a larger pool would scatter rows across databases.
#[cfg(test)]
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create the job tables if they don't exist.
async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcription_jobs (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            file_path TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            current_step TEXT NOT NULL DEFAULT '',
            raw_text TEXT,
            upload_date TEXT NOT NULL,
            process_start TEXT,
            process_end TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS qa_jobs (
            id TEXT PRIMARY KEY,
            transcript_id TEXT NOT NULL,
            question TEXT NOT NULL,
            answer TEXT,
            context_used TEXT,
            confidence REAL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Job store tables initialized (transcription_jobs, qa_jobs)");

    Ok(())
}
