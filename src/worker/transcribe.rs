//! # Transcription Pipeline
//!
//! Drives one audio job end to end: decode the audio file, acquire the
//! coordinator's transcription capacity, run inference, persist the text,
//! then seed the follow-up question battery against the new transcript.
//!
//! State machine: Queued → Processing (start time clocked, step labeled)
//! → Completed or Error. On failure the message becomes the step label and
//! no questions are seeded.

use crate::audio;
use crate::error::JobError;
use crate::models::{ChatModel, EmbeddingModel, SpeechModel};
use crate::store::jobs::{self, QAJob, TranscriptionJob};
use crate::templates;
use crate::worker::WorkerContext;
use std::path::PathBuf;
use tracing::{info, warn};

/// Process one queued transcription job. The returned error only reports a
/// store failure while recording the outcome; inference failures end up on
/// the job itself.
pub async fn process<S, C, E>(
    ctx: &WorkerContext<S, C, E>,
    mut job: TranscriptionJob,
) -> Result<(), JobError>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    info!("[{}] Starting transcription", job.filename);
    job.begin_processing("Loading audio...");
    jobs::update_transcription(&ctx.pool, &job).await?;

    match run_inference(ctx, &mut job).await {
        Ok(text) => {
            job.complete(text);
            jobs::update_transcription(&ctx.pool, &job).await?;
            ctx.record(|m| m.transcriptions_completed += 1);
            info!("[{}] Transcription completed", job.filename);

            seed_questions(ctx, &job).await?;
        }
        Err(e) => {
            warn!("[{}] Transcription failed: {}", job.filename, e);
            job.fail(&e.to_string());
            jobs::update_transcription(&ctx.pool, &job).await?;
            ctx.record(|m| m.transcriptions_failed += 1);
        }
    }

    Ok(())
}

/// Decode the audio and run it through the speech model under an exclusive
/// lease. The lease is held across the whole inference call.
async fn run_inference<S, C, E>(
    ctx: &WorkerContext<S, C, E>,
    job: &mut TranscriptionJob,
) -> Result<String, JobError>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    let path = PathBuf::from(&job.file_path);
    let samples = tokio::task::spawn_blocking(move || audio::load_audio(&path))
        .await
        .map_err(|e| JobError::Inference(format!("audio decode task failed: {}", e)))?
        .map_err(|e| JobError::Inference(e.to_string()))?;

    job.current_step = "Transcribing (this may take a while)...".to_string();
    jobs::update_transcription(&ctx.pool, job).await?;

    let mut lease = ctx.coordinator.acquire_transcription().await?;

    let priming_prompt = ctx.config.transcription.priming_prompt.clone();
    let language = ctx.config.transcription.language.clone();

    // The decode is CPU/GPU-bound; run it on the blocking pool so the
    // scheduler task keeps polling responsively. The lease travels into the
    // closure and back, keeping the accelerator locked throughout.
    let (lease, result) = tokio::task::spawn_blocking(move || {
        let result = lease
            .model_mut()
            .transcribe(&samples, &priming_prompt, &language);
        (lease, result)
    })
    .await
    .map_err(|e| JobError::Inference(format!("transcription task failed: {}", e)))?;
    drop(lease);

    result
}

/// Queue one Q&A job per question template against this transcript.
async fn seed_questions<S, C, E>(
    ctx: &WorkerContext<S, C, E>,
    job: &TranscriptionJob,
) -> Result<(), JobError>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    let template_path = ctx.config.storage.question_file();
    let templates = templates::load_templates(&template_path);

    if templates.is_empty() {
        warn!(
            "[{}] No question templates available, nothing queued",
            job.filename
        );
        return Ok(());
    }

    for template in &templates {
        let qa = QAJob::new(job.id, template.question_text());
        jobs::create_qa(&ctx.pool, &qa).await?;
    }

    info!(
        "[{}] Queued {} follow-up questions",
        job.filename,
        templates.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ModelsConfig, StorageConfig};
    use crate::models::coordinator::ResourceCoordinator;
    use crate::store::jobs::JobStatus;
    use crate::store::{self, init_memory_pool};
    use crate::worker::JobMetrics;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::{Arc, RwLock};

    struct ScriptedSpeech;
    struct UnusedChat;
    struct UnusedEmbedder;

    #[async_trait]
    impl SpeechModel for ScriptedSpeech {
        async fn load(_: &ModelsConfig) -> Result<Self, JobError> {
            Ok(ScriptedSpeech)
        }

        fn transcribe(&mut self, audio: &[f32], prompt: &str, language: &str) -> Result<String, JobError> {
            assert!(!audio.is_empty());
            assert!(prompt.contains("tuberkulosis"));
            assert_eq!(language, "id");
            Ok("Nama pasien Siti, usia 30 tahun.".to_string())
        }
    }

    #[async_trait]
    impl ChatModel for UnusedChat {
        async fn load(_: &ModelsConfig) -> Result<Self, JobError> {
            Ok(UnusedChat)
        }

        fn complete(&mut self, _: &str, _: &str, _: usize, _: f64) -> Result<String, JobError> {
            unreachable!("transcription never generates")
        }
    }

    #[async_trait]
    impl EmbeddingModel for UnusedEmbedder {
        async fn load(_: &ModelsConfig) -> Result<Self, JobError> {
            Ok(UnusedEmbedder)
        }

        fn embed(&mut self, _: &str) -> Result<Vec<f32>, JobError> {
            unreachable!("transcription never embeds")
        }
    }

    /// A context whose data dir lives in a fresh temp dir.
    async fn context(
        data_dir: &std::path::Path,
    ) -> WorkerContext<ScriptedSpeech, UnusedChat, UnusedEmbedder> {
        let mut config = AppConfig::default();
        config.storage = StorageConfig {
            data_dir: data_dir.to_string_lossy().into_owned(),
        };
        let config = Arc::new(config);

        let pool = init_memory_pool().await.unwrap();
        let coordinator = Arc::new(ResourceCoordinator::new(config.models.clone()));
        WorkerContext::new(pool, coordinator, config, Arc::new(RwLock::new(JobMetrics::default())))
    }

    /// Write a raw 16-bit PCM fixture with audible content.
    fn write_pcm_fixture(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("interview.pcm");
        let samples: Vec<i16> = (0..16000)
            .map(|i| ((i as f32 / 30.0).sin() * 9000.0) as i16)
            .collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_completed_job_seeds_one_question_per_template() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;

        let mut template_file =
            std::fs::File::create(ctx.config.storage.question_file()).unwrap();
        writeln!(template_file, "Identitas|Siapa nama pasien?").unwrap();
        writeln!(template_file, "Usia|Berapa usia pasien?").unwrap();
        writeln!(template_file, "Obat|Obat apa yang diminum?").unwrap();

        let audio_path = write_pcm_fixture(dir.path());
        let job = TranscriptionJob::new(
            "interview.pcm".into(),
            audio_path.to_string_lossy().into_owned(),
            JobStatus::Queued,
            "Queued for processing...",
        );
        store::jobs::create_transcription(&ctx.pool, &job).await.unwrap();

        process(&ctx, job.clone()).await.unwrap();

        let finished = store::jobs::get_transcription(&ctx.pool, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.progress, 100);
        assert_eq!(
            finished.raw_text.as_deref(),
            Some("Nama pasien Siti, usia 30 tahun.")
        );
        assert!(finished.process_start.is_some());
        assert!(finished.process_end.is_some());

        // Exactly one queued question per template, label-prefixed.
        let questions = store::jobs::list_qa_for_transcript(&ctx.pool, job.id)
            .await
            .unwrap();
        assert_eq!(questions.len(), 3);
        assert!(questions.iter().all(|q| q.status == JobStatus::Queued));
        assert_eq!(questions[0].question, "Identitas: Siapa nama pasien?");
        assert_eq!(questions[1].question, "Usia: Berapa usia pasien?");
        assert_eq!(questions[2].question, "Obat: Obat apa yang diminum?");

        assert_eq!(ctx.metrics.read().unwrap().transcriptions_completed, 1);
    }

    #[tokio::test]
    async fn test_missing_audio_marks_error_and_seeds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;

        let mut template_file =
            std::fs::File::create(ctx.config.storage.question_file()).unwrap();
        writeln!(template_file, "Identitas|Siapa nama pasien?").unwrap();

        let job = TranscriptionJob::new(
            "ghost.wav".into(),
            dir.path().join("ghost.wav").to_string_lossy().into_owned(),
            JobStatus::Queued,
            "",
        );
        store::jobs::create_transcription(&ctx.pool, &job).await.unwrap();

        process(&ctx, job.clone()).await.unwrap();

        let failed = store::jobs::get_transcription(&ctx.pool, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert!(failed.current_step.starts_with("Error:"));
        assert!(failed.raw_text.is_none());

        let questions = store::jobs::list_qa_for_transcript(&ctx.pool, job.id)
            .await
            .unwrap();
        assert!(questions.is_empty());

        assert_eq!(ctx.metrics.read().unwrap().transcriptions_failed, 1);
    }

    #[tokio::test]
    async fn test_missing_templates_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;

        let audio_path = write_pcm_fixture(dir.path());
        let job = TranscriptionJob::new(
            "interview.pcm".into(),
            audio_path.to_string_lossy().into_owned(),
            JobStatus::Queued,
            "",
        );
        store::jobs::create_transcription(&ctx.pool, &job).await.unwrap();

        process(&ctx, job.clone()).await.unwrap();

        let finished = store::jobs::get_transcription(&ctx.pool, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(store::jobs::list_qa_for_transcript(&ctx.pool, job.id)
            .await
            .unwrap()
            .is_empty());
    }
}
