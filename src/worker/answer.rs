//! # Q&A Pipeline
//!
//! Drives one question job end to end: gate on the owning transcript,
//! rank the transcript's sentences against the question, then walk the
//! adaptive context schedule: generate, and on a context-budget rejection
//! retry with the next (stricter) threshold's smaller context. A successful
//! answer is persisted together with its confidence score and the context
//! that actually produced it.
//!
//! The retry decision is driven by the typed error the generation backend
//! returns, not by catching and re-parsing arbitrary failures: only the
//! context-too-large class is retryable, and only while thresholds remain.

use crate::error::JobError;
use crate::models::{ChatModel, EmbeddingModel, SpeechModel};
use crate::retrieval::context::ContextSchedule;
use crate::retrieval::{self, RankedSentence};
use crate::scoring;
use crate::store::jobs::{self, QAJob};
use crate::worker::WorkerContext;
use tracing::{info, warn};

/// System instruction for the generation model: answer strictly from the
/// supplied context, in Indonesian, with an explicit fallback phrase when
/// the information is absent.
const SYSTEM_PROMPT: &str = "Anda adalah asisten medis yang membantu menganalisis transkrip \
wawancara pasien TB.\n\
Tugas anda adalah menjawab pertanyaan BERDASARKAN KONTEKS yang diberikan saja.\n\
JIKA JAWABAN TIDAK ADA DI DALAM KONTEKS, KATAKAN: 'Maaf, informasi tersebut tidak ditemukan \
dalam transkrip ini.'\n\
JANGAN MENGARANG JAWABAN atau menggunakan pengetahuan luar.";

fn user_prompt(context: &str, question: &str) -> String {
    format!(
        "Konteks Transkrip:\n{}\n\nPertanyaan: {}\nJawaban:",
        context, question
    )
}

/// Process one queued Q&A job. The returned error only reports a store
/// failure while recording the outcome; answer failures end up on the job.
pub async fn process<S, C, E>(ctx: &WorkerContext<S, C, E>, mut job: QAJob) -> Result<(), JobError>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    info!("[QA] Processing question: '{}'", job.question);
    job.begin_processing();
    jobs::update_qa(&ctx.pool, &job).await?;

    // A question can only be answered once its transcript produced text.
    let transcript = jobs::get_transcription(&ctx.pool, job.transcript_id).await?;
    let transcript_text = transcript
        .and_then(|t| t.raw_text)
        .filter(|t| !t.trim().is_empty());

    let Some(transcript_text) = transcript_text else {
        job.fail("Maaf, transkrip belum selesai atau tidak ditemukan.".to_string());
        jobs::update_qa(&ctx.pool, &job).await?;
        ctx.record(|m| m.answers_failed += 1);
        return Ok(());
    };

    match run_answer(ctx, &mut job, &transcript_text).await {
        Ok(()) => {
            ctx.record(|m| m.answers_completed += 1);
            info!("[QA] Completed: '{}'", job.question);
        }
        Err(e) => {
            warn!("[QA] Failed: '{}': {}", job.question, e);
            let detail = match &e {
                JobError::ContextTooLarge(_) => format!("Error (Context Limit): {}", e),
                _ => format!("Error: {}", e),
            };
            job.fail(detail);
            jobs::update_qa(&ctx.pool, &job).await?;
            ctx.record(|m| m.answers_failed += 1);
        }
    }

    Ok(())
}

/// Rank sentences, then walk the threshold schedule until generation
/// succeeds or the schedule is exhausted. Persists completion itself.
async fn run_answer<S, C, E>(
    ctx: &WorkerContext<S, C, E>,
    job: &mut QAJob,
    transcript_text: &str,
) -> Result<(), JobError>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    let ranked = rank_transcript(ctx, transcript_text, &job.question).await?;
    let schedule = ContextSchedule::new(ranked, ctx.config.retrieval.thresholds.clone());

    // One lease covers the whole retry walk; retries only ever shrink the
    // prompt, they never touch a different model class.
    let mut lease = ctx.coordinator.acquire_generation().await?;

    let max_tokens = ctx.config.generation.max_tokens;
    let temperature = ctx.config.generation.temperature;

    for attempt in schedule.attempts() {
        info!(
            "[QA] Attempt at threshold {} with {} evidence sentences ({} chars of context)",
            attempt.threshold,
            attempt.evidence_count,
            attempt.context.len()
        );

        // Record the context actually used, overwriting earlier attempts.
        job.context_used = Some(attempt.context.clone());
        jobs::update_qa(&ctx.pool, job).await?;

        let prompt = user_prompt(&attempt.context, &job.question);
        let (returned_lease, result) = tokio::task::spawn_blocking(move || {
            let result =
                lease
                    .model_mut()
                    .complete(SYSTEM_PROMPT, &prompt, max_tokens, temperature);
            (lease, result)
        })
        .await
        .map_err(|e| JobError::Inference(format!("generation task failed: {}", e)))?;
        lease = returned_lease;

        match result {
            Ok(answer) => {
                let confidence = scoring::confidence(&answer, &attempt.context);
                job.complete(answer, confidence);
                jobs::update_qa(&ctx.pool, job).await?;
                return Ok(());
            }
            Err(e) if e.is_retryable_with_smaller_context() && !attempt.is_last => {
                warn!(
                    "[QA] Context rejected at threshold {} ({}); retrying with a stricter cutoff",
                    attempt.threshold, e
                );
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    // Unreachable with a validated (non-empty) threshold list; the last
    // attempt either returns or errors above.
    Err(JobError::Inference(
        "no retrieval thresholds configured".to_string(),
    ))
}

/// Segment the transcript and rank every sentence against the question.
/// Embedding runs on the CPU-resident embedder, outside the accelerator
/// exclusion, on the blocking pool.
async fn rank_transcript<S, C, E>(
    ctx: &WorkerContext<S, C, E>,
    transcript_text: &str,
    question: &str,
) -> Result<Vec<RankedSentence>, JobError>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    let sentences = retrieval::split_sentences(transcript_text);
    if sentences.is_empty() {
        return Ok(Vec::new());
    }

    let mut embedder = ctx.coordinator.acquire_embedder().await?;
    let question = question.to_string();

    let (_embedder, ranked) = tokio::task::spawn_blocking(move || {
        let result = (|| {
            let question_embedding = embedder.model_mut().embed(&question)?;
            let sentence_embeddings = embedder.model_mut().embed_batch(&sentences)?;
            Ok::<_, JobError>(retrieval::rank_sentences(
                &question_embedding,
                sentences,
                &sentence_embeddings,
            ))
        })();
        (embedder, result)
    })
    .await
    .map_err(|e| JobError::Inference(format!("embedding task failed: {}", e)))?;

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ModelsConfig};
    use crate::models::coordinator::ResourceCoordinator;
    use crate::retrieval::NO_CONTEXT_PLACEHOLDER;
    use crate::store::jobs::{JobStatus, TranscriptionJob};
    use crate::store::{self, init_memory_pool};
    use crate::worker::JobMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, RwLock};

    struct UnusedSpeech;

    #[async_trait]
    impl SpeechModel for UnusedSpeech {
        async fn load(_: &ModelsConfig) -> Result<Self, JobError> {
            Ok(UnusedSpeech)
        }

        fn transcribe(&mut self, _: &[f32], _: &str, _: &str) -> Result<String, JobError> {
            unreachable!("answering never transcribes")
        }
    }

    /// Maps each keyword to its own axis (and keyword-free text to a third),
    /// giving deterministic similarity ranks without a real model: text only
    /// resembles the question when they share a keyword.
    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingModel for KeywordEmbedder {
        async fn load(_: &ModelsConfig) -> Result<Self, JobError> {
            Ok(KeywordEmbedder)
        }

        fn embed(&mut self, text: &str) -> Result<Vec<f32>, JobError> {
            let lower = text.to_lowercase();
            let nama = lower.contains("nama") as u8 as f32;
            let alergi = lower.contains("alergi") as u8 as f32;
            let neither = (nama == 0.0 && alergi == 0.0) as u8 as f32;
            Ok(vec![nama, alergi, neither])
        }
    }

    /// Chat stand-in driven by a script of responses, one per call.
    struct ScriptedChat;

    type ChatScript = Vec<Result<String, JobError>>;

    static SCRIPT: Mutex<ChatScript> = Mutex::new(Vec::new());
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    static LAST_PROMPT: Mutex<String> = Mutex::new(String::new());

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn load(_: &ModelsConfig) -> Result<Self, JobError> {
            Ok(ScriptedChat)
        }

        fn complete(&mut self, _: &str, user: &str, _: usize, _: f64) -> Result<String, JobError> {
            CALLS.fetch_add(1, Ordering::SeqCst);
            *LAST_PROMPT.lock().unwrap() = user.to_string();
            let mut script = SCRIPT.lock().unwrap();
            if script.is_empty() {
                Ok("jawaban".to_string())
            } else {
                script.remove(0)
            }
        }
    }

    /// Scripted-chat tests share the statics above, so they must not run
    /// concurrently with each other.
    static SERIAL: Mutex<()> = Mutex::new(());

    async fn context() -> WorkerContext<UnusedSpeech, ScriptedChat, KeywordEmbedder> {
        let config = Arc::new(AppConfig::default());
        let pool = init_memory_pool().await.unwrap();
        let coordinator = Arc::new(ResourceCoordinator::new(config.models.clone()));
        WorkerContext::new(pool, coordinator, config, Arc::new(RwLock::new(JobMetrics::default())))
    }

    async fn seeded_job(
        ctx: &WorkerContext<UnusedSpeech, ScriptedChat, KeywordEmbedder>,
        transcript_text: Option<&str>,
        question: &str,
    ) -> QAJob {
        let mut transcript =
            TranscriptionJob::new("a.wav".into(), "/a.wav".into(), JobStatus::Queued, "");
        if let Some(text) = transcript_text {
            transcript.begin_processing("");
            transcript.complete(text.to_string());
        }
        store::jobs::create_transcription(&ctx.pool, &transcript).await.unwrap();

        let job = QAJob::new(transcript.id, question.to_string());
        store::jobs::create_qa(&ctx.pool, &job).await.unwrap();
        job
    }

    fn set_script(script: ChatScript) {
        *SCRIPT.lock().unwrap() = script;
        CALLS.store(0, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_relevant_sentence_becomes_context_and_scores_full_confidence() {
        let _serial = SERIAL.lock().unwrap();
        let ctx = context().await;
        let job = seeded_job(
            &ctx,
            Some("Nama pasien Siti, usia 30 tahun. Cuaca hari ini cerah."),
            "Siapa nama pasien?",
        )
        .await;

        set_script(vec![Ok("Siti".to_string())]);
        process(&ctx, job.clone()).await.unwrap();

        let done = store::jobs::get_qa(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.answer.as_deref(), Some("Siti"));
        // Only the name sentence ranks above 0.3.
        assert_eq!(
            done.context_used.as_deref(),
            Some("Nama pasien Siti, usia 30 tahun.")
        );
        // Every answer token appears in the context.
        assert_eq!(done.confidence, Some(1.0));

        // The user prompt carried the retrieved context and the question.
        let prompt = LAST_PROMPT.lock().unwrap().clone();
        assert!(prompt.contains("Konteks Transkrip:"));
        assert!(prompt.contains("Nama pasien Siti, usia 30 tahun."));
        assert!(prompt.contains("Pertanyaan: Siapa nama pasien?"));
    }

    #[tokio::test]
    async fn test_unrelated_question_gets_placeholder_and_fallback() {
        let _serial = SERIAL.lock().unwrap();
        let ctx = context().await;
        let job = seeded_job(
            &ctx,
            Some("Obat diminum setiap pagi. Kontrol bulan depan."),
            "Apakah ada riwayat alergi?",
        )
        .await;

        set_script(vec![Ok(
            "Maaf, informasi tersebut tidak ditemukan dalam transkrip ini.".to_string(),
        )]);
        process(&ctx, job.clone()).await.unwrap();

        let done = store::jobs::get_qa(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.context_used.as_deref(), Some(NO_CONTEXT_PLACEHOLDER));
        // The fallback phrase is treated as maximally reliable.
        assert_eq!(done.confidence, Some(1.0));
    }

    #[tokio::test]
    async fn test_context_rejection_retries_with_stricter_threshold() {
        let _serial = SERIAL.lock().unwrap();
        let ctx = context().await;
        let job = seeded_job(
            &ctx,
            Some("Nama pasien Siti. Cuaca cerah."),
            "Siapa nama pasien?",
        )
        .await;

        set_script(vec![
            Err(JobError::ContextTooLarge("prompt too long".into())),
            Ok("Siti".to_string()),
        ]);
        process(&ctx, job.clone()).await.unwrap();

        let done = store::jobs::get_qa(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        // The recorded context belongs to the second (successful) attempt.
        assert_eq!(
            done.context_used.as_deref(),
            Some("Nama pasien Siti.")
        );
    }

    #[tokio::test]
    async fn test_exhausted_thresholds_fail_with_last_context_recorded() {
        let _serial = SERIAL.lock().unwrap();
        let ctx = context().await;
        let job = seeded_job(
            &ctx,
            Some("Nama pasien Siti. Cuaca cerah."),
            "Siapa nama pasien?",
        )
        .await;

        set_script(vec![
            Err(JobError::ContextTooLarge("still too long".into())),
            Err(JobError::ContextTooLarge("still too long".into())),
        ]);
        process(&ctx, job.clone()).await.unwrap();

        let done = store::jobs::get_qa(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Error);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert!(done.answer.unwrap().starts_with("Error (Context Limit):"));
        // The strictest attempt's context stays recorded.
        assert_eq!(done.context_used.as_deref(), Some("Nama pasien Siti."));
        assert_eq!(ctx.metrics.read().unwrap().answers_failed, 1);
    }

    #[tokio::test]
    async fn test_accelerator_failure_is_not_retried() {
        let _serial = SERIAL.lock().unwrap();
        let ctx = context().await;
        let job = seeded_job(&ctx, Some("Nama pasien Siti."), "Siapa nama pasien?").await;

        set_script(vec![Err(JobError::AcceleratorExhausted("oom".into()))]);
        process(&ctx, job.clone()).await.unwrap();

        let done = store::jobs::get_qa(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Error);
        // A single call: out-of-memory aborts instead of walking thresholds.
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_question_without_transcript_text_fails_cleanly() {
        let _serial = SERIAL.lock().unwrap();
        let ctx = context().await;
        let job = seeded_job(&ctx, None, "Siapa nama pasien?").await;

        set_script(Vec::new());
        process(&ctx, job.clone()).await.unwrap();

        let done = store::jobs::get_qa(&ctx.pool, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Error);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(
            done.answer.as_deref(),
            Some("Maaf, transkrip belum selesai atau tidak ditemukan.")
        );
    }
}
