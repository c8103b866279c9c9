//! # Scheduler Loop
//!
//! A single cooperative loop polling the job store for queued work. Each
//! iteration takes at most one job and runs it to completion before looking
//! again. There are no parallel workers, so two jobs can never interleave
//! their accelerator use.
//!
//! ## Priority:
//! Q&A jobs always go first: answers are requested interactively while a
//! transcription is a long background operation. After processing any job
//! the loop immediately polls again to drain the backlog; only an empty
//! queue makes it sleep.
//!
//! ## Resilience:
//! No error escapes the loop. A failing job is recorded on the job itself
//! by its pipeline; a failing store poll is logged and the loop sleeps and
//! tries again. Shutdown is cooperative: the cancellation token is checked
//! between iterations and an in-flight job is always allowed to finish.

use crate::error::JobError;
use crate::models::{ChatModel, EmbeddingModel, SpeechModel};
use crate::store::jobs;
use crate::worker::{answer, transcribe, WorkerContext};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the scheduler until the token is cancelled.
pub async fn run<S, C, E>(ctx: WorkerContext<S, C, E>, cancel: CancellationToken)
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    info!("Background worker started");
    let idle_sleep = Duration::from_secs(ctx.config.scheduler.poll_interval_secs);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match tick(&ctx).await {
            // A job was processed; poll again immediately to drain the queue.
            Ok(true) => continue,
            // Nothing queued.
            Ok(false) => {
                if sleep_or_cancel(idle_sleep, &cancel).await {
                    break;
                }
            }
            // The backstop: store polling failed or a pipeline could not even
            // record its outcome. Log, pause, keep going.
            Err(e) => {
                error!("Worker loop error: {}", e);
                if sleep_or_cancel(idle_sleep, &cancel).await {
                    break;
                }
            }
        }
    }

    info!("Background worker stopped");
}

/// Process at most one queued job. Returns whether any job was found.
pub(crate) async fn tick<S, C, E>(ctx: &WorkerContext<S, C, E>) -> Result<bool, JobError>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    if let Some(job) = jobs::next_queued_qa(&ctx.pool).await? {
        answer::process(ctx, job).await?;
        return Ok(true);
    }

    if let Some(job) = jobs::next_queued_transcription(&ctx.pool).await? {
        transcribe::process(ctx, job).await?;
        return Ok(true);
    }

    Ok(false)
}

/// Sleep for the idle interval, waking early on cancellation. Returns true
/// when the loop should stop.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
