//! # Resource Coordinator
//!
//! Owns the lazy-loaded handles to the two heavy model classes and rations
//! the single accelerator between them.
//!
//! ## Guarantees:
//! - At most one of {speech model, chat model} is resident in accelerator
//!   memory at any instant. Acquiring one class while the other is loaded
//!   unloads the other first (the handle is explicitly taken out of its slot
//!   and dropped, releasing its device buffers) before the requested class
//!   is loaded.
//! - Every accelerator-touching call (load, unload, and the inference call
//!   itself) runs under one process-wide async mutex. A lease holds that
//!   mutex from acquisition until the lease is dropped, so the inference it
//!   guards can never interleave with another job's accelerator work.
//! - Acquisition is idempotent: if the requested class is already loaded the
//!   live handle is reused without reloading.
//! - A load failure surfaces as a typed [`JobError`] and releases the lock;
//!   the coordinator never retries loads itself.
//!
//! The embedding model is independent: always CPU-resident, behind its own
//! lock, never touching the accelerator exclusion.

use crate::config::ModelsConfig;
use crate::error::JobError;
use crate::models::{ChatModel, EmbeddingModel, SpeechModel};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

/// The two mutually-exclusive heavy slots, protected by the accelerator lock.
struct HeavySlots<S, C> {
    speech: Option<S>,
    chat: Option<C>,
}

/// What is currently resident, for the health endpoint and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Residency {
    pub speech: bool,
    pub chat: bool,
    pub embedder: bool,
}

/// Shared coordinator; clone-cheap via the inner `Arc`s.
pub struct ResourceCoordinator<S, C, E> {
    slots: Arc<Mutex<HeavySlots<S, C>>>,
    embedder: Arc<Mutex<Option<E>>>,
    models: ModelsConfig,
}

/// Exclusive access to the loaded speech model. Holds the accelerator lock
/// for its whole lifetime.
pub struct SpeechLease<S, C> {
    guard: OwnedMutexGuard<HeavySlots<S, C>>,
}

impl<S, C> SpeechLease<S, C> {
    pub fn model_mut(&mut self) -> &mut S {
        self.guard
            .speech
            .as_mut()
            .expect("speech lease exists only while the slot is filled")
    }
}

/// Exclusive access to the loaded chat model. Holds the accelerator lock
/// for its whole lifetime.
pub struct ChatLease<S, C> {
    guard: OwnedMutexGuard<HeavySlots<S, C>>,
}

impl<S, C> ChatLease<S, C> {
    pub fn model_mut(&mut self) -> &mut C {
        self.guard
            .chat
            .as_mut()
            .expect("chat lease exists only while the slot is filled")
    }
}

/// Access to the lazily-loaded embedding model (its own lock, not the
/// accelerator one).
pub struct EmbedderLease<E> {
    guard: OwnedMutexGuard<Option<E>>,
}

impl<E> EmbedderLease<E> {
    pub fn model_mut(&mut self) -> &mut E {
        self.guard
            .as_mut()
            .expect("embedder lease exists only while the slot is filled")
    }
}

impl<S, C, E> ResourceCoordinator<S, C, E>
where
    S: SpeechModel,
    C: ChatModel,
    E: EmbeddingModel,
{
    pub fn new(models: ModelsConfig) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HeavySlots {
                speech: None,
                chat: None,
            })),
            embedder: Arc::new(Mutex::new(None)),
            models,
        }
    }

    /// Block until exclusive transcription capacity is available.
    ///
    /// Unloads the chat model if it occupies the accelerator, then loads the
    /// speech model if it isn't already live.
    pub async fn acquire_transcription(&self) -> Result<SpeechLease<S, C>, JobError> {
        let mut guard = self.slots.clone().lock_owned().await;

        if let Some(chat) = guard.chat.take() {
            info!("Unloading generation model to free accelerator memory");
            drop(chat);
        }

        if guard.speech.is_none() {
            info!("Loading transcription model ({})", self.models.whisper_model);
            guard.speech = Some(S::load(&self.models).await?);
        }

        Ok(SpeechLease { guard })
    }

    /// Block until exclusive generation capacity is available.
    ///
    /// Mirror image of [`Self::acquire_transcription`].
    pub async fn acquire_generation(&self) -> Result<ChatLease<S, C>, JobError> {
        let mut guard = self.slots.clone().lock_owned().await;

        if let Some(speech) = guard.speech.take() {
            info!("Unloading transcription model to free accelerator memory");
            drop(speech);
        }

        if guard.chat.is_none() {
            info!("Loading generation model ({})", self.models.llm_file);
            guard.chat = Some(C::load(&self.models).await?);
        }

        Ok(ChatLease { guard })
    }

    /// Get the embedding model, loading it on first use.
    pub async fn acquire_embedder(&self) -> Result<EmbedderLease<E>, JobError> {
        let mut guard = self.embedder.clone().lock_owned().await;

        if guard.is_none() {
            info!("Loading embedding model ({})", self.models.embedding_repo);
            *guard = Some(E::load(&self.models).await?);
        }

        Ok(EmbedderLease { guard })
    }

    /// Drop every loaded model (used at shutdown).
    pub async fn unload_all(&self) {
        let mut guard = self.slots.lock().await;
        if guard.speech.take().is_some() {
            info!("Unloaded transcription model");
        }
        if guard.chat.take().is_some() {
            info!("Unloaded generation model");
        }
        drop(guard);

        let mut embedder = self.embedder.lock().await;
        if embedder.take().is_some() {
            info!("Unloaded embedding model");
        }
    }

    /// Snapshot of which models are currently resident.
    pub async fn residency(&self) -> Residency {
        let slots = self.slots.lock().await;
        let embedder = self.embedder.lock().await;
        Residency {
            speech: slots.speech.is_some(),
            chat: slots.chat.is_some(),
            embedder: embedder.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Declares a speech/chat stub pair whose loads are counted in the given
    /// statics, so each test owns its counters and can run in parallel.
    macro_rules! counting_stubs {
        ($speech:ident, $chat:ident, $speech_loads:ident, $chat_loads:ident) => {
            static $speech_loads: AtomicUsize = AtomicUsize::new(0);
            static $chat_loads: AtomicUsize = AtomicUsize::new(0);

            struct $speech;
            struct $chat;

            #[async_trait]
            impl SpeechModel for $speech {
                async fn load(_models: &ModelsConfig) -> Result<Self, JobError> {
                    $speech_loads.fetch_add(1, Ordering::SeqCst);
                    Ok($speech)
                }

                fn transcribe(&mut self, _: &[f32], _: &str, _: &str) -> Result<String, JobError> {
                    Ok("halo".to_string())
                }
            }

            #[async_trait]
            impl ChatModel for $chat {
                async fn load(_models: &ModelsConfig) -> Result<Self, JobError> {
                    $chat_loads.fetch_add(1, Ordering::SeqCst);
                    Ok($chat)
                }

                fn complete(
                    &mut self,
                    _: &str,
                    _: &str,
                    _: usize,
                    _: f64,
                ) -> Result<String, JobError> {
                    Ok("jawaban".to_string())
                }
            }
        };
    }

    counting_stubs!(StubSpeech, StubChat, SPEECH_LOADS, CHAT_LOADS);

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingModel for StubEmbedder {
        async fn load(_models: &ModelsConfig) -> Result<Self, JobError> {
            Ok(StubEmbedder)
        }

        fn embed(&mut self, _: &str) -> Result<Vec<f32>, JobError> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct FailingSpeech;

    #[async_trait]
    impl SpeechModel for FailingSpeech {
        async fn load(_models: &ModelsConfig) -> Result<Self, JobError> {
            Err(JobError::ResourceLoad("artifact missing".into()))
        }

        fn transcribe(&mut self, _: &[f32], _: &str, _: &str) -> Result<String, JobError> {
            unreachable!("load never succeeds")
        }
    }

    fn coordinator() -> ResourceCoordinator<StubSpeech, StubChat, StubEmbedder> {
        ResourceCoordinator::new(AppConfig::default().models)
    }

    #[tokio::test]
    async fn test_at_most_one_heavy_model_resident() {
        let coord = coordinator();

        let lease = coord.acquire_transcription().await.unwrap();
        drop(lease);
        let r = coord.residency().await;
        assert!(r.speech && !r.chat);

        let lease = coord.acquire_generation().await.unwrap();
        drop(lease);
        let r = coord.residency().await;
        assert!(!r.speech && r.chat);

        let lease = coord.acquire_transcription().await.unwrap();
        drop(lease);
        let r = coord.residency().await;
        assert!(r.speech && !r.chat);
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        counting_stubs!(IdemSpeech, IdemChat, IDEM_SPEECH_LOADS, IDEM_CHAT_LOADS);
        let coord: ResourceCoordinator<IdemSpeech, IdemChat, StubEmbedder> =
            ResourceCoordinator::new(AppConfig::default().models);

        for _ in 0..3 {
            let mut lease = coord.acquire_transcription().await.unwrap();
            lease.model_mut().transcribe(&[], "", "id").unwrap();
        }

        // Three acquisitions of the same class share one load.
        assert_eq!(IDEM_SPEECH_LOADS.load(Ordering::SeqCst), 1);
        assert_eq!(IDEM_CHAT_LOADS.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_switching_classes_reloads() {
        counting_stubs!(SwapSpeech, SwapChat, SWAP_SPEECH_LOADS, SWAP_CHAT_LOADS);
        let coord: ResourceCoordinator<SwapSpeech, SwapChat, StubEmbedder> =
            ResourceCoordinator::new(AppConfig::default().models);

        drop(coord.acquire_transcription().await.unwrap());
        drop(coord.acquire_generation().await.unwrap());
        drop(coord.acquire_transcription().await.unwrap());

        assert_eq!(SWAP_SPEECH_LOADS.load(Ordering::SeqCst), 2);
        assert_eq!(SWAP_CHAT_LOADS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_failure_releases_lock() {
        let coord: ResourceCoordinator<FailingSpeech, StubChat, StubEmbedder> =
            ResourceCoordinator::new(AppConfig::default().models);

        let err = coord.acquire_transcription().await.err().unwrap();
        assert!(matches!(err, JobError::ResourceLoad(_)));

        // The lock must have been released by the failed acquisition, and
        // the other class must still be acquirable.
        let lease = coord.acquire_generation().await;
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn test_embedder_is_outside_the_exclusion() {
        let coord = coordinator();

        // Holding a heavy lease must not block embedder access.
        let lease = coord.acquire_generation().await.unwrap();
        let mut embedder = coord.acquire_embedder().await.unwrap();
        assert_eq!(embedder.model_mut().embed("halo").unwrap(), vec![1.0, 0.0]);
        drop(embedder);
        drop(lease);

        let r = coord.residency().await;
        assert!(r.embedder);
    }

    #[tokio::test]
    async fn test_unload_all_clears_residency() {
        let coord = coordinator();
        drop(coord.acquire_transcription().await.unwrap());
        drop(coord.acquire_embedder().await.unwrap());

        coord.unload_all().await;
        let r = coord.residency().await;
        assert!(!r.speech && !r.chat && !r.embedder);
    }
}
