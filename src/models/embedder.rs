//! # Sentence Embedding Backend
//!
//! BERT sentence embedder (multilingual MiniLM) used to rank transcript
//! sentences against a question. Always runs on the CPU: it is small enough
//! that it never needs the accelerator and must stay available while a heavy
//! model occupies it.
//!
//! Embeddings are mean-pooled over non-padding positions and L2-normalized,
//! so ranking can use a plain dot product as cosine similarity.

use crate::config::ModelsConfig;
use crate::error::JobError;
use crate::models::EmbeddingModel;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer};

/// A loaded sentence embedder.
pub struct SentenceEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl SentenceEmbedder {
    /// Download and load the embedding model (CPU only).
    pub async fn fetch(repo_name: &str) -> Result<Self> {
        tracing::info!("Loading sentence embedder {}", repo_name);
        let start_time = std::time::Instant::now();
        let device = Device::Cpu;

        let api = hf_hub::api::tokio::ApiBuilder::new()
            .with_progress(false)
            .build()?;
        let repo = api.model(repo_name.to_string());

        let config_path = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", repo_name, e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", repo_name, e))?;
        let weights_path = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", repo_name, e))?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;

        tracing::info!(
            "Sentence embedder loaded on cpu in {:.2}s",
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    /// Embed a batch of texts into L2-normalized vectors.
    pub fn encode(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let ids = encodings
            .iter()
            .map(|e| Tensor::new(e.get_ids(), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let masks = encodings
            .iter()
            .map(|e| Tensor::new(e.get_attention_mask(), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let token_ids = Tensor::stack(&ids, 0)?;
        let attention_mask = Tensor::stack(&masks, 0)?;
        let token_type_ids = token_ids.zeros_like()?;

        let hidden = self
            .model
            .forward(&token_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean-pool over real (non-padding) positions.
        let mask = attention_mask
            .to_dtype(DTYPE)?
            .unsqueeze(2)?
            .broadcast_as(hidden.shape())?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
        let pooled = summed.broadcast_div(&counts)?;

        // L2 normalize so downstream cosine similarity is a dot product.
        let norms = pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        let normalized = pooled.broadcast_div(&norms)?;

        Ok(normalized.to_vec2::<f32>()?)
    }
}

#[async_trait]
impl EmbeddingModel for SentenceEmbedder {
    async fn load(models: &ModelsConfig) -> Result<Self, JobError> {
        SentenceEmbedder::fetch(&models.embedding_repo)
            .await
            .map_err(|e| JobError::ResourceLoad(e.to_string()))
    }

    fn embed(&mut self, text: &str) -> Result<Vec<f32>, JobError> {
        let mut vectors = self
            .encode(&[text.to_string()])
            .map_err(JobError::from_backend)?;
        vectors
            .pop()
            .ok_or_else(|| JobError::Inference("Embedder returned no vector".into()))
    }

    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, JobError> {
        self.encode(texts).map_err(JobError::from_backend)
    }
}
