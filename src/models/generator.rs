//! # Text Generation Backend
//!
//! Runs a quantized instruct model (GGUF) with candle for the Q&A answers.
//!
//! ## Context budget:
//! The prompt is tokenized before inference and rejected with the typed
//! context-too-large error if it cannot fit in the model's window alongside
//! the requested answer budget. The adaptive retrieval loop upstream reacts
//! to exactly that error class by shrinking its evidence set, so the check
//! must be arithmetic and deterministic, not a parsed backend message.
//!
//! Sampling uses a fixed seed; with the low deployment temperature the
//! answers are reproducible for identical prompts.

use crate::config::ModelsConfig;
use crate::device;
use crate::error::JobError;
use crate::models::ChatModel;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_qwen2::ModelWeights;
use tokenizers::Tokenizer;

/// Fixed sampling seed so identical prompts sample identically.
const SAMPLE_SEED: u64 = 299792458;

/// A loaded chat model ready for completion calls.
pub struct TextGenerator {
    model: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    context_window: usize,
    eos_tokens: Vec<u32>,
}

impl TextGenerator {
    /// Download the GGUF weights and tokenizer, then load onto the device.
    pub async fn fetch(models: &ModelsConfig, device: Device) -> Result<Self> {
        tracing::info!("Loading chat model {} / {}", models.llm_repo, models.llm_file);
        let start_time = std::time::Instant::now();

        let api = hf_hub::api::tokio::ApiBuilder::new()
            .with_progress(false)
            .build()?;

        let weights_path = api
            .model(models.llm_repo.clone())
            .get(&models.llm_file)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to download {} from {}: {}",
                    models.llm_file,
                    models.llm_repo,
                    e
                )
            })?;

        let tokenizer_path = api
            .model(models.llm_tokenizer_repo.clone())
            .get("tokenizer.json")
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to download tokenizer.json from {}: {}",
                    models.llm_tokenizer_repo,
                    e
                )
            })?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let mut weights_file = std::fs::File::open(&weights_path)?;
        let content = gguf_file::Content::read(&mut weights_file)
            .map_err(|e| anyhow!("Failed to parse GGUF {}: {}", weights_path.display(), e))?;

        // Prefer the window the checkpoint declares about itself.
        let context_window = content
            .metadata
            .get("qwen2.context_length")
            .and_then(|v| v.to_u64().ok())
            .map(|v| v as usize)
            .unwrap_or(models.llm_context_window);

        let model = ModelWeights::from_gguf(content, &mut weights_file, &device)?;

        let eos_tokens = ["<|im_end|>", "<|endoftext|>"]
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect::<Vec<_>>();
        if eos_tokens.is_empty() {
            return Err(anyhow!("Tokenizer defines no end-of-turn token"));
        }

        tracing::info!(
            "Chat model loaded on {} in {:.2}s (context window {})",
            device::device_label(&device),
            start_time.elapsed().as_secs_f64(),
            context_window
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            context_window,
            eos_tokens,
        })
    }

    /// Run one completion; see [`ChatModel::complete`] for the contract.
    pub fn run(
        &mut self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: usize,
        temperature: f64,
    ) -> Result<String, JobError> {
        let prompt = format!(
            "<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
            system_prompt, user_prompt
        );

        let encoded = self
            .tokenizer
            .encode(prompt.as_str(), true)
            .map_err(|e| JobError::Inference(format!("Prompt tokenization failed: {}", e)))?;
        let prompt_tokens = encoded.get_ids().to_vec();

        if prompt_tokens.len() + max_tokens > self.context_window {
            return Err(JobError::ContextTooLarge(format!(
                "prompt of {} tokens plus {} answer tokens exceeds the {}-token window",
                prompt_tokens.len(),
                max_tokens,
                self.context_window
            )));
        }

        self.decode(&prompt_tokens, max_tokens, temperature)
            .map_err(JobError::from_backend)
    }

    fn decode(&mut self, prompt_tokens: &[u32], max_tokens: usize, temperature: f64) -> Result<String> {
        let temperature = if temperature > 0.0 {
            Some(temperature)
        } else {
            None
        };
        let mut sampler = LogitsProcessor::new(SAMPLE_SEED, temperature, None);

        // Prefill with the whole prompt, then feed one token at a time.
        let input = Tensor::new(prompt_tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, 0)?.squeeze(0)?;
        let mut next_token = sampler.sample(&logits)?;

        let mut output_tokens = Vec::with_capacity(max_tokens);
        for index in 0..max_tokens {
            if self.eos_tokens.contains(&next_token) {
                break;
            }
            output_tokens.push(next_token);

            let input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, prompt_tokens.len() + index)?
                .squeeze(0)?;
            next_token = sampler.sample(&logits)?;
        }

        let text = self
            .tokenizer
            .decode(&output_tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl ChatModel for TextGenerator {
    async fn load(models: &ModelsConfig) -> Result<Self, JobError> {
        let device = device::device_from_config(&models.device);

        TextGenerator::fetch(models, device).await.map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("out of memory") {
                JobError::AcceleratorExhausted(msg)
            } else {
                JobError::ResourceLoad(msg)
            }
        })
    }

    fn complete(
        &mut self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: usize,
        temperature: f64,
    ) -> Result<String, JobError> {
        self.run(system_prompt, user_prompt, max_tokens, temperature)
    }
}
