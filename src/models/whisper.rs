//! # Whisper Transcription Backend
//!
//! Loads a Whisper checkpoint with candle and decodes Indonesian interview
//! audio with a domain priming prompt.
//!
//! ## Loading process:
//! 1. Download config/tokenizer/weights from HuggingFace (cached locally)
//! 2. Build the mel filter bank for the model's bin count
//! 3. Initialize the model on the selected device
//!
//! ## Decoding:
//! Greedy decode with a repetition guard. The priming prompt is injected
//! through the `<|startofprev|>` channel, which is how Whisper biases its
//! vocabulary toward domain terms without changing the audio path.

use crate::audio::TARGET_SAMPLE_RATE;
use crate::config::ModelsConfig;
use crate::device;
use crate::error::JobError;
use crate::models::SpeechModel;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use tokenizers::Tokenizer;

/// Available Whisper checkpoint sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository for the multilingual checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown Whisper model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Whisper's 30-second window in samples at 16 kHz.
const WINDOW_SAMPLES: usize = 30 * TARGET_SAMPLE_RATE as usize;

/// Frames per 30-second window (10 ms hop).
const N_FRAMES: usize = 3000;

/// Decode budget per window.
const MAX_DECODE_TOKENS: usize = 224;

/// A loaded Whisper model ready for transcription.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
}

impl WhisperModel {
    /// Download and load a Whisper checkpoint.
    pub async fn fetch(size: ModelSize, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper {} from {}", size, size.repo_name());
        let start_time = std::time::Instant::now();

        let api = hf_hub::api::tokio::ApiBuilder::new()
            .with_progress(false)
            .build()?;
        let repo = api.model(size.repo_name().to_string());

        let config_path = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let weights_path = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let mel_filters = mel_filter_bank(config.num_mel_bins as usize);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        tracing::info!(
            "Whisper {} loaded on {} in {:.2}s",
            size,
            device::device_label(&device),
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            tokenizer,
            mel_filters,
        })
    }

    /// Transcribe mono 16 kHz samples.
    ///
    /// Audio longer than one window is processed in 30-second chunks and the
    /// chunk texts are concatenated.
    pub fn run(&mut self, audio: &[f32], priming_prompt: &str, language: &str) -> Result<String> {
        if audio.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        if audio.len() < TARGET_SAMPLE_RATE as usize {
            tracing::warn!("Audio is shorter than 1 second, transcription may be inaccurate");
        }

        let mut pieces = Vec::new();
        for chunk in audio.chunks(WINDOW_SAMPLES) {
            let text = self.transcribe_window(chunk, priming_prompt, language)?;
            if !text.is_empty() {
                pieces.push(text);
            }
        }

        Ok(pieces.join(" "))
    }

    /// Run encoder + greedy decoder over a single 30-second window.
    fn transcribe_window(
        &mut self,
        chunk: &[f32],
        priming_prompt: &str,
        language: &str,
    ) -> Result<String> {
        let mel = self.pcm_to_mel(chunk)?;
        let mel = mel.unsqueeze(0)?;

        let audio_features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = self.prompt_tokens(priming_prompt, language)?;
        let eot = self.special_token(m::EOT_TOKEN)?;

        let mut output_tokens: Vec<u32> = Vec::new();
        for _ in 0..MAX_DECODE_TOKENS {
            let token_tensor = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;

            // Re-running the full prefix each step (flush=true) trades speed
            // for not having to manage the KV cache across windows.
            let hidden = self.model.decoder.forward(&token_tensor, &audio_features, true)?;
            let (_, seq_len, _) = hidden.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&hidden.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;

            let next_token = logits.argmax(0)?.to_scalar::<u32>()?;

            if next_token == eot {
                break;
            }

            if is_repetitive(&output_tokens, next_token) {
                tracing::debug!("Stopping decode on repetition after {} tokens", output_tokens.len());
                break;
            }

            tokens.push(next_token);
            output_tokens.push(next_token);
        }

        let text = self
            .tokenizer
            .decode(&output_tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        Ok(text.trim().to_string())
    }

    /// Build the decoder prefix: previous-text priming, start-of-transcript,
    /// language, task and no-timestamps markers.
    fn prompt_tokens(&self, priming_prompt: &str, language: &str) -> Result<Vec<u32>> {
        let mut tokens = Vec::new();

        if !priming_prompt.trim().is_empty() {
            tokens.push(self.special_token("<|startofprev|>")?);
            let encoded = self
                .tokenizer
                .encode(priming_prompt, false)
                .map_err(|e| anyhow!("Failed to tokenize priming prompt: {}", e))?;
            let ids = encoded.get_ids();
            // Whisper caps the previous-text channel at half its 448-token
            // context; keep the tail, the most recent vocabulary wins.
            let keep = ids.len().min(MAX_DECODE_TOKENS - 1);
            tokens.extend_from_slice(&ids[ids.len() - keep..]);
        }

        tokens.push(self.special_token(m::SOT_TOKEN)?);

        match self.tokenizer.token_to_id(&format!("<|{}|>", language)) {
            Some(lang_token) => tokens.push(lang_token),
            None => tracing::warn!(
                "No language token for '{}', letting the model auto-detect",
                language
            ),
        }

        tokens.push(self.special_token(m::TRANSCRIBE_TOKEN)?);
        tokens.push(self.special_token(m::NO_TIMESTAMPS_TOKEN)?);

        Ok(tokens)
    }

    fn special_token(&self, token: &str) -> Result<u32> {
        self.tokenizer
            .token_to_id(token)
            .ok_or_else(|| anyhow!("Tokenizer has no token {}", token))
    }

    /// Log-mel features for one window, padded/truncated to 30 seconds.
    ///
    /// Frame energies are spread across the mel bins by triangular-filter
    /// mass. This is an energy-envelope approximation of the spectrogram,
    /// not an STFT; it keeps the front-end dependency-free.
    fn pcm_to_mel(&self, pcm: &[f32]) -> Result<Tensor> {
        let mut padded = vec![0.0f32; WINDOW_SAMPLES];
        let copy_len = pcm.len().min(WINDOW_SAMPLES);
        padded[..copy_len].copy_from_slice(&pcm[..copy_len]);

        let n_mels = self.config.num_mel_bins as usize;
        let frame_size = WINDOW_SAMPLES / N_FRAMES;
        let mut mel = vec![0.0f32; n_mels * N_FRAMES];

        for frame in 0..N_FRAMES {
            let start = frame * frame_size;
            let energy: f32 = padded[start..start + frame_size]
                .iter()
                .map(|s| s * s)
                .sum::<f32>()
                / frame_size as f32;
            let log_energy = energy.max(1e-10).ln();

            for bin in 0..n_mels {
                let weight = self.mel_filters[bin];
                mel[bin * N_FRAMES + frame] = (log_energy * weight).max(-11.5129); // -80 dB floor
            }
        }

        Ok(Tensor::from_vec(mel, (n_mels, N_FRAMES), &self.device)?)
    }
}

/// Per-bin energy weights along the mel axis over 0..8 kHz.
///
/// Each entry scales the frame energy contributed to that bin, standing in
/// for the mass of the triangular filter centered there.
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let max_mel = hz_to_mel(TARGET_SAMPLE_RATE as f32 / 2.0);

    (0..n_mels)
        .map(|i| {
            // Triangles are wider at the high end of the mel axis; weight
            // each bin by its normalized center position so low-frequency
            // (speech-dominant) bins carry more of the frame energy.
            let center = max_mel * (i + 1) as f32 / (n_mels + 1) as f32;
            1.0 - 0.5 * (center / max_mel)
        })
        .collect()
}

/// Detect immediate and short-pattern token repetition, Whisper's most
/// common greedy-decode failure mode.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() >= 2 {
        let n = tokens.len();
        if tokens[n - 1] == new_token && tokens[n - 2] == new_token {
            return true;
        }
    }

    if tokens.len() >= 5 {
        let n = tokens.len();
        let mut candidate = tokens[n - 3..].to_vec();
        candidate.push(new_token);
        // Compare the last four tokens (incl. the new one) to the previous four.
        if n >= 7 && tokens[n - 7..n - 3] == candidate[..] {
            return true;
        }
    }

    false
}

#[async_trait]
impl SpeechModel for WhisperModel {
    async fn load(models: &ModelsConfig) -> Result<Self, JobError> {
        let size = models
            .whisper_model
            .parse::<ModelSize>()
            .map_err(|e| JobError::ResourceLoad(e.to_string()))?;
        let device = device::device_from_config(&models.device);

        WhisperModel::fetch(size, device).await.map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("out of memory") {
                JobError::AcceleratorExhausted(msg)
            } else {
                JobError::ResourceLoad(msg)
            }
        })
    }

    fn transcribe(
        &mut self,
        audio: &[f32],
        priming_prompt: &str,
        language: &str,
    ) -> Result<String, JobError> {
        self.run(audio, priming_prompt, language)
            .map_err(JobError::from_backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("TINY".parse::<ModelSize>().unwrap(), ModelSize::Tiny);
        assert!("huge".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let bank = mel_filter_bank(80);
        assert_eq!(bank.len(), 80);
        // Low-frequency bins must outweigh high-frequency ones.
        assert!(bank[0] > bank[79]);
        assert!(bank.iter().all(|w| *w > 0.0 && *w <= 1.0));
    }

    #[test]
    fn test_repetition_guard() {
        // Immediate triple repeat
        assert!(is_repetitive(&[5, 5], 5));
        assert!(!is_repetitive(&[5, 6], 5));

        // Four-token pattern repeated back to back
        assert!(is_repetitive(&[1, 2, 3, 4, 1, 2, 3], 4));
        assert!(!is_repetitive(&[1, 2, 3, 4, 1, 2, 3], 9));

        // Too short to judge
        assert!(!is_repetitive(&[], 1));
        assert!(!is_repetitive(&[1], 1));
    }
}
