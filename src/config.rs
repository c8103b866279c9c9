//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_RETRIEVAL_THRESHOLDS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub models: ModelsConfig,
    pub transcription: TranscriptionConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub scheduler: SchedulerConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Filesystem layout: uploads, recordings, the SQLite store and the
/// question-template file all live under `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl StorageConfig {
    pub fn upload_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("uploads")
    }

    pub fn recorded_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("recorded")
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("healthvoice.db")
    }

    pub fn question_file(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("questions.txt")
    }
}

/// Model artifact selection.
///
/// ## Fields:
/// - `whisper_model`: Whisper size name ("tiny" ... "large")
/// - `llm_repo` / `llm_file`: HuggingFace repository and GGUF filename for
///   the quantized chat model
/// - `llm_tokenizer_repo`: repository carrying the chat model's
///   tokenizer.json (GGUF quantization repos usually omit it)
/// - `llm_context_window`: fallback token window when the GGUF metadata
///   doesn't declare one; prompts that cannot fit alongside the answer
///   budget are rejected before inference
/// - `embedding_repo`: sentence-embedding model repository (always CPU)
/// - `device`: accelerator preference ("auto", "cpu", "cuda", "metal")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub llm_repo: String,
    pub llm_file: String,
    pub llm_tokenizer_repo: String,
    pub llm_context_window: usize,
    pub embedding_repo: String,
    pub device: String,
}

/// Transcription behavior.
///
/// The priming prompt biases Whisper toward the clinical vocabulary of the
/// recordings; the language is fixed for the whole deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub language: String,
    pub priming_prompt: String,
}

/// Retrieval tuning.
///
/// `thresholds` is the ordered similarity-cutoff schedule for the adaptive
/// context loop. Later entries are stricter: raising the cutoff can only
/// shrink the evidence set, so each retry sends less context downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub thresholds: Vec<f32>,
}

/// Generation sampling limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f64,
}

/// Background worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds to sleep when no job is queued.
    pub poll_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            storage: StorageConfig {
                data_dir: "data".to_string(),
            },
            models: ModelsConfig {
                whisper_model: "medium".to_string(),
                llm_repo: "bartowski/Qwen2.5-7B-Instruct-GGUF".to_string(),
                llm_file: "Qwen2.5-7B-Instruct-Q4_K_M.gguf".to_string(),
                llm_tokenizer_repo: "Qwen/Qwen2.5-7B-Instruct".to_string(),
                llm_context_window: 4096,
                embedding_repo: "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2"
                    .to_string(),
                device: "auto".to_string(),
            },
            transcription: TranscriptionConfig {
                language: "id".to_string(),
                priming_prompt: "Transkrip ini adalah rekaman medis wawancara dokter dengan \
                                 ibu pasien tuberkulosis (TB) anak balita. Gunakan istilah \
                                 medis yang tepat seperti Isoniazid, Rifampisin, Mantoux, \
                                 rontgen, berat badan."
                    .to_string(),
            },
            retrieval: RetrievalConfig {
                thresholds: vec![0.3, 0.4],
            },
            generation: GenerationConfig {
                max_tokens: 300,
                temperature: 0.3,
            },
            scheduler: SchedulerConfig {
                poll_interval_secs: 1,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and APP_* environment
    /// variables, in that priority order.
    ///
    /// `HOST` and `PORT` are also honored without the APP_ prefix because
    /// deployment platforms commonly set them directly.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The threshold schedule must be non-empty and strictly ascending:
    /// the adaptive retry loop depends on each retry being stricter than
    /// the previous attempt.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.retrieval.thresholds.is_empty() {
            return Err(anyhow::anyhow!(
                "At least one retrieval threshold is required"
            ));
        }

        if self
            .retrieval
            .thresholds
            .windows(2)
            .any(|pair| pair[1] <= pair[0])
        {
            return Err(anyhow::anyhow!(
                "Retrieval thresholds must be strictly ascending"
            ));
        }

        if self.generation.max_tokens == 0 {
            return Err(anyhow::anyhow!("Generation max_tokens must be greater than 0"));
        }

        if self.generation.max_tokens >= self.models.llm_context_window {
            return Err(anyhow::anyhow!(
                "Generation max_tokens must leave room for a prompt within the context window"
            ));
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(anyhow::anyhow!(
                "Generation temperature must be between 0.0 and 2.0"
            ));
        }

        if self.transcription.language.is_empty() {
            return Err(anyhow::anyhow!("Transcription language cannot be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.transcription.language, "id");
        assert_eq!(config.retrieval.thresholds, vec![0.3, 0.4]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let mut config = AppConfig::default();
        config.retrieval.thresholds = vec![0.4, 0.3];
        assert!(config.validate().is_err());

        config.retrieval.thresholds = vec![0.3, 0.3];
        assert!(config.validate().is_err());

        config.retrieval.thresholds = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_prompt_starved_window() {
        let mut config = AppConfig::default();
        config.generation.max_tokens = 4096;
        config.models.llm_context_window = 4096;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig {
            data_dir: "/tmp/hv".to_string(),
        };
        assert_eq!(storage.upload_dir(), PathBuf::from("/tmp/hv/uploads"));
        assert_eq!(storage.database_path(), PathBuf::from("/tmp/hv/healthvoice.db"));
    }
}
