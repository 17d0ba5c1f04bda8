//! TOML configuration.
//!
//! Every section except `[store]` is optional and falls back to defaults.
//!
//! ```toml
//! [store]
//! root = "./data"
//!
//! [server]
//! bind = "127.0.0.1:8000"
//!
//! [extraction]
//! mode = "heuristic"
//!
//! [worker]
//! program = "python3"
//! args = ["worker.py"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{AdapterConfig, SamplingParams};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub inference: SamplingParams,
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
    #[serde(default)]
    pub hub: HubConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Upload write chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024 * 1024
}
fn default_max_upload_bytes() -> u64 {
    512 * 1024 * 1024
}

/// Where question/answer pairs come from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QaMode {
    /// Deterministic templated questions, one per sentence.
    Heuristic,
    /// Prompt the base model for a JSON array of pairs.
    Model,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_qa_mode")]
    pub mode: QaMode,
    #[serde(default = "default_sentences_per_batch")]
    pub sentences_per_batch: usize,
    #[serde(default = "default_min_sentence_chars")]
    pub min_sentence_chars: usize,
    #[serde(default = "default_max_pairs_per_batch")]
    pub max_pairs_per_batch: usize,
    /// Question template for heuristic mode; `{snippet}` is replaced.
    #[serde(default = "default_question_template")]
    pub question_template: String,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    /// Sampling used when `mode = "model"`.
    #[serde(default = "default_extraction_sampling")]
    pub sampling: SamplingParams,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            mode: default_qa_mode(),
            sentences_per_batch: default_sentences_per_batch(),
            min_sentence_chars: default_min_sentence_chars(),
            max_pairs_per_batch: default_max_pairs_per_batch(),
            question_template: default_question_template(),
            snippet_chars: default_snippet_chars(),
            sampling: default_extraction_sampling(),
        }
    }
}

fn default_qa_mode() -> QaMode {
    QaMode::Heuristic
}
fn default_sentences_per_batch() -> usize {
    10
}
fn default_min_sentence_chars() -> usize {
    20
}
fn default_max_pairs_per_batch() -> usize {
    5
}
fn default_question_template() -> String {
    "What does this text say about: {snippet}...?".to_string()
}
fn default_snippet_chars() -> usize {
    30
}
fn default_extraction_sampling() -> SamplingParams {
    SamplingParams {
        max_new_tokens: 512,
        temperature: 0.8,
        top_p: 0.95,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    /// Text placed between instruction and output when tokenizing a record.
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
    /// Deployment defaults for `POST /finetune` and `doctune train`.
    #[serde(default)]
    pub defaults: AdapterConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            target_modules: default_target_modules(),
            defaults: AdapterConfig::default(),
        }
    }
}

fn default_separator() -> String {
    "\n".to_string()
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".to_string(), "v_proj".to_string()]
}

/// External compute worker driven over JSON lines on stdin/stdout.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    #[serde(default = "default_hub_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Hub download cache. Defaults to `{store.root}/cache/hub`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl HubConfig {
    pub fn cache_dir(&self, store_root: &Path) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| store_root.join("cache").join("hub"))
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: default_hub_endpoint(),
            revision: default_revision(),
            cache_dir: None,
        }
    }
}

fn default_hub_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_revision() -> String {
    "main".to_string()
}

impl Config {
    /// Configuration rooted at `store_root` with every other section defaulted.
    pub fn with_store_root(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                root: store_root.into(),
            },
            server: ServerConfig::default(),
            ingest: IngestConfig::default(),
            extraction: ExtractionConfig::default(),
            training: TrainingConfig::default(),
            inference: SamplingParams::default(),
            worker: None,
            hub: HubConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.ingest.chunk_size == 0 {
        anyhow::bail!("ingest.chunk_size must be > 0");
    }
    if config.ingest.max_upload_bytes == 0 {
        anyhow::bail!("ingest.max_upload_bytes must be > 0");
    }

    if config.extraction.sentences_per_batch == 0 {
        anyhow::bail!("extraction.sentences_per_batch must be > 0");
    }
    if config.extraction.max_pairs_per_batch == 0 {
        anyhow::bail!("extraction.max_pairs_per_batch must be > 0");
    }
    if !config.extraction.question_template.contains("{snippet}") {
        anyhow::bail!("extraction.question_template must contain {{snippet}}");
    }
    config
        .extraction
        .sampling
        .validate()
        .context("invalid [extraction.sampling]")?;

    if config.training.target_modules.is_empty() {
        anyhow::bail!("training.target_modules must not be empty");
    }
    config
        .training
        .defaults
        .validate()
        .context("invalid [training.defaults]")?;

    config
        .inference
        .validate()
        .context("invalid [inference]")?;

    Ok(())
}
