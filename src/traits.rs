//! Collaborator traits.
//!
//! The pipeline treats document parsing, language-model execution, the LoRA
//! training loop and weight download as opaque capabilities. Each one sits
//! behind a narrow trait so the stages can be driven by the built-in
//! implementations or by test doubles.
//!
//! ```text
//!  DocumentExtractor ──▶ Ingestion
//!  ModelLoader ───────▶ Extraction (model mode), Inference
//!  TrainingBackend ───▶ Training
//!  WeightDownloader ──▶ Download
//! ```
//!
//! Built-in implementations:
//!
//! | Trait | Implementation |
//! |-------|----------------|
//! | [`DocumentExtractor`] | [`crate::extract::FileExtractor`] |
//! | [`ModelLoader`] | [`crate::worker::WorkerModelLoader`], [`NoWorker`] |
//! | [`TrainingBackend`] | [`crate::worker::WorkerTrainer`], [`NoWorker`] |
//! | [`WeightDownloader`] | [`crate::hub::HubDownloader`] |

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::SamplingParams;
use crate::tokenize::Batch;

/// Turns a stored document into ordered per-page text.
pub trait DocumentExtractor: Send + Sync {
    /// Returns one string per page or section, in document order. Fails if
    /// the format is unsupported or the file is corrupt.
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>>;
}

/// A loaded causal language model.
///
/// Calls block; callers run them on a blocking thread.
pub trait LanguageModel: Send + Sync {
    /// Samples up to `params.max_new_tokens` new tokens after `input_ids`.
    ///
    /// Returns the **full** sequence: the prompt ids followed by the
    /// generated ids. Callers strip the prompt by index.
    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        eos_token_id: Option<u32>,
    ) -> Result<Vec<u32>>;
}

/// Loads a model directory (tokenizer + weights) into a [`LanguageModel`].
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_dir: &Path) -> Result<Arc<dyn LanguageModel>>;
}

/// What the training backend needs to attach a LoRA adapter.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSpec {
    pub model_dir: PathBuf,
    pub target_modules: Vec<String>,
    pub lora_r: usize,
    pub lora_alpha: usize,
    pub lora_dropout: f64,
    pub max_length: usize,
    pub total_optimizer_steps: usize,
}

/// Starts training sessions. The forward/backward math lives behind this.
pub trait TrainingBackend: Send + Sync {
    fn start(&self, spec: &TrainingSpec) -> Result<Box<dyn TrainingSession>>;
}

/// One LoRA training run on a frozen base model.
pub trait TrainingSession: Send {
    /// Runs forward and backward on one micro-batch, accumulating gradients.
    /// Returns the batch loss.
    fn forward_backward(&mut self, batch: &Batch) -> Result<f32>;

    /// Applies the accumulated gradients and zeroes them.
    fn optimizer_step(&mut self, learning_rate: f64) -> Result<()>;

    /// Writes only the trainable adapter weights to
    /// `dir/adapter_model.safetensors`.
    fn save_adapter(&mut self, dir: &Path) -> Result<()>;
}

/// Fetches a base model repository into a local directory.
#[async_trait]
pub trait WeightDownloader: Send + Sync {
    /// Populates `dest` with the repository's model files.
    async fn download(&self, repo_id: &str, dest: &Path) -> Result<()>;
}

// ============ Disabled compute ============

/// Stand-in used when no compute worker is configured. Every call fails
/// with a descriptive message.
pub struct NoWorker;

const NO_WORKER: &str = "no compute worker configured; set [worker].program in the config file";

impl ModelLoader for NoWorker {
    fn load(&self, _model_dir: &Path) -> Result<Arc<dyn LanguageModel>> {
        anyhow::bail!(NO_WORKER)
    }
}

impl TrainingBackend for NoWorker {
    fn start(&self, _spec: &TrainingSpec) -> Result<Box<dyn TrainingSession>> {
        anyhow::bail!(NO_WORKER)
    }
}
