//! Training stage: LoRA fine-tuning on a model's training set.
//!
//! Prerequisites are checked first and without touching any model:
//! hyperparameters in range, base model present, training set present and
//! non-empty. The loop itself runs on the [`TrainingBackend`]; this module
//! owns batching, gradient accumulation, divergence detection and the
//! adapter artifact layout.
//!
//! The adapter is assembled in a staging directory and promoted to a new
//! version only after every file is written. Any failure discards staging
//! and leaves `LATEST` where it was.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::TrainingConfig;
use crate::error::{PipelineError, Result};
use crate::models::{copy_tokenizer_files, AdapterConfig, ModelRef, PeftAdapterConfig, TrainingInfo};
use crate::store::{discard_staging, read_training_set, ArtifactKind, ArtifactStore, Versioned};
use crate::tokenize::{Batch, TextTokenizer, TokenizedExample};
use crate::traits::{TrainingBackend, TrainingSpec};

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const TRAINING_INFO_FILE: &str = "training_info.json";

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub adapter: Versioned,
    pub info: TrainingInfo,
}

/// Validates `params` and resolves the base model and training set.
pub fn check_prerequisites(
    store: &ArtifactStore,
    model_name: &str,
    params: &AdapterConfig,
) -> Result<(ModelRef, PathBuf)> {
    params.validate()?;

    let model = store.model_ref(model_name)?;
    if !model.is_present() {
        return Err(PipelineError::ModelNotFound(format!(
            "base model '{}' is not downloaded (expected tokenizer and weights in {})",
            model_name,
            model.path.display()
        )));
    }

    let dataset = store.training_path(model_name)?;
    let len = fs::metadata(&dataset).map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Err(PipelineError::DatasetNotFound(format!(
            "no training data for '{}'; process a document first",
            model_name
        )));
    }
    Ok((model, dataset))
}

/// Trains a new adapter version for `model_name`. Blocking.
pub fn run_training(
    store: &ArtifactStore,
    model_name: &str,
    params: &AdapterConfig,
    config: &TrainingConfig,
    backend: &dyn TrainingBackend,
) -> Result<TrainOutcome> {
    let (model, dataset) = check_prerequisites(store, model_name, params)?;

    let records = read_training_set(&dataset)?;
    if records.is_empty() {
        return Err(PipelineError::DatasetNotFound(format!(
            "training data for '{}' has no records",
            model_name
        )));
    }
    let dataset_sha256 = sha256_file(&dataset)?;

    let tokenizer = TextTokenizer::from_file(&model.tokenizer_path())
        .map_err(|e| PipelineError::Training(format!("{:#}", e)))?;
    let examples = records
        .iter()
        .map(|r| tokenizer.encode_record(r, &config.separator, params.max_length))
        .collect::<anyhow::Result<Vec<TokenizedExample>>>()
        .map_err(|e| PipelineError::Training(format!("{:#}", e)))?;

    let micro_batches = examples.len().div_ceil(params.batch_size);
    let steps_per_epoch = micro_batches.div_ceil(params.gradient_accumulation);
    let spec = TrainingSpec {
        model_dir: model.path.clone(),
        target_modules: config.target_modules.clone(),
        lora_r: params.lora_r,
        lora_alpha: params.lora_alpha,
        lora_dropout: params.lora_dropout,
        max_length: params.max_length,
        total_optimizer_steps: steps_per_epoch * params.epochs as usize,
    };

    tracing::info!(
        model = model_name,
        records = examples.len(),
        epochs = params.epochs,
        steps = spec.total_optimizer_steps,
        "training started"
    );

    let staging = store.create_staging(ArtifactKind::Adapter, model_name)?;
    let result = train_into(&staging, &examples, params, &spec, backend).and_then(|stats| {
        let info = TrainingInfo {
            model_name: model_name.to_string(),
            dataset_sha256,
            records: examples.len(),
            optimizer_steps: stats.optimizer_steps,
            final_loss: stats.final_loss,
            params: params.clone(),
            target_modules: config.target_modules.clone(),
            trained_at: Utc::now(),
        };
        write_adapter_metadata(&staging, &model, params, config, &info)?;
        Ok(info)
    });

    match result {
        Ok(info) => {
            let adapter = store.promote(ArtifactKind::Adapter, model_name, &staging)?;
            tracing::info!(
                model = model_name,
                version = %adapter.version,
                final_loss = ?info.final_loss,
                "adapter saved"
            );
            Ok(TrainOutcome { adapter, info })
        }
        Err(e) => {
            tracing::warn!(model = model_name, error = %e, "training aborted");
            discard_staging(&staging);
            Err(e)
        }
    }
}

struct LoopStats {
    optimizer_steps: usize,
    final_loss: Option<f32>,
}

fn train_into(
    staging: &Path,
    examples: &[TokenizedExample],
    params: &AdapterConfig,
    spec: &TrainingSpec,
    backend: &dyn TrainingBackend,
) -> Result<LoopStats> {
    let training_error = |e: anyhow::Error| PipelineError::Training(format!("{:#}", e));

    let mut session = backend.start(spec).map_err(training_error)?;
    let mut optimizer_steps = 0;
    let mut final_loss = None;

    for epoch in 1..=params.epochs {
        let mut pending = 0;
        let mut epoch_loss = 0.0f64;
        let mut micro = 0usize;
        for chunk in examples.chunks(params.batch_size) {
            let batch = Batch::collate(chunk);
            let loss = session.forward_backward(&batch).map_err(training_error)?;
            if !loss.is_finite() {
                return Err(PipelineError::Training(format!(
                    "loss diverged ({}) at epoch {}, micro-batch {}",
                    loss,
                    epoch,
                    micro + 1
                )));
            }
            final_loss = Some(loss);
            epoch_loss += loss as f64;
            micro += 1;
            pending += 1;
            if pending == params.gradient_accumulation {
                session
                    .optimizer_step(params.learning_rate)
                    .map_err(training_error)?;
                optimizer_steps += 1;
                pending = 0;
            }
        }
        if pending > 0 {
            session
                .optimizer_step(params.learning_rate)
                .map_err(training_error)?;
            optimizer_steps += 1;
        }
        tracing::info!(
            epoch,
            mean_loss = epoch_loss / micro.max(1) as f64,
            optimizer_steps,
            "epoch complete"
        );
    }

    session.save_adapter(staging).map_err(training_error)?;
    if !staging.join(ADAPTER_WEIGHTS_FILE).is_file() {
        return Err(PipelineError::Training(format!(
            "training backend did not write {}",
            ADAPTER_WEIGHTS_FILE
        )));
    }
    Ok(LoopStats {
        optimizer_steps,
        final_loss,
    })
}

fn write_adapter_metadata(
    dir: &Path,
    model: &ModelRef,
    params: &AdapterConfig,
    config: &TrainingConfig,
    info: &TrainingInfo,
) -> Result<()> {
    let peft = PeftAdapterConfig::from_training(params, &config.target_modules, &model.repo_id);
    write_json(&dir.join(ADAPTER_CONFIG_FILE), &peft)?;
    copy_tokenizer_files(&model.path, dir)?;
    write_json(&dir.join(TRAINING_INFO_FILE), info)?;
    Ok(())
}

pub(crate) fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
    fs::write(path, body)?;
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
