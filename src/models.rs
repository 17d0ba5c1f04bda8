//! Core data models that flow between the pipeline stages.
//!
//! These types describe the uploaded document, the per-page text handed from
//! ingestion to extraction, the persisted training records, the base model
//! reference, and the hyperparameters and metadata records written next to
//! adapters and merged models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// An uploaded document as stored on disk.
#[derive(Debug, Clone)]
pub struct Document {
    pub filename: String,
    pub size_bytes: u64,
    pub path: PathBuf,
}

/// Text extracted from one page or section of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// 1-based page index in original document order.
    pub index: usize,
    pub text: String,
}

impl PageText {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// One supervised example. Both fields are non-empty after trimming.
///
/// Construction goes through [`TrainingRecord::new`], and deserialization
/// applies the same check, so a record with an empty field can neither be
/// written nor read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTrainingRecord")]
pub struct TrainingRecord {
    instruction: String,
    output: String,
}

#[derive(Deserialize)]
struct RawTrainingRecord {
    instruction: String,
    output: String,
}

impl TryFrom<RawTrainingRecord> for TrainingRecord {
    type Error = String;

    fn try_from(raw: RawTrainingRecord) -> std::result::Result<Self, Self::Error> {
        TrainingRecord::new(raw.instruction, raw.output)
            .ok_or_else(|| "instruction and output must be non-empty".to_string())
    }
}

impl TrainingRecord {
    /// Trims both fields; returns `None` if either is empty afterwards.
    pub fn new(instruction: impl AsRef<str>, output: impl AsRef<str>) -> Option<Self> {
        let instruction = instruction.as_ref().trim();
        let output = output.as_ref().trim();
        if instruction.is_empty() || output.is_empty() {
            return None;
        }
        Some(Self {
            instruction: instruction.to_string(),
            output: output.to_string(),
        })
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

/// A base model: hub repository id plus its local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub repo_id: String,
    pub path: PathBuf,
}

impl ModelRef {
    pub fn new(repo_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            repo_id: repo_id.into(),
            path: path.into(),
        }
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.path.join(TOKENIZER_FILE)
    }

    /// Safetensors weight files in the model directory, sorted by name.
    pub fn weight_files(&self) -> Vec<PathBuf> {
        weight_files_in(&self.path)
    }

    /// A model is present when it has a tokenizer and at least one weight file.
    pub fn is_present(&self) -> bool {
        self.tokenizer_path().is_file() && !self.weight_files().is_empty()
    }
}

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Tokenizer files copied alongside adapters and merged models.
pub const TOKENIZER_FILES: &[&str] = &[
    TOKENIZER_FILE,
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
];

/// Copies whichever [`TOKENIZER_FILES`] exist in `from` into `to`.
/// Returns how many were copied.
pub fn copy_tokenizer_files(from: &Path, to: &Path) -> std::io::Result<usize> {
    let mut copied = 0;
    for name in TOKENIZER_FILES {
        let src = from.join(name);
        if src.is_file() {
            std::fs::copy(&src, to.join(name))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Lists `*.safetensors` files directly inside `dir`, sorted by file name.
pub fn weight_files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    files.sort();
    files
}

/// Hyperparameters for a LoRA fine-tuning run.
///
/// Field names match the JSON body accepted by `POST /finetune`. Every field
/// has a fixed valid range; [`AdapterConfig::validate`] rejects values
/// outside it instead of clamping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub gradient_accumulation: usize,
    pub max_length: usize,
    pub lora_r: usize,
    pub lora_alpha: usize,
    pub lora_dropout: f64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            learning_rate: 2e-4,
            batch_size: 1,
            gradient_accumulation: 8,
            max_length: 1024,
            lora_r: 8,
            lora_alpha: 16,
            lora_dropout: 0.05,
        }
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<()> {
        check_range("epochs", self.epochs, 1, 10)?;
        check_range("learning_rate", self.learning_rate, 1e-5, 5e-4)?;
        check_range("batch_size", self.batch_size, 1, 8)?;
        check_range("gradient_accumulation", self.gradient_accumulation, 1, 32)?;
        check_range("max_length", self.max_length, 256, 4096)?;
        check_range("lora_r", self.lora_r, 4, 64)?;
        check_range("lora_alpha", self.lora_alpha, 8, 128)?;
        check_range("lora_dropout", self.lora_dropout, 0.0, 0.3)?;
        Ok(())
    }

    /// LoRA scaling factor `alpha / r`.
    pub fn scaling(&self) -> f64 {
        self.lora_alpha as f64 / self.lora_r as f64
    }

    /// Applies the fields present in `overrides` on top of `self`. Unknown
    /// fields and wrongly typed values are validation errors. The result is
    /// not range-checked; call [`AdapterConfig::validate`].
    pub fn with_overrides(&self, overrides: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut merged = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in overrides {
            if !merged.contains_key(key) {
                return Err(PipelineError::validation(key.as_str(), "unknown field"));
            }
            merged.insert(key.clone(), value.clone());
        }
        serde_json::from_value(serde_json::Value::Object(merged))
            .map_err(|e| PipelineError::validation("body", e.to_string()))
    }
}

/// Sampling parameters for text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 200,
            temperature: 0.8,
            top_p: 0.9,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        check_range("max_new_tokens", self.max_new_tokens, 1, 2048)?;
        if !(self.temperature > 0.0 && self.temperature <= 2.0) {
            return Err(PipelineError::validation(
                "temperature",
                format!("must be in (0, 2], got {}", self.temperature),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(PipelineError::validation(
                "top_p",
                format!("must be in (0, 1], got {}", self.top_p),
            ));
        }
        Ok(())
    }
}

fn check_range<T: PartialOrd + Display + Copy>(field: &str, value: T, min: T, max: T) -> Result<()> {
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(PipelineError::validation(
            field,
            format!("must be in {}..={}, got {}", min, max, value),
        ))
    }
}

/// Contents of `adapter_config.json`, in the PEFT layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftAdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub lora_dropout: f64,
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

impl PeftAdapterConfig {
    pub fn from_training(
        config: &AdapterConfig,
        target_modules: &[String],
        base_model: &str,
    ) -> Self {
        Self {
            r: config.lora_r,
            lora_alpha: config.lora_alpha as f64,
            lora_dropout: config.lora_dropout,
            target_modules: target_modules.to_vec(),
            base_model_name_or_path: Some(base_model.to_string()),
            peft_type: default_peft_type(),
            task_type: default_task_type(),
        }
    }
}

/// Contents of `training_info.json`, written next to each adapter version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingInfo {
    pub model_name: String,
    pub dataset_sha256: String,
    pub records: usize,
    pub optimizer_steps: usize,
    pub final_loss: Option<f32>,
    pub params: AdapterConfig,
    pub target_modules: Vec<String>,
    pub trained_at: DateTime<Utc>,
}

/// Contents of `merge_info.json`, written next to each merged model version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeInfo {
    pub base_model: String,
    pub adapter: String,
    pub adapter_version: String,
    pub size_bytes: u64,
    pub parameters: u64,
    pub layers_merged: usize,
    pub device: String,
    pub precision: String,
    pub merged_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_trims_fields() {
        let r = TrainingRecord::new("  What falls? ", "\tRain.\n").unwrap();
        assert_eq!(r.instruction(), "What falls?");
        assert_eq!(r.output(), "Rain.");
    }

    #[test]
    fn record_with_empty_field_is_dropped() {
        assert!(TrainingRecord::new("   ", "answer").is_none());
        assert!(TrainingRecord::new("question", "").is_none());
    }

    #[test]
    fn record_deserialization_enforces_non_empty() {
        let ok: TrainingRecord =
            serde_json::from_str(r#"{"instruction": "q", "output": "a"}"#).unwrap();
        assert_eq!(ok.output(), "a");
        let bad = serde_json::from_str::<TrainingRecord>(r#"{"instruction": "q", "output": " "}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn default_adapter_config_is_valid() {
        AdapterConfig::default().validate().unwrap();
    }

    #[test]
    fn lora_r_above_bound_is_rejected() {
        let config = AdapterConfig {
            lora_r: 100,
            ..AdapterConfig::default()
        };
        match config.validate() {
            Err(PipelineError::Validation { field, .. }) => assert_eq!(field, "lora_r"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn nan_dropout_is_rejected() {
        let config = AdapterConfig {
            lora_dropout: f64::NAN,
            ..AdapterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config: AdapterConfig = serde_json::from_str(r#"{"epochs": 3}"#).unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.lora_r, 8);
    }

    #[test]
    fn overrides_apply_on_top_of_deployment_defaults() {
        let defaults = AdapterConfig {
            epochs: 4,
            ..AdapterConfig::default()
        };
        let body = serde_json::json!({"lora_r": 16});
        let merged = defaults.with_overrides(body.as_object().unwrap()).unwrap();
        assert_eq!(merged.epochs, 4);
        assert_eq!(merged.lora_r, 16);

        let unknown = serde_json::json!({"lora_rank": 16});
        assert!(matches!(
            defaults.with_overrides(unknown.as_object().unwrap()),
            Err(PipelineError::Validation { .. })
        ));
        let wrong_type = serde_json::json!({"epochs": "many"});
        assert!(defaults.with_overrides(wrong_type.as_object().unwrap()).is_err());
    }

    #[test]
    fn sampling_bounds() {
        SamplingParams::default().validate().unwrap();
        let zero_temp = SamplingParams {
            temperature: 0.0,
            ..SamplingParams::default()
        };
        assert!(zero_temp.validate().is_err());
        let too_many = SamplingParams {
            max_new_tokens: 5000,
            ..SamplingParams::default()
        };
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn model_ref_presence_requires_tokenizer_and_weights() {
        let tmp = tempfile::TempDir::new().unwrap();
        let model = ModelRef::new("org/tiny", tmp.path());
        assert!(!model.is_present());
        std::fs::write(tmp.path().join(TOKENIZER_FILE), "{}").unwrap();
        assert!(!model.is_present());
        std::fs::write(tmp.path().join("model.safetensors"), b"x").unwrap();
        assert!(model.is_present());
    }
}
