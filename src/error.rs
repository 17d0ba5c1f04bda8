//! Error taxonomy for the pipeline stages.
//!
//! Every failure a stage can surface is a [`PipelineError`]. Each variant
//! carries a stage tag ([`PipelineError::stage`]) and a machine-readable code
//! ([`PipelineError::code`]) so the HTTP layer, the CLI, and the progress
//! stream can all report the same structured detail.

use thiserror::Error;

/// Result alias for stage operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad or empty upload, unparseable document, or a failed upload write.
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    /// No valid training pairs could be produced from the document.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The base model (or a merged model, for inference) is not present.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The training set for a model is missing or empty.
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    /// The adapter directory or its `adapter_config.json` is missing.
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),

    /// The training loop failed (backend error, malformed batch, divergence).
    #[error("training failed: {0}")]
    Training(String),

    /// Folding the adapter into the base weights failed.
    #[error("merge failed: {0}")]
    Merge(String),

    /// A parameter is outside its allowed range.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Another run holds the lock for this model name.
    #[error("model '{0}' is busy: another run is in progress")]
    Busy(String),

    /// Fetching a base model from the hub failed.
    #[error("download failed: {0}")]
    Download(String),

    /// The language model failed to produce a completion.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The model name cannot be mapped onto the artifact store.
    #[error("invalid model name '{0}'")]
    InvalidModelName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Convenience constructor for range and format violations.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Ingestion(_) => "ingestion",
            PipelineError::Extraction(_) => "extraction",
            PipelineError::DatasetNotFound(_) | PipelineError::Training(_) => "training",
            PipelineError::AdapterNotFound(_) | PipelineError::Merge(_) => "merge",
            PipelineError::Generation(_) => "inference",
            PipelineError::Download(_) => "download",
            PipelineError::ModelNotFound(_)
            | PipelineError::Validation { .. }
            | PipelineError::Busy(_)
            | PipelineError::InvalidModelName(_) => "prerequisite",
            PipelineError::Io(_) => "store",
        }
    }

    /// Machine-readable error code used in HTTP bodies and progress events.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Ingestion(_) => "ingestion_error",
            PipelineError::Extraction(_) => "extraction_error",
            PipelineError::ModelNotFound(_) => "model_not_found",
            PipelineError::DatasetNotFound(_) => "dataset_not_found",
            PipelineError::AdapterNotFound(_) => "adapter_not_found",
            PipelineError::Training(_) => "training_error",
            PipelineError::Merge(_) => "merge_error",
            PipelineError::Validation { .. } => "validation_error",
            PipelineError::Busy(_) => "busy",
            PipelineError::Download(_) => "download_error",
            PipelineError::Generation(_) => "generation_error",
            PipelineError::InvalidModelName(_) => "invalid_model_name",
            PipelineError::Io(_) => "io_error",
        }
    }

    /// True for the "missing prerequisite artifact" family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PipelineError::ModelNotFound(_)
                | PipelineError::DatasetNotFound(_)
                | PipelineError::AdapterNotFound(_)
        )
    }
}
