//! Pipeline orchestration.
//!
//! [`Pipeline`] owns the store, the per-model locks, the job registry, the
//! model cache and the collaborators, and exposes one entry point per stage.
//! Both the HTTP server and the CLI drive the stages through it.
//!
//! ```text
//!  upload ──▶ Ingestion ──▶ Extraction ──▶ training/{m}.jsonl
//!                                              │
//!  models/{m} ─────────────────────────────▶ Training ──▶ adapters/{m}/LATEST
//!                                                              │
//!  models/{m} ─────────────────────────────────────────▶ Merge ──▶ merged/{m}/LATEST
//!                                                                      │
//!                                                               Inference
//! ```
//!
//! Every stage checks its prerequisites before loading any model, and every
//! writing stage holds the model's lock for its whole run.

use std::fmt::Display;
use std::sync::Arc;

use tokio_stream::Stream;
use uuid::Uuid;

use crate::config::{Config, QaMode};
use crate::error::{PipelineError, Result};
use crate::extract::FileExtractor;
use crate::extraction::{run_extraction, ExtractionSummary};
use crate::hub::{download_model, HubDownloader};
use crate::infer::{generate, ModelCache};
use crate::ingest::{extract_document, store_upload};
use crate::jobs::{JobKind, JobRegistry};
use crate::locks::{ModelLockGuard, ModelLocks};
use crate::merge::{self, run_merge, MergeOutcome};
use crate::models::{AdapterConfig, ModelRef, SamplingParams};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::qa::{HeuristicQa, ModelQa, QaSource};
use crate::store::{validate_model_name, ArtifactStore};
use crate::tokenize::TextTokenizer;
use crate::train::{self, run_training, TrainOutcome};
use crate::traits::{DocumentExtractor, ModelLoader, NoWorker, TrainingBackend, WeightDownloader};
use crate::worker::{WorkerModelLoader, WorkerTrainer};

pub const COMPLETE_MESSAGE: &str = "Processing complete";

/// The opaque capabilities the stages call into.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn DocumentExtractor>,
    pub loader: Arc<dyn ModelLoader>,
    pub trainer: Arc<dyn TrainingBackend>,
    pub downloader: Arc<dyn WeightDownloader>,
}

impl Collaborators {
    /// Built-in collaborators: file extractor, hub downloader, and the
    /// configured compute worker (or [`NoWorker`] when none is set).
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let (loader, trainer): (Arc<dyn ModelLoader>, Arc<dyn TrainingBackend>) = match &config.worker {
            Some(worker) => (
                Arc::new(WorkerModelLoader::new(worker.clone())),
                Arc::new(WorkerTrainer::new(worker.clone())),
            ),
            None => (Arc::new(NoWorker), Arc::new(NoWorker)),
        };
        Ok(Self {
            extractor: Arc::new(FileExtractor),
            loader,
            trainer,
            downloader: Arc::new(HubDownloader::new(
                &config.hub,
                config.hub.cache_dir(&config.store.root),
            )?),
        })
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    store: ArtifactStore,
    locks: ModelLocks,
    jobs: JobRegistry,
    cache: Arc<ModelCache>,
    collaborators: Collaborators,
}

impl Pipeline {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let store = ArtifactStore::new(&config.store.root);
        Self {
            config: Arc::new(config),
            store,
            locks: ModelLocks::new(),
            jobs: JobRegistry::new(),
            cache: Arc::new(ModelCache::new()),
            collaborators,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// True while an extraction, training or merge run holds `model_name`.
    pub fn is_busy(&self, model_name: &str) -> bool {
        self.locks.is_locked(model_name)
    }

    #[cfg(test)]
    pub(crate) fn lock_model(&self, model_name: &str) -> Result<ModelLockGuard> {
        self.locks.try_acquire(model_name)
    }

    // ============ Download ============

    /// Downloads the base model under the model's lock, so a concurrent
    /// download or run for the same name fails with `Busy`.
    pub async fn download_model(&self, model_name: &str) -> Result<ModelRef> {
        validate_model_name(model_name)?;
        let _lock = self.locks.try_acquire(model_name)?;
        download_model(&self.store, model_name, self.collaborators.downloader.as_ref()).await
    }

    // ============ Ingestion + Extraction ============

    /// Stores an uploaded document, extracts its pages and writes the
    /// training set for `model_name`. Every outcome, success or failure,
    /// ends with exactly one terminal event on `reporter`.
    pub async fn process_document<S, B, E>(
        &self,
        model_name: &str,
        filename: &str,
        upload: S,
        reporter: &dyn ProgressReporter,
    ) -> Result<ExtractionSummary>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let result = self
            .process_document_inner(model_name, filename, upload, reporter)
            .await;
        match &result {
            Ok(summary) => reporter.report(ProgressEvent::Complete {
                message: COMPLETE_MESSAGE.to_string(),
                records: summary.records,
                training_file: summary.training_file.display().to_string(),
            }),
            Err(e) => {
                tracing::warn!(model = model_name, stage = e.stage(), error = %e, "document processing failed");
                reporter.report(ProgressEvent::from_error(e));
            }
        }
        result
    }

    async fn process_document_inner<S, B, E>(
        &self,
        model_name: &str,
        filename: &str,
        upload: S,
        reporter: &dyn ProgressReporter,
    ) -> Result<ExtractionSummary>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        validate_model_name(model_name)?;
        let _lock = self.locks.try_acquire(model_name)?;
        if self.config.extraction.mode == QaMode::Model {
            self.require_base_model(model_name)?;
        }

        let doc = store_upload(&self.store, filename, upload, &self.config.ingest).await?;
        let pages = extract_document(&doc, self.collaborators.extractor.clone(), reporter).await?;
        tracing::info!(model = model_name, file = %doc.filename, pages = pages.len(), "document ingested");

        let qa = self.qa_source(model_name).await?;
        run_extraction(
            &self.store,
            model_name,
            &pages,
            qa.as_ref(),
            &self.config.extraction,
            reporter,
        )
        .await
    }

    async fn qa_source(&self, model_name: &str) -> Result<Box<dyn QaSource>> {
        match self.config.extraction.mode {
            QaMode::Heuristic => Ok(Box::new(HeuristicQa::from_config(&self.config.extraction))),
            QaMode::Model => {
                let model = self.require_base_model(model_name)?;
                let loader = self.collaborators.loader.clone();
                let (lm, tokenizer) = tokio::task::spawn_blocking(move || {
                    let tokenizer = TextTokenizer::from_file(&model.tokenizer_path())?;
                    let lm = loader.load(&model.path)?;
                    anyhow::Ok((lm, tokenizer))
                })
                .await
                .map_err(|e| PipelineError::Generation(e.to_string()))?
                .map_err(|e| PipelineError::Generation(format!("{:#}", e)))?;
                Ok(Box::new(ModelQa::new(
                    lm,
                    Arc::new(tokenizer),
                    self.config.extraction.sampling.clone(),
                    self.config.extraction.max_pairs_per_batch,
                )))
            }
        }
    }

    fn require_base_model(&self, model_name: &str) -> Result<ModelRef> {
        let model = self.store.model_ref(model_name)?;
        if !model.is_present() {
            return Err(PipelineError::ModelNotFound(format!(
                "base model '{}' is not downloaded",
                model_name
            )));
        }
        Ok(model)
    }

    // ============ Training ============

    /// Deployment defaults with `overrides` applied, range-checked.
    pub fn training_params(
        &self,
        overrides: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AdapterConfig> {
        let params = self.config.training.defaults.with_overrides(overrides)?;
        params.validate()?;
        Ok(params)
    }

    /// Runs training to completion on a blocking thread.
    pub async fn train(&self, model_name: &str, params: AdapterConfig) -> Result<TrainOutcome> {
        train::check_prerequisites(&self.store, model_name, &params)?;
        let lock = self.locks.try_acquire(model_name)?;
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.train_locked(&lock, &params))
            .await
            .map_err(|e| PipelineError::Training(format!("training task failed: {}", e)))?
    }

    /// Checks prerequisites, then starts training as a background job.
    pub fn start_training(&self, model_name: &str, params: AdapterConfig) -> Result<Uuid> {
        train::check_prerequisites(&self.store, model_name, &params)?;
        let lock = self.locks.try_acquire(model_name)?;
        let id = self.jobs.create(JobKind::Train, model_name);
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.jobs.mark_running(id);
            let result = this.train_locked(&lock, &params);
            drop(lock);
            match result {
                Ok(outcome) => this.jobs.complete(
                    id,
                    serde_json::json!({
                        "version": outcome.adapter.version,
                        "path": outcome.adapter.path,
                        "optimizer_steps": outcome.info.optimizer_steps,
                        "final_loss": outcome.info.final_loss,
                    }),
                ),
                Err(e) => this.jobs.fail(id, &e),
            }
        });
        Ok(id)
    }

    fn train_locked(&self, lock: &ModelLockGuard, params: &AdapterConfig) -> Result<TrainOutcome> {
        run_training(
            &self.store,
            lock.model_name(),
            params,
            &self.config.training,
            self.collaborators.trainer.as_ref(),
        )
    }

    // ============ Merge ============

    pub async fn merge(&self, model_name: &str) -> Result<MergeOutcome> {
        merge::check_prerequisites(&self.store, model_name)?;
        let lock = self.locks.try_acquire(model_name)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || run_merge(&store, lock.model_name()))
            .await
            .map_err(|e| PipelineError::Merge(format!("merge task failed: {}", e)))?
    }

    /// Checks prerequisites, then starts a merge as a background job.
    pub fn start_merge(&self, model_name: &str) -> Result<Uuid> {
        merge::check_prerequisites(&self.store, model_name)?;
        let lock = self.locks.try_acquire(model_name)?;
        let id = self.jobs.create(JobKind::Merge, model_name);
        let store = self.store.clone();
        let jobs = self.jobs.clone();
        tokio::task::spawn_blocking(move || {
            jobs.mark_running(id);
            let result = run_merge(&store, lock.model_name());
            drop(lock);
            match result {
                Ok(outcome) => jobs.complete(
                    id,
                    serde_json::json!({
                        "version": outcome.merged.version,
                        "path": outcome.merged.path,
                        "layers_merged": outcome.info.layers_merged,
                    }),
                ),
                Err(e) => jobs.fail(id, &e),
            }
        });
        Ok(id)
    }

    // ============ Inference ============

    /// Deployment sampling defaults with per-request overrides.
    pub fn sampling_params(
        &self,
        max_new_tokens: Option<usize>,
        temperature: Option<f64>,
        top_p: Option<f64>,
    ) -> SamplingParams {
        let defaults = &self.config.inference;
        SamplingParams {
            max_new_tokens: max_new_tokens.unwrap_or(defaults.max_new_tokens),
            temperature: temperature.unwrap_or(defaults.temperature),
            top_p: top_p.unwrap_or(defaults.top_p),
        }
    }

    pub async fn prompt(&self, model_name: &str, message: &str, params: SamplingParams) -> Result<String> {
        validate_model_name(model_name)?;
        params.validate()?;
        let this = self.clone();
        let model_name = model_name.to_string();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            let loaded = this.cache.get_or_load(
                &this.store,
                &model_name,
                this.collaborators.loader.as_ref(),
            )?;
            generate(&loaded, &message, &params)
        })
        .await
        .map_err(|e| PipelineError::Generation(format!("generation task failed: {}", e)))?
    }

    pub fn list_merged_models(&self) -> Result<Vec<String>> {
        self.store.list_merged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ChannelProgress;
    use tempfile::TempDir;

    fn pipeline(tmp: &TempDir) -> Pipeline {
        let config = Config::with_store_root(tmp.path());
        let collaborators = Collaborators {
            extractor: Arc::new(FileExtractor),
            loader: Arc::new(NoWorker),
            trainer: Arc::new(NoWorker),
            downloader: Arc::new(HubDownloader::new(&config.hub, tmp.path().join("cache")).unwrap()),
        };
        let p = Pipeline::new(config, collaborators);
        p.store().init().unwrap();
        p
    }

    fn text_upload(text: &str) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        tokio_stream::iter(vec![Ok(text.as_bytes().to_vec())])
    }

    #[tokio::test]
    async fn process_document_emits_ordered_events() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let (reporter, mut rx) = ChannelProgress::new();

        let summary = p
            .process_document(
                "m",
                "doc.txt",
                text_upload("Rain falls in spring across the valley.\x0c"),
                &reporter,
            )
            .await
            .unwrap();
        assert_eq!(summary.records, 1);
        drop(reporter);

        let mut types = Vec::new();
        while let Some(ev) = rx.recv().await {
            types.push(serde_json::to_value(&ev).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            types,
            vec!["total_pages", "page_start", "page_complete", "saving", "complete"]
        );
    }

    #[tokio::test]
    async fn busy_model_rejects_second_run() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let _held = p.lock_model("m").unwrap();
        let (reporter, mut rx) = ChannelProgress::new();

        let err = p
            .process_document("m", "doc.txt", text_upload("Some text here."), &reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Busy(_)));
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::Error { ref code, .. }) if code == "busy"
        ));
    }

    #[tokio::test]
    async fn download_of_busy_model_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let _held = p.lock_model("org/tiny").unwrap();
        assert!(matches!(
            p.download_model("org/tiny").await,
            Err(PipelineError::Busy(_))
        ));
        assert_eq!(std::fs::read_dir(p.store().models_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn model_mode_requires_base_model_before_upload() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_store_root(tmp.path());
        config.extraction.mode = QaMode::Model;
        let collaborators = Collaborators::from_config(&config).unwrap();
        let p = Pipeline::new(config, collaborators);
        p.store().init().unwrap();
        let (reporter, _rx) = ChannelProgress::new();

        let err = p
            .process_document("m", "doc.txt", text_upload("Some text here."), &reporter)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotFound(_)));
        assert_eq!(std::fs::read_dir(p.store().uploads_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn start_training_fails_fast_on_missing_dataset() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let err = p.start_training("m", AdapterConfig::default()).unwrap_err();
        assert!(err.is_not_found());
        assert!(p.jobs().list().is_empty());
    }

    #[tokio::test]
    async fn prompt_without_merged_model_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp);
        let params = p.sampling_params(None, None, None);
        assert!(matches!(
            p.prompt("m", "hello", params).await,
            Err(PipelineError::ModelNotFound(_))
        ));
    }

    #[test]
    fn training_params_use_config_defaults() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_store_root(tmp.path());
        config.training.defaults.epochs = 5;
        let p = Pipeline::new(config.clone(), Collaborators::from_config(&config).unwrap());
        let body = serde_json::json!({"learning_rate": 1e-4});
        let params = p.training_params(body.as_object().unwrap()).unwrap();
        assert_eq!(params.epochs, 5);
        assert_eq!(params.learning_rate, 1e-4);

        let bad = serde_json::json!({"lora_r": 100});
        assert!(p.training_params(bad.as_object().unwrap()).is_err());
    }
}
