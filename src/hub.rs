//! Base model download from a Hugging Face compatible hub.
//!
//! [`HubDownloader`] lists a repository's files through the `hf-hub` client
//! and fetches the model files (`*.json`, `*.safetensors`,
//! `tokenizer.model`, `*.txt`) through its download cache, then copies them
//! into a directory. [`download_model`] wraps any [`WeightDownloader`] with
//! the store contract: download into a staging directory, check the result
//! is a usable model, then move it into place.
//!
//! An access token is read from the `HF_TOKEN` environment variable.

use anyhow::{bail, Context};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::{PipelineError, Result};
use crate::models::ModelRef;
use crate::store::{validate_model_name, ArtifactStore};
use crate::traits::WeightDownloader;

pub const TOKEN_ENV: &str = "HF_TOKEN";

pub struct HubDownloader {
    api: Api,
    revision: String,
}

impl HubDownloader {
    /// Builds the hub client. Downloads are cached under `cache_dir`.
    pub fn new(config: &HubConfig, cache_dir: PathBuf) -> anyhow::Result<Self> {
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        let api = ApiBuilder::new()
            .with_endpoint(config.endpoint.trim_end_matches('/').to_string())
            .with_cache_dir(cache_dir)
            .with_token(token)
            .with_progress(false)
            .build()
            .context("Failed to initialize hub client")?;
        Ok(Self {
            api,
            revision: config.revision.clone(),
        })
    }

    fn repo(&self, repo_id: &str) -> ApiRepo {
        self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            self.revision.clone(),
        ))
    }
}

#[async_trait]
impl WeightDownloader for HubDownloader {
    async fn download(&self, repo_id: &str, dest: &Path) -> anyhow::Result<()> {
        let repo = self.repo(repo_id);
        let info = repo
            .info()
            .await
            .with_context(|| format!("listing files of {}", repo_id))?;
        let files = model_files(info.siblings.iter().map(|s| s.rfilename.as_str()));
        if files.is_empty() {
            bail!("repository {} has no model files", repo_id);
        }
        for file in &files {
            let cached = repo
                .get(file)
                .await
                .with_context(|| format!("downloading {}", file))?;
            let bytes = tokio::fs::copy(&cached, dest.join(file))
                .await
                .with_context(|| format!("copying {} from the hub cache", file))?;
            tracing::info!(repo = repo_id, file = %file, bytes, "downloaded");
        }
        Ok(())
    }
}

/// The repository files worth fetching, in listing order.
fn model_files<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    names.filter(|n| is_model_file(n)).map(str::to_string).collect()
}

/// Top-level model files worth fetching. Nested paths are skipped.
fn is_model_file(name: &str) -> bool {
    if name.contains('/') {
        return false;
    }
    name.ends_with(".json")
        || name.ends_with(".safetensors")
        || name.ends_with(".txt")
        || name == "tokenizer.model"
}

/// Downloads `repo_id` into `models/{repo_id}` unless it is already present.
pub async fn download_model(
    store: &ArtifactStore,
    repo_id: &str,
    downloader: &dyn WeightDownloader,
) -> Result<ModelRef> {
    validate_model_name(repo_id)?;
    let model = store.model_ref(repo_id)?;
    if model.is_present() {
        tracing::info!(repo = repo_id, "model already present");
        return Ok(model);
    }

    let models_dir = store.models_dir();
    let staging = models_dir.join(format!(".staging-{}", Uuid::new_v4().simple()));
    tokio::fs::create_dir_all(&staging).await?;

    let result: Result<()> = async {
        downloader
            .download(repo_id, &staging)
            .await
            .map_err(|e| PipelineError::Download(format!("{}: {:#}", repo_id, e)))?;
        if !ModelRef::new(repo_id, &staging).is_present() {
            return Err(PipelineError::Download(format!(
                "{} has no tokenizer.json or no safetensors weights",
                repo_id
            )));
        }
        if model.path.exists() {
            tokio::fs::remove_dir_all(&model.path).await?;
        }
        if let Some(parent) = model.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staging, &model.path).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %staging.display(), error = %cleanup, "failed to remove download staging");
            }
        }
        return Err(e);
    }
    tracing::info!(repo = repo_id, path = %model.path.display(), "model downloaded");
    Ok(model)
}
