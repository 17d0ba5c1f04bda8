//! Filesystem-backed artifact store.
//!
//! Layout under the configured root:
//!
//! ```text
//! uploads/{id}_{filename}          raw uploads, removed after ingestion
//! training/{model}.jsonl           one TrainingSet per model name
//! models/{model}/                  base models (tokenizer + safetensors)
//! adapters/{model}/{version}/      adapter versions
//! adapters/{model}/LATEST          name of the current adapter version
//! merged/{model}/{version}/        merged model versions
//! merged/{model}/LATEST            name of the current merged version
//! ```
//!
//! Adapters and merged models are written into a `.staging-*` directory and
//! only become visible through [`ArtifactStore::promote`], which renames the
//! staging directory into a fresh version and then moves `LATEST`. A failed
//! run never changes what `LATEST` points to.

use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};
use crate::models::{ModelRef, TrainingRecord};

const LATEST_FILE: &str = "LATEST";
const STAGING_PREFIX: &str = ".staging-";

/// The two versioned artifact classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Adapter,
    Merged,
}

impl ArtifactKind {
    fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Adapter => "adapters",
            ArtifactKind::Merged => "merged",
        }
    }
}

/// A resolved artifact version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the top-level directories. Idempotent.
    pub fn init(&self) -> Result<()> {
        for dir in ["uploads", "training", "models", "adapters", "merged"] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// A fresh, collision-free path for an uploaded file.
    pub fn upload_path(&self, filename: &str) -> PathBuf {
        let id = Uuid::new_v4().simple().to_string();
        self.uploads_dir()
            .join(format!("{}_{}", &id[..12], sanitize_filename(filename)))
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    /// The base model for `name`. Does not check presence.
    pub fn model_ref(&self, name: &str) -> Result<ModelRef> {
        validate_model_name(name)?;
        Ok(ModelRef::new(name, self.models_dir().join(name)))
    }

    pub fn training_path(&self, name: &str) -> Result<PathBuf> {
        validate_model_name(name)?;
        Ok(self.root.join("training").join(format!("{}.jsonl", name)))
    }

    /// Opens a streaming writer for the training set of `name`.
    pub fn training_writer(&self, name: &str) -> Result<TrainingSetWriter> {
        TrainingSetWriter::create(self.training_path(name)?)
    }

    pub fn artifact_dir(&self, kind: ArtifactKind, name: &str) -> Result<PathBuf> {
        validate_model_name(name)?;
        Ok(self.root.join(kind.dir_name()).join(name))
    }

    /// Creates an empty staging directory for a new version of `kind`.
    pub fn create_staging(&self, kind: ArtifactKind, name: &str) -> Result<PathBuf> {
        let dir = self.artifact_dir(kind, name)?;
        let staging = dir.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir_all(&staging)?;
        Ok(staging)
    }

    /// Moves a completed staging directory into a new version and points
    /// `LATEST` at it. Returns the new version.
    pub fn promote(&self, kind: ArtifactKind, name: &str, staging: &Path) -> Result<Versioned> {
        let dir = self.artifact_dir(kind, name)?;
        let version = new_version_id();
        let target = dir.join(&version);
        fs::rename(staging, &target)?;

        let tmp = dir.join(format!("{}.tmp", LATEST_FILE));
        {
            let mut f = File::create(&tmp)?;
            f.write_all(version.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, dir.join(LATEST_FILE))?;

        tracing::info!(kind = ?kind, model = name, version = %version, "promoted artifact");
        Ok(Versioned {
            version,
            path: target,
        })
    }

    /// The version `LATEST` points to, if any and if it still exists.
    pub fn latest(&self, kind: ArtifactKind, name: &str) -> Result<Option<Versioned>> {
        let dir = self.artifact_dir(kind, name)?;
        let pointer = dir.join(LATEST_FILE);
        let version = match fs::read_to_string(&pointer) {
            Ok(s) => s.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if version.is_empty() {
            return Ok(None);
        }
        let path = dir.join(&version);
        if !path.is_dir() {
            return Ok(None);
        }
        Ok(Some(Versioned { version, path }))
    }

    /// All versions of `kind` for `name`, oldest first.
    pub fn versions(&self, kind: ArtifactKind, name: &str) -> Result<Vec<String>> {
        let dir = self.artifact_dir(kind, name)?;
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(Vec::new());
        };
        let mut versions: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| is_version_id(n))
            .collect();
        versions.sort();
        Ok(versions)
    }

    /// Model names that have a merged model ready for inference.
    pub fn list_merged(&self) -> Result<Vec<String>> {
        let base = self.root.join(ArtifactKind::Merged.dir_name());
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut models = Vec::new();
        for entry in WalkDir::new(&base).min_depth(2) {
            let entry = entry.map_err(|e| PipelineError::Io(e.into()))?;
            if !entry.file_type().is_file() || entry.file_name() != LATEST_FILE {
                continue;
            }
            let Some(model_dir) = entry.path().parent() else {
                continue;
            };
            let Ok(relative) = model_dir.strip_prefix(&base) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            if self.latest(ArtifactKind::Merged, &name)?.is_some() {
                models.push(name);
            }
        }
        models.sort();
        Ok(models)
    }
}

/// Removes a staging directory, logging rather than failing.
pub fn discard_staging(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staging directory");
        }
    }
}

/// `20240101T120000123Z-1a2b3c4d`
fn new_version_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"), &id[..8])
}

fn is_version_id(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 28
        && b[..8].iter().all(u8::is_ascii_digit)
        && b[8] == b'T'
        && b[9..18].iter().all(u8::is_ascii_digit)
        && b[18] == b'Z'
        && b[19] == b'-'
        && b[20..].iter().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(c))
}

/// Checks that a model name maps onto a safe relative path.
///
/// Names are `model` or `namespace/model`, hub style. Segments are made of
/// ASCII alphanumerics, `-`, `_` and `.`. They may not start with `.` or
/// `LATEST`, nor look like a version id, so `m` and `m/x` never collide
/// inside one artifact directory.
pub fn validate_model_name(name: &str) -> Result<()> {
    let invalid = || PipelineError::InvalidModelName(name.to_string());
    if name.is_empty() || name.len() > 200 || name.split('/').count() > 2 {
        return Err(invalid());
    }
    for segment in name.split('/') {
        if segment.is_empty()
            || segment.starts_with('.')
            || segment.starts_with(LATEST_FILE)
            || is_version_id(segment)
        {
            return Err(invalid());
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Reduces an uploaded filename to a safe final path component.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Streams [`TrainingRecord`]s into `{path}.partial`, one JSON object per
/// line, flushing after every record. [`finish`](TrainingSetWriter::finish)
/// syncs and renames over the final path; [`abort`](TrainingSetWriter::abort)
/// removes the partial file and leaves any previous training set untouched.
pub struct TrainingSetWriter {
    final_path: PathBuf,
    partial_path: PathBuf,
    out: BufWriter<File>,
    count: usize,
}

impl TrainingSetWriter {
    pub fn create(final_path: PathBuf) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut partial = final_path.clone().into_os_string();
        partial.push(".partial");
        let partial_path = PathBuf::from(partial);
        let file = File::create(&partial_path)?;
        Ok(Self {
            final_path,
            partial_path,
            out: BufWriter::new(file),
            count: 0,
        })
    }

    pub fn append(&mut self, record: &TrainingRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Makes the training set visible at its final path.
    pub fn finish(self) -> Result<PathBuf> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.partial_path, &self.final_path)?;
        Ok(self.final_path)
    }

    pub fn abort(self) {
        let partial = self.partial_path.clone();
        drop(self.out);
        if let Err(e) = fs::remove_file(&partial) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %partial.display(), error = %e, "failed to remove partial training file");
            }
        }
    }
}

/// Reads a training set back, in file order. Blank lines are skipped; any
/// malformed line (including an empty field) is an error.
pub fn read_training_set(path: &Path) -> Result<Vec<TrainingRecord>> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: TrainingRecord = serde_json::from_str(&line).map_err(|e| {
            PipelineError::Training(format!(
                "malformed record at {}:{}: {}",
                path.display(),
                i + 1,
                e
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}
