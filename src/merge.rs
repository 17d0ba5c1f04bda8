//! Merge stage: fold the latest LoRA adapter into the base weights.
//!
//! For every adapted module the base weight `W` (`[out, in]`) becomes
//! `W + (lora_alpha / r) · B · A`, with `A` shaped `[r, in]` and `B` shaped
//! `[out, r]`. Arithmetic is done in f32; F16 and BF16 base weights are
//! promoted first, and every floating-point tensor is written back as F32.
//! Non-float tensors pass through untouched.
//!
//! The merged model keeps the base model's shard layout. Its
//! `model.safetensors.index.json` keeps the weight map and gets a fresh
//! `metadata.total_size`, since promoted tensors grow. Shards are processed
//! one at a time.

use chrono::Utc;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::models::{copy_tokenizer_files, MergeInfo, ModelRef, PeftAdapterConfig};
use crate::store::{discard_staging, ArtifactKind, ArtifactStore, Versioned};
use crate::train::{write_json, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};

pub const MERGE_INFO_FILE: &str = "merge_info.json";
const MODEL_CONFIG_FILE: &str = "config.json";
const INDEX_FILE: &str = "model.safetensors.index.json";
/// Non-weight model files carried over verbatim.
const PASSTHROUGH_FILES: &[&str] = &["generation_config.json"];
const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: Versioned,
    pub info: MergeInfo,
}

/// Resolves the base model and the latest adapter without loading weights.
pub fn check_prerequisites(store: &ArtifactStore, model_name: &str) -> Result<(ModelRef, Versioned)> {
    let model = store.model_ref(model_name)?;
    if !model.is_present() {
        return Err(PipelineError::ModelNotFound(format!(
            "base model '{}' is not downloaded",
            model_name
        )));
    }
    let adapter = store
        .latest(ArtifactKind::Adapter, model_name)?
        .ok_or_else(|| {
            PipelineError::AdapterNotFound(format!("no trained adapter for '{}'", model_name))
        })?;
    for required in [ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE] {
        if !adapter.path.join(required).is_file() {
            return Err(PipelineError::AdapterNotFound(format!(
                "adapter {} for '{}' is missing {}",
                adapter.version, model_name, required
            )));
        }
    }
    Ok((model, adapter))
}

/// Merges the latest adapter into the base model as a new merged version.
/// Blocking.
pub fn run_merge(store: &ArtifactStore, model_name: &str) -> Result<MergeOutcome> {
    let (model, adapter) = check_prerequisites(store, model_name)?;

    let peft: PeftAdapterConfig = serde_json::from_slice(&fs::read(adapter.path.join(ADAPTER_CONFIG_FILE))?)
        .map_err(|e| PipelineError::Merge(format!("malformed {}: {}", ADAPTER_CONFIG_FILE, e)))?;
    if peft.r == 0 {
        return Err(PipelineError::Merge("adapter rank r is 0".to_string()));
    }
    let scaling = (peft.lora_alpha / peft.r as f64) as f32;
    let pairs = load_lora_pairs(&adapter.path.join(ADAPTER_WEIGHTS_FILE))?;

    tracing::info!(
        model = model_name,
        adapter = %adapter.version,
        modules = pairs.len(),
        scaling,
        "merge started"
    );

    let staging = store.create_staging(ArtifactKind::Merged, model_name)?;
    let result = merge_into(&staging, &model, &pairs, scaling).and_then(|stats| {
        write_model_files(&model, &staging, stats.tensor_bytes)?;
        let info = MergeInfo {
            base_model: model.repo_id.clone(),
            adapter: model_name.to_string(),
            adapter_version: adapter.version.clone(),
            size_bytes: dir_size(&staging)?,
            parameters: stats.parameters,
            layers_merged: stats.layers_merged,
            device: "cpu".to_string(),
            precision: "f32".to_string(),
            merged_at: Utc::now(),
        };
        write_json(&staging.join(MERGE_INFO_FILE), &info)?;
        Ok(info)
    });

    match result {
        Ok(info) => {
            let merged = store.promote(ArtifactKind::Merged, model_name, &staging)?;
            tracing::info!(
                model = model_name,
                version = %merged.version,
                layers = info.layers_merged,
                "merged model saved"
            );
            Ok(MergeOutcome { merged, info })
        }
        Err(e) => {
            tracing::warn!(model = model_name, error = %e, "merge aborted");
            discard_staging(&staging);
            Err(e)
        }
    }
}

/// A dense f32 matrix read from safetensors.
#[derive(Debug, Clone)]
struct Matrix {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Debug, Default)]
struct LoraPair {
    a: Option<Matrix>,
    b: Option<Matrix>,
}

/// Reads adapter tensors keyed by the base weight they modify.
fn load_lora_pairs(path: &Path) -> Result<HashMap<String, (Matrix, Matrix)>> {
    let bytes = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| PipelineError::Merge(format!("reading {}: {}", path.display(), e)))?;

    let mut pairs: HashMap<String, LoraPair> = HashMap::new();
    for (name, view) in tensors.tensors() {
        let (target, is_a) = lora_target(&name).ok_or_else(|| {
            PipelineError::Merge(format!("unsupported adapter tensor '{}'", name))
        })?;
        let data = to_f32(&view).ok_or_else(|| {
            PipelineError::Merge(format!("adapter tensor '{}' has dtype {:?}", name, view.dtype()))
        })?;
        let matrix = Matrix {
            shape: view.shape().to_vec(),
            data,
        };
        let entry = pairs.entry(target).or_default();
        if is_a {
            entry.a = Some(matrix);
        } else {
            entry.b = Some(matrix);
        }
    }

    pairs
        .into_iter()
        .map(|(target, pair)| match (pair.a, pair.b) {
            (Some(a), Some(b)) => Ok((target, (a, b))),
            _ => Err(PipelineError::Merge(format!(
                "adapter for '{}' is missing lora_A or lora_B",
                target
            ))),
        })
        .collect()
}

/// Maps a PEFT tensor name to `(base weight name, is_lora_a)`.
fn lora_target(name: &str) -> Option<(String, bool)> {
    let name = name.strip_prefix(PEFT_PREFIX).unwrap_or(name);
    for (suffix, is_a) in [
        (".lora_A.weight", true),
        (".lora_A.default.weight", true),
        (".lora_B.weight", false),
        (".lora_B.default.weight", false),
    ] {
        if let Some(module) = name.strip_suffix(suffix) {
            return Some((format!("{}.weight", module), is_a));
        }
    }
    None
}

struct MergeStats {
    parameters: u64,
    layers_merged: usize,
    /// Tensor payload bytes across all written shards.
    tensor_bytes: u64,
}

fn merge_into(
    staging: &Path,
    model: &ModelRef,
    pairs: &HashMap<String, (Matrix, Matrix)>,
    scaling: f32,
) -> Result<MergeStats> {
    let mut applied: HashSet<&str> = HashSet::new();
    let mut parameters = 0u64;
    let mut tensor_bytes = 0u64;

    for shard in model.weight_files() {
        let bytes = fs::read(&shard)?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| PipelineError::Merge(format!("reading {}: {}", shard.display(), e)))?;

        let mut out: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();
        for (name, view) in tensors.tensors() {
            let shape = view.shape().to_vec();
            parameters += shape.iter().product::<usize>() as u64;
            match to_f32(&view) {
                Some(mut data) => {
                    if let Some((key, (a, b))) = pairs.get_key_value(name.as_str()) {
                        apply_lora(&name, &shape, &mut data, a, b, scaling)?;
                        applied.insert(key.as_str());
                    }
                    out.push((name, Dtype::F32, shape, f32_bytes(&data)));
                }
                None => {
                    if pairs.contains_key(&name) {
                        return Err(PipelineError::Merge(format!(
                            "base weight '{}' has non-float dtype {:?}",
                            name,
                            view.dtype()
                        )));
                    }
                    out.push((name, view.dtype(), shape, view.data().to_vec()));
                }
            }
        }

        tensor_bytes += out.iter().map(|(_, _, _, data)| data.len() as u64).sum::<u64>();
        let views = out
            .iter()
            .map(|(name, dtype, shape, data)| {
                TensorView::new(*dtype, shape.clone(), data)
                    .map(|view| (name.as_str(), view))
                    .map_err(|e| PipelineError::Merge(format!("tensor '{}': {}", name, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
        let serialized = safetensors::serialize(views, Some(metadata))
            .map_err(|e| PipelineError::Merge(format!("serialization failed: {}", e)))?;

        let file_name = shard
            .file_name()
            .ok_or_else(|| PipelineError::Merge(format!("bad shard path {}", shard.display())))?;
        fs::write(staging.join(file_name), serialized)?;
        tracing::debug!(shard = %shard.display(), "shard merged");
    }

    let mut unmatched: Vec<&str> = pairs
        .keys()
        .map(String::as_str)
        .filter(|k| !applied.contains(k))
        .collect();
    if !unmatched.is_empty() {
        unmatched.sort();
        return Err(PipelineError::Merge(format!(
            "adapter targets weights missing from the base model: {}",
            unmatched.join(", ")
        )));
    }

    Ok(MergeStats {
        parameters,
        layers_merged: applied.len(),
        tensor_bytes,
    })
}

/// `w += scaling · B · A`, checking shapes first.
fn apply_lora(
    name: &str,
    w_shape: &[usize],
    w: &mut [f32],
    a: &Matrix,
    b: &Matrix,
    scaling: f32,
) -> Result<()> {
    let shape_error = || {
        PipelineError::Merge(format!(
            "shape mismatch for '{}': W {:?}, A {:?}, B {:?}",
            name, w_shape, a.shape, b.shape
        ))
    };
    let (&[out_dim, in_dim], &[r, a_in], &[b_out, b_r]) =
        (w_shape, a.shape.as_slice(), b.shape.as_slice())
    else {
        return Err(shape_error());
    };
    if a_in != in_dim || b_out != out_dim || b_r != r {
        return Err(shape_error());
    }

    for o in 0..out_dim {
        let w_row = &mut w[o * in_dim..(o + 1) * in_dim];
        for k in 0..r {
            let coeff = scaling * b.data[o * r + k];
            if coeff == 0.0 {
                continue;
            }
            let a_row = &a.data[k * in_dim..(k + 1) * in_dim];
            for (wi, ai) in w_row.iter_mut().zip(a_row) {
                *wi += coeff * ai;
            }
        }
    }
    Ok(())
}

fn to_f32(view: &TensorView<'_>) -> Option<Vec<f32>> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => Some(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        Dtype::F16 => Some(
            data.chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        ),
        Dtype::BF16 => Some(
            data.chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        ),
        _ => None,
    }
}

fn f32_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Copies `config.json` (with `torch_dtype` set to `float32`), the shard
/// index (with `total_size` rewritten), tokenizer files and other non-weight
/// model files into the merged directory.
fn write_model_files(model: &ModelRef, dir: &Path, tensor_bytes: u64) -> Result<()> {
    let config_path = model.path.join(MODEL_CONFIG_FILE);
    if config_path.is_file() {
        let mut config: serde_json::Value = serde_json::from_slice(&fs::read(&config_path)?)
            .map_err(|e| PipelineError::Merge(format!("malformed {}: {}", MODEL_CONFIG_FILE, e)))?;
        if let Some(obj) = config.as_object_mut() {
            obj.insert("torch_dtype".to_string(), "float32".into());
        }
        write_json(&dir.join(MODEL_CONFIG_FILE), &config)?;
    }
    let index_path = model.path.join(INDEX_FILE);
    if index_path.is_file() {
        let mut index: serde_json::Value = serde_json::from_slice(&fs::read(&index_path)?)
            .map_err(|e| PipelineError::Merge(format!("malformed {}: {}", INDEX_FILE, e)))?;
        if let Some(obj) = index.as_object_mut() {
            let metadata = obj
                .entry("metadata")
                .or_insert_with(|| serde_json::json!({}));
            if let Some(meta) = metadata.as_object_mut() {
                meta.insert("total_size".to_string(), tensor_bytes.into());
            }
        }
        write_json(&dir.join(INDEX_FILE), &index)?;
    }
    for name in PASSTHROUGH_FILES {
        let src = model.path.join(name);
        if src.is_file() {
            fs::copy(&src, dir.join(name))?;
        }
    }
    copy_tokenizer_files(&model.path, dir)?;
    Ok(())
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}
