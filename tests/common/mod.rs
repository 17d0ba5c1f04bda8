//! Shared fixtures: a tiny base model on disk and in-process collaborators.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use doctune::config::Config;
use doctune::extract::FileExtractor;
use doctune::hub::HubDownloader;
use doctune::models::SamplingParams;
use doctune::pipeline::{Collaborators, Pipeline};
use doctune::store::ArtifactStore;
use doctune::tokenize::Batch;
use doctune::traits::{LanguageModel, ModelLoader, TrainingBackend, TrainingSession, TrainingSpec};
use safetensors::tensor::{Dtype, TensorView};

pub const MODEL: &str = "org/tiny";
pub const Q_PROJ: &str = "model.layers.0.self_attn.q_proj.weight";

/// Vocabulary after the specials `<pad>`=0, `</s>`=1, `<unk>`=2.
pub const WORDS: &[&str] = &["rain", "falls", "in", "spring", "across", "the", "valley"];

pub fn word_id(word: &str) -> u32 {
    WORDS.iter().position(|w| *w == word).unwrap() as u32 + 3
}

pub fn write_word_tokenizer(dir: &Path) {
    let mut vocab = serde_json::Map::new();
    vocab.insert("<pad>".into(), 0.into());
    vocab.insert("</s>".into(), 1.into());
    vocab.insert("<unk>".into(), 2.into());
    for (i, w) in WORDS.iter().enumerate() {
        vocab.insert((*w).to_string(), (i + 3).into());
    }
    let special = |id: u32, content: &str| {
        serde_json::json!({
            "id": id, "content": content, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        })
    };
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0, "<pad>"), special(1, "</s>"), special(2, "<unk>")],
        "normalizer": {"type": "Lowercase"},
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("tokenizer.json"), json.to_string()).unwrap();
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn write_tensors(path: &Path, tensors: &[(&str, Vec<usize>, Vec<f32>)]) {
    let data: Vec<Vec<u8>> = tensors.iter().map(|(_, _, v)| f32_bytes(v)).collect();
    let views: Vec<(&str, TensorView<'_>)> = tensors
        .iter()
        .zip(&data)
        .map(|((name, shape, _), bytes)| (*name, TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap()))
        .collect();
    std::fs::write(path, safetensors::serialize(views, None).unwrap()).unwrap();
}

pub fn read_tensor(path: &Path, name: &str) -> Vec<f32> {
    let bytes = std::fs::read(path).unwrap();
    let st = safetensors::SafeTensors::deserialize(&bytes).unwrap();
    st.tensor(name)
        .unwrap()
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Base model with a 2x2 identity `q_proj`.
pub fn write_base_model(store: &ArtifactStore) {
    let model = store.model_ref(MODEL).unwrap();
    write_word_tokenizer(&model.path);
    std::fs::write(
        model.path.join("config.json"),
        r#"{"architectures": ["LlamaForCausalLM"], "torch_dtype": "float32"}"#,
    )
    .unwrap();
    write_tensors(
        &model.path.join("model.safetensors"),
        &[(Q_PROJ, vec![2, 2], vec![1.0, 0.0, 0.0, 1.0])],
    );
}

// ============ Language model ============

/// Echoes the prompt and appends a fixed continuation.
pub struct EchoModel {
    continuation: Vec<u32>,
}

impl LanguageModel for EchoModel {
    fn generate(
        &self,
        input_ids: &[u32],
        _params: &SamplingParams,
        _eos_token_id: Option<u32>,
    ) -> anyhow::Result<Vec<u32>> {
        let mut out = input_ids.to_vec();
        out.extend(&self.continuation);
        Ok(out)
    }
}

pub struct EchoLoader {
    pub continuation: Vec<u32>,
    pub loaded: Mutex<Vec<std::path::PathBuf>>,
}

impl EchoLoader {
    pub fn new(continuation: Vec<u32>) -> Self {
        Self {
            continuation,
            loaded: Mutex::new(Vec::new()),
        }
    }
}

impl ModelLoader for EchoLoader {
    fn load(&self, model_dir: &Path) -> anyhow::Result<Arc<dyn LanguageModel>> {
        self.loaded.lock().unwrap().push(model_dir.to_path_buf());
        Ok(Arc::new(EchoModel {
            continuation: self.continuation.clone(),
        }))
    }
}

// ============ Training ============

/// Writes a rank-1 adapter for `q_proj`: `A = [1, 0]`, `B = [1, 0]ᵀ`.
/// Micro-batches wait for the gate when one is set.
#[derive(Default)]
pub struct FakeTrainer {
    pub gate: Option<Arc<Mutex<std::sync::mpsc::Receiver<()>>>>,
    pub micro_batches: Arc<Mutex<usize>>,
}

struct FakeSession {
    gate: Option<Arc<Mutex<std::sync::mpsc::Receiver<()>>>>,
    micro_batches: Arc<Mutex<usize>>,
}

impl TrainingBackend for FakeTrainer {
    fn start(&self, _spec: &TrainingSpec) -> anyhow::Result<Box<dyn TrainingSession>> {
        Ok(Box::new(FakeSession {
            gate: self.gate.clone(),
            micro_batches: self.micro_batches.clone(),
        }))
    }
}

impl TrainingSession for FakeSession {
    fn forward_backward(&mut self, batch: &Batch) -> anyhow::Result<f32> {
        assert!(!batch.is_empty());
        if let Some(gate) = &self.gate {
            gate.lock().unwrap().recv()?;
        }
        *self.micro_batches.lock().unwrap() += 1;
        Ok(0.5)
    }

    fn optimizer_step(&mut self, _learning_rate: f64) -> anyhow::Result<()> {
        Ok(())
    }

    fn save_adapter(&mut self, dir: &Path) -> anyhow::Result<()> {
        write_tensors(
            &dir.join("adapter_model.safetensors"),
            &[
                (
                    "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight",
                    vec![1, 2],
                    vec![1.0, 0.0],
                ),
                (
                    "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight",
                    vec![2, 1],
                    vec![1.0, 0.0],
                ),
            ],
        );
        Ok(())
    }
}

pub fn collaborators(config: &Config, loader: Arc<dyn ModelLoader>, trainer: Arc<dyn TrainingBackend>) -> Collaborators {
    Collaborators {
        extractor: Arc::new(FileExtractor),
        loader,
        trainer,
        downloader: Arc::new(
            HubDownloader::new(&config.hub, config.hub.cache_dir(&config.store.root)).unwrap(),
        ),
    }
}

pub fn pipeline(root: &Path, loader: Arc<dyn ModelLoader>, trainer: Arc<dyn TrainingBackend>) -> Pipeline {
    let config = Config::with_store_root(root);
    let collaborators = collaborators(&config, loader, trainer);
    let pipeline = Pipeline::new(config, collaborators);
    pipeline.store().init().unwrap();
    pipeline
}

pub fn text_upload(text: &str) -> impl tokio_stream::Stream<Item = Result<Vec<u8>, std::io::Error>> {
    tokio_stream::iter(vec![Ok(text.as_bytes().to_vec())])
}
