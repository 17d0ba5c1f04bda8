//! Inference stage.
//!
//! Completions always come from the latest merged model for a name, never
//! from a bare adapter or the untouched base model. Loaded models are kept
//! in a [`ModelCache`] keyed by model name and merged version, so a new
//! merge is picked up on the next request and repeated prompts do not pay
//! the load cost again.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{PipelineError, Result};
use crate::models::{SamplingParams, TOKENIZER_FILE};
use crate::store::{ArtifactKind, ArtifactStore};
use crate::tokenize::TextTokenizer;
use crate::traits::{LanguageModel, ModelLoader};

/// A merged model ready to generate.
pub struct LoadedModel {
    pub model_name: String,
    pub version: String,
    pub model: Arc<dyn LanguageModel>,
    pub tokenizer: Arc<TextTokenizer>,
}

type Slot = Arc<Mutex<Option<Arc<LoadedModel>>>>;

/// One slot per model name. The map lock is only held to find a slot, so a
/// slow load for one name never blocks prompts for another.
#[derive(Default)]
pub struct ModelCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, model_name: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(model_name.to_string())
            .or_default()
            .clone()
    }

    /// Returns the latest merged model for `model_name`, loading it if the
    /// cache is empty or holds an older version. Blocking.
    pub fn get_or_load(
        &self,
        store: &ArtifactStore,
        model_name: &str,
        loader: &dyn ModelLoader,
    ) -> Result<Arc<LoadedModel>> {
        let merged = store
            .latest(ArtifactKind::Merged, model_name)?
            .ok_or_else(|| {
                PipelineError::ModelNotFound(format!(
                    "no merged model for '{}'; train and merge it first",
                    model_name
                ))
            })?;

        let slot = self.slot(model_name);
        let mut entry = slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(hit) = entry.as_ref() {
            if hit.version == merged.version {
                return Ok(hit.clone());
            }
        }

        // The base model's tokenizer drives generation; the merged copy is
        // the fallback when the base directory has been removed.
        let base_tokenizer = store.model_ref(model_name)?.tokenizer_path();
        let tokenizer_path = if base_tokenizer.is_file() {
            base_tokenizer
        } else {
            merged.path.join(TOKENIZER_FILE)
        };
        let tokenizer = load_tokenizer(&tokenizer_path)?;
        let model = loader
            .load(&merged.path)
            .map_err(|e| PipelineError::Generation(format!("loading {}: {:#}", model_name, e)))?;

        tracing::info!(model = model_name, version = %merged.version, "merged model loaded");
        let loaded = Arc::new(LoadedModel {
            model_name: model_name.to_string(),
            version: merged.version,
            model,
            tokenizer: Arc::new(tokenizer),
        });
        *entry = Some(loaded.clone());
        Ok(loaded)
    }

    /// Number of models currently loaded.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = self
            .slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|slot| slot.lock().unwrap_or_else(|p| p.into_inner()).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_tokenizer(path: &Path) -> Result<TextTokenizer> {
    if !path.is_file() {
        return Err(PipelineError::ModelNotFound(format!(
            "tokenizer not found at {}",
            path.display()
        )));
    }
    TextTokenizer::from_file(path).map_err(|e| PipelineError::Generation(format!("{:#}", e)))
}

/// Generates a completion and returns only the continuation. The prompt is
/// removed by token index, so prompt text repeated in the output survives.
/// Blocking.
pub fn generate(loaded: &LoadedModel, prompt: &str, params: &SamplingParams) -> Result<String> {
    params.validate()?;
    if prompt.trim().is_empty() {
        return Err(PipelineError::validation("message", "must not be empty"));
    }

    let generation_error = |e: anyhow::Error| PipelineError::Generation(format!("{:#}", e));
    let input_ids = loaded.tokenizer.encode(prompt).map_err(generation_error)?;
    let output = loaded
        .model
        .generate(&input_ids, params, loaded.tokenizer.eos_token_id())
        .map_err(generation_error)?;
    let continuation = output.get(input_ids.len()..).ok_or_else(|| {
        PipelineError::Generation(format!(
            "model returned {} tokens for a {}-token prompt",
            output.len(),
            input_ids.len()
        ))
    })?;
    let text = loaded.tokenizer.decode(continuation).map_err(generation_error)?;
    tracing::debug!(
        model = %loaded.model_name,
        prompt_tokens = input_ids.len(),
        new_tokens = continuation.len(),
        "completion generated"
    );
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::test_support::write_word_tokenizer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Echoes the prompt, then appends a fixed continuation.
    struct EchoModel {
        continuation: Vec<u32>,
    }

    impl LanguageModel for EchoModel {
        fn generate(
            &self,
            input_ids: &[u32],
            _params: &SamplingParams,
            _eos: Option<u32>,
        ) -> anyhow::Result<Vec<u32>> {
            let mut out = input_ids.to_vec();
            out.extend(&self.continuation);
            Ok(out)
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
        continuation: Vec<u32>,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, model_dir: &Path) -> anyhow::Result<Arc<dyn LanguageModel>> {
            assert!(model_dir.to_string_lossy().contains("merged"));
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoModel {
                continuation: self.continuation.clone(),
            }))
        }
    }

    // Vocabulary: <pad>=0 </s>=1 <unk>=2 rain=3 falls=4 in=5 spring=6
    fn setup() -> (TempDir, ArtifactStore) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        store.init().unwrap();
        add_base(&store, "m");
        (tmp, store)
    }

    fn add_base(store: &ArtifactStore, name: &str) {
        let model = store.model_ref(name).unwrap();
        write_word_tokenizer(&model.path, &["rain", "falls", "in", "spring"]);
    }

    fn add_merged_for(store: &ArtifactStore, name: &str) {
        let staging = store.create_staging(ArtifactKind::Merged, name).unwrap();
        store.promote(ArtifactKind::Merged, name, &staging).unwrap();
    }

    fn add_merged(store: &ArtifactStore) {
        add_merged_for(store, "m");
    }

    fn loader(continuation: Vec<u32>) -> CountingLoader {
        CountingLoader {
            loads: AtomicUsize::new(0),
            continuation,
        }
    }

    #[test]
    fn adapter_without_merge_is_model_not_found() {
        let (_tmp, store) = setup();
        let staging = store.create_staging(ArtifactKind::Adapter, "m").unwrap();
        store.promote(ArtifactKind::Adapter, "m", &staging).unwrap();

        let cache = ModelCache::new();
        let result = cache.get_or_load(&store, "m", &loader(vec![]));
        assert!(matches!(result, Err(PipelineError::ModelNotFound(_))));
    }

    #[test]
    fn prompt_is_stripped_by_index_even_when_repeated() {
        let (_tmp, store) = setup();
        add_merged(&store);
        let cache = ModelCache::new();
        // Continuation repeats the prompt: "rain falls in spring"
        let loaded = cache
            .get_or_load(&store, "m", &loader(vec![3, 4, 5, 6, 1]))
            .unwrap();
        let text = generate(&loaded, "rain falls", &SamplingParams::default()).unwrap();
        assert_eq!(text, "rain falls in spring");
    }

    #[test]
    fn cache_reuses_and_refreshes_on_new_version() {
        let (_tmp, store) = setup();
        add_merged(&store);
        let cache = ModelCache::new();
        let counting = loader(vec![6]);

        let first = cache.get_or_load(&store, "m", &counting).unwrap();
        let again = cache.get_or_load(&store, "m", &counting).unwrap();
        assert_eq!(first.version, again.version);
        assert_eq!(counting.loads.load(Ordering::SeqCst), 1);

        add_merged(&store);
        let fresh = cache.get_or_load(&store, "m", &counting).unwrap();
        assert_ne!(fresh.version, first.version);
        assert_eq!(counting.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalid_sampling_is_rejected() {
        let (_tmp, store) = setup();
        add_merged(&store);
        let cache = ModelCache::new();
        let loaded = cache.get_or_load(&store, "m", &loader(vec![])).unwrap();
        let params = SamplingParams {
            top_p: 1.5,
            ..SamplingParams::default()
        };
        assert!(matches!(
            generate(&loaded, "rain", &params),
            Err(PipelineError::Validation { .. })
        ));
    }

    /// Blocks loads of `slow` until released; other models load at once.
    struct GatedLoader {
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ModelLoader for GatedLoader {
        fn load(&self, model_dir: &Path) -> anyhow::Result<Arc<dyn LanguageModel>> {
            if model_dir.to_string_lossy().contains("slow") {
                self.started.lock().unwrap().send(()).unwrap();
                self.release
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(10))
                    .unwrap();
            }
            Ok(Arc::new(EchoModel {
                continuation: vec![],
            }))
        }
    }

    #[test]
    fn slow_load_does_not_block_other_models() {
        let (_tmp, store) = setup();
        for name in ["slow", "fast"] {
            add_base(&store, name);
            add_merged_for(&store, name);
        }
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let cache = Arc::new(ModelCache::new());
        let loader = Arc::new(GatedLoader {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });

        let slow = {
            let (cache, loader, store) = (cache.clone(), loader.clone(), store.clone());
            std::thread::spawn(move || cache.get_or_load(&store, "slow", loader.as_ref()).map(|_| ()))
        };
        started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let fast = cache.get_or_load(&store, "fast", loader.as_ref()).unwrap();
        assert_eq!(fast.model_name, "fast");
        assert!(!slow.is_finished());

        release_tx.send(()).unwrap();
        slow.join().unwrap().unwrap();
        assert_eq!(cache.len(), 2);
    }
}
