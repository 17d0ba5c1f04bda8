//! Tokenization for training and generation.
//!
//! [`TextTokenizer`] wraps a Hugging Face `tokenizer.json` and knows the
//! model's end-of-sequence and padding ids. Training records become
//! fixed-length [`TokenizedExample`]s: `instruction + separator + output`,
//! EOS appended, truncated or right-padded to `max_length`, with labels
//! equal to the input ids except at padding positions.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::models::TrainingRecord;

/// Label value ignored by the loss.
pub const LABEL_IGNORE: i64 = -100;

const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|end_of_text|>",
    "<eos>",
];
const PAD_CANDIDATES: &[&str] = &["<pad>", "<|pad|>", "[PAD]"];

pub struct TextTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: Option<u32>,
    pad_token_id: u32,
}

impl TextTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Load tokenizer {}: {}", path.display(), e))?;
        let eos_token_id = EOS_CANDIDATES.iter().find_map(|t| inner.token_to_id(t));
        // Models without a pad token pad with EOS; padding is masked either way.
        let pad_token_id = PAD_CANDIDATES
            .iter()
            .find_map(|t| inner.token_to_id(t))
            .or(eos_token_id)
            .unwrap_or(0);
        Ok(Self {
            inner,
            eos_token_id,
            pad_token_id,
        })
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenize: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decodes ids to text, skipping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Decode: {}", e))
    }

    /// Tokenizes one training record into a fixed-length example.
    pub fn encode_record(
        &self,
        record: &TrainingRecord,
        separator: &str,
        max_length: usize,
    ) -> Result<TokenizedExample> {
        let text = format!("{}{}{}", record.instruction(), separator, record.output());
        let mut ids = self.encode(&text)?;
        if let Some(eos) = self.eos_token_id {
            if ids.last() != Some(&eos) {
                ids.push(eos);
            }
        }
        Ok(TokenizedExample::from_ids(ids, max_length, self.pad_token_id))
    }
}

/// One fixed-length training example.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    /// Truncates or right-pads `ids` to exactly `max_length`.
    pub fn from_ids(mut ids: Vec<u32>, max_length: usize, pad_token_id: u32) -> Self {
        ids.truncate(max_length);
        let real = ids.len();
        let mut labels: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        let mut attention_mask = vec![1u8; real];

        ids.resize(max_length, pad_token_id);
        labels.resize(max_length, LABEL_IGNORE);
        attention_mask.resize(max_length, 0);

        Self {
            input_ids: ids,
            attention_mask,
            labels,
        }
    }

    /// Number of non-padding tokens.
    pub fn real_len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }
}

/// A micro-batch handed to the training backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Batch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
    pub labels: Vec<Vec<i64>>,
}

impl Batch {
    pub fn collate(examples: &[TokenizedExample]) -> Self {
        let mut batch = Batch::default();
        for ex in examples {
            batch.input_ids.push(ex.input_ids.clone());
            batch.attention_mask.push(ex.attention_mask.clone());
            batch.labels.push(ex.labels.clone());
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    /// Writes a lowercase word-level `tokenizer.json` with `<pad>`=0, `</s>`=1,
    /// `<unk>`=2 followed by `words`.
    pub fn write_word_tokenizer(dir: &Path, words: &[&str]) -> PathBuf {
        let mut vocab = serde_json::Map::new();
        vocab.insert("<pad>".into(), 0.into());
        vocab.insert("</s>".into(), 1.into());
        vocab.insert("<unk>".into(), 2.into());
        for (i, w) in words.iter().enumerate() {
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
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, serde_json::to_string_pretty(&json).unwrap()).unwrap();
        path
    }
}
