//! Question/answer pair sources.
//!
//! A [`QaSource`] turns one batch of sentences into training records. Two
//! sources exist and the configuration picks one explicitly:
//!
//! - [`HeuristicQa`]: a deterministic templater, one question per long
//!   enough sentence.
//! - [`ModelQa`]: prompts the base model for a JSON array of pairs and reads
//!   the completion with [`parse_pairs`]. At most `max_pairs_per_batch`
//!   pairs are kept per completion.
//!
//! Model output is untrusted text. [`parse_pairs`] accepts strict JSON
//! first and falls back to a pattern scan that tolerates mixed quotes,
//! trailing commas and unbalanced brackets.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::chunk::char_prefix;
use crate::config::ExtractionConfig;
use crate::error::{PipelineError, Result};
use crate::models::{SamplingParams, TrainingRecord};
use crate::tokenize::TextTokenizer;
use crate::traits::LanguageModel;

#[async_trait]
pub trait QaSource: Send + Sync {
    /// Training records for one batch of sentences. An empty result is not
    /// an error.
    async fn pairs_for_batch(&self, sentences: &[String]) -> Result<Vec<TrainingRecord>>;
}

// ============ Heuristic ============

pub struct HeuristicQa {
    question_template: String,
    snippet_chars: usize,
    min_sentence_chars: usize,
}

impl HeuristicQa {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            question_template: config.question_template.clone(),
            snippet_chars: config.snippet_chars,
            min_sentence_chars: config.min_sentence_chars,
        }
    }

    pub fn pairs(&self, sentences: &[String]) -> Vec<TrainingRecord> {
        sentences
            .iter()
            .filter(|s| s.chars().count() > self.min_sentence_chars)
            .filter_map(|s| {
                let question = self
                    .question_template
                    .replace("{snippet}", char_prefix(s, self.snippet_chars));
                TrainingRecord::new(question, s)
            })
            .collect()
    }
}

#[async_trait]
impl QaSource for HeuristicQa {
    async fn pairs_for_batch(&self, sentences: &[String]) -> Result<Vec<TrainingRecord>> {
        Ok(self.pairs(sentences))
    }
}

// ============ Model-driven ============

pub struct ModelQa {
    model: Arc<dyn LanguageModel>,
    tokenizer: Arc<TextTokenizer>,
    sampling: SamplingParams,
    max_pairs: usize,
}

impl ModelQa {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tokenizer: Arc<TextTokenizer>,
        sampling: SamplingParams,
        max_pairs: usize,
    ) -> Self {
        Self {
            model,
            tokenizer,
            sampling,
            max_pairs,
        }
    }
}

#[async_trait]
impl QaSource for ModelQa {
    async fn pairs_for_batch(&self, sentences: &[String]) -> Result<Vec<TrainingRecord>> {
        let prompt = build_prompt(&sentences.join(" "));
        let model = self.model.clone();
        let tokenizer = self.tokenizer.clone();
        let sampling = self.sampling.clone();

        let completion = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            let input_ids = tokenizer.encode(&prompt)?;
            let output = model.generate(&input_ids, &sampling, tokenizer.eos_token_id())?;
            let generated = output.get(input_ids.len()..).ok_or_else(|| {
                anyhow::anyhow!(
                    "model returned {} tokens for a {}-token prompt",
                    output.len(),
                    input_ids.len()
                )
            })?;
            tokenizer.decode(generated)
        })
        .await
        .map_err(|e| PipelineError::Generation(e.to_string()))?
        .map_err(|e| PipelineError::Generation(format!("{:#}", e)))?;

        let mut records = match parse_pairs(&completion) {
            ParseOutcome::Parsed(records) => records,
            ParseOutcome::Recovered(records) => {
                tracing::debug!(pairs = records.len(), "recovered pairs from malformed JSON");
                records
            }
            ParseOutcome::NoPairs => {
                tracing::debug!(completion = %char_prefix(&completion, 200), "no pairs in model output");
                Vec::new()
            }
        };
        records.truncate(self.max_pairs);
        Ok(records)
    }
}

/// The generation prompt. It ends with an opening `[` so the completion
/// continues a JSON array.
pub fn build_prompt(text: &str) -> String {
    format!(
        "Text: {text}\n\n\
         Generate 5 question-answer pairs in JSON format.\n\n\
         Output ONLY valid JSON array. Do not include any text before or after the JSON.\n\n\
         Format:\n\
         [\n  {{\"question\": \"...\", \"answer\": \"...\"}},\n  {{\"question\": \"...\", \"answer\": \"...\"}}\n]\n\n\
         JSON output:\n["
    )
}

// ============ Tolerant parser ============

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// The text held a well-formed JSON array.
    Parsed(Vec<TrainingRecord>),
    /// Pairs were recovered by pattern scan from malformed JSON.
    Recovered(Vec<TrainingRecord>),
    /// Nothing usable.
    NoPairs,
}

impl ParseOutcome {
    pub fn into_records(self) -> Vec<TrainingRecord> {
        match self {
            ParseOutcome::Parsed(r) | ParseOutcome::Recovered(r) => r,
            ParseOutcome::NoPairs => Vec::new(),
        }
    }
}

static PAIR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)["']\s*question\s*["']\s*:\s*["'](.*?)["']\s*,\s*["']\s*answer\s*["']\s*:\s*["'](.*?)["']\s*(?:[,}\]]|$)"#,
    )
    .expect("pair pattern is valid")
});

/// Extracts question/answer pairs from model output. Pairs with an empty
/// field are skipped.
pub fn parse_pairs(raw: &str) -> ParseOutcome {
    if let Some(records) = parse_strict(raw) {
        if !records.is_empty() {
            return ParseOutcome::Parsed(records);
        }
    }
    let records: Vec<TrainingRecord> = PAIR_PATTERN
        .captures_iter(raw)
        .filter_map(|c| TrainingRecord::new(unescape(&c[1]), unescape(&c[2])))
        .collect();
    if records.is_empty() {
        ParseOutcome::NoPairs
    } else {
        ParseOutcome::Recovered(records)
    }
}

fn parse_strict(raw: &str) -> Option<Vec<TrainingRecord>> {
    let trimmed = raw.trim();
    // The prompt already opened the array.
    let text = if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        format!("[{}", trimmed)
    };
    let end = text.rfind(']')?;
    let items: Vec<serde_json::Value> = serde_json::from_str(&text[..=end]).ok()?;
    Some(
        items
            .iter()
            .filter_map(|item| {
                let q = item.get("question")?.as_str()?;
                let a = item.get("answer")?.as_str()?;
                TrainingRecord::new(q, a)
            })
            .collect(),
    )
}

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"")
        .replace("\\'", "'")
        .replace("\\n", "\n")
}
