//! Sentence segmentation.
//!
//! Page text is split into sentences with the Unicode sentence-boundary
//! rules (UAX #29), then a second pass re-joins splits that happened after a
//! title abbreviation ("Dr. Smith"). Whitespace runs, including the hard line
//! breaks PDF text is full of, are collapsed to single spaces first.
//!
//! Extraction groups the sentences into fixed-size batches; each batch is
//! one prompt for model-driven QA generation.

use unicode_segmentation::UnicodeSegmentation;

/// Abbreviations that end in a period but rarely end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "fig", "no", "approx", "dept",
];

/// Splits text into trimmed, whitespace-collapsed sentences in order.
/// Empty input yields no sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    // UAX #29 breaks after every line feed, so line breaks go first.
    let text = collapse_whitespace(text);
    let mut sentences: Vec<String> = Vec::new();
    for raw in text.unicode_sentences() {
        let sentence = raw.trim().to_string();
        if sentence.is_empty() {
            continue;
        }
        match sentences.last_mut() {
            Some(prev) if ends_with_abbreviation(prev) => {
                prev.push(' ');
                prev.push_str(&sentence);
            }
            _ => sentences.push(sentence),
        }
    }
    sentences
}

/// First `max_chars` characters of `s`, never splitting a code point.
pub fn char_prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ends_with_abbreviation(sentence: &str) -> bool {
    let Some(stripped) = sentence.strip_suffix('.') else {
        return false;
    };
    let last_word = stripped
        .rsplit(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default();
    let lower = last_word.to_lowercase();
    ABBREVIATIONS.contains(&lower.as_str())
}
