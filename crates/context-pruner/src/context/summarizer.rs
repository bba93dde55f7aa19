//! Extractive summarization for message compression.
//!
//! Compression replaces a message body with a shorter string built from its
//! own sentences; the original goes to the archive. The algorithm is behind
//! the [`Summarizer`] trait so hosts can swap in an abstractive model call.
//!
//! The built-in [`ExtractiveSummarizer`] scores each sentence by how many of
//! the document's recurring terms it carries per word, gives the opening
//! sentence a bonus, and keeps the best sentences (in original order) until
//! the character budget for `target_tokens` is used.

use crate::oracle::{HEURISTIC_CHARS_PER_TOKEN, terms};
use std::collections::HashMap;

/// Prefix the extractive summary writer puts on compressed content.
///
/// Whether a message has been compressed is tracked by
/// `Message::compressed`, not by looking for this prefix.
pub const COMPRESSED_PREFIX: &str = "[Compressed]";

/// Produces a shortened version of a message body.
pub trait Summarizer: Send + Sync {
    /// Summarize `content` to roughly `target_tokens` tokens.
    fn summarize(&self, content: &str, target_tokens: usize) -> String;
}

/// Configuration for the extractive summarizer.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Score multiplier for the first sentence (topic sentences lead).
    pub lead_bonus: f64,
    /// Never target fewer tokens than this.
    pub min_summary_tokens: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            lead_bonus: 1.5,
            min_summary_tokens: 8,
        }
    }
}

/// Sentence-selection summarizer; no model call involved.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer {
    pub config: SummarizerConfig,
}

impl ExtractiveSummarizer {
    pub fn new(config: SummarizerConfig) -> Self {
        Self { config }
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, content: &str, target_tokens: usize) -> String {
        let target = target_tokens.max(self.config.min_summary_tokens);
        let budget_chars = (target as f64 * HEURISTIC_CHARS_PER_TOKEN) as usize;
        let budget_chars = budget_chars.saturating_sub(COMPRESSED_PREFIX.len() + 1);

        let sentences = split_sentences(content);
        if sentences.is_empty() {
            return COMPRESSED_PREFIX.to_string();
        }

        // Document term frequencies.
        let mut freq: HashMap<String, usize> = HashMap::new();
        for s in &sentences {
            for t in terms(s) {
                *freq.entry(t).or_default() += 1;
            }
        }

        let mut scored: Vec<(usize, f64)> = sentences
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let words = s.split_whitespace().count().max(1) as f64;
                let weight: usize = terms(s).iter().map(|t| freq[t]).sum();
                let mut score = weight as f64 / words.sqrt();
                if i == 0 {
                    score *= self.config.lead_bonus;
                }
                (i, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let best = scored[0].0;

        let mut chosen = Vec::new();
        let mut used = 0;
        for (i, _) in scored {
            let len = sentences[i].chars().count() + 1;
            if used + len <= budget_chars {
                chosen.push(i);
                used += len;
            }
        }

        let body = if chosen.is_empty() {
            // Not even one sentence fits: cut the best one at the budget.
            truncate_chars(sentences[best], budget_chars)
        } else {
            chosen.sort_unstable();
            chosen
                .iter()
                .map(|&i| sentences[i])
                .collect::<Vec<_>>()
                .join(" ")
        };

        format!("{COMPRESSED_PREFIX} {body}")
    }
}

/// Split text into trimmed sentences, keeping terminal punctuation.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            if let Some(s) = text.get(start..end) {
                let s = s.trim();
                if !s.is_empty() {
                    out.push(s);
                }
            }
            start = end;
        }
    }
    if let Some(rest) = text.get(start..) {
        let rest = rest.trim();
        if !rest.is_empty() {
            out.push(rest);
        }
    }
    out
}

/// Keep at most `max_chars` characters, marking the cut with an ellipsis.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}
