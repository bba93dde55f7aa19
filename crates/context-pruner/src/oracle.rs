//! Boundary traits for the two external oracles: token counting and relevance
//! scoring.
//!
//! Both traits return boxed futures so they stay dyn-compatible; a remote
//! tokenizer service and an in-process heuristic plug in the same way. The
//! crate ships a heuristic tokenizer and a lexical relevance scorer so a
//! pruner works with no external services at all.

use crate::error::OracleError;
use futures::future::BoxFuture;
use std::collections::HashSet;

/// Boxed future returned by oracle calls.
pub type OracleFuture<'a, T> = BoxFuture<'a, Result<T, OracleError>>;

/// Characters per token assumed by the heuristic fallback.
pub const HEURISTIC_CHARS_PER_TOKEN: f64 = 4.0;

/// Converts text to a token count for a given model.
pub trait TokenizerOracle: Send + Sync {
    /// Count the tokens in `text` as seen by `model`.
    ///
    /// Unknown models should return [`OracleError::UnknownModel`]; the caller
    /// falls back to the heuristic.
    fn count_tokens<'a>(&'a self, text: &'a str, model: &'a str) -> OracleFuture<'a, usize>;
}

/// Scores how related two texts are, in `[0, 1]`.
pub trait RelevanceOracle: Send + Sync {
    fn score<'a>(&'a self, a: &'a str, b: &'a str) -> OracleFuture<'a, f64>;
}

/// Deterministic character-based token estimate.
pub fn heuristic_token_count(text: &str) -> usize {
    let chars = text.chars().count();
    (chars as f64 / HEURISTIC_CHARS_PER_TOKEN).ceil() as usize
}

/// Tokenizer that estimates `ceil(chars / 4)` for every model.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenizer;

impl TokenizerOracle for HeuristicTokenizer {
    fn count_tokens<'a>(&'a self, text: &'a str, _model: &'a str) -> OracleFuture<'a, usize> {
        Box::pin(async move { Ok(heuristic_token_count(text)) })
    }
}

// ── Lexical relevance ─────────────────────────────────────────────

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "for", "from", "has", "have",
    "how", "i", "if", "in", "is", "it", "its", "me", "my", "of", "on", "or", "so", "that", "the",
    "this", "to", "was", "we", "what", "when", "with", "you", "your",
];

/// Split text into lowercased content terms, dropping stop words.
pub fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Term-overlap relevance, usable with no external service.
///
/// The score blends how much of `a` (the query side) appears in `b` with the
/// Jaccard similarity of the two term sets, so a short query fully contained
/// in a long document still scores high.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalRelevance;

impl LexicalRelevance {
    /// Synchronous scoring, shared by the oracle impl and the archive's
    /// fallback path.
    pub fn score_sync(a: &str, b: &str) -> f64 {
        let query = terms(a);
        let doc = terms(b);
        if query.is_empty() || doc.is_empty() {
            return 0.0;
        }
        let shared = query.intersection(&doc).count() as f64;
        let containment = shared / query.len() as f64;
        let union = query.union(&doc).count() as f64;
        let jaccard = shared / union;
        (0.75 * containment + 0.25 * jaccard).clamp(0.0, 1.0)
    }
}

impl RelevanceOracle for LexicalRelevance {
    fn score<'a>(&'a self, a: &'a str, b: &'a str) -> OracleFuture<'a, f64> {
        Box::pin(async move { Ok(Self::score_sync(a, b)) })
    }
}
