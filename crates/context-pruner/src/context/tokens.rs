//! Token accounting: counts tokens per message through the tokenizer oracle,
//! caching results by `(message id, content hash)`.
//!
//! A changed message body hashes differently, so compression or edits never
//! reuse a stale count. When the oracle fails, counts fall back to the
//! character heuristic and are flagged approximate; while approximate, the
//! effective budget shrinks by the configured slack.

use crate::Message;
use crate::oracle::{TokenizerOracle, heuristic_token_count};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default number of cached counts before the cache is pruned.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// A token count and whether it came from the heuristic fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    pub tokens: usize,
    pub approximate: bool,
}

/// Cache of exact token counts, keyed by `(message_id, content_hash)`.
#[derive(Debug)]
struct TokenCountCache {
    entries: HashMap<(String, u64), CacheEntry>,
    max_entries: usize,
    /// Monotonic insertion counter used to find the oldest entry.
    clock: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    tokens: usize,
    inserted: u64,
}

impl TokenCountCache {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            clock: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, id: &str, hash: u64) -> Option<usize> {
        if let Some(entry) = self.entries.get(&(id.to_string(), hash)) {
            self.hits += 1;
            Some(entry.tokens)
        } else {
            self.misses += 1;
            None
        }
    }

    fn put(&mut self, id: &str, hash: u64, tokens: usize) {
        // Any older count for this id belongs to content that no longer exists.
        self.entries.retain(|(cached_id, _), _| cached_id != id);
        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.clock += 1;
        self.entries.insert(
            (id.to_string(), hash),
            CacheEntry {
                tokens,
                inserted: self.clock,
            },
        );
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|(_, v)| v.inserted)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest_key);
        }
    }
}

/// Counts tokens for messages under a fixed model identifier.
///
/// Each pruner owns its accountant, so instances configured for different
/// models never share counts.
pub struct TokenAccountant {
    oracle: Arc<dyn TokenizerOracle>,
    model: String,
    cache: TokenCountCache,
    degraded: bool,
}

impl std::fmt::Debug for TokenAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAccountant")
            .field("model", &self.model)
            .field("cached", &self.cache.entries.len())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl TokenAccountant {
    pub fn new(oracle: Arc<dyn TokenizerOracle>, model: impl Into<String>) -> Self {
        Self {
            oracle,
            model: model.into(),
            cache: TokenCountCache::new(DEFAULT_CACHE_CAPACITY),
            degraded: false,
        }
    }

    /// Override the cache capacity.
    pub fn with_cache_capacity(mut self, max_entries: usize) -> Self {
        self.cache = TokenCountCache::new(max_entries);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the most recent count fell back to the heuristic.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Count tokens for a single message.
    pub async fn count(&mut self, message: &Message) -> TokenCount {
        self.count_with(message, None).await
    }

    /// Count tokens for a single message, giving up on the oracle if
    /// `cancel` fires. A cancelled count is the heuristic estimate.
    pub async fn count_with(
        &mut self,
        message: &Message,
        cancel: Option<&CancellationToken>,
    ) -> TokenCount {
        let hash = hash_content(&message.content);
        if let Some(tokens) = self.cache.get(&message.id, hash) {
            return TokenCount {
                tokens,
                approximate: false,
            };
        }

        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    r = self.oracle.count_tokens(&message.content, &self.model) => Some(r),
                    _ = token.cancelled() => None,
                }
            }
            None => Some(self.oracle.count_tokens(&message.content, &self.model).await),
        };

        match result {
            Some(Ok(tokens)) => {
                self.cache.put(&message.id, hash, tokens);
                self.degraded = false;
                TokenCount {
                    tokens,
                    approximate: false,
                }
            }
            Some(Err(e)) => {
                if !self.degraded {
                    warn!(model = %self.model, "tokenizer oracle failed, using heuristic: {e}");
                }
                self.degraded = true;
                TokenCount {
                    tokens: heuristic_token_count(&message.content),
                    approximate: true,
                }
            }
            None => {
                debug!(message_id = %message.id, "token count cancelled, using heuristic");
                TokenCount {
                    tokens: heuristic_token_count(&message.content),
                    approximate: true,
                }
            }
        }
    }

    /// Count tokens for an ordered sequence of messages.
    pub async fn count_all(&mut self, messages: &[Message]) -> TokenCount {
        let mut total = 0;
        let mut approximate = false;
        for msg in messages {
            let c = self.count(msg).await;
            total += c.tokens;
            approximate |= c.approximate;
        }
        TokenCount {
            tokens: total,
            approximate,
        }
    }

    /// Count each message and write the result into its `token_count` memo.
    pub async fn annotate(&mut self, messages: &mut [Message]) -> TokenCount {
        let mut total = 0;
        let mut approximate = false;
        for msg in messages.iter_mut() {
            let c = self.count(msg).await;
            msg.token_count = Some(c.tokens);
            total += c.tokens;
            approximate |= c.approximate;
        }
        TokenCount {
            tokens: total,
            approximate,
        }
    }

    /// Cache hit count.
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits
    }

    /// Cache miss count.
    pub fn cache_misses(&self) -> u64 {
        self.cache.misses
    }

    /// Number of cached counts.
    pub fn cache_len(&self) -> usize {
        self.cache.entries.len()
    }
}

/// The budget actually enforced: `limit`, reduced by `slack` while counts
/// are approximate.
pub fn effective_limit(limit: usize, slack: f64, approximate: bool) -> usize {
    if approximate {
        (limit as f64 * (1.0 - slack)).floor() as usize
    } else {
        limit
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    /// Tokens consumed by the message list.
    pub used_tokens: usize,
    /// Configured context limit.
    pub limit: usize,
    /// Limit after the approximation slack.
    pub effective_limit: usize,
    /// `used_tokens / effective_limit` (0.0 to 1.0+).
    pub usage_pct: f64,
    pub approximate: bool,
}

impl ContextUsage {
    pub fn new(used: TokenCount, limit: usize, slack: f64) -> Self {
        let effective = effective_limit(limit, slack, used.approximate);
        let usage_pct = if effective > 0 {
            used.tokens as f64 / effective as f64
        } else {
            1.0
        };
        Self {
            used_tokens: used.tokens,
            limit,
            effective_limit: effective,
            usage_pct,
            approximate: used.approximate,
        }
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: {}{} tokens ({:.0}% of {})",
            if self.approximate { "~" } else { "" },
            self.used_tokens,
            self.usage_pct * 100.0,
            self.effective_limit,
        )
    }
}

/// Hash message content for cache keys. Uses FNV-1a.
pub(crate) fn hash_content(content: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in content.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::oracle::{HeuristicTokenizer, OracleFuture};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts words and records how often it was called.
    #[derive(Default)]
    struct WordTokenizer {
        calls: AtomicUsize,
    }

    impl TokenizerOracle for WordTokenizer {
        fn count_tokens<'a>(&'a self, text: &'a str, model: &'a str) -> OracleFuture<'a, usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let words = text.split_whitespace().count();
                // A "bigger" model splits words more finely.
                Ok(if model == "fine" { words * 2 } else { words })
            })
        }
    }

    struct DownTokenizer;

    impl TokenizerOracle for DownTokenizer {
        fn count_tokens<'a>(&'a self, _: &'a str, _: &'a str) -> OracleFuture<'a, usize> {
            Box::pin(async { Err(OracleError::Unavailable("connection refused".into())) })
        }
    }

    #[tokio::test]
    async fn caches_unchanged_messages() {
        let oracle = Arc::new(WordTokenizer::default());
        let mut acct = TokenAccountant::new(oracle.clone(), "base");
        let msg = Message::user("one two three");

        assert_eq!(acct.count(&msg).await.tokens, 3);
        assert_eq!(acct.count(&msg).await.tokens, 3);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert_eq!(acct.cache_hits(), 1);
        assert_eq!(acct.cache_misses(), 1);
    }

    #[tokio::test]
    async fn content_change_invalidates_cache() {
        let oracle = Arc::new(WordTokenizer::default());
        let mut acct = TokenAccountant::new(oracle.clone(), "base");
        let mut msg = Message::user("one two three");
        acct.count(&msg).await;

        msg.set_content("one");
        assert_eq!(acct.count(&msg).await.tokens, 1);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
        // The stale entry for the old content was dropped.
        assert_eq!(acct.cache_len(), 1);
    }

    #[tokio::test]
    async fn model_parameterizes_counts() {
        let oracle = Arc::new(WordTokenizer::default());
        let mut base = TokenAccountant::new(oracle.clone(), "base");
        let mut fine = TokenAccountant::new(oracle, "fine");
        let msg = Message::user("alpha beta");
        assert_eq!(base.count(&msg).await.tokens, 2);
        assert_eq!(fine.count(&msg).await.tokens, 4);
    }

    #[tokio::test]
    async fn failing_oracle_falls_back_to_heuristic() {
        let mut acct = TokenAccountant::new(Arc::new(DownTokenizer), "base");
        let msg = Message::user("x".repeat(40));
        let count = acct.count(&msg).await;
        assert_eq!(count.tokens, 10);
        assert!(count.approximate);
        assert!(acct.is_degraded());
        // Approximate counts are never cached.
        assert_eq!(acct.cache_len(), 0);
    }

    #[tokio::test]
    async fn count_all_sums_and_flags() {
        let mut acct = TokenAccountant::new(Arc::new(HeuristicTokenizer), "base");
        let msgs = vec![Message::user("x".repeat(400)), Message::user("y".repeat(40))];
        let total = acct.count_all(&msgs).await;
        assert_eq!(total.tokens, 110);
        assert!(!total.approximate);
    }

    #[tokio::test]
    async fn annotate_writes_memo() {
        let mut acct = TokenAccountant::new(Arc::new(HeuristicTokenizer), "base");
        let mut msgs = vec![Message::user("x".repeat(8))];
        acct.annotate(&mut msgs).await;
        assert_eq!(msgs[0].token_count, Some(2));
    }

    #[tokio::test]
    async fn cache_capacity_is_bounded() {
        let mut acct =
            TokenAccountant::new(Arc::new(HeuristicTokenizer), "base").with_cache_capacity(2);
        for i in 0..5 {
            acct.count(&Message::user(format!("message {i}"))).await;
        }
        assert_eq!(acct.cache_len(), 2);
    }

    #[tokio::test]
    async fn cancelled_count_uses_heuristic() {
        struct Hanging;
        impl TokenizerOracle for Hanging {
            fn count_tokens<'a>(&'a self, _: &'a str, _: &'a str) -> OracleFuture<'a, usize> {
                Box::pin(futures::future::pending())
            }
        }
        let mut acct = TokenAccountant::new(Arc::new(Hanging), "base");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let count = acct.count_with(&Message::user("abcdefgh"), Some(&cancel)).await;
        assert_eq!(count.tokens, 2);
        assert!(count.approximate);
    }

    #[test]
    fn effective_limit_applies_slack_only_when_approximate() {
        assert_eq!(effective_limit(2000, 0.05, false), 2000);
        assert_eq!(effective_limit(2000, 0.05, true), 1900);
    }

    #[test]
    fn usage_log_string_format() {
        let usage = ContextUsage::new(
            TokenCount {
                tokens: 500,
                approximate: false,
            },
            2000,
            0.05,
        );
        assert_eq!(usage.usage_pct, 0.25);
        let log = usage.to_log_string();
        assert!(log.contains("context:"));
        assert!(log.contains("25%"));
    }

    #[test]
    fn hash_differs_for_different_content() {
        assert_ne!(hash_content("a"), hash_content("b"));
        assert_eq!(hash_content("same"), hash_content("same"));
    }
}
