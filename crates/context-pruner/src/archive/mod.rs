//! Capacity-bounded archive of evicted and pre-compression content.
//!
//! Every message the strategy engine drops, and the original body of every
//! message it compresses, lands here as an [`ArchiveEntry`]: the content
//! split into snippets, tagged with where it came from and a relevance score.
//!
//! Relevance scores start from the message priority, decay multiplicatively
//! with time (`relevance_decay` per `decay_interval`), and get a boost each
//! time a search retrieves the entry. Each entry remembers when it was last
//! decayed, so content archived late is never charged for time that passed
//! before it arrived. When the archive is full, scores are brought up to date
//! and the lowest are evicted first (oldest first among equals).
//!
//! Snippets are consecutive slices of the original text: joined back
//! together they reproduce the archived content exactly, whitespace included.
//!
//! All bookkeeping happens under one mutex so `stats()` never observes a
//! half-applied store or eviction. Sink writes are queued and flushed
//! afterwards; a failing sink only costs durability, never correctness.

pub mod sink;

use crate::{Message, MessageRole};
use crate::oracle::{LexicalRelevance, RelevanceOracle, heuristic_token_count};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sink::{ArchiveSink, SinkStats};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Maximum characters per snippet.
pub const SNIPPET_CHARS: usize = 400;

/// Score added to an entry each time a search returns it.
pub const RETRIEVAL_BOOST: f64 = 0.1;

/// Default token budget for a search result.
pub const DEFAULT_SEARCH_TOKENS: usize = 2000;

/// Why content was archived.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    /// The message was evicted from the context.
    Dropped,
    /// The message was replaced by a summary; this is its original body.
    Compressed,
}

/// Archived content, retrievable by relevance search.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    /// `{message_id}@{archived_at_millis}-{seq}`.
    pub id: String,
    pub message_id: String,
    pub role: MessageRole,
    pub snippets: Vec<String>,
    pub relevance_score: f64,
    pub size_bytes: usize,
    pub archived_at: DateTime<Utc>,
    /// Time `relevance_score` was last brought up to date. Entries persisted
    /// without it decay from `archived_at`.
    #[serde(default)]
    pub decayed_at: DateTime<Utc>,
    pub reason: ArchiveReason,
    /// Content was cut to fit the entry or archive byte budget.
    pub truncated: bool,
}

impl ArchiveEntry {
    /// The archived content (exact unless `truncated`).
    pub fn text(&self) -> String {
        self.snippets.concat()
    }

    /// Multiply the score by `decay` once per elapsed `interval_secs` since
    /// the entry was last decayed.
    fn decay_to(&mut self, now: DateTime<Utc>, decay: f64, interval_secs: u64) {
        let since = self.decayed_at.max(self.archived_at);
        let elapsed = (now - since).num_milliseconds();
        if elapsed <= 0 {
            return;
        }
        let steps = elapsed as f64 / (interval_secs as f64 * 1000.0);
        self.relevance_score *= decay.powf(steps);
        self.decayed_at = now;
    }
}

/// Input to [`ArchiveStore::store`].
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub message_id: String,
    pub role: MessageRole,
    pub content: String,
    pub priority: u8,
    pub reason: ArchiveReason,
}

impl ArchiveRecord {
    pub fn from_message(message: &Message, reason: ArchiveReason) -> Self {
        Self {
            message_id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            priority: message.priority,
            reason,
        }
    }
}

/// Why a store call archived nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRefusal {
    /// The archive has been closed.
    Closed,
    /// Nothing could be freed for the entry.
    Full,
    /// The content was empty.
    Empty,
}

/// Result of a store call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreReceipt {
    /// Id of the new entry, or `None` if it was refused.
    pub id: Option<String>,
    /// Ids evicted to make room.
    pub evicted: Vec<String>,
    pub truncated: bool,
    /// Set exactly when `id` is `None`.
    pub refused: Option<StoreRefusal>,
}

impl StoreReceipt {
    fn refused(reason: StoreRefusal, evicted: Vec<String>, truncated: bool) -> Self {
        Self {
            id: None,
            evicted,
            truncated,
            refused: Some(reason),
        }
    }
}

/// Search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    /// Stop adding snippets once this many tokens are collected.
    pub max_context_tokens: usize,
    /// Minimum match score; `None` uses the configured `minRelevanceScore`.
    pub min_relevance: Option<f64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_context_tokens: DEFAULT_SEARCH_TOKENS,
            min_relevance: None,
        }
    }
}

impl SearchOptions {
    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn with_min_relevance(mut self, min: f64) -> Self {
        self.min_relevance = Some(min);
        self
    }
}

/// One entry contributing to a search result.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSource {
    pub id: String,
    pub message_id: String,
    pub role: MessageRole,
    /// How well the entry matched the query.
    pub match_score: f64,
    /// The entry's relevance score after this search's boost.
    pub relevance_score: f64,
}

/// Result of an archive search.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSearchResult {
    /// At least one entry cleared the minimum match score.
    pub found: bool,
    pub sources: Vec<ArchiveSource>,
    pub total_tokens: usize,
    pub snippets: Vec<String>,
}

/// Archive counters.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStats {
    pub total_entries: usize,
    pub total_size: usize,
    pub max_size: usize,
    pub usage_percentage: f64,
    pub searches: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Distribution of entry relevance scores.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelevanceStats {
    pub entries: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Archive sizing and scoring settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveSettings {
    pub max_size: usize,
    pub max_entry_bytes: usize,
    /// Multiplicative decay per `decay_interval_secs`.
    pub decay: f64,
    pub decay_interval_secs: u64,
    pub min_relevance: f64,
}

impl ArchiveSettings {
    pub fn from_config(config: &crate::config::PrunerConfig) -> Self {
        Self {
            max_size: config.archive_max_size,
            max_entry_bytes: config.max_entry_bytes,
            decay: config.relevance_decay,
            decay_interval_secs: config.decay_interval_secs.max(1),
            min_relevance: config.min_relevance_score,
        }
    }
}

/// Pending sink write.
#[derive(Debug, Clone)]
enum SinkOp {
    Put(ArchiveEntry),
    Evict(String),
}

#[derive(Debug)]
struct ArchiveState {
    entries: Vec<ArchiveEntry>,
    total_size: usize,
    searches: u64,
    hits: u64,
    misses: u64,
    seq: u64,
    pending: Vec<SinkOp>,
    closed: bool,
}

/// Starting score for content archived from a message of `priority`.
///
/// Maps priority 1..=10 onto 0.55..=1.0.
pub fn initial_relevance(priority: u8) -> f64 {
    (0.5 + 0.05 * priority.clamp(1, 10) as f64).min(1.0)
}

/// The capacity-bounded archive.
pub struct ArchiveStore {
    state: Mutex<ArchiveState>,
    sink: Arc<dyn ArchiveSink>,
    relevance: Option<Arc<dyn RelevanceOracle>>,
    settings: ArchiveSettings,
}

impl std::fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ArchiveStore {
    pub fn new(
        settings: ArchiveSettings,
        sink: Arc<dyn ArchiveSink>,
        relevance: Option<Arc<dyn RelevanceOracle>>,
    ) -> Self {
        Self {
            state: Mutex::new(ArchiveState {
                entries: Vec::new(),
                total_size: 0,
                searches: 0,
                hits: 0,
                misses: 0,
                seq: 0,
                pending: Vec::new(),
                closed: false,
            }),
            sink,
            relevance,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArchiveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    /// Restore entries persisted by the sink. Returns warnings for I/O
    /// failures; the archive stays usable in memory either way.
    pub async fn open(&self) -> Vec<String> {
        let loaded = match self.sink.load_all().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("archive sink unavailable, continuing in memory: {e}");
                return vec![format!("archive sink unavailable: {e}")];
            }
        };

        let mut restored = 0;
        {
            let mut state = self.lock();
            state.closed = false;
            let mut sorted = loaded;
            // Highest scores first, so capacity keeps the most relevant.
            sorted.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
            for entry in sorted {
                if state.entries.iter().any(|e| e.id == entry.id) {
                    continue;
                }
                if state.total_size + entry.size_bytes > self.settings.max_size {
                    state.pending.push(SinkOp::Evict(entry.id.clone()));
                    continue;
                }
                state.total_size += entry.size_bytes;
                state.entries.push(entry);
                restored += 1;
            }
        }

        if restored > 0 {
            info!(restored, "archive restored from sink");
        }
        self.flush().await
    }

    /// Archive content. Applied to the in-memory store immediately; the
    /// sink write is queued until [`flush`](Self::flush).
    pub fn store(&self, record: ArchiveRecord) -> StoreReceipt {
        self.store_at(record, Utc::now())
    }

    pub fn store_at(&self, record: ArchiveRecord, now: DateTime<Utc>) -> StoreReceipt {
        let mut state = self.lock();
        if state.closed {
            return StoreReceipt::refused(StoreRefusal::Closed, Vec::new(), false);
        }
        if record.content.is_empty() {
            return StoreReceipt::refused(StoreRefusal::Empty, Vec::new(), false);
        }

        let entry_budget = self.settings.max_entry_bytes.min(self.settings.max_size);
        let (mut snippets, mut truncated) = split_snippets(&record.content, entry_budget);
        let mut size: usize = snippets.iter().map(|s| s.len()).sum();
        let score = initial_relevance(record.priority);

        // Eviction compares against current scores, not stale ones.
        if state.total_size + size > self.settings.max_size {
            self.decay_entries(&mut state, now);
        }

        // Evict lower-or-equal scored entries, lowest (then oldest) first.
        let mut evicted = Vec::new();
        while state.total_size + size > self.settings.max_size {
            let victim = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.relevance_score <= score)
                .min_by(|(_, a), (_, b)| {
                    a.relevance_score
                        .total_cmp(&b.relevance_score)
                        .then(a.archived_at.cmp(&b.archived_at))
                })
                .map(|(i, _)| i);
            let Some(i) = victim else { break };
            let gone = state.entries.remove(i);
            state.total_size -= gone.size_bytes;
            state.pending.push(SinkOp::Evict(gone.id.clone()));
            debug!(id = %gone.id, score = gone.relevance_score, "archive entry evicted for capacity");
            evicted.push(gone.id);
        }

        let free = self.settings.max_size.saturating_sub(state.total_size);
        if size > free {
            let (cut, _) = split_snippets(&snippets.concat(), free);
            snippets = cut;
            size = snippets.iter().map(|s| s.len()).sum();
            truncated = true;
        }
        if size == 0 {
            warn!(message_id = %record.message_id, "archive full, entry rejected");
            return StoreReceipt::refused(StoreRefusal::Full, evicted, truncated);
        }

        state.seq += 1;
        let id = format!(
            "{}@{}-{}",
            record.message_id,
            now.timestamp_millis(),
            state.seq
        );
        let entry = ArchiveEntry {
            id: id.clone(),
            message_id: record.message_id,
            role: record.role,
            snippets,
            relevance_score: score,
            size_bytes: size,
            archived_at: now,
            decayed_at: now,
            reason: record.reason,
            truncated,
        };
        state.total_size += size;
        state.pending.push(SinkOp::Put(entry.clone()));
        state.entries.push(entry);
        debug!(%id, size, truncated, "archived");

        StoreReceipt {
            id: Some(id),
            evicted,
            truncated,
            refused: None,
        }
    }

    /// Write queued inserts and evictions to the sink. Returns warnings for
    /// failed writes; failed operations are not retried.
    pub async fn flush(&self) -> Vec<String> {
        let ops = std::mem::take(&mut self.lock().pending);
        let mut warnings = Vec::new();
        for op in ops {
            let result = match &op {
                SinkOp::Put(entry) => self.sink.put(entry).await,
                SinkOp::Evict(id) => self.sink.evict(id).await,
            };
            if let Err(e) = result {
                warn!("archive persistence failed, entry kept in memory only: {e}");
                warnings.push(format!("archive persistence failed: {e}"));
            }
        }
        warnings
    }

    /// Bring every entry's score up to `now`. Each entry decays only for
    /// the time since it was archived or last decayed.
    pub fn decay_to(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        self.decay_entries(&mut state, now);
    }

    fn decay_entries(&self, state: &mut ArchiveState, now: DateTime<Utc>) {
        for entry in &mut state.entries {
            entry.decay_to(now, self.settings.decay, self.settings.decay_interval_secs);
        }
    }

    /// Search for content related to `query`.
    pub async fn search(&self, query: &str, opts: SearchOptions) -> ArchiveSearchResult {
        self.search_at(query, opts, Utc::now()).await
    }

    pub async fn search_at(
        &self,
        query: &str,
        opts: SearchOptions,
        now: DateTime<Utc>,
    ) -> ArchiveSearchResult {
        if self.lock().closed {
            return ArchiveSearchResult::default();
        }
        self.decay_to(now);

        let candidates: Vec<(String, String)> = self
            .lock()
            .entries
            .iter()
            .map(|e| (e.id.clone(), e.text()))
            .collect();

        let mut matches = Vec::new();
        for (id, text) in &candidates {
            let score = self.match_score(query, text).await;
            matches.push((id.clone(), score));
        }

        let min = opts.min_relevance.unwrap_or(self.settings.min_relevance);
        let mut state = self.lock();
        state.searches += 1;

        let mut ranked: Vec<(usize, f64)> = matches
            .into_iter()
            .filter(|(_, s)| *s > 0.0 && *s >= min)
            .filter_map(|(id, s)| state.entries.iter().position(|e| e.id == id).map(|i| (i, s)))
            .collect();
        let rank_key = |(i, s): &(usize, f64)| s * (0.5 + 0.5 * state.entries[*i].relevance_score);
        ranked.sort_by(|a, b| {
            rank_key(b)
                .total_cmp(&rank_key(a))
                .then(state.entries[b.0].archived_at.cmp(&state.entries[a.0].archived_at))
        });

        // Each entry contributes its leading snippets that still fit; an
        // entry whose first snippet is too large is passed over.
        let mut result = ArchiveSearchResult::default();
        for (i, match_score) in ranked {
            if result.total_tokens >= opts.max_context_tokens {
                break;
            }
            let snippets = state.entries[i].snippets.clone();
            let mut contributed = false;
            for snippet in snippets {
                let tokens = heuristic_token_count(&snippet);
                if result.total_tokens + tokens > opts.max_context_tokens {
                    break;
                }
                result.total_tokens += tokens;
                result.snippets.push(snippet);
                contributed = true;
            }
            if contributed {
                boost(&mut state, i, match_score, &mut result);
            }
        }

        result.found = !result.sources.is_empty();
        let found = result.found;
        if found {
            state.hits += 1;
        } else {
            state.misses += 1;
        }

        debug!(
            query,
            found,
            sources = result.sources.len(),
            tokens = result.total_tokens,
            "archive search"
        );
        result
    }

    async fn match_score(&self, query: &str, text: &str) -> f64 {
        if let Some(oracle) = &self.relevance {
            match oracle.score(query, text).await {
                Ok(s) => return s.clamp(0.0, 1.0),
                Err(e) => debug!("relevance oracle failed, using lexical match: {e}"),
            }
        }
        LexicalRelevance::score_sync(query, text)
    }

    pub fn get(&self, id: &str) -> Option<ArchiveEntry> {
        self.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ArchiveStats {
        let state = self.lock();
        let max_size = self.settings.max_size;
        ArchiveStats {
            total_entries: state.entries.len(),
            total_size: state.total_size,
            max_size,
            usage_percentage: if max_size > 0 {
                state.total_size as f64 / max_size as f64 * 100.0
            } else {
                0.0
            },
            searches: state.searches,
            hits: state.hits,
            misses: state.misses,
        }
    }

    pub fn relevance_stats(&self) -> RelevanceStats {
        let state = self.lock();
        if state.entries.is_empty() {
            return RelevanceStats::default();
        }
        let scores = state.entries.iter().map(|e| e.relevance_score);
        let n = state.entries.len();
        RelevanceStats {
            entries: n,
            mean: scores.clone().sum::<f64>() / n as f64,
            min: scores.clone().fold(f64::INFINITY, f64::min),
            max: scores.fold(f64::NEG_INFINITY, f64::max),
        }
    }

    /// What the sink currently holds.
    pub async fn sink_stats(&self) -> Option<SinkStats> {
        self.sink.stats().await.ok()
    }

    /// Flush pending writes, then drop in-memory state and refuse further use.
    pub async fn close(&self) -> Vec<String> {
        let warnings = self.flush().await;
        let mut state = self.lock();
        state.entries.clear();
        state.total_size = 0;
        state.closed = true;
        warnings
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Credit a retrieved entry and record it as a source.
fn boost(state: &mut ArchiveState, i: usize, match_score: f64, result: &mut ArchiveSearchResult) {
    let entry = &mut state.entries[i];
    entry.relevance_score = (entry.relevance_score + RETRIEVAL_BOOST).min(1.0);
    result.sources.push(ArchiveSource {
        id: entry.id.clone(),
        message_id: entry.message_id.clone(),
        role: entry.role,
        match_score,
        relevance_score: entry.relevance_score,
    });
}

/// Split content into consecutive slices of at most [`SNIPPET_CHARS`]
/// characters and keep at most `max_bytes` bytes of them.
///
/// A slice ends just after the last whitespace character that fits, so
/// words stay whole unless one is longer than a snippet. Concatenating the
/// slices reproduces `content` unless the budget cut it.
///
/// Returns the snippets and whether anything was cut.
pub fn split_snippets(content: &str, max_bytes: usize) -> (Vec<String>, bool) {
    let mut snippets = Vec::new();
    let mut used = 0;
    let mut rest = content;

    while !rest.is_empty() {
        let end = snippet_end(rest);
        let (head, tail) = rest.split_at(end);

        if used + head.len() > max_bytes {
            let room = max_bytes - used;
            let mut cut = room.min(head.len());
            while !head.is_char_boundary(cut) {
                cut -= 1;
            }
            let (kept, _) = head.split_at(cut);
            if !kept.is_empty() {
                snippets.push(kept.to_string());
            }
            return (snippets, true);
        }

        used += head.len();
        snippets.push(head.to_string());
        rest = tail;
    }
    (snippets, false)
}

/// Byte offset at which the next snippet of `text` ends.
fn snippet_end(text: &str) -> usize {
    let mut limit = text.len();
    let mut last_break = None;
    for (n, (i, c)) in text.char_indices().enumerate() {
        if n == SNIPPET_CHARS {
            limit = i;
            break;
        }
        if c.is_whitespace() {
            last_break = Some(i + c.len_utf8());
        }
    }
    if limit == text.len() {
        return limit;
    }
    last_break.unwrap_or(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::oracle::OracleFuture;
    use super::sink::MemorySink;
    use chrono::Duration;

    fn settings(max_size: usize) -> ArchiveSettings {
        ArchiveSettings {
            max_size,
            max_entry_bytes: max_size,
            decay: 0.95,
            decay_interval_secs: 3600,
            min_relevance: 0.3,
        }
    }

    fn store(max_size: usize) -> ArchiveStore {
        ArchiveStore::new(
            settings(max_size),
            Arc::new(MemorySink::new()),
            Some(Arc::new(LexicalRelevance)),
        )
    }

    fn record(id: &str, content: &str, priority: u8) -> ArchiveRecord {
        ArchiveRecord {
            message_id: id.into(),
            role: MessageRole::User,
            content: content.into(),
            priority,
            reason: ArchiveReason::Dropped,
        }
    }

    #[test]
    fn snippets_break_after_whitespace() {
        let text = "word ".repeat(200);
        let (snippets, truncated) = split_snippets(&text, usize::MAX);
        assert!(!truncated);
        assert!(snippets.len() >= 3);
        assert!(snippets.iter().all(|s| s.chars().count() <= SNIPPET_CHARS));
        assert!(snippets.iter().all(|s| s.starts_with("word") && s.ends_with(' ')));
        assert_eq!(snippets.concat(), text);
    }

    #[test]
    fn snippets_preserve_code_layout() {
        let small = "fn main() {\n    let v = vec![3, 1, 2];\n}\n";
        let (snippets, truncated) = split_snippets(small, usize::MAX);
        assert!(!truncated);
        assert_eq!(snippets, vec![small.to_string()]);

        let mut long = String::new();
        for i in 0..40 {
            long.push_str(&format!("    if values[{i}] > max {{\n        max = values[{i}];\n    }}\n"));
        }
        let (snippets, truncated) = split_snippets(&long, usize::MAX);
        assert!(!truncated);
        assert!(snippets.len() > 1);
        assert_eq!(snippets.concat(), long);
    }

    #[test]
    fn snippets_respect_byte_budget() {
        let (snippets, truncated) = split_snippets("ünïcödé wörds hère", 10);
        assert!(truncated);
        let bytes: usize = snippets.iter().map(|s| s.len()).sum();
        assert!(bytes <= 10);
    }

    #[test]
    fn long_words_are_hard_split() {
        let word = "x".repeat(SNIPPET_CHARS * 2 + 5);
        let (snippets, _) = split_snippets(&word, usize::MAX);
        assert_eq!(snippets.len(), 3);
    }

    #[test]
    fn initial_relevance_tracks_priority() {
        assert!((initial_relevance(1) - 0.55).abs() < 1e-9);
        assert!((initial_relevance(10) - 1.0).abs() < 1e-9);
        assert!(initial_relevance(8) > initial_relevance(5));
    }

    #[tokio::test]
    async fn store_then_search_round_trip() {
        let archive = store(10_000);
        let receipt = archive.store(record("m1", "TypeScript sorting function example", 5));
        let id = receipt.id.unwrap();

        let result = archive
            .search(
                "TypeScript sorting function example",
                SearchOptions::default().with_min_relevance(0.0),
            )
            .await;
        assert!(result.found);
        assert!(result.sources.iter().any(|s| s.id == id));
        assert_eq!(result.snippets, vec!["TypeScript sorting function example"]);
    }

    #[tokio::test]
    async fn search_filters_by_min_relevance() {
        let archive = store(10_000);
        archive.store(record("m1", "sourdough starter hydration", 5));

        let result = archive
            .search("rust borrow checker", SearchOptions::default())
            .await;
        assert!(!result.found);
        assert!(result.sources.is_empty());

        let stats = archive.stats();
        assert_eq!(stats.searches, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn search_ranks_better_matches_first() {
        let archive = store(10_000);
        archive.store(record("weak", "sorting notes", 5));
        archive.store(record("strong", "TypeScript sorting comparator", 5));

        let result = archive
            .search("TypeScript sorting", SearchOptions::default())
            .await;
        assert!(result.found);
        assert_eq!(result.sources[0].message_id, "strong");
    }

    #[tokio::test]
    async fn search_stops_at_token_budget() {
        let archive = store(100_000);
        let long = "TypeScript sorting ".repeat(100);
        archive.store(record("m1", &long, 5));

        let result = archive
            .search(
                "TypeScript sorting",
                SearchOptions::default().with_max_tokens(150),
            )
            .await;
        assert!(result.found);
        assert!(result.total_tokens <= 150);
        assert!(!result.snippets.is_empty());
        assert!(result.snippets.len() < 5);
    }

    #[tokio::test]
    async fn oversized_snippet_is_passed_over() {
        let archive = store(100_000);
        archive.store(record("big", &"TypeScript sorting ".repeat(30), 5));
        archive.store(record("small", "TypeScript sorting tips", 5));

        let result = archive
            .search(
                "TypeScript sorting",
                SearchOptions::default().with_max_tokens(50),
            )
            .await;
        assert!(result.found);
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].message_id, "small");
        assert_eq!(result.snippets, vec!["TypeScript sorting tips"]);
        assert!(result.total_tokens <= 50);
    }

    #[tokio::test]
    async fn nothing_fitting_the_budget_is_a_miss() {
        let archive = store(100_000);
        archive.store(record("big", &"TypeScript sorting ".repeat(30), 5));

        let result = archive
            .search(
                "TypeScript sorting",
                SearchOptions::default().with_max_tokens(50),
            )
            .await;
        assert!(!result.found);
        assert!(result.sources.is_empty());
        assert!(result.snippets.is_empty());
        assert_eq!(archive.stats().misses, 1);
    }

    #[test]
    fn empty_content_is_refused() {
        let archive = store(1000);
        let receipt = archive.store(record("m1", "", 5));
        assert_eq!(receipt.refused, Some(StoreRefusal::Empty));
        assert!(archive.is_empty());
    }

    #[tokio::test]
    async fn retrieval_boosts_score() {
        let archive = store(10_000);
        let id = archive
            .store(record("m1", "TypeScript sorting function", 5))
            .id
            .unwrap();
        let before = archive.get(&id).unwrap().relevance_score;

        let now = archive.get(&id).unwrap().archived_at;
        archive
            .search_at("TypeScript sorting", SearchOptions::default(), now)
            .await;
        let after = archive.get(&id).unwrap().relevance_score;
        assert!((after - (before + RETRIEVAL_BOOST)).abs() < 1e-9);
    }

    #[test]
    fn decay_is_multiplicative_per_interval() {
        let archive = store(10_000);
        let start = Utc::now();
        let id = archive.store_at(record("m1", "content", 10), start).id.unwrap();

        archive.decay_to(start + Duration::hours(2));
        let score = archive.get(&id).unwrap().relevance_score;
        assert!((score - 0.95f64.powi(2)).abs() < 1e-9);

        // Time going backwards is ignored.
        archive.decay_to(start);
        assert!((archive.get(&id).unwrap().relevance_score - score).abs() < 1e-12);
    }

    #[tokio::test]
    async fn late_entry_only_decays_from_its_own_arrival() {
        let archive = store(10_000);
        let t0 = Utc::now();
        let early = archive
            .store_at(record("early", "sourdough starter hydration", 5), t0)
            .id
            .unwrap();
        let late_at = t0 + Duration::hours(10);
        let late = archive
            .store_at(record("late", "TypeScript sorting function", 5), late_at)
            .id
            .unwrap();

        let result = archive
            .search_at("TypeScript sorting", SearchOptions::default(), late_at)
            .await;
        assert_eq!(result.sources.len(), 1);

        let late_score = archive.get(&late).unwrap().relevance_score;
        assert!((late_score - (0.75 + RETRIEVAL_BOOST)).abs() < 1e-9);
        let early_score = archive.get(&early).unwrap().relevance_score;
        assert!((early_score - 0.75 * 0.95f64.powi(10)).abs() < 1e-9);

        // A second decay to the same instant changes nothing.
        archive.decay_to(late_at);
        assert!((archive.get(&late).unwrap().relevance_score - late_score).abs() < 1e-12);
    }

    #[test]
    fn stale_scores_decay_before_capacity_eviction() {
        let archive = store(20);
        let t0 = Utc::now();
        let a = archive.store_at(record("a", "aaaaaaaaaa", 9), t0).id.unwrap();
        archive.store_at(record("b", "bbbbbbbbbb", 9), t0);

        let receipt = archive.store_at(record("c", "cccccccccc", 5), t0 + Duration::days(30));
        assert!(receipt.id.is_some());
        assert_eq!(receipt.evicted, vec![a]);
        assert!(archive.stats().total_size <= 20);
    }

    #[test]
    fn capacity_evicts_lowest_relevance_first() {
        let archive = store(30);
        let low = archive.store(record("low", "aaaaaaaaaa", 1)).id.unwrap();
        let mid = archive.store(record("mid", "bbbbbbbbbb", 5)).id.unwrap();
        let high = archive.store(record("high", "cccccccccc", 9)).id.unwrap();
        assert_eq!(archive.stats().total_size, 30);

        let receipt = archive.store(record("new", "dddddddddd", 7));
        assert_eq!(receipt.evicted, vec![low.clone()]);
        assert!(archive.get(&low).is_none());
        assert!(archive.get(&mid).is_some());
        assert!(archive.get(&high).is_some());
        assert!(archive.stats().total_size <= 30);
    }

    #[test]
    fn capacity_ties_evict_oldest() {
        let archive = store(20);
        let t0 = Utc::now();
        let first = archive
            .store_at(record("a", "aaaaaaaaaa", 5), t0)
            .id
            .unwrap();
        archive.store_at(record("b", "bbbbbbbbbb", 5), t0 + Duration::seconds(1));
        let receipt = archive.store_at(record("c", "cccccccccc", 5), t0 + Duration::seconds(2));
        assert_eq!(receipt.evicted, vec![first]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let archive = store(500);
        for i in 0..200u32 {
            let content = "z".repeat((i as usize * 37) % 90 + 1);
            archive.store(record(&format!("m{i}"), &content, (i % 10 + 1) as u8));
            assert!(archive.stats().total_size <= 500);
        }
    }

    #[test]
    fn oversized_entry_is_truncated() {
        let archive = store(50);
        let receipt = archive.store(record("big", &"word ".repeat(100), 5));
        assert!(receipt.truncated);
        let entry = archive.get(&receipt.id.unwrap()).unwrap();
        assert!(entry.truncated);
        assert!(entry.size_bytes <= 50);
    }

    #[test]
    fn low_relevance_entry_cannot_displace_higher_ones() {
        let archive = store(20);
        archive.store(record("a", "aaaaaaaaaa", 9));
        archive.store(record("b", "bbbbbbbbbb", 9));
        let receipt = archive.store(record("c", "cccccccccc", 1));
        assert!(receipt.id.is_none());
        assert_eq!(receipt.refused, Some(StoreRefusal::Full));
        assert!(receipt.evicted.is_empty());
        assert_eq!(archive.len(), 2);
    }

    #[tokio::test]
    async fn flush_writes_to_sink_and_open_restores() {
        let sink = Arc::new(MemorySink::new());
        let archive = ArchiveStore::new(settings(1000), sink.clone(), None);
        archive.store(record("m1", "persist me", 5));
        assert!(archive.flush().await.is_empty());
        assert_eq!(sink.stats().await.unwrap().entries, 1);

        let reopened = ArchiveStore::new(settings(1000), sink, None);
        assert!(reopened.open().await.is_empty());
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.stats().total_size, "persist me".len());
    }

    #[tokio::test]
    async fn failing_sink_only_warns() {
        struct BrokenSink;
        impl ArchiveSink for BrokenSink {
            fn put<'a>(&'a self, _: &'a ArchiveEntry) -> sink::SinkFuture<'a, ()> {
                Box::pin(async {
                    Err(crate::error::ArchiveError::Io {
                        path: "broken".into(),
                        source: std::io::Error::other("disk full"),
                    })
                })
            }
            fn get<'a>(&'a self, _: &'a str) -> sink::SinkFuture<'a, Option<ArchiveEntry>> {
                Box::pin(async { Ok(None) })
            }
            fn evict<'a>(&'a self, _: &'a str) -> sink::SinkFuture<'a, ()> {
                Box::pin(async { Ok(()) })
            }
            fn load_all(&self) -> sink::SinkFuture<'_, Vec<ArchiveEntry>> {
                Box::pin(async {
                    Err(crate::error::ArchiveError::Io {
                        path: "broken".into(),
                        source: std::io::Error::other("disk full"),
                    })
                })
            }
            fn stats(&self) -> sink::SinkFuture<'_, SinkStats> {
                Box::pin(async { Ok(SinkStats::default()) })
            }
        }

        let archive = ArchiveStore::new(settings(1000), Arc::new(BrokenSink), None);
        assert_eq!(archive.open().await.len(), 1);
        archive.store(record("m1", "kept in memory", 5));
        assert_eq!(archive.flush().await.len(), 1);
        assert_eq!(archive.len(), 1);
    }

    #[tokio::test]
    async fn failing_relevance_oracle_uses_lexical_match() {
        struct Down;
        impl RelevanceOracle for Down {
            fn score<'a>(&'a self, _: &'a str, _: &'a str) -> OracleFuture<'a, f64> {
                Box::pin(async { Err(OracleError::Unavailable("down".into())) })
            }
        }
        let archive = ArchiveStore::new(
            settings(1000),
            Arc::new(MemorySink::new()),
            Some(Arc::new(Down)),
        );
        archive.store(record("m1", "TypeScript sorting function", 5));
        let result = archive
            .search("TypeScript sorting", SearchOptions::default())
            .await;
        assert!(result.found);
    }

    #[tokio::test]
    async fn closed_archive_refuses_work() {
        let archive = store(1000);
        archive.store(record("m1", "TypeScript sorting", 5));
        archive.close().await;
        assert!(archive.is_closed());
        assert!(archive.is_empty());
        let receipt = archive.store(record("m2", "more", 5));
        assert!(receipt.id.is_none());
        assert_eq!(receipt.refused, Some(StoreRefusal::Closed));
        let result = archive
            .search("TypeScript", SearchOptions::default().with_min_relevance(0.0))
            .await;
        assert!(!result.found);
    }

    #[test]
    fn relevance_stats_summarize_scores() {
        let archive = store(10_000);
        assert_eq!(archive.relevance_stats(), RelevanceStats::default());
        archive.store(record("a", "one", 1));
        archive.store(record("b", "two", 10));
        let stats = archive.relevance_stats();
        assert_eq!(stats.entries, 2);
        assert!((stats.min - 0.55).abs() < 1e-9);
        assert!((stats.max - 1.0).abs() < 1e-9);
        assert!((stats.mean - 0.775).abs() < 1e-9);
    }
}
