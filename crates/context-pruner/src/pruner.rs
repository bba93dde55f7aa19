//! The [`ContextPruner`] facade: one instance per conversation.
//!
//! The pruner owns the token accountant, the strategy registry, and the
//! archive. It never keeps the caller's message list; every operation takes
//! a list and hands back a new one inside a [`PruneOutcome`].
//!
//! Operations on one instance are serialized through an async mutex, so two
//! overlapping calls run one after the other and each sees the archive and
//! counters as the previous call left them.
//!
//! ```ignore
//! let pruner = ContextPruner::new(PrunerConfig::new(8_000))?
//!     .with_tokenizer(Arc::new(MyTokenizer));
//! pruner.initialize().await?;
//!
//! let outcome = pruner.process_messages(messages).await;
//! if outcome.report.budget_unsatisfiable {
//!     warn!("system prompt alone is over budget");
//! }
//! let messages = outcome.into_messages();
//! ```

use crate::Message;
use crate::archive::sink::{ArchiveSink, JsonDirSink, MemorySink};
use crate::archive::{
    ArchiveSearchResult, ArchiveSettings, ArchiveStats, ArchiveStore, RelevanceStats,
    SearchOptions,
};
use crate::config::{PrunerConfig, StrategyKind};
use crate::context::eviction::{
    EvictionEngine, EvictionSettings, PassReport, PassRequest, PassTarget, PruneOutcome,
};
use crate::context::health::{HealthTier, PassMode};
use crate::context::retention::RetentionPolicy;
use crate::context::strategy::{Strategy, StrategyRegistry};
use crate::context::summarizer::{ExtractiveSummarizer, Summarizer};
use crate::context::tokens::{ContextUsage, TokenAccountant};
use crate::error::PrunerError;
use crate::oracle::{HeuristicTokenizer, LexicalRelevance, RelevanceOracle, TokenizerOracle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Options and snapshots ─────────────────────────────────────────

/// Parameters of an explicit [`ContextPruner::prune`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneOptions {
    /// Token total to reduce the list to.
    pub target_tokens: usize,
    /// Strategy to use; `None` runs the configured strategies in order.
    pub strategy: Option<StrategyKind>,
}

impl PruneOptions {
    pub fn new(target_tokens: usize) -> Self {
        Self {
            target_tokens,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Token usage in a status snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub used: usize,
    /// Effective limit (after the approximation slack).
    pub limit: usize,
    /// `used / limit * 100`.
    pub percentage: f64,
}

/// Archive section of a status snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStatus {
    pub enabled: bool,
    pub stats: Option<ArchiveStats>,
}

/// Point-in-time view of the pruner, derived on demand.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrunerStatus {
    pub health: HealthTier,
    pub tokens: TokenStatus,
    pub messages: usize,
    pub archive: ArchiveStatus,
    pub relevance_stats: RelevanceStats,
    /// Mandatory messages alone exceed the budget.
    pub budget_unsatisfiable: bool,
    /// Token counts are heuristic estimates.
    pub degraded: bool,
    pub warnings: Vec<String>,
}

/// Cumulative counters since construction or the last [`ContextPruner::reset_stats`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrunerStats {
    /// `process_messages` calls.
    pub calls: u64,
    /// Explicit `prune`, `auto_compact` and `adaptive_compact` calls.
    pub explicit_calls: u64,
    /// Calls that dropped or compressed at least one message.
    pub compactions: u64,
    pub messages_dropped: u64,
    pub messages_compressed: u64,
    pub messages_archived: u64,
    pub tokens_saved: u64,
    /// Calls whose input was rejected and returned unchanged.
    pub errors: u64,
    pub warnings: u64,
    pub unsatisfiable: u64,
    pub cancelled: u64,
    pub archive_searches: u64,
}

impl PrunerStats {
    fn record(&mut self, explicit: bool, report: &PassReport) {
        if explicit {
            self.explicit_calls += 1;
        } else {
            self.calls += 1;
        }
        if report.changed() {
            self.compactions += 1;
        }
        self.messages_dropped += report.dropped as u64;
        self.messages_compressed += report.compressed as u64;
        self.messages_archived += report.archived as u64;
        self.tokens_saved += report.tokens_saved() as u64;
        self.warnings += report.warnings.len() as u64;
        self.errors += u64::from(report.error.is_some());
        self.unsatisfiable += u64::from(report.budget_unsatisfiable);
        self.cancelled += u64::from(report.cancelled);
    }
}

/// What the pruner last handed back, for `get_status`.
#[derive(Debug, Clone, Default)]
struct LastObserved {
    used: usize,
    effective_limit: usize,
    messages: usize,
    budget_unsatisfiable: bool,
    degraded: bool,
    warnings: Vec<String>,
}

struct PrunerState {
    initialized: bool,
    accountant: TokenAccountant,
    archive: Option<ArchiveStore>,
    stats: PrunerStats,
    last: LastObserved,
}

// ── ContextPruner ─────────────────────────────────────────────────

/// Keeps a conversation inside its token budget.
pub struct ContextPruner {
    config: PrunerConfig,
    settings: EvictionSettings,
    retention: RetentionPolicy,
    registry: StrategyRegistry,
    relevance: Option<Arc<dyn RelevanceOracle>>,
    summarizer: Arc<dyn Summarizer>,
    sink: Option<Arc<dyn ArchiveSink>>,
    state: Mutex<PrunerState>,
}

impl std::fmt::Debug for ContextPruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPruner")
            .field("model", &self.config.model)
            .field("context_limit", &self.config.context_limit)
            .field("strategies", &self.config.strategies)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ContextPruner {
    /// Validate `config` and build a pruner with the heuristic tokenizer,
    /// lexical relevance, and the extractive summarizer.
    pub fn new(config: PrunerConfig) -> Result<Self, PrunerError> {
        config.validate()?;
        let accountant = TokenAccountant::new(Arc::new(HeuristicTokenizer), config.model.clone())
            .with_cache_capacity(config.token_cache_capacity);
        Ok(Self {
            settings: EvictionSettings::from_config(&config),
            retention: RetentionPolicy::from_config(&config),
            registry: StrategyRegistry::default(),
            relevance: Some(Arc::new(LexicalRelevance)),
            summarizer: Arc::new(ExtractiveSummarizer::default()),
            sink: None,
            state: Mutex::new(PrunerState {
                initialized: false,
                accountant,
                archive: None,
                stats: PrunerStats::default(),
                last: LastObserved::default(),
            }),
            config,
        })
    }

    /// Use a different tokenizer oracle.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TokenizerOracle>) -> Self {
        self.state.get_mut().accountant = TokenAccountant::new(tokenizer, self.config.model.clone())
            .with_cache_capacity(self.config.token_cache_capacity);
        self
    }

    /// Use a different relevance oracle for ranking and archive search.
    pub fn with_relevance_oracle(mut self, oracle: Arc<dyn RelevanceOracle>) -> Self {
        self.relevance = Some(oracle);
        self
    }

    /// Run without a relevance oracle: semantic and adaptive ranking fall
    /// back to temporal order, archive search to lexical matching.
    pub fn without_relevance_oracle(mut self) -> Self {
        self.relevance = None;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Register (or replace) a strategy implementation.
    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.registry.register(strategy);
        self
    }

    /// Persist the archive through `sink` instead of the one implied by
    /// `archivePath`.
    pub fn with_archive_sink(mut self, sink: Arc<dyn ArchiveSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    /// Open the archive and restore persisted entries. Safe to call more
    /// than once; every other operation calls it implicitly.
    pub async fn initialize(&self) -> Result<(), PrunerError> {
        self.config.validate()?;
        let mut state = self.state.lock().await;
        let warnings = self.ensure_initialized(&mut state).await;
        state.last.warnings.extend(warnings);
        Ok(())
    }

    async fn ensure_initialized(&self, state: &mut PrunerState) -> Vec<String> {
        if state.initialized {
            return Vec::new();
        }
        let mut warnings = Vec::new();

        if self.config.enable_archive {
            let sink: Arc<dyn ArchiveSink> = match (&self.sink, &self.config.archive_path) {
                (Some(sink), _) => sink.clone(),
                (None, Some(path)) => match JsonDirSink::open(path.clone()).await {
                    Ok(sink) => Arc::new(sink),
                    Err(e) => {
                        warn!("archive directory unavailable, archiving in memory: {e}");
                        warnings.push(format!("archive directory unavailable: {e}"));
                        Arc::new(MemorySink::new())
                    }
                },
                (None, None) => Arc::new(MemorySink::new()),
            };
            let archive = ArchiveStore::new(
                ArchiveSettings::from_config(&self.config),
                sink,
                self.relevance.clone(),
            );
            warnings.extend(archive.open().await);
            state.archive = Some(archive);
        }

        state.initialized = true;
        info!(
            model = %self.config.model,
            context_limit = self.config.context_limit,
            archive = self.config.enable_archive,
            "context pruner initialized"
        );
        warnings
    }

    // ── Pruning operations ────────────────────────────────────────

    /// Classify usage and compact as the health tier demands.
    ///
    /// With automatic compaction switched off, only the hard budget is
    /// enforced.
    pub async fn process_messages(&self, messages: Vec<Message>) -> PruneOutcome {
        self.process_messages_cancellable(messages, None).await
    }

    pub async fn process_messages_cancellable(
        &self,
        messages: Vec<Message>,
        cancel: Option<&CancellationToken>,
    ) -> PruneOutcome {
        let strategies = self.config.strategies.clone();
        let req = if self.config.automatic_compaction() {
            PassRequest::tiered(&strategies)
        } else {
            PassRequest::guard_only()
        };
        self.execute(messages, req.with_cancel(cancel), false).await
    }

    /// Reduce the list to `opts.target_tokens`, whatever its tier.
    pub async fn prune(&self, messages: Vec<Message>, opts: PruneOptions) -> PruneOutcome {
        self.prune_cancellable(messages, opts, None).await
    }

    pub async fn prune_cancellable(
        &self,
        messages: Vec<Message>,
        opts: PruneOptions,
        cancel: Option<&CancellationToken>,
    ) -> PruneOutcome {
        let strategies = match opts.strategy {
            Some(kind) => vec![kind],
            None => self.config.strategies.clone(),
        };
        let req = PassRequest::explicit(
            PassTarget::Tokens(opts.target_tokens),
            &strategies,
            PassMode::Aggressive,
        )
        .with_cancel(cancel);
        self.execute(messages, req, true).await
    }

    /// Run one strategy pass now, down to the warning threshold, optionally
    /// ranked against `query`. `None` picks the first configured strategy.
    pub async fn auto_compact(
        &self,
        messages: Vec<Message>,
        query: Option<&str>,
        strategy: Option<StrategyKind>,
    ) -> PruneOutcome {
        self.auto_compact_cancellable(messages, query, strategy, None)
            .await
    }

    pub async fn auto_compact_cancellable(
        &self,
        messages: Vec<Message>,
        query: Option<&str>,
        strategy: Option<StrategyKind>,
        cancel: Option<&CancellationToken>,
    ) -> PruneOutcome {
        let kind = strategy
            .or_else(|| self.config.strategies.first().copied())
            .unwrap_or(StrategyKind::Temporal);
        let strategies = [kind];
        let req = PassRequest::explicit(
            PassTarget::Fraction(self.config.warning_threshold),
            &strategies,
            PassMode::Balanced,
        )
        .with_query(query)
        .with_cancel(cancel);
        self.execute(messages, req, true).await
    }

    /// Like [`prune`](Self::prune), always with the adaptive strategy.
    /// `None` targets the warning threshold.
    pub async fn adaptive_compact(
        &self,
        messages: Vec<Message>,
        target_tokens: Option<usize>,
    ) -> PruneOutcome {
        self.adaptive_compact_cancellable(messages, target_tokens, None)
            .await
    }

    pub async fn adaptive_compact_cancellable(
        &self,
        messages: Vec<Message>,
        target_tokens: Option<usize>,
        cancel: Option<&CancellationToken>,
    ) -> PruneOutcome {
        let target = match target_tokens {
            Some(t) => PassTarget::Tokens(t),
            None => PassTarget::Fraction(self.config.warning_threshold),
        };
        let strategies = [StrategyKind::Adaptive];
        let req = PassRequest::explicit(target, &strategies, PassMode::Aggressive).with_cancel(cancel);
        self.execute(messages, req, true).await
    }

    async fn execute(
        &self,
        messages: Vec<Message>,
        req: PassRequest<'_>,
        explicit: bool,
    ) -> PruneOutcome {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let init_warnings = self.ensure_initialized(state).await;

        let result = {
            let mut engine = EvictionEngine {
                accountant: &mut state.accountant,
                registry: &self.registry,
                retention: self.retention,
                archive: state.archive.as_ref(),
                relevance: self.relevance.as_deref(),
                summarizer: self.summarizer.as_ref(),
                settings: &self.settings,
            };
            engine.run(&messages, &req).await
        };

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("rejected message list, returned unchanged: {e}");
                PruneOutcome {
                    messages,
                    report: PassReport {
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                }
            }
        };

        if let Some(archive) = &state.archive {
            outcome.report.warnings.extend(archive.flush().await);
        }
        if !init_warnings.is_empty() {
            let mut warnings = init_warnings;
            warnings.append(&mut outcome.report.warnings);
            outcome.report.warnings = warnings;
        }

        state.stats.record(explicit, &outcome.report);
        if outcome.report.error.is_none() {
            state.last = LastObserved {
                used: outcome.report.tokens_after,
                effective_limit: outcome.report.effective_limit,
                messages: outcome.messages.len(),
                budget_unsatisfiable: outcome.report.budget_unsatisfiable,
                degraded: outcome.report.degraded_tokenizer,
                warnings: outcome.report.warnings.clone(),
            };
        }
        debug!(
            tier = %outcome.report.tier,
            messages = outcome.messages.len(),
            tokens = outcome.report.tokens_after,
            "pruner call finished"
        );
        outcome
    }

    // ── Archive ───────────────────────────────────────────────────

    /// Search archived content. A disabled archive returns `found: false`.
    pub async fn retrieve_from_archive(
        &self,
        query: &str,
        opts: SearchOptions,
    ) -> ArchiveSearchResult {
        let mut state = self.state.lock().await;
        let warnings = self.ensure_initialized(&mut state).await;
        state.last.warnings.extend(warnings);
        state.stats.archive_searches += 1;
        match &state.archive {
            Some(archive) => archive.search(query, opts).await,
            None => ArchiveSearchResult::default(),
        }
    }

    // ── Status and stats ──────────────────────────────────────────

    /// Snapshot of the list most recently returned by this pruner.
    pub async fn get_status(&self) -> PrunerStatus {
        let state = self.state.lock().await;
        let last = &state.last;
        let limit = if last.effective_limit > 0 {
            last.effective_limit
        } else {
            self.config.context_limit
        };
        let usage = ContextUsage {
            used_tokens: last.used,
            limit: self.config.context_limit,
            effective_limit: limit,
            usage_pct: last.used as f64 / limit as f64,
            approximate: last.degraded,
        };
        self.status_from(&state, usage, last.messages, last.budget_unsatisfiable, last.warnings.clone())
    }

    /// Snapshot computed from `messages`, counting them afresh.
    pub async fn status_for(&self, messages: &[Message]) -> PrunerStatus {
        let mut state = self.state.lock().await;
        let count = state.accountant.count_all(messages).await;
        let usage = ContextUsage::new(count, self.config.context_limit, self.config.approximate_slack);
        let unsatisfiable = {
            let mandatory = self.retention.mandatory_indices(messages);
            let mut mandatory_tokens = 0;
            for i in mandatory {
                mandatory_tokens += state.accountant.count(&messages[i]).await.tokens;
            }
            mandatory_tokens > usage.effective_limit
        };
        self.status_from(&state, usage, messages.len(), unsatisfiable, Vec::new())
    }

    fn status_from(
        &self,
        state: &PrunerState,
        usage: ContextUsage,
        messages: usize,
        budget_unsatisfiable: bool,
        warnings: Vec<String>,
    ) -> PrunerStatus {
        PrunerStatus {
            health: self.settings.thresholds.classify(usage.usage_pct),
            tokens: TokenStatus {
                used: usage.used_tokens,
                limit: usage.effective_limit,
                percentage: usage.usage_pct * 100.0,
            },
            messages,
            archive: ArchiveStatus {
                enabled: self.config.enable_archive,
                stats: state.archive.as_ref().map(|a| a.stats()),
            },
            relevance_stats: state
                .archive
                .as_ref()
                .map(|a| a.relevance_stats())
                .unwrap_or_default(),
            budget_unsatisfiable,
            degraded: usage.approximate,
            warnings,
        }
    }

    pub async fn get_stats(&self) -> PrunerStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn reset_stats(&self) {
        self.state.lock().await.stats = PrunerStats::default();
    }

    /// Flush and close the archive. A later call re-initializes.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        if let Some(archive) = state.archive.take() {
            for w in archive.close().await {
                warn!("{w}");
            }
        }
        state.initialized = false;
        state.last = LastObserved::default();
        info!("context pruner destroyed");
    }
}
