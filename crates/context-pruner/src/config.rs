//! Configuration for the [`ContextPruner`](crate::pruner::ContextPruner).
//!
//! Every field has a sensible default, so the minimal configuration is just a
//! context limit:
//!
//! ```ignore
//! let config = PrunerConfig::new(128_000);
//! ```
//!
//! Builder methods cover the common settings:
//!
//! ```ignore
//! let config = PrunerConfig::new(128_000)
//!     .with_model("gpt-4o")
//!     .with_thresholds(0.6, 0.75, 0.85, 0.95)
//!     .with_preserve_recent(10)
//!     .with_strategies([StrategyKind::Adaptive, StrategyKind::Temporal]);
//! ```
//!
//! Hosts that keep configuration in a file use the camelCase JSON form:
//!
//! ```json
//! { "contextLimit": 128000, "model": "gpt-4o", "preserveRecent": 10 }
//! ```

use crate::error::ConfigError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default model identifier handed to the tokenizer oracle.
pub const DEFAULT_MODEL: &str = "default";

/// Default archive capacity in bytes (10 MiB).
pub const DEFAULT_ARCHIVE_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Default byte budget for a single archive entry (64 KiB).
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 64 * 1024;

// ── Strategy names ────────────────────────────────────────────────

/// Named eviction/compression strategy.
///
/// Resolved to an implementation through the
/// [`StrategyRegistry`](crate::context::strategy::StrategyRegistry) when the
/// pruner is constructed.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Oldest non-mandatory turns first.
    Temporal,
    /// Least relevant to the query or topic centroid first.
    Semantic,
    /// Shrink large, low-priority turns to an extractive summary.
    Extractive,
    /// Blend of temporal and semantic scores, choosing drop vs. compress per victim.
    Adaptive,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Temporal => write!(f, "temporal"),
            StrategyKind::Semantic => write!(f, "semantic"),
            StrategyKind::Extractive => write!(f, "extractive"),
            StrategyKind::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temporal" => Ok(StrategyKind::Temporal),
            "semantic" => Ok(StrategyKind::Semantic),
            "extractive" => Ok(StrategyKind::Extractive),
            "adaptive" => Ok(StrategyKind::Adaptive),
            other => Err(ConfigError::Parse(format!("unknown strategy: {other}"))),
        }
    }
}

// ── Adaptive blending ─────────────────────────────────────────────

/// Weights used by the adaptive strategy to blend its two scoring axes.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveWeights {
    /// Weight of the recency axis.
    pub temporal: f64,
    /// Weight of the relevance axis.
    pub semantic: f64,
    /// An axis score below this counts as "low" when choosing drop vs. compress.
    pub low_score_cutoff: f64,
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            temporal: 0.5,
            semantic: 0.5,
            low_score_cutoff: 0.5,
        }
    }
}

// ── PrunerConfig ──────────────────────────────────────────────────

/// Full configuration for a pruner instance.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrunerConfig {
    /// Model input budget in tokens.
    pub context_limit: usize,
    /// Model identifier passed to the tokenizer oracle.
    pub model: String,
    /// Strategies applied, in order, by each compaction pass.
    pub strategies: Vec<StrategyKind>,

    /// Whether `process_messages` compacts on its own.
    pub auto_prune: bool,
    pub auto_compact: bool,
    pub dynamic_context: bool,

    pub warning_threshold: f64,
    pub prune_threshold: f64,
    pub aggressive_compact_threshold: f64,
    pub emergency_threshold: f64,

    /// Most recent messages that are never evicted.
    pub preserve_recent: usize,
    /// Highest-priority messages that are never evicted.
    pub preserve_high_priority: usize,
    /// Never evict system messages.
    pub preserve_system: bool,

    /// Minimum match score for archive search hits.
    pub min_relevance_score: f64,
    /// Multiplicative archive score decay per `decay_interval_secs`.
    pub relevance_decay: f64,
    /// Length of one decay step, in seconds.
    pub decay_interval_secs: u64,

    pub enable_archive: bool,
    /// Directory for the JSON archive sink. `None` keeps the archive in memory.
    pub archive_path: Option<PathBuf>,
    /// Archive capacity in bytes.
    pub archive_max_size: usize,
    /// Byte budget for one archive entry; larger content is truncated.
    pub max_entry_bytes: usize,

    /// Rank semantic victims against the caller's query when one is supplied.
    pub query_aware_compaction: bool,

    /// Fraction of `context_limit` held back while token counts are approximate.
    pub approximate_slack: f64,
    /// Priority at or above which non-mandatory messages are only touched in emergencies.
    pub high_priority_level: u8,
    /// Target size of an extractive summary relative to the original.
    pub compression_ratio: f64,
    pub adaptive_weights: AdaptiveWeights,
    /// Maximum entries kept by the token count cache.
    pub token_cache_capacity: usize,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            context_limit: 128_000,
            model: DEFAULT_MODEL.to_string(),
            strategies: vec![
                StrategyKind::Semantic,
                StrategyKind::Extractive,
                StrategyKind::Temporal,
            ],
            auto_prune: true,
            auto_compact: true,
            dynamic_context: true,
            warning_threshold: 0.70,
            prune_threshold: 0.80,
            aggressive_compact_threshold: 0.90,
            emergency_threshold: 0.95,
            preserve_recent: 15,
            preserve_high_priority: 8,
            preserve_system: true,
            min_relevance_score: 0.3,
            relevance_decay: 0.95,
            decay_interval_secs: 3600,
            enable_archive: true,
            archive_path: None,
            archive_max_size: DEFAULT_ARCHIVE_MAX_SIZE,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            query_aware_compaction: true,
            approximate_slack: 0.05,
            high_priority_level: 8,
            compression_ratio: 0.3,
            adaptive_weights: AdaptiveWeights::default(),
            token_cache_capacity: 4096,
        }
    }
}

impl PrunerConfig {
    /// Create a config with the given context limit and defaults for everything else.
    pub fn new(context_limit: usize) -> Self {
        Self {
            context_limit,
            ..Self::default()
        }
    }

    /// Parse a camelCase JSON configuration and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the four health-tier thresholds (warning, prune, aggressive, emergency).
    pub fn with_thresholds(mut self, warning: f64, prune: f64, aggressive: f64, emergency: f64) -> Self {
        self.warning_threshold = warning;
        self.prune_threshold = prune;
        self.aggressive_compact_threshold = aggressive;
        self.emergency_threshold = emergency;
        self
    }

    pub fn with_strategies(mut self, strategies: impl IntoIterator<Item = StrategyKind>) -> Self {
        self.strategies = strategies.into_iter().collect();
        self
    }

    pub fn with_preserve_recent(mut self, n: usize) -> Self {
        self.preserve_recent = n;
        self
    }

    pub fn with_preserve_high_priority(mut self, n: usize) -> Self {
        self.preserve_high_priority = n;
        self
    }

    pub fn with_preserve_system(mut self, preserve: bool) -> Self {
        self.preserve_system = preserve;
        self
    }

    /// Enable the archive, optionally persisting it under `path`.
    pub fn with_archive(mut self, path: Option<PathBuf>, max_size: usize) -> Self {
        self.enable_archive = true;
        self.archive_path = path;
        self.archive_max_size = max_size;
        self
    }

    pub fn without_archive(mut self) -> Self {
        self.enable_archive = false;
        self
    }

    /// Turn automatic compaction in `process_messages` on or off.
    pub fn with_auto_compaction(mut self, enabled: bool) -> Self {
        self.auto_prune = enabled;
        self.auto_compact = enabled;
        self.dynamic_context = enabled;
        self
    }

    pub fn with_min_relevance_score(mut self, score: f64) -> Self {
        self.min_relevance_score = score;
        self
    }

    pub fn with_relevance_decay(mut self, decay: f64) -> Self {
        self.relevance_decay = decay;
        self
    }

    pub fn with_adaptive_weights(mut self, weights: AdaptiveWeights) -> Self {
        self.adaptive_weights = weights;
        self
    }

    /// Whether `process_messages` should run tier-driven compaction.
    ///
    /// Any of the three switches being off hands compaction over to explicit
    /// `prune`/`auto_compact` calls.
    pub fn automatic_compaction(&self) -> bool {
        self.auto_prune && self.auto_compact && self.dynamic_context
    }

    /// Check ranges and ordering. The only error class that aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context_limit == 0 {
            return Err(ConfigError::ZeroContextLimit);
        }

        let thresholds = [
            ("warningThreshold", self.warning_threshold),
            ("pruneThreshold", self.prune_threshold),
            ("aggressiveCompactThreshold", self.aggressive_compact_threshold),
            ("emergencyThreshold", self.emergency_threshold),
        ];
        for (name, value) in thresholds {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        for pair in thresholds.windows(2) {
            let (lower, lower_value) = pair[0];
            let (upper, upper_value) = pair[1];
            if lower_value >= upper_value {
                return Err(ConfigError::ThresholdOrder {
                    lower,
                    lower_value,
                    upper,
                    upper_value,
                });
            }
        }

        for (name, value) in [
            ("minRelevanceScore", self.min_relevance_score),
            ("relevanceDecay", self.relevance_decay),
            ("compressionRatio", self.compression_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::FractionOutOfRange { name, value });
            }
        }

        if !(0.0..0.5).contains(&self.approximate_slack) {
            return Err(ConfigError::SlackOutOfRange(self.approximate_slack));
        }
        if self.enable_archive && self.archive_max_size == 0 {
            return Err(ConfigError::ZeroArchiveSize);
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::NoStrategies);
        }

        let w = &self.adaptive_weights;
        if w.temporal < 0.0 || w.semantic < 0.0 || (w.temporal + w.semantic) <= 0.0 {
            return Err(ConfigError::InvalidAdaptiveWeights);
        }

        Ok(())
    }
}
