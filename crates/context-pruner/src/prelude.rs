//! Convenience re-exports for common `context-pruner` types.
//!
//! Meant to be glob-imported by hosts:
//!
//! ```ignore
//! use context_pruner::prelude::*;
//! ```
//!
//! This pulls in the facade, its configuration, [`Message`] constructors,
//! the oracle traits with their built-in implementations, and the result
//! types of every public operation. Strategy internals, the selection loop
//! and archive sinks stay in their modules; import those directly when
//! needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, MessageRole, json_schema_for};

// ── Facade ──────────────────────────────────────────────────────────
pub use crate::pruner::{ContextPruner, PruneOptions, PrunerStats, PrunerStatus};

// ── Configuration and errors ────────────────────────────────────────
pub use crate::config::{AdaptiveWeights, PrunerConfig, StrategyKind};
pub use crate::error::{ConfigError, PrunerError};

// ── Oracles ─────────────────────────────────────────────────────────
pub use crate::oracle::{HeuristicTokenizer, LexicalRelevance, RelevanceOracle, TokenizerOracle};

// ── Results ─────────────────────────────────────────────────────────
pub use crate::archive::{ArchiveSearchResult, ArchiveStats, SearchOptions};
pub use crate::context::{HealthTier, PassReport, PruneOutcome};
