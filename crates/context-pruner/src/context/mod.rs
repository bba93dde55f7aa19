//! Context window management: token accounting, retention, health tiers,
//! eviction strategies, and the selection loop that applies them.
//!
//! The pieces, leaf first:
//!
//! 1. **[`tokens`]**: [`TokenAccountant`] counts tokens through the tokenizer
//!    oracle with a per-instance cache, falling back to a character
//!    heuristic (and a safety slack) when the oracle is down.
//!
//! 2. **[`retention`]**: [`RetentionPolicy`] names the messages no strategy
//!    may touch: system prompt, most recent turns, top-priority turns.
//!
//! 3. **[`health`]**: [`HealthTier`] classifies usage and
//!    [`CompactionPlan`] says how hard the next pass should push.
//!
//! 4. **[`strategy`]**: temporal, semantic, extractive and adaptive rankings,
//!    resolved by name through the [`StrategyRegistry`].
//!
//! 5. **[`summarizer`]**: the pluggable summarizer behind compression.
//!
//! 6. **[`eviction`]**: the selection loop that turns rankings into drops
//!    and compressions, archives what it removes, and enforces the hard
//!    budget.
//!
//! The [`ContextPruner`](crate::pruner::ContextPruner) facade wires all six
//! together.

pub mod eviction;
pub mod health;
pub mod retention;
pub mod strategy;
pub mod summarizer;
pub mod tokens;

// Re-export commonly used items at the module level.
pub use eviction::{PassReport, PruneOutcome};
pub use health::{CompactionPlan, HealthTier, PassMode, Thresholds};
pub use retention::RetentionPolicy;
pub use strategy::{Strategy, StrategyRegistry, VictimAction};
pub use summarizer::{ExtractiveSummarizer, Summarizer};
pub use tokens::{ContextUsage, TokenAccountant, TokenCount};
