//! Eviction strategies: rank evictable messages and pick an action for each.
//!
//! A strategy only *ranks*; the selection loop in
//! [`eviction`](super::eviction) applies victims one at a time and stops as
//! soon as the target is met. Strategies never see mandatory messages: the
//! loop hands them a candidate list that already excludes them.
//!
//! Strategies are resolved from [`StrategyKind`] through a
//! [`StrategyRegistry`] built once, when the pruner is constructed.

use crate::Message;
use crate::config::{AdaptiveWeights, StrategyKind};
use crate::oracle::RelevanceOracle;
use futures::future::{BoxFuture, join_all};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What to do with a selected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimAction {
    /// Remove from the context (archived unless archiving is off).
    Drop,
    /// Replace content with a summary; the original is archived.
    Compress,
}

/// A ranked eviction choice. `index` points into [`StrategyContext::messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    pub index: usize,
    pub action: VictimAction,
}

/// Output of one ranking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    /// Victims, most expendable first.
    pub victims: Vec<Victim>,
    /// The strategy could not use its relevance oracle and fell back to
    /// temporal ordering.
    pub degraded: bool,
}

/// Everything a strategy may look at.
pub struct StrategyContext<'a> {
    pub messages: &'a [Message],
    /// Token count per message, parallel to `messages`.
    pub tokens: &'a [usize],
    /// Indices of evictable messages.
    pub candidates: &'a [usize],
    /// Text to rank relevance against: the caller's query or the topic centroid.
    pub reference: Option<&'a str>,
    pub relevance: Option<&'a dyn RelevanceOracle>,
    pub weights: &'a AdaptiveWeights,
    pub cancel: Option<&'a CancellationToken>,
}

/// A named ranking strategy.
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Rank the context's candidates, most expendable first.
    fn rank<'a>(&'a self, ctx: &'a StrategyContext<'a>) -> BoxFuture<'a, Ranking>;
}

// ── Registry ──────────────────────────────────────────────────────

/// Lookup table from strategy name to implementation.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn Strategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Arc::new(TemporalStrategy));
        registry.register(Arc::new(SemanticStrategy));
        registry.register(Arc::new(ExtractiveStrategy));
        registry.register(Arc::new(AdaptiveStrategy));
        registry
    }
}

impl StrategyRegistry {
    /// Register (or replace) the implementation for a strategy's kind.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn get(&self, kind: StrategyKind) -> Option<&Arc<dyn Strategy>> {
        self.strategies.get(&kind)
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.strategies.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("StrategyRegistry")
            .field("strategies", &kinds)
            .finish()
    }
}

// ── Shared helpers ────────────────────────────────────────────────

/// Candidates ordered oldest first; list position breaks timestamp ties.
fn oldest_first(ctx: &StrategyContext<'_>) -> Vec<usize> {
    let mut order = ctx.candidates.to_vec();
    order.sort_by(|&a, &b| {
        ctx.messages[a]
            .timestamp
            .cmp(&ctx.messages[b].timestamp)
            .then(a.cmp(&b))
    });
    order
}

fn drop_all(order: Vec<usize>) -> Vec<Victim> {
    order
        .into_iter()
        .map(|index| Victim {
            index,
            action: VictimAction::Drop,
        })
        .collect()
}

/// Score every candidate against the reference text.
///
/// Returns `None` if there is no oracle, no reference, the call was
/// cancelled, or any score failed; callers fall back to temporal order.
async fn relevance_scores(ctx: &StrategyContext<'_>) -> Option<HashMap<usize, f64>> {
    let oracle = ctx.relevance?;
    let reference = ctx.reference?;

    let calls = ctx.candidates.iter().map(|&i| async move {
        let score = oracle.score(reference, &ctx.messages[i].content).await;
        (i, score)
    });
    let scored = match ctx.cancel {
        Some(token) => tokio::select! {
            r = join_all(calls) => r,
            _ = token.cancelled() => return None,
        },
        None => join_all(calls).await,
    };

    let mut out = HashMap::with_capacity(scored.len());
    for (i, score) in scored {
        match score {
            Ok(s) => {
                out.insert(i, s.clamp(0.0, 1.0));
            }
            Err(e) => {
                warn!("relevance oracle failed, falling back to temporal order: {e}");
                return None;
            }
        }
    }
    Some(out)
}

/// Whether a missing relevance score is a degradation (oracle absent or
/// failing) rather than simply having nothing to compare against.
fn relevance_degraded(ctx: &StrategyContext<'_>) -> bool {
    ctx.reference.is_some() && !ctx.candidates.is_empty()
}

// ── Temporal ──────────────────────────────────────────────────────

/// Oldest non-mandatory turns go first.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemporalStrategy;

impl Strategy for TemporalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Temporal
    }

    fn rank<'a>(&'a self, ctx: &'a StrategyContext<'a>) -> BoxFuture<'a, Ranking> {
        Box::pin(async move {
            Ranking {
                victims: drop_all(oldest_first(ctx)),
                degraded: false,
            }
        })
    }
}

// ── Semantic ──────────────────────────────────────────────────────

/// Least relevant to the query (or topic centroid) goes first.
#[derive(Debug, Default, Clone, Copy)]
pub struct SemanticStrategy;

impl Strategy for SemanticStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn rank<'a>(&'a self, ctx: &'a StrategyContext<'a>) -> BoxFuture<'a, Ranking> {
        Box::pin(async move {
            let Some(scores) = relevance_scores(ctx).await else {
                let degraded = relevance_degraded(ctx);
                if degraded {
                    debug!("semantic ranking degraded to temporal order");
                }
                return Ranking {
                    victims: drop_all(oldest_first(ctx)),
                    degraded,
                };
            };

            // Oldest-first base order makes it the tiebreak.
            let mut order = oldest_first(ctx);
            order.sort_by(|a, b| scores[a].total_cmp(&scores[b]));
            Ranking {
                victims: drop_all(order),
                degraded: false,
            }
        })
    }
}

// ── Extractive ────────────────────────────────────────────────────

/// Compress the messages with the most tokens per unit of priority.
///
/// Already-compressed messages are not candidates.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveStrategy;

impl Strategy for ExtractiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Extractive
    }

    fn rank<'a>(&'a self, ctx: &'a StrategyContext<'a>) -> BoxFuture<'a, Ranking> {
        Box::pin(async move {
            let ratio = |i: usize| ctx.tokens[i] as f64 / ctx.messages[i].priority.max(1) as f64;
            let mut order: Vec<usize> = oldest_first(ctx)
                .into_iter()
                .filter(|&i| !ctx.messages[i].compressed)
                .collect();
            order.sort_by(|&a, &b| ratio(b).total_cmp(&ratio(a)));
            Ranking {
                victims: order
                    .into_iter()
                    .map(|index| Victim {
                        index,
                        action: VictimAction::Compress,
                    })
                    .collect(),
                degraded: false,
            }
        })
    }
}

// ── Adaptive ──────────────────────────────────────────────────────

/// Blends recency and relevance, then drops messages that score low on
/// both axes and compresses those that score low on only one.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdaptiveStrategy;

/// Per-candidate scores used by the adaptive strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveScore {
    /// 0.0 for the oldest candidate, 1.0 for the newest.
    pub recency: f64,
    pub relevance: f64,
    pub blended: f64,
}

impl AdaptiveScore {
    pub fn new(recency: f64, relevance: f64, weights: &AdaptiveWeights) -> Self {
        let total = weights.temporal + weights.semantic;
        let blended = if total > 0.0 {
            (weights.temporal * recency + weights.semantic * relevance) / total
        } else {
            recency
        };
        Self {
            recency,
            relevance,
            blended,
        }
    }

    /// Drop when both axes are low, compress otherwise.
    pub fn action(&self, cutoff: f64) -> VictimAction {
        if self.recency < cutoff && self.relevance < cutoff {
            VictimAction::Drop
        } else {
            VictimAction::Compress
        }
    }
}

impl Strategy for AdaptiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn rank<'a>(&'a self, ctx: &'a StrategyContext<'a>) -> BoxFuture<'a, Ranking> {
        Box::pin(async move {
            let by_age = oldest_first(ctx);
            let n = by_age.len();
            let recency: HashMap<usize, f64> = by_age
                .iter()
                .enumerate()
                .map(|(pos, &i)| {
                    let r = if n > 1 {
                        pos as f64 / (n - 1) as f64
                    } else {
                        0.0
                    };
                    (i, r)
                })
                .collect();

            let relevance = relevance_scores(ctx).await;
            let degraded = relevance.is_none() && relevance_degraded(ctx);

            let scores: HashMap<usize, AdaptiveScore> = by_age
                .iter()
                .map(|&i| {
                    let r = recency[&i];
                    let score = match &relevance {
                        Some(rel) => AdaptiveScore::new(r, rel[&i], ctx.weights),
                        // Temporal axis only: behaves like a temporal drop.
                        None => AdaptiveScore {
                            recency: r,
                            relevance: 0.0,
                            blended: r,
                        },
                    };
                    (i, score)
                })
                .collect();

            let mut order = by_age;
            order.sort_by(|a, b| {
                scores[a]
                    .blended
                    .partial_cmp(&scores[b].blended)
                    .unwrap_or(Ordering::Equal)
            });

            Ranking {
                victims: order
                    .into_iter()
                    .map(|index| Victim {
                        index,
                        action: scores[&index].action(ctx.weights.low_score_cutoff),
                    })
                    .collect(),
                degraded,
            }
        })
    }
}
