//! The selection loop: applies strategy rankings to a message list until the
//! pass target is met.
//!
//! One pass works on a private copy of the caller's list:
//!
//! 1. count every message and classify usage into a [`HealthTier`];
//! 2. run the configured strategies in order, applying victims one at a time
//!    and stopping as soon as the target is met;
//! 3. for aggressive and emergency passes, finish with a temporal sweep over
//!    whatever is still evictable;
//! 4. run the hard-budget guard, which drops non-mandatory messages oldest
//!    first until the list fits the effective limit.
//!
//! Mandatory messages (see [`RetentionPolicy`]) are never handed to a
//! strategy and never touched by the guard. Every drop and every
//! pre-compression original goes to the archive when one is attached.
//!
//! Compressing a message is atomic: the summary is produced and counted
//! first, then the archive write and the content swap happen together with
//! no suspension point in between.

use crate::Message;
use crate::archive::{ArchiveReason, ArchiveRecord, ArchiveStore, StoreRefusal};
use crate::config::{AdaptiveWeights, PrunerConfig, StrategyKind};
use crate::context::health::{HealthTier, PassMode, Thresholds, tokens_below};
use crate::context::retention::RetentionPolicy;
use crate::context::strategy::{
    Strategy, StrategyContext, StrategyRegistry, TemporalStrategy, Victim, VictimAction,
};
use crate::context::summarizer::Summarizer;
use crate::context::tokens::{ContextUsage, TokenAccountant, TokenCount};
use crate::error::MessageError;
use crate::oracle::RelevanceOracle;
use crate::{MAX_PRIORITY, MIN_PRIORITY};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Mandatory messages (newest first) that make up the topic centroid.
pub const CENTROID_MESSAGES: usize = 5;

/// What one pass did.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    /// Tier of the input list.
    pub tier: HealthTier,
    /// Strategies that ran, in order. A trailing temporal entry on an
    /// aggressive pass is the final sweep.
    pub strategies: Vec<StrategyKind>,
    pub dropped: usize,
    pub compressed: usize,
    pub archived: usize,
    /// Messages dropped by the hard-budget guard (included in `dropped`).
    pub guard_dropped: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Limit after the approximation slack.
    pub effective_limit: usize,
    pub target_tokens: Option<usize>,
    pub target_met: bool,
    /// Mandatory messages alone exceed the effective limit.
    pub budget_unsatisfiable: bool,
    pub degraded_tokenizer: bool,
    pub degraded_relevance: bool,
    pub cancelled: bool,
    /// Set when the input was rejected and returned unchanged.
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl PassReport {
    /// Tokens removed by the pass.
    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    /// Whether any message was dropped or compressed.
    pub fn changed(&self) -> bool {
        self.dropped > 0 || self.compressed > 0
    }
}

/// Messages returned by a pruning operation, with the report of the pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneOutcome {
    pub messages: Vec<Message>,
    pub report: PassReport,
}

impl PruneOutcome {
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// How far a pass should reduce the list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassTarget {
    /// Classify usage and follow the tier's compaction plan.
    Tier,
    /// Get strictly below this fraction of the effective limit.
    Fraction(f64),
    /// Reach this token total.
    Tokens(usize),
    /// Only enforce the hard budget.
    GuardOnly,
}

/// Parameters of one pass.
#[derive(Debug, Clone)]
pub struct PassRequest<'a> {
    pub target: PassTarget,
    pub strategies: &'a [StrategyKind],
    /// Mode for explicit targets; tier passes take the mode from the tier.
    pub mode: PassMode,
    /// Finish an explicit-target pass with a temporal sweep.
    pub backstop: bool,
    pub query: Option<&'a str>,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> PassRequest<'a> {
    /// Tier-driven pass over `strategies`.
    pub fn tiered(strategies: &'a [StrategyKind]) -> Self {
        Self {
            target: PassTarget::Tier,
            strategies,
            mode: PassMode::Balanced,
            backstop: false,
            query: None,
            cancel: None,
        }
    }

    /// Pass that only runs the hard-budget guard.
    pub fn guard_only() -> Self {
        Self {
            target: PassTarget::GuardOnly,
            strategies: &[],
            mode: PassMode::Balanced,
            backstop: false,
            query: None,
            cancel: None,
        }
    }

    /// Pass with an explicit target.
    pub fn explicit(target: PassTarget, strategies: &'a [StrategyKind], mode: PassMode) -> Self {
        Self {
            target,
            strategies,
            mode,
            backstop: false,
            query: None,
            cancel: None,
        }
    }

    pub fn with_query(mut self, query: Option<&'a str>) -> Self {
        self.query = query;
        self
    }

    pub fn with_cancel(mut self, cancel: Option<&'a CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_backstop(mut self, backstop: bool) -> Self {
        self.backstop = backstop;
        self
    }
}

/// The configuration slice the selection loop reads.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionSettings {
    pub context_limit: usize,
    pub approximate_slack: f64,
    pub thresholds: Thresholds,
    pub high_priority_level: u8,
    pub compression_ratio: f64,
    pub adaptive_weights: AdaptiveWeights,
    pub query_aware: bool,
}

impl EvictionSettings {
    pub fn from_config(config: &PrunerConfig) -> Self {
        Self {
            context_limit: config.context_limit,
            approximate_slack: config.approximate_slack,
            thresholds: Thresholds::from_config(config),
            high_priority_level: config.high_priority_level,
            compression_ratio: config.compression_ratio,
            adaptive_weights: config.adaptive_weights.clone(),
            query_aware: config.query_aware_compaction,
        }
    }
}

/// Reject lists the engine can't reason about: duplicate ids (victims are
/// tracked by id) and priorities outside `1..=10`.
pub fn validate_messages(messages: &[Message]) -> Result<(), MessageError> {
    let mut seen = HashSet::with_capacity(messages.len());
    for msg in messages {
        if !seen.insert(msg.id.as_str()) {
            return Err(MessageError::DuplicateId(msg.id.clone()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&msg.priority) {
            return Err(MessageError::PriorityOutOfRange {
                id: msg.id.clone(),
                priority: msg.priority,
            });
        }
    }
    Ok(())
}

// ── Working set ───────────────────────────────────────────────────

/// The pass's private copy of the list. Indices stay stable; dropped
/// messages are only marked dead.
struct WorkingSet {
    messages: Vec<Message>,
    tokens: Vec<usize>,
    alive: Vec<bool>,
    mandatory: HashSet<usize>,
    total: usize,
    approximate: bool,
}

impl WorkingSet {
    /// Evictable messages for a pass in `mode`.
    fn candidates(&self, mode: PassMode, high_priority_level: u8) -> Vec<usize> {
        (0..self.messages.len())
            .filter(|&i| self.alive[i] && !self.mandatory.contains(&i))
            .filter(|&i| {
                mode.touches_high_priority() || self.messages[i].priority < high_priority_level
            })
            .collect()
    }

    /// Recent mandatory conversation, used as the relevance reference when
    /// no query is given.
    fn centroid(&self) -> Option<String> {
        let mut recent: Vec<usize> = self
            .mandatory
            .iter()
            .copied()
            .filter(|&i| self.alive[i] && !self.messages[i].is_system())
            .collect();
        recent.sort_by(|&a, &b| {
            self.messages[b]
                .timestamp
                .cmp(&self.messages[a].timestamp)
                .then(b.cmp(&a))
        });
        recent.truncate(CENTROID_MESSAGES);
        if recent.is_empty() {
            return None;
        }
        recent.reverse();
        Some(
            recent
                .iter()
                .map(|&i| self.messages[i].content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    fn into_messages(self) -> Vec<Message> {
        self.messages
            .into_iter()
            .zip(self.tokens)
            .zip(self.alive)
            .filter(|(_, alive)| *alive)
            .map(|((mut msg, tokens), _)| {
                msg.token_count = Some(tokens);
                msg
            })
            .collect()
    }
}

// ── Engine ────────────────────────────────────────────────────────

/// Borrowed view of everything a pass needs.
pub struct EvictionEngine<'a> {
    pub accountant: &'a mut TokenAccountant,
    pub registry: &'a StrategyRegistry,
    pub retention: RetentionPolicy,
    /// `None` when archiving is disabled.
    pub archive: Option<&'a ArchiveStore>,
    pub relevance: Option<&'a dyn RelevanceOracle>,
    pub summarizer: &'a dyn Summarizer,
    pub settings: &'a EvictionSettings,
}

impl EvictionEngine<'_> {
    /// Run one pass over `messages`. The input is never modified; an invalid
    /// list is rejected before any work is done.
    pub async fn run(
        &mut self,
        messages: &[Message],
        req: &PassRequest<'_>,
    ) -> Result<PruneOutcome, MessageError> {
        validate_messages(messages)?;

        let mut tokens = Vec::with_capacity(messages.len());
        let mut approximate = false;
        for msg in messages {
            let c = self.accountant.count_with(msg, req.cancel).await;
            approximate |= c.approximate;
            tokens.push(c.tokens);
        }
        let total: usize = tokens.iter().sum();
        let usage = ContextUsage::new(
            TokenCount {
                tokens: total,
                approximate,
            },
            self.settings.context_limit,
            self.settings.approximate_slack,
        );
        let tier = self.settings.thresholds.classify(usage.usage_pct);
        debug!(%tier, "{}", usage.to_log_string());

        let mut work = WorkingSet {
            messages: messages.to_vec(),
            tokens,
            alive: vec![true; messages.len()],
            mandatory: self.retention.mandatory_indices(messages),
            total,
            approximate,
        };
        let mut report = PassReport {
            tier,
            tokens_before: total,
            effective_limit: usage.effective_limit,
            degraded_tokenizer: approximate,
            ..Default::default()
        };

        let plan = match req.target {
            PassTarget::Tier => self
                .settings
                .thresholds
                .plan(tier)
                .map(|p| (p.target_tokens(usage.effective_limit), p.mode, p.mode.drops_compressed())),
            PassTarget::Fraction(f) => Some((
                tokens_below(f, usage.effective_limit),
                req.mode,
                req.backstop,
            )),
            PassTarget::Tokens(t) => Some((t, req.mode, req.backstop)),
            PassTarget::GuardOnly => None,
        };

        if let Some((target, mode, backstop)) = plan {
            report.target_tokens = Some(target);
            self.compact(&mut work, req, target, mode, backstop, &mut report)
                .await;
        }

        self.enforce_hard_limit(&mut work, usage.effective_limit, &mut report);

        report.tokens_after = work.total;
        report.degraded_tokenizer = work.approximate;
        report.target_met = match report.target_tokens {
            Some(target) => work.total <= target,
            None => work.total <= usage.effective_limit,
        };
        if let Some(target) = report.target_tokens
            && !report.target_met
            && !report.cancelled
        {
            let msg = format!(
                "target of {target} tokens not met: {} tokens remain after exhausting evictable messages",
                work.total
            );
            warn!("{msg}");
            report.warnings.push(msg);
        }

        if report.changed() {
            info!(
                %tier,
                dropped = report.dropped,
                compressed = report.compressed,
                archived = report.archived,
                before = report.tokens_before,
                after = report.tokens_after,
                "compaction pass complete"
            );
        }

        Ok(PruneOutcome {
            messages: work.into_messages(),
            report,
        })
    }

    async fn compact(
        &mut self,
        work: &mut WorkingSet,
        req: &PassRequest<'_>,
        target: usize,
        mode: PassMode,
        backstop: bool,
        report: &mut PassReport,
    ) {
        let reference = match (self.settings.query_aware, req.query) {
            (true, Some(q)) => Some(q.to_string()),
            _ => work.centroid(),
        };

        for &kind in req.strategies {
            if work.total <= target || report.cancelled {
                return;
            }
            let Some(strategy) = self.registry.get(kind).cloned() else {
                let msg = format!("strategy {kind} is not registered, skipped");
                warn!("{msg}");
                report.warnings.push(msg);
                continue;
            };
            self.apply_strategy(strategy.as_ref(), work, req, target, mode, reference.as_deref(), report)
                .await;
            report.strategies.push(kind);
        }

        if backstop && work.total > target && !report.cancelled {
            debug!(remaining = work.total, target, "final temporal sweep");
            self.apply_strategy(&TemporalStrategy, work, req, target, mode, None, report)
                .await;
            report.strategies.push(StrategyKind::Temporal);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_strategy(
        &mut self,
        strategy: &dyn Strategy,
        work: &mut WorkingSet,
        req: &PassRequest<'_>,
        target: usize,
        mode: PassMode,
        reference: Option<&str>,
        report: &mut PassReport,
    ) {
        let candidates = work.candidates(mode, self.settings.high_priority_level);
        if candidates.is_empty() {
            return;
        }

        let ranking = {
            let ctx = StrategyContext {
                messages: &work.messages,
                tokens: &work.tokens,
                candidates: &candidates,
                reference,
                relevance: self.relevance,
                weights: &self.settings.adaptive_weights,
                cancel: req.cancel,
            };
            strategy.rank(&ctx).await
        };
        report.degraded_relevance |= ranking.degraded;
        trace!(strategy = %strategy.kind(), victims = ranking.victims.len(), "ranked");

        for victim in ranking.victims {
            if work.total <= target {
                break;
            }
            if req.cancel.is_some_and(|c| c.is_cancelled()) {
                debug!("pass cancelled between victims");
                report.cancelled = true;
                break;
            }
            self.apply_victim(work, victim, mode, req.cancel, report).await;
        }
    }

    async fn apply_victim(
        &mut self,
        work: &mut WorkingSet,
        victim: Victim,
        mode: PassMode,
        cancel: Option<&CancellationToken>,
        report: &mut PassReport,
    ) {
        let i = victim.index;
        if !work.alive[i] || work.mandatory.contains(&i) {
            return;
        }
        let msg = &work.messages[i];
        let high = msg.priority >= self.settings.high_priority_level;

        if msg.compressed && (high || !mode.drops_compressed()) {
            return;
        }
        let action = if high {
            // High-priority messages are only reachable in emergencies and
            // are never dropped by a strategy.
            VictimAction::Compress
        } else if msg.compressed {
            VictimAction::Drop
        } else {
            victim.action
        };

        match action {
            VictimAction::Drop => self.drop_message(work, i, report),
            VictimAction::Compress => self.compress_message(work, i, cancel, report).await,
        }
    }

    fn drop_message(&self, work: &mut WorkingSet, i: usize, report: &mut PassReport) {
        self.archive(&work.messages[i], ArchiveReason::Dropped, report);
        work.alive[i] = false;
        work.total -= work.tokens[i];
        report.dropped += 1;
        debug!(id = %work.messages[i].id, tokens = work.tokens[i], "dropped");
    }

    async fn compress_message(
        &mut self,
        work: &mut WorkingSet,
        i: usize,
        cancel: Option<&CancellationToken>,
        report: &mut PassReport,
    ) {
        let original = work.tokens[i];
        let target = ((original as f64 * self.settings.compression_ratio).ceil() as usize).max(1);

        let mut replacement = work.messages[i].clone();
        replacement.set_content(self.summarizer.summarize(&work.messages[i].content, target));
        replacement.compressed = true;
        let count = self.accountant.count_with(&replacement, cancel).await;
        if count.tokens >= original {
            trace!(id = %replacement.id, "summary not shorter, compression skipped");
            return;
        }

        // Commit: archive the original and swap the content together.
        self.archive(&work.messages[i], ArchiveReason::Compressed, report);
        work.total = work.total - original + count.tokens;
        work.tokens[i] = count.tokens;
        work.approximate |= count.approximate;
        work.messages[i] = replacement;
        report.compressed += 1;
        debug!(id = %work.messages[i].id, from = original, to = count.tokens, "compressed");
    }

    fn archive(&self, msg: &Message, reason: ArchiveReason, report: &mut PassReport) {
        let Some(archive) = self.archive else {
            return;
        };
        let receipt = archive.store(ArchiveRecord::from_message(msg, reason));
        if receipt.id.is_some() {
            report.archived += 1;
            return;
        }
        match receipt.refused {
            Some(StoreRefusal::Closed) => report
                .warnings
                .push(format!("archive closed, content of message {} not archived", msg.id)),
            Some(StoreRefusal::Full) => report
                .warnings
                .push(format!("archive full, content of message {} not archived", msg.id)),
            Some(StoreRefusal::Empty) | None => {}
        }
    }

    /// Drop non-mandatory messages, oldest first, until the list fits.
    fn enforce_hard_limit(&self, work: &mut WorkingSet, limit: usize, report: &mut PassReport) {
        if work.total <= limit {
            return;
        }
        let mut order: Vec<usize> = (0..work.messages.len())
            .filter(|&i| work.alive[i] && !work.mandatory.contains(&i))
            .collect();
        order.sort_by(|&a, &b| {
            work.messages[a]
                .timestamp
                .cmp(&work.messages[b].timestamp)
                .then(a.cmp(&b))
        });

        for i in order {
            if work.total <= limit {
                break;
            }
            self.drop_message(work, i, report);
            report.guard_dropped += 1;
        }

        if work.total > limit {
            report.budget_unsatisfiable = true;
            let msg = format!(
                "mandatory messages need {} tokens, above the {limit}-token limit",
                work.total
            );
            warn!("{msg}");
            report.warnings.push(msg);
        }
    }
}
