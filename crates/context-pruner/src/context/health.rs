//! Health tiers: classifies budget pressure and decides how hard to compact.
//!
//! Classification is a pure function of `used / limit`, recomputed on every
//! call. Nothing is latched between calls, so there are no enter/exit
//! thresholds that could disagree.
//!
//! | Tier | Usage | Action |
//! |------|-------|--------|
//! | `Healthy` | `< warning` | none |
//! | `Warning` | `warning..prune` | none (informational) |
//! | `Compact` | `prune..aggressive` | balanced pass down to `prune` |
//! | `AggressiveCompact` | `aggressive..emergency` | aggressive pass down to `warning` |
//! | `Emergency` | `>= emergency` | aggressive pass, high-priority compression allowed, down to `warning` |

use crate::config::PrunerConfig;
use serde::{Deserialize, Serialize};

/// Severity of budget pressure.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthTier {
    #[default]
    Healthy,
    Warning,
    Compact,
    AggressiveCompact,
    Emergency,
}

impl std::fmt::Display for HealthTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthTier::Healthy => write!(f, "HEALTHY"),
            HealthTier::Warning => write!(f, "WARNING"),
            HealthTier::Compact => write!(f, "COMPACT"),
            HealthTier::AggressiveCompact => write!(f, "AGGRESSIVE_COMPACT"),
            HealthTier::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// The four tier boundaries, as fractions of the effective limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning: f64,
    pub prune: f64,
    pub aggressive: f64,
    pub emergency: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&PrunerConfig::default())
    }
}

impl Thresholds {
    pub fn from_config(config: &PrunerConfig) -> Self {
        Self {
            warning: config.warning_threshold,
            prune: config.prune_threshold,
            aggressive: config.aggressive_compact_threshold,
            emergency: config.emergency_threshold,
        }
    }

    /// Map a usage fraction to its tier.
    pub fn classify(&self, usage_pct: f64) -> HealthTier {
        if usage_pct >= self.emergency {
            HealthTier::Emergency
        } else if usage_pct >= self.aggressive {
            HealthTier::AggressiveCompact
        } else if usage_pct >= self.prune {
            HealthTier::Compact
        } else if usage_pct >= self.warning {
            HealthTier::Warning
        } else {
            HealthTier::Healthy
        }
    }

    /// The compaction pass (if any) a tier calls for.
    pub fn plan(&self, tier: HealthTier) -> Option<CompactionPlan> {
        match tier {
            HealthTier::Healthy | HealthTier::Warning => None,
            HealthTier::Compact => Some(CompactionPlan {
                tier,
                mode: PassMode::Balanced,
                target_fraction: self.prune,
            }),
            HealthTier::AggressiveCompact => Some(CompactionPlan {
                tier,
                mode: PassMode::Aggressive,
                target_fraction: self.warning,
            }),
            HealthTier::Emergency => Some(CompactionPlan {
                tier,
                mode: PassMode::Emergency,
                target_fraction: self.warning,
            }),
        }
    }
}

/// How aggressively a pass may pick victims.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// Configured strategies only; compressed messages are left alone.
    Balanced,
    /// Configured strategies, then a temporal sweep that may also drop
    /// already-compressed messages.
    Aggressive,
    /// Aggressive, plus high-priority (non-mandatory) messages may be compressed.
    Emergency,
}

impl PassMode {
    /// Whether already-compressed messages may be dropped.
    pub fn drops_compressed(self) -> bool {
        !matches!(self, PassMode::Balanced)
    }

    /// Whether high-priority, non-mandatory messages may be compressed.
    pub fn touches_high_priority(self) -> bool {
        matches!(self, PassMode::Emergency)
    }
}

/// What a tier asks the strategy engine to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPlan {
    pub tier: HealthTier,
    pub mode: PassMode,
    /// Usage fraction the pass must get strictly below.
    pub target_fraction: f64,
}

impl CompactionPlan {
    /// Largest token total that sits strictly below `target_fraction` of `limit`.
    ///
    /// Landing exactly on a threshold would classify into the same tier
    /// again, so the target is one token under it.
    pub fn target_tokens(&self, limit: usize) -> usize {
        tokens_below(self.target_fraction, limit)
    }
}

/// Largest integer strictly below `fraction * limit`.
pub fn tokens_below(fraction: f64, limit: usize) -> usize {
    ((fraction * limit as f64).ceil() as usize).saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_boundaries() {
        let t = Thresholds::default();
        assert_eq!(t.classify(0.0), HealthTier::Healthy);
        assert_eq!(t.classify(0.69), HealthTier::Healthy);
        assert_eq!(t.classify(0.70), HealthTier::Warning);
        assert_eq!(t.classify(0.79), HealthTier::Warning);
        assert_eq!(t.classify(0.80), HealthTier::Compact);
        assert_eq!(t.classify(0.89), HealthTier::Compact);
        assert_eq!(t.classify(0.90), HealthTier::AggressiveCompact);
        assert_eq!(t.classify(0.949), HealthTier::AggressiveCompact);
        assert_eq!(t.classify(0.95), HealthTier::Emergency);
        assert_eq!(t.classify(2.0), HealthTier::Emergency);
    }

    #[test]
    fn classification_is_monotonic() {
        let t = Thresholds::default();
        let mut last = HealthTier::Healthy;
        for i in 0..=150 {
            let tier = t.classify(i as f64 / 100.0);
            assert!(tier >= last);
            last = tier;
        }
    }

    #[test]
    fn plans_match_tiers() {
        let t = Thresholds::default();
        assert!(t.plan(HealthTier::Healthy).is_none());
        assert!(t.plan(HealthTier::Warning).is_none());

        let compact = t.plan(HealthTier::Compact).unwrap();
        assert_eq!(compact.mode, PassMode::Balanced);
        assert_eq!(compact.target_fraction, 0.80);

        let aggressive = t.plan(HealthTier::AggressiveCompact).unwrap();
        assert_eq!(aggressive.mode, PassMode::Aggressive);
        assert_eq!(aggressive.target_fraction, 0.70);

        let emergency = t.plan(HealthTier::Emergency).unwrap();
        assert_eq!(emergency.mode, PassMode::Emergency);
        assert!(emergency.mode.touches_high_priority());
        assert!(emergency.mode.drops_compressed());
    }

    #[test]
    fn target_lands_below_threshold() {
        let t = Thresholds::default();
        let plan = t.plan(HealthTier::Compact).unwrap();
        let target = plan.target_tokens(2000);
        assert_eq!(target, 1599);
        assert_eq!(t.classify(target as f64 / 2000.0), HealthTier::Warning);
    }

    #[test]
    fn tokens_below_handles_fractional_products() {
        assert_eq!(tokens_below(0.7, 1001), 700);
        assert_eq!(tokens_below(1.0, 10), 9);
        assert_eq!(tokens_below(0.5, 0), 0);
    }

    #[test]
    fn tier_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&HealthTier::AggressiveCompact).unwrap(),
            "\"AGGRESSIVE_COMPACT\""
        );
        assert_eq!(HealthTier::Emergency.to_string(), "EMERGENCY");
    }
}
