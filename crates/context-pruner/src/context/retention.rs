//! Retention policy: the set of messages no strategy may ever evict.
//!
//! Three declarative rules, unioned:
//! 1. every system message (when `preserve_system` is on);
//! 2. the `preserve_recent` most recent messages by timestamp;
//! 3. the `preserve_high_priority` highest-priority messages, ties broken
//!    by recency.
//!
//! Worst-case retained content is therefore bounded by
//! `preserve_recent + preserve_high_priority + |system messages|` messages.

use crate::Message;
use crate::config::PrunerConfig;
use std::collections::HashSet;

/// The retention rules, extracted from [`PrunerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub preserve_system: bool,
    pub preserve_recent: usize,
    pub preserve_high_priority: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&PrunerConfig::default())
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &PrunerConfig) -> Self {
        Self {
            preserve_system: config.preserve_system,
            preserve_recent: config.preserve_recent,
            preserve_high_priority: config.preserve_high_priority,
        }
    }

    /// Ids of the messages that must be kept.
    pub fn mandatory(&self, messages: &[Message]) -> HashSet<String> {
        self.mandatory_indices(messages)
            .into_iter()
            .map(|i| messages[i].id.clone())
            .collect()
    }

    /// Positions (in `messages`) of the messages that must be kept.
    pub fn mandatory_indices(&self, messages: &[Message]) -> HashSet<usize> {
        let mut keep = HashSet::new();

        if self.preserve_system {
            keep.extend(
                messages
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.is_system())
                    .map(|(i, _)| i),
            );
        }

        // Newest first; list position breaks timestamp ties.
        let mut by_recency: Vec<usize> = (0..messages.len()).collect();
        by_recency.sort_by(|&a, &b| {
            messages[b]
                .timestamp
                .cmp(&messages[a].timestamp)
                .then(b.cmp(&a))
        });
        keep.extend(by_recency.iter().take(self.preserve_recent).copied());

        let mut by_priority = by_recency;
        // Stable sort keeps the recency order within a priority level.
        by_priority.sort_by(|&a, &b| messages[b].priority.cmp(&messages[a].priority));
        keep.extend(by_priority.iter().take(self.preserve_high_priority).copied());

        keep
    }
}
