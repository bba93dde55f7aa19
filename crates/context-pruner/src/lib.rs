//! Token-budget-aware retention engine for LLM conversation context.
//!
//! `context-pruner` keeps an ordered, role-tagged message log inside a fixed
//! token budget. It decides what to evict or compress when the log grows too
//! large, never touches the messages whose loss would break the conversation
//! (system prompt, most recent turns, explicitly high-priority turns), and
//! moves evicted content into a searchable archive instead of discarding it.
//!
//! The entry point is the [`ContextPruner`](pruner::ContextPruner) facade:
//!
//! ```ignore
//! use context_pruner::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PrunerError> {
//!     let pruner = ContextPruner::new(PrunerConfig::new(8_000))?;
//!     pruner.initialize().await?;
//!
//!     let messages = vec![
//!         Message::system("You are a helpful coding assistant."),
//!         Message::user("Show me a TypeScript sorting function."),
//!     ];
//!
//!     let outcome = pruner.process_messages(messages).await;
//!     println!("{:?}", outcome.report.tier);
//!
//!     let hits = pruner
//!         .retrieve_from_archive("TypeScript sorting", SearchOptions::default())
//!         .await;
//!     println!("archive hit: {}", hits.found);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Token counting:** [`TokenAccountant`](context::tokens::TokenAccountant)
//!   wraps a [`TokenizerOracle`](oracle::TokenizerOracle) with a per-instance
//!   cache and a heuristic fallback.
//! - **What is never evicted:** [`RetentionPolicy`](context::retention::RetentionPolicy).
//! - **When to compact:** [`HealthTier`](context::health::HealthTier) and
//!   [`CompactionPlan`](context::health::CompactionPlan).
//! - **What to evict:** the strategies in [`context::strategy`], applied by
//!   the selection loop in [`context::eviction`].
//! - **Where evicted content goes:** [`ArchiveStore`](archive::ArchiveStore)
//!   and its pluggable [`ArchiveSink`](archive::sink::ArchiveSink).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`pruner`] | [`ContextPruner`](pruner::ContextPruner) facade, status and stats |
//! | [`context`] | Token accounting, retention, health tiers, strategies, eviction loop |
//! | [`archive`] | Capacity-bounded archive with relevance decay and search |
//! | [`oracle`] | Tokenizer and relevance oracle traits plus built-in fallbacks |
//! | [`config`] | [`PrunerConfig`](config::PrunerConfig) and strategy names |

pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod oracle;
pub mod prelude;
pub mod pruner;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

/// Priority assigned to messages that don't specify one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Lowest and highest caller-assignable priority.
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use context_pruner::config::PrunerConfig;
/// use context_pruner::json_schema_for;
///
/// let schema = json_schema_for::<PrunerConfig>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["properties"].get("contextLimit").is_some());
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation.
///
/// `token_count` is a memo written by the pruner on every message it
/// returns. Change content through [`Message::set_content`] so the memo is
/// cleared; the token cache is keyed by content hash, so a stale memo is
/// never trusted for budgeting either way.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    /// Content has been replaced by a lossy summary; the original is archived.
    #[serde(default)]
    pub compressed: bool,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            priority: DEFAULT_PRIORITY,
            timestamp: Utc::now(),
            token_count: None,
            compressed: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Set the priority, clamped to `1..=10`.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the content and drop the memoized token count.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.token_count = None;
    }

    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}
