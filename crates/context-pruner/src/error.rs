//! Typed error hierarchy for the pruner.
//!
//! Only [`ConfigError`] ever reaches a caller as an `Err`. Oracle and archive
//! failures are caught at the operation boundary and surfaced as warnings on
//! the [`PassReport`](crate::context::eviction::PassReport).

use std::path::PathBuf;
use thiserror::Error;

/// Invalid configuration, detected at construction or `initialize()`.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("contextLimit must be greater than zero")]
    ZeroContextLimit,

    #[error("{name} must be in (0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("thresholds must be strictly increasing: {lower} ({lower_value}) >= {upper} ({upper_value})")]
    ThresholdOrder {
        lower: &'static str,
        lower_value: f64,
        upper: &'static str,
        upper_value: f64,
    },

    #[error("{name} must be in [0, 1], got {value}")]
    FractionOutOfRange { name: &'static str, value: f64 },

    #[error("approximateSlack must be in [0, 0.5), got {0}")]
    SlackOutOfRange(f64),

    #[error("archiveMaxSize must be greater than zero when the archive is enabled")]
    ZeroArchiveSize,

    #[error("at least one strategy must be configured")]
    NoStrategies,

    #[error("adaptive weights must be non-negative and not both zero")]
    InvalidAdaptiveWeights,

    #[error("failed to read config file at {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Failure of an external oracle (tokenizer or relevance scorer).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle does not support model {0}")]
    UnknownModel(String),
}

/// Failure of the archive's persistence sink.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize archive entry {id}: {source}")]
    Serde {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A message list the engine refuses to operate on. The operation returns
/// the input unchanged and records the error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MessageError {
    #[error("duplicate message id {0}")]
    DuplicateId(String),

    #[error("message {id} has priority {priority}, expected 1..=10")]
    PriorityOutOfRange { id: String, priority: u8 },
}

/// Top-level error returned by the [`ContextPruner`](crate::pruner::ContextPruner).
#[derive(Debug, Error)]
pub enum PrunerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}
