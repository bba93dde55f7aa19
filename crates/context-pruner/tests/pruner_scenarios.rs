//! End-to-end scenarios for the context pruner.
//!
//! Every test drives the public facade the way a host would: build a
//! config, hand the pruner a message list, and inspect what comes back.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use context_pruner::error::{ConfigError, OracleError};
use context_pruner::oracle::OracleFuture;
use context_pruner::prelude::*;

// ── Helpers ──────────────────────────────────────────────────────────

/// Route pruner logs to the test harness; repeated calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

/// Text of exactly `tokens` heuristic tokens (four characters each).
fn body(tag: &str, tokens: usize) -> String {
    let mut s = format!("{tag} ").repeat(tokens * 4 / (tag.len() + 1) + 1);
    s.truncate(tokens * 4);
    s
}

fn turn(i: usize, tokens: usize) -> Message {
    let msg = if i % 2 == 0 {
        Message::user(body(&format!("turn{i}"), tokens))
    } else {
        Message::assistant(body(&format!("turn{i}"), tokens))
    };
    msg.with_id(format!("m{i}"))
        .with_timestamp(base_time() + Duration::seconds(i as i64 + 1))
}

fn conversation(n: usize, tokens: usize) -> Vec<Message> {
    (0..n).map(|i| turn(i, tokens)).collect()
}

fn with_system(mut messages: Vec<Message>) -> Vec<Message> {
    messages.insert(
        0,
        Message::system("You are a careful assistant.")
            .with_id("sys")
            .with_timestamp(base_time()),
    );
    messages
}

fn ids(messages: &[Message]) -> HashSet<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

fn total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.token_count.unwrap_or(0)).sum()
}

struct OfflineTokenizer;

impl TokenizerOracle for OfflineTokenizer {
    fn count_tokens<'a>(&'a self, _: &'a str, _: &'a str) -> OracleFuture<'a, usize> {
        Box::pin(async { Err(OracleError::Unavailable("connection refused".into())) })
    }
}

// ── Health tiers ─────────────────────────────────────────────────────

#[tokio::test]
async fn healthy_conversation_is_returned_unchanged() {
    let pruner = ContextPruner::new(PrunerConfig::new(2000)).unwrap();
    let input = conversation(5, 100);

    let out = pruner.process_messages(input.clone()).await;

    assert_eq!(out.report.tier, HealthTier::Healthy);
    assert!(!out.report.changed());
    assert_eq!(out.messages.len(), 5);
    for (got, want) in out.messages.iter().zip(&input) {
        assert_eq!(got.id, want.id);
        assert_eq!(got.content, want.content);
        assert_eq!(got.token_count, Some(100));
    }
    assert_eq!(pruner.get_status().await.health, HealthTier::Healthy);
}

#[tokio::test]
async fn overflowing_conversation_is_compacted_below_prune_threshold() {
    init_tracing();
    let pruner = ContextPruner::new(PrunerConfig::new(2000)).unwrap();
    let input = with_system(conversation(40, 100));

    let out = pruner.process_messages(input).await;

    assert_eq!(out.report.tier, HealthTier::Emergency);
    assert!(total_tokens(&out.messages) <= 1600);
    assert_eq!(out.report.tokens_after, total_tokens(&out.messages));

    let kept = ids(&out.messages);
    assert!(kept.contains("sys"));
    for i in 25..40 {
        assert!(kept.contains(&format!("m{i}")), "recent message m{i} evicted");
    }
    assert_eq!(out.messages[0].id, "sys", "order must be preserved");
}

#[tokio::test]
async fn compaction_is_idempotent() {
    let pruner = ContextPruner::new(PrunerConfig::new(2000)).unwrap();
    let first = pruner
        .process_messages(with_system(conversation(40, 100)))
        .await;
    let second = pruner.process_messages(first.messages.clone()).await;

    assert_eq!(second.messages, first.messages);
    assert!(!second.report.changed());
}

// ── Archive ──────────────────────────────────────────────────────────

#[tokio::test]
async fn evicted_message_can_be_retrieved_from_archive() {
    let pruner = ContextPruner::new(PrunerConfig::new(2000)).unwrap();
    let mut input = vec![
        Message::user("TypeScript sorting function example")
            .with_id("ts")
            .with_timestamp(base_time()),
    ];
    input.extend(conversation(40, 100));

    let out = pruner.process_messages(input).await;
    assert!(!ids(&out.messages).contains("ts") || out.messages[0].compressed);
    assert!(out.report.archived > 0);

    let hits = pruner
        .retrieve_from_archive("TypeScript sorting", SearchOptions::default())
        .await;
    assert!(hits.found);
    assert!(hits.sources.iter().any(|s| s.message_id == "ts"));
    assert!(
        hits.snippets
            .iter()
            .any(|s| s.contains("TypeScript sorting function example"))
    );
    assert_eq!(pruner.get_stats().await.archive_searches, 1);
}

#[tokio::test]
async fn unrelated_query_misses() {
    let pruner = ContextPruner::new(PrunerConfig::new(2000)).unwrap();
    pruner
        .process_messages(with_system(conversation(40, 100)))
        .await;

    let hits = pruner
        .retrieve_from_archive("kubernetes ingress annotations", SearchOptions::default())
        .await;
    assert!(!hits.found);
    assert!(hits.snippets.is_empty());
}

#[tokio::test]
async fn archive_persists_across_pruner_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = PrunerConfig::new(2000).with_archive(Some(dir.path().join("archive")), 1 << 20);

    let mut input = vec![
        Message::user("Notes on the Rust borrow checker and lifetimes")
            .with_id("rust-notes")
            .with_timestamp(base_time()),
    ];
    input.extend(conversation(40, 100));

    let first = ContextPruner::new(config.clone()).unwrap();
    let out = first.process_messages(input).await;
    assert!(out.report.archived > 0);
    first.destroy().await;

    let second = ContextPruner::new(config).unwrap();
    second.initialize().await.unwrap();
    let status = second.get_status().await;
    assert_eq!(
        status.archive.stats.unwrap().total_entries,
        out.report.archived
    );

    let hits = second
        .retrieve_from_archive("borrow checker lifetimes", SearchOptions::default())
        .await;
    assert!(hits.found);
    assert!(hits.sources.iter().any(|s| s.message_id == "rust-notes"));
}

#[tokio::test]
async fn search_respects_token_budget() {
    let pruner = ContextPruner::new(PrunerConfig::new(2000)).unwrap();
    pruner
        .process_messages(with_system(conversation(40, 100)))
        .await;

    let hits = pruner
        .retrieve_from_archive(
            "turn3 turn4 turn5 turn6",
            SearchOptions::default()
                .with_max_tokens(150)
                .with_min_relevance(0.1),
        )
        .await;
    assert!(hits.found);
    assert!(hits.total_tokens <= 150);
}

// ── Degradation ──────────────────────────────────────────────────────

#[tokio::test]
async fn unsatisfiable_mandatory_set_is_reported() {
    let config = PrunerConfig::new(1000)
        .with_preserve_recent(5)
        .with_preserve_high_priority(0);
    let pruner = ContextPruner::new(config).unwrap();
    let input = with_system(conversation(12, 300));

    let out = pruner.process_messages(input).await;

    assert!(out.report.budget_unsatisfiable);
    let kept = ids(&out.messages);
    let expected: HashSet<String> = std::iter::once("sys".to_string())
        .chain((7..12).map(|i| format!("m{i}")))
        .collect();
    assert_eq!(kept, expected);
    assert!(pruner.get_status().await.budget_unsatisfiable);
    assert_eq!(pruner.get_stats().await.unsatisfiable, 1);
}

#[tokio::test]
async fn offline_tokenizer_falls_back_to_heuristic() {
    init_tracing();
    let pruner = ContextPruner::new(PrunerConfig::new(2000))
        .unwrap()
        .with_tokenizer(Arc::new(OfflineTokenizer));
    let out = pruner.process_messages(conversation(30, 100)).await;

    assert!(out.report.degraded_tokenizer);
    assert_eq!(out.report.effective_limit, 1900);
    assert!(out.report.tokens_after <= 1900);

    let status = pruner.get_status().await;
    assert!(status.degraded);
    assert_eq!(status.tokens.limit, 1900);
}

#[tokio::test]
async fn archive_disabled_still_compacts() {
    let pruner = ContextPruner::new(PrunerConfig::new(2000).without_archive()).unwrap();
    let out = pruner
        .process_messages(with_system(conversation(40, 100)))
        .await;

    assert!(total_tokens(&out.messages) <= 1600);
    assert_eq!(out.report.archived, 0);

    let hits = pruner
        .retrieve_from_archive("turn3", SearchOptions::default())
        .await;
    assert!(!hits.found);
    assert!(!pruner.get_status().await.archive.enabled);
}

// ── Configuration ────────────────────────────────────────────────────

#[test]
fn config_errors_surface_at_construction() {
    assert_eq!(
        PrunerConfig::from_json_str(r#"{"contextLimit": 0}"#),
        Err(ConfigError::ZeroContextLimit)
    );
    assert!(matches!(
        PrunerConfig::from_json_str(r#"{"warningThreshold": 0.9, "pruneThreshold": 0.8}"#),
        Err(ConfigError::ThresholdOrder { .. })
    ));
    assert!(matches!(
        PrunerConfig::from_json_str(r#"{"strategies": ["random"]}"#),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        ContextPruner::new(PrunerConfig::new(2000).with_strategies(Vec::<StrategyKind>::new())),
        Err(PrunerError::Config(ConfigError::NoStrategies))
    ));
}

#[tokio::test]
async fn json_config_drives_the_pruner() {
    let config = PrunerConfig::from_json_str(
        r#"{
            "contextLimit": 2000,
            "strategies": ["temporal"],
            "preserveRecent": 3,
            "preserveHighPriority": 0,
            "enableArchive": false
        }"#,
    )
    .unwrap();
    let pruner = ContextPruner::new(config).unwrap();

    let out = pruner.process_messages(conversation(20, 100)).await;
    assert_eq!(out.report.tier, HealthTier::Emergency);
    assert_eq!(out.report.compressed, 0);
    assert!(out.report.tokens_after < 1400);
    assert!(ids(&out.messages).contains("m19"));
}
