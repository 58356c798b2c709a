// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{ask, build, harness, Harness, MODEL_A, REPLY};
use pocket_llm_node::inference::{
    key_for, ChatMessage, ChatPipeline, ChatTemplate, GatePurpose, LoadOptions, ModelIdentity,
    PipelineConfig, PromptCache, PromptConfig, PromptTemplate, ScriptedLoader,
    ScriptedModelConfig,
};
use std::sync::Arc;

fn identity(size_bytes: u64) -> ModelIdentity {
    ModelIdentity {
        name: MODEL_A.to_string(),
        size_bytes,
    }
}

#[test]
fn test_key_is_deterministic_and_sensitive() {
    let messages = vec![ChatMessage::system("Be brief."), ChatMessage::user("Hi")];
    let config = PromptConfig::default();
    let base = key_for(&identity(100), &messages, &[], &config);

    assert_eq!(base, key_for(&identity(100), &messages, &[], &config));
    assert_ne!(base, key_for(&identity(101), &messages, &[], &config));

    let mut edited = messages.clone();
    edited[1].content = "Hi!".to_string();
    assert_ne!(base, key_for(&identity(100), &edited, &[], &config));

    let tools = vec![serde_json::json!({"type": "function", "function": {"name": "f"}})];
    assert_ne!(base, key_for(&identity(100), &messages, &tools, &config));

    let chatml = PromptConfig::for_template(&PromptTemplate::Builtin(ChatTemplate::ChatML));
    let vicuna = PromptConfig::for_template(&PromptTemplate::Builtin(ChatTemplate::Vicuna));
    assert_ne!(base, key_for(&identity(100), &messages, &[], &chatml));
    assert_ne!(
        key_for(&identity(100), &messages, &[], &chatml),
        key_for(&identity(100), &messages, &[], &vicuna)
    );
}

#[test]
fn test_key_ignores_tool_key_order() {
    let messages = vec![ChatMessage::user("Hi")];
    let a = vec![serde_json::json!({"type": "function", "function": {"name": "f", "description": "d"}})];
    let b = vec![serde_json::json!({"function": {"description": "d", "name": "f"}, "type": "function"})];
    let config = PromptConfig::default();
    assert_eq!(
        key_for(&identity(1), &messages, &a, &config),
        key_for(&identity(1), &messages, &b, &config)
    );
}

#[tokio::test]
async fn test_second_request_hits_and_matches_cold_output() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let cold = h.pipeline.complete(ask("What is 2+2?")).await.unwrap();
    let ingested_cold = h.stats.ingested();
    assert_eq!(cold.usage.cached_tokens, 0);
    assert_eq!(h.cache_files(), 1);

    let warm = h.pipeline.complete(ask("What is 2+2?")).await.unwrap();
    let ingested_warm = h.stats.ingested() - ingested_cold;

    assert_eq!(warm.content, cold.content);
    assert_eq!(warm.finish_reason, cold.finish_reason);
    assert_eq!(warm.usage.prompt_tokens, cold.usage.prompt_tokens);
    assert_eq!(warm.usage.cached_tokens, cold.usage.prompt_tokens - 1);
    assert!(ingested_warm < ingested_cold);

    let stats = h.cache.as_ref().unwrap().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_sampling_params_share_entry() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let mut first = ask("hello");
    first.config.temperature = Some(0.1);
    h.pipeline.complete(first).await.unwrap();

    let mut second = ask("hello");
    second.config.temperature = Some(1.5);
    second.config.seed = Some(7);
    let output = h.pipeline.complete(second).await.unwrap();

    assert!(output.usage.cached_tokens > 0);
}

#[tokio::test]
async fn test_follow_up_reuses_conversation_prefix() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let first = h.pipeline.complete(ask("What is 2+2?")).await.unwrap();

    let follow_up = pocket_llm_node::inference::GenerationRequest::new(vec![
        ChatMessage::user("What is 2+2?"),
        ChatMessage::assistant(first.content.clone()),
        ChatMessage::user("And 3+3?"),
    ]);
    let output = h.pipeline.complete(follow_up).await.unwrap();

    assert_eq!(
        output.usage.cached_tokens,
        first.usage.prompt_tokens + REPLY.chars().count()
    );
    assert_eq!(h.cache_files(), 2);
}

#[tokio::test]
async fn test_entry_from_other_context_size_is_a_miss() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;
    h.pipeline.complete(ask("hello")).await.unwrap();

    h.registry
        .load(
            MODEL_A,
            &LoadOptions {
                n_ctx: Some(2048),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let output = h.pipeline.complete(ask("hello")).await.unwrap();

    assert_eq!(output.usage.cached_tokens, 0);
    assert_eq!(output.content, REPLY);
}

#[tokio::test]
async fn test_cache_disabled_writes_nothing() {
    let h = build(ScriptedLoader::default(), PipelineConfig::default(), false).await;
    h.load(MODEL_A).await;

    h.pipeline.complete(ask("hello")).await.unwrap();
    let output = h.pipeline.complete(ask("hello")).await.unwrap();

    assert_eq!(output.usage.cached_tokens, 0);
    assert_eq!(h.cache_files(), 0);
}

#[tokio::test]
async fn test_prewarm_then_generate_hits() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let report = h.pipeline.prewarm(ask("Summarize this.")).await.unwrap();
    assert_eq!(report.cached_tokens, 0);
    assert!(report.prompt_tokens > 0);
    assert!(h.cache.as_ref().unwrap().contains(&report.key).await);
    let sampled = h.stats.sampled_tokens.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(sampled, 0);

    let output = h.pipeline.complete(ask("Summarize this.")).await.unwrap();
    assert_eq!(output.usage.cached_tokens, report.prompt_tokens - 1);
    assert_eq!(output.content, REPLY);
}

#[tokio::test]
async fn test_prewarm_requires_cache() {
    let h = build(ScriptedLoader::default(), PipelineConfig::default(), false).await;
    h.load(MODEL_A).await;

    let err = h.pipeline.prewarm(ask("hello")).await.unwrap_err();
    assert_eq!(err.code(), "invalid_request");
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;
    h.pipeline.complete(ask("hello")).await.unwrap();

    let reopened = Arc::new(PromptCache::open(h.cache_dir(), 3).await.unwrap());
    let pipeline = ChatPipeline::new(
        h.registry.clone(),
        Some(reopened.clone()),
        PipelineConfig::default(),
    );
    let output = pipeline.complete(ask("hello")).await.unwrap();

    assert!(output.usage.cached_tokens > 0);
    assert_eq!(reopened.stats().hits, 1);
}

fn with_fallback(h: &Harness, fallback: &str) -> ChatPipeline {
    ChatPipeline::new(
        h.registry.clone(),
        h.cache.clone(),
        PipelineConfig {
            fallback_template: Some(fallback.to_string()),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_fallback_templates_get_separate_entries() {
    let h = harness(ScriptedModelConfig {
        chat_template: None,
        ..Default::default()
    })
    .await;
    h.load(MODEL_A).await;

    let chatml = with_fallback(&h, "chatml").prewarm(ask("hi")).await.unwrap();
    let vicuna = with_fallback(&h, "vicuna").prewarm(ask("hi")).await.unwrap();

    assert_ne!(chatml.key, vicuna.key);
    assert_ne!(chatml.prompt_tokens, vicuna.prompt_tokens);
    assert_eq!(vicuna.cached_tokens, 0);
    assert_eq!(h.cache_files(), 2);

    let output = with_fallback(&h, "chatml").complete(ask("hi")).await.unwrap();
    assert_eq!(output.usage.cached_tokens, chatml.prompt_tokens - 1);
}

#[tokio::test]
async fn test_request_template_override_changes_key() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let embedded = h.pipeline.prewarm(ask("hi")).await.unwrap();
    let mut overridden = ask("hi");
    overridden.config.chat_template = Some("vicuna".to_string());
    let vicuna = h.pipeline.prewarm(overridden).await.unwrap();

    assert_ne!(embedded.key, vicuna.key);
    assert_eq!(h.cache_files(), 2);
}

#[tokio::test]
async fn test_cache_write_failure_does_not_fail_request() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    // A plain file where the cache directory was makes every write fail
    std::fs::remove_dir_all(h.cache_dir()).unwrap();
    std::fs::write(h.cache_dir(), b"not a directory").unwrap();

    let output = h.pipeline.complete(ask("hello")).await.unwrap();
    assert_eq!(output.content, REPLY);

    let stats = h.cache.as_ref().unwrap().stats();
    assert_eq!(stats.stores, 0);
    assert!(stats.errors >= 1);

    // The gate was released despite the failed write
    let again = h.pipeline.complete(ask("hello")).await.unwrap();
    assert_eq!(again.content, REPLY);
    assert_eq!(again.usage.cached_tokens, 0);
}

#[tokio::test]
async fn test_reload_while_queued_counts_one_lookup() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;
    h.pipeline.complete(ask("hello")).await.unwrap();

    let mut guard = h.registry.gate().acquire(GatePurpose::Load).await;
    let pipeline = h.pipeline.clone();
    let pending = tokio::spawn(async move { pipeline.complete(ask("hello")).await });
    while h.registry.gate().queue_depth() == 0 {
        tokio::task::yield_now().await;
    }
    h.registry
        .load_locked(&mut guard, MODEL_A, &LoadOptions::default())
        .await
        .unwrap();
    drop(guard);

    let output = pending.await.unwrap().unwrap();
    assert!(output.usage.cached_tokens > 0);

    let stats = h.cache.as_ref().unwrap().stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}
