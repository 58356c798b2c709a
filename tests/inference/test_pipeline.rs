// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{ask, build, harness, MODEL_A, MODEL_B, REPLY};
use pocket_llm_node::inference::{
    FinishReason, GatePurpose, LoadOptions, PipelineConfig, ScriptedLoader, ScriptedModelConfig,
};
use std::time::Duration;

#[tokio::test]
async fn test_complete_returns_scripted_reply() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let output = h.pipeline.complete(ask("What is 2+2?")).await.unwrap();

    assert_eq!(output.content, REPLY);
    assert_eq!(output.finish_reason, FinishReason::Stop);
    assert_eq!(output.meta.model, MODEL_A);
    assert!(output.meta.id.starts_with("chatcmpl-"));
    assert_eq!(output.usage.completion_tokens, REPLY.chars().count());
    assert_eq!(
        output.usage.total_tokens,
        output.usage.prompt_tokens + output.usage.completion_tokens
    );
    assert!(output.tool_calls.is_empty());
}

#[tokio::test]
async fn test_no_model_loaded() {
    let h = harness(ScriptedModelConfig::default()).await;

    let err = h.pipeline.complete(ask("hi")).await.unwrap_err();
    assert_eq!(err.code(), "no_model_loaded");
}

#[tokio::test]
async fn test_request_model_is_loaded_implicitly() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let mut request = ask("hi");
    request.model = Some(MODEL_B.to_string());
    let output = h.pipeline.complete(request).await.unwrap();

    assert_eq!(output.meta.model, MODEL_B);
    assert_eq!(h.registry.active().await.unwrap().id, MODEL_B);
}

#[tokio::test]
async fn test_model_mismatch_without_implicit_load() {
    let config = PipelineConfig {
        allow_implicit_load: false,
        ..Default::default()
    };
    let h = build(ScriptedLoader::default(), config, true).await;
    h.load(MODEL_A).await;

    let mut request = ask("hi");
    request.model = Some(MODEL_B.to_string());
    let err = h.pipeline.complete(request).await.unwrap_err();

    assert_eq!(err.code(), "model_mismatch");
    assert_eq!(h.registry.active().await.unwrap().id, MODEL_A);
}

#[tokio::test]
async fn test_max_tokens_reports_length() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let mut request = ask("hi");
    request.config.max_tokens = Some(3);
    let output = h.pipeline.complete(request).await.unwrap();

    assert_eq!(output.content, "2+2");
    assert_eq!(output.finish_reason, FinishReason::Length);
    assert_eq!(output.usage.completion_tokens, 3);
}

#[tokio::test]
async fn test_stop_sequence_is_not_emitted() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let mut request = ask("hi");
    request.config.stop = vec!["equals".to_string()];
    let output = h.pipeline.complete(request).await.unwrap();

    assert_eq!(output.content, "2+2 ");
    assert_eq!(output.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn test_missing_template_without_fallback() {
    let model = ScriptedModelConfig {
        chat_template: None,
        ..Default::default()
    };
    let h = build(ScriptedLoader::new(model), PipelineConfig::default(), true).await;
    h.load(MODEL_A).await;

    let err = h.pipeline.complete(ask("hi")).await.unwrap_err();
    assert_eq!(err.code(), "template_error");
}

#[tokio::test]
async fn test_missing_template_uses_fallback() {
    let model = ScriptedModelConfig {
        chat_template: None,
        ..Default::default()
    };
    let config = PipelineConfig {
        fallback_template: Some("chatml".to_string()),
        ..Default::default()
    };
    let h = build(ScriptedLoader::new(model), config, true).await;
    h.load(MODEL_A).await;

    let output = h.pipeline.complete(ask("hi")).await.unwrap();
    assert_eq!(output.content, REPLY);
}

#[tokio::test]
async fn test_prompt_larger_than_context() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;
    let prompt_tokens = h
        .pipeline
        .complete(ask("hi"))
        .await
        .unwrap()
        .usage
        .prompt_tokens;

    h.registry
        .load(
            MODEL_A,
            &LoadOptions {
                n_ctx: Some(prompt_tokens as u32 - 1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = h.pipeline.complete(ask("hi")).await.unwrap_err();

    assert_eq!(err.code(), "generation_error");
    assert!(err.to_string().contains(&format!(
        "Requested tokens ({}) exceed context window of {}",
        prompt_tokens,
        prompt_tokens - 1
    )));
}

#[tokio::test]
async fn test_context_full_reports_length() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;
    let prompt_tokens = h
        .pipeline
        .complete(ask("hi"))
        .await
        .unwrap()
        .usage
        .prompt_tokens;

    h.registry
        .load(
            MODEL_A,
            &LoadOptions {
                n_ctx: Some(prompt_tokens as u32 + 4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let output = h.pipeline.complete(ask("hi")).await.unwrap();

    assert_eq!(output.content, "2+2 ");
    assert_eq!(output.finish_reason, FinishReason::Length);
}

#[tokio::test]
async fn test_tool_call_extracted() {
    let model = ScriptedModelConfig {
        reply: r#"<tool_call>{"name": "get_weather", "arguments": {"city": "Paris"}}</tool_call>"#
            .to_string(),
        ..Default::default()
    };
    let h = harness(model).await;
    h.load(MODEL_A).await;

    let mut request = ask("Weather in Paris?");
    request.tools = vec![serde_json::json!({
        "type": "function",
        "function": {"name": "get_weather", "parameters": {"type": "object"}}
    })];
    let output = h.pipeline.complete(request).await.unwrap();

    assert_eq!(output.finish_reason, FinishReason::ToolCalls);
    assert_eq!(output.tool_calls.len(), 1);
    let call = &output.tool_calls[0];
    assert_eq!(call.name, "get_weather");
    assert_eq!(call.id, "call_get_weather_0");
    let args: serde_json::Value = serde_json::from_str(&call.arguments).unwrap();
    assert_eq!(args, serde_json::json!({"city": "Paris"}));
    assert!(output.content.trim().is_empty());
}

#[tokio::test]
async fn test_generation_failure_writes_no_cache() {
    let model = ScriptedModelConfig {
        fail_after: Some(2),
        ..Default::default()
    };
    let h = harness(model).await;
    h.load(MODEL_A).await;

    let err = h.pipeline.complete(ask("hi")).await.unwrap_err();

    assert_eq!(err.code(), "generation_error");
    assert_eq!(h.cache_files(), 0);
    // The gate is free again
    assert!(h.registry.gate().try_acquire(GatePurpose::Load).is_some());
}

#[tokio::test]
async fn test_empty_messages_rejected() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let err = h
        .pipeline
        .complete(pocket_llm_node::inference::GenerationRequest::new(vec![]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");
}

#[tokio::test]
async fn test_requests_are_serialized() {
    let model = ScriptedModelConfig {
        token_delay: Some(Duration::from_millis(2)),
        ..Default::default()
    };
    let h = harness(model).await;
    h.load(MODEL_A).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let pipeline = h.pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline.complete(ask(&format!("question {}", i))).await
        }));
    }
    for handle in handles {
        let output = handle.await.unwrap().unwrap();
        assert_eq!(output.content, REPLY);
    }
    assert_eq!(h.stats.max_live_backends.load(std::sync::atomic::Ordering::SeqCst), 1);
}
