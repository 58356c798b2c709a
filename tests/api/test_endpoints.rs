// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Route-level tests driven through `tower::ServiceExt::oneshot` against the
//! scripted backend.

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use pocket_llm_node::{
    api::{create_app, ApiConfig, ApiServer, AppState},
    inference::{
        ChatPipeline, LoadOptions, ModelRegistry, PipelineConfig, PromptCache, RequestSerializer,
        ScriptedLoader, ScriptedModelConfig,
    },
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

const MODEL: &str = "tiny.gguf";
const REPLY: &str = "Paris is the capital.";

struct TestApp {
    _dir: TempDir,
    app: Router,
    server: Arc<ApiServer>,
}

async fn setup(reply: &str) -> TestApp {
    let dir = TempDir::new().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(models.join(MODEL), b"GGUF-test-model").unwrap();
    std::fs::write(models.join("readme.md"), b"not a model").unwrap();

    let loader = ScriptedLoader::new(ScriptedModelConfig {
        reply: reply.to_string(),
        ..Default::default()
    });
    let registry = Arc::new(
        ModelRegistry::new(
            models,
            Arc::new(loader),
            Arc::new(RequestSerializer::new()),
            LoadOptions::default(),
        )
        .await
        .unwrap(),
    );
    let cache = PromptCache::open(dir.path().join("cache"), 3).await.unwrap();
    let pipeline = Arc::new(ChatPipeline::new(
        registry,
        Some(Arc::new(cache)),
        PipelineConfig::default(),
    ));
    let server = Arc::new(ApiServer::new(ApiConfig::default(), pipeline));

    TestApp {
        _dir: dir,
        app: create_app(AppState::new(server.clone())),
        server,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn chat_body(stream: bool) -> Value {
    json!({
        "messages": [
            {"role": "system", "content": "Answer briefly."},
            {"role": "user", "content": "What is the capital of France?"}
        ],
        "stream": stream
    })
}

#[tokio::test]
async fn test_models_lists_gguf_files() {
    let t = setup(REPLY).await;

    let (status, body) = send(&t.app, get("/models")).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"models": [MODEL]}));
}

#[tokio::test]
async fn test_set_model_unknown_is_404() {
    let t = setup(REPLY).await;

    let (status, body) = send(
        &t.app,
        post_json("/setModel", json!({"model_name": "nope.gguf"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["type"], "model_not_found");
}

#[tokio::test]
async fn test_set_model_loads() {
    let t = setup(REPLY).await;

    let (status, body) = send(
        &t.app,
        post_json(
            "/setModel",
            json!({"model_name": MODEL, "load_model_configs": {"n_ctx": 1024}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], "success");
    assert_eq!(value["model"], MODEL);
    assert_eq!(value["context_size"], 1024);
}

#[tokio::test]
async fn test_chat_without_model_is_conflict() {
    let t = setup(REPLY).await;

    let (status, body) = send(&t.app, post_json("/chat/completions", chat_body(false))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["type"], "no_model_loaded");
}

#[tokio::test]
async fn test_chat_completion_json() {
    let t = setup(REPLY).await;
    t.server.load_default_model(MODEL).await.unwrap();

    let (status, body) = send(&t.app, post_json("/chat/completions", chat_body(false))).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["model"], MODEL);
    assert_eq!(value["choices"][0]["message"]["role"], "assistant");
    assert_eq!(value["choices"][0]["message"]["content"], REPLY);
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(
        value["usage"]["completion_tokens"],
        REPLY.chars().count() as u64
    );
}

#[tokio::test]
async fn test_chat_completion_implicit_load_by_model_field() {
    let t = setup(REPLY).await;

    let mut body = chat_body(false);
    body["model"] = json!(MODEL);
    let (status, _) = send(&t.app, post_json("/chat/completions", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.server.registry().active().await.unwrap().id, MODEL);
}

#[tokio::test]
async fn test_chat_completion_stream_sse() {
    let t = setup(REPLY).await;
    t.server.load_default_model(MODEL).await.unwrap();

    let response = t
        .app
        .clone()
        .oneshot(post_json("/chat/completions", chat_body(true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    let payloads: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(payloads.last(), Some(&"[DONE]"));

    let mut content = String::new();
    let mut finish = None;
    for payload in &payloads[..payloads.len() - 1] {
        let chunk: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
        if let Some(text) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(text);
        }
        if let Some(reason) = chunk["choices"][0]["finish_reason"].as_str() {
            finish = Some(reason.to_string());
        }
    }
    assert_eq!(content, REPLY);
    assert_eq!(finish.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_tool_call_response_shape() {
    let t = setup(r#"<tool_call>{"name": "lookup", "arguments": {"q": "France"}}</tool_call>"#).await;
    t.server.load_default_model(MODEL).await.unwrap();

    let mut body = chat_body(false);
    body["tools"] = json!([{"type": "function", "function": {"name": "lookup"}}]);
    let (status, body) = send(&t.app, post_json("/chat/completions", body)).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();

    let choice = &value["choices"][0];
    assert_eq!(choice["finish_reason"], "tool_calls");
    assert!(choice["message"]["content"].is_null());
    let call = &choice["message"]["tool_calls"][0];
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["name"], "lookup");
    let args: Value =
        serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(args, json!({"q": "France"}));
}

#[tokio::test]
async fn test_restore_cache_then_hit() {
    let t = setup(REPLY).await;
    t.server.load_default_model(MODEL).await.unwrap();

    let (status, body) = send(&t.app, post_json("/restore_cache", chat_body(false))).await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["status"], "success");
    assert_eq!(report["key"].as_str().unwrap().len(), 64);

    let (_, body) = send(&t.app, post_json("/chat/completions", chat_body(false))).await;
    let value: Value = serde_json::from_slice(&body).unwrap();
    let prompt_tokens = report["prompt_tokens"].as_u64().unwrap();
    assert_eq!(
        value["usage"]["prompt_tokens_details"]["cached_tokens"],
        prompt_tokens - 1
    );
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let t = setup(REPLY).await;

    let request = Request::builder()
        .method("POST")
        .uri("/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_health_reports_model() {
    let t = setup(REPLY).await;

    let (_, body) = send(&t.app, get("/health")).await;
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["model_loaded"], false);

    t.server.load_default_model(MODEL).await.unwrap();
    let (status, body) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["model_loaded"], true);
    assert_eq!(value["model"], MODEL);
    assert_eq!(value["busy"], false);
    assert!(value["uptime_secs"].is_u64());
}

#[tokio::test]
async fn test_cache_stats_endpoint() {
    let t = setup(REPLY).await;
    t.server.load_default_model(MODEL).await.unwrap();
    send(&t.app, post_json("/chat/completions", chat_body(false))).await;
    send(&t.app, post_json("/chat/completions", chat_body(false))).await;

    let (status, body) = send(&t.app, get("/cache/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["enabled"], true);
    assert_eq!(value["hits"], 1);
    assert_eq!(value["misses"], 1);
}
