// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{ask, harness, MODEL_A, MODEL_B, REPLY};
use futures::StreamExt;
use pocket_llm_node::inference::{
    ChunkKind, FinishReason, GatePurpose, LoadOptions, ScriptedModelConfig, StreamChunk,
};
use std::time::Duration;

async fn drain(mut stream: pocket_llm_node::inference::CompletionStream) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }
    chunks
}

#[tokio::test]
async fn test_stream_matches_collected_completion() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let chunks = drain(h.pipeline.generate(ask("hi")).await.unwrap()).await;
    let collected = h.pipeline.complete(ask("hi")).await.unwrap();

    assert_eq!(chunks[0].kind, ChunkKind::Role("assistant".to_string()));
    let streamed: String = chunks
        .iter()
        .filter_map(|c| match &c.kind {
            ChunkKind::Content(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, collected.content);
    assert_eq!(streamed, REPLY);

    let last = chunks.last().unwrap();
    assert!(last.is_terminal());
    match &last.kind {
        ChunkKind::Finish { reason, usage } => {
            assert_eq!(*reason, FinishReason::Stop);
            assert_eq!(usage.completion_tokens, REPLY.chars().count());
        }
        other => panic!("unexpected terminal chunk {:?}", other),
    }

    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.seq, i as u64);
    }
}

#[tokio::test]
async fn test_failure_arrives_as_terminal_error_chunk() {
    let model = ScriptedModelConfig {
        fail_after: Some(3),
        ..Default::default()
    };
    let h = harness(model).await;
    h.load(MODEL_A).await;

    let chunks = drain(h.pipeline.generate(ask("hi")).await.unwrap()).await;

    let last = chunks.last().unwrap();
    match &last.kind {
        ChunkKind::Error(err) => assert_eq!(err.code(), "generation_error"),
        other => panic!("expected error chunk, got {:?}", other),
    }
    let terminals = chunks.iter().filter(|c| c.is_terminal()).count();
    assert_eq!(terminals, 1);
}

#[tokio::test]
async fn test_dropping_stream_cancels_and_releases_gate() {
    let model = ScriptedModelConfig {
        reply: "x".repeat(400),
        token_delay: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    let h = harness(model).await;
    h.load(MODEL_A).await;

    let mut stream = h.pipeline.generate(ask("hi")).await.unwrap();
    let mut seen = 0;
    while let Some(chunk) = stream.next().await {
        if matches!(chunk.kind, ChunkKind::Content(_)) {
            seen += 1;
            if seen == 3 {
                break;
            }
        }
    }
    drop(stream);

    let guard = tokio::time::timeout(
        Duration::from_secs(2),
        h.registry.gate().acquire(GatePurpose::Load),
    )
    .await
    .expect("gate released after cancellation");
    drop(guard);

    assert_eq!(h.cache_files(), 0);
    let sampled = h.stats.sampled_tokens.load(std::sync::atomic::Ordering::SeqCst);
    assert!(sampled < 400);
}

#[tokio::test]
async fn test_explicit_cancel_ends_stream_with_cancelled() {
    let model = ScriptedModelConfig {
        reply: "y".repeat(400),
        token_delay: Some(Duration::from_millis(5)),
        ..Default::default()
    };
    let h = harness(model).await;
    h.load(MODEL_A).await;

    let stream = h.pipeline.generate(ask("hi")).await.unwrap();
    stream.cancel();
    let err = stream.collect().await.unwrap_err();

    assert_eq!(err.code(), "cancelled");
}

#[tokio::test]
async fn test_set_model_waits_for_in_flight_stream() {
    let model = ScriptedModelConfig {
        token_delay: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let h = harness(model).await;
    h.load(MODEL_A).await;

    let stream = h.pipeline.generate(ask("hi")).await.unwrap();

    let registry = h.registry.clone();
    let swap = tokio::spawn(async move { registry.load(MODEL_B, &LoadOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!swap.is_finished());
    assert_eq!(h.registry.active().await.unwrap().id, MODEL_A);

    let output = stream.collect().await.unwrap();
    assert_eq!(output.content, REPLY);
    assert_eq!(output.meta.model, MODEL_A);

    let info = swap.await.unwrap().unwrap();
    assert_eq!(info.id, MODEL_B);
    assert_eq!(h.stats.max_live_backends.load(std::sync::atomic::Ordering::SeqCst), 1);
}
