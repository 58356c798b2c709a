// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::support::{harness, MODEL_A, MODEL_B};
use pocket_llm_node::inference::{LoadOptions, ScriptedModelConfig};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_list_models_only_gguf_sorted() {
    let h = harness(ScriptedModelConfig::default()).await;
    std::fs::write(h.models_dir().join("notes.txt"), b"hello").unwrap();
    std::fs::create_dir_all(h.models_dir().join("subdir.gguf.d")).unwrap();

    let models = h.registry.list().await.unwrap();
    assert_eq!(models, vec![MODEL_A.to_string(), MODEL_B.to_string()]);
}

#[tokio::test]
async fn test_load_unknown_model_is_not_found() {
    let h = harness(ScriptedModelConfig::default()).await;

    let err = h
        .registry
        .load("missing.gguf", &LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "model_not_found");
    assert!(h.registry.active().await.is_none());
}

#[tokio::test]
async fn test_load_sets_active_model() {
    let h = harness(ScriptedModelConfig::default()).await;

    let info = h
        .registry
        .load(
            MODEL_A,
            &LoadOptions {
                n_ctx: Some(2048),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(info.id, MODEL_A);
    assert_eq!(info.context_size, 2048);
    assert!(info.size_bytes > 0);
    assert_eq!(h.registry.active().await.unwrap().id, MODEL_A);
}

#[tokio::test]
async fn test_swap_keeps_single_resident_backend() {
    let h = harness(ScriptedModelConfig::default()).await;

    let first = h.registry.load(MODEL_A, &LoadOptions::default()).await.unwrap();
    let second = h.registry.load(MODEL_B, &LoadOptions::default()).await.unwrap();
    h.load(MODEL_A).await;

    assert!(second.generation > first.generation);
    assert_eq!(h.stats.loads.load(Ordering::SeqCst), 3);
    assert_eq!(h.stats.max_live_backends.load(Ordering::SeqCst), 1);
    assert_eq!(h.stats.live(), 1);
    assert_eq!(h.registry.active().await.unwrap().id, MODEL_A);
}

#[tokio::test]
async fn test_failed_load_leaves_nothing_resident() {
    let h = harness(ScriptedModelConfig::default()).await;
    std::fs::write(h.models_dir().join("broken.gguf"), b"NOTAMODEL").unwrap();
    h.load(MODEL_A).await;

    let err = h
        .registry
        .load("broken.gguf", &LoadOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "load_error");
    assert!(h.registry.active().await.is_none());
    assert_eq!(h.stats.live(), 0);
}

#[tokio::test]
async fn test_oversized_context_is_load_error() {
    let h = harness(ScriptedModelConfig::default()).await;

    let err = h
        .registry
        .load(
            MODEL_A,
            &LoadOptions {
                n_ctx: Some(1_000_000),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "load_error");
    assert!(err.to_string().contains("exceeds available memory"));
}

#[tokio::test]
async fn test_unload_clears_active() {
    let h = harness(ScriptedModelConfig::default()).await;
    h.load(MODEL_A).await;

    let old = h.registry.unload().await.unwrap();
    assert_eq!(old.id, MODEL_A);
    assert!(h.registry.active().await.is_none());
    assert_eq!(h.stats.live(), 0);
    assert!(h.registry.unload().await.is_none());
}
