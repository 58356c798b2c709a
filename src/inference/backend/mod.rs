// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The execution resource seam.
//!
//! A backend owns one loaded model. It is not internally thread-safe: callers
//! only touch it while holding the [`RequestSerializer`] gate, and all token
//! processing happens inside a [`BackendSession`] opened for one request.
//!
//! [`RequestSerializer`]: crate::inference::RequestSerializer

#[cfg(feature = "inference")]
pub mod llama;
pub mod scripted;

use crate::inference::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[cfg(feature = "inference")]
pub use llama::{LlamaBackend, LlamaLoader};
pub use scripted::{ScriptStats, ScriptedBackend, ScriptedLoader, ScriptedModelConfig};

pub type TokenId = i32;

/// Engine options supplied with `load_model_configs`.
///
/// Unknown keys are kept in `extra` and handed to the backend untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_batch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LoadOptions {
    /// Fill every unset field from `base`.
    pub fn merged_over(&self, base: &LoadOptions) -> LoadOptions {
        let mut extra = base.extra.clone();
        for (k, v) in &self.extra {
            extra.insert(k.clone(), v.clone());
        }
        LoadOptions {
            n_ctx: self.n_ctx.or(base.n_ctx),
            n_gpu_layers: self.n_gpu_layers.or(base.n_gpu_layers),
            verbose: self.verbose.or(base.verbose),
            n_batch: self.n_batch.or(base.n_batch),
            n_threads: self.n_threads.or(base.n_threads),
            extra,
        }
    }
}

/// Parameters that only influence sampling, never the rendered prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            seed: 42,
        }
    }
}

/// Serialized engine-internal state covering `tokens`.
///
/// `signature` identifies the engine configuration the blob was produced
/// under; a blob is only restorable into a backend reporting the same one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub tokens: Vec<TokenId>,
    pub blob: Vec<u8>,
    pub signature: String,
}

/// Facts about a loaded model captured at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendMetadata {
    pub context_size: usize,
    pub signature: String,
    /// Jinja chat template embedded in the model file, if any
    pub chat_template: Option<String>,
    pub bos_token: String,
    pub eos_token: String,
}

/// A loaded model. One instance exists per resident model.
pub trait ExecutionBackend: Send {
    fn metadata(&self) -> BackendMetadata;

    fn tokenize(&self, text: &str) -> EngineResult<Vec<TokenId>>;

    /// Start a fresh evaluation context for one request.
    fn open_session<'a>(
        &'a mut self,
        params: &SamplingParams,
    ) -> EngineResult<Box<dyn BackendSession + 'a>>;
}

/// One evaluation context. Tokens accepted through [`BackendSession::ingest`]
/// accumulate until the session is dropped.
pub trait BackendSession {
    /// Discard everything held in the context.
    fn reset(&mut self) -> EngineResult<()>;

    /// Load `state` and keep only its first `keep` tokens.
    fn restore(&mut self, state: &EngineState, keep: usize) -> EngineResult<()>;

    fn ingest(&mut self, tokens: &[TokenId]) -> EngineResult<()>;

    /// Sample the next token from the logits of the last ingested token.
    fn sample(&mut self) -> EngineResult<TokenId>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Raw bytes for one token; may be an incomplete UTF-8 sequence.
    fn token_bytes(&self, token: TokenId) -> EngineResult<Vec<u8>>;

    /// Tokens currently held in the context.
    fn tokens(&self) -> &[TokenId];

    fn snapshot(&self) -> EngineResult<EngineState>;
}

/// Turns a model file into a backend.
pub trait BackendLoader: Send + Sync {
    fn load(&self, path: &Path, options: &LoadOptions) -> EngineResult<Box<dyn ExecutionBackend>>;
}
