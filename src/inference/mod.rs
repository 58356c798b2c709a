// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod backend;
pub mod cache;
pub mod chat_template;
pub mod decode;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod request;
pub mod serializer;
pub mod stream;
pub mod tool_calls;

// Re-export main types for convenience
pub use backend::{
    BackendLoader, BackendSession, EngineState, ExecutionBackend, LoadOptions, SamplingParams,
    ScriptStats, ScriptedLoader, ScriptedModelConfig, TokenId,
};
#[cfg(feature = "inference")]
pub use backend::LlamaLoader;
pub use cache::{key_for, CacheEntry, CacheKey, CacheStats, PromptCache, PromptConfig};
pub use chat_template::{ChatTemplate, PromptTemplate};
pub use error::{EngineError, EngineResult};
pub use models::{ModelIdentity, ModelInfo, ModelRegistry};
pub use pipeline::{ChatPipeline, PipelineConfig, PipelineState, PrewarmReport};
pub use request::{ChatMessage, GenerationRequest, InferenceConfig, MessageToolCall};
pub use serializer::{GateGuard, GatePurpose, RequestSerializer};
pub use stream::{
    ChunkKind, CompletionMeta, CompletionOutput, CompletionStream, FinishReason, StreamChunk,
    StreamMux, Usage,
};
pub use tool_calls::{ToolCall, ToolCallParser};
