// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::errors::ApiError;
use super::handlers::{
    CacheStatsResponse, ChatCompletion, ChatCompletionRequest, HealthResponse, ModelsResponse,
    RestoreCacheResponse, SetModelRequest, SetModelResponse,
};
use crate::inference::{ChatPipeline, CompletionStream, EngineError, ModelRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            enable_cors: true,
        }
    }
}

/// Request handling behind the HTTP routes.
pub struct ApiServer {
    config: ApiConfig,
    pipeline: Arc<ChatPipeline>,
    started_at: Instant,
}

impl ApiServer {
    pub fn new(config: ApiConfig, pipeline: Arc<ChatPipeline>) -> Self {
        Self {
            config,
            pipeline,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<ChatPipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.pipeline.registry()
    }

    pub async fn list_models(&self) -> Result<ModelsResponse, ApiError> {
        let models = self.registry().list().await?;
        Ok(ModelsResponse { models })
    }

    pub async fn set_model(&self, request: SetModelRequest) -> Result<SetModelResponse, ApiError> {
        let options = request.load_model_configs.unwrap_or_default();
        let info = self.registry().load(&request.model_name, &options).await?;
        Ok(SetModelResponse {
            status: "success".to_string(),
            message: format!("Model {} loaded", info.id),
            model: info.id,
            context_size: info.context_size,
        })
    }

    pub async fn chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletion, ApiError> {
        let output = self.pipeline.complete(request.into_generation()).await?;
        Ok(output.into())
    }

    pub async fn stream_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<CompletionStream, ApiError> {
        Ok(self.pipeline.generate(request.into_generation()).await?)
    }

    pub async fn restore_cache(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<RestoreCacheResponse, ApiError> {
        if self.pipeline.cache().is_none() {
            return Err(EngineError::InvalidRequest("prompt cache is disabled".to_string()).into());
        }
        let report = self.pipeline.prewarm(request.into_generation()).await?;
        Ok(RestoreCacheResponse {
            status: "success".to_string(),
            key: report.key.to_hex(),
            prompt_tokens: report.prompt_tokens,
            cached_tokens: report.cached_tokens,
        })
    }

    pub async fn health_check(&self) -> HealthResponse {
        let active = self.registry().active().await;
        let gate = self.registry().gate();
        HealthResponse {
            status: "ok".to_string(),
            model_loaded: active.is_some(),
            model: active.map(|info| info.id),
            busy: gate.is_busy(),
            queue_depth: gate.queue_depth(),
            uptime_secs: self.uptime_secs(),
            version: crate::version::VERSION.to_string(),
        }
    }

    pub fn cache_stats(&self) -> CacheStatsResponse {
        match self.pipeline.cache() {
            Some(cache) => CacheStatsResponse {
                enabled: true,
                stats: cache.stats(),
            },
            None => CacheStatsResponse {
                enabled: false,
                stats: Default::default(),
            },
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Load the configured default model at startup.
    pub async fn load_default_model(&self, model: &str) -> Result<(), ApiError> {
        let info = self.registry().load(model, &Default::default()).await?;
        info!("Default model {} ready (n_ctx={})", info.id, info.context_size);
        Ok(())
    }
}
