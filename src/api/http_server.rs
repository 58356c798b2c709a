// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::errors::ApiError;
use super::handlers::{ChatCompletionRequest, SetModelRequest};
use super::server::ApiServer;
use super::streaming::sse_events;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::{sse::KeepAlive, IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub api_server: Arc<ApiServer>,
}

impl AppState {
    pub fn new(api_server: Arc<ApiServer>) -> Self {
        Self { api_server }
    }
}

pub fn create_app(state: AppState) -> Router {
    let enable_cors = state.api_server.config().enable_cors;
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/models", get(models_handler))
        .route("/setModel", post(set_model_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .route("/restore_cache", post(restore_cache_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = state.api_server.config().listen_addr;
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("API server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down API server");
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.api_server.health_check().await)
}

async fn models_handler(State(state): State<AppState>) -> Response {
    match state.api_server.list_models().await {
        Ok(models) => Json(models).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn set_model_handler(
    State(state): State<AppState>,
    body: Result<Json<SetModelRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    tracing::info!("Switching model to {}", request.model_name);
    let response = state.api_server.set_model(request).await?;
    Ok(Json(response).into_response())
}

async fn chat_completions_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;

    if request.stream {
        // Dropping the body stream (client disconnect) cancels generation
        let completion = state.api_server.stream_chat_completion(request).await?;
        Ok(Sse::new(sse_events(completion))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        let completion = state.api_server.chat_completion(request).await?;
        Ok(Json(completion).into_response())
    }
}

async fn restore_cache_handler(
    State(state): State<AppState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let response = state.api_server.restore_cache(request).await?;
    Ok(Json(response).into_response())
}

async fn cache_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.api_server.cache_stats())
}
