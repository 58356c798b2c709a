// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod errors;
pub mod handlers;
pub mod http_server;
pub mod server;
pub mod streaming;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{
    CacheStatsResponse, ChatCompletion, ChatCompletionRequest, HealthResponse, ModelsResponse,
    RestoreCacheResponse, SetModelRequest, SetModelResponse,
};
pub use http_server::{create_app, start_server, AppState};
pub use server::{ApiConfig, ApiServer};
pub use streaming::{ChatCompletionChunk, DONE_MARKER};
