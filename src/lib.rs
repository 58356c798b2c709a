// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod api;
pub mod config;
pub mod inference;
pub mod version;

pub use api::{ApiConfig, ApiServer};
pub use config::{CliArgs, NodeConfig};
pub use inference::{ChatPipeline, EngineError, ModelRegistry, PromptCache, RequestSerializer};
