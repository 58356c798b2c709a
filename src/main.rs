// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{Context, Result};
use clap::Parser;
use pocket_llm_node::{
    api::{start_server, ApiServer, AppState},
    config::{CliArgs, NodeConfig},
    inference::{BackendLoader, ChatPipeline, ModelRegistry, PromptCache, RequestSerializer},
    version,
};
use std::{env, sync::Arc};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "inference")]
fn backend_loader() -> Arc<dyn BackendLoader> {
    Arc::new(pocket_llm_node::inference::LlamaLoader::new())
}

#[cfg(not(feature = "inference"))]
fn backend_loader() -> Arc<dyn BackendLoader> {
    tracing::warn!("Built without the `inference` feature; serving the scripted backend");
    Arc::new(pocket_llm_node::inference::ScriptedLoader::default())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting {}", version::get_version_string());

    let args = CliArgs::parse();
    let config = NodeConfig::load(&args).context("failed to load configuration")?;

    let gate = Arc::new(RequestSerializer::new());
    let registry = Arc::new(
        ModelRegistry::new(
            config.models_dir.clone(),
            backend_loader(),
            gate,
            config.load_options.clone(),
        )
        .await?,
    );
    tracing::info!("Models directory: {}", config.models_dir.display());

    let cache = match &config.cache_dir {
        Some(dir) => {
            let cache = PromptCache::open(dir.clone(), config.cache_compression_level).await?;
            tracing::info!("Prompt cache at {}", dir.display());
            Some(Arc::new(cache))
        }
        None => {
            tracing::info!("Prompt cache disabled");
            None
        }
    };

    let pipeline = Arc::new(ChatPipeline::new(registry, cache, config.pipeline_config()));
    let api_server = Arc::new(ApiServer::new(config.api_config()?, pipeline));

    if let Some(model) = &config.default_model {
        // A bad default model is logged; the node still serves /setModel
        if let Err(e) = api_server.load_default_model(model).await {
            tracing::error!("Failed to load default model {}: {}", model, e);
        }
    }

    start_server(AppState::new(api_server)).await?;
    tracing::info!("Goodbye");
    Ok(())
}
