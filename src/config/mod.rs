// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Node configuration.
//!
//! Values come from command-line flags (each with an environment variable
//! fallback), then an optional TOML file, then built-in defaults.

use crate::api::ApiConfig;
use crate::inference::cache::DEFAULT_COMPRESSION_LEVEL;
use crate::inference::pipeline::DEFAULT_STREAM_BUFFER;
use crate::inference::request::DEFAULT_MAX_TOKENS;
use crate::inference::{LoadOptions, PipelineConfig, SamplingParams};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
}

/// Local LLM serving node
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "pocket-llm-node")]
#[command(version = crate::version::VERSION_NUMBER)]
#[command(about = "Serve a local GGUF model over an OpenAI-style HTTP API", long_about = None)]
pub struct CliArgs {
    /// TOML configuration file
    #[arg(long, env = "POCKET_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "POCKET_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "POCKET_PORT")]
    pub port: Option<u16>,

    /// Directory scanned for .gguf files
    #[arg(long, env = "POCKET_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    /// Prompt cache directory
    #[arg(long, env = "POCKET_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Disable the prompt cache
    #[arg(long, env = "POCKET_NO_CACHE")]
    pub no_cache: bool,

    /// Model loaded at startup
    #[arg(long, env = "POCKET_DEFAULT_MODEL")]
    pub default_model: Option<String>,

    #[arg(long, env = "POCKET_N_CTX")]
    pub n_ctx: Option<u32>,

    #[arg(long, env = "POCKET_N_GPU_LAYERS")]
    pub n_gpu_layers: Option<u32>,

    #[arg(long, env = "POCKET_VERBOSE")]
    pub verbose: bool,

    /// Template name or Jinja file used instead of the model's own
    #[arg(long, env = "POCKET_CHAT_TEMPLATE")]
    pub chat_template: Option<String>,

    /// Template used when a model has none
    #[arg(long, env = "POCKET_FALLBACK_TEMPLATE")]
    pub fallback_template: Option<String>,

    #[arg(long, env = "POCKET_MAX_TOKENS")]
    pub max_tokens: Option<usize>,

    #[arg(long, env = "POCKET_TEMPERATURE")]
    pub temperature: Option<f32>,

    /// Load the requested model when it differs from the resident one
    #[arg(long, env = "POCKET_ALLOW_IMPLICIT_LOAD")]
    pub allow_implicit_load: Option<bool>,

    /// Bounded channel size between producer and consumer
    #[arg(long, env = "POCKET_STREAM_BUFFER")]
    pub stream_buffer: Option<usize>,

    #[arg(long, env = "POCKET_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, env = "POCKET_CACHE_COMPRESSION")]
    pub cache_compression_level: Option<i32>,
}

/// Shape of the TOML file. Every key is optional.
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub models_dir: Option<PathBuf>,
    /// An empty path disables the cache
    pub cache_dir: Option<PathBuf>,
    pub default_model: Option<String>,
    pub chat_template: Option<String>,
    pub fallback_template: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub allow_implicit_load: Option<bool>,
    pub stream_buffer: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub cache_compression_level: Option<i32>,
    pub enable_cors: Option<bool>,
    /// Default engine options, same keys as `load_model_configs`
    pub load_options: Option<LoadOptions>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub models_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub default_model: Option<String>,
    pub load_options: LoadOptions,
    pub chat_template: Option<String>,
    pub fallback_template: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub allow_implicit_load: bool,
    pub stream_buffer: usize,
    pub request_timeout: Option<Duration>,
    pub cache_compression_level: i32,
    pub enable_cors: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            models_dir: PathBuf::from("./models"),
            cache_dir: Some(PathBuf::from("./cache")),
            default_model: None,
            load_options: LoadOptions::default(),
            chat_template: None,
            fallback_template: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: SamplingParams::default().temperature,
            allow_implicit_load: true,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            request_timeout: None,
            cache_compression_level: DEFAULT_COMPRESSION_LEVEL,
            enable_cors: true,
        }
    }
}

impl NodeConfig {
    /// Resolve flags, the optional config file and defaults.
    pub fn load(args: &CliArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::from_sources(args, file))
    }

    pub fn from_sources(args: &CliArgs, file: FileConfig) -> Self {
        let defaults = NodeConfig::default();

        let mut load_options = file.load_options.unwrap_or_default();
        load_options.n_ctx = args.n_ctx.or(load_options.n_ctx);
        load_options.n_gpu_layers = args.n_gpu_layers.or(load_options.n_gpu_layers);
        if args.verbose {
            load_options.verbose = Some(true);
        }

        let cache_dir = if args.no_cache {
            None
        } else {
            match args.cache_dir.clone().or(file.cache_dir) {
                Some(dir) if dir.as_os_str().is_empty() => None,
                Some(dir) => Some(dir),
                None => defaults.cache_dir,
            }
        };

        Self {
            host: args.host.clone().or(file.host).unwrap_or(defaults.host),
            port: args.port.or(file.port).unwrap_or(defaults.port),
            models_dir: args
                .models_dir
                .clone()
                .or(file.models_dir)
                .unwrap_or(defaults.models_dir),
            cache_dir,
            default_model: args.default_model.clone().or(file.default_model),
            load_options,
            chat_template: args.chat_template.clone().or(file.chat_template),
            fallback_template: args.fallback_template.clone().or(file.fallback_template),
            max_tokens: args
                .max_tokens
                .or(file.max_tokens)
                .unwrap_or(defaults.max_tokens),
            temperature: args
                .temperature
                .or(file.temperature)
                .unwrap_or(defaults.temperature),
            allow_implicit_load: args
                .allow_implicit_load
                .or(file.allow_implicit_load)
                .unwrap_or(defaults.allow_implicit_load),
            stream_buffer: args
                .stream_buffer
                .or(file.stream_buffer)
                .unwrap_or(defaults.stream_buffer)
                .max(1),
            request_timeout: args
                .request_timeout_secs
                .or(file.request_timeout_secs)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            cache_compression_level: args
                .cache_compression_level
                .or(file.cache_compression_level)
                .unwrap_or(defaults.cache_compression_level),
            enable_cors: file.enable_cors.unwrap_or(defaults.enable_cors),
        }
    }

    /// Read a template argument that names a file instead of a template.
    fn template_source(arg: &Option<String>) -> Option<String> {
        let arg = arg.as_ref()?;
        let path = Path::new(arg);
        if path.extension().map_or(false, |e| e == "jinja" || e == "j2") {
            match std::fs::read_to_string(path) {
                Ok(source) => return Some(source),
                Err(e) => tracing::warn!("Cannot read template file {}: {}", arg, e),
            }
        }
        Some(arg.clone())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chat_template: Self::template_source(&self.chat_template),
            fallback_template: Self::template_source(&self.fallback_template),
            default_max_tokens: self.max_tokens,
            sampling: SamplingParams {
                temperature: self.temperature,
                ..SamplingParams::default()
            },
            allow_implicit_load: self.allow_implicit_load,
            stream_buffer: self.stream_buffer,
            request_timeout: self.request_timeout,
        }
    }

    pub fn api_config(&self) -> Result<ApiConfig, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        let listen_addr: SocketAddr = raw
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(raw.clone()))?;
        Ok(ApiConfig {
            listen_addr,
            enable_cors: self.enable_cors,
        })
    }
}
