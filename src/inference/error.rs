// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error taxonomy for the serving core.
//!
//! Every variant carries a stable reason code (see [`EngineError::code`]) that
//! the HTTP layer forwards to clients unchanged.

use thiserror::Error;

/// Errors raised by the registry, cache, and chat pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Model identifier does not resolve to a file in the models directory
    #[error("Model '{0}' not found")]
    NotFound(String),

    /// The execution engine rejected the model file or its configuration
    #[error("Failed to load model '{model}': {reason}")]
    Load { model: String, reason: String },

    /// No usable chat template for the active model
    #[error("Chat template error: {0}")]
    Template(String),

    /// Engine failure while processing the prompt or producing tokens
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Disk failure reading or writing a prompt cache entry
    #[error("Prompt cache I/O error: {0}")]
    CacheIo(String),

    #[error("No model is loaded")]
    NoModelLoaded,

    #[error("Requested model '{requested}' but '{loaded}' is loaded")]
    ModelMismatch { requested: String, loaded: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "model_not_found",
            EngineError::Load { .. } => "load_error",
            EngineError::Template(_) => "template_error",
            EngineError::Generation(_) => "generation_error",
            EngineError::CacheIo(_) => "cache_io_error",
            EngineError::NoModelLoaded => "no_model_loaded",
            EngineError::ModelMismatch { .. } => "model_mismatch",
            EngineError::Cancelled => "cancelled",
            EngineError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub(crate) fn load(model: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::Load {
            model: model.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn cache_io(err: impl ToString) -> Self {
        EngineError::CacheIo(err.to_string())
    }

    /// Error reported when a prompt does not fit the context window.
    pub(crate) fn context_overflow(requested: usize, window: usize) -> Self {
        EngineError::Generation(format!(
            "Requested tokens ({}) exceed context window of {}",
            requested, window
        ))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
