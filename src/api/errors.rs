// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use crate::inference::EngineError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status used when the client went away or cancelled
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    Engine(EngineError),
    /// Body could not be parsed
    InvalidJson(String),
    InternalError(String),
}

impl ApiError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Engine(e) => e.code(),
            ApiError::InvalidJson(_) => "invalid_request",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::NotFound(_) => 404,
                EngineError::Load { .. } => 400,
                EngineError::Template(_) => 500,
                EngineError::Generation(_) => 500,
                EngineError::CacheIo(_) => 500,
                EngineError::NoModelLoaded => 409,
                EngineError::ModelMismatch { .. } => 409,
                EngineError::Cancelled => CLIENT_CLOSED_REQUEST,
                EngineError::InvalidRequest(_) => 400,
            },
            ApiError::InvalidJson(_) => 400,
            ApiError::InternalError(_) => 500,
        }
    }

    pub fn to_response(&self, request_id: Option<String>) -> ErrorResponse {
        let message = match self {
            ApiError::Engine(e) => e.to_string(),
            ApiError::InvalidJson(msg) => format!("Invalid JSON body: {}", msg),
            ApiError::InternalError(msg) => msg.clone(),
        };
        ErrorResponse {
            error: ErrorBody {
                error_type: self.error_type().to_string(),
                message,
                request_id,
            },
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidJson(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        (status, Json(self.to_response(None))).into_response()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Engine(e) => write!(f, "{}", e),
            ApiError::InvalidJson(msg) => write!(f, "Invalid JSON body: {}", msg),
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}
