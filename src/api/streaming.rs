// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::errors::ApiError;
use super::handlers::{ToolCallBody, UsageBody};
use crate::inference::{ChunkKind, CompletionMeta, CompletionStream, StreamChunk};
use axum::response::sse::Event;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallBody>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk` SSE payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageBody>,
}

impl ChatCompletionChunk {
    fn new(meta: &CompletionMeta, delta: Delta, finish_reason: Option<String>) -> Self {
        Self {
            id: meta.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: meta.created,
            model: meta.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}

/// Wire events for one chunk. The finish chunk is followed by `[DONE]`; an
/// error is sent as a terminal `error` event with nothing after it.
pub fn chunk_events(meta: &CompletionMeta, chunk: StreamChunk) -> Vec<Event> {
    let seq = chunk.seq.to_string();
    let data = match chunk.kind {
        ChunkKind::Role(role) => ChatCompletionChunk::new(
            meta,
            Delta {
                role: Some(role),
                ..Default::default()
            },
            None,
        ),
        ChunkKind::Content(text) => ChatCompletionChunk::new(
            meta,
            Delta {
                content: Some(text),
                ..Default::default()
            },
            None,
        ),
        ChunkKind::ToolCall(call) => ChatCompletionChunk::new(
            meta,
            Delta {
                tool_calls: Some(vec![ToolCallBody::from_call(&call, true)]),
                ..Default::default()
            },
            None,
        ),
        ChunkKind::Finish { reason, usage } => {
            let mut last =
                ChatCompletionChunk::new(meta, Delta::default(), Some(reason.as_str().to_string()));
            last.usage = Some(usage.into());
            return vec![
                json_event(&last).id(seq),
                Event::default().data(DONE_MARKER),
            ];
        }
        ChunkKind::Error(err) => {
            let body = ApiError::from(err).to_response(Some(meta.id.clone()));
            return vec![json_event(&body).event("error").id(seq)];
        }
    };
    vec![json_event(&data).id(seq)]
}

fn json_event<T: Serialize>(payload: &T) -> Event {
    match Event::default().json_data(payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!("Failed to encode SSE payload: {}", e);
            Event::default()
                .data(r#"{"error":{"type":"internal_error","message":"encoding failed"}}"#)
        }
    }
}

/// SSE body for a live completion.
pub fn sse_events(
    completion: CompletionStream,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let meta = completion.meta().clone();
    completion.flat_map(move |chunk| stream::iter(chunk_events(&meta, chunk).into_iter().map(Ok)))
}
