// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Turning generation events into ordered output chunks.
//!
//! The producer sends [`GenerationEvent`]s; [`StreamMux`] numbers them, pulls
//! tool calls out of the text and decides the finish reason. The same chunks
//! back both the SSE stream and the aggregated completion, so the two forms
//! cannot drift apart.

use super::error::{EngineError, EngineResult};
use super::tool_calls::{ParsedPiece, ToolCall, ToolCallParser};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
        }
    }
}

/// Why the producer stopped sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    EndOfGeneration,
    StopSequence,
    MaxTokens,
    ContextFull,
}

impl StopCause {
    pub fn is_natural(&self) -> bool {
        matches!(self, StopCause::EndOfGeneration | StopCause::StopSequence)
    }

    pub fn finish_reason(&self) -> FinishReason {
        if self.is_natural() {
            FinishReason::Stop
        } else {
            FinishReason::Length
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    /// Prompt tokens restored from the prompt cache instead of processed
    pub cached_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize, cached_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cached_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub cause: StopCause,
    pub usage: Usage,
}

/// What the producer reports to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Text(String),
    Finished(GenerationSummary),
    Failed(EngineError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkKind {
    Role(String),
    Content(String),
    ToolCall(ToolCall),
    Finish { reason: FinishReason, usage: Usage },
    Error(EngineError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub seq: u64,
    pub kind: ChunkKind,
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ChunkKind::Finish { .. } | ChunkKind::Error(_))
    }
}

#[derive(Debug)]
pub struct StreamMux {
    parser: ToolCallParser,
    next_seq: u64,
    started: bool,
    done: bool,
}

impl Default for StreamMux {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMux {
    pub fn new() -> Self {
        Self {
            parser: ToolCallParser::new(),
            next_seq: 0,
            started: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn handle(&mut self, event: GenerationEvent) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        if self.done {
            return chunks;
        }
        if !self.started {
            self.started = true;
            self.emit(&mut chunks, ChunkKind::Role("assistant".to_string()));
        }

        match event {
            GenerationEvent::Text(text) => {
                let pieces = self.parser.push(&text);
                self.emit_pieces(&mut chunks, pieces);
            }
            GenerationEvent::Finished(summary) => {
                let pieces = self.parser.finish();
                self.emit_pieces(&mut chunks, pieces);
                let reason = if self.parser.calls_emitted() > 0 && summary.cause.is_natural() {
                    FinishReason::ToolCalls
                } else {
                    summary.cause.finish_reason()
                };
                self.emit(
                    &mut chunks,
                    ChunkKind::Finish {
                        reason,
                        usage: summary.usage,
                    },
                );
                self.done = true;
            }
            GenerationEvent::Failed(err) => {
                self.emit(&mut chunks, ChunkKind::Error(err));
                self.done = true;
            }
        }
        chunks
    }

    /// The producer went away without a terminal event.
    pub fn interrupted(&mut self) -> Vec<StreamChunk> {
        self.handle(GenerationEvent::Failed(EngineError::Generation(
            "generation ended unexpectedly".to_string(),
        )))
    }

    fn emit_pieces(&mut self, chunks: &mut Vec<StreamChunk>, pieces: Vec<ParsedPiece>) {
        for piece in pieces {
            let kind = match piece {
                ParsedPiece::Content(text) => ChunkKind::Content(text),
                ParsedPiece::Call(call) => ChunkKind::ToolCall(call),
            };
            self.emit(chunks, kind);
        }
    }

    fn emit(&mut self, chunks: &mut Vec<StreamChunk>, kind: ChunkKind) {
        chunks.push(StreamChunk {
            seq: self.next_seq,
            kind,
        });
        self.next_seq += 1;
    }
}

/// Identity of one completion, shared by every chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMeta {
    pub id: String,
    pub model: String,
    pub created: i64,
}

/// The aggregated (non-streaming) result.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutput {
    pub meta: CompletionMeta,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Live completion. Dropping it cancels generation.
pub struct CompletionStream {
    meta: CompletionMeta,
    events: mpsc::Receiver<GenerationEvent>,
    mux: StreamMux,
    pending: VecDeque<StreamChunk>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl CompletionStream {
    pub fn new(
        meta: CompletionMeta,
        events: mpsc::Receiver<GenerationEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            meta,
            events,
            mux: StreamMux::new(),
            pending: VecDeque::new(),
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        }
    }

    pub fn meta(&self) -> &CompletionMeta {
        &self.meta
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream into a single completion.
    pub async fn collect(mut self) -> EngineResult<CompletionOutput> {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        while let Some(chunk) = self.next().await {
            match chunk.kind {
                ChunkKind::Role(_) => {}
                ChunkKind::Content(text) => content.push_str(&text),
                ChunkKind::ToolCall(call) => tool_calls.push(call),
                ChunkKind::Finish { reason, usage } => {
                    return Ok(CompletionOutput {
                        meta: self.meta.clone(),
                        content,
                        tool_calls,
                        finish_reason: reason,
                        usage,
                    });
                }
                ChunkKind::Error(err) => return Err(err),
            }
        }
        Err(EngineError::Generation(
            "stream ended without a finish chunk".to_string(),
        ))
    }
}

impl Stream for CompletionStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(chunk) = this.pending.pop_front() {
                return Poll::Ready(Some(chunk));
            }
            if this.mux.is_done() {
                return Poll::Ready(None);
            }
            match this.events.poll_recv(cx) {
                Poll::Ready(Some(event)) => this.pending.extend(this.mux.handle(event)),
                Poll::Ready(None) => this.pending.extend(this.mux.interrupted()),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
