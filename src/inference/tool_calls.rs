// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Incremental extraction of `<tool_call>{json}</tool_call>` blocks from
//! generated text.
//!
//! The parser tracks one call at a time. A call is only surfaced once its
//! closing tag has been seen; text that could be the start of an opening tag
//! is withheld from content until it is disambiguated.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";
pub const PARSE_ERROR_TOOL: &str = "__llm_tool_parse_error__";

const SNIPPET_CHARS: usize = 200;

/// A completed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

impl ToolCall {
    pub fn is_parse_error(&self) -> bool {
        self.name == PARSE_ERROR_TOOL
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPiece {
    Content(String),
    Call(ToolCall),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CallState {
    Outside,
    /// Inside an open tag; the payload so far
    Partial(String),
}

#[derive(Debug)]
pub struct ToolCallParser {
    state: CallState,
    /// Outside text that may be the start of the opening tag
    held: String,
    next_index: usize,
}

impl Default for ToolCallParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParser {
    pub fn new() -> Self {
        Self {
            state: CallState::Outside,
            held: String::new(),
            next_index: 0,
        }
    }

    pub fn calls_emitted(&self) -> usize {
        self.next_index
    }

    pub fn in_call(&self) -> bool {
        matches!(self.state, CallState::Partial(_))
    }

    pub fn push(&mut self, text: &str) -> Vec<ParsedPiece> {
        let mut pieces = Vec::new();
        let mut input = std::mem::take(&mut self.held);
        input.push_str(text);

        loop {
            match &mut self.state {
                CallState::Outside => match input.find(TOOL_CALL_OPEN) {
                    Some(at) => {
                        push_content(&mut pieces, &input[..at]);
                        input.drain(..at + TOOL_CALL_OPEN.len());
                        self.state = CallState::Partial(String::new());
                    }
                    None => {
                        let hold_from = partial_tag_start(&input, TOOL_CALL_OPEN);
                        push_content(&mut pieces, &input[..hold_from]);
                        self.held = input[hold_from..].to_string();
                        break;
                    }
                },
                CallState::Partial(payload) => {
                    payload.push_str(&input);
                    input.clear();
                    match payload.find(TOOL_CALL_CLOSE) {
                        Some(at) => {
                            let body = payload[..at].to_string();
                            input = payload[at + TOOL_CALL_CLOSE.len()..].to_string();
                            self.state = CallState::Outside;
                            let call = self.build_call(&body);
                            pieces.push(ParsedPiece::Call(call));
                        }
                        None => break,
                    }
                }
            }
        }
        pieces
    }

    /// End of text. Withheld tag fragments outside a call are released as
    /// content; an unclosed call is discarded.
    pub fn finish(&mut self) -> Vec<ParsedPiece> {
        let mut pieces = Vec::new();
        let held = std::mem::take(&mut self.held);
        push_content(&mut pieces, &held);

        if let CallState::Partial(payload) = std::mem::replace(&mut self.state, CallState::Outside)
        {
            warn!(
                "Dropping unterminated tool call: '{}'",
                snippet(&payload)
            );
        }
        pieces
    }

    fn build_call(&mut self, body: &str) -> ToolCall {
        let index = self.next_index;
        self.next_index += 1;

        match parse_call_body(body) {
            Ok((name, arguments)) => {
                debug!("Parsed tool call {} ({})", index, name);
                ToolCall {
                    index,
                    id: format!("call_{}_{}", name, index),
                    name,
                    arguments,
                }
            }
            Err(message) => {
                warn!("Failed to parse tool call {}: {}", index, message);
                ToolCall {
                    index,
                    id: format!("llm_parse_err_{}", index),
                    name: PARSE_ERROR_TOOL.to_string(),
                    arguments: json!({
                        "error_type": "ValueError",
                        "error_message": message,
                        "original_content_snippet": snippet(body),
                    })
                    .to_string(),
                }
            }
        }
    }
}

/// Parse a whole text in one go; used for non-incremental callers.
pub fn extract_tool_calls(text: &str) -> (String, Vec<ToolCall>) {
    let mut parser = ToolCallParser::new();
    let mut pieces = parser.push(text);
    pieces.extend(parser.finish());

    let mut content = String::new();
    let mut calls = Vec::new();
    for piece in pieces {
        match piece {
            ParsedPiece::Content(text) => content.push_str(&text),
            ParsedPiece::Call(call) => calls.push(call),
        }
    }
    (content, calls)
}

fn push_content(pieces: &mut Vec<ParsedPiece>, text: &str) {
    if !text.is_empty() {
        pieces.push(ParsedPiece::Content(text.to_string()));
    }
}

// Index of the longest suffix of `text` that is a proper prefix of `tag`
fn partial_tag_start(text: &str, tag: &str) -> usize {
    text.char_indices()
        .map(|(i, _)| i)
        .find(|&i| tag.starts_with(&text[i..]))
        .unwrap_or(text.len())
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

/// Strip markdown fences, balance braces and unwrap `{{ ... }}`.
pub fn normalize_call_json(raw: &str) -> String {
    let mut text = raw.trim();
    for fence in ["```json", "```JSON", "```"] {
        if let Some(rest) = text.strip_prefix(fence) {
            text = rest.trim_start();
            break;
        }
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end();
    }
    let mut text = text.to_string();

    let open = text.matches('{').count();
    let close = text.matches('}').count();
    if open > close {
        text.push_str(&"}".repeat(open - close));
    } else if close > open && text.ends_with('}') {
        for _ in 0..(close - open) {
            if text.ends_with('}') {
                text.pop();
            }
        }
    }

    if text.starts_with("{{") && text.ends_with("}}") {
        let inner = &text[1..text.len() - 1];
        if parse_lenient(inner).is_ok() {
            return inner.to_string();
        }
    }
    text
}

/// Strict JSON first, then JSON5 for the single quotes, trailing commas and
/// bare keys small models tend to emit.
fn parse_lenient(text: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Ok(value),
        Err(strict) => json5::from_str::<Value>(text).map_err(|_| strict.to_string()),
    }
}

fn parse_call_body(body: &str) -> Result<(String, String), String> {
    let normalized = normalize_call_json(body);
    let value = parse_lenient(&normalized)?;
    let object = value
        .as_object()
        .ok_or_else(|| "tool call payload is not a JSON object".to_string())?;
    let name = object
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "tool call payload has no 'name'".to_string())?;

    let arguments = match object.get("arguments").or_else(|| object.get("parameters")) {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Map::new()),
        Some(Value::String(s)) => match parse_lenient(s) {
            Ok(v @ Value::Object(_)) => v,
            _ => return Err(format!("arguments for '{}' are not a JSON object", name)),
        },
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return Err(format!("arguments for '{}' are not a JSON object", name)),
    };

    Ok((name.to_string(), arguments.to_string()))
}
