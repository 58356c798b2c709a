// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use crate::inference::{
    CacheStats, ChatMessage, CompletionOutput, GenerationRequest, InferenceConfig, LoadOptions,
    ToolCall, Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /chat/completions` and `POST /restore_cache`.
///
/// OpenAI-style top-level sampling fields are accepted too; values in
/// `inference_configs` take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_configs: Option<InferenceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_model_configs: Option<LoadOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
}

impl ChatCompletionRequest {
    pub fn into_generation(self) -> GenerationRequest {
        let mut config = self.inference_configs.unwrap_or_default();
        config.max_tokens = config.max_tokens.or(self.max_tokens);
        config.temperature = config.temperature.or(self.temperature);
        config.top_p = config.top_p.or(self.top_p);
        if config.stop.is_empty() {
            config.stop = match self.stop {
                Some(Value::String(s)) => vec![s],
                Some(Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
        }

        GenerationRequest {
            model: self.model,
            messages: self.messages,
            tools: self.tools.unwrap_or_default(),
            config,
            load_options: self.load_model_configs,
            stream: self.stream,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetModelRequest {
    pub model_name: String,
    #[serde(default)]
    pub load_model_configs: Option<LoadOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetModelResponse {
    pub status: String,
    pub message: String,
    pub model: String,
    pub context_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub model: Option<String>,
    pub busy: bool,
    pub queue_depth: usize,
    pub uptime_secs: u64,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreCacheResponse {
    pub status: String,
    pub key: String,
    pub prompt_tokens: usize,
    pub cached_tokens: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStatsResponse {
    pub enabled: bool,
    #[serde(flatten)]
    pub stats: CacheStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionBody {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionBody,
}

impl ToolCallBody {
    pub fn from_call(call: &ToolCall, with_index: bool) -> Self {
        Self {
            index: with_index.then_some(call.index),
            id: call.id.clone(),
            kind: "function".to_string(),
            function: FunctionBody {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptTokensDetails {
    pub cached_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageBody {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub prompt_tokens_details: PromptTokensDetails,
}

impl From<Usage> for UsageBody {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: usage.cached_tokens,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallBody>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

/// Non-streaming `chat.completion` object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: UsageBody,
}

impl From<CompletionOutput> for ChatCompletion {
    fn from(output: CompletionOutput) -> Self {
        let tool_calls: Vec<ToolCallBody> = output
            .tool_calls
            .iter()
            .map(|call| ToolCallBody::from_call(call, false))
            .collect();
        let content = if output.content.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(output.content)
        };

        Self {
            id: output.meta.id,
            object: "chat.completion".to_string(),
            created: output.meta.created,
            model: output.meta.model,
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: output.finish_reason.as_str().to_string(),
            }],
            usage: output.usage.into(),
        }
    }
}
