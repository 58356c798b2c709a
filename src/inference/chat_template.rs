// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chat template system for model-specific prompt formatting
//!
//! A prompt is rendered either by one of the built-in formats or by a Jinja
//! template (usually the one embedded in the GGUF file). [`resolve`] picks the
//! template for a request.

use super::error::{EngineError, EngineResult};
use super::request::ChatMessage;
use super::tool_calls::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN};
use minijinja::{context, Environment, Error as JinjaError, ErrorKind as JinjaErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const HARMONY_DEFAULT_SYSTEM: &str = "<|start|>system<|message|>You are a helpful AI assistant.\n\nReasoning: medium\n\n# Valid channels: analysis, commentary, final.<|end|>\n";

/// Supported chat template formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// Default format: "User: ...\nAssistant: ..."
    Default,
    /// Llama2 format: "[INST] ... [/INST]"
    Llama2,
    /// Vicuna format: "USER: ...\nASSISTANT: ..."
    Vicuna,
    /// Harmony format: "<|start|>user<|message|>...<|end|>"
    Harmony,
    /// ChatML format: "<|im_start|>user\n...<|im_end|>"
    ChatML,
}

impl ChatTemplate {
    /// Parse template name from string
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "default" => Some(Self::Default),
            "llama2" | "llama-2" => Some(Self::Llama2),
            "vicuna" => Some(Self::Vicuna),
            "harmony" | "gpt-oss" => Some(Self::Harmony),
            "chatml" | "chat-ml" => Some(Self::ChatML),
            _ => None,
        }
    }

    /// Get template name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Llama2 => "llama2",
            Self::Vicuna => "vicuna",
            Self::Harmony => "harmony",
            Self::ChatML => "chatml",
        }
    }

    /// Render a conversation, advertising `tools` in the system prompt.
    pub fn render(&self, messages: &[ChatMessage], tools: &[Value]) -> String {
        let turns = flatten_turns(messages, tools);
        self.format_messages(&turns)
    }

    /// Format `(role, content)` turns using this template
    pub fn format_messages(&self, messages: &[(String, String)]) -> String {
        match self {
            Self::Default => self.format_default(messages),
            Self::Llama2 => self.format_llama2(messages),
            Self::Vicuna => self.format_vicuna(messages),
            Self::Harmony => self.format_harmony(messages),
            Self::ChatML => self.format_chatml(messages),
        }
    }

    fn format_default(&self, messages: &[(String, String)]) -> String {
        let mut prompt = String::new();

        for (role, content) in messages {
            match role.as_str() {
                "system" => prompt.push_str(&format!("System: {}\n\n", content)),
                "user" => prompt.push_str(&format!("User: {}\n", content)),
                "assistant" => prompt.push_str(&format!("Assistant: {}\n", content)),
                _ => {}
            }
        }

        prompt.push_str("Assistant: ");
        prompt
    }

    fn format_llama2(&self, messages: &[(String, String)]) -> String {
        let mut prompt = String::new();
        let system_prompt = messages
            .iter()
            .find(|(role, _)| role == "system")
            .map(|(_, content)| content.as_str())
            .unwrap_or("");

        let mut first_user = true;
        for (role, content) in messages {
            match role.as_str() {
                "user" => {
                    if first_user && !system_prompt.is_empty() {
                        prompt.push_str(&format!(
                            "[INST] <<SYS>>\n{}\n<</SYS>>\n\n{} [/INST] ",
                            system_prompt, content
                        ));
                    } else {
                        prompt.push_str(&format!("[INST] {} [/INST] ", content));
                    }
                    first_user = false;
                }
                "assistant" => prompt.push_str(&format!("{} ", content)),
                _ => {}
            }
        }

        prompt
    }

    fn format_vicuna(&self, messages: &[(String, String)]) -> String {
        let mut prompt = String::new();

        for (role, content) in messages {
            match role.as_str() {
                "system" => prompt.push_str(&format!("SYSTEM: {}\n", content)),
                "user" => prompt.push_str(&format!("USER: {}\n", content)),
                "assistant" => prompt.push_str(&format!("ASSISTANT: {}\n", content)),
                _ => {}
            }
        }

        prompt.push_str("ASSISTANT: ");
        prompt
    }

    /// See https://cookbook.openai.com/articles/openai-harmony
    fn format_harmony(&self, messages: &[(String, String)]) -> String {
        let mut prompt = String::new();

        // Rendering stays a pure function of the turns so cached prefixes match
        if !messages.iter().any(|(role, _)| role == "system") {
            prompt.push_str(HARMONY_DEFAULT_SYSTEM);
        }

        for (role, content) in messages {
            match role.as_str() {
                "system" | "user" => {
                    prompt.push_str(&format!("<|start|>{}<|message|>{}<|end|>\n", role, content))
                }
                "assistant" => prompt.push_str(&format!(
                    "<|start|>assistant<|channel|>final<|message|>{}<|end|>\n",
                    content
                )),
                _ => {}
            }
        }

        prompt.push_str("<|start|>assistant<|channel|>final<|message|>");
        prompt
    }

    fn format_chatml(&self, messages: &[(String, String)]) -> String {
        let mut prompt = String::new();

        for (role, content) in messages {
            if matches!(role.as_str(), "system" | "user" | "assistant") {
                prompt.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", role, content));
            }
        }

        prompt.push_str("<|im_start|>assistant\n");
        prompt
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::Default
    }
}

/// System prompt section describing the available tools.
pub fn tools_preamble(tools: &[Value]) -> String {
    let mut out = String::from(
        "# Tools\n\nYou may call one or more functions to assist with the user query.\n\nYou are provided with function signatures within <tools></tools> XML tags:\n<tools>\n",
    );
    for tool in tools {
        out.push_str(&tool.to_string());
        out.push('\n');
    }
    out.push_str(&format!(
        "</tools>\n\nFor each function call, return a json object with function name and arguments within {open}{close} XML tags:\n{open}\n{{\"name\": <function-name>, \"arguments\": <args-json-object>}}\n{close}",
        open = TOOL_CALL_OPEN,
        close = TOOL_CALL_CLOSE
    ));
    out
}

// Built-in formats only know system/user/assistant turns. Tool results become
// user turns and assistant tool calls are written back in the tag syntax the
// model is asked to produce.
fn flatten_turns(messages: &[ChatMessage], tools: &[Value]) -> Vec<(String, String)> {
    let mut turns: Vec<(String, String)> = Vec::with_capacity(messages.len() + 1);

    for message in messages {
        match message.role.as_str() {
            "tool" => turns.push((
                "user".to_string(),
                format!("<tool_response>\n{}\n</tool_response>", message.content),
            )),
            "assistant" if !message.tool_calls.is_empty() => {
                let mut content = message.content.clone();
                for call in &message.tool_calls {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    let payload = json!({
                        "name": call.function.name,
                        "arguments": arguments_value(&call.function.arguments),
                    });
                    content.push_str(&format!("{}\n{}\n{}", TOOL_CALL_OPEN, payload, TOOL_CALL_CLOSE));
                }
                turns.push(("assistant".to_string(), content));
            }
            role => turns.push((role.to_string(), message.content.clone())),
        }
    }

    if !tools.is_empty() {
        let preamble = tools_preamble(tools);
        match turns.iter_mut().find(|(role, _)| role == "system") {
            Some((_, content)) => {
                content.push_str("\n\n");
                content.push_str(&preamble);
            }
            None => turns.insert(0, ("system".to_string(), preamble)),
        }
    }
    turns
}

fn arguments_value(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

/// A template ready to render.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptTemplate {
    Builtin(ChatTemplate),
    Jinja(String),
}

/// Special tokens exposed to Jinja templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecialTokens {
    pub bos_token: String,
    pub eos_token: String,
}

impl PromptTemplate {
    /// A built-in template name, or Jinja source.
    pub fn parse(source: &str) -> EngineResult<Self> {
        if let Some(builtin) = ChatTemplate::from_name(source) {
            return Ok(Self::Builtin(builtin));
        }
        if looks_like_jinja(source) {
            return Ok(Self::Jinja(source.to_string()));
        }
        Err(EngineError::Template(format!(
            "unknown chat template '{}'",
            source
        )))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(t) => t.as_str(),
            Self::Jinja(_) => "jinja",
        }
    }

    /// Stable identity of what this template renders: the built-in name or
    /// a digest of the Jinja source.
    pub fn identity(&self) -> String {
        match self {
            Self::Builtin(t) => format!("builtin:{}", t.as_str()),
            Self::Jinja(source) => format!("jinja:{}", hex::encode(Sha256::digest(source.as_bytes()))),
        }
    }

    pub fn render(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        special: &SpecialTokens,
    ) -> EngineResult<String> {
        match self {
            Self::Builtin(template) => Ok(template.render(messages, tools)),
            Self::Jinja(source) => render_jinja(source, messages, tools, special),
        }
    }
}

fn looks_like_jinja(text: &str) -> bool {
    text.contains("{%") || text.contains("{{")
}

/// Pick the template for a request: request override, configured name,
/// model-embedded template, configured fallback.
pub fn resolve(
    request_override: Option<&str>,
    configured: Option<&str>,
    embedded: Option<&str>,
    fallback: Option<&str>,
) -> EngineResult<PromptTemplate> {
    if let Some(name) = request_override.filter(|s| !s.trim().is_empty()) {
        return PromptTemplate::parse(name);
    }
    if let Some(name) = configured.filter(|s| !s.trim().is_empty()) {
        return PromptTemplate::parse(name);
    }
    if let Some(source) = embedded.filter(|s| !s.trim().is_empty()) {
        return Ok(PromptTemplate::Jinja(source.to_string()));
    }
    if let Some(name) = fallback.filter(|s| !s.trim().is_empty()) {
        tracing::debug!("Model has no embedded chat template, using fallback");
        return PromptTemplate::parse(name);
    }
    Err(EngineError::Template(
        "model has no chat template and no fallback is configured".to_string(),
    ))
}

fn render_jinja(
    source: &str,
    messages: &[ChatMessage],
    tools: &[Value],
    special: &SpecialTokens,
) -> EngineResult<String> {
    let mut env = Environment::new();
    env.add_function("raise_exception", |message: String| -> Result<String, JinjaError> {
        Err(JinjaError::new(JinjaErrorKind::InvalidOperation, message))
    });
    let template = env
        .template_from_str(source)
        .map_err(|e| EngineError::Template(format!("invalid template: {}", e)))?;

    let messages: Vec<Value> = messages.iter().map(jinja_message).collect();
    let tools = if tools.is_empty() { None } else { Some(tools) };
    template
        .render(context! {
            messages => messages,
            tools => tools,
            add_generation_prompt => true,
            bos_token => special.bos_token,
            eos_token => special.eos_token,
        })
        .map_err(|e| EngineError::Template(format!("render failed: {}", e)))
}

// Templates index arguments as objects, so they are decoded here
fn jinja_message(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": message.role,
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": call.kind,
                    "function": {
                        "name": call.function.name,
                        "arguments": arguments_value(&call.function.arguments),
                    }
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}
