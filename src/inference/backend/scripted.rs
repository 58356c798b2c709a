// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Deterministic backend that replays a fixed reply.
//!
//! Tokens are single characters (`char as i32 + 1`, with `0` reserved for end
//! of generation). Engine state is the little-endian token list, so restored
//! state behaves exactly like re-ingesting the same prompt. Used by the test
//! suite and by builds without the `inference` feature.

use super::{
    BackendLoader, BackendMetadata, BackendSession, EngineState, ExecutionBackend, LoadOptions,
    SamplingParams, TokenId,
};
use crate::inference::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EOS_TOKEN: TokenId = 0;

/// ChatML rendered through the embedded-template path.
pub const SCRIPTED_CHAT_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

#[derive(Debug, Clone)]
pub struct ScriptedModelConfig {
    pub reply: String,
    pub context_size: usize,
    /// Largest `n_ctx` accepted at load time
    pub max_context_size: usize,
    pub chat_template: Option<String>,
    /// Fail with a generation error once this many tokens were sampled
    pub fail_after: Option<usize>,
    /// Sleep before each sampled token
    pub token_delay: Option<Duration>,
}

impl Default for ScriptedModelConfig {
    fn default() -> Self {
        Self {
            reply: "2+2 equals 4.".to_string(),
            context_size: 4096,
            max_context_size: 32768,
            chat_template: Some(SCRIPTED_CHAT_TEMPLATE.to_string()),
            fail_after: None,
            token_delay: None,
        }
    }
}

/// Counters shared by every backend a loader creates.
#[derive(Debug, Default)]
pub struct ScriptStats {
    pub loads: AtomicUsize,
    pub sessions: AtomicUsize,
    pub ingested_tokens: AtomicUsize,
    pub sampled_tokens: AtomicUsize,
    pub live_backends: AtomicUsize,
    pub max_live_backends: AtomicUsize,
}

impl ScriptStats {
    pub fn ingested(&self) -> usize {
        self.ingested_tokens.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live_backends.load(Ordering::SeqCst)
    }
}

pub struct ScriptedLoader {
    config: ScriptedModelConfig,
    replies: HashMap<String, String>,
    stats: Arc<ScriptStats>,
}

impl ScriptedLoader {
    pub fn new(config: ScriptedModelConfig) -> Self {
        Self {
            config,
            replies: HashMap::new(),
            stats: Arc::new(ScriptStats::default()),
        }
    }

    /// Use a different reply for one model file.
    pub fn with_reply_for(mut self, file_name: &str, reply: &str) -> Self {
        self.replies.insert(file_name.to_string(), reply.to_string());
        self
    }

    pub fn stats(&self) -> Arc<ScriptStats> {
        self.stats.clone()
    }
}

impl Default for ScriptedLoader {
    fn default() -> Self {
        Self::new(ScriptedModelConfig::default())
    }
}

impl BackendLoader for ScriptedLoader {
    fn load(&self, path: &Path, options: &LoadOptions) -> EngineResult<Box<dyn ExecutionBackend>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let mut magic = [0u8; 4];
        std::fs::File::open(path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .map_err(|e| EngineError::load(&name, format!("cannot read model file: {}", e)))?;
        if &magic != b"GGUF" {
            return Err(EngineError::load(&name, "invalid GGUF header"));
        }

        let context_size = options
            .n_ctx
            .map(|n| n as usize)
            .unwrap_or(self.config.context_size);
        if context_size > self.config.max_context_size {
            return Err(EngineError::load(
                &name,
                format!(
                    "context size {} exceeds available memory ({} tokens)",
                    context_size, self.config.max_context_size
                ),
            ));
        }

        let reply = self
            .replies
            .get(&name)
            .cloned()
            .unwrap_or_else(|| self.config.reply.clone());

        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        let live = self.stats.live_backends.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live_backends.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(ScriptedBackend {
            name,
            reply_tokens: encode(&reply),
            context_size,
            config: self.config.clone(),
            stats: self.stats.clone(),
        }))
    }
}

pub struct ScriptedBackend {
    name: String,
    reply_tokens: Vec<TokenId>,
    context_size: usize,
    config: ScriptedModelConfig,
    stats: Arc<ScriptStats>,
}

impl ScriptedBackend {
    fn signature(&self) -> String {
        format!("scripted/{}/n_ctx={}", self.name, self.context_size)
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.stats.live_backends.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExecutionBackend for ScriptedBackend {
    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            context_size: self.context_size,
            signature: self.signature(),
            chat_template: self.config.chat_template.clone(),
            bos_token: String::new(),
            eos_token: "<|im_end|>".to_string(),
        }
    }

    fn tokenize(&self, text: &str) -> EngineResult<Vec<TokenId>> {
        Ok(encode(text))
    }

    fn open_session<'a>(
        &'a mut self,
        _params: &SamplingParams,
    ) -> EngineResult<Box<dyn BackendSession + 'a>> {
        self.stats.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            backend: self,
            tokens: Vec::new(),
            cursor: 0,
        }))
    }
}

struct ScriptedSession<'a> {
    backend: &'a ScriptedBackend,
    tokens: Vec<TokenId>,
    cursor: usize,
}

impl BackendSession for ScriptedSession<'_> {
    fn reset(&mut self) -> EngineResult<()> {
        self.tokens.clear();
        self.cursor = 0;
        Ok(())
    }

    fn restore(&mut self, state: &EngineState, keep: usize) -> EngineResult<()> {
        if state.signature != self.backend.signature() {
            return Err(EngineError::Generation(format!(
                "state signature '{}' does not match '{}'",
                state.signature,
                self.backend.signature()
            )));
        }
        let decoded: Vec<TokenId> = state
            .blob
            .chunks_exact(4)
            .map(|b| TokenId::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if decoded != state.tokens {
            return Err(EngineError::Generation(
                "state blob does not match its token list".to_string(),
            ));
        }
        self.tokens = decoded;
        self.tokens.truncate(keep);
        self.cursor = 0;
        Ok(())
    }

    fn ingest(&mut self, tokens: &[TokenId]) -> EngineResult<()> {
        if self.tokens.len() + tokens.len() > self.backend.context_size {
            return Err(EngineError::context_overflow(
                self.tokens.len() + tokens.len(),
                self.backend.context_size,
            ));
        }
        self.tokens.extend_from_slice(tokens);
        self.backend
            .stats
            .ingested_tokens
            .fetch_add(tokens.len(), Ordering::SeqCst);
        Ok(())
    }

    fn sample(&mut self) -> EngineResult<TokenId> {
        if let Some(delay) = self.backend.config.token_delay {
            std::thread::sleep(delay);
        }
        if let Some(limit) = self.backend.config.fail_after {
            if self.cursor >= limit {
                return Err(EngineError::Generation(format!(
                    "scripted failure after {} tokens",
                    limit
                )));
            }
        }
        self.backend.stats.sampled_tokens.fetch_add(1, Ordering::SeqCst);
        match self.backend.reply_tokens.get(self.cursor) {
            Some(&token) => {
                self.cursor += 1;
                Ok(token)
            }
            None => Ok(EOS_TOKEN),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS_TOKEN
    }

    fn token_bytes(&self, token: TokenId) -> EngineResult<Vec<u8>> {
        let c = char::from_u32((token - 1) as u32)
            .ok_or_else(|| EngineError::Generation(format!("unknown token {}", token)))?;
        Ok(c.to_string().into_bytes())
    }

    fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    fn snapshot(&self) -> EngineResult<EngineState> {
        Ok(EngineState {
            tokens: self.tokens.clone(),
            blob: self.tokens.iter().flat_map(|t| t.to_le_bytes()).collect(),
            signature: self.backend.signature(),
        })
    }
}

fn encode(text: &str) -> Vec<TokenId> {
    text.chars().map(|c| c as TokenId + 1).collect()
}
