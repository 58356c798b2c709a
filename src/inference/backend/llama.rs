// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::{
    BackendLoader, BackendMetadata, BackendSession, EngineState, ExecutionBackend, LoadOptions,
    SamplingParams, TokenId,
};
use crate::inference::error::{EngineError, EngineResult};
use llama_cpp_2::{
    context::{params::LlamaContextParams, LlamaContext},
    llama_backend::LlamaBackend as LlamaRuntime,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
    token::LlamaToken,
};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

const DEFAULT_CONTEXT_SIZE: u32 = 4096;
const DEFAULT_BATCH_SIZE: u32 = 512;

static RUNTIME: OnceLock<Result<LlamaRuntime, String>> = OnceLock::new();

// llama.cpp may only be initialised once per process
fn runtime() -> EngineResult<&'static LlamaRuntime> {
    RUNTIME
        .get_or_init(|| LlamaRuntime::init().map_err(|e| format!("{:?}", e)))
        .as_ref()
        .map_err(|e| EngineError::Generation(format!("Failed to initialize backend: {}", e)))
}

/// Sanitize prompt text for tokenization
///
/// Removes characters that cause issues with C string handling in llama.cpp:
/// - Null bytes (\0) - C strings use null as terminator
/// - Other C0 control characters except tab, newline and carriage return
fn sanitize_prompt_for_tokenizer(prompt: &str) -> String {
    prompt
        .chars()
        .filter(|c| *c != '\0' && (*c >= ' ' || *c == '\t' || *c == '\n' || *c == '\r'))
        .collect()
}

#[derive(Default)]
pub struct LlamaLoader;

impl LlamaLoader {
    pub fn new() -> Self {
        Self
    }
}

impl BackendLoader for LlamaLoader {
    fn load(&self, path: &Path, options: &LoadOptions) -> EngineResult<Box<dyn ExecutionBackend>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let runtime = runtime()?;

        let gpu_layers = options.n_gpu_layers.unwrap_or(0);
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

        tracing::info!(model = %name, gpu_layers, "Loading GGUF model");
        let model = LlamaModel::load_from_file(runtime, path, &model_params)
            .map_err(|e| EngineError::load(&name, format!("{:?}", e)))?;

        let context_size = options.n_ctx.unwrap_or(DEFAULT_CONTEXT_SIZE);
        let train_context = model.n_ctx_train();
        if context_size > train_context {
            tracing::warn!(
                "Requested n_ctx {} exceeds the model's training context {}",
                context_size,
                train_context
            );
        }

        let backend = LlamaBackend {
            name,
            model,
            context_size,
            batch_size: options.n_batch.unwrap_or(DEFAULT_BATCH_SIZE),
            threads: options.n_threads,
        };

        // Creating one context up front surfaces out-of-memory configurations
        // as load failures instead of failing the first request.
        let trial = backend
            .model
            .new_context(runtime, backend.context_params())
            .map_err(|e| EngineError::load(&backend.name, format!("{:?}", e)))?;
        drop(trial);

        Ok(Box::new(backend))
    }
}

pub struct LlamaBackend {
    name: String,
    model: LlamaModel,
    context_size: u32,
    batch_size: u32,
    threads: Option<u32>,
}

impl LlamaBackend {
    fn context_params(&self) -> LlamaContextParams {
        let mut params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.context_size))
            .with_n_batch(self.batch_size);
        if let Some(threads) = self.threads {
            params = params
                .with_n_threads(threads as i32)
                .with_n_threads_batch(threads as i32);
        }
        params
    }

    fn signature(&self) -> String {
        format!("llama.cpp/{}/n_ctx={}", self.name, self.context_size)
    }

    fn special_text(&self, token: LlamaToken) -> String {
        self.model
            .token_to_bytes(token, Special::Tokenize)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl ExecutionBackend for LlamaBackend {
    fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            context_size: self.context_size as usize,
            signature: self.signature(),
            chat_template: self
                .model
                .chat_template(None)
                .ok()
                .and_then(|t| t.to_str().ok().map(str::to_string)),
            bos_token: self.special_text(self.model.token_bos()),
            eos_token: self.special_text(self.model.token_eos()),
        }
    }

    fn tokenize(&self, text: &str) -> EngineResult<Vec<TokenId>> {
        let sanitized = sanitize_prompt_for_tokenizer(text);
        if sanitized.len() != text.len() {
            tracing::warn!(
                "Sanitized prompt: removed {} problematic bytes",
                text.len() - sanitized.len()
            );
        }

        // Templates that already emit the BOS text must not get a second one
        let bos = self.special_text(self.model.token_bos());
        let add_bos = if !bos.is_empty() && sanitized.starts_with(&bos) {
            AddBos::Never
        } else {
            AddBos::Always
        };

        let tokens = self
            .model
            .str_to_token(&sanitized, add_bos)
            .map_err(|e| EngineError::Generation(format!("Failed to tokenize: {:?}", e)))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn open_session<'a>(
        &'a mut self,
        params: &SamplingParams,
    ) -> EngineResult<Box<dyn BackendSession + 'a>> {
        let ctx = self
            .model
            .new_context(runtime()?, self.context_params())
            .map_err(|e| EngineError::Generation(format!("Failed to create context: {:?}", e)))?;

        Ok(Box::new(LlamaSession {
            model: &self.model,
            ctx,
            sampler: build_sampler(params),
            tokens: Vec::new(),
            batch_size: self.batch_size as usize,
            context_size: self.context_size as usize,
            signature: self.signature(),
        }))
    }
}

fn build_sampler(params: &SamplingParams) -> LlamaSampler {
    if params.temperature <= 0.0 {
        return LlamaSampler::greedy();
    }
    LlamaSampler::chain_simple([
        LlamaSampler::penalties(64, params.repeat_penalty, 0.0, 0.0),
        LlamaSampler::top_k(params.top_k),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(params.seed),
    ])
}

struct LlamaSession<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    sampler: LlamaSampler,
    tokens: Vec<TokenId>,
    batch_size: usize,
    context_size: usize,
    signature: String,
}

impl BackendSession for LlamaSession<'_> {
    fn reset(&mut self) -> EngineResult<()> {
        self.ctx.clear_kv_cache();
        self.tokens.clear();
        Ok(())
    }

    fn restore(&mut self, state: &EngineState, keep: usize) -> EngineResult<()> {
        if state.signature != self.signature {
            return Err(EngineError::Generation(format!(
                "state signature '{}' does not match '{}'",
                state.signature, self.signature
            )));
        }
        // SAFETY: the blob was produced by copy_state_data on a context with
        // the same model and n_ctx, which the signature check guarantees.
        let read = unsafe { self.ctx.set_state_data(&state.blob) };
        if read == 0 {
            return Err(EngineError::Generation("Failed to restore state".to_string()));
        }

        let keep = keep.min(state.tokens.len());
        self.ctx
            .clear_kv_cache_seq(Some(0), Some(keep as u32), None)
            .map_err(|e| EngineError::Generation(format!("Failed to trim KV cache: {:?}", e)))?;
        self.tokens = state.tokens[..keep].to_vec();
        Ok(())
    }

    fn ingest(&mut self, tokens: &[TokenId]) -> EngineResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        if self.tokens.len() + tokens.len() > self.context_size {
            return Err(EngineError::context_overflow(
                self.tokens.len() + tokens.len(),
                self.context_size,
            ));
        }

        let total = tokens.len();
        let mut offset = 0;
        for chunk in tokens.chunks(self.batch_size) {
            let mut batch = LlamaBatch::new(self.batch_size, 1);
            for (i, &token) in chunk.iter().enumerate() {
                let is_last = offset + i == total - 1;
                let pos = (self.tokens.len() + i) as i32;
                batch
                    .add(LlamaToken(token), pos, &[0], is_last)
                    .map_err(|e| {
                        EngineError::Generation(format!("Failed to add token to batch: {:?}", e))
                    })?;
            }
            self.ctx
                .decode(&mut batch)
                .map_err(|e| EngineError::Generation(format!("Decode failed: {:?}", e)))?;
            self.tokens.extend_from_slice(chunk);
            offset += chunk.len();
        }
        Ok(())
    }

    fn sample(&mut self) -> EngineResult<TokenId> {
        let token = self.sampler.sample(&self.ctx, -1);
        self.sampler.accept(token);
        Ok(token.0)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_bytes(&self, token: TokenId) -> EngineResult<Vec<u8>> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| EngineError::Generation(format!("Failed to detokenize: {:?}", e)))
    }

    fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    fn snapshot(&self) -> EngineResult<EngineState> {
        let size = self.ctx.get_state_size();
        let mut blob = vec![0u8; size];
        // SAFETY: blob has exactly get_state_size() bytes of capacity
        let written = unsafe { self.ctx.copy_state_data(blob.as_mut_ptr()) };
        blob.truncate(written);
        Ok(EngineState {
            tokens: self.tokens.clone(),
            blob,
            signature: self.signature.clone(),
        })
    }
}
