// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Chat request execution.
//!
//! A request moves through
//! `Rendering -> CacheLookup -> CacheHit | CacheMiss -> Generating -> Completing -> Done`,
//! with `Failed` reachable from every state. Rendering and the cache lookup
//! run before the model gate is taken; everything that touches the backend
//! runs on a blocking thread that owns the gate guard until it returns.

use super::backend::{BackendSession, EngineState, SamplingParams, TokenId};
use super::cache::{key_for, CacheEntry, CacheKey, PromptCache, PromptConfig};
use super::chat_template::{resolve, SpecialTokens};
use super::decode::{StopMatcher, Utf8Assembler};
use super::error::{EngineError, EngineResult};
use super::models::{ModelInfo, ModelRegistry};
use super::request::{GenerationRequest, DEFAULT_MAX_TOKENS};
use super::serializer::{GateGuard, GatePurpose};
use super::stream::{
    CompletionMeta, CompletionOutput, CompletionStream, GenerationEvent, GenerationSummary,
    StopCause, Usage,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_STREAM_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Template name or Jinja source used instead of the model's own
    pub chat_template: Option<String>,
    /// Used when the model carries no template
    pub fallback_template: Option<String>,
    pub default_max_tokens: usize,
    pub sampling: SamplingParams,
    /// Load the requested model when it differs from the resident one
    pub allow_implicit_load: bool,
    pub stream_buffer: usize,
    pub request_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chat_template: None,
            fallback_template: None,
            default_max_tokens: DEFAULT_MAX_TOKENS,
            sampling: SamplingParams::default(),
            allow_implicit_load: true,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            request_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Rendering,
    CacheLookup,
    CacheHit,
    CacheMiss,
    Generating,
    Completing,
    Done,
    Failed,
}

struct Transitions {
    request_id: String,
    state: PipelineState,
    started: Instant,
}

impl Transitions {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            state: PipelineState::Rendering,
            started: Instant::now(),
        }
    }

    fn to(&mut self, next: PipelineState) {
        debug!(
            request_id = %self.request_id,
            from = ?self.state,
            to = ?next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Pipeline transition"
        );
        self.state = next;
    }
}

/// Rendered prompt plus whatever the cache offered for it.
struct PreparedPrompt {
    info: ModelInfo,
    prompt: String,
    /// Key of the whole conversation; `None` when caching is off
    key: Option<CacheKey>,
    candidate: Option<CacheEntry>,
}

/// Outcome of `/restore_cache`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrewarmReport {
    pub key: CacheKey,
    pub prompt_tokens: usize,
    pub cached_tokens: usize,
}

struct ProducerJob {
    prompt: String,
    context_size: usize,
    candidate: Option<CacheEntry>,
    sampling: SamplingParams,
    max_tokens: usize,
    stop: Vec<String>,
    snapshot: bool,
}

struct ProducerOutcome {
    summary: GenerationSummary,
    state: Option<EngineState>,
}

pub struct ChatPipeline {
    registry: Arc<ModelRegistry>,
    cache: Option<Arc<PromptCache>>,
    config: PipelineConfig,
}

impl ChatPipeline {
    pub fn new(
        registry: Arc<ModelRegistry>,
        cache: Option<Arc<PromptCache>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<PromptCache>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start generating. Chunks arrive through the returned stream; dropping
    /// it cancels the request.
    pub async fn generate(&self, request: GenerationRequest) -> EngineResult<CompletionStream> {
        request.validate()?;
        let request_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let mut tracker = Transitions::new(&request_id);

        let (guard, prepared) = match self
            .acquire_prepared(&request, GatePurpose::Generate, &mut tracker)
            .await
        {
            Ok(ready) => ready,
            Err(e) => {
                tracker.to(PipelineState::Failed);
                return Err(e);
            }
        };

        let meta = CompletionMeta {
            id: request_id.clone(),
            model: prepared.info.id.clone(),
            created: chrono::Utc::now().timestamp(),
        };
        let job = ProducerJob {
            prompt: prepared.prompt,
            context_size: prepared.info.context_size,
            candidate: prepared.candidate,
            sampling: request.config.sampling(&self.config.sampling),
            max_tokens: request
                .config
                .max_tokens
                .unwrap_or(self.config.default_max_tokens),
            stop: request.config.stop_sequences(),
            snapshot: prepared.key.is_some(),
        };
        let hit_key = job.candidate.as_ref().map(|e| e.key);
        let hit_tokens = job.candidate.as_ref().map(|e| e.state.tokens.clone());

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let cancel = CancellationToken::new();
        if let Some(timeout) = self.config.request_timeout {
            spawn_timeout(request_id.clone(), timeout, cancel.clone());
        }

        let producer_tx = tx.clone();
        let producer_cancel = cancel.clone();
        let handle = Handle::current();
        let producer = tokio::task::spawn_blocking(move || {
            run_producer(guard, job, tracker, &producer_tx, &producer_cancel, &handle)
        });

        let cache = self.cache.clone();
        let store_key = prepared.key;
        tokio::spawn(async move {
            let (mut tracker, result) = match producer.await {
                Ok(done) => done,
                Err(e) => {
                    warn!("Producer task for {} panicked: {}", request_id, e);
                    let _ = tx
                        .send(GenerationEvent::Failed(EngineError::Generation(
                            "generation task panicked".to_string(),
                        )))
                        .await;
                    return;
                }
            };

            match result {
                Ok(outcome) => {
                    if let (Some(cache), Some(key), Some(state)) =
                        (cache, store_key, outcome.state)
                    {
                        let unchanged =
                            hit_key == Some(key) && hit_tokens.as_deref() == Some(&state.tokens[..]);
                        if !unchanged {
                            if let Err(e) = cache.store(&key, &state).await {
                                warn!("Failed to store prompt cache entry {}: {}", key, e);
                            }
                        }
                    }
                    tracker.to(PipelineState::Done);
                    let _ = tx.send(GenerationEvent::Finished(outcome.summary)).await;
                }
                Err(e) => {
                    tracker.to(PipelineState::Failed);
                    if e == EngineError::Cancelled {
                        info!("Request {} cancelled", request_id);
                    } else {
                        warn!("Request {} failed: {}", request_id, e);
                    }
                    let _ = tx.send(GenerationEvent::Failed(e)).await;
                }
            }
        });

        Ok(CompletionStream::new(meta, rx, cancel))
    }

    /// Generate and aggregate into one completion.
    pub async fn complete(&self, request: GenerationRequest) -> EngineResult<CompletionOutput> {
        self.generate(request).await?.collect().await
    }

    /// Process the conversation's prompt and store the resulting state
    /// without sampling anything.
    pub async fn prewarm(&self, request: GenerationRequest) -> EngineResult<PrewarmReport> {
        request.validate()?;
        let cache = self
            .cache
            .clone()
            .ok_or_else(|| EngineError::InvalidRequest("prompt cache is disabled".to_string()))?;
        let request_id = format!("prewarm-{}", uuid::Uuid::new_v4().simple());
        let mut tracker = Transitions::new(&request_id);

        let (mut guard, prepared) = match self
            .acquire_prepared(&request, GatePurpose::Prewarm, &mut tracker)
            .await
        {
            Ok(ready) => ready,
            Err(e) => {
                tracker.to(PipelineState::Failed);
                return Err(e);
            }
        };
        let key = prepared
            .key
            .ok_or_else(|| EngineError::InvalidRequest("prompt cache is disabled".to_string()))?;
        let prompt = prepared.prompt;
        let context_size = prepared.info.context_size;
        let candidate = prepared.candidate;
        let sampling = request.config.sampling(&self.config.sampling);

        let primed = tokio::task::spawn_blocking(move || {
            let result = prewarm_locked(
                &mut guard,
                &prompt,
                context_size,
                candidate.as_ref(),
                &sampling,
                &mut tracker,
            );
            if result.is_err() {
                tracker.to(PipelineState::Failed);
            }
            result
        })
        .await
        .map_err(|e| EngineError::Generation(format!("prewarm task failed: {}", e)))??;

        let (prompt_tokens, cached_tokens, state) = primed;
        cache.store(&key, &state).await?;
        info!(
            "Prewarmed {} ({} prompt tokens, {} from cache)",
            key, prompt_tokens, cached_tokens
        );
        Ok(PrewarmReport {
            key,
            prompt_tokens,
            cached_tokens,
        })
    }

    /// Take the gate with the right model resident and the prompt rendered.
    async fn acquire_prepared(
        &self,
        request: &GenerationRequest,
        purpose: GatePurpose,
        tracker: &mut Transitions,
    ) -> EngineResult<(GateGuard, PreparedPrompt)> {
        let requested = requested_model(request);

        // Render and look up before queueing when the active model already fits
        let early = match self.registry.active().await {
            Some(info) if requested.map_or(true, |id| id == info.id) => {
                Some(self.prepare(request, info, tracker).await?)
            }
            _ => None,
        };

        let mut guard = self.registry.gate().acquire(purpose).await;
        let info = self.resident_for(request, &mut guard).await?;

        let mut prepared = match early {
            Some(p) if p.info.generation == info.generation => p,
            _ => {
                tracker.to(PipelineState::Rendering);
                self.prepare(request, info, tracker).await?
            }
        };
        // Only the lookup that is actually used counts towards the stats
        if let (Some(cache), Some(_)) = (&self.cache, prepared.key) {
            cache.record_lookup(prepared.candidate.as_mut()).await;
        }
        Ok((guard, prepared))
    }

    async fn resident_for(
        &self,
        request: &GenerationRequest,
        guard: &mut GateGuard,
    ) -> EngineResult<ModelInfo> {
        let resident = guard.info().cloned();
        match (requested_model(request), resident) {
            (None, Some(info)) => Ok(info),
            (None, None) => Err(EngineError::NoModelLoaded),
            (Some(requested), Some(info)) if requested == info.id => Ok(info),
            (Some(requested), resident) => {
                if !self.config.allow_implicit_load {
                    return Err(match resident {
                        Some(info) => EngineError::ModelMismatch {
                            requested: requested.to_string(),
                            loaded: info.id,
                        },
                        None => EngineError::NoModelLoaded,
                    });
                }
                info!("Loading model {} for incoming request", requested);
                let options = request.load_options.clone().unwrap_or_default();
                self.registry.load_locked(guard, requested, &options).await
            }
        }
    }

    async fn prepare(
        &self,
        request: &GenerationRequest,
        info: ModelInfo,
        tracker: &mut Transitions,
    ) -> EngineResult<PreparedPrompt> {
        let template = resolve(
            request.config.chat_template.as_deref(),
            self.config.chat_template.as_deref(),
            info.chat_template.as_deref(),
            self.config.fallback_template.as_deref(),
        )?;
        let special = SpecialTokens {
            bos_token: info.bos_token.clone(),
            eos_token: info.eos_token.clone(),
        };
        let prompt = template.render(&request.messages, &request.tools, &special)?;
        debug!(
            template = template.name(),
            prompt_chars = prompt.len(),
            "Rendered prompt"
        );

        let Some(cache) = &self.cache else {
            return Ok(PreparedPrompt {
                info,
                prompt,
                key: None,
                candidate: None,
            });
        };

        tracker.to(PipelineState::CacheLookup);
        let prompt_config = PromptConfig::for_template(&template);
        let identity = info.identity();
        let keys: Vec<CacheKey> = (1..=request.messages.len())
            .rev()
            .map(|k| key_for(&identity, &request.messages[..k], &request.tools, &prompt_config))
            .collect();
        let candidate = cache.find_first(&keys, &info.signature).await;
        if let Some(entry) = &candidate {
            debug!(
                "Prompt cache candidate {} with {} tokens",
                entry.key,
                entry.state.tokens.len()
            );
        }

        Ok(PreparedPrompt {
            info,
            prompt,
            key: keys.first().copied(),
            candidate,
        })
    }
}

fn requested_model(request: &GenerationRequest) -> Option<&str> {
    request.model.as_deref().filter(|m| !m.trim().is_empty())
}

fn spawn_timeout(request_id: String, timeout: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                warn!("Request {} exceeded {:?}, cancelling", request_id, timeout);
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    });
}

fn tokenize_prompt(tokens: Vec<TokenId>, context_size: usize) -> EngineResult<Vec<TokenId>> {
    if tokens.is_empty() {
        return Err(EngineError::Generation("prompt is empty".to_string()));
    }
    if tokens.len() > context_size {
        return Err(EngineError::context_overflow(tokens.len(), context_size));
    }
    Ok(tokens)
}

fn common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Bring the session to the state after `prompt`, reusing the cached prefix
/// when possible. Returns the number of tokens restored from the cache.
fn prime(
    session: &mut dyn BackendSession,
    prompt: &[TokenId],
    candidate: Option<&CacheEntry>,
    tracker: &mut Transitions,
) -> EngineResult<usize> {
    // At least one prompt token is always ingested so there are logits to
    // sample from
    let keep = candidate
        .map(|entry| common_prefix(&entry.state.tokens, prompt).min(prompt.len() - 1))
        .unwrap_or(0);

    let mut cached = 0;
    match candidate {
        Some(entry) if keep > 0 => {
            tracker.to(PipelineState::CacheHit);
            match session.restore(&entry.state, keep) {
                Ok(()) => cached = keep,
                Err(e) => {
                    warn!("Could not restore cached state {}: {}", entry.key, e);
                    tracker.to(PipelineState::CacheMiss);
                    session.reset()?;
                }
            }
        }
        _ => {
            tracker.to(PipelineState::CacheMiss);
            session.reset()?;
        }
    }

    session.ingest(&prompt[cached..])?;
    Ok(cached)
}

fn prewarm_locked(
    guard: &mut GateGuard,
    prompt: &str,
    context_size: usize,
    candidate: Option<&CacheEntry>,
    sampling: &SamplingParams,
    tracker: &mut Transitions,
) -> EngineResult<(usize, usize, EngineState)> {
    let resident = guard.resident_mut().ok_or(EngineError::NoModelLoaded)?;
    let backend = resident.backend.as_mut();
    let prompt_tokens = tokenize_prompt(backend.tokenize(prompt)?, context_size)?;
    let mut session = backend.open_session(sampling)?;
    let cached = prime(session.as_mut(), &prompt_tokens, candidate, tracker)?;
    tracker.to(PipelineState::Completing);
    let state = session.snapshot()?;
    tracker.to(PipelineState::Done);
    Ok((prompt_tokens.len(), cached, state))
}

fn run_producer(
    mut guard: GateGuard,
    job: ProducerJob,
    mut tracker: Transitions,
    tx: &mpsc::Sender<GenerationEvent>,
    cancel: &CancellationToken,
    handle: &Handle,
) -> (Transitions, EngineResult<ProducerOutcome>) {
    let result = produce(&mut guard, job, &mut tracker, tx, cancel, handle);
    drop(guard);
    (tracker, result)
}

fn produce(
    guard: &mut GateGuard,
    job: ProducerJob,
    tracker: &mut Transitions,
    tx: &mpsc::Sender<GenerationEvent>,
    cancel: &CancellationToken,
    handle: &Handle,
) -> EngineResult<ProducerOutcome> {
    let resident = guard.resident_mut().ok_or(EngineError::NoModelLoaded)?;
    let backend = resident.backend.as_mut();
    let prompt = tokenize_prompt(backend.tokenize(&job.prompt)?, job.context_size)?;
    let mut session = backend.open_session(&job.sampling)?;
    let cached = prime(session.as_mut(), &prompt, job.candidate.as_ref(), tracker)?;

    tracker.to(PipelineState::Generating);
    let send = |event: GenerationEvent| -> EngineResult<()> {
        handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                sent = tx.send(event) => sent.map_err(|_| EngineError::Cancelled),
            }
        })
    };

    let mut utf8 = Utf8Assembler::new();
    let mut stops = StopMatcher::new(job.stop);
    let mut completion = 0usize;

    let mut cause = loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if completion >= job.max_tokens {
            break StopCause::MaxTokens;
        }
        if session.tokens().len() >= job.context_size {
            break StopCause::ContextFull;
        }

        let token = session.sample()?;
        if session.is_end_of_generation(token) {
            break StopCause::EndOfGeneration;
        }
        completion += 1;
        session.ingest(&[token])?;

        let text = utf8.push(&session.token_bytes(token)?);
        let outcome = stops.push(&text);
        if !outcome.emit.is_empty() {
            send(GenerationEvent::Text(outcome.emit))?;
        }
        if outcome.stopped {
            break StopCause::StopSequence;
        }
    };

    tracker.to(PipelineState::Completing);
    if cause != StopCause::StopSequence {
        let tail = stops.push(&utf8.finish());
        if !tail.emit.is_empty() {
            send(GenerationEvent::Text(tail.emit))?;
        }
        if tail.stopped {
            cause = StopCause::StopSequence;
        } else {
            let held = stops.finish();
            if !held.is_empty() {
                send(GenerationEvent::Text(held))?;
            }
        }
    }

    let state = if job.snapshot {
        match session.snapshot() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Failed to snapshot engine state: {}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(ProducerOutcome {
        summary: GenerationSummary {
            cause,
            usage: Usage::new(prompt.len(), completion, cached),
        },
        state,
    })
}
