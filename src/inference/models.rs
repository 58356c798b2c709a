// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::backend::{BackendLoader, LoadOptions};
use super::error::{EngineError, EngineResult};
use super::serializer::{GateGuard, GatePurpose, RequestSerializer, ResidentModel};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// What the cache needs to know about a model to key entries stably across
/// restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelIdentity {
    pub name: String,
    pub size_bytes: u64,
}

/// Snapshot of the resident model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub options: LoadOptions,
    pub context_size: usize,
    /// Engine configuration fingerprint; cached state only restores into an
    /// identical one
    pub signature: String,
    #[serde(skip)]
    pub chat_template: Option<String>,
    #[serde(skip)]
    pub bos_token: String,
    #[serde(skip)]
    pub eos_token: String,
    pub loaded_at: SystemTime,
    /// Increases with every successful load
    pub generation: u64,
}

impl ModelInfo {
    pub fn identity(&self) -> ModelIdentity {
        ModelIdentity {
            name: self.id.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

pub struct ModelRegistry {
    models_directory: PathBuf,
    loader: Arc<dyn BackendLoader>,
    gate: Arc<RequestSerializer>,
    active: RwLock<Option<ModelInfo>>,
    default_options: LoadOptions,
    load_counter: AtomicU64,
}

impl ModelRegistry {
    pub async fn new(
        models_directory: PathBuf,
        loader: Arc<dyn BackendLoader>,
        gate: Arc<RequestSerializer>,
        default_options: LoadOptions,
    ) -> EngineResult<Self> {
        tokio::fs::create_dir_all(&models_directory)
            .await
            .map_err(|e| {
                EngineError::load(
                    models_directory.display().to_string(),
                    format!("cannot create models directory: {}", e),
                )
            })?;

        Ok(Self {
            models_directory,
            loader,
            gate,
            active: RwLock::new(None),
            default_options,
            load_counter: AtomicU64::new(0),
        })
    }

    pub fn models_directory(&self) -> &Path {
        &self.models_directory
    }

    pub fn gate(&self) -> &Arc<RequestSerializer> {
        &self.gate
    }

    /// GGUF file names in the models directory, sorted.
    pub async fn list(&self) -> EngineResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.models_directory)
            .await
            .map_err(|e| EngineError::NotFound(format!("models directory: {}", e)))?;
        let mut models = Vec::new();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                models.push(name.to_string());
            }
        }

        models.sort();
        Ok(models)
    }

    /// The resident model, or `None` when nothing is loaded.
    pub async fn active(&self) -> Option<ModelInfo> {
        self.active.read().await.clone()
    }

    /// Load `identifier`, replacing the resident model once the gate is free.
    pub async fn load(&self, identifier: &str, options: &LoadOptions) -> EngineResult<ModelInfo> {
        let mut guard = self.gate.acquire(GatePurpose::Load).await;
        self.load_locked(&mut guard, identifier, options).await
    }

    /// Load under a gate the caller already holds.
    pub async fn load_locked(
        &self,
        guard: &mut GateGuard,
        identifier: &str,
        options: &LoadOptions,
    ) -> EngineResult<ModelInfo> {
        let path = self.resolve(identifier).await?;
        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|_| EngineError::NotFound(identifier.to_string()))?
            .len();
        let options = options.merged_over(&self.default_options);

        // The old resource is released before the new one is created
        *self.active.write().await = None;
        if let Some(old) = guard.resident.take() {
            info!("Unloading model {} before loading {}", old.info.id, identifier);
            drop(old);
        }

        let loader = self.loader.clone();
        let load_path = path.clone();
        let load_options = options.clone();
        let backend = tokio::task::spawn_blocking(move || loader.load(&load_path, &load_options))
            .await
            .map_err(|e| EngineError::load(identifier, format!("loader task failed: {}", e)))?
            .map_err(|e| {
                warn!("Failed to load model {}: {}", identifier, e);
                e
            })?;

        let metadata = backend.metadata();
        let info = ModelInfo {
            id: identifier.to_string(),
            path,
            size_bytes,
            options,
            context_size: metadata.context_size,
            signature: metadata.signature,
            chat_template: metadata.chat_template,
            bos_token: metadata.bos_token,
            eos_token: metadata.eos_token,
            loaded_at: SystemTime::now(),
            generation: self.load_counter.fetch_add(1, Ordering::SeqCst) + 1,
        };

        guard.resident = Some(ResidentModel {
            info: info.clone(),
            backend,
        });
        *self.active.write().await = Some(info.clone());

        info!(
            "Model {} loaded (n_ctx={}, signature={})",
            info.id, info.context_size, info.signature
        );
        Ok(info)
    }

    /// Drop the resident model, waiting for any in-flight request first.
    pub async fn unload(&self) -> Option<ModelInfo> {
        let mut guard = self.gate.acquire(GatePurpose::Unload).await;
        *self.active.write().await = None;
        let old = guard.resident.take();
        old.map(|resident| {
            info!("Unloaded model {}", resident.info.id);
            resident.info
        })
    }

    async fn resolve(&self, identifier: &str) -> EngineResult<PathBuf> {
        // Identifiers are plain file names inside the models directory
        let is_plain = !identifier.is_empty()
            && identifier != "."
            && identifier != ".."
            && !identifier.contains('/')
            && !identifier.contains('\\');
        if !is_plain {
            return Err(EngineError::NotFound(identifier.to_string()));
        }

        let path = self.models_directory.join(identifier);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(EngineError::NotFound(identifier.to_string())),
        }
    }
}
