// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Disk-backed prompt prefix cache.
//!
//! Each entry holds the engine state after processing a rendered prompt and
//! lives in its own file, `<root>/<hex key>.bin`:
//!
//! ```text
//! 0..4   magic "PLNC"
//! 4..6   format version (u16 LE)
//! 6..8   reserved
//! 8..16  last access, unix millis (u64 LE)
//! 16..   bincode payload, state blob zstd-compressed
//! ```
//!
//! Reads take no lock. Writes go through a temp file and an atomic rename,
//! and are serialized per key.

use super::backend::{EngineState, TokenId};
use super::chat_template::PromptTemplate;
use super::error::{EngineError, EngineResult};
use super::models::ModelIdentity;
use super::request::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const CACHE_FORMAT_VERSION: u16 = 1;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const MAGIC: &[u8; 4] = b"PLNC";
const HEADER_LEN: usize = 16;
const LAST_ACCESS_OFFSET: u64 = 8;
const ENTRY_EXTENSION: &str = "bin";

/// SHA-256 fingerprint of everything that shapes a rendered prompt.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}

/// Configuration that changes the rendered prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptConfig {
    /// Identity of the template the prompt was rendered with, see
    /// [`PromptTemplate::identity`].
    pub template: String,
}

impl PromptConfig {
    pub fn for_template(template: &PromptTemplate) -> Self {
        Self {
            template: template.identity(),
        }
    }
}

struct KeyHasher(Sha256);

impl KeyHasher {
    fn field(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    fn optional(&mut self, value: Option<&str>) {
        match value {
            Some(v) => {
                self.0.update([1u8]);
                self.field(v.as_bytes());
            }
            None => self.0.update([0u8]),
        }
    }
}

/// Derive the cache key for a conversation. Sampling parameters never take
/// part.
pub fn key_for(
    model: &ModelIdentity,
    messages: &[ChatMessage],
    tools: &[Value],
    config: &PromptConfig,
) -> CacheKey {
    let mut hasher = KeyHasher(Sha256::new());
    hasher.field(MAGIC);
    hasher.field(&CACHE_FORMAT_VERSION.to_le_bytes());
    hasher.field(model.name.as_bytes());
    hasher.field(&model.size_bytes.to_le_bytes());

    hasher.field(&(messages.len() as u64).to_le_bytes());
    for message in messages {
        hasher.field(message.role.as_bytes());
        hasher.field(message.content.as_bytes());
        let calls: Vec<(&str, &str, &str)> = message
            .tool_calls
            .iter()
            .map(|c| (c.id.as_str(), c.function.name.as_str(), c.function.arguments.as_str()))
            .collect();
        hasher.field(canonical_json(&serde_json::json!(calls)).as_bytes());
        hasher.optional(message.tool_call_id.as_deref());
    }

    let tools = Value::Array(tools.to_vec());
    hasher.field(canonical_json(&tools).as_bytes());
    hasher.field(config.template.as_bytes());

    CacheKey(hasher.0.finalize().into())
}

/// JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String(key.clone()).to_string());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub state: EngineState,
    pub created_at: u64,
    pub last_access: u64,
}

impl CacheEntry {
    pub fn tokens(&self) -> &[TokenId] {
        &self.state.tokens
    }
}

#[derive(Serialize, Deserialize)]
struct EntryPayload {
    key: String,
    tokens: Vec<TokenId>,
    signature: String,
    blob: Vec<u8>,
    created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    errors: AtomicU64,
}

pub struct PromptCache {
    root: PathBuf,
    compression_level: i32,
    write_locks: std::sync::Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    counters: Counters,
}

impl PromptCache {
    pub async fn open(root: impl Into<PathBuf>, compression_level: i32) -> EngineResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(EngineError::cache_io)?;
        debug!("Prompt cache at {}", root.display());
        Ok(Self {
            root,
            compression_level,
            write_locks: std::sync::Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{}", key.to_hex(), ENTRY_EXTENSION))
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        tokio::fs::metadata(self.path_for(key)).await.is_ok()
    }

    /// Fetch the entry for `key` if one exists for the engine `signature`.
    pub async fn lookup(&self, key: &CacheKey, signature: &str) -> EngineResult<Option<CacheEntry>> {
        let mut result = self.read_entry(key, signature).await;
        if let Ok(Some(entry)) = &mut result {
            self.touch_entry(entry).await;
        }
        self.record(&result);
        result
    }

    /// First usable entry among `keys`, in order. Read failures are logged and
    /// treated as misses. Hit and miss counters and the entry's last access
    /// are left alone; call [`record_lookup`](Self::record_lookup) once the
    /// result is used.
    pub async fn find_first(&self, keys: &[CacheKey], signature: &str) -> Option<CacheEntry> {
        for key in keys {
            match self.read_entry(key, signature).await {
                Ok(Some(entry)) => return Some(entry),
                Ok(None) => {}
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Ignoring unreadable cache entry {}: {}", key, e);
                }
            }
        }
        None
    }

    /// Count a lookup as a hit or a miss and refresh the hit entry's last
    /// access.
    pub async fn record_lookup(&self, found: Option<&mut CacheEntry>) {
        match found {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.touch_entry(entry).await;
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Write `state` under `key`, replacing any existing entry.
    pub async fn store(&self, key: &CacheKey, state: &EngineState) -> EngineResult<()> {
        let lock = self.write_lock(key);
        let guard = lock.lock().await;

        let path = self.path_for(key);
        let root = self.root.clone();
        let key_hex = key.to_hex();
        let state = state.clone();
        let level = self.compression_level;
        let result = tokio::task::spawn_blocking(move || {
            write_entry(&root, &path, key_hex, state, level)
        })
        .await
        .map_err(EngineError::cache_io)
        .and_then(|r| r);

        drop(guard);
        self.release_write_lock(key, lock);

        match &result {
            Ok(()) => {
                self.counters.stores.fetch_add(1, Ordering::Relaxed);
                debug!("Stored prompt cache entry {}", key);
            }
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            stores: self.counters.stores.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn record(&self, result: &EngineResult<Option<CacheEntry>>) {
        let counter = match result {
            Ok(Some(_)) => &self.counters.hits,
            Ok(None) => &self.counters.misses,
            Err(_) => &self.counters.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    async fn touch_entry(&self, entry: &mut CacheEntry) {
        let path = self.path_for(&entry.key);
        let now = unix_millis();
        match tokio::task::spawn_blocking(move || touch(&path, now)).await {
            Ok(Ok(())) => entry.last_access = now,
            Ok(Err(e)) => warn!("Failed to refresh last access of {}: {}", entry.key, e),
            Err(e) => warn!("Failed to refresh last access of {}: {}", entry.key, e),
        }
    }

    async fn read_entry(&self, key: &CacheKey, signature: &str) -> EngineResult<Option<CacheEntry>> {
        let path = self.path_for(key);
        let key = *key;
        let signature = signature.to_string();
        tokio::task::spawn_blocking(move || read_entry(&path, key, &signature))
            .await
            .map_err(EngineError::cache_io)?
    }

    fn write_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(*key).or_default().clone()
    }

    fn release_write_lock(&self, key: &CacheKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this caller still reference it
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn write_entry(
    root: &Path,
    path: &Path,
    key: String,
    state: EngineState,
    level: i32,
) -> EngineResult<()> {
    let blob = zstd::encode_all(state.blob.as_slice(), level).map_err(EngineError::cache_io)?;
    let now = unix_millis();
    let payload = EntryPayload {
        key,
        tokens: state.tokens,
        signature: state.signature,
        blob,
        created_at: now,
    };
    let body = bincode::serialize(&payload).map_err(EngineError::cache_io)?;

    let mut file = tempfile::NamedTempFile::new_in(root).map_err(EngineError::cache_io)?;
    file.write_all(MAGIC).map_err(EngineError::cache_io)?;
    file.write_all(&CACHE_FORMAT_VERSION.to_le_bytes())
        .map_err(EngineError::cache_io)?;
    file.write_all(&[0u8; 2]).map_err(EngineError::cache_io)?;
    file.write_all(&now.to_le_bytes()).map_err(EngineError::cache_io)?;
    file.write_all(&body).map_err(EngineError::cache_io)?;
    file.as_file().sync_all().map_err(EngineError::cache_io)?;
    file.persist(path).map_err(|e| EngineError::cache_io(e.error))?;
    Ok(())
}

fn read_entry(path: &Path, key: CacheKey, signature: &str) -> EngineResult<Option<CacheEntry>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::cache_io(e)),
    };

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(EngineError::cache_io(format!(
            "{} is not a prompt cache entry",
            path.display()
        )));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != CACHE_FORMAT_VERSION {
        debug!("Cache entry {} has format version {}, skipping", key, version);
        return Ok(None);
    }

    let payload: EntryPayload =
        bincode::deserialize(&bytes[HEADER_LEN..]).map_err(EngineError::cache_io)?;
    if payload.signature != signature {
        debug!(
            "Cache entry {} was produced by '{}', not '{}'",
            key, payload.signature, signature
        );
        return Ok(None);
    }
    let blob = zstd::decode_all(payload.blob.as_slice()).map_err(EngineError::cache_io)?;
    let last_access = u64::from_le_bytes(bytes[8..HEADER_LEN].try_into().unwrap_or([0u8; 8]));

    Ok(Some(CacheEntry {
        key,
        state: EngineState {
            tokens: payload.tokens,
            blob,
            signature: payload.signature,
        },
        created_at: payload.created_at,
        last_access,
    }))
}

fn touch(path: &Path, millis: u64) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(LAST_ACCESS_OFFSET))?;
    file.write_all(&millis.to_le_bytes())
}

/// Last-access timestamp recorded in an entry file header.
pub fn read_last_access(path: &Path) -> std::io::Result<u64> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < HEADER_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "truncated cache entry",
        ));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[8..16]);
    Ok(u64::from_le_bytes(raw))
}
