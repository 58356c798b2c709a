// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Exclusive FIFO gate over the resident model.
//!
//! The gate owns the model slot itself, so the only way to reach the
//! execution resource is through a [`GateGuard`]. `tokio::sync::Mutex` queues
//! waiters fairly, which gives arrival-order acquisition with no priorities
//! and no preemption.

use super::backend::ExecutionBackend;
use super::models::ModelInfo;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

/// The loaded model together with its execution resource.
pub struct ResidentModel {
    pub info: ModelInfo,
    pub backend: Box<dyn ExecutionBackend>,
}

#[derive(Default)]
pub struct ModelSlot {
    pub(crate) resident: Option<ResidentModel>,
}

impl ModelSlot {
    pub fn info(&self) -> Option<&ModelInfo> {
        self.resident.as_ref().map(|r| &r.info)
    }

    pub fn resident_mut(&mut self) -> Option<&mut ResidentModel> {
        self.resident.as_mut()
    }
}

/// What a holder is doing with the gate; used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePurpose {
    Generate,
    Load,
    Unload,
    Prewarm,
}

pub struct RequestSerializer {
    slot: Arc<Mutex<ModelSlot>>,
    waiting: Arc<AtomicUsize>,
}

impl RequestSerializer {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(ModelSlot::default())),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for exclusive access. Waiters are served in arrival order.
    pub async fn acquire(&self, purpose: GatePurpose) -> GateGuard {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let queued_at = Instant::now();
        let guard = self.slot.clone().lock_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        debug!(
            ?purpose,
            waited_ms = queued_at.elapsed().as_millis() as u64,
            "Acquired model gate"
        );
        GateGuard {
            guard,
            purpose,
            acquired_at: Instant::now(),
        }
    }

    pub fn try_acquire(&self, purpose: GatePurpose) -> Option<GateGuard> {
        self.slot.clone().try_lock_owned().ok().map(|guard| GateGuard {
            guard,
            purpose,
            acquired_at: Instant::now(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Number of callers currently queued behind the holder.
    pub fn queue_depth(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl Default for RequestSerializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the model slot, released on drop.
pub struct GateGuard {
    guard: OwnedMutexGuard<ModelSlot>,
    purpose: GatePurpose,
    acquired_at: Instant,
}

impl Deref for GateGuard {
    type Target = ModelSlot;

    fn deref(&self) -> &ModelSlot {
        &self.guard
    }
}

impl DerefMut for GateGuard {
    fn deref_mut(&mut self) -> &mut ModelSlot {
        &mut self.guard
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        trace!(
            purpose = ?self.purpose,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Released model gate"
        );
    }
}
