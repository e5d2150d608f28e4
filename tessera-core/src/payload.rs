//! Compress-once payloads shared across recipients.
//!
//! When N viewers watch the same display, a resize, a cursor move or
//! the pixels of a freshly changed tile are the same logical message
//! for all of them. A [`CompressedPayload`] holds that message and
//! compiles its wire body on first use; every connection that sends it
//! writes the same bytes. Ownership is an [`Arc`]: each queued or
//! in-flight send holds a clone, and the payload is released when the
//! last clone drops.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use bytes::Bytes;
use tracing::trace;

use crate::codec;
use crate::error::TesseraError;
use crate::event::{CoalesceKey, EventKind, ServerEvent};

/// Shared handle to a compiled-on-demand message.
pub type SharedPayload = Arc<CompressedPayload>;

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

// ── CompressedPayload ────────────────────────────────────────────

pub struct CompressedPayload {
    event: ServerEvent,
    compiled: OnceLock<Bytes>,
    on_release: Option<ReleaseHook>,
}

impl CompressedPayload {
    /// Wrap `event`; its body is compiled on the first [`bytes`](Self::bytes) call.
    pub fn new(event: ServerEvent) -> SharedPayload {
        Arc::new(Self {
            event,
            compiled: OnceLock::new(),
            on_release: None,
        })
    }

    /// Like [`new`](Self::new), running `hook` exactly once when the last
    /// reference is dropped.
    pub fn with_release_hook(
        event: ServerEvent,
        hook: impl FnOnce() + Send + Sync + 'static,
    ) -> SharedPayload {
        Arc::new(Self {
            event,
            compiled: OnceLock::new(),
            on_release: Some(Box::new(hook)),
        })
    }

    /// Wrap `event` and compile it immediately.
    pub fn precompiled(event: ServerEvent) -> Result<SharedPayload, TesseraError> {
        let payload = Self::new(event);
        payload.bytes()?;
        Ok(payload)
    }

    pub fn event(&self) -> &ServerEvent {
        &self.event
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn coalesce_key(&self) -> CoalesceKey {
        self.event.coalesce_key()
    }

    /// The compressed wire body. Callers must treat it as read-only.
    pub fn bytes(&self) -> Result<Bytes, TesseraError> {
        if let Some(body) = self.compiled.get() {
            return Ok(body.clone());
        }
        // Two racing first senders may both compress; only one result is kept.
        let body = codec::serialize(&self.event)?;
        Ok(self.compiled.get_or_init(|| body).clone())
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }
}

impl Drop for CompressedPayload {
    fn drop(&mut self) {
        trace!(kind = ?self.event.kind(), "payload released");
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl fmt::Debug for CompressedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedPayload")
            .field("kind", &self.event.kind())
            .field("compiled", &self.compiled.get().map(Bytes::len))
            .finish()
    }
}

// ── PayloadCache ─────────────────────────────────────────────────

/// Weak map from a logical-event key to its live payload.
///
/// The cache never keeps a payload alive by itself: once every
/// recipient has released it, the entry is dead and is pruned on the
/// next insertion.
pub struct PayloadCache<K> {
    entries: Mutex<HashMap<K, Weak<CompressedPayload>>>,
}

impl<K: Hash + Eq> PayloadCache<K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Live payload for `key`, if any recipient still holds it.
    pub fn get(&self, key: &K) -> Option<SharedPayload> {
        self.lock().get(key).and_then(Weak::upgrade)
    }

    /// Live payload for `key`, or a new one built from `make`.
    pub fn get_or_try_insert_with(
        &self,
        key: K,
        make: impl FnOnce() -> Result<ServerEvent, TesseraError>,
    ) -> Result<SharedPayload, TesseraError> {
        let mut entries = self.lock();
        if let Some(live) = entries.get(&key).and_then(Weak::upgrade) {
            return Ok(live);
        }
        entries.retain(|_, weak| weak.strong_count() > 0);
        let payload = CompressedPayload::new(make()?);
        entries.insert(key, Arc::downgrade(&payload));
        Ok(payload)
    }

    /// Number of entries whose payload is still alive.
    pub fn live_len(&self) -> usize {
        self.lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Weak<CompressedPayload>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Hash + Eq> Default for PayloadCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
