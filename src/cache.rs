//! Per-folder decode cache.
//!
//! Each folder gets a slot guarded by its own mutex. The first caller for a
//! folder decodes while holding the slot; concurrent callers for that folder
//! wait and then share the result. Different folders never contend beyond
//! the brief slot lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::folder::DecodeError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Archive is closed")]
    Closed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits:           u64,
    pub misses:         u64,
    /// Decoder invocations, successful or not.
    pub decodes:        u64,
    pub cached_folders: usize,
    pub cached_bytes:   u64,
}

#[derive(Default)]
struct Slot {
    data: Mutex<Option<Bytes>>,
}

#[derive(Default)]
pub struct DecodeCache {
    slots:   Mutex<HashMap<usize, Arc<Slot>>>,
    closed:  AtomicBool,
    hits:    AtomicU64,
    misses:  AtomicU64,
    decodes: AtomicU64,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return folder `folder`'s decoded bytes, running `decode` at most once
    /// per folder across all threads. Errors are not cached.
    pub fn get_or_decode<F>(&self, folder: usize, decode: F) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Result<Vec<u8>, CacheError>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            if self.is_closed() {
                return Err(CacheError::Closed);
            }
            Arc::clone(slots.entry(folder).or_default())
        };

        let mut data = slot.data.lock();
        if let Some(buf) = data.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(folder, "decode cache hit");
            return Ok(buf.clone());
        }
        if self.is_closed() {
            return Err(CacheError::Closed);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.decodes.fetch_add(1, Ordering::Relaxed);
        debug!(folder, "decode cache miss");
        let buf = Bytes::from(decode()?);

        // A decode that finishes after close is handed back but not kept.
        if !self.is_closed() {
            *data = Some(buf.clone());
        }
        Ok(buf)
    }

    pub fn is_cached(&self, folder: usize) -> bool {
        let slot = self.slots.lock().get(&folder).cloned();
        slot.is_some_and(|s| s.data.lock().is_some())
    }

    /// Drop every cached buffer and refuse further work.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = std::mem::take(&mut *self.slots.lock());
        debug!(folders = dropped.len(), "decode cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CacheStats {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        let (cached_folders, cached_bytes) = slots.iter()
            .filter_map(|s| s.data.try_lock().and_then(|d| d.as_ref().map(Bytes::len)))
            .fold((0usize, 0u64), |(n, total), len| (n + 1, total + len as u64));
        CacheStats {
            hits:    self.hits.load(Ordering::Relaxed),
            misses:  self.misses.load(Ordering::Relaxed),
            decodes: self.decodes.load(Ordering::Relaxed),
            cached_folders,
            cached_bytes,
        }
    }
}
