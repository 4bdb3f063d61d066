//! Compressor provisioning.
//!
//! A [`CompressorHandle`] owns one [`Compressor`] for the lifetime of a response.
//! The handle, its drop, and the cancellation watcher all race to return the
//! compressor; a single-use flag in the shared slot lets exactly one of them act.

use crate::codec::{Compressor, validate_level};
use crate::error::{Error, Result};
use crate::options::{Options, PoolMode};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source of gzip compressors at one fixed level.
#[derive(Clone)]
pub struct CompressorPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    level: i32,
    idle: Option<ArrayQueue<Compressor>>,
}

impl CompressorPool {
    /// Creates a pool, failing if `level` is not `-1` or `0..=9`.
    pub fn new(level: i32, mode: PoolMode) -> Result<Self> {
        let level = validate_level(level)?;
        Ok(Self::with_validated_level(level, mode))
    }

    pub(crate) fn from_options(options: &Options) -> Self {
        Self::with_validated_level(options.level(), options.pool_mode())
    }

    fn with_validated_level(level: i32, mode: PoolMode) -> Self {
        let idle = match mode {
            PoolMode::Pooled { max_idle } if max_idle > 0 => Some(ArrayQueue::new(max_idle)),
            _ => None,
        };
        Self {
            inner: Arc::new(PoolInner { level, idle }),
        }
    }

    /// Returns true if released compressors are kept for reuse.
    pub fn is_pooled(&self) -> bool {
        self.inner.idle.is_some()
    }

    /// Number of idle compressors ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.as_ref().map_or(0, ArrayQueue::len)
    }

    /// Checks out a compressor, reusing an idle one when available.
    pub fn acquire(&self) -> CompressorHandle {
        let compressor = match self.inner.idle.as_ref().and_then(ArrayQueue::pop) {
            Some(compressor) => {
                tracing::trace!("reusing pooled gzip compressor");
                compressor
            }
            None => {
                tracing::trace!(level = self.inner.level, "building gzip compressor");
                Compressor::new(self.inner.level)
            }
        };

        CompressorHandle {
            slot: Arc::new(HandleSlot {
                compressor: Mutex::new(Some(compressor)),
                released: AtomicBool::new(false),
                pool: self.clone(),
            }),
            cancel: None,
        }
    }

    fn put(&self, mut compressor: Compressor) {
        let Some(idle) = &self.inner.idle else {
            return;
        };
        compressor.reset();
        if idle.push(compressor).is_err() {
            tracing::trace!("compressor pool full, dropping compressor");
        }
    }
}

impl fmt::Debug for CompressorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressorPool")
            .field("level", &self.inner.level)
            .field("pooled", &self.is_pooled())
            .field("idle", &self.idle_count())
            .finish()
    }
}

struct HandleSlot {
    compressor: Mutex<Option<Compressor>>,
    released: AtomicBool,
    pool: CompressorPool,
}

impl HandleSlot {
    /// Returns the compressor to the pool. Only the first caller acts.
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let compressor = self.compressor.lock().take();
        if let Some(compressor) = compressor {
            self.pool.put(compressor);
        }
        true
    }
}

/// A compressor checked out for one response.
///
/// Released exactly once: explicitly via [`CompressorHandle::release`], on drop,
/// or by the cancellation watcher, whichever happens first.
pub struct CompressorHandle {
    slot: Arc<HandleSlot>,
    cancel: Option<CancellationToken>,
}

impl CompressorHandle {
    /// Runs `f` against the compressor, failing if it was already reclaimed.
    pub(crate) fn with_compressor<T>(
        &self,
        f: impl FnOnce(&mut Compressor) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut guard = self.slot.compressor.lock();
        match guard.as_mut() {
            Some(compressor) => f(compressor),
            None => {
                tracing::warn!("write to a reclaimed gzip compressor");
                Err(Error::CompressorReclaimed.into())
            }
        }
    }

    /// Returns the compressor to its pool. Returns false if another path already did.
    pub fn release(&self) -> bool {
        let released = self.slot.release();
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        released
    }

    /// Returns true once the compressor has been handed back.
    pub fn is_released(&self) -> bool {
        self.slot.released.load(Ordering::Acquire)
    }

    /// Returns true if a cleanup watcher was armed for this handle.
    pub(crate) fn is_watched(&self) -> bool {
        self.cancel.is_some()
    }

    /// Spawns the cleanup watcher for this handle.
    ///
    /// The watcher waits for `parent` (if any) to be cancelled, for this handle
    /// to be released or dropped, or for `timeout` to elapse, then releases the
    /// compressor. Returns `None` when no Tokio runtime is running.
    pub(crate) fn arm_cleanup(
        &mut self,
        parent: Option<&CancellationToken>,
        timeout: Duration,
    ) -> Option<JoinHandle<bool>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        self.cancel = Some(token.clone());

        let slot = Arc::clone(&self.slot);
        Some(runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::debug!(?timeout, "cleanup wait elapsed for gzip compressor");
                }
            }
            let released = slot.release();
            if released {
                tracing::debug!("reclaimed gzip compressor from cancelled response");
            }
            released
        }))
    }
}

impl Drop for CompressorHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CompressorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressorHandle")
            .field("released", &self.is_released())
            .field("watched", &self.is_watched())
            .finish()
    }
}
