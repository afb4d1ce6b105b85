//! Sharing one allocator between threads.
//!
//! The strategies in this crate take `&mut self` and keep no locks of their
//! own. [`Synchronized`] puts one behind a spin lock and exposes the same
//! operations through `&self`. Payload access is scoped to a closure, since
//! a borrow of the payload cannot outlive the lock.

use spin::{Mutex, MutexGuard};

use crate::{
    allocator::{Allocator, Capabilities, Stats},
    blob::Blob,
    error::MemoryError,
};

/// Spin-locked wrapper that lets any allocator be shared between threads.
///
/// Every `&self` entry point takes the lock for the duration of one call.
/// Use [`Synchronized::lock`] to batch several operations under one
/// acquisition.
///
/// ```
/// use bedrock_memory::{FixedSizeObjectPool, Region, Synchronized};
///
/// let mut buf = [0u8; 1024];
/// let shared = Synchronized::new(FixedSizeObjectPool::<64>::new(Region::new(&mut buf))?);
/// let blob = shared.allocate(48).unwrap();
/// shared.with_bytes_mut(blob, |bytes| bytes.fill(7));
/// assert_eq!(shared.with_bytes(blob, |bytes| bytes[0]), Some(7));
/// shared.deallocate(blob)?;
/// # Ok::<(), bedrock_memory::MemoryError>(())
/// ```
#[derive(Debug, Default)]
pub struct Synchronized<A> {
    inner: Mutex<A>,
}

impl<A: Allocator> Synchronized<A> {
    /// Wraps `inner`, which from now on is reached through the lock.
    pub const fn new(inner: A) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Takes the lock and returns the wrapped allocator.
    ///
    /// Other threads spin until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }

    /// Returns the wrapped allocator without locking.
    pub fn get_mut(&mut self) -> &mut A {
        self.inner.get_mut()
    }

    /// Unwraps the allocator, for example to run a final sanity check once
    /// every thread is done with it.
    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }

    pub fn name(&self) -> &'static str {
        "synchronized"
    }

    /// The wrapped allocator's capabilities, with `thread_safe` set.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            thread_safe: true,
            ..self.inner.lock().capabilities()
        }
    }

    #[track_caller]
    pub fn allocate(&self, size: usize) -> Option<Blob> {
        self.inner.lock().allocate(size)
    }

    #[track_caller]
    pub fn deallocate(&self, blob: Blob) -> Result<(), MemoryError> {
        self.inner.lock().deallocate(blob)
    }

    pub fn owns(&self, blob: Blob) -> bool {
        self.inner.lock().owns(blob)
    }

    /// Resets the wrapped allocator.
    ///
    /// # Errors
    ///
    /// Whatever the wrapped allocator's `reset` reports, including
    /// [`MemoryError::Unsupported`].
    pub fn reset(&self) -> Result<(), MemoryError> {
        self.inner.lock().reset()
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().stats()
    }

    /// Runs `f` on the payload of `blob` while holding the lock.
    ///
    /// # Returns
    ///
    /// The result of `f`, or `None` if `blob` is not a live allocation of the
    /// wrapped allocator.
    pub fn with_bytes<R>(&self, blob: Blob, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.inner.lock().bytes(blob).map(f)
    }

    /// Runs `f` on the payload of `blob` for writing while holding the lock.
    pub fn with_bytes_mut<R>(&self, blob: Blob, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.inner.lock().bytes_mut(blob).map(f)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{thread, vec::Vec};

    use super::*;
    use crate::{Config, FixedSizeObjectPool, Region, SlowGeneralPurpose};

    #[test]
    fn test_capabilities_report_thread_safe() {
        let mut buf = [0u8; 1024];
        let pool = FixedSizeObjectPool::<32>::new(Region::new(&mut buf)).unwrap();
        assert!(!pool.capabilities().thread_safe);
        let shared = Synchronized::new(pool);
        let caps = shared.capabilities();
        assert!(caps.thread_safe);
        assert!(caps.fixed_size);
        assert_eq!(shared.name(), "synchronized");
    }

    #[test]
    fn test_payload_reachable_through_lock() {
        let mut arena = vec![0u8; 4096];
        let heap =
            SlowGeneralPurpose::with_config("payload", Region::new(&mut arena), Config::reporting())
                .unwrap();
        let mut shared = Synchronized::new(heap);

        let blob = shared.allocate(100).unwrap();
        assert!(shared.owns(blob));
        shared
            .with_bytes_mut(blob, |bytes| {
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = u8::try_from(i).unwrap();
                }
            })
            .unwrap();
        let sum = shared
            .with_bytes(blob, |bytes| {
                assert_eq!(bytes.len(), 100);
                bytes.iter().map(|&b| usize::from(b)).sum::<usize>()
            })
            .unwrap();
        assert_eq!(sum, (0..100).sum::<usize>());
        assert_eq!(shared.get_mut().bytes(blob).unwrap()[99], 99);
        assert_eq!(shared.stats().live_allocations, 1);

        shared.deallocate(blob).unwrap();
        assert!(shared.with_bytes(blob, <[u8]>::len).is_none());

        let blob = shared.allocate(40).unwrap();
        shared.reset().unwrap();
        assert!(shared.with_bytes(blob, <[u8]>::len).is_none());
        assert_eq!(shared.stats().live_allocations, 0);
    }

    #[test]
    fn test_shared_between_threads() {
        let mut arena = vec![0u8; 1024 * 1024];
        let heap =
            SlowGeneralPurpose::with_config("shared", Region::new(&mut arena), Config::reporting())
                .unwrap();
        let shared = Synchronized::new(heap);

        thread::scope(|s| {
            for id in 0..4u8 {
                let shared = &shared;
                s.spawn(move || {
                    let mut live = Vec::new();
                    for round in 0..200usize {
                        let size = 16 + (round * 37 + usize::from(id) * 11) % 500;
                        let blob = shared.allocate(size).unwrap();
                        shared.with_bytes_mut(blob, |bytes| bytes.fill(id)).unwrap();
                        live.push(blob);
                        if round % 3 == 0 {
                            let blob = live.swap_remove(0);
                            let intact = shared
                                .with_bytes(blob, |bytes| bytes.iter().all(|&b| b == id))
                                .unwrap();
                            assert!(intact);
                            shared.deallocate(blob).unwrap();
                        }
                    }
                    for blob in live {
                        shared.deallocate(blob).unwrap();
                    }
                });
            }
        });

        let heap = shared.into_inner();
        let report = heap.internal_sanity_check(true, false).unwrap();
        assert_eq!(report.allocated_blocks, 0);
        assert_eq!(report.free_blocks, 1);
    }
}
