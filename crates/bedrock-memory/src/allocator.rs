//! The interface shared by every allocator strategy.

use crate::{blob::Blob, error::MemoryError};

/// What an allocator can promise to its callers.
///
/// Callers pick an allocator by querying these instead of matching on its
/// concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[expect(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// The instance may be shared between threads without external locking.
    pub thread_safe: bool,
    /// Every returned offset is a multiple of [`Capabilities::alignment`].
    pub aligned: bool,
    /// `reset` forgets all allocations at once.
    pub supports_reset: bool,
    /// Outstanding allocations can be enumerated and reported as leaks.
    pub leak_check: bool,
    /// Metadata is guarded by cookies or sentinels.
    pub corruption_check: bool,
    /// All allocations have the same size.
    pub fixed_size: bool,
    /// Alignment of returned offsets, in bytes.
    pub alignment: usize,
    /// Largest request that can ever succeed, if the allocator has a ceiling.
    pub max_allocation: Option<usize>,
}

/// Allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Bytes the allocator can hand out in total, or `None` if it grows on
    /// demand without a fixed ceiling.
    pub capacity_bytes: Option<usize>,
    /// Bytes reserved by live allocations, including rounding.
    pub allocated_bytes: usize,
    pub live_allocations: usize,
    pub total_allocations: u64,
    pub failed_allocations: u64,
    pub peak_allocated_bytes: usize,
}

impl Stats {
    pub(crate) fn record_alloc(&mut self, reserved: usize) {
        self.allocated_bytes += reserved;
        self.live_allocations += 1;
        self.total_allocations += 1;
        self.peak_allocated_bytes = self.peak_allocated_bytes.max(self.allocated_bytes);
    }

    /// Counts one more holder of an existing block. Each holder is released
    /// through its own [`Stats::record_free`].
    pub(crate) fn record_share(&mut self, reserved: usize) {
        self.allocated_bytes += reserved;
        self.live_allocations += 1;
        self.peak_allocated_bytes = self.peak_allocated_bytes.max(self.allocated_bytes);
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed_allocations += 1;
    }

    pub(crate) fn record_free(&mut self, reserved: usize) {
        self.allocated_bytes -= reserved;
        self.live_allocations -= 1;
    }

    pub(crate) fn clear_live(&mut self) {
        self.allocated_bytes = 0;
        self.live_allocations = 0;
    }
}

/// A memory allocation strategy.
///
/// Running out of memory is signalled by `allocate` returning `None`.
/// Misuse and corruption are signalled through [`MemoryError`], subject to the
/// instance's [`IntegrityPolicy`](crate::IntegrityPolicy).
pub trait Allocator {
    /// A short name used in reports.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Allocates at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Option<Blob>;

    /// Returns a blob obtained from [`Allocator::allocate`] to the allocator.
    fn deallocate(&mut self, blob: Blob) -> Result<(), MemoryError>;

    /// Returns `true` if `blob` lies in memory managed by this allocator.
    fn owns(&self, blob: Blob) -> bool;

    /// Forgets every outstanding allocation at once.
    ///
    /// Blobs handed out before the reset must not be used afterwards.
    fn reset(&mut self) -> Result<(), MemoryError> {
        Err(MemoryError::unsupported("this allocator", "reset"))
    }

    fn stats(&self) -> Stats;

    /// Returns the payload of a live blob.
    fn bytes(&self, blob: Blob) -> Option<&[u8]>;

    /// Returns the payload of a live blob for writing.
    fn bytes_mut(&mut self, blob: Blob) -> Option<&mut [u8]>;
}
