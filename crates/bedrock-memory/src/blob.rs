//! Handles describing allocations.
//!
//! Allocators in this crate never hand out raw pointers. An allocation is an
//! [`Offset`] into the allocator's address space together with the size the
//! caller asked for. The bytes behind a blob are reached through
//! [`Allocator::bytes`](crate::Allocator::bytes) and
//! [`Allocator::bytes_mut`](crate::Allocator::bytes_mut).

use core::fmt;

/// A typed position in an allocator's address space.
///
/// What the value means depends on the allocator that produced it:
///
/// - [`FixedSizeObjectPool`](crate::FixedSizeObjectPool) and
///   [`SlowGeneralPurpose`](crate::SlowGeneralPurpose): byte offset from the
///   start of the region.
/// - [`SmallShortLivedChunked`](crate::SmallShortLivedChunked): the owning
///   instance's tag in the high bits, then the chunk slot times
///   [`PAGE_SIZE`](crate::small_short_lived::PAGE_SIZE) plus the offset
///   inside the chunk.
/// - [`DebugAllocator`](crate::DebugAllocator): the slot of the block in the
///   block table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, derive_more::From)]
pub struct Offset(usize);

impl Offset {
    /// Creates an offset from its raw value.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Returns the raw value of the offset.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0)
    }
}

/// A live allocation: where it starts and how many bytes were requested.
///
/// The allocator may reserve more than `size` bytes internally, but only
/// `size` bytes are exposed through `bytes`/`bytes_mut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blob {
    pub offset: Offset,
    pub size: usize,
}

impl Blob {
    /// The null blob.
    pub const EMPTY: Self = Self {
        offset: Offset(0),
        size: 0,
    };

    #[must_use]
    pub const fn new(offset: Offset, size: usize) -> Self {
        Self { offset, size }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the half-open range `offset..offset + size`.
    #[must_use]
    pub const fn range(&self) -> core::ops::Range<usize> {
        self.offset.0..self.offset.0 + self.size
    }

    /// Returns `true` if the two blobs share at least one byte.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset.0 < other.offset.0 + other.size && other.offset.0 < self.offset.0 + self.size
    }
}
