//! The byte substrate allocators carve up.

use core::ops::{Deref, DerefMut};

/// A contiguous byte buffer lent to an allocator for its lifetime.
///
/// The region is not owned by the allocator: the caller keeps the backing
/// storage alive and gets it back when the allocator is dropped. Two
/// allocators can never alias the same bytes because the region holds an
/// exclusive borrow.
#[derive(Debug)]
pub struct Region<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Region<'a> {
    #[must_use]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns `true` if `offset..offset + len` lies within the region.
    #[must_use]
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.bytes.len())
    }
}

impl<'a> From<&'a mut [u8]> for Region<'a> {
    fn from(bytes: &'a mut [u8]) -> Self {
        Self::new(bytes)
    }
}

impl Deref for Region<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.bytes
    }
}

impl DerefMut for Region<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.bytes
    }
}
