//! Errors raised on allocator misuse and metadata corruption.

use alloc::boxed::Box;
use core::{fmt, panic};

use snafu::{GenerateImplicitData, IntoError as _, Snafu};

use crate::blob::Offset;

/// Source location where a [`MemoryError`] was raised.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Location(&'static panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl Location {
    /// Returns the file in which the error was raised.
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    /// Returns the line at which the error was raised.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }

    #[must_use]
    pub fn column(&self) -> u32 {
        self.0.column()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors reported by the allocators.
///
/// Running out of memory is not an error: allocation entry points return
/// `None` for that. These variants describe misuse and corruption of the
/// allocator bookkeeping, and construction failures.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum MemoryError {
    #[snafu(display("region of {len} bytes is too small, at least {min} bytes are required"))]
    RegionTooSmall {
        len: usize,
        min: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region of {len} bytes exceeds the addressable maximum of {max} bytes"))]
    RegionTooLarge {
        len: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "corrupted {field} at {offset}: expected {expected:#x}, found {found:#x}"
    ))]
    CorruptedCookie {
        field: &'static str,
        offset: Offset,
        expected: u64,
        found: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at {offset} is {state}, expected {expected}"))]
    UnexpectedState {
        offset: Offset,
        state: &'static str,
        expected: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{offset} is not owned by this allocator"))]
    NotOwned {
        offset: Offset,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "block at {offset} records a neighbor size of {recorded} units, \
         but the preceding block has {actual} units"
    ))]
    NeighborSizeMismatch {
        offset: Offset,
        recorded: u32,
        actual: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("adjacent free blocks at {offset} and {next} were not coalesced"))]
    UncoalescedFree {
        offset: Offset,
        next: Offset,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("inconsistent bookkeeping at {offset}: {reason}"))]
    Inconsistent {
        offset: Offset,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    /// A free that failed, tagged with the site that attempted it.
    ///
    /// `location` is the free site; `source` is what went wrong with the
    /// block.
    #[snafu(display("invalid free in {function} [{system}] at {location}: {source}"))]
    InvalidFree {
        function: &'static str,
        system: &'static str,
        #[snafu(source(from(MemoryError, Box::new)))]
        source: Box<MemoryError>,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{allocator} does not support {operation}"))]
    Unsupported {
        allocator: &'static str,
        operation: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

impl MemoryError {
    #[track_caller]
    #[must_use]
    pub(crate) fn region_too_small(len: usize, min: usize) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        RegionTooSmallSnafu { len, min }.build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn region_too_large(len: usize, max: usize) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        RegionTooLargeSnafu { len, max }.build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn corrupted_cookie(
        field: &'static str,
        offset: Offset,
        expected: u64,
        found: u64,
    ) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        CorruptedCookieSnafu {
            field,
            offset,
            expected,
            found,
        }
        .build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn unexpected_state(
        offset: Offset,
        state: &'static str,
        expected: &'static str,
    ) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        UnexpectedStateSnafu {
            offset,
            state,
            expected,
        }
        .build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn not_owned(offset: Offset) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        NotOwnedSnafu { offset }.build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn neighbor_size_mismatch(offset: Offset, recorded: u32, actual: u32) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        NeighborSizeMismatchSnafu {
            offset,
            recorded,
            actual,
        }
        .build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn uncoalesced_free(offset: Offset, next: Offset) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        UncoalescedFreeSnafu { offset, next }.build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn inconsistent(offset: Offset, reason: &'static str) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        InconsistentSnafu { offset, reason }.build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn unsupported(allocator: &'static str, operation: &'static str) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        UnsupportedSnafu {
            allocator,
            operation,
        }
        .build()
    }

    #[track_caller]
    #[must_use]
    pub(crate) fn invalid_free(
        function: &'static str,
        system: &'static str,
        source: MemoryError,
    ) -> Self {
        #[cfg_attr(not(test), expect(clippy::wildcard_imports))]
        use self::memory_error::*;

        InvalidFreeSnafu { function, system }.into_error(source)
    }

    /// Returns the location where this error was raised.
    ///
    /// For [`MemoryError::InvalidFree`] this is the free site.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::RegionTooSmall { location, .. }
            | Self::RegionTooLarge { location, .. }
            | Self::CorruptedCookie { location, .. }
            | Self::UnexpectedState { location, .. }
            | Self::NotOwned { location, .. }
            | Self::NeighborSizeMismatch { location, .. }
            | Self::UncoalescedFree { location, .. }
            | Self::Inconsistent { location, .. }
            | Self::InvalidFree { location, .. }
            | Self::Unsupported { location, .. } => *location,
        }
    }

    /// Returns the innermost error, looking through free-site wrappers.
    #[must_use]
    pub fn cause(&self) -> &Self {
        match self {
            Self::InvalidFree { source, .. } => source.cause(),
            _ => self,
        }
    }

    /// Returns `true` if the error indicates damaged allocator metadata, as
    /// opposed to a construction failure or an unsupported operation.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        if let Self::InvalidFree { source, .. } = self {
            return source.is_corruption();
        }
        matches!(
            self,
            Self::CorruptedCookie { .. }
                | Self::UnexpectedState { .. }
                | Self::NeighborSizeMismatch { .. }
                | Self::UncoalescedFree { .. }
                | Self::Inconsistent { .. }
        )
    }
}
