//! Memory allocation strategies for a real-time engine runtime.
//!
//! The crate provides four allocators sharing one [`Allocator`] interface.
//! None of them hands out raw pointers: allocations are [`Blob`]s, typed
//! offsets into memory the allocator owns or borrows, and their bytes are
//! reached through [`Allocator::bytes`] and [`Allocator::bytes_mut`].
//!
//! # Available Allocators
//!
//! ## [`FixedSizeObjectPool`]
//!
//! Uniformly sized slots over a caller-provided [`Region`], with an in-place
//! free chain. Best suited for:
//!
//! - Many objects of one type (particles, nodes, handles)
//! - Hot paths where every allocation must be O(1)
//!
//! ## [`SlowGeneralPurpose`]
//!
//! A best-fit free-list allocator over one arena. Block headers carry cookies
//! and neighbor sizes, so freed blocks coalesce in O(1) and overruns into the
//! next header are detected. [`SlowGeneralPurpose::internal_sanity_check`]
//! walks the whole arena and reports leaks.
//!
//! ## [`SmallShortLivedChunked`]
//!
//! A bump allocator over 64 KiB chunks drawn from a [`PageSource`]. A chunk
//! goes back to its source as soon as its last block is freed, which suits
//! per-frame scratch data.
//!
//! ## [`DebugAllocator`]
//!
//! Every block in its own guarded buffer, tagged with the file, line,
//! function and subsystem that requested it. Used to hunt leaks and overruns.
//!
//! # Error handling
//!
//! Running out of memory is not an error: `allocate` returns `None`.
//! Misuse and corruption produce a [`MemoryError`], which is routed through
//! the allocator's [`IntegrityPolicy`]: logged and returned, or logged and
//! raised as a panic.
//!
//! # Thread Safety
//!
//! Allocators are `Send` but not `Sync`. Wrap one in [`Synchronized`] to share
//! it between threads.
//!
//! # Logging
//!
//! Diagnostics go through the [`log`] module. Install a [`log::LogSink`] with
//! [`log::set_sink`] to receive them.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

#[macro_use]
pub mod log;

mod allocator;
mod blob;
mod config;
pub mod debug_allocator;
mod error;
pub mod fixed_size_pool;
mod region;
pub mod slow_general_purpose;
pub mod small_short_lived;
mod synchronized;

pub use self::{
    allocator::{Allocator, Capabilities, Stats},
    blob::{Blob, Offset},
    config::{Config, IntegrityPolicy},
    debug_allocator::{DebugAllocator, Provenance},
    error::{Location, MemoryError},
    fixed_size_pool::FixedSizeObjectPool,
    region::Region,
    slow_general_purpose::{SanityReport, SlowGeneralPurpose},
    small_short_lived::{HeapPageSource, PageSource, SmallShortLivedChunked},
    synchronized::Synchronized,
};
