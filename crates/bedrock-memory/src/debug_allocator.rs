//! Instrumented allocator for hunting leaks and overruns.
//!
//! Each allocation gets its own heap buffer laid out as
//!
//! ```text
//! ┌────────────────────────────┬──────────────┬─────────────────────┐
//! │ header (32 bytes)          │ payload      │ footer (16 bytes)   │
//! │ "YBLK" state size ... CODE │ size bytes   │ "CODECODECODECODE"  │
//! └────────────────────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! Live blocks are chained in allocation order through the `prev`/`next`
//! fields of their headers, so the whole set can be walked and reported. The
//! file, line, function and subsystem that requested each block are kept
//! beside the block table.
//!
//! Offsets handed out are block table slots, not byte addresses.

use alloc::{boxed::Box, vec, vec::Vec};
use core::{ops::Range, panic::Location};

use dataview::{DataView, Pod};

use crate::{
    allocator::{Allocator, Capabilities, Stats},
    blob::{Blob, Offset},
    config::{Config, IntegrityPolicy},
    error::MemoryError,
};

/// First bytes of every block header.
pub const SIGNATURE: [u8; 4] = *b"YBLK";
/// Last bytes of every block header, directly in front of the payload.
pub const HEADER_SENTINEL: [u8; 4] = *b"CODE";
/// Bytes written directly behind the payload.
pub const FOOTER_SENTINEL: [u8; 16] = *b"CODECODECODECODE";
pub const HEADER_SIZE: usize = size_of::<DebugHeader>();
pub const FOOTER_SIZE: usize = FOOTER_SENTINEL.len();

const NONE: u32 = u32::MAX;

const STATE_INVALID: u32 = 0;
const STATE_ALLOCATED: u32 = 1;
const STATE_FREE: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct DebugHeader {
    signature: [u8; 4],
    state: u32,
    size: u64,
    prev: u32,
    next: u32,
    line: u32,
    sentinel: [u8; 4],
}
const _: () = assert!(HEADER_SIZE == 32);

fn state_name(state: u32) -> &'static str {
    match state {
        STATE_INVALID => "invalid",
        STATE_ALLOCATED => "allocated",
        STATE_FREE => "free",
        _ => "unknown",
    }
}

/// Who asked for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub file: &'static str,
    pub line: u32,
    /// Label passed to [`DebugAllocator::allocate_in`], or `"<unknown>"`.
    pub function: &'static str,
    /// Subsystem the block is charged to.
    pub system: &'static str,
}

/// Leak-tracking allocator with guarded headers and footers.
///
/// Unlike the arena allocators, integrity failures panic by default in every
/// build profile.
pub struct DebugAllocator {
    config: Config,
    /// Live blocks, or header-only tombstones of freed blocks.
    blocks: Vec<Option<Box<[u8]>>>,
    provenance: Vec<Option<Provenance>>,
    vacant: Vec<u32>,
    head: u32,
    tail: u32,
    stats: Stats,
}

impl Default for DebugAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugAllocator {
    /// ```
    /// use bedrock_memory::{Allocator as _, DebugAllocator};
    ///
    /// let mut debug = DebugAllocator::new();
    /// let blob = debug.allocate_in(48, "load_level", "streaming").unwrap();
    /// assert_eq!(debug.print_block_list(true), 1);
    /// debug.deallocate(blob)?;
    /// assert_eq!(debug.print_block_list(false), 0);
    /// # Ok::<(), bedrock_memory::MemoryError>(())
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config {
            integrity: IntegrityPolicy::Panic,
            record_provenance: true,
        })
    }

    /// Creates an allocator with an explicit policy.
    ///
    /// With `record_provenance` unset, only the allocating line survives in
    /// the block header and [`DebugAllocator::provenance`] returns `None`.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            provenance: Vec::new(),
            vacant: Vec::new(),
            head: NONE,
            tail: NONE,
            stats: Stats::default(),
        }
    }

    const NAME: &'static str = "debug";

    /// Allocates `size` bytes, tagging the block with the caller's location
    /// plus a function and subsystem label.
    #[track_caller]
    pub fn allocate_in(
        &mut self,
        size: usize,
        function: &'static str,
        system: &'static str,
    ) -> Option<Blob> {
        let location = Location::caller();
        let Some(total) = size
            .checked_add(HEADER_SIZE + FOOTER_SIZE)
            .filter(|&total| isize::try_from(total).is_ok())
        else {
            self.stats.record_failure();
            return None;
        };

        let slot = match self.vacant.pop() {
            Some(slot) => slot,
            None => {
                let Some(slot) = u32::try_from(self.blocks.len()).ok().filter(|&s| s != NONE)
                else {
                    self.stats.record_failure();
                    return None;
                };
                self.blocks.push(None);
                self.provenance.push(None);
                slot
            }
        };

        let mut buf = vec![0u8; total].into_boxed_slice();
        let header = DebugHeader {
            signature: SIGNATURE,
            state: STATE_ALLOCATED,
            size: size as u64,
            prev: self.tail,
            next: NONE,
            line: location.line(),
            sentinel: HEADER_SENTINEL,
        };
        DataView::from_mut(&mut buf[..HEADER_SIZE]).write(0, &header);
        buf[HEADER_SIZE + size..].copy_from_slice(&FOOTER_SENTINEL);

        self.blocks[slot as usize] = Some(buf);
        self.provenance[slot as usize] = self.config.record_provenance.then_some(Provenance {
            file: location.file(),
            line: location.line(),
            function,
            system,
        });
        if self.tail == NONE {
            self.head = slot;
        } else {
            self.update_header(self.tail, |h| h.next = slot);
        }
        self.tail = slot;

        self.stats.record_alloc(size);
        trace!("{}: {size} bytes in slot {slot} for {system}/{function}", Self::NAME);
        Some(Blob::new(Offset::new(slot as usize), size))
    }

    /// Allocates `size` bytes on behalf of `system`, without a function label.
    #[track_caller]
    pub fn allocate_tracked(&mut self, size: usize, system: &'static str) -> Option<Blob> {
        self.allocate_in(size, "<unknown>", system)
    }

    /// Frees `blob`, naming the function and subsystem that free it.
    ///
    /// # Errors
    ///
    /// Any integrity failure is wrapped in [`MemoryError::InvalidFree`],
    /// whose location is the caller of this method. The block stays
    /// allocated.
    #[track_caller]
    pub fn deallocate_in(
        &mut self,
        blob: Blob,
        function: &'static str,
        system: &'static str,
    ) -> Result<(), MemoryError> {
        match self.release(blob) {
            Ok(size) => {
                self.stats.record_free(size);
                trace!("{}: freed slot {} for {system}/{function}", Self::NAME, blob.offset);
                Ok(())
            }
            Err(err) => Err(self.fail(MemoryError::invalid_free(function, system, err))),
        }
    }

    /// Returns the provenance recorded for a live block.
    #[must_use]
    pub fn provenance(&self, blob: Blob) -> Option<Provenance> {
        self.live_header(blob)?;
        *self.provenance.get(blob.offset.get())?
    }

    /// Counts the blocks still allocated, logging each with its provenance
    /// when `do_print` is set.
    pub fn print_block_list(&self, do_print: bool) -> usize {
        let mut count = 0;
        let mut slot = self.head;
        while slot != NONE && count < self.blocks.len() {
            let Some(header) = self.header(slot) else {
                break;
            };
            if header.state == STATE_ALLOCATED {
                count += 1;
                if do_print {
                    self.print_block(slot, &header);
                }
            }
            slot = header.next;
        }
        if do_print {
            info!("{}: {count} blocks allocated", Self::NAME);
        }
        count
    }

    fn print_block(&self, slot: u32, header: &DebugHeader) {
        match self.provenance[slot as usize] {
            Some(p) => info!(
                "{}: slot {slot}: {} bytes from {}:{} in {} [{}]",
                Self::NAME,
                header.size,
                p.file,
                p.line,
                p.function,
                p.system
            ),
            None => info!(
                "{}: slot {slot}: {} bytes from line {}",
                Self::NAME,
                header.size,
                header.line
            ),
        }
    }

    /// Verifies the guards and links of every live block.
    ///
    /// Returns the number of live blocks.
    pub fn check_integrity(&self) -> Result<usize, MemoryError> {
        self.walk().map_err(|err| self.fail(err))
    }

    fn walk(&self) -> Result<usize, MemoryError> {
        let mut count = 0;
        let mut prev = NONE;
        let mut slot = self.head;
        while slot != NONE {
            let offset = Offset::new(slot as usize);
            if count >= self.blocks.len() {
                return Err(MemoryError::inconsistent(offset, "block list loops"));
            }
            let header = self.verify(slot)?;
            if header.state != STATE_ALLOCATED {
                return Err(MemoryError::unexpected_state(
                    offset,
                    state_name(header.state),
                    state_name(STATE_ALLOCATED),
                ));
            }
            if header.prev != prev {
                return Err(MemoryError::inconsistent(offset, "block list back link is broken"));
            }
            count += 1;
            prev = slot;
            slot = header.next;
        }
        if prev != self.tail {
            return Err(MemoryError::inconsistent(
                Offset::new(prev as usize),
                "block list does not end at its tail",
            ));
        }
        if count != self.stats.live_allocations {
            return Err(MemoryError::inconsistent(
                Offset::new(self.head as usize),
                "block list length differs from the live allocation count",
            ));
        }
        Ok(count)
    }

    /// Checks the signature and both sentinels of a block.
    fn verify(&self, slot: u32) -> Result<DebugHeader, MemoryError> {
        let offset = Offset::new(slot as usize);
        let buf = self
            .blocks
            .get(slot as usize)
            .and_then(Option::as_deref)
            .ok_or_else(|| MemoryError::not_owned(offset))?;
        let header: DebugHeader = DataView::from(&buf[..HEADER_SIZE]).read(0);
        if header.signature != SIGNATURE {
            return Err(MemoryError::corrupted_cookie(
                "signature",
                offset,
                u32::from_le_bytes(SIGNATURE).into(),
                u32::from_le_bytes(header.signature).into(),
            ));
        }
        if header.sentinel != HEADER_SENTINEL {
            return Err(MemoryError::corrupted_cookie(
                "header sentinel",
                offset,
                u32::from_le_bytes(HEADER_SENTINEL).into(),
                u32::from_le_bytes(header.sentinel).into(),
            ));
        }
        if header.state != STATE_ALLOCATED {
            return Ok(header);
        }

        let footer = usize::try_from(header.size)
            .ok()
            .and_then(|size| buf.get(HEADER_SIZE + size..))
            .filter(|footer| footer.len() == FOOTER_SIZE)
            .ok_or_else(|| MemoryError::inconsistent(offset, "block size exceeds its buffer"))?;
        for (found, expected) in footer.chunks_exact(8).zip(FOOTER_SENTINEL.chunks_exact(8)) {
            if found != expected {
                let as_u64 = |bytes: &[u8]| {
                    let mut word = [0; 8];
                    word.copy_from_slice(bytes);
                    u64::from_le_bytes(word)
                };
                return Err(MemoryError::corrupted_cookie(
                    "footer sentinel",
                    offset,
                    as_u64(expected),
                    as_u64(found),
                ));
            }
        }
        Ok(header)
    }

    fn header(&self, slot: u32) -> Option<DebugHeader> {
        let buf = self.blocks.get(slot as usize)?.as_deref()?;
        Some(DataView::from(&buf[..HEADER_SIZE]).read(0))
    }

    fn update_header(&mut self, slot: u32, f: impl FnOnce(&mut DebugHeader)) {
        if let Some(buf) = self.blocks[slot as usize].as_deref_mut() {
            let view = DataView::from_mut(&mut buf[..HEADER_SIZE]);
            let mut header: DebugHeader = view.read(0);
            f(&mut header);
            view.write(0, &header);
        }
    }

    fn live_header(&self, blob: Blob) -> Option<DebugHeader> {
        let slot = u32::try_from(blob.offset.get()).ok()?;
        let header = self.header(slot)?;
        (header.state == STATE_ALLOCATED && blob.size as u64 <= header.size).then_some(header)
    }

    fn payload_range(&self, blob: Blob) -> Option<Range<usize>> {
        self.live_header(blob)?;
        Some(HEADER_SIZE..HEADER_SIZE + blob.size)
    }

    fn release(&mut self, blob: Blob) -> Result<usize, MemoryError> {
        let offset = blob.offset;
        let slot = u32::try_from(offset.get())
            .ok()
            .ok_or_else(|| MemoryError::not_owned(offset))?;
        let header = self.verify(slot)?;
        if header.state != STATE_ALLOCATED {
            return Err(MemoryError::unexpected_state(
                offset,
                state_name(header.state),
                state_name(STATE_ALLOCATED),
            ));
        }
        let size = usize::try_from(header.size)
            .ok()
            .ok_or_else(|| MemoryError::inconsistent(offset, "block size exceeds its buffer"))?;

        if header.prev == NONE {
            self.head = header.next;
        } else {
            self.update_header(header.prev, |h| h.next = header.next);
        }
        if header.next == NONE {
            self.tail = header.prev;
        } else {
            self.update_header(header.next, |h| h.prev = header.prev);
        }

        // Keep a header-only tombstone so a second free is recognized.
        let mut tombstone = vec![0u8; HEADER_SIZE].into_boxed_slice();
        let freed = DebugHeader {
            state: STATE_FREE,
            prev: NONE,
            next: NONE,
            ..header
        };
        DataView::from_mut(&mut tombstone[..]).write(0, &freed);
        self.blocks[slot as usize] = Some(tombstone);
        self.provenance[slot as usize] = None;
        self.vacant.push(slot);
        Ok(size)
    }

    fn fail(&self, err: MemoryError) -> MemoryError {
        self.config.integrity.fail(Self::NAME, err)
    }
}

impl Allocator for DebugAllocator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            leak_check: true,
            corruption_check: true,
            alignment: 1,
            ..Capabilities::default()
        }
    }

    #[track_caller]
    fn allocate(&mut self, size: usize) -> Option<Blob> {
        self.allocate_tracked(size, "general")
    }

    #[track_caller]
    fn deallocate(&mut self, blob: Blob) -> Result<(), MemoryError> {
        self.deallocate_in(blob, "<unknown>", "general")
    }

    fn owns(&self, blob: Blob) -> bool {
        self.live_header(blob).is_some()
    }

    fn stats(&self) -> Stats {
        self.stats
    }

    fn bytes(&self, blob: Blob) -> Option<&[u8]> {
        let range = self.payload_range(blob)?;
        Some(&self.blocks[blob.offset.get()].as_deref()?[range])
    }

    fn bytes_mut(&mut self, blob: Blob) -> Option<&mut [u8]> {
        let range = self.payload_range(blob)?;
        Some(&mut self.blocks[blob.offset.get()].as_deref_mut()?[range])
    }
}

impl Drop for DebugAllocator {
    fn drop(&mut self) {
        let leaked = self.print_block_list(false);
        if leaked > 0 {
            warn!("{}: {leaked} blocks leaked", Self::NAME);
            self.print_block_list(true);
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    fn reporting() -> DebugAllocator {
        DebugAllocator::with_config(Config {
            integrity: IntegrityPolicy::Report,
            record_provenance: true,
        })
    }

    fn filled(debug: &mut DebugAllocator, size: usize) -> Blob {
        let blob = debug.allocate_in(size, "filled", "test").unwrap();
        debug.bytes_mut(blob).unwrap().fill(0x33);
        blob
    }

    fn raw(debug: &mut DebugAllocator, blob: Blob) -> &mut [u8] {
        debug.blocks[blob.offset.get()].as_deref_mut().unwrap()
    }

    #[test]
    fn test_allocate_and_free() {
        let mut debug = reporting();
        let blobs: Vec<_> = (1..=20).map(|size| filled(&mut debug, size * 7)).collect();
        assert_eq!(debug.check_integrity().unwrap(), 20);
        for (i, &blob) in blobs.iter().enumerate() {
            if i % 2 == 0 {
                assert!(debug.bytes(blob).unwrap().iter().all(|&b| b == 0x33));
                debug.deallocate(blob).unwrap();
            }
        }
        assert_eq!(debug.print_block_list(false), 10);
        assert_eq!(debug.check_integrity().unwrap(), 10);
        for &blob in blobs.iter().skip(1).step_by(2) {
            debug.deallocate(blob).unwrap();
        }
        assert_eq!(debug.print_block_list(true), 0);
        assert_eq!(debug.stats().allocated_bytes, 0);
    }

    #[test]
    fn test_provenance_recorded() {
        let mut debug = reporting();
        let blob = debug.allocate_in(16, "spawn_actor", "gameplay").unwrap();
        let line = line!() - 1;
        let provenance = debug.provenance(blob).unwrap();
        assert_eq!(provenance.file, file!());
        assert_eq!(provenance.line, line);
        assert_eq!(provenance.function, "spawn_actor");
        assert_eq!(provenance.system, "gameplay");
        debug.deallocate(blob).unwrap();
        assert!(debug.provenance(blob).is_none());
    }

    #[test]
    fn test_tracked_allocation_keeps_caller() {
        let mut debug = reporting();
        let blob = debug.allocate(8).unwrap();
        let line = line!() - 1;
        let provenance = debug.provenance(blob).unwrap();
        assert_eq!(provenance.line, line);
        assert_eq!(provenance.system, "general");
        let blob2 = debug.allocate_tracked(8, "audio").unwrap();
        assert_eq!(debug.provenance(blob2).unwrap().system, "audio");
        debug.deallocate(blob).unwrap();
        debug.deallocate(blob2).unwrap();
    }

    #[test]
    fn test_footer_overrun_detected() {
        let mut debug = reporting();
        let blob = filled(&mut debug, 10);
        raw(&mut debug, blob)[HEADER_SIZE + 10] = 0;
        assert!(debug.check_integrity().is_err());
        let err = debug.deallocate(blob).unwrap_err();
        assert!(matches!(
            err.cause(),
            MemoryError::CorruptedCookie {
                field: "footer sentinel",
                ..
            }
        ));
        raw(&mut debug, blob)[HEADER_SIZE + 10] = b'C';
        debug.deallocate(blob).unwrap();
    }

    #[test]
    fn test_header_underrun_detected() {
        let mut debug = reporting();
        let blob = filled(&mut debug, 10);
        raw(&mut debug, blob)[HEADER_SIZE - 1] = 0;
        let err = debug.deallocate(blob).unwrap_err();
        assert!(matches!(
            err.cause(),
            MemoryError::CorruptedCookie {
                field: "header sentinel",
                ..
            }
        ));
        raw(&mut debug, blob)[HEADER_SIZE - 1] = b'E';
        debug.deallocate(blob).unwrap();
    }

    #[test]
    fn test_signature_checked() {
        let mut debug = reporting();
        let blob = filled(&mut debug, 10);
        raw(&mut debug, blob)[0] = b'X';
        let err = debug.check_integrity().unwrap_err();
        assert!(matches!(
            err,
            MemoryError::CorruptedCookie {
                field: "signature",
                ..
            }
        ));
        raw(&mut debug, blob)[0] = b'Y';
        debug.deallocate(blob).unwrap();
    }

    #[test]
    #[should_panic(expected = "debug: integrity failure")]
    fn test_corruption_is_fatal_by_default() {
        let mut debug = DebugAllocator::new();
        let blob = debug.allocate(4).unwrap();
        debug.bytes_mut(blob).unwrap().fill(0);
        raw(&mut debug, blob)[HEADER_SIZE + 4] = 0;
        let _ = debug.deallocate(blob);
    }

    #[test]
    fn test_double_free_detected() {
        let mut debug = reporting();
        let blob = filled(&mut debug, 32);
        debug.deallocate(blob).unwrap();
        let err = debug.deallocate(blob).unwrap_err();
        assert!(matches!(
            err.cause(),
            MemoryError::UnexpectedState {
                state: "free",
                ..
            }
        ));
        assert!(!debug.owns(blob));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut debug = reporting();
        let a = filled(&mut debug, 8);
        let b = filled(&mut debug, 8);
        debug.deallocate(a).unwrap();
        let c = filled(&mut debug, 100);
        assert_eq!(c.offset, a.offset);
        assert_eq!(debug.check_integrity().unwrap(), 2);
        debug.deallocate(b).unwrap();
        debug.deallocate(c).unwrap();
    }

    #[test]
    fn test_foreign_blob_rejected() {
        let mut debug = reporting();
        let err = debug.deallocate(Blob::new(Offset::new(3), 1)).unwrap_err();
        assert!(matches!(err.cause(), MemoryError::NotOwned { .. }));
    }

    #[test]
    fn test_free_site_reported() {
        let mut debug = reporting();
        let blob = filled(&mut debug, 24);
        raw(&mut debug, blob)[HEADER_SIZE + 24 + 3] ^= 0xff;

        let err = debug.deallocate_in(blob, "unload_level", "streaming").unwrap_err();
        let line = line!() - 1;
        let MemoryError::InvalidFree {
            function,
            system,
            ref source,
            location,
        } = err
        else {
            panic!("unexpected error: {err}");
        };
        assert_eq!((function, system), ("unload_level", "streaming"));
        assert_eq!((location.file(), location.line()), (file!(), line));
        assert!(matches!(
            **source,
            MemoryError::CorruptedCookie {
                field: "footer sentinel",
                ..
            }
        ));
        assert!(err.is_corruption());
        assert!(err.to_string().starts_with("invalid free in unload_level [streaming]"));

        // The block stays live and reports where it came from.
        assert_eq!(debug.provenance(blob).unwrap().function, "filled");
        raw(&mut debug, blob)[HEADER_SIZE + 24 + 3] ^= 0xff;
        debug.deallocate_in(blob, "unload_level", "streaming").unwrap();
        assert_eq!(debug.stats().live_allocations, 0);
    }

    #[test]
    fn test_plain_free_site_is_caller() {
        let mut debug = reporting();
        let blob = filled(&mut debug, 8);
        debug.deallocate(blob).unwrap();
        let err = debug.deallocate(blob).unwrap_err();
        assert_eq!(err.location().line(), line!() - 1);
        assert!(matches!(
            err,
            MemoryError::InvalidFree {
                function: "<unknown>",
                system: "general",
                ..
            }
        ));
    }

    #[test]
    fn test_reset_unsupported() {
        let mut debug = reporting();
        assert!(matches!(
            debug.reset().unwrap_err(),
            MemoryError::Unsupported { .. }
        ));
    }
}
