//! Best-fit free-list allocator over one fixed arena.
//!
//! The arena is divided into 64-byte units. Every block starts with a
//! one-unit [`BlockHeader`] followed by its payload, so payloads are always
//! unit aligned relative to the start of the region. Two zero-size sentinel
//! blocks bound the arena, which lets coalescing look at both neighbors of any
//! block without special-casing the ends.
//!
//! ```text
//! unit:  0          1          2 ..                    n-1
//!        ┌──────────┬──────────┬──────────────────────┬──────────┐
//!        │ sentinel │ header   │ payload (size units) │ sentinel │
//!        └──────────┴──────────┴──────────────────────┴──────────┘
//! ```
//!
//! Each header records the payload size of the block before it
//! (`neighbor_size`), so the left neighbor of a block is found in O(1), and
//! the right neighbor is simply `unit + 1 + size`. Free blocks form a doubly
//! linked list threaded through their headers.
//!
//! # Algorithm
//!
//! - **Allocation**: best fit over the free list; among equally sized
//!   candidates the lowest address wins. A block larger than the request by
//!   more than [`SMALLEST_USEFUL_SIZE`] is split and the remainder goes back
//!   on the free list. A smaller non-zero remainder becomes a *wastage* block
//!   that no allocation can use until a neighbor is freed.
//! - **Deallocation**: the block is merged with its immediate right and left
//!   neighbors if they are free or wastage. No further scanning happens.

use alloc::string::String;
use core::{fmt, ops::Range, panic::Location};

use dataview::{DataView, Pod};

use crate::{
    allocator::{Allocator, Capabilities, Stats},
    blob::{Blob, Offset},
    config::Config,
    error::MemoryError,
    region::Region,
};

/// Size of the allocation unit and of a block header, in bytes.
pub const ALIGNMENT: usize = 64;

/// Remainders up to this many bytes are not split off into free blocks.
pub const SMALLEST_USEFUL_SIZE: usize = 2 * ALIGNMENT;

/// Smallest region that can hold two sentinels and one usable block.
pub const MIN_REGION_SIZE: usize = 4 * ALIGNMENT;

const SMALLEST_USEFUL_UNITS: u32 = 2;
const _: () = assert!(SMALLEST_USEFUL_UNITS as usize * ALIGNMENT == SMALLEST_USEFUL_SIZE);

const COOKIE1: u32 = 0xB10C_C0DE;
const COOKIE2: u64 = 0xC0DE_B10C_5EA1_ED00;

/// Free-list terminator.
const NONE: u32 = u32::MAX;

const ORIGIN_LEN: usize = 24;

/// State of a block in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum BlockState {
    Free,
    Allocated,
    /// Too small to be useful; absorbed when a neighbor is freed.
    Wastage,
    /// Zero-size block bounding the arena.
    Sentinel,
}

impl BlockState {
    const fn to_raw(self) -> u32 {
        match self {
            Self::Free => 0x4652_4545,
            Self::Allocated => 0x414c_4c4f,
            Self::Wastage => 0x5741_5354,
            Self::Sentinel => 0x5345_4e54,
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        [Self::Free, Self::Allocated, Self::Wastage, Self::Sentinel]
            .into_iter()
            .find(|state| state.to_raw() == raw)
    }

    /// Lowercase name used in reports and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Allocated => "allocated",
            Self::Wastage => "wastage",
            Self::Sentinel => "sentinel",
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata stored in the unit immediately preceding every payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct BlockHeader {
    cookie1: u32,
    state: u32,
    /// Payload size in units.
    size: u32,
    /// Payload size of the preceding block, in units.
    neighbor_size: u32,
    next_free: u32,
    prev_free: u32,
    line: u32,
    reserved: u32,
    /// Tail of the allocating caller's file path, NUL padded.
    origin: [u8; ORIGIN_LEN],
    cookie2: u64,
}
const _: () = assert!(size_of::<BlockHeader>() == ALIGNMENT);

impl BlockHeader {
    fn new(state: BlockState, size: u32, neighbor_size: u32) -> Self {
        Self {
            cookie1: COOKIE1,
            state: state.to_raw(),
            size,
            neighbor_size,
            next_free: NONE,
            prev_free: NONE,
            line: 0,
            reserved: 0,
            origin: [0; ORIGIN_LEN],
            cookie2: COOKIE2,
        }
    }

    fn record_origin(&mut self, location: &Location<'_>) {
        let file = location.file();
        let mut start = file.len().saturating_sub(ORIGIN_LEN);
        while !file.is_char_boundary(start) {
            start += 1;
        }
        let tail = &file.as_bytes()[start..];
        self.origin = [0; ORIGIN_LEN];
        self.origin[..tail.len()].copy_from_slice(tail);
        self.line = location.line();
    }

    fn origin(&self) -> &str {
        let len = self
            .origin
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ORIGIN_LEN);
        core::str::from_utf8(&self.origin[..len]).unwrap_or("<invalid>")
    }
}

/// Block census produced by [`SlowGeneralPurpose::internal_sanity_check`].
///
/// `free_bytes + allocated_bytes + wastage_bytes + header_bytes` always equals
/// the arena size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SanityReport {
    /// Blocks in the chain, sentinels included.
    pub blocks: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub wastage_blocks: usize,
    /// Payload bytes of free blocks, excluding headers.
    pub free_bytes: usize,
    /// Payload bytes of allocated blocks, rounded up to whole units.
    pub allocated_bytes: usize,
    pub wastage_bytes: usize,
    /// One unit per block, sentinels included.
    pub header_bytes: usize,
    /// Payload bytes of the largest free block; the biggest request that can
    /// currently succeed.
    pub largest_free_bytes: usize,
}

impl SanityReport {
    /// Total bytes accounted for by the census.
    #[must_use]
    pub fn accounted_bytes(&self) -> usize {
        self.free_bytes + self.allocated_bytes + self.wastage_bytes + self.header_bytes
    }
}

/// General-purpose allocator with cookies and coalescing over one arena.
///
/// # Thread Safety
///
/// Not thread-safe. Concurrent callers must hold a lock around every call;
/// see [`Synchronized`](crate::Synchronized).
pub struct SlowGeneralPurpose<'a> {
    name: String,
    region: Region<'a>,
    config: Config,
    /// Number of whole units in the region.
    units: u32,
    free_head: u32,
    stats: Stats,
}

impl<'a> SlowGeneralPurpose<'a> {
    /// Carves `region` into a single free block bounded by two sentinels.
    ///
    /// `name` identifies the instance in reports. Trailing bytes that do not
    /// form a whole unit are left unused.
    ///
    /// ```
    /// use bedrock_memory::{Allocator as _, Region, SlowGeneralPurpose};
    ///
    /// let mut arena = vec![0u8; 4096];
    /// let mut heap = SlowGeneralPurpose::new("scratch", Region::new(&mut arena))?;
    /// let blob = heap.allocate(100).unwrap();
    /// heap.deallocate(blob)?;
    /// assert_eq!(heap.internal_sanity_check(true, false)?.free_blocks, 1);
    /// # Ok::<(), bedrock_memory::MemoryError>(())
    /// ```
    pub fn new(name: impl Into<String>, region: Region<'a>) -> Result<Self, MemoryError> {
        Self::with_config(name, region, Config::default())
    }

    /// Like [`SlowGeneralPurpose::new`], with an explicit [`Config`].
    ///
    /// # Errors
    ///
    /// - [`MemoryError::RegionTooSmall`] if `region` is shorter than
    ///   [`MIN_REGION_SIZE`].
    /// - [`MemoryError::RegionTooLarge`] if its unit count does not fit a
    ///   header link.
    pub fn with_config(
        name: impl Into<String>,
        region: Region<'a>,
        config: Config,
    ) -> Result<Self, MemoryError> {
        if region.len() < MIN_REGION_SIZE {
            return Err(MemoryError::region_too_small(region.len(), MIN_REGION_SIZE));
        }
        let Some(units) = u32::try_from(region.len() / ALIGNMENT)
            .ok()
            .filter(|&units| units != NONE)
        else {
            return Err(MemoryError::region_too_large(
                region.len(),
                (NONE as usize - 1) * ALIGNMENT,
            ));
        };

        let mut this = Self {
            name: name.into(),
            region,
            config,
            units,
            free_head: NONE,
            stats: Stats {
                capacity_bytes: Some((units as usize - 3) * ALIGNMENT),
                ..Stats::default()
            },
        };
        this.carve();
        Ok(this)
    }

    fn carve(&mut self) {
        let last = self.units - 1;
        let free_size = self.units - 3;
        self.write_header(0, &BlockHeader::new(BlockState::Sentinel, 0, 0));
        self.write_header(1, &BlockHeader::new(BlockState::Free, free_size, 0));
        self.write_header(
            last,
            &BlockHeader::new(BlockState::Sentinel, 0, free_size),
        );
        self.free_head = NONE;
        self.push_free(1);
        debug!(
            "{}: carved {} units, {} usable bytes",
            self.name,
            self.units,
            free_size as usize * ALIGNMENT
        );
    }

    /// Returns `true` if `blob` lies within the arena's payload area and
    /// starts on a unit boundary.
    #[must_use]
    pub fn owns_range(&self, blob: Blob) -> bool {
        self.header_unit(blob.offset).is_some()
            && blob
                .offset
                .get()
                .checked_add(blob.size)
                .is_some_and(|end| end <= (self.units as usize - 1) * ALIGNMENT)
    }

    /// Walks the whole block chain and verifies its invariants.
    ///
    /// Checked: cookies of every header, `neighbor_size` against the actual
    /// preceding block, free-list links and membership against block states,
    /// that no free block touches another free or wastage block, and that the
    /// blocks exactly cover the arena.
    ///
    /// With `report_leaks`, every allocated block is logged as a potential
    /// leak together with the file and line that allocated it. With
    /// `report_all_blocks`, every block is logged.
    pub fn internal_sanity_check(
        &self,
        report_leaks: bool,
        report_all_blocks: bool,
    ) -> Result<SanityReport, MemoryError> {
        self.census(report_leaks, report_all_blocks)
            .map_err(|err| self.config.integrity.fail(&self.name, err))
    }

    fn census(
        &self,
        report_leaks: bool,
        report_all_blocks: bool,
    ) -> Result<SanityReport, MemoryError> {
        let listed = self.walk_free_list()?;

        let mut report = SanityReport::default();
        let first = self.checked_header(0)?;
        if BlockState::from_raw(first.state) != Some(BlockState::Sentinel) || first.size != 0 {
            return Err(MemoryError::inconsistent(
                Self::payload_offset(0),
                "arena does not start with a sentinel",
            ));
        }
        report.blocks = 1;
        report.header_bytes = ALIGNMENT;

        let last = self.units - 1;
        let mut unit = 0;
        let mut prev = first;
        let mut prev_state = BlockState::Sentinel;
        while unit != last {
            let next_unit = unit
                .checked_add(1 + prev.size)
                .filter(|&next| next <= last)
                .ok_or_else(|| {
                    MemoryError::inconsistent(
                        Self::payload_offset(unit),
                        "block runs past the end of the arena",
                    )
                })?;
            let header = self.checked_header(next_unit)?;
            let state = Self::state_of(next_unit, &header)?;
            let offset = Self::payload_offset(next_unit);

            if header.neighbor_size != prev.size {
                return Err(MemoryError::neighbor_size_mismatch(
                    offset,
                    header.neighbor_size,
                    prev.size,
                ));
            }
            match (prev_state, state) {
                (BlockState::Free, BlockState::Free | BlockState::Wastage)
                | (BlockState::Wastage, BlockState::Free) => {
                    return Err(MemoryError::uncoalesced_free(
                        Self::payload_offset(unit),
                        offset,
                    ));
                }
                (BlockState::Wastage | BlockState::Sentinel, BlockState::Wastage) => {
                    return Err(MemoryError::inconsistent(
                        offset,
                        "wastage block does not follow an allocated block",
                    ));
                }
                _ => {}
            }
            if state.is_sentinel() != (next_unit == last) {
                return Err(MemoryError::inconsistent(
                    offset,
                    "sentinel placement does not match the arena bounds",
                ));
            }

            let bytes = header.size as usize * ALIGNMENT;
            match state {
                BlockState::Free => {
                    report.free_blocks += 1;
                    report.free_bytes += bytes;
                    report.largest_free_bytes = report.largest_free_bytes.max(bytes);
                }
                BlockState::Allocated => {
                    report.allocated_blocks += 1;
                    report.allocated_bytes += bytes;
                    if report_leaks {
                        warn!(
                            "{}: potential leak of {bytes} bytes at {offset}, allocated at {}:{}",
                            self.name,
                            header.origin(),
                            header.line
                        );
                    }
                }
                BlockState::Wastage => {
                    report.wastage_blocks += 1;
                    report.wastage_bytes += bytes;
                }
                BlockState::Sentinel => {}
            }
            if report_all_blocks {
                info!(
                    "{}: {offset} {state} size={bytes} neighbor={}",
                    self.name,
                    header.neighbor_size as usize * ALIGNMENT
                );
            }

            report.blocks += 1;
            report.header_bytes += ALIGNMENT;
            unit = next_unit;
            prev = header;
            prev_state = state;
        }

        if report.accounted_bytes() != self.units as usize * ALIGNMENT {
            return Err(MemoryError::inconsistent(
                Self::payload_offset(last),
                "block sizes do not add up to the arena size",
            ));
        }
        if report.free_blocks != listed {
            return Err(MemoryError::inconsistent(
                Self::payload_offset(self.free_head.min(last)),
                "free list length differs from the number of free blocks",
            ));
        }

        if report_leaks && report.allocated_blocks > 0 {
            warn!(
                "{}: {} blocks ({} bytes) still allocated",
                self.name, report.allocated_blocks, report.allocated_bytes
            );
        }
        Ok(report)
    }

    /// Follows the free list, checking links and states. Returns its length.
    fn walk_free_list(&self) -> Result<usize, MemoryError> {
        let mut listed = 0;
        let mut prev = NONE;
        let mut unit = self.free_head;
        while unit != NONE {
            if listed >= self.units as usize || !self.in_arena(unit) {
                return Err(MemoryError::inconsistent(
                    Self::payload_offset(prev.min(self.units - 1)),
                    "free list leaves the arena or loops",
                ));
            }
            let header = self.checked_header(unit)?;
            if BlockState::from_raw(header.state) != Some(BlockState::Free) {
                return Err(MemoryError::inconsistent(
                    Self::payload_offset(unit),
                    "non-free block linked into the free list",
                ));
            }
            if header.prev_free != prev {
                return Err(MemoryError::inconsistent(
                    Self::payload_offset(unit),
                    "free list back link is broken",
                ));
            }
            listed += 1;
            prev = unit;
            unit = header.next_free;
        }
        Ok(listed)
    }

    /// Picks the smallest free block of at least `units` units, lowest
    /// address first among equals.
    fn find_suitable_free_block(&self, units: u32) -> Result<Option<u32>, MemoryError> {
        let mut best: Option<(u32, u32)> = None;
        let mut unit = self.free_head;
        let mut steps = 0;
        while unit != NONE {
            steps += 1;
            if steps > self.units {
                return Err(MemoryError::inconsistent(
                    Self::payload_offset(unit.min(self.units - 1)),
                    "free list loops",
                ));
            }
            let header = self.checked_header(unit)?;
            self.check_links(unit, &header)?;
            if header.size >= units && best.is_none_or(|candidate| (header.size, unit) < candidate)
            {
                best = Some((header.size, unit));
            }
            unit = header.next_free;
        }
        Ok(best.map(|(_, unit)| unit))
    }

    fn units_for(size: usize) -> Option<u32> {
        u32::try_from(size.div_ceil(ALIGNMENT).max(1)).ok()
    }

    #[track_caller]
    fn carve_allocation(&mut self, units: u32) -> Result<Option<u32>, MemoryError> {
        let Some(unit) = self.find_suitable_free_block(units)? else {
            return Ok(None);
        };
        let block = self.read_header(unit);
        self.remove_free(unit);

        let mut header = block;
        header.state = BlockState::Allocated.to_raw();
        header.next_free = NONE;
        header.prev_free = NONE;
        if self.config.record_provenance {
            header.record_origin(Location::caller());
        }

        let remainder = block.size - units;
        if remainder > 0 {
            let rest = unit + 1 + units;
            let rest_state = if remainder > SMALLEST_USEFUL_UNITS {
                BlockState::Free
            } else {
                BlockState::Wastage
            };
            header.size = units;
            self.write_header(unit, &header);
            self.write_header(rest, &BlockHeader::new(rest_state, remainder - 1, units));
            self.set_neighbor_size(unit + 1 + block.size, remainder - 1);
            if rest_state.is_free() {
                self.push_free(rest);
            }
        } else {
            self.write_header(unit, &header);
        }
        Ok(Some(unit))
    }

    fn release(&mut self, unit: u32) -> Result<u32, MemoryError> {
        let header = self.checked_header(unit)?;
        let state = Self::state_of(unit, &header)?;
        if !state.is_allocated() {
            return Err(MemoryError::unexpected_state(
                Self::payload_offset(unit),
                state.name(),
                BlockState::Allocated.name(),
            ));
        }

        let next_unit = unit
            .checked_add(1 + header.size)
            .filter(|&next| next < self.units)
            .ok_or_else(|| {
                MemoryError::inconsistent(
                    Self::payload_offset(unit),
                    "block runs past the end of the arena",
                )
            })?;
        let next = self.checked_header(next_unit)?;
        let next_state = Self::state_of(next_unit, &next)?;
        let prev_unit = unit.checked_sub(1 + header.neighbor_size).ok_or_else(|| {
            MemoryError::inconsistent(
                Self::payload_offset(unit),
                "neighbor size points before the arena",
            )
        })?;
        let prev = self.checked_header(prev_unit)?;
        let prev_state = Self::state_of(prev_unit, &prev)?;
        if prev.size != header.neighbor_size {
            return Err(MemoryError::neighbor_size_mismatch(
                Self::payload_offset(unit),
                header.neighbor_size,
                prev.size,
            ));
        }

        if next_state.is_free() {
            self.check_links(next_unit, &next)?;
        }
        if prev_state.is_free() {
            self.check_links(prev_unit, &prev)?;
        }

        let mut start = unit;
        let mut size = header.size;
        let mut neighbor_size = header.neighbor_size;
        if next_state.is_free() {
            self.remove_free(next_unit);
        }
        if next_state.is_free() || next_state.is_wastage() {
            size += 1 + next.size;
        }
        if prev_state.is_free() {
            self.remove_free(prev_unit);
        }
        if prev_state.is_free() || prev_state.is_wastage() {
            start = prev_unit;
            size += 1 + prev.size;
            neighbor_size = prev.neighbor_size;
        }

        self.write_header(start, &BlockHeader::new(BlockState::Free, size, neighbor_size));
        self.set_neighbor_size(start + 1 + size, size);
        self.push_free(start);
        Ok(header.size)
    }

    /// Returns `true` if `unit` can hold a non-sentinel header.
    fn in_arena(&self, unit: u32) -> bool {
        unit != 0 && unit < self.units - 1
    }

    /// Verifies that the free-list links of a free block stay inside the
    /// arena, so they can be followed by `remove_free`.
    fn check_links(&self, unit: u32, header: &BlockHeader) -> Result<(), MemoryError> {
        let valid = |link: u32| link == NONE || self.in_arena(link);
        if valid(header.next_free) && valid(header.prev_free) {
            Ok(())
        } else {
            Err(MemoryError::inconsistent(
                Self::payload_offset(unit),
                "free list link leaves the arena",
            ))
        }
    }

    fn push_free(&mut self, unit: u32) {
        let mut header = self.read_header(unit);
        header.prev_free = NONE;
        header.next_free = self.free_head;
        self.write_header(unit, &header);
        if self.free_head != NONE {
            let mut head = self.read_header(self.free_head);
            head.prev_free = unit;
            self.write_header(self.free_head, &head);
        }
        self.free_head = unit;
    }

    fn remove_free(&mut self, unit: u32) {
        let mut header = self.read_header(unit);
        if header.prev_free == NONE {
            self.free_head = header.next_free;
        } else {
            let mut prev = self.read_header(header.prev_free);
            prev.next_free = header.next_free;
            self.write_header(header.prev_free, &prev);
        }
        if header.next_free != NONE {
            let mut next = self.read_header(header.next_free);
            next.prev_free = header.prev_free;
            self.write_header(header.next_free, &next);
        }
        header.next_free = NONE;
        header.prev_free = NONE;
        self.write_header(unit, &header);
    }

    fn set_neighbor_size(&mut self, unit: u32, neighbor_size: u32) {
        let mut header = self.read_header(unit);
        header.neighbor_size = neighbor_size;
        self.write_header(unit, &header);
    }

    /// Maps a payload offset back to its header unit.
    fn header_unit(&self, offset: Offset) -> Option<u32> {
        let offset = offset.get();
        if !offset.is_multiple_of(ALIGNMENT) {
            return None;
        }
        let unit = u32::try_from(offset / ALIGNMENT).ok()?.checked_sub(1)?;
        (1..self.units - 1).contains(&unit).then_some(unit)
    }

    fn payload_offset(unit: u32) -> Offset {
        Offset::new((unit as usize + 1) * ALIGNMENT)
    }

    fn read_header(&self, unit: u32) -> BlockHeader {
        let start = unit as usize * ALIGNMENT;
        DataView::from(&self.region[start..start + ALIGNMENT]).read(0)
    }

    fn write_header(&mut self, unit: u32, header: &BlockHeader) {
        let start = unit as usize * ALIGNMENT;
        DataView::from_mut(&mut self.region[start..start + ALIGNMENT]).write(0, header);
    }

    fn checked_header(&self, unit: u32) -> Result<BlockHeader, MemoryError> {
        let header = self.read_header(unit);
        let offset = Self::payload_offset(unit);
        if header.cookie1 != COOKIE1 {
            return Err(MemoryError::corrupted_cookie(
                "cookie1",
                offset,
                COOKIE1.into(),
                header.cookie1.into(),
            ));
        }
        if header.cookie2 != COOKIE2 {
            return Err(MemoryError::corrupted_cookie(
                "cookie2",
                offset,
                COOKIE2,
                header.cookie2,
            ));
        }
        Ok(header)
    }

    fn state_of(unit: u32, header: &BlockHeader) -> Result<BlockState, MemoryError> {
        BlockState::from_raw(header.state).ok_or_else(|| {
            MemoryError::inconsistent(Self::payload_offset(unit), "unknown block state")
        })
    }

    /// Returns the payload range of a live allocation.
    fn payload_range(&self, blob: Blob) -> Option<Range<usize>> {
        let unit = self.header_unit(blob.offset)?;
        let header = self.checked_header(unit).ok()?;
        let live = BlockState::from_raw(header.state) == Some(BlockState::Allocated);
        (live && blob.size <= header.size as usize * ALIGNMENT).then(|| blob.range())
    }
}

impl Allocator for SlowGeneralPurpose<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aligned: true,
            supports_reset: true,
            leak_check: true,
            corruption_check: true,
            alignment: ALIGNMENT,
            max_allocation: self.stats.capacity_bytes,
            ..Capabilities::default()
        }
    }

    #[track_caller]
    fn allocate(&mut self, size: usize) -> Option<Blob> {
        let Some(units) = Self::units_for(size) else {
            self.stats.record_failure();
            return None;
        };
        match self.carve_allocation(units) {
            Ok(Some(unit)) => {
                self.stats.record_alloc(units as usize * ALIGNMENT);
                trace!("{}: allocated {size} bytes at unit {unit}", self.name);
                Some(Blob::new(Self::payload_offset(unit), size))
            }
            Ok(None) => {
                self.stats.record_failure();
                debug!("{}: no free block for {size} bytes", self.name);
                None
            }
            Err(err) => {
                self.stats.record_failure();
                let _ = self.config.integrity.fail(&self.name, err);
                None
            }
        }
    }

    fn deallocate(&mut self, blob: Blob) -> Result<(), MemoryError> {
        let Some(unit) = self.header_unit(blob.offset) else {
            return Err(self
                .config
                .integrity
                .fail(&self.name, MemoryError::not_owned(blob.offset)));
        };
        match self.release(unit) {
            Ok(units) => {
                self.stats.record_free(units as usize * ALIGNMENT);
                Ok(())
            }
            Err(err) => Err(self.config.integrity.fail(&self.name, err)),
        }
    }

    fn owns(&self, blob: Blob) -> bool {
        self.owns_range(blob)
    }

    fn reset(&mut self) -> Result<(), MemoryError> {
        self.carve();
        self.stats.clear_live();
        Ok(())
    }

    fn stats(&self) -> Stats {
        self.stats
    }

    fn bytes(&self, blob: Blob) -> Option<&[u8]> {
        let range = self.payload_range(blob)?;
        Some(&self.region[range])
    }

    fn bytes_mut(&mut self, blob: Blob) -> Option<&mut [u8]> {
        let range = self.payload_range(blob)?;
        Some(&mut self.region[range])
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    struct TestHeap<'a> {
        heap: SlowGeneralPurpose<'a>,
    }

    impl TestHeap<'_> {
        fn allocate(&mut self, size: usize) -> Option<Blob> {
            let blob = self.heap.allocate(size)?;
            self.heap.bytes_mut(blob).unwrap().fill(0x33);
            Some(blob)
        }

        fn deallocate(&mut self, blob: Blob) {
            assert!(self.heap.bytes(blob).unwrap().iter().all(|&b| b == 0x33));
            self.heap.bytes_mut(blob).unwrap().fill(0x55);
            self.heap.deallocate(blob).unwrap();
        }

        fn check(&self) -> SanityReport {
            let report = self.heap.internal_sanity_check(false, false).unwrap();
            assert_eq!(report.accounted_bytes(), self.heap.units as usize * ALIGNMENT);
            report
        }
    }

    fn with_test_heap<F>(arena_size: usize, test_fn: F)
    where
        F: FnOnce(&mut TestHeap<'_>),
    {
        let mut arena = vec![0x11u8; arena_size];
        let heap =
            SlowGeneralPurpose::with_config("test", Region::new(&mut arena), Config::reporting())
                .unwrap();
        test_fn(&mut TestHeap { heap });
    }

    #[test]
    fn test_fresh_arena() {
        with_test_heap(4096, |heap| {
            let report = heap.check();
            assert_eq!(report.blocks, 3);
            assert_eq!(report.free_blocks, 1);
            assert_eq!(report.largest_free_bytes, 61 * ALIGNMENT);
            assert_eq!(heap.heap.stats().capacity_bytes, Some(61 * ALIGNMENT));
        });
    }

    #[test]
    fn test_split_and_coalesce() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            assert!(!a.overlaps(&b));
            let report = heap.check();
            assert_eq!(report.allocated_blocks, 2);
            assert_eq!(report.free_blocks, 1);

            heap.deallocate(a);
            assert_eq!(heap.check().free_blocks, 2);
            heap.deallocate(b);

            let report = heap.check();
            assert_eq!(report.free_blocks, 1);
            assert_eq!(report.allocated_blocks, 0);
            assert_eq!(report.largest_free_bytes, 61 * ALIGNMENT);
        });
    }

    #[test]
    fn test_coalesce_both_sides() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(64).unwrap();
            let b = heap.allocate(64).unwrap();
            let c = heap.allocate(64).unwrap();
            let d = heap.allocate(64).unwrap();
            heap.deallocate(a);
            heap.deallocate(c);
            assert_eq!(heap.check().free_blocks, 3);

            heap.deallocate(b);
            assert_eq!(heap.check().free_blocks, 2);
            heap.deallocate(d);
            assert_eq!(heap.check().free_blocks, 1);
        });
    }

    #[test]
    fn test_best_fit_lowest_address() {
        with_test_heap(8192, |heap| {
            let big = heap.allocate(5 * ALIGNMENT).unwrap();
            let _s1 = heap.allocate(1).unwrap();
            let low = heap.allocate(3 * ALIGNMENT).unwrap();
            let _s2 = heap.allocate(1).unwrap();
            let high = heap.allocate(3 * ALIGNMENT).unwrap();
            let _s3 = heap.allocate(1).unwrap();

            heap.deallocate(big);
            heap.deallocate(low);
            heap.deallocate(high);

            // The free list now starts with `high`, but `low` has the same
            // size and a lower address.
            let first = heap.allocate(3 * ALIGNMENT).unwrap();
            assert_eq!(first.offset, low.offset);
            let second = heap.allocate(3 * ALIGNMENT).unwrap();
            assert_eq!(second.offset, high.offset);
            // Exact fit beats the large tail block.
            let third = heap.allocate(5 * ALIGNMENT).unwrap();
            assert_eq!(third.offset, big.offset);
            heap.check();
        });
    }

    #[test]
    fn test_best_fit_prefers_smaller_block() {
        with_test_heap(8192, |heap| {
            let big = heap.allocate(10 * ALIGNMENT).unwrap();
            let _s1 = heap.allocate(1).unwrap();
            let small = heap.allocate(4 * ALIGNMENT).unwrap();
            let _s2 = heap.allocate(1).unwrap();

            heap.deallocate(small);
            heap.deallocate(big);

            let blob = heap.allocate(2 * ALIGNMENT).unwrap();
            assert_eq!(blob.offset, small.offset);
            heap.check();
        });
    }

    #[test]
    fn test_wastage_is_absorbed() {
        with_test_heap(4096, |heap| {
            // 61 free units, 59 requested: the 2-unit remainder is too small
            // to be useful.
            let blob = heap.allocate(59 * ALIGNMENT).unwrap();
            let report = heap.check();
            assert_eq!(report.wastage_blocks, 1);
            assert_eq!(report.free_blocks, 0);
            assert!(heap.allocate(1).is_none());

            heap.deallocate(blob);
            let report = heap.check();
            assert_eq!(report.wastage_blocks, 0);
            assert_eq!(report.free_blocks, 1);
            assert_eq!(report.largest_free_bytes, 61 * ALIGNMENT);
        });
    }

    #[test]
    fn test_wastage_absorbed_from_the_right() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(10 * ALIGNMENT).unwrap();
            let b = heap.allocate(10 * ALIGNMENT).unwrap();
            heap.deallocate(a);
            // The freed 10-unit block is reused for 8 units, leaving a
            // header-only wastage block in front of `b`.
            let c = heap.allocate(8 * ALIGNMENT + 1).unwrap();
            assert_eq!(c.offset, a.offset);
            assert_eq!(heap.check().wastage_blocks, 1);

            heap.deallocate(b);
            assert_eq!(heap.check().wastage_blocks, 0);
            heap.deallocate(c);
            assert_eq!(heap.check().free_blocks, 1);
        });
    }

    #[test]
    fn test_conservation_under_random_workload() {
        with_test_heap(64 * 1024, |heap| {
            let mut live: Vec<Blob> = Vec::new();
            let mut state = 0x9e37_79b9_u32;
            for step in 0..3000 {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                if state % 5 < 3 {
                    let size = (state >> 8) as usize % 700;
                    if let Some(blob) = heap.allocate(size) {
                        assert!(heap.heap.owns(blob));
                        assert!(live.iter().all(|other| !other.overlaps(&blob)));
                        live.push(blob);
                    }
                } else if !live.is_empty() {
                    let blob = live.swap_remove((state >> 4) as usize % live.len());
                    heap.deallocate(blob);
                }
                if step % 50 == 0 {
                    let report = heap.check();
                    assert_eq!(report.allocated_blocks, live.len());
                }
            }
            for blob in live {
                heap.deallocate(blob);
            }
            let report = heap.check();
            assert_eq!(report.free_blocks, 1);
            assert_eq!(report.wastage_blocks, 0);
        });
    }

    #[test]
    fn test_exhaustion_returns_none() {
        with_test_heap(1024, |heap| {
            assert!(heap.allocate(2048).is_none());
            let blob = heap.allocate(13 * ALIGNMENT).unwrap();
            assert!(heap.allocate(1).is_none());
            assert_eq!(heap.heap.stats().failed_allocations, 2);
            heap.deallocate(blob);
            assert!(heap.allocate(13 * ALIGNMENT).is_some());
        });
    }

    #[test]
    fn test_zero_size_takes_one_unit() {
        with_test_heap(1024, |heap| {
            let blob = heap.allocate(0).unwrap();
            assert!(blob.is_empty());
            assert_eq!(heap.heap.stats().allocated_bytes, ALIGNMENT);
            heap.deallocate(blob);
        });
    }

    #[test]
    fn test_header_overrun_detected() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();

            // Write one byte past the end of `a`'s two units, into `b`'s header.
            let overrun = a.offset.get() + 2 * ALIGNMENT;
            heap.heap.region[overrun] ^= 0xff;

            let err = heap.heap.deallocate(b).unwrap_err();
            assert!(matches!(
                err,
                MemoryError::CorruptedCookie {
                    field: "cookie1",
                    ..
                }
            ));
            assert!(heap.heap.internal_sanity_check(false, false).is_err());
        });
    }

    #[test]
    fn test_trailing_cookie_overwrite_detected() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(100).unwrap();
            let header_end = a.offset.get();
            heap.heap.region[header_end - 1] = 0;
            let err = heap.heap.internal_sanity_check(true, true).unwrap_err();
            assert!(matches!(
                err,
                MemoryError::CorruptedCookie {
                    field: "cookie2",
                    ..
                }
            ));
        });
    }

    #[test]
    #[should_panic(expected = "integrity failure")]
    fn test_corruption_panics_by_policy() {
        let mut arena = vec![0u8; 4096];
        let mut heap = SlowGeneralPurpose::with_config(
            "panicky",
            Region::new(&mut arena),
            Config {
                integrity: crate::IntegrityPolicy::Panic,
                record_provenance: true,
            },
        )
        .unwrap();
        let blob = heap.allocate(64).unwrap();
        heap.region[blob.offset.get() - ALIGNMENT] = 0;
        let _ = heap.deallocate(blob);
    }

    #[test]
    fn test_double_free_detected() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(100).unwrap();
            let _b = heap.allocate(100).unwrap();
            heap.deallocate(a);
            let err = heap.heap.deallocate(a).unwrap_err();
            assert!(matches!(
                err,
                MemoryError::UnexpectedState {
                    state: "free",
                    ..
                }
            ));
            heap.check();
        });
    }

    #[test]
    fn test_damaged_free_link_reported() {
        with_test_heap(4096, |heap| {
            let last = heap.heap.units - 1;
            for bad_link in [0, last, last + 1, 0x7000_0000] {
                let a = heap.allocate(100).unwrap();
                // The tail block after `a` is the only free block.
                let tail = heap.heap.header_unit(a.offset).unwrap() + 3;
                let mut header = heap.heap.read_header(tail);
                assert_eq!(BlockState::from_raw(header.state), Some(BlockState::Free));
                let saved = header;
                header.next_free = bad_link;
                heap.heap.write_header(tail, &header);

                let failed = heap.heap.stats().failed_allocations;
                assert!(heap.heap.allocate(10).is_none());
                assert_eq!(heap.heap.stats().failed_allocations, failed + 1);
                let err = heap.heap.deallocate(a).unwrap_err();
                assert!(matches!(err, MemoryError::Inconsistent { .. }), "{err}");
                assert!(heap.heap.internal_sanity_check(false, false).is_err());

                heap.heap.write_header(tail, &saved);
                heap.deallocate(a);
                assert_eq!(heap.check().free_blocks, 1);
            }
        });
    }

    #[test]
    fn test_damaged_back_link_reported() {
        with_test_heap(4096, |heap| {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            heap.deallocate(a);
            // `a` is free again; break its back link and free its neighbor.
            let unit = heap.heap.header_unit(a.offset).unwrap();
            let mut header = heap.heap.read_header(unit);
            header.prev_free = heap.heap.units + 5;
            heap.heap.write_header(unit, &header);

            assert!(heap.heap.allocate(10).is_none());
            let err = heap.heap.deallocate(b).unwrap_err();
            assert!(matches!(err, MemoryError::Inconsistent { .. }));
        });
    }

    #[test]
    fn test_block_state_names() {
        assert_eq!(BlockState::Wastage.to_string(), BlockState::Wastage.name());
        assert_eq!(BlockState::Free.to_string(), "free");
    }

    #[test]
    fn test_foreign_offset_rejected() {
        with_test_heap(4096, |heap| {
            let err = heap
                .heap
                .deallocate(Blob::new(Offset::new(100), 8))
                .unwrap_err();
            assert!(matches!(err, MemoryError::NotOwned { .. }));
            assert!(!heap.heap.owns(Blob::new(Offset::new(0), 8)));
            assert!(!heap.heap.owns(Blob::new(Offset::new(4096), 8)));
            assert!(heap.heap.bytes(Blob::new(Offset::new(128), 8)).is_none());
        });
    }

    #[test]
    fn test_provenance_recorded() {
        let mut arena = vec![0u8; 4096];
        let mut heap = SlowGeneralPurpose::with_config(
            "provenance",
            Region::new(&mut arena),
            Config {
                integrity: crate::IntegrityPolicy::Report,
                record_provenance: true,
            },
        )
        .unwrap();
        let blob = heap.allocate(10).unwrap();
        let line = line!() - 1;
        let header = heap.read_header(heap.header_unit(blob.offset).unwrap());
        assert!(file!().ends_with(header.origin()));
        assert_eq!(header.line, line);
        assert_eq!(heap.internal_sanity_check(true, false).unwrap().allocated_blocks, 1);
    }

    #[test]
    fn test_reset() {
        with_test_heap(4096, |heap| {
            heap.allocate(1000).unwrap();
            heap.allocate(1000).unwrap();
            heap.heap.reset().unwrap();
            let report = heap.check();
            assert_eq!(report.free_blocks, 1);
            assert_eq!(heap.heap.stats().live_allocations, 0);
        });
    }

    #[test]
    fn test_region_too_small() {
        let mut arena = [0u8; MIN_REGION_SIZE - 1];
        let err = SlowGeneralPurpose::new("tiny", Region::new(&mut arena))
            .err()
            .unwrap();
        assert!(matches!(err, MemoryError::RegionTooSmall { .. }));
    }
}
