//! Bump allocator over reference-counted 64 KiB chunks.
//!
//! Intended for many small allocations that die young. Blocks are carved
//! sequentially from the newest chunk and never reused individually: a chunk
//! returns to its [`PageSource`] as soon as every block carved from it has
//! been freed.
//!
//! ```text
//! chunk:  ┌──────────────┬────────┬─────────┬────────┬─────────┬───────┐
//!         │ chunk header │ hdr    │ payload │ hdr    │ payload │ ...   │
//!         │ (32 bytes)   │ (8)    │         │ (8)    │         │       │
//!         └──────────────┴────────┴─────────┴────────┴─────────┴───────┘
//! ```
//!
//! Every block header records its own offset inside the chunk, so the chunk
//! that owns a block is found in O(1). Offsets handed out are laid out as
//!
//! ```text
//!  usize::BITS-1     OWNER_SHIFT              16 15                 0
//! ┌─────────────────┬────────────────────────┬─────────────────────┐
//! │ owner tag       │ chunk slot             │ offset in chunk     │
//! └─────────────────┴────────────────────────┴─────────────────────┘
//! ```
//!
//! The owner tag is the low bits of the instance id, so a blob freed into
//! the wrong instance is rejected before any chunk is touched. Tags repeat
//! after 65536 instances on 64-bit targets (256 on 32-bit ones).

use alloc::{boxed::Box, vec, vec::Vec};
use core::{
    ops::Range,
    sync::atomic::{AtomicU32, Ordering},
};

use dataview::{DataView, Pod};

use crate::{
    allocator::{Allocator, Capabilities, Stats},
    blob::{Blob, Offset},
    config::Config,
    error::MemoryError,
};

/// Size of one chunk, as requested from the [`PageSource`].
pub const PAGE_SIZE: usize = 64 * 1024;
/// Bytes at the start of every chunk taken by its header.
pub const CHUNK_HEADER_SIZE: usize = size_of::<ChunkHeader>();
/// Bytes in front of every payload.
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();
/// Payloads start on, and are padded to, this boundary.
pub const BLOCK_ALIGN: usize = 8;

/// Largest request that fits into a fresh chunk.
pub const LARGEST_POSSIBLE_BLOCK: usize = PAGE_SIZE - CHUNK_HEADER_SIZE - BLOCK_HEADER_SIZE;

const CHUNK_SIGNATURE: u32 = u32::from_le_bytes(*b"SSLC");
const NONE: u32 = u32::MAX;

const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();
const OWNER_SHIFT: u32 = usize::BITS / 4 * 3;
const OWNER_MASK: u32 = (1 << (usize::BITS - OWNER_SHIFT)) - 1;
const ADDRESS_MASK: usize = (1 << OWNER_SHIFT) - 1;
/// Chunk slots that fit between the page offset and the owner tag.
const MAX_CHUNKS: usize = 1 << (OWNER_SHIFT - PAGE_SHIFT);

static NEXT_INSTANCE_ID: AtomicU32 = AtomicU32::new(1);

/// Backing store for chunks.
pub trait PageSource {
    /// Returns a zeroed page of [`PAGE_SIZE`] bytes, or `None` when the
    /// source is exhausted.
    fn acquire_page(&mut self) -> Option<Box<[u8]>>;

    /// Takes back a page obtained from [`PageSource::acquire_page`].
    ///
    /// Every acquired page is released exactly once, either when its chunk
    /// empties or when the allocator is reset or dropped.
    fn release_page(&mut self, page: Box<[u8]>);
}

/// Page source backed by the global heap.
#[derive(Debug, Default)]
pub struct HeapPageSource {
    max_pages: Option<usize>,
    outstanding: usize,
}

impl HeapPageSource {
    /// Creates a source with no page limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source that hands out at most `max_pages` pages at a time.
    #[must_use]
    pub fn with_limit(max_pages: usize) -> Self {
        Self {
            max_pages: Some(max_pages),
            outstanding: 0,
        }
    }

    /// Number of pages acquired and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl PageSource for HeapPageSource {
    fn acquire_page(&mut self) -> Option<Box<[u8]>> {
        if self.max_pages.is_some_and(|max| self.outstanding >= max) {
            return None;
        }
        self.outstanding += 1;
        Some(vec![0; PAGE_SIZE].into_boxed_slice())
    }

    fn release_page(&mut self, page: Box<[u8]>) {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        self.outstanding -= 1;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct ChunkHeader {
    signature: u32,
    owner: u32,
    /// Previous chunk slot in allocation order.
    prev: u32,
    next: u32,
    total_bytes: u32,
    /// Bump pointer; always a multiple of [`BLOCK_ALIGN`].
    used_bytes: u32,
    ref_count: u32,
    reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct BlockHeader {
    offset_in_chunk: u32,
    block_size: u32,
}

const _: () = assert!(CHUNK_HEADER_SIZE == 32 && BLOCK_HEADER_SIZE == BLOCK_ALIGN);

/// Allocator for small, short-lived blocks.
pub struct SmallShortLivedChunked<S: PageSource = HeapPageSource> {
    /// Owner tag stamped into chunk headers and handed-out offsets.
    owner: u32,
    source: S,
    config: Config,
    chunks: Vec<Option<Box<[u8]>>>,
    vacant: Vec<u32>,
    /// Oldest live chunk.
    head: u32,
    /// Newest live chunk; allocations are carved from it.
    tail: u32,
    stats: Stats,
}

impl SmallShortLivedChunked<HeapPageSource> {
    /// Creates an allocator drawing chunks from the heap without limit.
    ///
    /// ```
    /// use bedrock_memory::{Allocator as _, SmallShortLivedChunked};
    ///
    /// let mut chunks = SmallShortLivedChunked::new();
    /// let a = chunks.allocate(24).unwrap();
    /// let b = chunks.allocate(40).unwrap();
    /// chunks.deallocate(a)?;
    /// chunks.deallocate(b)?;
    /// assert_eq!(chunks.chunk_count(), 0);
    /// # Ok::<(), bedrock_memory::MemoryError>(())
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(HeapPageSource::new())
    }
}

impl Default for SmallShortLivedChunked<HeapPageSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PageSource> SmallShortLivedChunked<S> {
    /// Creates an allocator drawing chunks from `source`, with the default
    /// [`Config`].
    pub fn with_source(source: S) -> Self {
        Self::with_config(source, Config::default())
    }

    /// Creates an allocator drawing chunks from `source`.
    ///
    /// No chunk is acquired until the first allocation.
    ///
    /// # Arguments
    ///
    /// * `source` - Where chunks come from and are returned to.
    /// * `config` - Integrity policy applied to misuse and corruption.
    pub fn with_config(source: S, config: Config) -> Self {
        Self {
            owner: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed) & OWNER_MASK,
            source,
            config,
            chunks: Vec::new(),
            vacant: Vec::new(),
            head: NONE,
            tail: NONE,
            stats: Stats::default(),
        }
    }

    /// The page source chunks are drawn from.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of chunks currently held.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len() - self.vacant.len()
    }

    /// Adds a holder to `blob`, keeping its chunk alive until one more
    /// [`Allocator::deallocate`] of the blob.
    ///
    /// Each holder counts as a live allocation in [`Allocator::stats`]
    /// until it frees the blob.
    ///
    /// # Errors
    ///
    /// Fails like [`Allocator::deallocate`] when `blob` is not a live block
    /// of this allocator.
    pub fn acquire_block(&mut self, blob: Blob) -> Result<(), MemoryError> {
        let (slot, header) = self.locate(blob).map_err(|err| self.fail(err))?;
        let mut chunk = self.read_chunk(slot);
        chunk.ref_count += 1;
        self.write_chunk(slot, &chunk);
        self.stats
            .record_share(Self::footprint(header.block_size as usize));
        Ok(())
    }

    /// Size recorded in the block header at allocation time.
    #[must_use]
    pub fn block_size(&self, blob: Blob) -> Option<usize> {
        let (_, header) = self.locate(blob).ok()?;
        Some(header.block_size as usize)
    }

    fn fail(&self, err: MemoryError) -> MemoryError {
        self.config.integrity.fail(Self::NAME, err)
    }

    const NAME: &'static str = "small-short-lived";

    fn acquire_chunk(&mut self) -> Option<u32> {
        let page = self.source.acquire_page()?;
        if page.len() != PAGE_SIZE {
            warn!(
                "{}: page source returned {} bytes instead of {PAGE_SIZE}",
                Self::NAME,
                page.len()
            );
            self.source.release_page(page);
            return None;
        }

        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.chunks[slot as usize] = Some(page);
                slot
            }
            None if self.chunks.len() < MAX_CHUNKS => {
                let slot = u32::try_from(self.chunks.len()).ok().filter(|&s| s != NONE)?;
                self.chunks.push(Some(page));
                slot
            }
            None => {
                warn!("{}: chunk table is full", Self::NAME);
                self.source.release_page(page);
                return None;
            }
        };

        #[expect(clippy::cast_possible_truncation)]
        let header = ChunkHeader {
            signature: CHUNK_SIGNATURE,
            owner: self.owner,
            prev: self.tail,
            next: NONE,
            total_bytes: PAGE_SIZE as u32,
            used_bytes: CHUNK_HEADER_SIZE as u32,
            ref_count: 0,
            reserved: 0,
        };
        self.write_chunk(slot, &header);
        if self.tail == NONE {
            self.head = slot;
        } else {
            let mut tail = self.read_chunk(self.tail);
            tail.next = slot;
            self.write_chunk(self.tail, &tail);
        }
        self.tail = slot;
        debug!("{}: acquired chunk {slot}", Self::NAME);
        Some(slot)
    }

    fn release_chunk(&mut self, slot: u32) {
        let header = self.read_chunk(slot);
        if header.prev == NONE {
            self.head = header.next;
        } else {
            let mut prev = self.read_chunk(header.prev);
            prev.next = header.next;
            self.write_chunk(header.prev, &prev);
        }
        if header.next == NONE {
            self.tail = header.prev;
        } else {
            let mut next = self.read_chunk(header.next);
            next.prev = header.prev;
            self.write_chunk(header.next, &next);
        }

        if let Some(page) = self.chunks[slot as usize].take() {
            self.source.release_page(page);
        }
        self.vacant.push(slot);
        debug!("{}: released chunk {slot}", Self::NAME);
    }

    fn release_all(&mut self) {
        while self.head != NONE {
            self.release_chunk(self.head);
        }
    }

    fn encode(&self, slot: u32, local: usize) -> Offset {
        Offset::new(((self.owner as usize) << OWNER_SHIFT) | (slot as usize * PAGE_SIZE + local))
    }

    /// Finds the chunk and header of a block, verifying both.
    fn locate(&self, blob: Blob) -> Result<(u32, BlockHeader), MemoryError> {
        let offset = blob.offset;
        let not_owned = || MemoryError::not_owned(offset);
        if offset.get() >> OWNER_SHIFT != self.owner as usize {
            return Err(not_owned());
        }
        let address = offset.get() & ADDRESS_MASK;
        let slot = u32::try_from(address / PAGE_SIZE)
            .ok()
            .ok_or_else(not_owned)?;
        let local = address % PAGE_SIZE;
        let page = self
            .chunks
            .get(slot as usize)
            .and_then(Option::as_deref)
            .ok_or_else(not_owned)?;
        if local < CHUNK_HEADER_SIZE + BLOCK_HEADER_SIZE || !local.is_multiple_of(BLOCK_ALIGN) {
            return Err(not_owned());
        }

        let chunk: ChunkHeader = DataView::from(&page[..CHUNK_HEADER_SIZE]).read(0);
        let chunk_offset = Offset::new(offset.get() - local);
        if chunk.signature != CHUNK_SIGNATURE {
            return Err(MemoryError::corrupted_cookie(
                "chunk signature",
                chunk_offset,
                CHUNK_SIGNATURE.into(),
                chunk.signature.into(),
            ));
        }
        if chunk.owner != self.owner {
            return Err(MemoryError::corrupted_cookie(
                "chunk owner",
                chunk_offset,
                self.owner.into(),
                chunk.owner.into(),
            ));
        }

        let header_start = local - BLOCK_HEADER_SIZE;
        if header_start >= chunk.used_bytes as usize {
            return Err(not_owned());
        }
        let header: BlockHeader =
            DataView::from(&page[header_start..local]).read(0);
        if header.offset_in_chunk as usize != header_start {
            return Err(MemoryError::corrupted_cookie(
                "offset_in_chunk",
                offset,
                header_start as u64,
                header.offset_in_chunk.into(),
            ));
        }
        if local + header.block_size as usize > chunk.used_bytes as usize {
            return Err(MemoryError::inconsistent(
                offset,
                "block extends past the chunk's used bytes",
            ));
        }
        Ok((slot, header))
    }

    fn read_chunk(&self, slot: u32) -> ChunkHeader {
        self.chunks[slot as usize]
            .as_deref()
            .map_or(ChunkHeader::vacant(), |page| {
                DataView::from(&page[..CHUNK_HEADER_SIZE]).read(0)
            })
    }

    fn write_chunk(&mut self, slot: u32, header: &ChunkHeader) {
        if let Some(page) = self.chunks[slot as usize].as_deref_mut() {
            DataView::from_mut(&mut page[..CHUNK_HEADER_SIZE]).write(0, header);
        }
    }

    fn payload_range(&self, blob: Blob) -> Option<(u32, Range<usize>)> {
        let (slot, header) = self.locate(blob).ok()?;
        if blob.size > header.block_size as usize {
            return None;
        }
        let local = blob.offset.get() % PAGE_SIZE;
        Some((slot, local..local + blob.size))
    }

    fn footprint(size: usize) -> usize {
        BLOCK_HEADER_SIZE + size.next_multiple_of(BLOCK_ALIGN)
    }
}

impl ChunkHeader {
    const fn vacant() -> Self {
        Self {
            signature: 0,
            owner: 0,
            prev: NONE,
            next: NONE,
            total_bytes: 0,
            used_bytes: 0,
            ref_count: 0,
            reserved: 0,
        }
    }
}

impl<S: PageSource> Allocator for SmallShortLivedChunked<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aligned: true,
            supports_reset: true,
            alignment: BLOCK_ALIGN,
            max_allocation: Some(LARGEST_POSSIBLE_BLOCK),
            ..Capabilities::default()
        }
    }

    fn allocate(&mut self, size: usize) -> Option<Blob> {
        if size > LARGEST_POSSIBLE_BLOCK {
            self.stats.record_failure();
            return None;
        }
        let footprint = Self::footprint(size);

        let fits = |chunk: &ChunkHeader| chunk.used_bytes as usize + footprint <= PAGE_SIZE;
        let slot = match self.tail {
            NONE => None,
            tail if fits(&self.read_chunk(tail)) => Some(tail),
            _ => None,
        };
        let Some(slot) = slot.or_else(|| self.acquire_chunk()) else {
            self.stats.record_failure();
            debug!("{}: page source exhausted", Self::NAME);
            return None;
        };

        let mut chunk = self.read_chunk(slot);
        let header_start = chunk.used_bytes as usize;
        let local = header_start + BLOCK_HEADER_SIZE;
        #[expect(clippy::cast_possible_truncation)]
        let header = BlockHeader {
            offset_in_chunk: header_start as u32,
            block_size: size as u32,
        };
        if let Some(page) = self.chunks[slot as usize].as_deref_mut() {
            DataView::from_mut(&mut page[header_start..local]).write(0, &header);
        }
        #[expect(clippy::cast_possible_truncation)]
        let footprint_bytes = footprint as u32;
        chunk.used_bytes += footprint_bytes;
        chunk.ref_count += 1;
        self.write_chunk(slot, &chunk);

        self.stats.record_alloc(footprint);
        Some(Blob::new(self.encode(slot, local), size))
    }

    fn deallocate(&mut self, blob: Blob) -> Result<(), MemoryError> {
        let (slot, header) = self.locate(blob).map_err(|err| self.fail(err))?;
        let mut chunk = self.read_chunk(slot);
        if chunk.ref_count == 0 {
            return Err(self.fail(MemoryError::unexpected_state(
                blob.offset,
                "unreferenced",
                "referenced",
            )));
        }
        chunk.ref_count -= 1;
        self.write_chunk(slot, &chunk);
        self.stats
            .record_free(Self::footprint(header.block_size as usize));
        trace!(
            "{}: freed {} bytes at {}, chunk {slot} has {} references",
            Self::NAME,
            header.block_size,
            blob.offset,
            chunk.ref_count
        );
        if chunk.ref_count == 0 {
            self.release_chunk(slot);
        }
        Ok(())
    }

    fn owns(&self, blob: Blob) -> bool {
        self.locate(blob).is_ok()
    }

    fn reset(&mut self) -> Result<(), MemoryError> {
        self.release_all();
        self.stats.clear_live();
        Ok(())
    }

    fn stats(&self) -> Stats {
        self.stats
    }

    fn bytes(&self, blob: Blob) -> Option<&[u8]> {
        let (slot, range) = self.payload_range(blob)?;
        Some(&self.chunks[slot as usize].as_deref()?[range])
    }

    fn bytes_mut(&mut self, blob: Blob) -> Option<&mut [u8]> {
        let (slot, range) = self.payload_range(blob)?;
        Some(&mut self.chunks[slot as usize].as_deref_mut()?[range])
    }
}

impl<S: PageSource> Drop for SmallShortLivedChunked<S> {
    fn drop(&mut self) {
        self.release_all();
    }
}
