//! Fixed-stride object pool.
//!
//! The pool divides a [`Region`] into `OBJECT_SIZE`-byte slots and hands them
//! out in O(1). Free slots form a singly linked chain stored in place: the
//! first four bytes of a free slot hold the index of the next free slot.
//! Reading a freed slot's old contents is therefore meaningless.
//!
//! Slots are linked lazily, [`GROW_CONST`] at a time, so constructing a pool
//! over a large region does not touch every slot up front.
//!
//! ```text
//! region:  [ slot 0 | slot 1 | slot 2 | ... | slot n-1 | tail ]
//!             live     free ──────────────┐    untouched
//!                      next=4             ▼
//! ```

use dataview::DataView;

use crate::{
    allocator::{Allocator, Capabilities, Stats},
    blob::{Blob, Offset},
    config::Config,
    error::MemoryError,
    region::Region,
};

/// Number of untouched slots linked into the free chain when it runs dry.
pub const GROW_CONST: usize = 128;

/// Index marking the end of the free chain.
const INVALID_INDEX: u32 = u32::MAX;

/// O(1) allocator for uniformly sized objects.
///
/// # Thread Safety
///
/// The pool is `Send` but not `Sync`; wrap it in
/// [`Synchronized`](crate::Synchronized) to share it.
pub struct FixedSizeObjectPool<'a, const OBJECT_SIZE: usize> {
    region: Region<'a>,
    config: Config,
    capacity: u32,
    /// Number of slots that have ever been linked into the free chain.
    carved: u32,
    free_head: u32,
    stats: Stats,
}

impl<'a, const OBJECT_SIZE: usize> FixedSizeObjectPool<'a, OBJECT_SIZE> {
    const SLOT_HOLDS_INDEX: () = assert!(
        OBJECT_SIZE >= size_of::<u32>(),
        "object size must be able to hold a free-list index"
    );

    /// Creates a pool over `region`.
    ///
    /// Trailing bytes that do not fill a whole slot are left unused.
    ///
    /// ```
    /// use bedrock_memory::{Allocator as _, FixedSizeObjectPool, Region};
    ///
    /// let mut buf = [0u8; 256];
    /// let mut pool = FixedSizeObjectPool::<16>::new(Region::new(&mut buf))?;
    /// let blob = pool.allocate(16).unwrap();
    /// pool.bytes_mut(blob).unwrap().fill(0xaa);
    /// pool.deallocate(blob)?;
    /// # Ok::<(), bedrock_memory::MemoryError>(())
    /// ```
    pub fn new(region: Region<'a>) -> Result<Self, MemoryError> {
        Self::with_config(region, Config::default())
    }

    /// Creates a pool over `region` with an explicit [`Config`].
    ///
    /// # Arguments
    ///
    /// * `region` - Backing bytes. No slot is written until it is first
    ///   handed out or linked into the free chain.
    /// * `config` - Integrity policy for misuse such as freeing a slot that
    ///   was never handed out.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::RegionTooSmall`] if `region` cannot hold one slot.
    /// - [`MemoryError::RegionTooLarge`] if the slot count does not fit a
    ///   free-chain index.
    pub fn with_config(region: Region<'a>, config: Config) -> Result<Self, MemoryError> {
        let () = Self::SLOT_HOLDS_INDEX;

        let slots = region.len() / OBJECT_SIZE;
        if slots == 0 {
            return Err(MemoryError::region_too_small(region.len(), OBJECT_SIZE));
        }
        let Ok(capacity) = u32::try_from(slots) else {
            return Err(MemoryError::region_too_large(
                region.len(),
                OBJECT_SIZE * (INVALID_INDEX as usize - 1),
            ));
        };
        if capacity == INVALID_INDEX {
            return Err(MemoryError::region_too_large(
                region.len(),
                OBJECT_SIZE * (INVALID_INDEX as usize - 1),
            ));
        }

        Ok(Self {
            region,
            config,
            capacity,
            carved: 0,
            free_head: INVALID_INDEX,
            stats: Stats {
                capacity_bytes: Some(slots * OBJECT_SIZE),
                ..Stats::default()
            },
        })
    }

    /// Returns the number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Returns `true` if `offset` is the start of one of this pool's slots.
    #[must_use]
    pub fn owns_pointer(&self, offset: Offset) -> bool {
        let offset = offset.get();
        offset < self.capacity as usize * OBJECT_SIZE && offset.is_multiple_of(OBJECT_SIZE)
    }

    /// Links up to [`GROW_CONST`] never-used slots into the free chain.
    fn grow(&mut self) {
        let start = self.carved;
        let end = self
            .capacity
            .min(start.saturating_add(u32::try_from(GROW_CONST).unwrap_or(u32::MAX)));
        if start == end {
            return;
        }

        for index in start..end {
            let next = if index + 1 == end {
                self.free_head
            } else {
                index + 1
            };
            self.write_link(index, next);
        }
        self.free_head = start;
        self.carved = end;
        trace!("pool<{OBJECT_SIZE}>: linked slots {start}..{end}");
    }

    fn read_link(&self, index: u32) -> u32 {
        let start = index as usize * OBJECT_SIZE;
        DataView::from(&self.region[start..start + OBJECT_SIZE]).read::<u32>(0)
    }

    fn write_link(&mut self, index: u32, next: u32) {
        let start = index as usize * OBJECT_SIZE;
        DataView::from_mut(&mut self.region[start..start + OBJECT_SIZE]).write(0, &next);
    }

    fn slot_range(&self, blob: Blob) -> Option<core::ops::Range<usize>> {
        if !self.owns(blob) {
            return None;
        }
        let start = blob.offset.get();
        Some(start..start + blob.size.min(OBJECT_SIZE))
    }
}

impl<const OBJECT_SIZE: usize> Allocator for FixedSizeObjectPool<'_, OBJECT_SIZE> {
    fn name(&self) -> &'static str {
        "fixed-size-pool"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aligned: true,
            supports_reset: true,
            fixed_size: true,
            alignment: OBJECT_SIZE,
            max_allocation: Some(OBJECT_SIZE),
            ..Capabilities::default()
        }
    }

    /// Pops a slot off the free chain. Requests larger than `OBJECT_SIZE`
    /// fail; smaller ones still occupy a whole slot.
    fn allocate(&mut self, size: usize) -> Option<Blob> {
        if size > OBJECT_SIZE {
            self.stats.record_failure();
            return None;
        }
        if self.free_head == INVALID_INDEX {
            self.grow();
        }
        if self.free_head == INVALID_INDEX {
            self.stats.record_failure();
            return None;
        }

        let index = self.free_head;
        self.free_head = self.read_link(index);
        debug_assert!(self.free_head == INVALID_INDEX || self.free_head < self.capacity);

        self.stats.record_alloc(OBJECT_SIZE);
        Some(Blob::new(
            Offset::new(index as usize * OBJECT_SIZE),
            OBJECT_SIZE,
        ))
    }

    /// Pushes the slot back onto the free chain.
    ///
    /// Freeing a slot twice is not detected and corrupts the chain.
    fn deallocate(&mut self, blob: Blob) -> Result<(), MemoryError> {
        if !self.owns_pointer(blob.offset) {
            return Err(self
                .config
                .integrity
                .fail(self.name(), MemoryError::not_owned(blob.offset)));
        }

        #[expect(clippy::cast_possible_truncation)]
        let index = (blob.offset.get() / OBJECT_SIZE) as u32;
        if index >= self.carved {
            return Err(self.config.integrity.fail(
                self.name(),
                MemoryError::unexpected_state(blob.offset, "untouched", "allocated"),
            ));
        }
        self.write_link(index, self.free_head);
        self.free_head = index;
        self.stats.record_free(OBJECT_SIZE);
        Ok(())
    }

    fn owns(&self, blob: Blob) -> bool {
        self.owns_pointer(blob.offset)
    }

    /// O(1) amnesty: every slot becomes free again without visiting it.
    fn reset(&mut self) -> Result<(), MemoryError> {
        self.carved = 0;
        self.free_head = INVALID_INDEX;
        self.stats.clear_live();
        Ok(())
    }

    fn stats(&self) -> Stats {
        self.stats
    }

    fn bytes(&self, blob: Blob) -> Option<&[u8]> {
        let range = self.slot_range(blob)?;
        Some(&self.region[range])
    }

    fn bytes_mut(&mut self, blob: Blob) -> Option<&mut [u8]> {
        let range = self.slot_range(blob)?;
        Some(&mut self.region[range])
    }
}
