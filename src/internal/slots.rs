use super::bitmap::BlockBitmap;

const NONE: u32 = u32::MAX;

/// Block bookkeeping shared by pages that carve their payload into equal blocks.
///
/// Blocks below `next_unused` are either occupied or on the free list. The free
/// list is threaded through the first word of each free block, so blocks must be
/// at least one cell wide.
pub struct SlotTable<const WORDS: usize> {
    capacity: u32,
    next_unused: u32,
    free_head: u32,
    occupied: BlockBitmap<WORDS>,
}

impl<const WORDS: usize> SlotTable<WORDS> {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity <= BlockBitmap::<WORDS>::CAPACITY);
        Self {
            capacity: capacity as u32,
            next_unused: 0,
            free_head: NONE,
            occupied: BlockBitmap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.count()
    }

    /// Claims a free block and returns it zeroed.
    ///
    /// # Safety
    /// `base` must point to `capacity * block_bytes` writable bytes owned by this table.
    pub unsafe fn allocate(&mut self, base: *mut u8, block_bytes: usize) -> Option<*mut u8> {
        let index = if self.free_head != NONE {
            let index = self.free_head;
            let block = base.add(index as usize * block_bytes);
            self.free_head = block.cast::<u32>().read();
            index
        } else if self.next_unused < self.capacity {
            let index = self.next_unused;
            self.next_unused += 1;
            index
        } else {
            return None;
        };
        debug_assert!(!self.occupied.test(index as usize));
        self.occupied.set(index as usize);
        let block = base.add(index as usize * block_bytes);
        block.write_bytes(0, block_bytes);
        Some(block)
    }

    /// Asks `keep` about every occupied block, frees the ones it rejects and
    /// rebuilds the free list so the lowest free block is handed out first.
    /// Returns whether any block is still occupied.
    ///
    /// # Safety
    /// Same as [`SlotTable::allocate`].
    pub unsafe fn sweep(
        &mut self,
        base: *mut u8,
        block_bytes: usize,
        mut keep: impl FnMut(*mut u8) -> bool,
    ) -> bool {
        let occupied = self.occupied.clone();
        for index in occupied.iter_ones() {
            if !keep(base.add(index * block_bytes)) {
                self.occupied.clear(index);
            }
        }

        self.next_unused = self.occupied.last_one().map_or(0, |last| last as u32 + 1);
        self.free_head = NONE;
        for index in (0..self.next_unused).rev() {
            if !self.occupied.test(index as usize) {
                base.add(index as usize * block_bytes)
                    .cast::<u32>()
                    .write(self.free_head);
                self.free_head = index;
            }
        }
        self.next_unused != 0
    }

    pub fn for_each_occupied(&self, base: *mut u8, block_bytes: usize, mut f: impl FnMut(*mut u8)) {
        for index in self.occupied.iter_ones() {
            f(unsafe { base.add(index * block_bytes) });
        }
    }
}
