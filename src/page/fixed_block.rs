use std::{
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::AtomicU64,
};

use crossbeam_utils::atomic::AtomicCell;
use tracing::trace;

use super::Page;
use crate::{
    error::PageError,
    finalizer_queue::CombinedFinalizerQueue,
    gc_handle::SweepScope,
    globals::{
        round_up, CELL_SIZE, FIXED_BLOCK_BITMAP_WORDS, FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE,
        FIXED_BLOCK_PAGE_SIZE,
    },
    internal::{atomic_stack::Linked, slots::SlotTable},
    mmap::Mmap,
};

/// Page split into equally sized blocks of `block_cells` cells.
#[repr(C)]
pub struct FixedBlockPage {
    next: AtomicCell<*mut FixedBlockPage>,
    swept_in: AtomicU64,
    mmap: Mmap,
    block_cells: usize,
    slots: SlotTable<FIXED_BLOCK_BITMAP_WORDS>,
}

impl FixedBlockPage {
    pub const HEADER_SIZE: usize = round_up(size_of::<Self>(), CELL_SIZE);
    pub const PAYLOAD_SIZE: usize = FIXED_BLOCK_PAGE_SIZE - Self::HEADER_SIZE;

    pub fn block_cells(&self) -> usize {
        self.block_cells
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn allocated_count(&self) -> usize {
        self.slots.occupied_count()
    }

    fn block_bytes(&self) -> usize {
        self.block_cells * CELL_SIZE
    }

    fn data(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(Self::HEADER_SIZE) }
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.data() as *const u8;
        start <= ptr && ptr < self.mmap.end() as *const u8
    }

    /// Hands out a zeroed block, or `None` when the page is full.
    pub fn try_allocate(&mut self) -> Option<NonNull<u8>> {
        let (data, block_bytes) = (self.data(), self.block_bytes());
        unsafe { self.slots.allocate(data, block_bytes).map(|p| NonNull::new_unchecked(p)) }
    }
}

impl Linked for FixedBlockPage {
    fn link(&self) -> &AtomicCell<*mut Self> {
        &self.next
    }
}

impl Page for FixedBlockPage {
    unsafe fn create(block_cells: usize) -> Result<NonNull<Self>, PageError> {
        debug_assert!((1..=FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE).contains(&block_cells));
        let mmap = Mmap::new(FIXED_BLOCK_PAGE_SIZE)?;
        let page = mmap.start().cast::<Self>();
        let capacity = Self::PAYLOAD_SIZE / (block_cells * CELL_SIZE);
        page.write(Self {
            next: AtomicCell::new(ptr::null_mut()),
            swept_in: AtomicU64::new(0),
            mmap,
            block_cells,
            slots: SlotTable::new(capacity),
        });
        trace!("created fixed-block page {:p} ({} cells per block)", page, block_cells);
        Ok(NonNull::new_unchecked(page))
    }

    unsafe fn destroy(page: NonNull<Self>) {
        trace!("destroying fixed-block page {:p}", page.as_ptr());
        let mmap = ptr::read(ptr::addr_of!((*page.as_ptr()).mmap));
        drop(mmap);
    }

    fn swept_in(&self) -> &AtomicU64 {
        &self.swept_in
    }

    fn size_in_bytes(&self) -> usize {
        self.mmap.size()
    }

    unsafe fn sweep(
        &mut self,
        scope: &mut SweepScope<'_>,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> bool {
        let (data, block_bytes) = (self.data(), self.block_bytes());
        self.slots.sweep(data, block_bytes, |block| {
            scope.sweep_block(NonNull::new_unchecked(block), finalizers)
        })
    }

    fn for_each_allocated(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        self.slots
            .for_each_occupied(self.data(), self.block_bytes(), |block| unsafe {
                visitor(NonNull::new_unchecked(block))
            });
    }
}
