use std::{
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::AtomicU64,
};

use crossbeam_utils::atomic::AtomicCell;
use modular_bitfield::prelude::*;
use tracing::trace;

use super::Page;
use crate::{
    error::PageError,
    finalizer_queue::CombinedFinalizerQueue,
    gc_handle::SweepScope,
    globals::{round_up, CELL_SIZE, NEXT_FIT_PAGE_SIZE},
    internal::atomic_stack::Linked,
    mmap::Mmap,
};

// Every block starts with one header cell:
//
// +-----------+------+-------------------------------------------+
// | name      | bits |                                           |
// +-----------+------+-------------------------------------------+
// | allocated |    1 |                                           |
// | size      |   63 | Block size in cells, header cell included. |
// +-----------+------+-------------------------------------------+
//
// Blocks tile the payload without gaps, so the next block header is always
// `size` cells further.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct BlockHeader {
    allocated: bool,
    size: B63,
}

/// Page carved into variable sized blocks, allocated with a next-fit policy.
#[repr(C)]
pub struct NextFitPage {
    next: AtomicCell<*mut NextFitPage>,
    swept_in: AtomicU64,
    mmap: Mmap,
    /// Cell index of the block allocation is attempted from first.
    current: usize,
}

pub const NEXT_FIT_PAGE_CELL_COUNT: usize =
    (NEXT_FIT_PAGE_SIZE - NextFitPage::HEADER_SIZE) / CELL_SIZE;
/// Largest payload (in cells) a next-fit page can hold.
pub const NEXT_FIT_PAGE_MAX_BLOCK_SIZE: usize = NEXT_FIT_PAGE_CELL_COUNT - 1;

impl NextFitPage {
    pub const HEADER_SIZE: usize = round_up(size_of::<Self>(), CELL_SIZE);

    fn cells(&self) -> *mut u64 {
        unsafe { (self as *const Self as *mut u8).add(Self::HEADER_SIZE).cast() }
    }

    unsafe fn header(&self, cell: usize) -> *mut BlockHeader {
        debug_assert!(cell < NEXT_FIT_PAGE_CELL_COUNT);
        self.cells().add(cell).cast()
    }

    unsafe fn block_size(&self, cell: usize) -> usize {
        (*self.header(cell)).size() as usize
    }

    unsafe fn is_allocated(&self, cell: usize) -> bool {
        (*self.header(cell)).allocated()
    }

    unsafe fn set_block(&self, cell: usize, size: usize, allocated: bool) {
        self.header(cell).write(
            BlockHeader::new()
                .with_allocated(allocated)
                .with_size(size as u64),
        );
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.cells() as *const u8;
        start <= ptr && ptr < self.mmap.end() as *const u8
    }

    /// Allocates `cells` zeroed payload cells.
    ///
    /// Memory is cut from the end of the current free block so the block keeps
    /// its start and stays current. When it is too small the page is scanned
    /// forward from the current block, then from the start.
    pub fn try_allocate(&mut self, cells: usize) -> Option<NonNull<u8>> {
        let needed = cells + 1;
        if needed > NEXT_FIT_PAGE_CELL_COUNT {
            return None;
        }
        unsafe {
            if !self.fits(self.current, needed) && !self.update_current_block(needed) {
                return None;
            }
            let current = self.current;
            let size = self.block_size(current);
            let block = if size == needed {
                current
            } else {
                self.set_block(current, size - needed, false);
                current + size - needed
            };
            self.set_block(block, needed, true);
            let payload = self.cells().add(block + 1).cast::<u8>();
            payload.write_bytes(0, cells * CELL_SIZE);
            Some(NonNull::new_unchecked(payload))
        }
    }

    unsafe fn fits(&self, cell: usize, needed: usize) -> bool {
        !self.is_allocated(cell) && self.block_size(cell) >= needed
    }

    unsafe fn update_current_block(&mut self, needed: usize) -> bool {
        let mut cell = self.current;
        while cell < NEXT_FIT_PAGE_CELL_COUNT {
            if self.fits(cell, needed) {
                self.current = cell;
                return true;
            }
            cell += self.block_size(cell);
        }
        cell = 0;
        while cell < self.current {
            if self.fits(cell, needed) {
                self.current = cell;
                return true;
            }
            cell += self.block_size(cell);
        }
        false
    }

    /// Total cells in free blocks, headers included.
    pub fn free_cells(&self) -> usize {
        let mut free = 0;
        let mut cell = 0;
        unsafe {
            while cell < NEXT_FIT_PAGE_CELL_COUNT {
                let size = self.block_size(cell);
                if !self.is_allocated(cell) {
                    free += size;
                }
                cell += size;
            }
        }
        free
    }
}

impl Linked for NextFitPage {
    fn link(&self) -> &AtomicCell<*mut Self> {
        &self.next
    }
}

impl Page for NextFitPage {
    unsafe fn create(cells: usize) -> Result<NonNull<Self>, PageError> {
        debug_assert!(cells <= NEXT_FIT_PAGE_MAX_BLOCK_SIZE);
        let mmap = Mmap::new(NEXT_FIT_PAGE_SIZE)?;
        let page = mmap.start().cast::<Self>();
        page.write(Self {
            next: AtomicCell::new(ptr::null_mut()),
            swept_in: AtomicU64::new(0),
            mmap,
            current: 0,
        });
        (*page).set_block(0, NEXT_FIT_PAGE_CELL_COUNT, false);
        trace!("created next-fit page {:p}", page);
        Ok(NonNull::new_unchecked(page))
    }

    unsafe fn destroy(page: NonNull<Self>) {
        trace!("destroying next-fit page {:p}", page.as_ptr());
        let mmap = ptr::read(ptr::addr_of!((*page.as_ptr()).mmap));
        drop(mmap);
    }

    fn swept_in(&self) -> &AtomicU64 {
        &self.swept_in
    }

    fn size_in_bytes(&self) -> usize {
        self.mmap.size()
    }

    /// Frees dead blocks, merges neighbouring free blocks and makes the largest
    /// free block current.
    unsafe fn sweep(
        &mut self,
        scope: &mut SweepScope<'_>,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> bool {
        let mut alive = false;
        let mut largest = (0, 0);
        let mut free_start = None;
        let mut cell = 0;
        while cell < NEXT_FIT_PAGE_CELL_COUNT {
            let size = self.block_size(cell);
            let keep = self.is_allocated(cell) && {
                let payload = self.cells().add(cell + 1).cast::<u8>();
                scope.sweep_block(NonNull::new_unchecked(payload), finalizers)
            };
            if keep {
                alive = true;
                free_start = None;
            } else {
                let start = *free_start.get_or_insert(cell);
                let merged = cell + size - start;
                self.set_block(start, merged, false);
                if merged > largest.1 {
                    largest = (start, merged);
                }
            }
            cell += size;
        }
        self.current = largest.0;
        alive
    }

    fn for_each_allocated(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        let mut cell = 0;
        unsafe {
            while cell < NEXT_FIT_PAGE_CELL_COUNT {
                if self.is_allocated(cell) {
                    visitor(NonNull::new_unchecked(self.cells().add(cell + 1).cast()));
                }
                cell += self.block_size(cell);
            }
        }
    }
}
