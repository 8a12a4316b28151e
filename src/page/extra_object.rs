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
        round_up, CELL_SIZE, EXTRA_OBJECT_BITMAP_WORDS, EXTRA_OBJECT_PAGE_SIZE, EXTRA_OBJECT_SIZE,
    },
    internal::{atomic_stack::Linked, slots::SlotTable},
    mmap::Mmap,
};

/// Page of fixed-size slots for per-object auxiliary metadata.
#[repr(C)]
pub struct ExtraObjectPage {
    next: AtomicCell<*mut ExtraObjectPage>,
    swept_in: AtomicU64,
    mmap: Mmap,
    slots: SlotTable<EXTRA_OBJECT_BITMAP_WORDS>,
}

impl ExtraObjectPage {
    pub const HEADER_SIZE: usize = round_up(size_of::<Self>(), CELL_SIZE);
    pub const CAPACITY: usize = (EXTRA_OBJECT_PAGE_SIZE - Self::HEADER_SIZE) / EXTRA_OBJECT_SIZE;

    fn data(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(Self::HEADER_SIZE) }
    }

    pub fn allocated_count(&self) -> usize {
        self.slots.occupied_count()
    }

    pub fn try_allocate(&mut self) -> Option<NonNull<u8>> {
        let data = self.data();
        unsafe {
            self.slots
                .allocate(data, EXTRA_OBJECT_SIZE)
                .map(|p| NonNull::new_unchecked(p))
        }
    }
}

impl Linked for ExtraObjectPage {
    fn link(&self) -> &AtomicCell<*mut Self> {
        &self.next
    }
}

impl Page for ExtraObjectPage {
    unsafe fn create(_cells: usize) -> Result<NonNull<Self>, PageError> {
        let mmap = Mmap::new(EXTRA_OBJECT_PAGE_SIZE)?;
        let page = mmap.start().cast::<Self>();
        page.write(Self {
            next: AtomicCell::new(ptr::null_mut()),
            swept_in: AtomicU64::new(0),
            mmap,
            slots: SlotTable::new(Self::CAPACITY),
        });
        trace!("created extra-object page {:p}", page);
        Ok(NonNull::new_unchecked(page))
    }

    unsafe fn destroy(page: NonNull<Self>) {
        trace!("destroying extra-object page {:p}", page.as_ptr());
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
        let data = self.data();
        self.slots.sweep(data, EXTRA_OBJECT_SIZE, |slot| {
            scope.sweep_block(NonNull::new_unchecked(slot), finalizers)
        })
    }

    fn for_each_allocated(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        self.slots
            .for_each_occupied(self.data(), EXTRA_OBJECT_SIZE, |slot| unsafe {
                visitor(NonNull::new_unchecked(slot))
            });
    }
}
