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
    globals::{round_up, CELL_SIZE},
    internal::atomic_stack::Linked,
    mmap::Mmap,
};

/// Page holding exactly one large object.
#[repr(C)]
pub struct SingleObjectPage {
    next: AtomicCell<*mut SingleObjectPage>,
    swept_in: AtomicU64,
    mmap: Mmap,
    object_cells: usize,
    is_allocated: bool,
}

impl SingleObjectPage {
    pub const HEADER_SIZE: usize = round_up(size_of::<Self>(), CELL_SIZE);

    pub fn data(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(Self::HEADER_SIZE) }
    }

    pub fn object_cells(&self) -> usize {
        self.object_cells
    }

    pub fn is_allocated(&self) -> bool {
        self.is_allocated
    }

    /// Succeeds once per page. The payload is already zero.
    pub fn try_allocate(&mut self) -> Option<NonNull<u8>> {
        if self.is_allocated {
            return None;
        }
        self.is_allocated = true;
        NonNull::new(self.data())
    }
}

impl Linked for SingleObjectPage {
    fn link(&self) -> &AtomicCell<*mut Self> {
        &self.next
    }
}

impl Page for SingleObjectPage {
    unsafe fn create(cells: usize) -> Result<NonNull<Self>, PageError> {
        let size = cells
            .checked_mul(CELL_SIZE)
            .and_then(|bytes| bytes.checked_add(Self::HEADER_SIZE))
            .ok_or(PageError::SizeOverflow { cells })?;
        let mmap = Mmap::new(size)?;
        let page = mmap.start().cast::<Self>();
        page.write(Self {
            next: AtomicCell::new(ptr::null_mut()),
            swept_in: AtomicU64::new(0),
            mmap,
            object_cells: cells,
            is_allocated: false,
        });
        trace!("created single-object page {:p} ({} cells)", page, cells);
        Ok(NonNull::new_unchecked(page))
    }

    unsafe fn destroy(page: NonNull<Self>) {
        trace!("destroying single-object page {:p}", page.as_ptr());
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
        if !self.is_allocated {
            return false;
        }
        let object = NonNull::new_unchecked(self.data());
        self.is_allocated = scope.sweep_block(object, finalizers);
        self.is_allocated
    }

    fn for_each_allocated(&self, visitor: &mut dyn FnMut(NonNull<u8>)) {
        if let Some(object) = NonNull::new(self.data()).filter(|_| self.is_allocated) {
            visitor(object);
        }
    }
}
