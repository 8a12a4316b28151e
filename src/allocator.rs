use std::{ptr::NonNull, sync::Arc};

use crate::{
    finalizer_queue::CombinedFinalizerQueue,
    globals::{cells_for_size, FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE},
    heap::Heap,
    page::{next_fit::NEXT_FIT_PAGE_MAX_BLOCK_SIZE, ExtraObjectPage, FixedBlockPage, NextFitPage},
};

/// Per-thread allocation front end. Keeps the page it last allocated from for
/// every size class and only goes to the [`Heap`] when that page is full.
pub struct Allocator {
    heap: Arc<Heap>,
    fixed_block_pages: [Option<NonNull<FixedBlockPage>>; FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE + 1],
    next_fit_page: Option<NonNull<NextFitPage>>,
    extra_object_page: Option<NonNull<ExtraObjectPage>>,
    finalizers: CombinedFinalizerQueue,
}

// Cached pages are owned by this allocator until the next `prepare_for_gc`.
unsafe impl Send for Allocator {}

impl Allocator {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            fixed_block_pages: [None; FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE + 1],
            next_fit_page: None,
            extra_object_page: None,
            finalizers: CombinedFinalizerQueue::new(),
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Allocates `size` zeroed bytes aligned to a cell. `None` means the heap
    /// could not map more memory.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let cells = cells_for_size(size);
        if cells <= FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE {
            if let Some(mut page) = self.fixed_block_pages[cells] {
                if let Some(object) = unsafe { page.as_mut() }.try_allocate() {
                    return Some(object);
                }
            }
            self.allocate_in_fixed_block_page_slow(cells)
        } else if cells <= NEXT_FIT_PAGE_MAX_BLOCK_SIZE {
            if let Some(mut page) = self.next_fit_page {
                if let Some(object) = unsafe { page.as_mut() }.try_allocate(cells) {
                    return Some(object);
                }
            }
            self.allocate_in_next_fit_page_slow(cells)
        } else {
            let mut page = self
                .heap
                .get_single_object_page(cells, &mut self.finalizers)?;
            unsafe { page.as_mut() }.try_allocate()
        }
    }

    /// Allocates one extra-object slot.
    pub fn allocate_extra_object(&mut self) -> Option<NonNull<u8>> {
        if let Some(mut page) = self.extra_object_page {
            if let Some(extra) = unsafe { page.as_mut() }.try_allocate() {
                return Some(extra);
            }
        }
        loop {
            let mut page = self.heap.get_extra_object_page(&mut self.finalizers)?;
            self.extra_object_page = Some(page);
            if let Some(extra) = unsafe { page.as_mut() }.try_allocate() {
                return Some(extra);
            }
        }
    }

    #[cold]
    fn allocate_in_fixed_block_page_slow(&mut self, cells: usize) -> Option<NonNull<u8>> {
        loop {
            let mut page = self
                .heap
                .get_fixed_block_page(cells, &mut self.finalizers)?;
            self.fixed_block_pages[cells] = Some(page);
            if let Some(object) = unsafe { page.as_mut() }.try_allocate() {
                return Some(object);
            }
        }
    }

    #[cold]
    fn allocate_in_next_fit_page_slow(&mut self, cells: usize) -> Option<NonNull<u8>> {
        loop {
            let mut page = self.heap.get_next_fit_page(cells, &mut self.finalizers)?;
            self.next_fit_page = Some(page);
            if let Some(object) = unsafe { page.as_mut() }.try_allocate(cells) {
                return Some(object);
            }
        }
    }

    /// Forgets cached pages. Call while the world is stopped, before
    /// [`Heap::prepare_for_gc`].
    pub fn prepare_for_gc(&mut self) {
        self.fixed_block_pages = [None; FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE + 1];
        self.next_fit_page = None;
        self.extra_object_page = None;
    }

    /// Finalizers this allocator found while sweeping pages on demand.
    pub fn extract_finalizer_queue(&mut self) -> CombinedFinalizerQueue {
        std::mem::take(&mut self.finalizers)
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let finalizers = self.extract_finalizer_queue();
        self.heap.add_to_finalizer_queue(finalizers);
    }
}
