use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::warn;

use crate::{
    finalizer_queue::CombinedFinalizerQueue,
    gc_handle::SweepScope,
    internal::atomic_stack::AtomicStack,
    page::{claim_for_sweep, Page},
};

/// All pages of one kind (and size class).
///
/// Between two `prepare_for_gc` calls a page moves at most once into each of
/// the four stacks:
///
/// ```text
///  unswept --sweep--> ready --get_page--> used
///     |                                     ^
///     +--sweep--> empty ----get_page--------+
/// ```
///
/// Pages in `used` belong to the mutator that took them until the next cycle.
/// Pages that `sweep_and_free` finds empty wait in `retired` until no sweeper
/// can still be popping them, then get unmapped by `release_retired`.
pub struct PageStore<T: Page> {
    empty: AtomicStack<T>,
    ready: AtomicStack<T>,
    used: AtomicStack<T>,
    unswept: AtomicStack<T>,
    retired: AtomicStack<T>,
    pages: AtomicUsize,
    bytes: AtomicUsize,
}

impl<T: Page> Default for PageStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Page> PageStore<T> {
    pub fn new() -> Self {
        Self {
            empty: AtomicStack::new(),
            ready: AtomicStack::new(),
            used: AtomicStack::new(),
            unswept: AtomicStack::new(),
            retired: AtomicStack::new(),
            pages: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        }
    }

    /// Everything allocated into becomes unswept. Empty pages beyond
    /// `empty_page_cache_limit` are released. Mutators must be paused.
    pub fn prepare_for_gc(&self, empty_page_cache_limit: usize) {
        unsafe { self.release_retired() };
        self.unswept.transfer_all_from(&self.ready);
        self.unswept.transfer_all_from(&self.used);
        while self.empty.count() > empty_page_cache_limit {
            let page = self.empty.pop();
            match NonNull::new(page) {
                Some(page) => unsafe { self.destroy_page(page) },
                None => break,
            }
        }
    }

    /// Sweeps unswept pages until none are left. Safe to run from several
    /// threads at once and next to mutators calling [`PageStore::get_page`].
    pub fn sweep(&self, scope: &mut SweepScope<'_>, finalizers: &mut CombinedFinalizerQueue) {
        while let Some(page) = self.pop_unswept() {
            unsafe {
                if self.sweep_page(page, scope, finalizers) {
                    self.ready.push(page.as_ptr());
                } else {
                    self.empty.push(page.as_ptr());
                }
            }
        }
    }

    /// Like [`PageStore::sweep`] but empty pages are retired instead of kept
    /// for reuse. Used for single-object pages.
    pub fn sweep_and_free(
        &self,
        scope: &mut SweepScope<'_>,
        finalizers: &mut CombinedFinalizerQueue,
    ) {
        while let Some(page) = self.pop_unswept() {
            unsafe {
                if self.sweep_page(page, scope, finalizers) {
                    self.ready.push(page.as_ptr());
                } else {
                    self.retired.push(page.as_ptr());
                }
            }
        }
    }

    /// Unmaps pages retired by [`PageStore::sweep_and_free`].
    ///
    /// # Safety
    /// No thread may be sweeping this store.
    pub unsafe fn release_retired(&self) {
        self.retired
            .drain_all(|page| self.destroy_page(NonNull::new_unchecked(page)));
    }

    /// Finds a page for a mutator: a swept page with free space, else an
    /// unswept page swept on the spot, else an empty page, else a new one.
    /// `sweepers` counts mutators sweeping so the collector can wait for them.
    pub fn get_page(
        &self,
        cells: usize,
        scope: &mut SweepScope<'_>,
        finalizers: &mut CombinedFinalizerQueue,
        sweepers: &AtomicUsize,
    ) -> Option<NonNull<T>> {
        if let Some(page) = NonNull::new(self.ready.pop()) {
            unsafe { self.used.push(page.as_ptr()) };
            return Some(page);
        }

        if !self.unswept.is_empty() {
            sweepers.fetch_add(1, Ordering::AcqRel);
            let swept = self.sweep_until_non_empty(scope, finalizers);
            sweepers.fetch_sub(1, Ordering::AcqRel);
            if let Some(page) = swept {
                unsafe { self.used.push(page.as_ptr()) };
                return Some(page);
            }
        }

        if let Some(page) = NonNull::new(self.empty.pop()) {
            unsafe { self.used.push(page.as_ptr()) };
            return Some(page);
        }
        self.new_page(cells)
    }

    /// Maps a fresh page straight into `used`.
    pub fn new_page(&self, cells: usize) -> Option<NonNull<T>> {
        match unsafe { T::create(cells) } {
            Ok(page) => {
                self.pages.fetch_add(1, Ordering::Relaxed);
                self.bytes
                    .fetch_add(unsafe { page.as_ref().size_in_bytes() }, Ordering::Relaxed);
                unsafe { self.used.push(page.as_ptr()) };
                Some(page)
            }
            Err(error) => {
                warn!("page allocation failed: {}", error);
                None
            }
        }
    }

    fn sweep_until_non_empty(
        &self,
        scope: &mut SweepScope<'_>,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> Option<NonNull<T>> {
        while let Some(page) = self.pop_unswept() {
            unsafe {
                if self.sweep_page(page, scope, finalizers) {
                    return Some(page);
                }
                self.empty.push(page.as_ptr());
            }
        }
        None
    }

    fn pop_unswept(&self) -> Option<NonNull<T>> {
        NonNull::new(self.unswept.pop())
    }

    unsafe fn sweep_page(
        &self,
        mut page: NonNull<T>,
        scope: &mut SweepScope<'_>,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> bool {
        claim_for_sweep(page.as_ref(), scope.cycle());
        page.as_mut().sweep(scope, finalizers)
    }

    unsafe fn destroy_page(&self, page: NonNull<T>) {
        self.pages.fetch_sub(1, Ordering::Relaxed);
        self.bytes
            .fetch_sub(page.as_ref().size_in_bytes(), Ordering::Relaxed);
        T::destroy(page);
    }

    /// Number of mapped pages.
    pub fn page_count(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    pub fn bytes_mapped(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn unswept_count(&self) -> usize {
        self.unswept.count()
    }

    /// Visits every page in every stack.
    ///
    /// # Safety
    /// No thread may allocate or sweep during the walk.
    pub unsafe fn for_each_page(&self, mut visitor: impl FnMut(&T)) {
        for stack in [&self.empty, &self.ready, &self.used, &self.unswept] {
            stack.for_each(|page| visitor(&*page));
        }
    }

    /// Releases every page.
    ///
    /// # Safety
    /// No thread may hold or use a page from this store.
    pub unsafe fn clear(&self) {
        self.release_retired();
        for stack in [&self.empty, &self.ready, &self.used, &self.unswept] {
            while let Some(page) = NonNull::new(stack.pop()) {
                self.destroy_page(page);
            }
        }
    }
}

impl<T: Page> Drop for PageStore<T> {
    fn drop(&mut self) {
        unsafe { self.clear() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gc_handle::{GcHandle, SweepKind},
        object_model::{ObjectFate, ObjectModel},
        page::FixedBlockPage,
        statistics::SweepStatistics,
    };
    use std::{
        sync::{atomic::AtomicBool, Arc},
        thread,
    };

    struct Uniform {
        live: bool,
    }

    impl ObjectModel for Uniform {
        unsafe fn sweep_object(&self, _object: NonNull<u8>) -> ObjectFate {
            if self.live {
                ObjectFate::Live
            } else {
                ObjectFate::Reclaim
            }
        }
    }

    fn fill(store: &PageStore<FixedBlockPage>, model: &dyn ObjectModel, stats: &SweepStatistics) {
        let mut scope = SweepScope::new(GcHandle::new(0), 0, SweepKind::Objects, model, stats);
        let mut finalizers = CombinedFinalizerQueue::new();
        let sweepers = AtomicUsize::new(0);
        let mut page = store
            .get_page(4, &mut scope, &mut finalizers, &sweepers)
            .unwrap();
        unsafe { while page.as_mut().try_allocate().is_some() {} }
    }

    #[test]
    fn live_pages_become_ready_and_dead_pages_empty() {
        let stats = SweepStatistics::default();
        let live = Uniform { live: true };
        let dead = Uniform { live: false };
        let store = PageStore::<FixedBlockPage>::new();
        fill(&store, &live, &stats);
        assert_eq!(store.page_count(), 1);

        store.prepare_for_gc(0);
        assert_eq!(store.unswept_count(), 1);
        let mut finalizers = CombinedFinalizerQueue::new();
        {
            let mut scope = SweepScope::new(GcHandle::new(1), 1, SweepKind::Objects, &live, &stats);
            store.sweep(&mut scope, &mut finalizers);
        }
        assert_eq!(store.unswept_count(), 0);
        assert!(!store.ready.is_empty());

        store.prepare_for_gc(0);
        {
            let mut scope = SweepScope::new(GcHandle::new(2), 2, SweepKind::Objects, &dead, &stats);
            store.sweep(&mut scope, &mut finalizers);
        }
        assert_eq!(store.empty.count(), 1);
        assert_eq!(store.page_count(), 1);

        store.prepare_for_gc(0);
        assert_eq!(store.page_count(), 0);
        assert_eq!(store.bytes_mapped(), 0);
    }

    #[test]
    fn empty_page_cache_keeps_pages_mapped() {
        let stats = SweepStatistics::default();
        let dead = Uniform { live: false };
        let store = PageStore::<FixedBlockPage>::new();
        fill(&store, &dead, &stats);
        store.prepare_for_gc(1);
        let mut finalizers = CombinedFinalizerQueue::new();
        {
            let mut scope = SweepScope::new(GcHandle::new(1), 1, SweepKind::Objects, &dead, &stats);
            store.sweep(&mut scope, &mut finalizers);
        }
        store.prepare_for_gc(1);
        assert_eq!(store.page_count(), 1);

        let sweepers = AtomicUsize::new(0);
        let mut scope = SweepScope::new(GcHandle::new(1), 2, SweepKind::Objects, &dead, &stats);
        let reused = store.get_page(4, &mut scope, &mut finalizers, &sweepers);
        assert!(reused.is_some());
        assert_eq!(store.page_count(), 1);
    }

    struct CountsSweepers {
        sweepers: Arc<AtomicUsize>,
        seen: AtomicUsize,
    }

    impl ObjectModel for CountsSweepers {
        unsafe fn sweep_object(&self, _object: NonNull<u8>) -> ObjectFate {
            self.seen
                .fetch_max(self.sweepers.load(Ordering::Acquire), Ordering::AcqRel);
            ObjectFate::Reclaim
        }
    }

    #[test]
    fn mutator_sweep_is_counted_as_in_flight() {
        let stats = SweepStatistics::default();
        let sweepers = Arc::new(AtomicUsize::new(0));
        let model = CountsSweepers {
            sweepers: sweepers.clone(),
            seen: AtomicUsize::new(0),
        };
        let store = PageStore::<FixedBlockPage>::new();
        fill(&store, &model, &stats);
        store.prepare_for_gc(0);

        let mut finalizers = CombinedFinalizerQueue::new();
        let mut scope = SweepScope::new(GcHandle::new(1), 1, SweepKind::Objects, &model, &stats);
        assert!(store
            .get_page(4, &mut scope, &mut finalizers, &sweepers)
            .is_some());
        assert_eq!(model.seen.load(Ordering::Acquire), 1);
        assert_eq!(sweepers.load(Ordering::Acquire), 0);
    }

    #[test]
    fn mapping_fresh_pages_is_not_counted_as_sweeping() {
        let stats = SweepStatistics::default();
        let dead = Uniform { live: false };
        let store = PageStore::<FixedBlockPage>::new();
        let sweepers = AtomicUsize::new(0);
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                let mut finalizers = CombinedFinalizerQueue::new();
                let mut scope =
                    SweepScope::new(GcHandle::new(1), 1, SweepKind::Objects, &dead, &stats);
                for _ in 0..64 {
                    assert!(store
                        .get_page(4, &mut scope, &mut finalizers, &sweepers)
                        .is_some());
                }
                done.store(true, Ordering::Release);
            });
            while !done.load(Ordering::Acquire) {
                assert_eq!(sweepers.load(Ordering::Acquire), 0);
            }
        });
        assert_eq!(store.page_count(), 64);
    }
}
