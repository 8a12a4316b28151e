use std::{
    mem::size_of,
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    allocator::Allocator,
    finalizer_queue::CombinedFinalizerQueue,
    gc_handle::{GcHandle, SweepKind, SweepScope},
    globals::{
        EXTRA_OBJECT_PAGE_SIZE, FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE, FIXED_BLOCK_PAGE_SIZE,
        NEXT_FIT_PAGE_SIZE,
    },
    object_model::ObjectModel,
    page::{ExtraObjectPage, FixedBlockPage, NextFitPage, Page, SingleObjectPage},
    page_store::PageStore,
    statistics::{HeapStatistics, SweepStatistics},
    Config,
};

/// Page-based object heap shared by all mutators and sweepers.
///
/// A collection cycle is `prepare_for_gc` (mutators paused) followed by one or
/// more concurrent `sweep` calls. Mutators may keep allocating while sweeps
/// run; pages they pick up unswept are swept on their side first.
pub struct Heap {
    config: Config,
    model: Box<dyn ObjectModel>,
    fixed_block_pages: Box<[PageStore<FixedBlockPage>]>,
    next_fit_pages: PageStore<NextFitPage>,
    single_object_pages: PageStore<SingleObjectPage>,
    extra_object_pages: PageStore<ExtraObjectPage>,
    pending_finalizers: Mutex<CombinedFinalizerQueue>,
    concurrent_sweepers: AtomicUsize,
    cycle: AtomicU64,
    current_epoch: AtomicU64,
    statistics: SweepStatistics,
}

impl Heap {
    pub fn new(config: Config, model: impl ObjectModel + 'static) -> Self {
        Self {
            config,
            model: Box::new(model),
            fixed_block_pages: (0..=FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE)
                .map(|_| PageStore::new())
                .collect(),
            next_fit_pages: PageStore::new(),
            single_object_pages: PageStore::new(),
            extra_object_pages: PageStore::new(),
            pending_finalizers: Mutex::new(CombinedFinalizerQueue::new()),
            concurrent_sweepers: AtomicUsize::new(0),
            cycle: AtomicU64::new(0),
            current_epoch: AtomicU64::new(0),
            statistics: SweepStatistics::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a new cycle: every allocated-into page becomes unswept. Must run
    /// once per cycle while mutators are paused, before any [`Heap::sweep`].
    pub fn prepare_for_gc(&self) {
        let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
        let limit = self.config.empty_page_cache_limit;
        for store in self.fixed_block_pages.iter() {
            store.prepare_for_gc(limit);
        }
        self.next_fit_pages.prepare_for_gc(limit);
        self.single_object_pages.prepare_for_gc(limit);
        self.extra_object_pages.prepare_for_gc(limit);
        debug!("prepared heap for cycle {}", cycle);
    }

    /// Sweeps unswept pages until none are left and returns the finalizers
    /// found by this caller. Several threads may call this concurrently; each
    /// page is swept by exactly one of them (or by a mutator). When any call
    /// returns, every page of the cycle has been swept.
    pub fn sweep(&self, handle: GcHandle) -> CombinedFinalizerQueue {
        let cycle = self.cycle.load(Ordering::Acquire);
        self.concurrent_sweepers.fetch_add(1, Ordering::AcqRel);
        let mut finalizers = CombinedFinalizerQueue::new();
        let (kept, swept) = {
            let mut scope = self.scope(handle, cycle, SweepKind::Objects);
            for store in self.fixed_block_pages.iter() {
                store.sweep(&mut scope, &mut finalizers);
            }
            self.next_fit_pages.sweep(&mut scope, &mut finalizers);
            self.single_object_pages
                .sweep_and_free(&mut scope, &mut finalizers);
            (scope.kept(), scope.swept())
        };
        {
            let mut scope = self.scope(handle, cycle, SweepKind::ExtraObjects);
            self.extra_object_pages.sweep(&mut scope, &mut finalizers);
        }

        self.concurrent_sweepers.fetch_sub(1, Ordering::AcqRel);

        let backoff = Backoff::new();
        while self.concurrent_sweepers.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        // Every sweeper is done popping, so dead single-object pages can go.
        unsafe { self.single_object_pages.release_retired() };
        self.current_epoch
            .fetch_max(handle.epoch(), Ordering::AcqRel);
        debug!(
            "epoch {} sweep done: {} objects kept, {} swept, {} finalizers",
            handle.epoch(),
            kept,
            swept,
            finalizers.size()
        );
        finalizers
    }

    fn scope(&self, handle: GcHandle, cycle: u64, kind: SweepKind) -> SweepScope<'_> {
        SweepScope::new(handle, cycle, kind, &*self.model, &self.statistics)
    }

    fn mutator_scope(&self, kind: SweepKind) -> SweepScope<'_> {
        let handle = GcHandle::new(self.current_epoch.load(Ordering::Acquire));
        self.scope(handle, self.cycle.load(Ordering::Acquire), kind)
    }

    /// Page serving blocks of exactly `cells` cells (1 to 128). `None` for any
    /// other size.
    pub fn get_fixed_block_page(
        &self,
        cells: usize,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> Option<NonNull<FixedBlockPage>> {
        if !(1..=FIXED_BLOCK_PAGE_MAX_BLOCK_SIZE).contains(&cells) {
            return None;
        }
        let mut scope = self.mutator_scope(SweepKind::Objects);
        self.fixed_block_pages[cells].get_page(
            cells,
            &mut scope,
            finalizers,
            &self.concurrent_sweepers,
        )
    }

    /// Some next-fit page. It may not have room for `cells`; callers retry.
    pub fn get_next_fit_page(
        &self,
        cells: usize,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> Option<NonNull<NextFitPage>> {
        let mut scope = self.mutator_scope(SweepKind::Objects);
        self.next_fit_pages
            .get_page(cells, &mut scope, finalizers, &self.concurrent_sweepers)
    }

    /// Always a fresh page sized for `cells`.
    pub fn get_single_object_page(
        &self,
        cells: usize,
        _finalizers: &mut CombinedFinalizerQueue,
    ) -> Option<NonNull<SingleObjectPage>> {
        self.single_object_pages.new_page(cells)
    }

    pub fn get_extra_object_page(
        &self,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> Option<NonNull<ExtraObjectPage>> {
        let mut scope = self.mutator_scope(SweepKind::ExtraObjects);
        self.extra_object_pages
            .get_page(0, &mut scope, finalizers, &self.concurrent_sweepers)
    }

    pub fn add_to_finalizer_queue(&self, queue: CombinedFinalizerQueue) {
        if queue.is_empty() {
            return;
        }
        self.pending_finalizers.lock().merge_from(queue);
    }

    /// Takes all pending finalizers, leaving the heap's queue empty.
    pub fn extract_finalizer_queue(&self) -> CombinedFinalizerQueue {
        std::mem::take(&mut *self.pending_finalizers.lock())
    }

    /// Rough per-mutator bookkeeping cost: the allocator itself plus, for every
    /// page kind in use, half a cached page that the mutator has not filled yet.
    pub fn estimate_overhead_per_thread(&self) -> usize {
        let fixed_classes = self
            .fixed_block_pages
            .iter()
            .filter(|store| store.page_count() != 0)
            .count();
        let mut cached = fixed_classes * FIXED_BLOCK_PAGE_SIZE;
        if self.next_fit_pages.page_count() != 0 {
            cached += NEXT_FIT_PAGE_SIZE;
        }
        if self.extra_object_pages.page_count() != 0 {
            cached += EXTRA_OBJECT_PAGE_SIZE;
        }
        size_of::<Allocator>() + cached / 2
    }

    /// Every occupied object block, in no particular order.
    ///
    /// # Safety
    /// No thread may allocate or sweep during the walk.
    pub unsafe fn allocated_objects(&self) -> Vec<NonNull<u8>> {
        let mut objects = vec![];
        let mut collect = |object: NonNull<u8>| objects.push(object);
        for store in self.fixed_block_pages.iter() {
            store.for_each_page(|page| page.for_each_allocated(&mut collect));
        }
        self.next_fit_pages
            .for_each_page(|page| page.for_each_allocated(&mut collect));
        self.single_object_pages
            .for_each_page(|page| page.for_each_allocated(&mut collect));
        objects
    }

    /// Every occupied extra-object slot.
    ///
    /// # Safety
    /// Same as [`Heap::allocated_objects`].
    pub unsafe fn allocated_extra_objects(&self) -> Vec<NonNull<u8>> {
        let mut objects = vec![];
        let mut collect = |object: NonNull<u8>| objects.push(object);
        self.extra_object_pages
            .for_each_page(|page| page.for_each_allocated(&mut collect));
        objects
    }

    /// Releases every page and drops pending finalizers without running them.
    ///
    /// # Safety
    /// No allocator may still hold pages of this heap.
    pub unsafe fn clear_for_tests(&self) {
        for store in self.fixed_block_pages.iter() {
            store.clear();
        }
        self.next_fit_pages.clear();
        self.single_object_pages.clear();
        self.extra_object_pages.clear();
        *self.pending_finalizers.lock() = CombinedFinalizerQueue::new();
        self.statistics.reset();
    }

    pub fn statistics(&self) -> HeapStatistics {
        let stats = &self.statistics;
        let fixed_block_pages = self.fixed_block_pages.iter().map(|s| s.page_count()).sum();
        let fixed_block_bytes: usize = self
            .fixed_block_pages
            .iter()
            .map(|s| s.bytes_mapped())
            .sum();
        HeapStatistics {
            fixed_block_pages,
            next_fit_pages: self.next_fit_pages.page_count(),
            single_object_pages: self.single_object_pages.page_count(),
            extra_object_pages: self.extra_object_pages.page_count(),
            bytes_mapped: fixed_block_bytes
                + self.next_fit_pages.bytes_mapped()
                + self.single_object_pages.bytes_mapped()
                + self.extra_object_pages.bytes_mapped(),
            gc_cycles: self.cycle.load(Ordering::Acquire),
            last_epoch: stats.last_epoch.load(Ordering::Relaxed),
            kept_objects: stats.kept_objects.load(Ordering::Relaxed),
            swept_objects: stats.swept_objects.load(Ordering::Relaxed),
            kept_extra_objects: stats.kept_extra_objects.load(Ordering::Relaxed),
            swept_extra_objects: stats.swept_extra_objects.load(Ordering::Relaxed),
            finalizers_scheduled: stats.finalizers_scheduled.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let pending = self.pending_finalizers.get_mut().size();
        if pending != 0 {
            debug!("dropping heap with {} finalizers never run", pending);
        }
    }
}
