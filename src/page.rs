//! Heap pages. Each page is a single mapping with its header at offset 0 and
//! the payload right behind it.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    error::PageError, finalizer_queue::CombinedFinalizerQueue, gc_handle::SweepScope,
    internal::atomic_stack::Linked,
};

pub mod extra_object;
pub mod fixed_block;
pub mod next_fit;
pub mod single_object;

pub use extra_object::ExtraObjectPage;
pub use fixed_block::FixedBlockPage;
pub use next_fit::NextFitPage;
pub use single_object::SingleObjectPage;

pub trait Page: Linked {
    /// Maps a page sized for `cells`. The meaning of `cells` depends on the kind.
    ///
    /// # Safety
    /// The returned page must eventually be released with [`Page::destroy`].
    unsafe fn create(cells: usize) -> Result<NonNull<Self>, PageError>;

    /// # Safety
    /// `page` must come from [`Page::create`], be unlinked, and not be used afterwards.
    unsafe fn destroy(page: NonNull<Self>);

    /// Heap cycle this page was last swept in.
    fn swept_in(&self) -> &AtomicU64;

    fn size_in_bytes(&self) -> usize;

    /// Frees dead blocks and collects finalizers. Returns whether anything is
    /// still occupied.
    ///
    /// # Safety
    /// The caller must have claimed the page with [`claim_for_sweep`].
    unsafe fn sweep(
        &mut self,
        scope: &mut SweepScope<'_>,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> bool;

    fn for_each_allocated(&self, visitor: &mut dyn FnMut(NonNull<u8>));
}

/// Marks `page` as swept in `cycle`. Two sweeps of one page in the same cycle
/// mean the page stores are corrupted, so that aborts.
pub fn claim_for_sweep<T: Page>(page: &T, cycle: u64) {
    let previous = page.swept_in().swap(cycle, Ordering::AcqRel);
    if previous == cycle {
        fatal!(
            "page {:p} claimed for sweep twice in cycle {}",
            page as *const T,
            cycle
        );
    }
}
