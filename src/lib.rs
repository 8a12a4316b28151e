//! Page-based garbage collected heap with concurrent sweeping and deferred
//! finalization.
//!
//! Mutators allocate through an [`Allocator`] that takes pages from a shared
//! [`Heap`]. A collection calls [`Heap::prepare_for_gc`] with mutators paused
//! and then [`Heap::sweep`] from any number of threads. Finalizers found by the
//! sweep come back as a [`CombinedFinalizerQueue`] which a
//! [`FinalizerDispatcher`] hands to a background [`FinalizerProcessor`] and,
//! for main-thread-only finalizers, to a [`RunLoopFinalizerProcessor`] driven
//! by the main thread's [`run_loop::RunLoop`].

/// Logs and aborts. Used for broken invariants that make continuing unsafe.
macro_rules! fatal {
    ($($arg: tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort()
    }};
}

pub mod allocator;
pub mod error;
pub mod finalizer_dispatcher;
pub mod finalizer_processor;
pub mod finalizer_queue;
pub mod gc_handle;
pub mod globals;
pub mod heap;
pub mod internal;
pub mod mmap;
pub mod object_model;
pub mod page;
pub mod page_store;
pub mod run_loop;
pub mod run_loop_finalizer_processor;
pub mod statistics;

#[cfg(test)]
mod tests;

pub use allocator::Allocator;
pub use error::PageError;
pub use finalizer_dispatcher::FinalizerDispatcher;
pub use finalizer_processor::FinalizerProcessor;
pub use finalizer_queue::{CombinedFinalizerQueue, Finalizer, FinalizerQueue, FinalizerThread};
pub use gc_handle::GcHandle;
pub use heap::Heap;
pub use object_model::{ObjectFate, ObjectModel};
pub use run_loop_finalizer_processor::{RunLoopFinalizerProcessor, RunLoopFinalizerProcessorConfig};
pub use statistics::HeapStatistics;

/// Heap configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Swept-empty pages each page store keeps mapped across a
    /// [`Heap::prepare_for_gc`]. The rest are unmapped.
    pub empty_page_cache_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            empty_page_cache_limit: 0,
        }
    }
}
