use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Running sweep counters, fed by dropped [`SweepScope`](crate::gc_handle::SweepScope)s.
#[derive(Default)]
pub struct SweepStatistics {
    pub kept_objects: AtomicUsize,
    pub swept_objects: AtomicUsize,
    pub kept_extra_objects: AtomicUsize,
    pub swept_extra_objects: AtomicUsize,
    pub finalizers_scheduled: AtomicUsize,
    pub last_epoch: AtomicU64,
}

impl SweepStatistics {
    pub(crate) fn reset(&self) {
        self.kept_objects.store(0, Ordering::Relaxed);
        self.swept_objects.store(0, Ordering::Relaxed);
        self.kept_extra_objects.store(0, Ordering::Relaxed);
        self.swept_extra_objects.store(0, Ordering::Relaxed);
        self.finalizers_scheduled.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the heap returned by [`Heap::statistics`](crate::heap::Heap::statistics).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    pub fixed_block_pages: usize,
    pub next_fit_pages: usize,
    pub single_object_pages: usize,
    pub extra_object_pages: usize,
    pub bytes_mapped: usize,
    pub gc_cycles: u64,
    pub last_epoch: u64,
    pub kept_objects: usize,
    pub swept_objects: usize,
    pub kept_extra_objects: usize,
    pub swept_extra_objects: usize,
    pub finalizers_scheduled: usize,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Pages: {} fixed-block, {} next-fit, {} single-object, {} extra-object",
            self.fixed_block_pages,
            self.next_fit_pages,
            self.single_object_pages,
            self.extra_object_pages
        )?;
        writeln!(f, "  Memory mapped: {}", formatted_size(self.bytes_mapped))?;
        writeln!(
            f,
            "  GC cycles: {} (last epoch {})",
            self.gc_cycles, self.last_epoch
        )?;
        writeln!(
            f,
            "  Objects kept/swept: {}/{}",
            self.kept_objects, self.swept_objects
        )?;
        writeln!(
            f,
            "  Extra objects kept/swept: {}/{}",
            self.kept_extra_objects, self.swept_extra_objects
        )?;
        writeln!(f, "  Finalizers scheduled: {}", self.finalizers_scheduled)?;
        Ok(())
    }
}
