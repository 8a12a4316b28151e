use std::{ptr::NonNull, sync::atomic::Ordering};

use crate::{
    finalizer_queue::CombinedFinalizerQueue,
    object_model::{ObjectFate, ObjectModel},
    statistics::SweepStatistics,
};

/// Token identifying one collection, threaded through sweeps for attribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcHandle {
    epoch: u64,
}

impl GcHandle {
    pub const fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    pub const fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepKind {
    Objects,
    ExtraObjects,
}

/// Per-caller sweep context. Counts locally and publishes the counts when dropped.
pub struct SweepScope<'a> {
    handle: GcHandle,
    cycle: u64,
    kind: SweepKind,
    model: &'a dyn ObjectModel,
    statistics: &'a SweepStatistics,
    kept: usize,
    swept: usize,
    finalizers: usize,
}

impl<'a> SweepScope<'a> {
    pub(crate) fn new(
        handle: GcHandle,
        cycle: u64,
        kind: SweepKind,
        model: &'a dyn ObjectModel,
        statistics: &'a SweepStatistics,
    ) -> Self {
        Self {
            handle,
            cycle,
            kind,
            model,
            statistics,
            kept: 0,
            swept: 0,
            finalizers: 0,
        }
    }

    pub fn handle(&self) -> GcHandle {
        self.handle
    }

    /// Heap cycle pages are claimed for.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn kind(&self) -> SweepKind {
        self.kind
    }

    pub fn kept(&self) -> usize {
        self.kept
    }

    pub fn swept(&self) -> usize {
        self.swept
    }

    /// Decides the fate of one occupied block. Returns `true` if the block stays
    /// occupied; finalizers are routed into `finalizers`.
    ///
    /// # Safety
    /// `block` must be an occupied block of a page being swept by this caller.
    pub unsafe fn sweep_block(
        &mut self,
        block: NonNull<u8>,
        finalizers: &mut CombinedFinalizerQueue,
    ) -> bool {
        let fate = match self.kind {
            SweepKind::Objects => self.model.sweep_object(block),
            SweepKind::ExtraObjects => self.model.sweep_extra_object(block),
        };
        match fate {
            ObjectFate::Live => {
                self.kept += 1;
                true
            }
            ObjectFate::Reclaim => {
                self.swept += 1;
                false
            }
            ObjectFate::Finalize { thread, finalizer } => {
                self.finalizers += 1;
                finalizers.push(thread, finalizer);
                true
            }
            ObjectFate::Finalizing => true,
        }
    }
}

impl Drop for SweepScope<'_> {
    fn drop(&mut self) {
        let stats = self.statistics;
        match self.kind {
            SweepKind::Objects => {
                stats.kept_objects.fetch_add(self.kept, Ordering::Relaxed);
                stats.swept_objects.fetch_add(self.swept, Ordering::Relaxed);
            }
            SweepKind::ExtraObjects => {
                stats.kept_extra_objects.fetch_add(self.kept, Ordering::Relaxed);
                stats.swept_extra_objects.fetch_add(self.swept, Ordering::Relaxed);
            }
        }
        stats
            .finalizers_scheduled
            .fetch_add(self.finalizers, Ordering::Relaxed);
        stats
            .last_epoch
            .fetch_max(self.handle.epoch(), Ordering::Relaxed);
    }
}
