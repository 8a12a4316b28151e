use std::ptr::NonNull;

use crate::finalizer_queue::{Finalizer, FinalizerThread};

/// What the collector decided about one allocated block during sweep.
#[derive(Debug)]
pub enum ObjectFate {
    /// Marked. The model resets the mark as part of answering.
    Live,
    /// Unmarked and nothing left to run. The block is freed immediately.
    Reclaim,
    /// Unmarked and needs finalization first. The block stays occupied until a
    /// later cycle reports it as [`ObjectFate::Reclaim`].
    Finalize {
        thread: FinalizerThread,
        finalizer: Finalizer,
    },
    /// Unmarked but a finalizer from an earlier cycle has not completed yet.
    Finalizing,
}

impl ObjectFate {
    /// Whether the block must stay occupied after this sweep.
    pub fn keeps_block(&self) -> bool {
        !matches!(self, ObjectFate::Reclaim)
    }
}

/// Collector-side knowledge about objects living in heap pages.
///
/// The heap only sees raw blocks; liveness and finalization requirements come
/// from here. Called concurrently from every sweeping thread.
pub trait ObjectModel: Send + Sync {
    /// # Safety
    /// `object` is the start of a block handed out by the heap and still occupied.
    unsafe fn sweep_object(&self, object: NonNull<u8>) -> ObjectFate;

    /// Same as [`ObjectModel::sweep_object`] for extra-object slots.
    ///
    /// # Safety
    /// `extra` is an occupied extra-object slot.
    unsafe fn sweep_extra_object(&self, extra: NonNull<u8>) -> ObjectFate {
        self.sweep_object(extra)
    }
}
