use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    finalizer_processor::FinalizerProcessor, finalizer_queue::CombinedFinalizerQueue,
    run_loop_finalizer_processor::RunLoopFinalizerProcessor,
};

/// Sends sweep results to the processors that run them. Main-thread finalizers
/// go to the registered run-loop processor; without one they are run with the
/// regular finalizers.
pub struct FinalizerDispatcher {
    regular: FinalizerProcessor,
    main_thread: Mutex<Option<Arc<RunLoopFinalizerProcessor>>>,
}

impl FinalizerDispatcher {
    pub fn new(epoch_done: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            regular: FinalizerProcessor::new(epoch_done),
            main_thread: Mutex::new(None),
        }
    }

    pub fn set_main_thread_processor(&self, processor: Option<Arc<RunLoopFinalizerProcessor>>) {
        *self.main_thread.lock() = processor;
    }

    pub fn main_thread_processor(&self) -> Option<Arc<RunLoopFinalizerProcessor>> {
        self.main_thread.lock().clone()
    }

    pub fn regular(&self) -> &FinalizerProcessor {
        &self.regular
    }

    pub fn dispatch(&self, mut queue: CombinedFinalizerQueue, epoch: u64) {
        match self.main_thread_processor() {
            Some(processor) => processor.schedule(std::mem::take(&mut queue.main_thread)),
            None => queue.merge_into_regular(),
        }
        self.regular.schedule_tasks(queue.regular, epoch);
    }
}
