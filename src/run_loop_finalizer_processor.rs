use std::{
    sync::{Arc, Weak},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    finalizer_queue::FinalizerQueue,
    run_loop::{RunLoopSource, RunLoopTimer, SourceSubscription, TimerSubscription},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunLoopFinalizerProcessorConfig {
    /// Once a round has run this long no new finalizer is started.
    pub max_time_in_task: Duration,
    /// Minimum gap between the end of one round and the start of the next.
    pub min_time_between_tasks: Duration,
}

impl Default for RunLoopFinalizerProcessorConfig {
    fn default() -> Self {
        Self {
            max_time_in_task: Duration::from_millis(5),
            min_time_between_tasks: Duration::from_millis(10),
        }
    }
}

/// Runs finalizers on a thread whose run loop has other work to do, in short
/// rounds separated by idle gaps.
///
/// Scheduled finalizers land in `queue`. A round drains `current_queue` from
/// the back and refills it from `queue` only once it is empty, so finalizers
/// scheduled during a round (even by a running finalizer) run after the batch
/// in progress.
pub struct RunLoopFinalizerProcessor {
    source: RunLoopSource,
    timer: RunLoopTimer,
    config: Mutex<RunLoopFinalizerProcessorConfig>,
    queue: Mutex<FinalizerQueue>,
    current_queue: Mutex<FinalizerQueue>,
    last_process_timestamp: Atomic<Option<Instant>>,
    owner: Atomic<Option<ThreadId>>,
}

/// Binding of a processor to one run loop. Dropping it on the loop's thread detaches.
pub struct RunLoopFinalizerProcessorSubscription {
    _source: SourceSubscription,
    _timer: TimerSubscription,
}

impl RunLoopFinalizerProcessor {
    pub fn new() -> Arc<Self> {
        Self::with_initial_config(RunLoopFinalizerProcessorConfig::default())
    }

    pub fn with_initial_config(config: RunLoopFinalizerProcessorConfig) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let source = RunLoopSource::new(move || {
                if let Some(processor) = this.upgrade() {
                    processor.process();
                }
            });
            let wake = source.clone();
            Self {
                source,
                timer: RunLoopTimer::new(move || wake.signal()),
                config: Mutex::new(config),
                queue: Mutex::new(FinalizerQueue::new()),
                current_queue: Mutex::new(FinalizerQueue::new()),
                last_process_timestamp: Atomic::new(None),
                owner: Atomic::new(None),
            }
        })
    }

    /// Adds `tasks` and wakes the bound loop. Callable from any thread,
    /// including from inside a finalizer this processor is running.
    pub fn schedule(&self, mut tasks: FinalizerQueue) {
        if tasks.is_empty() {
            return;
        }
        self.queue.lock().transfer_all_from(&mut tasks);
        self.source.signal();
    }

    pub fn with_config<R>(&self, f: impl FnOnce(&mut RunLoopFinalizerProcessorConfig) -> R) -> R {
        f(&mut self.config.lock())
    }

    /// Binds the processor to the calling thread's run loop.
    pub fn attach_to_current_run_loop(&self) -> RunLoopFinalizerProcessorSubscription {
        self.owner
            .store(Some(thread::current().id()), Ordering::Release);
        RunLoopFinalizerProcessorSubscription {
            _source: self.source.attach_to_current_run_loop(),
            _timer: self.timer.attach_to_current_run_loop(),
        }
    }

    /// Finalizers waiting in either queue.
    pub fn pending(&self) -> usize {
        self.queue.lock().size() + self.current_queue.lock().size()
    }

    fn process(&self) {
        if self.owner.load(Ordering::Acquire) != Some(thread::current().id()) {
            fatal!("run loop finalizer processor driven from a thread it is not attached to");
        }
        let config = *self.config.lock();
        let start = Instant::now();
        if let Some(last) = self.last_process_timestamp.load(Ordering::Acquire) {
            let ready_at = last + config.min_time_between_tasks;
            if start < ready_at {
                self.timer.set_next_firing(ready_at - start);
                return;
            }
        }

        let deadline = start + config.max_time_in_task;
        debug!("running main thread finalizers");
        let mut finished = 0usize;
        loop {
            if Instant::now() > deadline {
                self.timer.set_next_firing(config.min_time_between_tasks);
                self.last_process_timestamp
                    .store(Some(Instant::now()), Ordering::Release);
                debug!(
                    "main thread finalizers out of time after {} finalizers, {} pending",
                    finished,
                    self.pending()
                );
                return;
            }
            let next = self.current_queue.lock().pop();
            if let Some(finalizer) = next {
                finalizer.run();
                finished += 1;
                continue;
            }
            let refilled = {
                let mut queue = self.queue.lock();
                let mut current = self.current_queue.lock();
                current.transfer_all_from(&mut queue);
                !current.is_empty()
            };
            if !refilled {
                self.last_process_timestamp
                    .store(Some(Instant::now()), Ordering::Release);
                debug!("main thread finalizers done, {} finalizers run", finished);
                return;
            }
        }
    }
}
