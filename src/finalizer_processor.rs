use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::finalizer_queue::FinalizerQueue;

type EpochDone = Box<dyn Fn(u64) + Send + Sync>;

struct State {
    queue: FinalizerQueue,
    /// Newest scheduled epoch not reported yet.
    epoch: Option<u64>,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
    epoch_done: EpochDone,
}

/// Background thread running regular finalizers batch by batch. After each
/// batch the epoch it was scheduled with is reported through `epoch_done`.
pub struct FinalizerProcessor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerProcessor {
    pub fn new(epoch_done: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: FinalizerQueue::new(),
                    epoch: None,
                    stop: false,
                }),
                condvar: Condvar::new(),
                epoch_done: Box::new(epoch_done),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Queues `tasks` for the finalizer thread, starting it if needed. With
    /// nothing to run and no thread, `epoch` is reported done right away.
    pub fn schedule_tasks(&self, mut tasks: FinalizerQueue, epoch: u64) {
        let mut thread = self.thread.lock();
        if tasks.is_empty() && thread.is_none() {
            drop(thread);
            (self.shared.epoch_done)(epoch);
            return;
        }
        if thread.is_none() {
            match self.spawn() {
                Ok(handle) => *thread = Some(handle),
                Err(error) => {
                    drop(thread);
                    warn!("cannot start finalizer thread ({}), finalizing inline", error);
                    tasks.run_all();
                    (self.shared.epoch_done)(epoch);
                    return;
                }
            }
        }
        let mut state = self.shared.state.lock();
        state.queue.transfer_all_from(&mut tasks);
        state.epoch = Some(epoch);
        self.shared.condvar.notify_one();
    }

    fn spawn(&self) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        self.shared.state.lock().stop = false;
        thread::Builder::new()
            .name("finalizer".to_string())
            .spawn(move || {
                debug!("finalizer thread started");
                loop {
                    let mut state = shared.state.lock();
                    while state.epoch.is_none() && !state.stop {
                        shared.condvar.wait(&mut state);
                    }
                    let epoch = match state.epoch.take() {
                        Some(epoch) => epoch,
                        None => break,
                    };
                    let mut batch = std::mem::take(&mut state.queue);
                    drop(state);
                    let count = batch.run_all();
                    debug!("finalized {} objects for epoch {}", count, epoch);
                    (shared.epoch_done)(epoch);
                }
                debug!("finalizer thread stopped");
            })
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Finishes scheduled work, then joins the thread.
    pub fn stop_finalizer_thread(&self) {
        let mut thread = self.thread.lock();
        let handle = match thread.take() {
            Some(handle) => handle,
            None => return,
        };
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.condvar.notify_one();
        }
        if handle.join().is_err() {
            warn!("finalizer thread panicked");
        }
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop_finalizer_thread();
    }
}
