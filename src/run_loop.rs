//! Minimal single-threaded event loop with wake-up sources and one-shot timers.
//!
//! Each thread owns at most one [`RunLoop`]. Other threads interact with it only
//! through [`RunLoopSource::signal`], [`RunLoopTimer::set_next_firing`],
//! [`RunLoop::perform`], [`RunLoop::wake_up`] and [`RunLoop::stop`]. Callbacks
//! always run on the loop's thread with no loop lock held.

use std::{
    cell::RefCell,
    collections::VecDeque,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn Fn() + Send + Sync>;
type Block = Box<dyn FnOnce() + Send>;

struct LoopState {
    sources: Vec<Arc<SourceInner>>,
    timers: Vec<Arc<TimerInner>>,
    blocks: VecDeque<Block>,
    woken: bool,
    stopped: bool,
}

struct LoopShared {
    state: Mutex<LoopState>,
    condvar: Condvar,
    owner: ThreadId,
}

impl LoopShared {
    fn notify(&self) {
        let _state = self.state.lock();
        self.condvar.notify_one();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<RunLoop>> = RefCell::new(None);
}

#[derive(Clone)]
pub struct RunLoop {
    shared: Arc<LoopShared>,
}

impl RunLoop {
    /// The calling thread's loop, created on first use.
    pub fn current() -> RunLoop {
        CURRENT.with(|current| {
            current
                .borrow_mut()
                .get_or_insert_with(|| RunLoop {
                    shared: Arc::new(LoopShared {
                        state: Mutex::new(LoopState {
                            sources: vec![],
                            timers: vec![],
                            blocks: VecDeque::new(),
                            woken: false,
                            stopped: false,
                        }),
                        condvar: Condvar::new(),
                        owner: thread::current().id(),
                    }),
                })
                .clone()
        })
    }

    pub fn is_current(&self) -> bool {
        self.shared.owner == thread::current().id()
    }

    /// Runs callbacks until [`RunLoop::stop`] is called. Only the owning
    /// thread may run its loop.
    pub fn run(&self) {
        if !self.is_current() {
            fatal!("run loop of {:?} run from another thread", self.shared.owner);
        }
        loop {
            let (blocks, sources, timers) = {
                let mut state = self.shared.state.lock();
                loop {
                    if state.stopped {
                        state.stopped = false;
                        return;
                    }
                    let now = Instant::now();
                    let blocks: Vec<Block> = state.blocks.drain(..).collect();
                    let sources: Vec<Arc<SourceInner>> = state
                        .sources
                        .iter()
                        .filter(|source| source.signaled.swap(false, Ordering::AcqRel))
                        .cloned()
                        .collect();
                    let timers: Vec<Arc<TimerInner>> = state
                        .timers
                        .iter()
                        .filter(|timer| timer.take_if_due(now))
                        .cloned()
                        .collect();
                    let woken = std::mem::replace(&mut state.woken, false);
                    if woken || !blocks.is_empty() || !sources.is_empty() || !timers.is_empty() {
                        break (blocks, sources, timers);
                    }
                    match state.timers.iter().filter_map(|timer| *timer.deadline.lock()).min() {
                        Some(deadline) => {
                            self.shared.condvar.wait_until(&mut state, deadline);
                        }
                        None => self.shared.condvar.wait(&mut state),
                    }
                }
            };
            for block in blocks {
                block();
            }
            for source in sources {
                (source.callback)();
            }
            for timer in timers {
                (timer.callback)();
            }
        }
    }

    /// Makes [`RunLoop::run`] return after the callbacks in flight.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.condvar.notify_one();
    }

    /// Forces one more loop iteration.
    pub fn wake_up(&self) {
        let mut state = self.shared.state.lock();
        state.woken = true;
        self.shared.condvar.notify_one();
    }

    /// Runs `block` once on the loop's thread.
    pub fn perform(&self, block: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        state.blocks.push_back(Box::new(block));
        self.shared.condvar.notify_one();
    }
}

struct SourceInner {
    callback: Callback,
    signaled: AtomicBool,
    run_loop: Mutex<Option<Weak<LoopShared>>>,
}

/// Callback fired on the loop's next iteration after each [`RunLoopSource::signal`].
/// Signals arriving before the callback runs coalesce into one call.
#[derive(Clone)]
pub struct RunLoopSource {
    inner: Arc<SourceInner>,
}

impl RunLoopSource {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                callback: Box::new(callback),
                signaled: AtomicBool::new(false),
                run_loop: Mutex::new(None),
            }),
        }
    }

    /// Callable from any thread. A detached source remembers the signal until
    /// it is attached.
    pub fn signal(&self) {
        self.inner.signaled.store(true, Ordering::Release);
        let attached = self.inner.run_loop.lock().as_ref().and_then(Weak::upgrade);
        if let Some(shared) = attached {
            shared.notify();
        }
    }

    pub fn attach_to_current_run_loop(&self) -> SourceSubscription {
        let run_loop = RunLoop::current();
        *self.inner.run_loop.lock() = Some(Arc::downgrade(&run_loop.shared));
        {
            let mut state = run_loop.shared.state.lock();
            state.sources.push(self.inner.clone());
            run_loop.shared.condvar.notify_one();
        }
        SourceSubscription {
            run_loop,
            source: self.inner.clone(),
            _not_send: PhantomData,
        }
    }
}

/// Keeps a source attached. Detaches on drop, which must happen on the loop's thread.
pub struct SourceSubscription {
    run_loop: RunLoop,
    source: Arc<SourceInner>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SourceSubscription {
    fn drop(&mut self) {
        if !self.run_loop.is_current() {
            fatal!("run loop source subscription dropped off its loop's thread");
        }
        *self.source.run_loop.lock() = None;
        self.run_loop
            .shared
            .state
            .lock()
            .sources
            .retain(|source| !Arc::ptr_eq(source, &self.source));
    }
}

struct TimerInner {
    callback: Callback,
    deadline: Mutex<Option<Instant>>,
    run_loop: Mutex<Option<Weak<LoopShared>>>,
}

impl TimerInner {
    fn take_if_due(&self, now: Instant) -> bool {
        let mut deadline = self.deadline.lock();
        match *deadline {
            Some(at) if at <= now => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// One-shot timer. Each [`RunLoopTimer::set_next_firing`] replaces the pending firing.
#[derive(Clone)]
pub struct RunLoopTimer {
    inner: Arc<TimerInner>,
}

impl RunLoopTimer {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                callback: Box::new(callback),
                deadline: Mutex::new(None),
                run_loop: Mutex::new(None),
            }),
        }
    }

    pub fn set_next_firing(&self, after: Duration) {
        *self.inner.deadline.lock() = Some(Instant::now() + after);
        let attached = self.inner.run_loop.lock().as_ref().and_then(Weak::upgrade);
        if let Some(shared) = attached {
            shared.notify();
        }
    }

    pub fn attach_to_current_run_loop(&self) -> TimerSubscription {
        let run_loop = RunLoop::current();
        *self.inner.run_loop.lock() = Some(Arc::downgrade(&run_loop.shared));
        {
            let mut state = run_loop.shared.state.lock();
            state.timers.push(self.inner.clone());
            run_loop.shared.condvar.notify_one();
        }
        TimerSubscription {
            run_loop,
            timer: self.inner.clone(),
            _not_send: PhantomData,
        }
    }
}

/// Keeps a timer attached. Detaches on drop, which must happen on the loop's thread.
pub struct TimerSubscription {
    run_loop: RunLoop,
    timer: Arc<TimerInner>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for TimerSubscription {
    fn drop(&mut self) {
        if !self.run_loop.is_current() {
            fatal!("run loop timer subscription dropped off its loop's thread");
        }
        *self.timer.run_loop.lock() = None;
        self.run_loop
            .shared
            .state
            .lock()
            .timers
            .retain(|timer| !Arc::ptr_eq(timer, &self.timer));
    }
}

pub mod test_support {
    use super::*;
    use std::{sync::mpsc, thread::JoinHandle};

    /// A [`RunLoop`] running on its own thread. `init` runs on that thread
    /// first and its result lives until the loop stops, which happens on drop.
    pub struct RunLoopInScopedThread {
        run_loop: RunLoop,
        thread: Option<JoinHandle<()>>,
    }

    impl RunLoopInScopedThread {
        pub fn new<T: 'static>(init: impl FnOnce() -> T + Send + 'static) -> Self {
            let (sender, receiver) = mpsc::channel();
            let thread = thread::Builder::new()
                .name("run-loop".to_string())
                .spawn(move || {
                    let run_loop = RunLoop::current();
                    let state = init();
                    // The receiver outlives this send: `new` blocks on it.
                    let _ = sender.send(run_loop.clone());
                    run_loop.run();
                    drop(state);
                })
                .expect("failed to spawn run loop thread");
            let run_loop = receiver.recv().expect("run loop thread exited during init");
            Self {
                run_loop,
                thread: Some(thread),
            }
        }

        pub fn run_loop(&self) -> &RunLoop {
            &self.run_loop
        }

        pub fn wake_up(&self) {
            self.run_loop.wake_up();
        }

        pub fn perform(&self, block: impl FnOnce() + Send + 'static) {
            self.run_loop.perform(block);
        }
    }

    impl Drop for RunLoopInScopedThread {
        fn drop(&mut self) {
            self.run_loop.stop();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
