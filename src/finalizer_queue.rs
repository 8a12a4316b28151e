use std::fmt;

/// Thread a finalizer has to run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FinalizerThread {
    /// Any finalizer thread will do.
    Any,
    /// Only the designated main thread may run it.
    Main,
}

/// One pending finalization action.
pub struct Finalizer(Box<dyn FnOnce() + Send>);

impl Finalizer {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(action))
    }

    pub fn run(self) {
        (self.0)()
    }
}

impl<F: FnOnce() + Send + 'static> From<F> for Finalizer {
    fn from(action: F) -> Self {
        Self::new(action)
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Finalizer")
    }
}

/// Ordered batch of finalizers. Consumers drain it from the back, so the most
/// recently pushed finalizer runs first.
#[derive(Default, Debug)]
pub struct FinalizerQueue {
    items: Vec<Finalizer>,
}

impl FinalizerQueue {
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, finalizer: impl Into<Finalizer>) {
        self.items.push(finalizer.into());
    }

    pub fn pop(&mut self) -> Option<Finalizer> {
        self.items.pop()
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends all of `other` after this queue's items, leaving `other` empty.
    pub fn transfer_all_from(&mut self, other: &mut FinalizerQueue) {
        if self.items.is_empty() {
            std::mem::swap(&mut self.items, &mut other.items);
        } else {
            self.items.append(&mut other.items);
        }
    }

    /// Runs every finalizer in drain order.
    pub fn run_all(&mut self) -> usize {
        let mut ran = 0;
        while let Some(finalizer) = self.pop() {
            finalizer.run();
            ran += 1;
        }
        ran
    }
}

impl FromIterator<Finalizer> for FinalizerQueue {
    fn from_iter<I: IntoIterator<Item = Finalizer>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Finalizers found by a sweep, split by the thread they must run on.
///
/// Merges take both operands by exclusive reference; callers provide any
/// locking around shared instances.
#[derive(Default, Debug)]
pub struct CombinedFinalizerQueue {
    pub regular: FinalizerQueue,
    pub main_thread: FinalizerQueue,
}

impl CombinedFinalizerQueue {
    pub const fn new() -> Self {
        Self {
            regular: FinalizerQueue::new(),
            main_thread: FinalizerQueue::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.regular.size() + self.main_thread.size()
    }

    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.main_thread.is_empty()
    }

    pub fn push(&mut self, thread: FinalizerThread, finalizer: impl Into<Finalizer>) {
        match thread {
            FinalizerThread::Any => self.regular.push(finalizer),
            FinalizerThread::Main => self.main_thread.push(finalizer),
        }
    }

    /// Moves main-thread finalizers into the regular partition. Used when no
    /// main-thread processor exists.
    pub fn merge_into_regular(&mut self) {
        self.regular.transfer_all_from(&mut self.main_thread);
    }

    pub fn merge_from(&mut self, mut other: CombinedFinalizerQueue) {
        self.regular.transfer_all_from(&mut other.regular);
        self.main_thread.transfer_all_from(&mut other.main_thread);
    }
}
