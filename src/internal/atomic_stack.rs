use crossbeam_utils::{atomic::AtomicCell, Backoff};
use std::{
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Node that can be linked into an [`AtomicStack`]. The link is owned by whichever
/// stack currently holds the node; a node is in at most one stack at a time.
pub trait Linked: Sized {
    fn link(&self) -> &AtomicCell<*mut Self>;
}

/// Lock-free intrusive stack of pages.
///
/// Pops compare the head pointer only, so the stack relies on its users never pushing
/// the same node twice while a concurrent pop may still observe it. Page stores keep
/// this by moving every page at most once into each stack per collection cycle.
/// A pop may also read the link of a node another thread just popped, so nodes must
/// not be freed while pops can be in flight.
pub struct AtomicStack<T: Linked> {
    head: AtomicCell<*mut T>,
    count: AtomicUsize,
}

unsafe impl<T: Linked> Send for AtomicStack<T> {}
unsafe impl<T: Linked> Sync for AtomicStack<T> {}

impl<T: Linked> Default for AtomicStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> AtomicStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicCell::new(null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    /// # Safety
    /// `node` must be valid and not linked into any stack.
    pub unsafe fn push(&self, node: *mut T) {
        debug_assert!(!node.is_null());
        let backoff = Backoff::new();
        let mut head = self.head.load();
        loop {
            debug_assert_ne!(node, head);
            (*node).link().store(head);
            match self.head.compare_exchange(head, node) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::AcqRel);
                    return;
                }
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Pops the most recently pushed node, or null when the stack is empty.
    pub fn pop(&self) -> *mut T {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load();
            if head.is_null() {
                return null_mut();
            }
            let next = unsafe { (*head).link().load() };
            if self.head.compare_exchange(head, next).is_ok() {
                self.count.fetch_sub(1, Ordering::AcqRel);
                unsafe { (*head).link().store(null_mut()) };
                return head;
            }
            backoff.spin();
        }
    }

    /// Moves every node of `other` on top of this stack.
    pub fn transfer_all_from(&self, other: &AtomicStack<T>) {
        let first = other.head.swap(null_mut());
        if first.is_null() {
            return;
        }
        unsafe {
            let mut moved = 1;
            let mut last = first;
            loop {
                let next = (*last).link().load();
                if next.is_null() {
                    break;
                }
                last = next;
                moved += 1;
            }
            other.count.fetch_sub(moved, Ordering::AcqRel);

            let backoff = Backoff::new();
            let mut head = self.head.load();
            loop {
                (*last).link().store(head);
                match self.head.compare_exchange(head, first) {
                    Ok(_) => break,
                    Err(actual) => {
                        head = actual;
                        backoff.spin();
                    }
                }
            }
            self.count.fetch_add(moved, Ordering::AcqRel);
        }
    }

    /// Detaches the whole stack and hands each node to `f`. The nodes belong to
    /// the caller once detached, so `f` may free them.
    pub fn drain_all(&self, mut f: impl FnMut(*mut T)) {
        let mut node = self.head.swap(null_mut());
        while !node.is_null() {
            let next = unsafe { (*node).link().swap(null_mut()) };
            self.count.fetch_sub(1, Ordering::AcqRel);
            f(node);
            node = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load().is_null()
    }

    /// Approximate while pushes or pops are in flight.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Walks the stack without unlinking anything.
    ///
    /// # Safety
    /// No other thread may mutate the stack during the walk.
    pub unsafe fn for_each(&self, mut visitor: impl FnMut(*mut T)) {
        let mut node = self.head.load();
        while !node.is_null() {
            let next = (*node).link().load();
            visitor(node);
            node = next;
        }
    }
}
