//! Lock-free multi-producer event list.
//!
//! Producers push from any thread without locking; a consumer drains the
//! whole list in one atomic swap. Internally the list is a singly-linked
//! stack (push order is LIFO); draining reverses the detached chain so the
//! consumer observes items in producer order (FIFO).
//!
//! Multiple threads may drain concurrently without undefined behaviour, but
//! the items then partition arbitrarily between the drains — the intended
//! shape is many producers, one consumer.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam::utils::CachePadded;

struct Node<T> {
    next: *mut Node<T>,
    value: T,
}

/// Lock-free MPSC event list.
pub struct EventQueue<T> {
    /// Every producer CASes this on every push; padding keeps the hot
    /// line from being shared with neighbouring fields.
    head: CachePadded<AtomicPtr<Node<T>>>,
}

unsafe impl<T: Send> Send for EventQueue<T> {}
unsafe impl<T: Send> Sync for EventQueue<T> {}

impl<T> EventQueue<T> {
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Push a value; wait-free except for CAS retries under contention.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: self.head.load(Ordering::Relaxed),
            value,
        }));

        loop {
            // Safety: `node` is owned by this call until the CAS succeeds.
            let current = unsafe { (*node).next };
            match self
                .head
                .compare_exchange_weak(current, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => unsafe { (*node).next = observed },
            }
        }
    }

    /// Detach the whole list and return its items in FIFO order.
    pub fn drain(&self) -> Drain<T> {
        let mut chain = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        // Reverse the detached LIFO chain outside any shared state.
        let mut reversed: *mut Node<T> = ptr::null_mut();
        while !chain.is_null() {
            // Safety: the swap gave this thread exclusive ownership of the
            // chain; nodes are only relinked, never freed here.
            unsafe {
                let next = (*chain).next;
                (*chain).next = reversed;
                reversed = chain;
                chain = next;
            }
        }

        Drain { head: reversed }
    }

    /// Drain and apply `f` to every item in FIFO order; returns the count.
    pub fn apply(&self, mut f: impl FnMut(T)) -> usize {
        let mut count = 0;
        for value in self.drain() {
            f(value);
            count += 1;
        }
        count
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for EventQueue<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // Safety: drop has exclusive access; each node was allocated by
            // `push` via Box.
            node = unsafe { Box::from_raw(node) }.next;
        }
    }
}

/// Owning FIFO iterator over a detached chain.
pub struct Drain<T> {
    head: *mut Node<T>,
}

unsafe impl<T: Send> Send for Drain<T> {}

impl<T> Iterator for Drain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        // Safety: the chain is uniquely owned by this iterator.
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        Some(node.value)
    }
}

impl<T> Drop for Drain<T> {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}
