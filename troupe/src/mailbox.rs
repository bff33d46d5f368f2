//! The lock-free queue delivering messages into one actor.
//!
//! Producers push onto an intrusive LIFO stack with a single compare-and-swap on the head
//! pointer. The single consumer swaps the whole chain out at once and reverses it to recover
//! arrival order. Closing swaps in a tagged sentinel address that no allocation can ever
//! occupy, so later pushes fail and hand their item back to the caller.
//!
//! Ordering is reconstructed per drained batch only: items from concurrent producers racing
//! with a drain may land in the next batch.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

struct Node<T> {
    item: T,
    next: *mut Node<T>,
}

const CLOSED_TAG: usize = 1;

fn closed<T>() -> *mut Node<T> {
    // Nodes are at least pointer-aligned, so address 1 is never a real node.
    CLOSED_TAG as *mut Node<T>
}

/// Multi-producer, single-consumer unbounded queue with an idempotent close.
pub struct Mailbox<T> {
    head: AtomicPtr<Node<T>>,
    notify: Notify,
    _owns: PhantomData<T>,
}

// SAFETY: items are moved in by producers and moved out by the consumer, never shared, so
// `T: Send` is sufficient for the mailbox to be both sent and shared across threads.
unsafe impl<T: Send> Send for Mailbox<T> {}
unsafe impl<T: Send> Sync for Mailbox<T> {}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            head: AtomicPtr::new(ptr::null_mut()),
            notify: Notify::new(),
            _owns: PhantomData,
        }
    }

    /// Enqueues `item`, waking the consumer. Hands `item` back if the mailbox is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let node = Box::into_raw(Box::new(Node { item, next: ptr::null_mut() }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == closed() {
                // SAFETY: `node` came from `Box::into_raw` above and was never published.
                let node = unsafe { Box::from_raw(node) };
                return Err(node.item);
            }
            // SAFETY: `node` is still private to this thread until the CAS succeeds.
            unsafe { (*node).next = head; }
            match self.head.compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Removes everything queued so far, in arrival order. `None` if empty or closed.
    pub fn take_head(&self) -> Option<Vec<T>> {
        self.swap_head(ptr::null_mut())
    }

    /// Like [`take_head`][Self::take_head], but also closes the mailbox for good.
    pub fn take_head_and_close(&self) -> Option<Vec<T>> {
        let items = self.swap_head(closed());
        // Wake anyone still waiting so they observe the close.
        self.notify.notify_waiters();
        items
    }

    pub fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == closed()
    }

    /// Waits for the wake signal. Signals sent while nobody waits are coalesced into one
    /// stored permit.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    fn swap_head(&self, replacement: *mut Node<T>) -> Option<Vec<T>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == closed() || (head.is_null() && replacement.is_null()) {
                return None;
            }
            match self.head.compare_exchange_weak(head, replacement, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        if head.is_null() {
            return None;
        }
        // SAFETY: the CAS detached the chain starting at `head`; no producer will touch it
        // again and only the consumer frees nodes.
        Some(unsafe { drain_chain(head) })
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: `node` must be the head of a detached chain built by `push`.
unsafe fn drain_chain<T>(mut node: *mut Node<T>) -> Vec<T> {
    let mut items = Vec::new();
    while !node.is_null() {
        let boxed = Box::from_raw(node);
        node = boxed.next;
        items.push(boxed.item);
    }
    items.reverse();
    items
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        if !head.is_null() && head != closed() {
            // SAFETY: we have exclusive access, so the chain is detached by construction.
            drop(unsafe { drain_chain(head) });
        }
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "#<Mailbox{}>", if self.is_closed() { " closed" } else { "" })
    }
}
