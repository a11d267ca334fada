//! Synchronization primitives for operator-internal shared state.
//!
//! Operators run under the coordinator's phase barrier, which turns most of
//! their synchronization needs into two simple shapes: collect per-worker
//! nodes from many threads and fold them on one ([`AtomicList`]), and let a
//! single elected leader write state that everyone reads after the next
//! barrier ([`LeaderCell`]).

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ptr::{self, null_mut},
    sync::atomic::{AtomicPtr, Ordering},
};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// A lock-free intrusive list with a push-from-many, drain-once contract.
///
/// Any thread may [`push`](AtomicList::push); whoever calls
/// [`drain`](AtomicList::drain) takes ownership of every node pushed so far.
/// Nodes still in the list when the list is dropped are freed then, so an
/// operator abandoned mid-phase leaks nothing.
pub struct AtomicList<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: the list owns its nodes and hands each out exactly once
unsafe impl<T: Send> Send for AtomicList<T> {}
// SAFETY: pushing uses only atomic operations; draining transfers ownership
unsafe impl<T: Send> Sync for AtomicList<T> {}

impl<T> Default for AtomicList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AtomicList<T> {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
        }
    }

    /// Pushes a value onto the list and returns a pointer to it inside its
    /// node.
    ///
    /// The pointer lets the pushing worker keep mutating its own value while
    /// the node sits in the list; it must not be used by other threads and
    /// becomes dangling once the list is drained or dropped.
    pub fn push(&self, value: T) -> *mut T {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: the node is not shared until the exchange succeeds
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(found) => head = found,
            }
        }
        // SAFETY: the node stays alive until the list is drained or dropped
        unsafe { ptr::addr_of_mut!((*node).value) }
    }

    /// Takes every node pushed so far, leaving the list empty.
    ///
    /// The returned iterator owns the nodes; values not iterated are dropped
    /// with it.
    pub fn drain(&self) -> Drain<T> {
        Drain {
            node: self.head.swap(null_mut(), Ordering::AcqRel),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for AtomicList<T> {
    fn drop(&mut self) {
        drop(self.drain());
    }
}

/// An owning iterator over the values drained from an [`AtomicList`], in
/// reverse push order.
pub struct Drain<T> {
    node: *mut Node<T>,
    _marker: PhantomData<Box<Node<T>>>,
}

// SAFETY: the drain owns its nodes exclusively
unsafe impl<T: Send> Send for Drain<T> {}

impl<T> Drain<T> {
    /// Returns `true` when the drain captured no nodes.
    pub fn is_empty(&self) -> bool {
        self.node.is_null()
    }
}

impl<T> Iterator for Drain<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.node.is_null() {
            return None;
        }
        // SAFETY: the node was created by Box::into_raw in push and is owned
        // by this drain
        let node = unsafe { Box::from_raw(self.node) };
        self.node = node.next;
        Some(node.value)
    }
}

impl<T> Drop for Drain<T> {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}

/// A cell written by one elected leader worker and read by the others after
/// the next phase barrier.
///
/// The coordinator's barrier establishes the happens-before edge between the
/// leader's writes and the other workers' reads; the cell itself adds no
/// synchronization, only the accessors to express the discipline.
pub struct LeaderCell<T> {
    value: UnsafeCell<T>,
}

// SAFETY: access is externally synchronized per the type's contract
unsafe impl<T: Send> Sync for LeaderCell<T> {}

impl<T: Default> Default for LeaderCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> LeaderCell<T> {
    /// Creates a cell holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Reads the cell.
    ///
    /// # Safety
    /// The caller must be ordered after every write to the cell, which the
    /// phase barrier provides for writes from earlier phases or sub-steps.
    pub unsafe fn get(&self) -> &T {
        // SAFETY: forwarded to the caller
        unsafe { &*self.value.get() }
    }

    /// Writes the cell as the elected leader.
    ///
    /// # Safety
    /// The caller must be the only thread accessing the cell until the next
    /// phase barrier (e.g. by holding the operator's leader flag).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        // SAFETY: forwarded to the caller
        unsafe { &mut *self.value.get() }
    }

    /// Exclusive access through an exclusive reference; nothing to
    /// synchronize.
    pub fn as_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Consumes the cell, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_drain_transfers_everything() {
        let list = AtomicList::new();
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let list = &list;
                scope.spawn(move || {
                    for i in 0..1000 {
                        list.push(t * 1000 + i);
                    }
                });
            }
        });
        let mut values: Vec<u64> = list.drain().collect();
        assert_eq!(values.len(), 4000);
        values.sort_unstable();
        assert_eq!(values, (0..4000).collect::<Vec<_>>());
        assert!(list.drain().is_empty());
    }

    #[test]
    fn pushed_value_stays_mutable() {
        let list = AtomicList::new();
        let slot = list.push(1u32);
        // SAFETY: this thread pushed the value and the list is still alive
        unsafe { *slot += 41 };
        assert_eq!(list.drain().collect::<Vec<_>>(), [42]);
    }

    #[test]
    fn undrained_nodes_are_freed() {
        use std::sync::atomic::AtomicUsize;
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Witness;
        impl Drop for Witness {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let list = AtomicList::new();
        list.push(Witness);
        list.push(Witness);
        drop(list);
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
    }
}
