//! A lock-free singly-linked stack of leftover-address pages, carried from
//! one reclamation round to the next.
//!
//! Nodes are never recycled within a round: each node is the page-backed
//! buffer the classifier produced, pushed once and popped once. That is
//! what keeps the CAS on `head` ABA-safe without a tagged pointer or
//! hazard scheme of its own.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node {
    data: Box<[u64]>,
    next: *mut Node,
}

pub struct LeftoverStack {
    head: AtomicPtr<Node>,
}

impl Default for LeftoverStack {
    fn default() -> Self {
        Self::new()
    }
}

impl LeftoverStack {
    pub fn new() -> Self {
        LeftoverStack {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push one leftover page. Empty pages are not pushed.
    pub fn push(&self, data: Box<[u64]>) {
        if data.is_empty() {
            return;
        }
        let node = Box::into_raw(Box::new(Node {
            data,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: node was just allocated and is not yet published.
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Atomically take the whole list, returning every page's contents
    /// flattened into one buffer. Called once at the start of each round,
    /// before any new leftovers from *this* round are pushed.
    pub fn drain_all(&self) -> Vec<u64> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut out = Vec::new();
        while !head.is_null() {
            // SAFETY: head was published by `push` and is owned exclusively
            // by whichever thread's swap observed it; we just did.
            let node = unsafe { Box::from_raw(head) };
            out.extend_from_slice(&node.data);
            head = node.next;
        }
        out
    }
}

// SAFETY: Node is only ever reached through the atomic head pointer, with
// exclusive ownership transferred by swap/CAS.
unsafe impl Send for LeftoverStack {}
unsafe impl Sync for LeftoverStack {}
