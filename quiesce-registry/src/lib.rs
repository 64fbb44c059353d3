//! The process-wide list of live thread records.
//!
//! A [`ThreadRecord`] is created once per registered thread and lives for as
//! long as either the owning thread or an in-flight reclaimer holds a
//! reference to it: it is an ordinary `Arc`, so the source's hand-rolled
//! reference count and deferred free fall out of normal `Arc` drop glue.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quiesce_ring::Ring;

/// Compile-time cap on concurrently registered threads.
pub const MAX_THREADS: usize = 128;

/// High bit of the packed timestamp: "a reclaimer is helping/active".
const FLAG_BIT: u64 = 1 << 63;
const ROUND_MASK: u64 = FLAG_BIT - 1;

/// Pack a round number and helping flag into the timestamp encoding used
/// by both the reclamation token and each thread's local timestamp.
pub fn pack_timestamp(round: u64, helping: bool) -> u64 {
    let round = round & ROUND_MASK;
    if helping {
        round | FLAG_BIT
    } else {
        round
    }
}

/// Extract the round number, discarding the helping flag.
pub fn round_of(timestamp: u64) -> u64 {
    timestamp & ROUND_MASK
}

/// Extract the helping flag.
pub fn is_helping(timestamp: u64) -> bool {
    timestamp & FLAG_BIT != 0
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("exceeded maximum thread count ({MAX_THREADS})")]
    TooManyThreads,
}

/// A registered local memory region (outside the stack) that must also be
/// scanned on this thread's behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalBlock {
    pub low: usize,
    pub high: usize,
}

/// Per-thread bookkeeping the reclaimer needs: stack bounds, activity state,
/// the thread's retire ring, an optional registered local block, and the
/// round-acknowledgment timestamp.
pub struct ThreadRecord {
    pub thread_id: u64,
    pub handle: libc::pthread_t,
    stack_low: AtomicUsize,
    stack_high: AtomicUsize,
    is_active: AtomicBool,
    pub ring: Ring,
    /// `low == 0` means "no block registered" -- a quiesce signal can
    /// land on this same thread mid-update (see `register_local_block`),
    /// so this must be readable from the handler without a lock (spec
    /// §9, "Signal handler reentrancy": the handler may only touch
    /// atomics, never acquire a mutex).
    local_block_low: AtomicUsize,
    local_block_high: AtomicUsize,
    /// High bit = helping flag, low 63 bits = last-observed round.
    timestamp: AtomicU64,
    pub times_without_update: AtomicU32,
}

// SAFETY: pthread_t on the platforms this crate targets is a plain integer
// handle with no thread-affinity semantics of its own.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    pub fn new(thread_id: u64, ring_capacity: usize) -> Arc<Self> {
        Arc::new(ThreadRecord {
            thread_id,
            // SAFETY: pthread_self() always succeeds and returns a handle
            // for the calling thread.
            handle: unsafe { libc::pthread_self() },
            stack_low: AtomicUsize::new(0),
            stack_high: AtomicUsize::new(0),
            is_active: AtomicBool::new(false),
            ring: Ring::new(ring_capacity),
            local_block_low: AtomicUsize::new(0),
            local_block_high: AtomicUsize::new(0),
            timestamp: AtomicU64::new(0),
            times_without_update: AtomicU32::new(0),
        })
    }

    pub fn set_stack_bounds(&self, low: usize, high: usize) {
        self.stack_low.store(low, Ordering::Relaxed);
        self.stack_high.store(high, Ordering::Release);
    }

    pub fn stack_bounds(&self) -> (usize, usize) {
        (
            self.stack_low.load(Ordering::Relaxed),
            self.stack_high.load(Ordering::Acquire),
        )
    }

    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Overwrites any previously registered block. `low` is stored as the
    /// zero sentinel while `high` is being updated so a quiesce signal
    /// that lands on this same thread mid-call (see `local_block`) never
    /// observes a torn mix of the old `high` with the new `low`, or vice
    /// versa -- it instead sees either the fully-old block or "no block"
    /// until this call's final store publishes the fully-new one.
    pub fn register_local_block(&self, low: usize, high: usize) {
        self.local_block_low.store(0, Ordering::Release);
        self.local_block_high.store(high, Ordering::Release);
        self.local_block_low.store(low, Ordering::Release);
    }

    pub fn clear_local_block(&self) {
        self.local_block_low.store(0, Ordering::Release);
    }

    /// Lock-free: called from the signal handler, which must never block.
    pub fn local_block(&self) -> Option<LocalBlock> {
        let low = self.local_block_low.load(Ordering::Acquire);
        if low == 0 {
            return None;
        }
        let high = self.local_block_high.load(Ordering::Acquire);
        Some(LocalBlock { low, high })
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Raise this thread's helping flag and echo the current global round.
    /// Called from the signal handler (or, for the reclaimer's own stack,
    /// from the round-orchestration code) on flag-entry.
    ///
    /// Returns whether the observed round differs from the one previously
    /// recorded, which callers use to maintain `times_without_update`.
    pub fn raise_helping_flag(&self, current_round: u64) -> bool {
        let old_round = round_of(self.timestamp.load(Ordering::Relaxed));
        self.timestamp
            .store(pack_timestamp(old_round, true), Ordering::SeqCst);
        std::sync::atomic::fence(Ordering::SeqCst);
        self.timestamp
            .store(pack_timestamp(current_round, true), Ordering::SeqCst);
        let updated = current_round != old_round;
        if updated {
            self.times_without_update.store(0, Ordering::Relaxed);
        } else {
            self.times_without_update.fetch_add(1, Ordering::Relaxed);
        }
        updated
    }

    /// Lower the helping flag, keeping the last-observed round.
    pub fn lower_helping_flag(&self) {
        let round = round_of(self.timestamp.load(Ordering::Relaxed));
        self.timestamp
            .store(pack_timestamp(round, false), Ordering::Release);
    }
}

/// The process-wide list of registered thread records, protected by one
/// lock. Iteration follows an "acquire, walk, release" pattern; callers
/// that need to act on a record outside the lock should clone the `Arc`
/// first.
pub struct Registry {
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, record: Arc<ThreadRecord>) -> Result<(), RegistryError> {
        let mut guard = self.threads.lock();
        if guard.len() >= MAX_THREADS {
            return Err(RegistryError::TooManyThreads);
        }
        guard.push(record);
        Ok(())
    }

    pub fn deregister(&self, record: &Arc<ThreadRecord>) {
        let mut guard = self.threads.lock();
        if let Some(pos) = guard.iter().position(|r| Arc::ptr_eq(r, record)) {
            guard.swap_remove(pos);
        }
    }

    /// Apply `f` to every registered record while holding the lock.
    pub fn for_each<F: FnMut(&Arc<ThreadRecord>)>(&self, mut f: F) {
        let guard = self.threads.lock();
        for record in guard.iter() {
            f(record);
        }
    }

    /// Find the (reference-counted) record whose stack range contains
    /// `addr`. Used so a foreign thread can safely act on a stack-resident
    /// address without racing the owner's exit.
    pub fn find_by_stack_address(&self, addr: usize) -> Option<Arc<ThreadRecord>> {
        let guard = self.threads.lock();
        guard.iter().find_map(|record| {
            let (low, high) = record.stack_bounds();
            (addr >= low && addr < high).then(|| record.clone())
        })
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_pack_unpack_roundtrips() {
        let t = pack_timestamp(42, true);
        assert_eq!(round_of(t), 42);
        assert!(is_helping(t));
        let t2 = pack_timestamp(42, false);
        assert_eq!(round_of(t2), 42);
        assert!(!is_helping(t2));
    }

    #[test]
    fn register_and_find_by_stack_address() {
        let registry = Registry::new();
        let rec = ThreadRecord::new(1, 1024);
        rec.set_stack_bounds(0x1000, 0x2000);
        registry.register(rec.clone()).unwrap();

        let found = registry.find_by_stack_address(0x1500).unwrap();
        assert_eq!(found.thread_id, 1);
        assert!(registry.find_by_stack_address(0x5000).is_none());
    }

    #[test]
    fn deregister_removes_record() {
        let registry = Registry::new();
        let rec = ThreadRecord::new(2, 1024);
        registry.register(rec.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        registry.deregister(&rec);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn registering_past_the_cap_is_rejected() {
        let registry = Registry::new();
        for i in 0..MAX_THREADS {
            registry
                .register(ThreadRecord::new(i as u64, 1024))
                .unwrap();
        }
        let one_too_many = ThreadRecord::new(9999, 1024);
        assert!(matches!(
            registry.register(one_too_many),
            Err(RegistryError::TooManyThreads)
        ));
    }

    #[test]
    fn local_block_roundtrip() {
        let rec = ThreadRecord::new(3, 1024);
        assert!(rec.local_block().is_none());
        rec.register_local_block(0x4000, 0x5000);
        assert_eq!(
            rec.local_block(),
            Some(LocalBlock {
                low: 0x4000,
                high: 0x5000
            })
        );
        rec.clear_local_block();
        assert!(rec.local_block().is_none());
    }
}
