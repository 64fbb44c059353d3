//! The dedicated background thread that performs every reclamation round
//! when the subprocess snapshot strategy is compiled in.
//!
//! Forking a multithreaded process is only safe from a thread that holds
//! none of the application's locks at the instant of the call -- any lock
//! another thread was mid-acquisition of when `fork` runs is duplicated
//! into the child in whatever state it happened to be in, and the child
//! only ever has the one thread that survived the fork to unlock it.
//! Unlike the in-process strategy, where any retirer that wins the
//! reclamation token may run the round itself, the subprocess strategy
//! therefore always delegates to this one thread, parked on a condition
//! variable between rounds.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use quiesce_index::LeftoverStack;
use quiesce_registry::Registry;
use quiesce_token::Token;

use crate::{RoundContext, SnapshotStrategy};

struct Shared {
    pending: bool,
    generation: u64,
    freed: usize,
}

/// Handle to the spawned reclamation thread. Dropping it does not join or
/// stop the thread -- the process-wide context this lives in is never
/// torn down before process exit.
pub struct GcThread {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    _handle: JoinHandle<()>,
}

impl GcThread {
    /// Spawn the thread. `self_id` is the id the round's `RoundContext`
    /// carries; the subprocess strategy never reads it (it has no
    /// per-thread stack to exclude -- the forked child walks the whole
    /// process memory map instead), so any id distinct from a real
    /// registered thread's is fine.
    pub fn spawn(
        registry: Arc<Registry>,
        leftover: LeftoverStack,
        token: Token,
        strategy: Box<dyn SnapshotStrategy>,
        self_id: u64,
    ) -> Self {
        let shared = Arc::new((
            Mutex::new(Shared {
                pending: false,
                generation: 0,
                freed: 0,
            }),
            Condvar::new(),
        ));
        let worker_shared = shared.clone();

        let handle = std::thread::Builder::new()
            .name("quiesce-gc".to_string())
            .spawn(move || loop {
                let (lock, cv) = &*worker_shared;
                {
                    let mut guard = lock.lock().unwrap();
                    while !guard.pending {
                        guard = cv.wait(guard).unwrap();
                    }
                    guard.pending = false;
                }

                let freed = match token.try_acquire(&registry) {
                    Some(round) => {
                        let ctx = RoundContext {
                            registry: &registry,
                            leftover: &leftover,
                            self_id,
                        };
                        let freed = strategy.run_round(&ctx, round);
                        token.release();
                        freed
                    }
                    // Only this thread ever calls try_acquire in the
                    // subprocess build, so a failed acquisition here would
                    // mean the token was held by a round this same thread
                    // started but has not yet released -- unreachable
                    // given the loop's single-flight structure, but fail
                    // safe rather than spin.
                    None => 0,
                };

                let mut guard = lock.lock().unwrap();
                guard.freed = freed;
                guard.generation += 1;
                cv.notify_all();
            })
            .expect("failed to spawn the quiesce reclamation thread");

        GcThread {
            shared,
            _handle: handle,
        }
    }

    /// Request a round and block until it completes, returning the number
    /// of blocks that round freed. Multiple concurrent callers fold into
    /// whichever round is current or next; a caller whose own ring is
    /// still full afterward is expected to call again (mirroring the
    /// retry loop around the in-process strategy's token contention).
    pub fn request_round_and_wait(&self) -> usize {
        let (lock, cv) = &*self.shared;
        let mut guard = lock.lock().unwrap();
        let start = guard.generation;
        guard.pending = true;
        cv.notify_all();
        while guard.generation == start {
            guard = cv.wait(guard).unwrap();
        }
        guard.freed
    }
}
