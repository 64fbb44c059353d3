//! Concurrent, non-blocking memory reclamation for programs built around
//! optimistic/lock-free data structures.
//!
//! Threads [`retire`] heap blocks whose removal has been committed but
//! whose freeing would be unsafe while other threads may still hold
//! references. This crate buffers retired pointers per thread, and when
//! a thread's buffer saturates, one contender becomes the reclaimer: it
//! takes a consistent snapshot of every thread's stack (plus any
//! registered local block), and frees only the retired blocks no
//! reference was found for. The rest carry over to the next round.
//!
//! Threads created with [`thread::spawn`] are tracked automatically; the
//! process's main thread is registered by a load-time constructor.

pub mod config;
pub mod error;
pub mod logging;
pub mod thread;

#[cfg(feature = "interpose")]
mod interpose;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use quiesce_alloc::PageAllocator;
use quiesce_registry::Registry;

#[cfg(feature = "subprocess")]
use quiesce_snapshot::{GcThread, SubprocessStrategy};
#[cfg(not(feature = "subprocess"))]
use quiesce_index::LeftoverStack;
#[cfg(not(feature = "subprocess"))]
use quiesce_snapshot::{InProcessStrategy, RoundContext, SnapshotStrategy};
#[cfg(not(feature = "subprocess"))]
use quiesce_token::Token;

/// A sentinel thread id reserved for the dedicated subprocess reclamation
/// thread, which never registers a `ThreadRecord` of its own -- it has no
/// stack to scan, since the forked child walks the whole process memory
/// map instead (see `quiesce_snapshot::SubprocessStrategy`). Real thread
/// ids from `thread::next_thread_id` start at 1, so this never collides.
#[cfg(feature = "subprocess")]
const GC_THREAD_SENTINEL_ID: u64 = 0;

/// Forking safely requires a single, lock-free caller, so the subprocess
/// build always reclaims through its dedicated `GcThread`; the in-process
/// build lets whichever retirer wins the reclamation token run the round
/// itself. The choice between the two is made once, here, at compile time
/// -- never at runtime -- matching the design's "compile/link-time
/// decision" between snapshot strategies.
#[cfg(feature = "subprocess")]
struct Context {
    registry: Arc<Registry>,
    #[allow(dead_code)] // kept alive for the subprocess strategy's range bookkeeping
    alloc: Arc<PageAllocator>,
    gc: GcThread,
}

#[cfg(not(feature = "subprocess"))]
struct Context {
    registry: Arc<Registry>,
    token: Token,
    leftover: LeftoverStack,
    #[allow(dead_code)] // unused by the in-process strategy, present for parity with the subprocess build
    alloc: Arc<PageAllocator>,
    strategy: Box<dyn SnapshotStrategy>,
}

static CONTEXT: OnceCell<Context> = OnceCell::new();

fn context() -> &'static Context {
    CONTEXT.get_or_init(|| {
        let registry = Arc::new(Registry::new());
        if let Err(e) = quiesce_signal::install(registry.clone()) {
            error::abort(error::Fatal::SignalInstall(e));
        }
        let alloc = Arc::new(PageAllocator::new());

        #[cfg(feature = "subprocess")]
        {
            let strategy = Box::new(SubprocessStrategy::new(alloc.clone()));
            let gc = GcThread::spawn(
                registry.clone(),
                quiesce_index::LeftoverStack::new(),
                quiesce_token::Token::new(),
                strategy,
                GC_THREAD_SENTINEL_ID,
            );
            Context { registry, alloc, gc }
        }
        #[cfg(not(feature = "subprocess"))]
        {
            let strategy: Box<dyn SnapshotStrategy> = Box::new(InProcessStrategy::new());
            Context {
                registry,
                token: Token::new(),
                leftover: LeftoverStack::new(),
                alloc,
                strategy,
            }
        }
    })
}

/// Runs once before `main`: installs the signal handler (via
/// `context()`) and registers the main thread, recovering its stack
/// bounds from its own `/proc/self/maps` `[stack]` entry rather than
/// intercepting process entry.
#[ctor::ctor]
fn bootstrap_main_thread() {
    let ctx = context();
    let tid = thread::next_thread_id();
    let record = quiesce_registry::ThreadRecord::new(tid, config::CONFIG.ring_capacity);

    match quiesce_procmap::read_self_maps().ok().and_then(|maps| quiesce_procmap::stack_range(&maps)) {
        Some((low, high)) => record.set_stack_bounds(low, high),
        None => log::warn!("could not locate the main thread's stack range in /proc/self/maps"),
    }

    if ctx.registry.register(record.clone()).is_err() {
        error::abort(error::Fatal::MaxThreadsExceeded);
    }
    quiesce_signal::bind_current_thread(&record);
    thread::bind_current(record.clone());
    // Last step, mirroring `thread::register_self`: only now is the
    // registry entry reachable, is_active, and the signal handler's
    // pointer bound, so a reclaimer that signals this thread after
    // observing is_active == true is guaranteed to find a live handler.
    record.set_active(true);
}

/// Submit a pointer previously allocated by the system allocator for
/// eventual release.
///
/// # Safety
/// `ptr` must have been obtained from an allocation compatible with
/// `libc::free`, and the caller must have already ensured it is no
/// longer reachable from any subsequently-published data structure: any
/// concurrent reader must have obtained its copy of the pointer before
/// the removal was published. The pointer must not be used again by the
/// caller after this call.
pub unsafe fn retire(ptr: *mut u8) {
    if ptr.is_null() {
        log::warn!("retire called with a null pointer");
        return;
    }

    let record = match thread::current() {
        Some(r) => r,
        None => {
            log::error!("retire called from a thread this crate never registered");
            std::process::abort();
        }
    };

    record.ring.push(ptr as u64);

    let ctx = context();
    while record.ring.is_full() {
        #[cfg(feature = "subprocess")]
        {
            let freed = ctx.gc.request_round_and_wait();
            log::debug!("reclamation round freed {freed} blocks");
        }
        #[cfg(not(feature = "subprocess"))]
        {
            match ctx.token.try_acquire(&ctx.registry) {
                Some(round) => {
                    let round_ctx = RoundContext {
                        registry: &ctx.registry,
                        leftover: &ctx.leftover,
                        self_id: record.thread_id,
                    };
                    let freed = ctx.strategy.run_round(&round_ctx, round);
                    log::debug!("reclamation round {round} freed {freed} blocks");
                    ctx.token.release();
                }
                None => std::thread::yield_now(),
            }
        }
    }
}

/// Record a per-thread region outside the stack that must also be
/// scanned during reclamation. Overwrites any prior registration made by
/// the calling thread.
pub fn register_local_block(ptr: *mut u8, len: usize) {
    match thread::current() {
        Some(record) => record.register_local_block(ptr as usize, ptr as usize + len),
        None => log::warn!("register_local_block called from a thread this crate never registered"),
    }
}

/// Clear any local block the calling thread previously registered.
pub fn clear_local_block() {
    if let Some(record) = thread::current() {
        record.clear_local_block();
    }
}
