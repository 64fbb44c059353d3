//! The signal-based quiesce protocol: the reclaimer asks every other
//! registered, active thread to scan its own stack in place, via a
//! `SA_SIGINFO` handler that reads the interrupted register file out of
//! the `ucontext_t` the kernel hands it.
//!
//! The handler touches only atomics, a thread-local pointer, and a tight
//! read loop over memory it has been told is safe to read — no
//! allocation, no locking, as required of anything that can run between
//! arbitrary instructions of the victim thread.
//!
//! Register-file introspection here is Linux/x86_64-specific, matching
//! the one platform the underlying protocol was designed against.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use quiesce_registry::{Registry, ThreadRecord};
use std::cell::Cell;
use std::sync::Arc;

/// A scan callback: given an opaque context pointer and a `[low, high)`
/// word range, probe every aligned word in range against the retired set.
/// Must be async-signal-safe: no allocation, no blocking.
pub type ScanFn = unsafe extern "C" fn(ctx: *const c_void, low: usize, high: usize);

thread_local! {
    /// Raw pointer into this thread's own `ThreadRecord`. The registry
    /// keeps the backing `Arc` alive; this is only ever read by the
    /// handler running *on this same thread*, so there is no ownership
    /// race to resolve.
    static CURRENT_RECORD: Cell<*const ThreadRecord> = Cell::new(std::ptr::null());
}

static REGISTRY: OnceCell<Arc<Registry>> = OnceCell::new();
static ACK_COUNT: AtomicUsize = AtomicUsize::new(0);
static CURRENT_ROUND: AtomicU64 = AtomicU64::new(0);
static SCAN_FN: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static SCAN_CTX: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to install quiesce signal handler: {0}")]
    InstallFailed(std::io::Error),
}

/// One real-time signal reserved for the quiesce protocol.
fn quiesce_signum() -> libc::c_int {
    // SAFETY: SIGRTMIN() is a pure query of a libc constant, always safe.
    unsafe { libc::SIGRTMIN() }
}

/// Install the quiesce signal handler and remember `registry` for
/// `signal_all_except`. Must be called once, at load time, before any
/// thread is registered.
pub fn install(registry: Arc<Registry>) -> Result<(), SignalError> {
    let _ = REGISTRY.set(registry);

    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = quiesce_handler as usize;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    // SAFETY: sigemptyset is infallible for a valid, zeroed sigset_t.
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };

    let rc = unsafe { libc::sigaction(quiesce_signum(), &sa, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(SignalError::InstallFailed(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Bind the calling thread's per-handler pointer to `record`. Must be
/// called once per thread, before the thread can be targeted by a
/// quiesce signal (i.e. before or immediately after registration).
pub fn bind_current_thread(record: &Arc<ThreadRecord>) {
    CURRENT_RECORD.with(|c| c.set(Arc::as_ptr(record)));
}

/// Clear the calling thread's handler pointer. Call before the thread
/// deregisters, so a stray late-delivered signal finds nothing to act on.
pub fn unbind_current_thread() {
    CURRENT_RECORD.with(|c| c.set(std::ptr::null()));
}

extern "C" fn quiesce_handler(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let record_ptr = CURRENT_RECORD.with(|c| c.get());
    if record_ptr.is_null() {
        return;
    }
    // SAFETY: the registry holds an Arc keeping the pointee alive for as
    // long as this thread could still be signalled; see CURRENT_RECORD.
    let record = unsafe { &*record_ptr };

    let round = CURRENT_ROUND.load(Ordering::SeqCst);
    record.raise_helping_flag(round);

    let rsp = unsafe {
        let uc = ctx as *mut libc::ucontext_t;
        (*uc).uc_mcontext.gregs[libc::REG_RSP as usize] as usize
    };

    let scan_fn = SCAN_FN.load(Ordering::Acquire);
    let scan_ctx = SCAN_CTX.load(Ordering::Acquire);
    let (_, stack_high) = record.stack_bounds();

    if !scan_fn.is_null() && rsp != 0 && rsp < stack_high {
        // SAFETY: SCAN_FN/SCAN_CTX were published with Release before the
        // signal was sent, and are read here with Acquire.
        let f: ScanFn = unsafe { std::mem::transmute(scan_fn) };
        unsafe { f(scan_ctx, rsp, stack_high) };
    }

    if let Some(block) = record.local_block() {
        if !scan_fn.is_null() {
            let f: ScanFn = unsafe { std::mem::transmute(scan_fn) };
            unsafe { f(scan_ctx, block.low, block.high) };
        }
    }

    ACK_COUNT.fetch_add(1, Ordering::AcqRel);
    record.lower_helping_flag();
}

/// Publish the scan callback for the round about to be announced, then
/// signal every registered, active thread except `self_id`. Returns the
/// number of signals successfully delivered -- the authoritative count
/// [`wait_for_acks`] waits for, since a thread that exited between the
/// registry walk and the `pthread_kill` attempt is excluded rather than
/// treated as an error.
pub fn signal_all_except(registry: &Registry, self_id: u64, round: u64, scan_fn: ScanFn, scan_ctx: *const c_void) -> usize {
    ACK_COUNT.store(0, Ordering::Release);
    SCAN_FN.store(scan_fn as *mut c_void, Ordering::Release);
    SCAN_CTX.store(scan_ctx as *mut c_void, Ordering::Release);
    CURRENT_ROUND.store(round, Ordering::SeqCst);

    let mut delivered = 0usize;
    registry.for_each(|record| {
        if record.thread_id == self_id || !record.is_active() {
            return;
        }
        // SAFETY: handle is a pthread_t captured at registration; the
        // signal number is the one this library installed a handler for.
        let rc = unsafe { libc::pthread_kill(record.handle, quiesce_signum()) };
        match rc {
            0 => delivered += 1,
            libc::ESRCH => {
                log::debug!("thread {} exited before signal delivery", record.thread_id);
            }
            other => {
                log::error!("pthread_kill failed unexpectedly: {other}");
                std::process::abort();
            }
        }
    });
    delivered
}

/// Busy-wait until `expected` acknowledgments have been recorded, then
/// fence so the reclaimer's subsequent reads observe every bystander's
/// scan writes.
pub fn wait_for_acks(expected: usize) {
    while ACK_COUNT.load(Ordering::Acquire) < expected {
        std::hint::spin_loop();
    }
    std::sync::atomic::fence(Ordering::Acquire);
}

/// Run the scanner over the reclaimer's own stack and local block, using
/// the same callback bystanders use. Called after `wait_for_acks` so the
/// reclaimer's own contribution is folded in with everyone else's.
///
/// # Safety
/// `rsp` must be a valid, currently-live stack address between the
/// caller's true stack pointer and `self_record`'s recorded stack bounds.
pub unsafe fn scan_self(self_record: &ThreadRecord, rsp: usize, scan_fn: ScanFn, scan_ctx: *const c_void) {
    let (_, stack_high) = self_record.stack_bounds();
    if rsp < stack_high {
        scan_fn(scan_ctx, rsp, stack_high);
    }
    if let Some(block) = self_record.local_block() {
        scan_fn(scan_ctx, block.low, block.high);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signum_is_a_realtime_signal() {
        let sig = quiesce_signum();
        assert!(sig >= libc::SIGRTMIN());
        assert!(sig <= libc::SIGRTMAX());
    }

    #[test]
    fn signal_all_except_skips_self_and_inactive() {
        let registry = Registry::new();
        let me = ThreadRecord::new(1, 1024);
        me.set_active(true);
        registry.register(me).unwrap();

        let inactive = ThreadRecord::new(2, 1024);
        inactive.set_active(false);
        registry.register(inactive).unwrap();

        unsafe extern "C" fn noop(_ctx: *const c_void, _low: usize, _high: usize) {}
        let delivered = signal_all_except(&registry, 1, 7, noop, std::ptr::null());
        assert_eq!(delivered, 0);
    }

    #[test]
    fn wait_for_acks_returns_once_threshold_met() {
        ACK_COUNT.store(3, Ordering::Release);
        wait_for_acks(3);
    }
}
