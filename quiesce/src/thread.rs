//! Thread bootstrap: the safe `spawn` wrapper that is the default way to
//! create a thread this crate will track, plus the shared registration
//! logic the `interpose` feature's transparent `pthread_create` override
//! also uses.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quiesce_registry::ThreadRecord;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadRecord>>> = RefCell::new(None);
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn bind_current(record: Arc<ThreadRecord>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(record));
}

pub(crate) fn unbind_current() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

pub(crate) fn current() -> Option<Arc<ThreadRecord>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Ask the C library for the calling thread's stack bounds. Used for
/// every thread except the main one, whose stack is instead found via
/// its `/proc/self/maps` `[stack]` entry (see the crate root's ctor).
pub(crate) fn current_stack_bounds() -> (usize, usize) {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return (0, 0);
        }
        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ok = libc::pthread_attr_getstack(&attr, &mut stackaddr, &mut stacksize) == 0;
        libc::pthread_attr_destroy(&mut attr);
        if !ok {
            return (0, 0);
        }
        let low = stackaddr as usize;
        (low, low + stacksize)
    }
}

/// Register the calling thread with a fresh `ThreadRecord` and bind it as
/// this thread's current record. Shared by `spawn` and the `interpose`
/// feature's trampoline.
///
/// `set_active(true)` is deliberately the *last* step. `Registry::register`
/// publishes the record to the registry lock before this function returns,
/// and `signal_all_except` targets any registered record it sees with
/// `is_active() == true` -- if the flag were raised any earlier, a
/// reclaimer walking the registry between that store and
/// `bind_current_thread` below could deliver this thread a quiesce signal
/// while `CURRENT_RECORD` is still null. The handler would see a null
/// pointer, return immediately without incrementing `ACK_COUNT`, and the
/// reclaimer's `wait_for_acks` would spin forever.
pub(crate) fn register_self() -> Arc<ThreadRecord> {
    let ctx = crate::context();
    let tid = next_thread_id();
    let record = ThreadRecord::new(tid, crate::config::CONFIG.ring_capacity);
    let (low, high) = current_stack_bounds();
    record.set_stack_bounds(low, high);
    if ctx.registry.register(record.clone()).is_err() {
        crate::error::abort(crate::error::Fatal::MaxThreadsExceeded);
    }
    quiesce_signal::bind_current_thread(&record);
    bind_current(record.clone());
    record.set_active(true);
    record
}

/// Undo `register_self`: lower the active flag first so no further
/// quiesce signal is addressed to this thread, then unbind the signal
/// handler's pointer (so a signal already in flight finds nothing to act
/// on), then drop the registry's reference.
pub(crate) fn deregister_self(record: &Arc<ThreadRecord>) {
    record.set_active(false);
    quiesce_signal::unbind_current_thread();
    unbind_current();
    crate::context().registry.deregister(record);
}

struct Deregistration(Arc<ThreadRecord>);

impl Drop for Deregistration {
    fn drop(&mut self) {
        deregister_self(&self.0);
    }
}

/// The primary, safe thread-creation entry point: a thin wrapper over
/// `std::thread::Builder` that registers a `ThreadRecord` before running
/// `f` and deregisters it when `f` returns (including on panic, via
/// `Drop`).
pub fn spawn<F, T>(f: F) -> std::io::Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new().spawn(move || {
        let record = register_self();
        let _guard = Deregistration(record);
        f()
    })
}

/// Like [`spawn`] but with a descriptive OS thread name, for diagnostics.
pub fn spawn_named<F, T>(name: impl Into<String>, f: F) -> std::io::Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new().name(name.into()).spawn(move || {
        let record = register_self();
        let _guard = Deregistration(record);
        f()
    })
}
