//! Transparent `pthread_create` interception, for embedding this crate
//! into code that was not written against [`crate::thread::spawn`]. Only
//! compiled in with the `interpose` feature; the default build expects
//! callers to use the safe wrapper instead.
//!
//! The real `pthread_create` is resolved once via `dlsym(RTLD_NEXT, ...)`
//! exactly as the upstream implementation's loader-time override does; a
//! small heap-allocated trampoline substitutes the caller's start routine
//! so registration happens on the new thread before user code runs.

use std::ffi::c_void;

use once_cell::sync::Lazy;

type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    extern "C" fn(*mut c_void) -> *mut c_void,
    *mut c_void,
) -> libc::c_int;

static REAL_PTHREAD_CREATE: Lazy<PthreadCreateFn> = Lazy::new(|| unsafe {
    let name = b"pthread_create\0";
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char);
    if sym.is_null() {
        log::error!("could not resolve the real pthread_create via RTLD_NEXT");
        std::process::abort();
    }
    std::mem::transmute::<*mut c_void, PthreadCreateFn>(sym)
});

struct TrampolineArgs {
    real_start: extern "C" fn(*mut c_void) -> *mut c_void,
    real_arg: *mut c_void,
}

extern "C" fn trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: arg was produced by Box::into_raw in `pthread_create` below
    // and is passed exactly once to exactly one new thread.
    let args = unsafe { Box::from_raw(arg as *mut TrampolineArgs) };
    let record = crate::thread::register_self();
    let result = (args.real_start)(args.real_arg);
    crate::thread::deregister_self(&record);
    result
}

/// Overrides the process-wide `pthread_create` symbol. Every subsequent
/// thread creation anywhere in the process -- including by code this
/// crate has no knowledge of -- is transparently registered.
///
/// # Safety
/// Inherits all of `pthread_create`'s usual safety requirements; in
/// addition, overriding a libc symbol this way is only sound when this
/// crate is linked into the final binary (not loaded as a plugin after
/// `pthread_create` has already been resolved elsewhere).
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
) -> libc::c_int {
    let boxed = Box::new(TrampolineArgs {
        real_start: start_routine,
        real_arg: arg,
    });
    let raw = Box::into_raw(boxed) as *mut c_void;
    (REAL_PTHREAD_CREATE)(thread, attr, trampoline, raw)
}
