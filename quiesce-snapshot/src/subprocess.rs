//! Fork a throwaway snapshot process instead of signalling bystanders.
//! The child inherits a copy-on-write image of the whole address space at
//! the instant of the fork, scans it at leisure, and reports results back
//! over a pipe; only the parent ever calls `free`.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe, write, ForkResult};

use quiesce_alloc::PageAllocator;
use quiesce_index::{Index, MarkKind};
use quiesce_reap::cascade_fixpoint;
use quiesce_scan::{scan_range_refcount, RefcountScanCtx};

use crate::{RoundContext, SnapshotStrategy};

pub struct SubprocessStrategy {
    alloc: Arc<PageAllocator>,
}

impl SubprocessStrategy {
    pub fn new(alloc: Arc<PageAllocator>) -> Self {
        SubprocessStrategy { alloc }
    }
}

impl SnapshotStrategy for SubprocessStrategy {
    fn run_round(&self, ctx: &RoundContext<'_>, _round: u64) -> usize {
        let addrs = quiesce_index::aggregate(ctx.registry, ctx.leftover);
        if addrs.is_empty() {
            return 0;
        }
        let index = Index::build(&addrs, MarkKind::RefCount);

        let (read_fd, write_fd) = match pipe() {
            Ok(fds) => fds,
            Err(e) => {
                log::error!("pipe() failed: {e}");
                std::process::abort();
            }
        };

        // SAFETY: fork() is safe to call here; the child's only path
        // forward is `child_main`, which performs no allocation beyond
        // what COW-inherited heap state already supports and exits via
        // `_exit` without unwinding back through caller frames.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(read_fd);
                child_main(&index, &self.alloc, write_fd);
                unreachable!("child_main always exits the process");
            }
            Ok(ForkResult::Parent { child }) => {
                drop(write_fd);
                let (freed, mut leftover) = read_report(read_fd);
                if let Err(e) = waitpid(child, None) {
                    log::error!("waitpid on snapshot child failed: {e}");
                }

                for addr in &freed {
                    // SAFETY: addr came from this round's retired set,
                    // which requires the caller to have allocated it with
                    // the system allocator and relinquished further use.
                    unsafe {
                        if let Some(size) = quiesce_alloc::usable_size(*addr) {
                            std::ptr::write_bytes(*addr as *mut u8, 0, size as usize);
                        }
                        libc::free(*addr as *mut libc::c_void);
                    }
                }

                quiesce_reap::randomize(&mut leftover);
                ctx.leftover.push(leftover.into_boxed_slice());
                freed.len()
            }
            Err(e) => {
                log::error!("fork() failed: {e}");
                std::process::abort();
            }
        }
    }
}

/// Runs entirely inside the forked child. Never returns: it always calls
/// `_exit` directly.
fn child_main(index: &Index, alloc: &PageAllocator, write_fd: OwnedFd) -> ! {
    let size_of = quiesce_alloc::usable_size;

    if let Ok(maps) = quiesce_procmap::read_self_maps() {
        let candidate_ranges = quiesce_procmap::writable_private_ranges(&maps);
        let owned = alloc.owned_ranges();
        let ranges = quiesce_procmap::subtract_owned(&candidate_ranges, &owned);

        let size_of_ref: &(dyn Fn(u64) -> Option<u64> + Sync) = &size_of;
        let scan_ctx = RefcountScanCtx {
            index,
            alloc_size_of: size_of_ref,
        };
        for (low, high) in ranges {
            // SAFETY: ranges came from this process's own memory map and
            // were filtered to writable, private, non-executable regions.
            unsafe { scan_range_refcount(&scan_ctx, low, high) };
        }

        // SAFETY: this process is a COW fork of the parent at the snapshot
        // instant and every range above has just been scanned, so every
        // retired block's bytes are readable here -- the precondition
        // this call requires. Running it before any range is scanned
        // would see every entry's refcount still at its initial zero and
        // treat each as already unreferenced.
        unsafe { cascade_fixpoint(index, size_of) };
    }

    let mut report = Vec::with_capacity(index.len() * 8 + 8);
    for entry in index.entries() {
        if entry.ref_count() == 0 {
            report.extend_from_slice(&entry.addr.to_ne_bytes());
        }
    }
    report.extend_from_slice(&0u64.to_ne_bytes());
    for entry in index.entries() {
        if entry.ref_count() != 0 {
            report.extend_from_slice(&entry.addr.to_ne_bytes());
        }
    }

    let _ = write(&write_fd, &report);
    drop(write_fd);
    // SAFETY: _exit terminates immediately without running destructors,
    // which is required here since we must not return into the forked
    // copy of the parent's call stack or flush shared buffered state.
    unsafe { libc::_exit(0) }
}

/// Read the child's whole report (it always closes the pipe after one
/// write), then split on the zero sentinel into (freeable, leftover).
fn read_report(read_fd: OwnedFd) -> (Vec<u64>, Vec<u64>) {
    let mut file = std::fs::File::from(read_fd);
    let mut bytes = Vec::new();
    if let Err(e) = file.read_to_end(&mut bytes) {
        log::error!("failed reading snapshot child report: {e}");
        return (Vec::new(), Vec::new());
    }

    let words: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
        .collect();

    let mut freed = Vec::new();
    let mut leftover = Vec::new();
    let mut past_sentinel = false;
    for w in words {
        if !past_sentinel && w == 0 {
            past_sentinel = true;
            continue;
        }
        if past_sentinel {
            leftover.push(w);
        } else {
            freed.push(w);
        }
    }
    (freed, leftover)
}
