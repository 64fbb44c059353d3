//! Page-granularity memory, obtained straight from the OS rather than the
//! general-purpose allocator. The library's own bookkeeping structures
//! (per-round scratch buffers, leftover pages) are sized in whole pages so
//! that the subprocess snapshot variant can distinguish "memory this
//! library owns" from "memory the application owns" purely by address
//! range, without threading a type through `/proc/self/maps` parsing.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("mmap failed: {0}")]
    MmapFailed(std::io::Error),
}

fn page_size() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: _SC_PAGESIZE is always a valid sysconf name.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    CACHED.store(sz, Ordering::Relaxed);
    sz
}

/// A single `mmap`-backed range this allocator handed out.
#[derive(Clone, Copy, Debug)]
pub struct PageRange {
    pub low: usize,
    pub high: usize,
}

/// Tracks every live page range this allocator owns, in address order, so
/// the subprocess snapshot's memory-map reader can subtract them from the
/// set of ranges it scans (the library must not scan its own internal
/// structures for application pointers).
pub struct PageAllocator {
    ranges: Mutex<Vec<PageRange>>,
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator {
    pub fn new() -> Self {
        PageAllocator {
            ranges: Mutex::new(Vec::new()),
        }
    }

    /// Map `n_pages` fresh, zeroed pages, anonymous and private. Fatal (not
    /// `Result`-propagated past this call's caller) if the OS refuses --
    /// the design has no fallback for exhausted address space.
    pub fn alloc_pages(&self, n_pages: usize) -> Result<*mut u8, AllocError> {
        let len = n_pages * page_size();
        // SAFETY: a fixed, well-known set of mmap flags requesting fresh
        // anonymous memory; the returned pointer is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AllocError::MmapFailed(std::io::Error::last_os_error()));
        }
        let low = ptr as usize;
        let mut ranges = self.ranges.lock();
        let pos = ranges.partition_point(|r| r.low < low);
        ranges.insert(
            pos,
            PageRange {
                low,
                high: low + len,
            },
        );
        Ok(ptr as *mut u8)
    }

    /// Unmap a range previously returned by `alloc_pages`.
    ///
    /// # Safety
    /// `ptr`/`n_pages` must exactly match a prior `alloc_pages` call whose
    /// memory has not already been freed.
    pub unsafe fn free_pages(&self, ptr: *mut u8, n_pages: usize) {
        let len = n_pages * page_size();
        libc::munmap(ptr as *mut libc::c_void, len);
        let low = ptr as usize;
        let mut ranges = self.ranges.lock();
        ranges.retain(|r| r.low != low);
    }

    /// A snapshot of every range this allocator currently owns, in
    /// ascending address order.
    pub fn owned_ranges(&self) -> Vec<PageRange> {
        self.ranges.lock().clone()
    }
}

/// Query the system allocator's usable size for a previously retired
/// block. Needed by the subprocess variant's block-interior match and
/// leftover cascade, where the exact requested size is not otherwise
/// recoverable.
pub fn usable_size(ptr: u64) -> Option<u64> {
    if ptr == 0 {
        return None;
    }
    // SAFETY: ptr must have come from the system allocator, which is the
    // precondition `retire` documents for every pointer it accepts.
    let size = unsafe { libc::malloc_usable_size(ptr as *mut libc::c_void) };
    if size == 0 {
        None
    } else {
        Some(size as u64)
    }
}
