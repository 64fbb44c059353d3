//! Walks a `[low, high)` memory range one word at a time, looking for
//! values that could be references into the current retired set.
//!
//! Any word whose tag-stripped value numerically falls inside the
//! retired set's `[min, max]` range is treated as a possible reference
//! and probed against the index. This is what lets the scanner run from
//! a signal handler with no notion of which stack slots actually hold
//! live pointers versus leftover garbage.

use std::ffi::c_void;
use std::mem::size_of;

use quiesce_index::{canonical, Index};

const WORD: usize = size_of::<u64>();

/// Core scan loop, independent of how a candidate hit gets marked.
/// `low`/`high` need not be word-aligned; `low` is rounded up and `high`
/// rounded down to the next word boundary.
pub fn scan_words(low: usize, high: usize, min: u64, max: u64, mut on_candidate: impl FnMut(u64)) {
    if low >= high {
        return;
    }
    let start = (low + (WORD - 1)) & !(WORD - 1);
    let mut ptr = start;
    while ptr.saturating_add(WORD) <= high {
        // SAFETY: caller (the signal handler or the reclaimer scanning its
        // own stack) guarantees [low, high) is live, readable memory for
        // the duration of the scan.
        let w = unsafe { (ptr as *const u64).read_unaligned() };
        let c = canonical(w);
        if c != 0 && c >= min && c <= max {
            on_candidate(c);
        }
        ptr += WORD;
    }
}

/// Scan `[low, high)` against `index`, marking the in-process "found bit"
/// on every hit. No allocation-size lookup is needed because an exact
/// address match is the only match this variant makes.
///
/// # Safety
/// `low`/`high` must delimit memory that is valid to read for the
/// duration of the call (a quiesced thread's own stack range, or a
/// registered local block).
pub unsafe fn scan_range_found_bit(index: &Index, low: usize, high: usize) {
    let (Some(min), Some(max)) = (index.min(), index.max()) else {
        return;
    };
    scan_words(low, high, min, max, |c| {
        if let Some(entry) = index.find(c, |_| None) {
            entry.mark_found_bit();
        }
    });
}

/// `extern "C"` adapter matching the quiesce signal handler's `ScanFn`
/// shape, for the in-process snapshot strategy. `ctx` must point to a
/// live `Index`.
///
/// # Safety
/// `ctx` must be a valid `*const Index` for the duration of the call, and
/// `low`/`high` must be readable memory.
pub unsafe extern "C" fn scan_found_bit_entrypoint(ctx: *const c_void, low: usize, high: usize) {
    let index = &*(ctx as *const Index);
    scan_range_found_bit(index, low, high);
}

/// Context for the subprocess variant's scan entrypoint: an index plus an
/// allocator callback that reports a retired block's usable size, needed
/// for the block-interior match.
pub struct RefcountScanCtx<'a> {
    pub index: &'a Index,
    pub alloc_size_of: &'a (dyn Fn(u64) -> Option<u64> + Sync),
}

/// Scan `[low, high)` against `ctx.index`, incrementing the refcount of
/// every hit (including block-interior hits resolved via
/// `ctx.alloc_size_of`).
///
/// # Safety
/// Same memory-validity requirements as [`scan_range_found_bit`].
pub unsafe fn scan_range_refcount(ctx: &RefcountScanCtx<'_>, low: usize, high: usize) {
    let (Some(min), Some(max)) = (ctx.index.min(), ctx.index.max()) else {
        return;
    };
    scan_words(low, high, min, max, |c| {
        if let Some(entry) = ctx.index.find(c, ctx.alloc_size_of) {
            entry.mark_found_bit();
        }
    });
}

/// `extern "C"` adapter for the subprocess variant. `ctx` must point to a
/// live `RefcountScanCtx`.
///
/// # Safety
/// `ctx` must be a valid `*const RefcountScanCtx` for the duration of the
/// call, and `low`/`high` must be readable memory.
pub unsafe extern "C" fn scan_refcount_entrypoint(ctx: *const c_void, low: usize, high: usize) {
    let scan_ctx = &*(ctx as *const RefcountScanCtx<'_>);
    scan_range_refcount(scan_ctx, low, high);
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiesce_index::MarkKind;

    #[test]
    fn scan_words_finds_exact_candidate() {
        let stack: [u64; 4] = [0, 0x1234, 0, 0x5678];
        let low = stack.as_ptr() as usize;
        let high = low + std::mem::size_of_val(&stack);
        let mut hits = Vec::new();
        scan_words(low, high, 0x1234, 0x5678, |c| hits.push(c));
        assert_eq!(hits, vec![0x1234, 0x5678]);
    }

    #[test]
    fn scan_words_skips_out_of_range_values() {
        let stack: [u64; 2] = [0x10, 0xFFFF_FFFF];
        let low = stack.as_ptr() as usize;
        let high = low + std::mem::size_of_val(&stack);
        let mut hits = Vec::new();
        scan_words(low, high, 0x100, 0x200, |c| hits.push(c));
        assert!(hits.is_empty());
    }

    #[test]
    fn scan_words_masks_tag_bits_before_matching() {
        let stack: [u64; 1] = [0x2001];
        let low = stack.as_ptr() as usize;
        let high = low + std::mem::size_of_val(&stack);
        let mut hits = Vec::new();
        scan_words(low, high, 0x2000, 0x2000, |c| hits.push(c));
        assert_eq!(hits, vec![0x2000]);
    }

    #[test]
    fn found_bit_scan_marks_the_matching_entry() {
        let addrs = vec![0x2000u64];
        let index = Index::build(&addrs, MarkKind::FoundBit);
        let stack: [u64; 1] = [0x2001];
        let low = stack.as_ptr() as usize;
        let high = low + std::mem::size_of_val(&stack);
        unsafe { scan_range_found_bit(&index, low, high) };
        assert!(index.find(0x2000, |_| None).unwrap().is_live());
    }

    #[test]
    fn refcount_scan_resolves_block_interior_hits() {
        let addrs = vec![0x1000u64];
        let index = Index::build(&addrs, MarkKind::RefCount);
        let size_of_fn = |addr: u64| if addr == 0x1000 { Some(0x100) } else { None };
        let ctx = RefcountScanCtx {
            index: &index,
            alloc_size_of: &size_of_fn,
        };
        let stack: [u64; 1] = [0x1050];
        let low = stack.as_ptr() as usize;
        let high = low + std::mem::size_of_val(&stack);
        unsafe { scan_range_refcount(&ctx, low, high) };
        assert_eq!(index.find(0x1000, |_| None).unwrap().ref_count(), 1);
    }
}
