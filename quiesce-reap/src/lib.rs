//! Walks a fully-scanned retired set, frees what is unreferenced, and
//! carries the rest -- randomized -- into the next round's leftover stack.

use quiesce_index::Index;
use quiesce_scan::scan_words;

/// Outcome of classifying one round's retired set.
pub struct ReapResult {
    pub freed: usize,
    /// Addresses surviving this round, already randomized and ready to
    /// hand to `LeftoverStack::push`.
    pub leftover: Vec<u64>,
}

/// Walk `index` in order: anything still live is carried over (its
/// canonical address copied out); anything unreferenced is freed via the
/// system allocator and zeroed in the index entry's place.
///
/// Call only after every range has been scanned for this round.
pub fn classify_and_reap(index: &Index) -> ReapResult {
    let mut leftover = Vec::with_capacity(index.len());
    let mut freed = 0usize;

    for entry in index.entries() {
        if entry.is_live() {
            leftover.push(entry.addr);
        } else {
            // SAFETY: entry.addr was produced by `retire`, which requires
            // the caller to have allocated it with the system allocator
            // and to have given up all further use of it.
            unsafe { libc::free(entry.addr as *mut libc::c_void) };
            freed += 1;
        }
    }

    randomize(&mut leftover);
    ReapResult { freed, leftover }
}

/// Deterministic scramble (`i -> (i * 2147483647) mod n`) applied to the
/// leftover set before it is pushed to the cross-round stack, so that
/// leftover addresses don't settle into the same page-aligned order every
/// round.
pub fn randomize(buf: &mut [u64]) {
    let n = buf.len();
    if n < 2 {
        return;
    }
    let original = buf.to_vec();
    for i in 0..n {
        let j = ((i as u128 * 2_147_483_647) % n as u128) as usize;
        buf[j] = original[i];
    }
}

/// Subprocess-variant-only: given every retired block's data is readable
/// (the COW snapshot), scan blocks about to be freed (refcount == 0) for
/// pointers into the retired set, decrementing each match. Iterate until
/// no further block becomes freeable. Returns the total number of blocks
/// this pass moved from referenced to freeable across all iterations,
/// which is folded into the final `classify_and_reap` freed count by the
/// caller re-running classification once the fixpoint settles.
///
/// # Safety
/// Every live entry's `[addr, addr + alloc_size_of(addr))` range must be
/// readable memory -- true of a forked child's COW snapshot, not of the
/// live parent process.
pub unsafe fn cascade_fixpoint(index: &Index, alloc_size_of: impl Fn(u64) -> Option<u64> + Copy) {
    use std::collections::HashSet;

    let (min, max) = match (index.min(), index.max()) {
        (Some(a), Some(b)) => (a, b),
        _ => return,
    };

    let mut worklist: Vec<u64> = index
        .entries()
        .iter()
        .filter(|e| e.ref_count() == 0)
        .map(|e| e.addr)
        .collect();
    let mut processed: HashSet<u64> = HashSet::new();

    while let Some(addr) = worklist.pop() {
        if !processed.insert(addr) {
            continue;
        }
        let Some(size) = alloc_size_of(addr) else {
            continue;
        };
        let low = addr as usize;
        let high = low + size as usize;
        scan_words(low, high, min, max, |c| {
            if c == addr {
                return;
            }
            if let Some(hit) = index.find(c, alloc_size_of) {
                if hit.dec_ref() == 0 {
                    worklist.push(hit.addr);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiesce_index::MarkKind;

    #[test]
    fn randomize_is_a_permutation_of_the_input() {
        let mut buf: Vec<u64> = (0..20).collect();
        let original = buf.clone();
        randomize(&mut buf);
        let mut sorted = buf.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, original);
    }

    #[test]
    fn randomize_noop_on_short_buffers() {
        let mut buf = vec![1u64];
        randomize(&mut buf);
        assert_eq!(buf, vec![1]);
        let mut empty: Vec<u64> = vec![];
        randomize(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn unmarked_entries_are_freed_marked_entries_carry_over() {
        // Use real heap allocations so libc::free on the "freed" address is
        // valid -- the index only ever sees addresses the caller actually
        // allocated.
        let kept = Box::into_raw(Box::new(0u64)) as u64;
        let freed_candidate = Box::into_raw(Box::new(0u64)) as u64;
        let mut addrs = vec![kept, freed_candidate];
        addrs.sort_unstable();

        let index = Index::build(&addrs, MarkKind::FoundBit);
        index.find(kept, |_| None).unwrap().mark_found_bit();

        let result = classify_and_reap(&index);
        assert_eq!(result.freed, 1);
        assert_eq!(result.leftover, vec![kept]);
    }

    #[test]
    fn cascade_frees_an_acyclic_chain_in_one_round() {
        // r's content points to p; p's content points to q; q's content
        // points to nothing retired. A full stack scan (not modeled here)
        // already found p and q referenced externally (refs 1 each) and r
        // unreferenced (ref 0), matching the scenario's starting point.
        let p = vec![0u64].leak().as_ptr() as u64;
        let q = vec![0u64].leak().as_ptr() as u64;
        let r = vec![0u64].leak().as_ptr() as u64;

        unsafe {
            *(r as *mut u64) = p;
            *(p as *mut u64) = q;
            *(q as *mut u64) = 0;
        }

        let mut addrs = vec![p, q, r];
        addrs.sort_unstable();
        let index = Index::build(&addrs, MarkKind::RefCount);

        index.find(p, |_| None).unwrap().mark_found_bit();
        index.find(q, |_| None).unwrap().mark_found_bit();

        let size_of = |_addr: u64| Some(8u64);
        unsafe { cascade_fixpoint(&index, size_of) };

        assert_eq!(index.find(p, |_| None).unwrap().ref_count(), 0);
        assert_eq!(index.find(q, |_| None).unwrap().ref_count(), 0);
        assert_eq!(index.find(r, |_| None).unwrap().ref_count(), 0);
    }
}
