//! The sorted retired-set array and its two-level (minimap + page) index.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Low two bits of every pointer are reserved for caller-side tagging and
/// are masked off before anything in this crate compares addresses.
pub const TAG_MASK: u64 = 0b11;

pub fn canonical(addr: u64) -> u64 {
    addr & !TAG_MASK
}

/// How a scan hit is recorded against a retired-set entry. The in-process
/// strategy only ever needs "was this seen," so a bit suffices; the
/// subprocess strategy needs a count so the leftover cascade fixpoint can
/// tell how many references remain.
pub enum Mark {
    Found(AtomicBool),
    RefCount(AtomicU32),
}

pub struct RetiredEntry {
    pub addr: u64,
    pub mark: Mark,
}

impl RetiredEntry {
    pub fn is_live(&self) -> bool {
        match &self.mark {
            Mark::Found(b) => b.load(Ordering::Acquire),
            Mark::RefCount(c) => c.load(Ordering::Acquire) > 0,
        }
    }

    pub fn mark_found_bit(&self) {
        match &self.mark {
            Mark::Found(b) => b.store(true, Ordering::Release),
            Mark::RefCount(c) => {
                c.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Decrement a subprocess-variant refcount. No-op on the in-process
    /// (bit) variant; used by the leftover cascade fixpoint.
    pub fn dec_ref(&self) -> u32 {
        match &self.mark {
            Mark::Found(_) => 0,
            Mark::RefCount(c) => c.fetch_sub(1, Ordering::AcqRel) - 1,
        }
    }

    pub fn ref_count(&self) -> u32 {
        match &self.mark {
            Mark::Found(b) => b.load(Ordering::Acquire) as u32,
            Mark::RefCount(c) => c.load(Ordering::Acquire),
        }
    }
}

/// Which [`Mark`] variant new entries should carry, chosen once per round
/// by the active snapshot strategy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkKind {
    FoundBit,
    RefCount,
}

/// Number of entries per minimap page.
pub const PAGE_ENTRIES: usize = 64;
/// Below this many candidate entries, fall back to a linear scan instead
/// of bisecting further.
pub const BINARY_THRESHOLD: usize = 32;

/// The sorted retired-set array plus its coarse first-level "minimap":
/// one entry per page recording that page's first address.
pub struct Index {
    entries: Vec<RetiredEntry>,
    minimap: Vec<u64>,
}

impl Index {
    /// Build an index from a sorted, deduplicated buffer of canonical
    /// addresses. `kind` selects the per-entry mark representation.
    pub fn build(sorted_addrs: &[u64], kind: MarkKind) -> Self {
        let entries: Vec<RetiredEntry> = sorted_addrs
            .iter()
            .map(|&addr| RetiredEntry {
                addr,
                mark: match kind {
                    MarkKind::FoundBit => Mark::Found(AtomicBool::new(false)),
                    MarkKind::RefCount => Mark::RefCount(AtomicU32::new(0)),
                },
            })
            .collect();

        let minimap = entries
            .chunks(PAGE_ENTRIES)
            .map(|page| page[0].addr)
            .collect();

        Index { entries, minimap }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[RetiredEntry] {
        &self.entries
    }

    pub fn min(&self) -> Option<u64> {
        self.entries.first().map(|e| e.addr)
    }

    pub fn max(&self) -> Option<u64> {
        self.entries.last().map(|e| e.addr)
    }

    /// Locate the entry whose address equals `addr`, or -- for the
    /// subprocess variant's block-interior match -- whose `[addr, addr +
    /// alloc_size)` window contains it. `alloc_size_of` is consulted only
    /// when an exact match is not found at the probed slot.
    pub fn find(&self, addr: u64, alloc_size_of: impl Fn(u64) -> Option<u64>) -> Option<&RetiredEntry> {
        if self.entries.is_empty() {
            return None;
        }

        let page_idx = self.probe_minimap(addr);
        let start = page_idx * PAGE_ENTRIES;
        let end = (start + PAGE_ENTRIES).min(self.entries.len());
        let page = &self.entries[start..end];

        if let Some(hit) = Self::search_page(page, addr) {
            return Some(hit);
        }

        // Block-interior match: the greatest entry with addr <= target,
        // checked against its allocation size.
        let candidate_idx = Self::floor_index(page, addr).map(|i| start + i)?;
        let candidate = &self.entries[candidate_idx];
        if candidate.addr == addr {
            return Some(candidate);
        }
        let size = alloc_size_of(candidate.addr)?;
        if candidate.addr + size > addr {
            Some(candidate)
        } else {
            None
        }
    }

    fn probe_minimap(&self, addr: u64) -> usize {
        if self.minimap.len() <= BINARY_THRESHOLD {
            let mut last = 0;
            for (i, &first) in self.minimap.iter().enumerate() {
                if first > addr {
                    break;
                }
                last = i;
            }
            return last;
        }
        match self.minimap.binary_search(&addr) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    fn search_page(page: &[RetiredEntry], addr: u64) -> Option<&RetiredEntry> {
        if page.len() <= BINARY_THRESHOLD {
            return page.iter().find(|e| e.addr == addr);
        }
        page.binary_search_by_key(&addr, |e| e.addr)
            .ok()
            .map(|i| &page[i])
    }

    fn floor_index(page: &[RetiredEntry], addr: u64) -> Option<usize> {
        let mut result = None;
        for (i, e) in page.iter().enumerate() {
            if e.addr <= addr {
                result = Some(i);
            } else {
                break;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_masks_tag_bits() {
        assert_eq!(canonical(0x2001), 0x2000);
        assert_eq!(canonical(0x2003), 0x2000);
        assert_eq!(canonical(0x2000), 0x2000);
    }

    #[test]
    fn exact_match_found_small_set() {
        let addrs = vec![0x1000, 0x2000, 0x3000];
        let idx = Index::build(&addrs, MarkKind::FoundBit);
        let hit = idx.find(0x2000, |_| None).unwrap();
        assert_eq!(hit.addr, 0x2000);
        assert!(idx.find(0x2500, |_| None).is_none());
    }

    #[test]
    fn exact_match_found_large_set_spans_pages() {
        let addrs: Vec<u64> = (0..1000u64).map(|i| i * 16).collect();
        let idx = Index::build(&addrs, MarkKind::FoundBit);
        for &target in &[0, 16, 800 * 16, 999 * 16] {
            let hit = idx.find(target, |_| None).unwrap();
            assert_eq!(hit.addr, target);
        }
        assert!(idx.find(5, |_| None).is_none());
    }

    #[test]
    fn block_interior_match_uses_alloc_size() {
        let addrs = vec![0x1000, 0x2000];
        let idx = Index::build(&addrs, MarkKind::RefCount);
        let size_of = |addr: u64| if addr == 0x1000 { Some(0x200) } else { None };
        let hit = idx.find(0x1100, size_of).unwrap();
        assert_eq!(hit.addr, 0x1000);
        assert!(idx.find(0x1300, size_of).is_none());
    }

    #[test]
    fn mark_found_bit_then_is_live() {
        let addrs = vec![0x1000];
        let idx = Index::build(&addrs, MarkKind::FoundBit);
        let entry = idx.find(0x1000, |_| None).unwrap();
        assert!(!entry.is_live());
        entry.mark_found_bit();
        assert!(entry.is_live());
    }

    #[test]
    fn refcount_increments_and_decrements() {
        let addrs = vec![0x1000];
        let idx = Index::build(&addrs, MarkKind::RefCount);
        let entry = idx.find(0x1000, |_| None).unwrap();
        entry.mark_found_bit();
        entry.mark_found_bit();
        assert_eq!(entry.ref_count(), 2);
        assert_eq!(entry.dec_ref(), 1);
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    fn empty_index_finds_nothing() {
        let idx = Index::build(&[], MarkKind::FoundBit);
        assert!(idx.find(0x1000, |_| None).is_none());
        assert!(idx.is_empty());
    }
}
