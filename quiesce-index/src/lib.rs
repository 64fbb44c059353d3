//! Turns one round's scattered retired pointers -- per-thread rings plus
//! last round's leftovers -- into a single sorted, indexed array ready
//! for scanning.

mod index;
mod leftover;
mod sort;

pub use index::{canonical, Index, Mark, MarkKind, RetiredEntry, BINARY_THRESHOLD, PAGE_ENTRIES, TAG_MASK};
pub use leftover::LeftoverStack;
pub use sort::sort_and_dedup;

use quiesce_registry::Registry;

/// Drain the leftover stack and every thread's ring into one buffer,
/// canonicalize each address, sort, and dedup. Does not yet build the
/// two-level index -- callers pick [`MarkKind`] based on which snapshot
/// strategy is active before calling [`Index::build`].
pub fn aggregate(registry: &Registry, leftover: &LeftoverStack) -> Vec<u64> {
    let mut buf = leftover.drain_all();

    let mut scratch = [0u64; 256];
    registry.for_each(|record| loop {
        let n = record.ring.pop_bulk(&mut scratch);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&scratch[..n]);
    });

    for addr in buf.iter_mut() {
        *addr = canonical(*addr);
    }
    sort_and_dedup(&mut buf);
    debug_assert!(
        buf.windows(2).all(|w| w[0] < w[1]),
        "retired set is not strictly monotonically increasing after sort_and_dedup"
    );
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiesce_registry::ThreadRecord;

    #[test]
    fn aggregate_combines_leftover_and_rings_sorted_and_deduped() {
        let registry = Registry::new();
        let leftover = LeftoverStack::new();
        leftover.push(vec![0x3000u64, 0x1000].into_boxed_slice());

        let rec = ThreadRecord::new(1, 1024);
        rec.ring.push(0x2000);
        rec.ring.push(0x1000); // duplicate of a leftover entry
        registry.register(rec).unwrap();

        let buf = aggregate(&registry, &leftover);
        assert_eq!(buf, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn aggregate_canonicalizes_tagged_addresses() {
        let registry = Registry::new();
        let leftover = LeftoverStack::new();
        let rec = ThreadRecord::new(1, 1024);
        rec.ring.push(0x2001);
        registry.register(rec).unwrap();

        let buf = aggregate(&registry, &leftover);
        assert_eq!(buf, vec![0x2000]);
    }

    #[test]
    fn empty_round_is_empty() {
        let registry = Registry::new();
        let leftover = LeftoverStack::new();
        assert!(aggregate(&registry, &leftover).is_empty());
    }
}
