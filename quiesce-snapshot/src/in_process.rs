//! Signal every bystander, let each scan its own stack in its own handler
//! invocation, then scan the reclaimer's own stack the same way.

use std::ffi::c_void;

use quiesce_index::{Index, MarkKind};
use quiesce_scan::scan_found_bit_entrypoint;

use crate::{approx_self_rsp, RoundContext, SnapshotStrategy};

#[derive(Default)]
pub struct InProcessStrategy;

impl InProcessStrategy {
    pub fn new() -> Self {
        InProcessStrategy
    }
}

impl SnapshotStrategy for InProcessStrategy {
    fn run_round(&self, ctx: &RoundContext<'_>, round: u64) -> usize {
        let addrs = quiesce_index::aggregate(ctx.registry, ctx.leftover);
        if addrs.is_empty() {
            return 0;
        }
        let index = Index::build(&addrs, MarkKind::FoundBit);
        let index_ptr = &index as *const Index as *const c_void;

        let delivered = quiesce_signal::signal_all_except(
            ctx.registry,
            ctx.self_id,
            round,
            scan_found_bit_entrypoint,
            index_ptr,
        );
        quiesce_signal::wait_for_acks(delivered);

        if let Some(self_record) = find_self(ctx) {
            let rsp = approx_self_rsp();
            // SAFETY: rsp is a real address on this thread's own live
            // stack, and self_record's recorded bounds describe it.
            unsafe {
                quiesce_signal::scan_self(&self_record, rsp, scan_found_bit_entrypoint, index_ptr)
            };
        }

        let result = quiesce_reap::classify_and_reap(&index);
        ctx.leftover.push(result.leftover.into_boxed_slice());
        result.freed
    }
}

fn find_self(ctx: &RoundContext<'_>) -> Option<std::sync::Arc<quiesce_registry::ThreadRecord>> {
    let mut found = None;
    ctx.registry.for_each(|record| {
        if record.thread_id == ctx.self_id {
            found = Some(record.clone());
        }
    });
    found
}
