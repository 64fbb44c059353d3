//! The two interchangeable back-ends for taking a reclamation-round
//! snapshot. Both implement [`SnapshotStrategy`] and share the same
//! aggregation step; they differ only in how the retired set gets
//! scanned against live memory.

mod gc_thread;
mod in_process;
mod subprocess;

pub use gc_thread::GcThread;
pub use in_process::InProcessStrategy;
pub use subprocess::SubprocessStrategy;

use quiesce_index::LeftoverStack;
use quiesce_registry::Registry;

/// Everything one reclamation round needs from the rest of the system.
pub struct RoundContext<'a> {
    pub registry: &'a Registry,
    pub leftover: &'a LeftoverStack,
    /// The reclaiming thread's own id, excluded from signal delivery (it
    /// scans its own stack directly instead).
    pub self_id: u64,
}

/// A snapshot strategy runs one full round -- aggregate, quiesce/scan,
/// classify/reap -- given the round number the caller's [`quiesce_token`]
/// acquisition has already established.
pub trait SnapshotStrategy: Send + Sync {
    /// Returns the number of blocks freed this round.
    fn run_round(&self, ctx: &RoundContext<'_>, round: u64) -> usize;
}

/// Address of a stack local, used as a conservative approximation of the
/// reclaiming thread's own interrupted stack pointer (it was never
/// actually interrupted -- it's the thread running the reclamation code
/// -- so there is no trapped register file to read; the address of its
/// own current frame is the tightest lower bound available without
/// inline assembly).
pub fn approx_self_rsp() -> usize {
    let probe: u8 = 0;
    &probe as *const u8 as usize
}
