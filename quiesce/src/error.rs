//! The fatal half of the error taxonomy: invariant violations the system
//! cannot recover from. Diagnostics (the other half) are not modeled as a
//! type at all -- they are a `log::warn!`/`log::debug!` call site and
//! nothing more, exactly like the source's fire-and-forget diagnostic
//! path.
//!
//! Only the two conditions that actually surface as a `Result` returned
//! to *this* crate's own call sites are modeled here. Conditions detected
//! deeper in the workspace (a failed `fork`/`pipe` in the subprocess
//! snapshot strategy, an unexpected `pthread_kill` failure in the quiesce
//! protocol) are logged and aborted at the point of detection instead,
//! the same log-then-abort behavior this type produces, because those
//! crates sit below `quiesce` in the dependency graph and cannot name
//! this type without a cycle -- see `DESIGN.md`'s "Error taxonomy"
//! section for the full accounting of every fatal condition in the spec
//! and where each one is actually handled.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Fatal {
    #[error("exceeded the maximum number of concurrently registered threads")]
    MaxThreadsExceeded,
    #[error("failed to install the quiesce signal handler: {0}")]
    SignalInstall(#[from] quiesce_signal::SignalError),
}

/// Log `err` at error level and terminate the process immediately. By the
/// time a fatal condition is detected, the reclaimer's in-memory
/// invariants can no longer be trusted, so this never unwinds.
pub fn abort(err: Fatal) -> ! {
    log::error!("fatal: {err}");
    std::process::abort();
}
