//! The single-writer reclamation token: one 64-bit word whose low 63 bits
//! are a monotonically increasing round number and whose high bit means
//! "a reclaimer is currently active."
//!
//! At most one thread can hold the token at a time; [`Token::try_acquire`]
//! is the only way in, via compare-and-swap, and it does not return until
//! every registered, active thread has finished executing the *previous*
//! round's signal handler on this thread's behalf (or was never active to
//! begin with). Acknowledgment of the round just acquired is a separate
//! wait, owned by the signal/quiesce protocol once it actually sends
//! signals for this round (see `quiesce_signal::wait_for_acks`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quiesce_registry::{pack_timestamp, round_of, Registry};

pub struct Token {
    word: AtomicU64,
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl Token {
    pub fn new() -> Self {
        Token {
            word: AtomicU64::new(0),
        }
    }

    pub fn current_round(&self) -> u64 {
        round_of(self.word.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        quiesce_registry::is_helping(self.word.load(Ordering::Acquire))
    }

    /// Attempt to become the reclaimer for the next round. On success,
    /// blocks until every active thread in `registry` has finished
    /// executing any prior round's signal handler, then returns the round
    /// number just acquired.
    ///
    /// This does *not* wait for threads to acknowledge the round just
    /// acquired -- no signal for it has been sent yet at this point, so
    /// nothing could have updated its timestamp. It waits for the
    /// opposite: that no thread is still lingering in a handler invocation
    /// from the round this one supersedes, so the new reclaimer never
    /// races a stale scan still writing into the previous round's retired
    /// set.
    pub fn try_acquire(&self, registry: &Registry) -> Option<u64> {
        let current = self.word.load(Ordering::Acquire);
        if quiesce_registry::is_helping(current) {
            return None;
        }
        let new_round = round_of(current) + 1;
        let new_word = pack_timestamp(new_round, true);
        if self
            .word
            .compare_exchange(current, new_word, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        self.wait_for_previous_round_to_drain(registry);
        Some(new_round)
    }

    /// Spin until every registered, active thread has lowered its helping
    /// flag (or has gone inactive in the meantime). A thread that never
    /// participated in any round satisfies this immediately.
    fn wait_for_previous_round_to_drain(&self, registry: &Registry) {
        loop {
            let mut all_quiesced = true;
            registry.for_each(|record| {
                if !record.is_active() {
                    return;
                }
                if quiesce_registry::is_helping(record.timestamp()) {
                    all_quiesced = false;
                }
            });
            if all_quiesced {
                std::sync::atomic::fence(Ordering::Acquire);
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Release the token, clearing the active bit but keeping the round
    /// number that was just completed.
    pub fn release(&self) {
        let current = self.word.load(Ordering::Acquire);
        let round = round_of(current);
        self.word
            .store(pack_timestamp(round, false), Ordering::Release);
    }
}

/// Convenience wrapper pairing a token with the registry it waits on, for
/// callers (the retire API, the snapshot orchestrator) that always use the
/// two together.
pub struct TokenGuard<'a> {
    token: &'a Token,
}

impl<'a> TokenGuard<'a> {
    /// Try to acquire `token` against `registry`. Returns `None` if another
    /// reclaimer is already active.
    pub fn try_new(token: &'a Token, registry: &Arc<Registry>) -> Option<(Self, u64)> {
        let round = token.try_acquire(registry)?;
        Some((TokenGuard { token }, round))
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.token.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiesce_registry::ThreadRecord;

    #[test]
    fn acquire_then_release_advances_round_and_clears_active() {
        let token = Token::new();
        let registry = Arc::new(Registry::new());

        let round = token.try_acquire(&registry).unwrap();
        assert_eq!(round, 1);
        assert!(token.is_active());
        token.release();
        assert!(!token.is_active());
        assert_eq!(token.current_round(), 1);
    }

    #[test]
    fn second_acquire_fails_while_first_is_active() {
        let token = Token::new();
        let registry = Arc::new(Registry::new());
        let _round = token.try_acquire(&registry).unwrap();
        assert!(token.try_acquire(&registry).is_none());
    }

    #[test]
    fn acquire_waits_only_for_active_threads() {
        let token = Token::new();
        let registry = Arc::new(Registry::new());

        // An inactive thread record should never block acquisition.
        let inactive = ThreadRecord::new(1, 1024);
        inactive.set_active(false);
        registry.register(inactive).unwrap();

        let round = token.try_acquire(&registry);
        assert_eq!(round, Some(1));
    }

    #[test]
    fn acquire_does_not_block_on_an_active_thread_that_never_helped() {
        // A thread that is active but has never entered the signal
        // handler (timestamp's helping flag is false from construction)
        // must not make the very first acquisition wait forever -- no
        // signal for *this* round has been sent yet, so nothing could
        // have updated it.
        let token = Token::new();
        let registry = Arc::new(Registry::new());
        let active = ThreadRecord::new(1, 1024);
        active.set_active(true);
        registry.register(active).unwrap();

        assert_eq!(token.try_acquire(&registry), Some(1));
    }

    #[test]
    fn acquire_waits_for_a_still_helping_thread_to_lower_its_flag() {
        let token = Token::new();
        let registry = Arc::new(Registry::new());
        let helping = ThreadRecord::new(1, 1024);
        helping.set_active(true);
        helping.raise_helping_flag(0);
        registry.register(helping.clone()).unwrap();

        let handle = {
            let registry = registry.clone();
            std::thread::spawn(move || token.try_acquire(&registry))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        helping.lower_helping_flag();
        assert_eq!(handle.join().unwrap(), Some(1));
    }

    #[test]
    fn guard_releases_on_drop() {
        let token = Token::new();
        let registry = Arc::new(Registry::new());
        {
            let (_guard, round) = TokenGuard::try_new(&token, &registry).unwrap();
            assert_eq!(round, 1);
            assert!(token.is_active());
        }
        assert!(!token.is_active());
    }

    #[test]
    fn rounds_increment_across_successive_acquisitions() {
        let token = Token::new();
        let registry = Arc::new(Registry::new());
        for expected in 1..=5u64 {
            let round = token.try_acquire(&registry).unwrap();
            assert_eq!(round, expected);
            token.release();
        }
    }
}
