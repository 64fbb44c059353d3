//! Process-wide configuration, built once from the environment at first
//! use.

use once_cell::sync::Lazy;

/// Compile-time cap on concurrently registered threads.
pub const MAX_THREADS: usize = quiesce_registry::MAX_THREADS;

pub struct Config {
    /// Per-thread ring capacity, derived from `PTRS_PER_THREAD`.
    pub ring_capacity: usize,
}

pub static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

impl Config {
    fn from_env() -> Self {
        let units = std::env::var("PTRS_PER_THREAD")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4)
            .clamp(1, 32);
        let requested = units * 1024;
        let ring_capacity = requested
            .next_power_of_two()
            .clamp(quiesce_ring::MIN_CAPACITY, quiesce_ring::MAX_CAPACITY);
        Config { ring_capacity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ring_capacity_is_4096_without_env_override() {
        // Only valid when PTRS_PER_THREAD is unset in the test process;
        // CONFIG is a process-wide Lazy so this only checks the shape of
        // the derivation, not the live singleton.
        std::env::remove_var("PTRS_PER_THREAD");
        let cfg = Config::from_env();
        assert_eq!(cfg.ring_capacity, 4096);
    }

    #[test]
    fn ring_capacity_is_clamped_to_the_valid_range() {
        std::env::set_var("PTRS_PER_THREAD", "1000");
        let cfg = Config::from_env();
        assert_eq!(cfg.ring_capacity, quiesce_ring::MAX_CAPACITY);
        std::env::remove_var("PTRS_PER_THREAD");
    }
}
