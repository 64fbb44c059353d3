//! A small opt-in logger initializer for binaries, tests, and examples
//! built against this crate. The library itself never installs a logger
//! -- only a consumer's `main` should do that -- it only emits through
//! the `log` facade.

/// Install an `env_logger` backend, honoring `QUIESCE_LOG` first and
/// falling back to `RUST_LOG`. Safe to call more than once; only the
/// first call has an effect.
pub fn init_from_env() {
    let filter = std::env::var("QUIESCE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&filter);
    let _ = builder.try_init();
}
