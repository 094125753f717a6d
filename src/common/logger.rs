//! Process-wide `env_logger` setup.
//!
//! The scheduler logs lifecycle transitions at `info`, per-operation
//! admission decisions at `debug` and backend failures it recovers from at
//! `warn`. Admission logging is noisy, so the scheduler module defaults to
//! `warn` unless `RUST_LOG` says otherwise.

use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

const SCHEDULER_MODULE: &str = "appendsafe::storage::file::scheduler";

/// Installs the logger at `info`. Safe to call more than once.
pub fn initialize_logger() {
    initialize_logger_at(LevelFilter::Info);
}

/// Installs the logger with `level` as the crate-wide default.
///
/// `RUST_LOG` directives are applied on top. Only the first call in a process
/// has any effect.
pub fn initialize_logger_at(level: LevelFilter) {
    INIT.call_once_force(|_| {
        let mut builder = Builder::new();
        builder
            .filter_level(level)
            .filter_module(SCHEDULER_MODULE, level.min(LevelFilter::Warn))
            .format_timestamp_millis()
            .format_module_path(true)
            .parse_default_env();

        // Another logger may already be installed by the embedding program.
        let _ = builder.try_init();
    });
}
