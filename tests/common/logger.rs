use std::sync::Once;

use appendsafe::common::logger::initialize_logger_at;
use log::LevelFilter;

static TEST_LOGGER: Once = Once::new();

/// Installs a quiet logger for integration tests. Set `RUST_LOG` to see
/// admission decisions.
pub fn init_test_logger() {
    TEST_LOGGER.call_once(|| {
        initialize_logger_at(LevelFilter::Warn);
    });
}
