//! Kernel logger backed by the debug console.
//!
//! Installs a [`log::Log`] implementation that writes through the same sink
//! as `println!`, so `log::info!` and friends work from every subsystem
//! without touching console state directly.

use log::{Level, LevelFilter, Metadata, Record};

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!(
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the console logger. Called once during boot; calling again is a
/// no-op (the error from `set_logger` is discarded so tests that race init
/// do not fail).
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
