//! Minimal stderr logger for the command line front-ends
//!
//! The library itself only talks to the `log` facade; the binaries
//! install this logger to get the records onto stderr.

use lazy_static::lazy_static;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        eprintln!(
            "[{}] {}: {}",
            level,
            record.module_path().unwrap_or("ffsp"),
            record.args()
        );
    }

    fn flush(&self) {}
}

lazy_static! {
    static ref LOGGER: StderrLogger = StderrLogger;
}

/// Install the stderr logger at the given level. Repeated calls only
/// adjust the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&*LOGGER);
    log::set_max_level(level);
}
