//! The global `log::Log` implementation over the debug port.

use crate::{DebugPort, write_record};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Stateless logger writing every enabled record to the QEMU debug port.
///
/// Level filtering rides on `log::max_level()`, so the logger itself needs
/// no storage and can live in a plain `static`.
pub struct DebugPortLogger;

static LOGGER: DebugPortLogger = DebugPortLogger;

impl DebugPortLogger {
    /// Install as the global logger. Call once during early bring-up.
    ///
    /// # Errors
    /// Fails if another logger was installed first.
    pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for DebugPortLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            write_record(&mut DebugPort, record);
        }
    }

    fn flush(&self) {
        // The debug port has no buffering to flush.
    }
}
