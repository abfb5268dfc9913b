//! Kernel logging facility
//!
//! Serial-backed implementation of the `log` crate facade. The memory
//! subsystem emits through `log::...!` everywhere; on bare metal this
//! logger routes those records to the serial diagnostic sink, and the
//! panic path relies on the same sink for fatal reports.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance registered at boot.
pub static LOGGER: Logger = Logger::new();

/// Serializes whole records so concurrent cores cannot interleave lines.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats records as "[LEVEL] message" onto the serial port.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Registers the serial logger. Debug builds log at `Debug`, release
/// builds at `Info`.
pub fn init() {
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(level))
        .expect("Logger initialization failed");
}
