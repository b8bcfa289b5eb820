//! Console-backed implementation of the `log` facade.
//!
//! All kernel diagnostics go through `log::{error,warn,info,debug,trace}`;
//! this module renders them onto the console via the synchronous UART path so
//! messages survive even when interrupts are off. Installed once on CPU 0
//! during early boot, before the memory subsystems print their summaries.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info || cfg!(debug_assertions)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = record.target().rsplit("::").next().unwrap_or("kernel");
        println!("[{:<5} {}] {}", record.level(), tag, record.args());
    }

    fn flush(&self) {}
}

/// Install the console logger. Safe to call more than once; later calls are
/// ignored (the facade only accepts one logger per program).
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}
