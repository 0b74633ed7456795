//! Kernel Console
//!
//! Debug output and the `log` backend. Bytes go to a registered
//! [`ConsoleSink`]: on hardware the trap glue registers one that feeds the
//! terminal 0 transmitter, tests register a capture buffer.

use crate::{KernelError, KernelResult};
use core::fmt::{self, Write};
use spin::Mutex;

/// Byte sink behind the console
pub trait ConsoleSink: Sync {
    /// Emit raw bytes
    fn write_bytes(&self, bytes: &[u8]);
}

/// Registered sink
static SINK: Mutex<Option<&'static dyn ConsoleSink>> = Mutex::new(None);

struct Console(&'static dyn ConsoleSink);

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Print to the console, dropping output until a sink is registered
pub fn print(args: fmt::Arguments<'_>) {
    let sink = *SINK.lock();
    if let Some(sink) = sink {
        // the sink never fails, only a Display impl can
        let _ = Console(sink).write_fmt(args);
    }
}

/// Print macro for console output
#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {
        $crate::drivers::console::print(format_args!($($arg)*))
    };
}

/// Println macro for console output
#[macro_export]
macro_rules! console_println {
    () => ($crate::console_print!("\n"));
    ($($arg:tt)*) => ($crate::console_print!("{}\n", format_args!($($arg)*)));
}

/// Logger implementation for the log crate
pub struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            crate::console_println!(
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Global logger instance
static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install the console logger writing to `sink`
///
/// Only the first call succeeds; later calls leave the installed logger
/// untouched and report [`KernelError::AlreadyExists`].
pub fn init_logger(sink: &'static dyn ConsoleSink, level: log::LevelFilter) -> KernelResult<()> {
    log::set_logger(&LOGGER).map_err(|_| KernelError::AlreadyExists)?;
    *SINK.lock() = Some(sink);
    log::set_max_level(level);
    Ok(())
}
