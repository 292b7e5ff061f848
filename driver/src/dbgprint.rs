//! `log` backend over the kernel debugger
//!
//! Records are formatted into a fixed line and handed to `DbgPrint` as a
//! `%s` argument, so a stray `%` in a message is never interpreted.
//!
//! Only install and teardown log. The switch and interrupt paths stay
//! silent: `DbgPrint` is not callable from everywhere they run.

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::rtl::LineBuffer;

/// Longest line passed to the debugger, terminator included
pub const LINE_CAPACITY: usize = 256;

pub type Line = LineBuffer<LINE_CAPACITY>;

/// Logger writing to the kernel debugger
pub struct DbgPrintLogger {
    level: LevelFilter,
}

static LOGGER: DbgPrintLogger = DbgPrintLogger::new(LevelFilter::Info);

impl DbgPrintLogger {
    pub const fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

impl Log for DbgPrintLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = Line::new();
        format_record(record, &mut line);
        emit(&mut line);
    }

    fn flush(&self) {}
}

/// Format a record as one debugger line
pub fn format_record(record: &Record, line: &mut Line) {
    line.clear();
    let _ = write!(line, "{:<5} {}", record.level(), record.args());
    // Newline and terminator always fit
    line.truncate(LINE_CAPACITY - 2);
    let _ = line.write_char('\n');
}

#[cfg(target_arch = "x86")]
fn emit(line: &mut Line) {
    let text = line.as_c_bytes();
    unsafe {
        crate::arch::x86::nt::DbgPrint(b"%s\0".as_ptr(), text.as_ptr());
    }
}

#[cfg(not(target_arch = "x86"))]
fn emit(_line: &mut Line) {}

/// Install the debugger logger
///
/// A second call is harmless; the first logger stays.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LOGGER.level);
    }
}
