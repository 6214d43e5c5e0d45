//! Early console logger.
//!
//! Lines look like `[ INFO pmem] message`. Nothing is printed before
//! [`init`] hands a console sink over.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::config;

/// Writes a chunk of text to the early console.
pub type ConsoleSink = fn(&str);

static CONSOLE: Mutex<Option<ConsoleSink>> = Mutex::new(None);

struct SinkWriter(ConsoleSink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

struct SetupLogger;

static LOGGER: SetupLogger = SetupLogger;

impl Log for SetupLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // held across the write so lines never interleave
        let console = CONSOLE.lock();
        if let Some(sink) = *console {
            let _ = write_record(&mut SinkWriter(sink), record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

fn write_record(
    out: &mut dyn Write,
    level: Level,
    target: &str,
    args: &fmt::Arguments,
) -> fmt::Result {
    // module paths are noise, keep category targets only
    let target = target.rsplit("::").next().unwrap_or(target);
    writeln!(out, "[{:>5} {}] {}", level, target, args)
}

/// Routes `log` output to `sink` with the configured level.
///
/// Only the first call installs the logger; later calls just swap the sink.
pub fn init(sink: ConsoleSink) {
    *CONSOLE.lock() = Some(sink);
    if log::set_logger(&LOGGER).is_ok() {
        set_max_level(config::log_level());
    }
}

pub fn set_max_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;

    #[test]
    fn record_format() {
        let mut out = String::new();
        write_record(&mut out, Level::Info, "pmem", &format_args!("area {:#x}", 0x1000)).unwrap();
        assert_eq!(out, "[ INFO pmem] area 0x1000\n");

        out.clear();
        write_record(&mut out, Level::Warn, "hvsetup::pmem", &format_args!("x")).unwrap();
        assert_eq!(out, "[ WARN pmem] x\n");
    }

    #[test]
    fn sink_receives_text() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static BYTES: AtomicUsize = AtomicUsize::new(0);
        fn count(s: &str) {
            BYTES.fetch_add(s.len(), Ordering::Relaxed);
        }

        let mut w = SinkWriter(count);
        write_record(&mut w, Level::Debug, "svm", &format_args!("on")).unwrap();
        assert_eq!(BYTES.load(Ordering::Relaxed), "[DEBUG svm] on\n".len());
    }
}
