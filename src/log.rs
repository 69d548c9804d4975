use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::str::FromStr;
use std::time::SystemTime;

use crate::config::ENV_LOG;

/// Writes records to stderr, one line each. Records also have to pass the
/// global `log::max_level`.
pub struct SimpleLogger {
    level: LevelFilter,
}

impl SimpleLogger {
    pub const fn new(level: LevelFilter) -> Self {
        SimpleLogger { level }
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| format!("{}.{:06}", d.as_secs(), d.subsec_micros()))
            .unwrap_or_else(|_| String::from("0.000000"));

        let location = match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!("{}:{}", file, line),
            (Some(file), None) => file.to_string(),
            (None, _) => String::from("unknown location"),
        };

        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");

        // A failed write to stderr has nowhere left to be reported.
        let _ = writeln!(
            std::io::stderr().lock(),
            "[{timestamp}][{level:<5}][{thread}][{target}][{location}] {message}",
            timestamp = timestamp,
            level = record.level(),
            thread = thread_name,
            target = record.target(),
            location = location,
            message = record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the logger with the level named by `ASYNCARRAY_LOG`, or `info`
/// when it is unset or unparsable.
pub fn init() -> Result<(), log::SetLoggerError> {
    let level = std::env::var(ENV_LOG)
        .ok()
        .and_then(|value| LevelFilter::from_str(value.trim()).ok())
        .unwrap_or(LevelFilter::Info);
    init_with_level(level)
}

pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    static LOGGER: SimpleLogger = SimpleLogger::new(LevelFilter::Trace);

    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_level_filtering() {
        log::set_max_level(LevelFilter::Trace);
        let logger = SimpleLogger::new(LevelFilter::Warn);
        let warn = Metadata::builder().level(Level::Warn).target("asyncarray").build();
        let debug = Metadata::builder().level(Level::Debug).target("asyncarray").build();

        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&debug));
        assert!(!SimpleLogger::new(LevelFilter::Off).enabled(&warn));
    }
}
