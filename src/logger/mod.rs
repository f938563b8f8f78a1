pub mod buffer;
pub mod bus;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use parking_lot::Mutex;

pub use buffer::{LogBuffer, LogRecord};
pub use bus::{EventBus, LogEvent, LogSink, SubscriptionId};

use crate::error::{GofwError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::Level::Trace,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// Parses a configured level. Accepts the short names used by the embedding
/// front-ends (`dbg`, `log`, `err`) as well as the usual ones. `None` means off.
pub fn parse_level(level: &str) -> Result<Option<LogLevel>> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Some(LogLevel::Trace)),
        "dbg" | "debug" => Ok(Some(LogLevel::Debug)),
        "" | "log" | "info" => Ok(Some(LogLevel::Info)),
        "warn" | "warning" => Ok(Some(LogLevel::Warn)),
        "err" | "error" => Ok(Some(LogLevel::Error)),
        "off" => Ok(None),
        other => Err(GofwError::config(format!("unexpected log level: {}", other))),
    }
}

pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

struct LogFile {
    file: Mutex<File>,
}

impl LogFile {
    fn new(path: &Path) -> std::result::Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(LogFile {
            file: Mutex::new(file),
        })
    }

    fn write(&self, timestamp: u64, level: LogLevel, message: &str) {
        let log_line = format!("[{}] [{}] {}\n", timestamp / 1_000_000, level.as_str(), message);

        let mut file = self.file.lock();
        let _ = file.write_all(log_line.as_bytes());
    }
}

/// Front of the log pipeline: filters by level, then appends to the buffer,
/// publishes on the bus, writes the optional file and forwards to `log`.
pub struct Logger {
    level: Option<LogLevel>,
    buffer: Arc<LogBuffer>,
    bus: Arc<EventBus>,
    file: Option<LogFile>,
}

impl Logger {
    pub fn new(level: Option<LogLevel>, buffer: Arc<LogBuffer>, bus: Arc<EventBus>) -> Self {
        Logger {
            level,
            buffer,
            bus,
            file: None,
        }
    }

    pub fn with_file(mut self, path: &Path) -> Result<Self> {
        let file = LogFile::new(path)
            .map_err(|e| GofwError::config(format!("cannot open log file {}: {}", path.display(), e)))?;
        self.file = Some(file);
        Ok(self)
    }

    /// Logger that drops everything; handy for unit tests of session code.
    pub fn disabled() -> Self {
        Self::new(None, Arc::new(LogBuffer::default()), Arc::new(EventBus::new()))
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        matches!(self.level, Some(min) if level >= min)
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.enabled(level) {
            self.always(level, message);
        }
    }

    /// Records `message` whatever the configured level, for events embedders
    /// must always see, such as startup.
    pub fn always(&self, level: LogLevel, message: &str) {
        let timestamp = unix_nanos();
        self.buffer.append_with_level(level, message, timestamp);
        self.bus.publish(&LogEvent {
            timestamp,
            level,
            message: message.to_string(),
        });

        if let Some(ref file) = self.file {
            file.write(timestamp, level, message);
        }

        log::log!(target: "gofw", level.into(), "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_aliases() {
        assert_eq!(parse_level("dbg").unwrap(), Some(LogLevel::Debug));
        assert_eq!(parse_level("log").unwrap(), Some(LogLevel::Info));
        assert_eq!(parse_level("err").unwrap(), Some(LogLevel::Error));
        assert_eq!(parse_level("off").unwrap(), None);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_level_filter() {
        let buffer = Arc::new(LogBuffer::new(8));
        let logger = Logger::new(Some(LogLevel::Warn), buffer.clone(), Arc::new(EventBus::new()));
        logger.info("dropped");
        logger.warn("kept");
        assert_eq!(buffer.latest_index(), 1);
        assert_eq!(buffer.read_at(1).unwrap(), "kept");
    }

    #[test]
    fn test_always_bypasses_filter() {
        let buffer = Arc::new(LogBuffer::new(8));
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(Arc::new(move |event: &LogEvent| sink.lock().push(event.message.clone())));

        let logger = Logger::new(None, buffer.clone(), bus);
        logger.error("filtered");
        logger.always(LogLevel::Info, "started");
        assert_eq!(buffer.latest_index(), 1);
        assert_eq!(buffer.read_at(1).unwrap(), "started");
        assert_eq!(*seen.lock(), vec!["started".to_string()]);
    }
}
