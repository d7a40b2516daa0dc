//! `log` facade backend
//!
//! Writes `[LEVEL] target: message` lines to stderr and, optionally, appends
//! them to a log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

/// Verbosity levels, from silent to everything
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Nothing = 0,
    User = 1,
    Error = 2,
    Warning = 3,
    Info = 4,
    Debug = 5,
    All = 6,
}

impl LogLevel {
    /// Create a LogLevel from an integer
    pub fn from_i32(level: i32) -> Self {
        match level {
            0 => LogLevel::Nothing,
            1 => LogLevel::User,
            2 => LogLevel::Error,
            3 => LogLevel::Warning,
            4 => LogLevel::Info,
            5 => LogLevel::Debug,
            6 => LogLevel::All,
            _ => LogLevel::Info,
        }
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Look a level up by name, case-insensitively
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "nothing" | "off" | "none" => Some(LogLevel::Nothing),
            "user" => Some(LogLevel::User),
            "error" => Some(LogLevel::Error),
            "warning" | "warn" => Some(LogLevel::Warning),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "all" | "trace" => Some(LogLevel::All),
            _ => None,
        }
    }

    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Nothing => LevelFilter::Off,
            LogLevel::User | LogLevel::Error => LevelFilter::Error,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::All => LevelFilter::Trace,
        }
    }
}

/// Format one record the way it appears on stderr and in the log file
pub fn format_record(record: &Record) -> String {
    format!("[{}] {}: {}", record.level(), record.target(), record.args())
}

pub struct Logger {
    level: LevelFilter,
    file: Mutex<Option<File>>,
}

impl Logger {
    pub fn new(level: LevelFilter, file: Option<File>) -> Self {
        Self {
            level,
            file: Mutex::new(file),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        eprintln!("{}", line);

        let mut file = self.file.lock();
        if let Some(f) = file.as_mut() {
            // a failing log file must not take the process down
            if writeln!(f, "{}", line).is_err() {
                *file = None;
                eprintln!("[WARN] logging: log file write failed, file logging disabled");
            }
        }
    }

    fn flush(&self) {
        if let Some(f) = self.file.lock().as_mut() {
            let _ = f.flush();
        }
    }
}

/// Install the global logger.
///
/// # Errors
/// Fails if the log file can't be opened or a logger is already installed.
pub fn init(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    let file = match log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => None,
    };

    let filter = level.to_level_filter();
    log::set_boxed_logger(Box::new(Logger::new(filter, file)))
        .context("Logger already initialized")?;
    log::set_max_level(filter);
    Ok(())
}
