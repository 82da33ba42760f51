//! Run log: leveled, timestamped lines collected for one migration run.
//!
//! Engine functions take a `&mut dyn Logger` instead of writing to a global.
//! [`RunLog`] is the default implementation: it keeps every entry in memory,
//! forwards it to `tracing`, and flushes the whole run to an append-only
//! file at the end.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Severity of a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// Sink for run log messages.
pub trait Logger {
    fn log(&mut self, level: LogLevel, message: &str);

    fn debug(&mut self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&mut self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&mut self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&mut self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// One line of the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for MigrationLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level.as_str(),
            self.message
        )
    }
}

/// In-memory run log that mirrors entries to `tracing`.
#[derive(Debug, Default)]
pub struct RunLog {
    entries: Vec<MigrationLogEntry>,
}

impl RunLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> &[MigrationLogEntry] {
        &self.entries
    }

    /// Number of entries at `level` or above.
    #[cfg(test)]
    pub(crate) fn count_at_least(&self, level: LogLevel) -> usize {
        self.entries.iter().filter(|e| e.level >= level).count()
    }

    /// Whether any entry's message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }

    /// Append every entry, then `trailer` (if any), to the file at `path`.
    ///
    /// The parent directory is created on demand; the file is opened in
    /// append mode so repeated flushes never truncate earlier runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn flush_to(&self, path: &Path, trailer: Option<&str>) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut buf = String::new();
        for entry in &self.entries {
            buf.push_str(&entry.to_string());
            buf.push('\n');
        }
        if let Some(trailer) = trailer {
            buf.push_str(trailer);
            if !trailer.ends_with('\n') {
                buf.push('\n');
            }
        }
        file.write_all(buf.as_bytes())?;
        file.sync_all()
    }
}

impl Logger for RunLog {
    fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "haul::run", "{message}"),
            LogLevel::Info => tracing::info!(target: "haul::run", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "haul::run", "{message}"),
            LogLevel::Error => tracing::error!(target: "haul::run", "{message}"),
        }
        self.entries.push(MigrationLogEntry {
            at: Utc::now(),
            level,
            message: message.to_string(),
        });
    }
}
