//! Append-only request logs
//!
//! Two plain-text streams, one line per event:
//!
//! ```text
//! 2024-03-01 12:00:00,123 - Successful request for model gpt-4 took 1.234 seconds
//! 2024-03-01 12:00:05,456 - Error for model gpt-4: connection refused
//! ```
//!
//! [`LogEvent`] is the only place the line shape is defined; writing and
//! parsing both go through it, so the analytics fold always understands what
//! the relay wrote.
//!
//! A success line's model name runs up to the last ` took <secs> seconds`, so
//! names may themselves contain " took ". In failure lines the name ends at the
//! first `: `.

use chrono::{Local, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Timestamp prefix format, e.g. `2024-03-01 12:00:00,123`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

static SUCCESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+-\d+-\d+ \d+:\d+:\d+,\d+) - Successful request for model (.+) took (\d+\.\d+) seconds")
        .expect("success line pattern")
});

static FAILURE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+-\d+-\d+ \d+:\d+:\d+,\d+) - Error for model (.+?): (.*)$")
        .expect("failure line pattern")
});

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log storage error: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// One relay outcome as recorded in the logs.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Success { model: String, duration: Duration },
    Failure { model: String, error: String },
}

impl LogEvent {
    pub fn success(model: impl Into<String>, duration: Duration) -> Self {
        LogEvent::Success {
            model: model.into(),
            duration,
        }
    }

    pub fn failure(model: impl Into<String>, error: impl Into<String>) -> Self {
        LogEvent::Failure {
            model: model.into(),
            error: error.into(),
        }
    }

    /// Message text without the timestamp prefix.
    pub fn message(&self) -> String {
        match self {
            LogEvent::Success { model, duration } => format!(
                "Successful request for model {} took {:.3} seconds",
                model,
                duration.as_secs_f64()
            ),
            // Keep one event per line.
            LogEvent::Failure { model, error } => format!(
                "Error for model {}: {}",
                model,
                error.replace(['\r', '\n'], " ")
            ),
        }
    }

    pub fn to_line(&self, at: NaiveDateTime) -> String {
        format!("{} - {}", at.format(TIMESTAMP_FORMAT), self.message())
    }
}

/// A parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: String,
    pub event: LogEvent,
}

impl LogRecord {
    /// Parse a line written by [`LogEvent::to_line`]. Unknown lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(caps) = SUCCESS_LINE.captures(line) {
            let seconds: f64 = caps[3].parse().ok()?;
            let duration = Duration::try_from_secs_f64(seconds).ok()?;
            return Some(Self {
                timestamp: caps[1].to_string(),
                event: LogEvent::success(&caps[2], duration),
            });
        }
        if let Some(caps) = FAILURE_LINE.captures(line) {
            return Some(Self {
                timestamp: caps[1].to_string(),
                event: LogEvent::failure(&caps[2], &caps[3]),
            });
        }
        None
    }
}

/// A single append-only text file.
#[derive(Clone)]
pub struct LogStream {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl LogStream {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; the file is opened on first use.
    pub fn append_line(&self, line: &str) -> Result<()> {
        let mut file_guard = self
            .file
            .lock()
            .map_err(|e| LogError::Storage(format!("Lock error: {}", e)))?;

        if file_guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *file_guard = Some(file);
        }

        if let Some(ref mut file) = *file_guard {
            writeln!(file, "{}", line)?;
            file.flush()?;
        }

        Ok(())
    }

    /// All lines currently in the file; a missing file reads as empty.
    pub fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let lines: std::result::Result<Vec<String>, _> = reader.lines().collect();
        lines.map_err(|e| e.into())
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("path", &self.path)
            .finish()
    }
}

/// The success and error streams written by the relay.
#[derive(Debug, Clone)]
pub struct RequestLog {
    success: LogStream,
    error: LogStream,
}

impl RequestLog {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(success_path: P, error_path: Q) -> Self {
        Self {
            success: LogStream::new(success_path),
            error: LogStream::new(error_path),
        }
    }

    pub fn success_stream(&self) -> &LogStream {
        &self.success
    }

    pub fn error_stream(&self) -> &LogStream {
        &self.error
    }

    /// Append `event` to the stream matching its kind, stamped with local time.
    pub fn record(&self, event: &LogEvent) -> Result<()> {
        let line = event.to_line(Local::now().naive_local());
        match event {
            LogEvent::Success { .. } => self.success.append_line(&line),
            LogEvent::Failure { .. } => self.error.append_line(&line),
        }
    }
}
