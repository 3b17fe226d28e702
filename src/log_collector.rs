//! Decoupled logging pipeline for provisioning and pipeline runs.
//!
//! ```text
//! log::info!() / warn!() / debug!()
//!     |
//! [LogCollector] (non-blocking send)
//!     | (crossbeam channel)
//!     v
//! [DiskPersister thread]
//!     |                         |
//! logs/full/<ts>_full.log    logs/parsed/<ts>_parsed.log
//! (every record)             (target "parsed" milestones only)
//! ```
//!
//! Records at or above the echo level are also printed to stderr as they
//! are logged. Each invocation writes its own pair of files.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Internal log line or special marker
enum LogMessage {
    Line(LogLine),
    /// Flush marker with channel sender to signal completion
    Flush(std::sync::mpsc::Sender<()>),
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    /// Milestone lines also go to the parsed log.
    pub parsed: bool,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            parsed: false,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    pub fn parsed(message: String) -> Self {
        LogLine {
            parsed: true,
            ..LogLine::new(message)
        }
    }
}

/// Log files of the current invocation.
#[derive(Clone, Debug)]
pub struct SessionLogs {
    pub full: PathBuf,
    pub parsed: PathBuf,
}

impl SessionLogs {
    fn create(log_dir: &Path) -> Result<Self, String> {
        let full_dir = log_dir.join("full");
        let parsed_dir = log_dir.join("parsed");
        std::fs::create_dir_all(&full_dir)
            .map_err(|e| format!("Failed to create full log dir: {}", e))?;
        std::fs::create_dir_all(&parsed_dir)
            .map_err(|e| format!("Failed to create parsed log dir: {}", e))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        Ok(SessionLogs {
            full: full_dir.join(format!("{}_full.log", stamp)),
            parsed: parsed_dir.join(format!("{}_parsed.log", stamp)),
        })
    }
}

fn open_append(path: &Path) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open log file {}: {}", path.display(), e))
}

/// Unified logger: disk persistence in a background thread, stderr echo inline.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    session: SessionLogs,
    echo_level: LevelFilter,
    file_level: LevelFilter,
}

impl LogCollector {
    /// Create the session's log files and start the disk persister.
    ///
    /// `verbose` echoes everything to stderr and records trace output;
    /// otherwise warnings and errors are echoed and debug output is recorded.
    pub fn new(log_dir: &Path, verbose: bool) -> Result<Self, String> {
        let session = SessionLogs::create(log_dir)?;
        let mut full = open_append(&session.full)?;
        let mut parsed = open_append(&session.parsed)?;

        // crossbeam unbounded: sends never block, from any thread or runtime.
        let (tx, rx) = unbounded::<LogMessage>();

        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        let formatted = format!("[{}] {}\n", line.timestamp, line.message);
                        let _ = full.write_all(formatted.as_bytes());
                        if line.parsed {
                            let _ = parsed.write_all(formatted.as_bytes());
                        }
                    }
                    LogMessage::Flush(done) => {
                        let _ = full.flush();
                        let _ = parsed.flush();
                        let _ = full.sync_data();
                        let _ = parsed.sync_data();
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(LogCollector {
            tx,
            session,
            echo_level: if verbose {
                LevelFilter::Trace
            } else {
                LevelFilter::Warn
            },
            file_level: if verbose {
                LevelFilter::Trace
            } else {
                LevelFilter::Debug
            },
        })
    }

    /// Install as the global `log` backend.
    pub fn install(&self) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(self.clone()))?;
        log::set_max_level(self.file_level);
        Ok(())
    }

    pub fn session(&self) -> &SessionLogs {
        &self.session
    }

    /// Send a log line (non-blocking)
    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Block until every line sent so far is on disk.
    pub fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

/// Wires all log::info!(), log::warn!(), log::error!() calls into LogCollector
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.file_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());

        if record.level() <= self.echo_level {
            if record.level() <= Level::Warn {
                eprintln!("{}", message);
            } else {
                eprintln!("{}", record.args());
            }
        }

        if record.target() == "parsed" {
            self.log_line(LogLine::parsed(message));
        } else {
            self.log_line(LogLine::new(message));
        }
    }

    fn flush(&self) {
        let _ = self.wait_for_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_creates_session_files() {
        let dir = tempdir().unwrap();
        let collector = LogCollector::new(dir.path(), false).unwrap();
        assert!(collector.session().full.is_file());
        assert!(collector.session().parsed.is_file());
    }

    #[test]
    fn test_parsed_lines_go_to_both_logs() {
        let dir = tempdir().unwrap();
        let collector = LogCollector::new(dir.path(), false).unwrap();

        for i in 0..100 {
            collector.log_line(LogLine::new(format!("tool line {}", i)));
        }
        collector.log_line(LogLine::parsed("[Pipeline] [TRAIN_MODEL] Started".to_string()));
        collector.wait_for_empty().unwrap();

        let full = fs::read_to_string(&collector.session().full).unwrap();
        let parsed = fs::read_to_string(&collector.session().parsed).unwrap();
        assert_eq!(full.lines().count(), 101);
        assert_eq!(parsed.lines().count(), 1);
        assert!(parsed.contains("TRAIN_MODEL"));
    }

    #[test]
    fn test_level_filtering() {
        let dir = tempdir().unwrap();
        let quiet = LogCollector::new(dir.path(), false).unwrap();
        let meta = |level| Metadata::builder().level(level).build();
        assert!(quiet.enabled(&meta(Level::Debug)));
        assert!(!quiet.enabled(&meta(Level::Trace)));

        let verbose = LogCollector::new(dir.path(), true).unwrap();
        assert!(verbose.enabled(&meta(Level::Trace)));
    }
}
