//! A level-aware, reopenable logging facade.
//!
//! `MailLaser` wires the `log` crate straight into `env_logger` as a single
//! process-wide sink. That's enough for a single-recipient forwarder, but a
//! multi-server daemon needs a `Logger` per `ServerConfig.LogFile` plus one
//! at the daemon level, each independently reopenable for rotation and
//! swappable at reload without disturbing in-flight sessions. This module
//! keeps `log`'s `Level` type (so call sites read the same as any other
//! `log`-based crate in the pack) but owns its own destination rather than
//! going through the global logger, since the global sink cannot have more
//! than one destination at a time.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

pub use log::Level;
use log::LevelFilter;

/// Where a `Logger`'s output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDest {
    Stdout,
    Stderr,
    /// Discards everything written to it (the `/dev/null` equivalent).
    Null,
    File(PathBuf),
}

impl LogDest {
    /// Parses the `log_file` config string: `stdout`, `stderr`, `off`, or a
    /// filesystem path.
    pub fn parse(s: &str) -> LogDest {
        match s {
            "stdout" => LogDest::Stdout,
            "stderr" => LogDest::Stderr,
            "off" | "" => LogDest::Null,
            path => LogDest::File(PathBuf::from(path)),
        }
    }
}

struct Sink {
    dest: LogDest,
    file: Option<File>,
}

fn open_file(path: &PathBuf) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Sink {
    fn open(dest: LogDest) -> std::io::Result<Sink> {
        let file = match &dest {
            LogDest::File(path) => Some(open_file(path)?),
            _ => None,
        };
        Ok(Sink { dest, file })
    }

    fn write_line(&mut self, line: &str) {
        match &self.dest {
            LogDest::Stdout => {
                println!("{line}");
            }
            LogDest::Stderr => {
                eprintln!("{line}");
            }
            LogDest::Null => {}
            LogDest::File(_) => {
                if let Some(file) = self.file.as_mut() {
                    let _ = writeln!(file, "{line}");
                }
            }
        }
    }

    /// Closes and reopens a file-path sink by path; recreates the file if
    /// it no longer exists. No-op for non-file destinations.
    fn reopen(&mut self) -> std::io::Result<()> {
        if let LogDest::File(path) = &self.dest {
            self.file = Some(open_file(path)?);
        }
        Ok(())
    }
}

fn level_to_u8(level: LevelFilter) -> u8 {
    level as u8
}

fn u8_to_level(v: u8) -> LevelFilter {
    match v {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// A level-aware, reopenable log sink.
pub struct Logger {
    sink: Mutex<Sink>,
    level: AtomicU8,
    name: String,
}

impl Logger {
    pub fn new(name: impl Into<String>, dest: LogDest, level: LevelFilter) -> std::io::Result<Logger> {
        Ok(Logger {
            sink: Mutex::new(Sink::open(dest)?),
            level: AtomicU8::new(level_to_u8(level)),
            name: name.into(),
        })
    }

    pub fn null(name: impl Into<String>) -> Logger {
        Logger {
            sink: Mutex::new(Sink {
                dest: LogDest::Null,
                file: None,
            }),
            level: AtomicU8::new(level_to_u8(LevelFilter::Info)),
            name: name.into(),
        }
    }

    fn log(&self, level: Level, args: std::fmt::Arguments<'_>) {
        if level > u8_to_level(self.level.load(Ordering::Relaxed)) {
            return;
        }
        let line = format!("[{}] {} {}: {}", self.name, now_rfc1123(), level, args);
        // Also route through the `log` crate so a process-wide subscriber
        // (env_logger in main.rs) sees it, in addition to this facade's own
        // per-component destination.
        log::log!(target: "maild", level, "{}", args);
        self.sink.lock().unwrap().write_line(&line);
    }

    pub fn debug(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }
    pub fn info(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }
    pub fn warn(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }
    pub fn error(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }
    pub fn fatal(&self, args: std::fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }

    pub fn reopen(&self) -> std::io::Result<()> {
        self.sink.lock().unwrap().reopen()
    }

    pub fn get_log_dest(&self) -> LogDest {
        self.sink.lock().unwrap().dest.clone()
    }

    pub fn get_level(&self) -> LevelFilter {
        u8_to_level(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level_to_u8(level), Ordering::Relaxed);
    }
}

/// `date-time` in RFC 1123 form (`Tue, 02 Jan 2024 15:04:05 +0000`),
/// matching the greeting's date field.
pub fn now_rfc1123() -> String {
    chrono::Utc::now().to_rfc2822()
}
