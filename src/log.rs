//! File logger for epic runs, written to `~/.epic-executor/executor.log`.
//!
//! INFO carries run and task outcomes, WARN task failures and kept
//! workspaces. DEBUG adds state transitions and workspace handling; TRACE
//! adds collaborator output. `--debug` or `EPIC_DEBUG=1` selects DEBUG,
//! `EPIC_DEBUG=trace` selects TRACE.
//!
//! Until [`init`] runs the logger has no file and every call is a no-op.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_FILE: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Threshold for a `--debug` flag and an `EPIC_DEBUG` value.
    ///
    /// The environment can raise the flag's level but never lower it.
    pub fn select(debug_flag: bool, env: Option<&str>) -> Self {
        let from_env = match env.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("trace") | Some("2") => LogLevel::Trace,
            Some("1") | Some("true") | Some("debug") => LogLevel::Debug,
            _ => LogLevel::Info,
        };
        let from_flag = if debug_flag {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };
        from_env.max(from_flag)
    }
}

pub fn init() {
    init_with_debug(false);
}

/// Open (and truncate) the log file and set the threshold.
pub fn init_with_debug(debug: bool) {
    let env = std::env::var("EPIC_DEBUG").ok();
    set_level(LogLevel::select(debug, env.as_deref()));

    if let Some(base) = dirs::home_dir().map(|h| h.join(".epic-executor")) {
        let _ = std::fs::create_dir_all(&base);
        let path = base.join("executor.log");
        let _ = std::fs::write(&path, "");
        LOG_FILE.set(path).ok();
    }
}

pub fn set_level(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(THRESHOLD.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level <= self::level()
}

pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_FILE.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.label(), msg);
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

#[macro_export]
macro_rules! elog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! elog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! elog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! elog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// TRACE lines are formatted only when the threshold lets them through.
#[macro_export]
macro_rules! elog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::trace(&format!($($arg)*))
        }
    };
}
