//! Leveled logging for allocator diagnostics.
//!
//! The crate runs without `std`, so records are handed to a [`LogSink`]
//! installed once per process with [`set_sink`]. Records emitted before a sink
//! is installed are dropped.

use core::{fmt, panic::Location};

use spin::Once;

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*))
    };
}

macro_rules! trace {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Trace, $($arg)*)
    };
}

macro_rules! debug {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*)
    };
}

macro_rules! warn {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A single log record.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub level: LogLevel,
    pub location: &'static Location<'static>,
    pub message: fmt::Arguments<'a>,
}

/// Destination of log records.
pub trait LogSink: Sync {
    /// Returns `true` if records of `level` should be delivered.
    fn enabled(&self, level: LogLevel) -> bool {
        let _ = level;
        true
    }

    fn write(&self, record: &Record<'_>);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Installs the process-wide log sink.
///
/// Returns `false` if a sink was already installed; the first sink stays in
/// place.
pub fn set_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

#[track_caller]
pub fn log(level: LogLevel, message: fmt::Arguments<'_>) {
    let Some(sink) = SINK.get() else {
        return;
    };
    if !sink.enabled(level) {
        return;
    }
    sink.write(&Record {
        level,
        location: Location::caller(),
        message,
    });
}

/// Renders a [`LogLevel`] as a colored, fixed-width label.
pub struct LevelFormat(pub LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            LogLevel::Trace => 35,
            LogLevel::Debug => 34,
            LogLevel::Info => 32,
            LogLevel::Warn => 33,
            LogLevel::Error => 31,
        };
        let msg = match self.0 {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => " INFO",
            LogLevel::Warn => " WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}
