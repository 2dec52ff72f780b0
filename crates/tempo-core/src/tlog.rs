//! Leveled stderr logging and the invariant-violation path.
//!
//! Best-effort and never panicking: a log line that cannot be written is
//! dropped. Each emit writes through one locked stderr handle, so lines
//! from different threads do not interleave mid-line.
//!
//! # Environment variables
//!
//! - `TEMPO_LOG_LEVEL=<level>` - `off`/`0` .. `trace`/`5` (default: info)
//! - `TEMPO_LOG_FLUSH=1` - flush stderr after each line (useful when
//!   chasing a crash)
//!
//! # Usage
//!
//! ```ignore
//! tinfo!("listening on {}:{}", host, port);
//! twarn!("recv failed on fd {}: {}", fd, errno);
//! tfatal!("duplicate fd {} in pool", fd); // logs at FATAL, then aborts
//! ```
//!
//! `tfatal!` is reserved for programming errors: conditions the design
//! says cannot happen in a correct program. It terminates the process.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Read configuration from the environment. Called lazily on first emit;
/// call explicitly from `main` for deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("TEMPO_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("TEMPO_LOG_FLUSH") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

/// Override the level programmatically (tests, `--quiet` flags).
pub fn set_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn enabled(level: LogLevel) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Write one log line. Prefer the `t*!` macros.
pub fn emit(level: LogLevel, target: &str, args: fmt::Arguments<'_>) {
    if level == LogLevel::Off || !enabled(level) {
        return;
    }
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{} {} :: {}", level.prefix(), target, args);
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = err.flush();
    }
}

/// Log an invariant violation with its source location and terminate.
pub fn emit_fatal(target: &str, file: &str, line: u32, args: fmt::Arguments<'_>) -> ! {
    {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "[FATAL] {} :: invariant violation: {} (at {}:{})",
            target, args, file, line
        );
        let _ = err.flush();
    }
    std::process::abort();
}

#[macro_export]
macro_rules! terror {
    ($($arg:tt)*) => {
        $crate::tlog::emit($crate::tlog::LogLevel::Error, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! twarn {
    ($($arg:tt)*) => {
        $crate::tlog::emit($crate::tlog::LogLevel::Warn, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! tinfo {
    ($($arg:tt)*) => {
        $crate::tlog::emit($crate::tlog::LogLevel::Info, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! tdebug {
    ($($arg:tt)*) => {
        $crate::tlog::emit($crate::tlog::LogLevel::Debug, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! ttrace {
    ($($arg:tt)*) => {
        $crate::tlog::emit($crate::tlog::LogLevel::Trace, module_path!(), format_args!($($arg)*))
    };
}

/// Log a fatal invariant violation and abort the process.
#[macro_export]
macro_rules! tfatal {
    ($($arg:tt)*) => {
        $crate::tlog::emit_fatal(module_path!(), file!(), line!(), format_args!($($arg)*))
    };
}
