//! `uberlog`: asynchronous, crash-resilient logging.
//!
//! Log calls never touch the filesystem. Each message is framed and pushed
//! onto a shared-memory ring ([`uberlog_ring`]); a writer child process,
//! spawned on first open, drains the ring and appends to a rotating log
//! file. If the application crashes, the writer drains whatever was already
//! committed before exiting, so no acknowledged message is lost.
//!
//! ```no_run
//! use uberlog::Logger;
//!
//! let log = Logger::new();
//! log.open("/var/log/myapp.log")?;
//! uberlog::info!(log, "service starting, build {}", env!("CARGO_PKG_VERSION"));
//! log.close();
//! # Ok::<(), uberlog::OpenError>(())
//! ```
//!
//! The hot path costs one mutex acquire, a prefix render from a cached
//! calendar, and a bounded memcpy into the ring. Back-pressure (a full ring)
//! is the only thing that can block it for long, and that degrades through a
//! tiered sleep schedule rather than spinning.

mod fmtbuf;
mod frame;
mod level;
mod logger;
mod timekeeper;
pub mod writer;

pub use level::Level;
pub use logger::{Logger, OpenError};

/// A warning that cannot go into the log itself, e.g. because the problem is
/// the log. These go to stdout and never fail.
pub(crate) fn out_of_band_warning(msg: impl std::fmt::Display) {
    println!("{msg}");
}

/// Logs at [`Level::Debug`] through the given logger.
#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::Level::Debug, format_args!($($arg)+))
    };
}

/// Logs at [`Level::Info`] through the given logger.
#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::Level::Info, format_args!($($arg)+))
    };
}

/// Logs at [`Level::Warn`] through the given logger.
#[macro_export]
macro_rules! warn {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::Level::Warn, format_args!($($arg)+))
    };
}

/// Logs at [`Level::Error`] through the given logger.
#[macro_export]
macro_rules! error {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::Level::Error, format_args!($($arg)+))
    };
}

/// Logs at [`Level::Fatal`] through the given logger, then aborts.
#[macro_export]
macro_rules! fatal {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::Level::Fatal, format_args!($($arg)+))
    };
}
