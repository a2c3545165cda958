//! The log writer child process. Spawned automatically by the uberlog
//! library; running it by hand is only useful for debugging, with the same
//! five arguments the library would pass.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uberlog::writer::{Slave, SlaveConfig};

#[derive(Parser)]
#[command(
    name = "uberlogger",
    about = "Consumes log messages from a shared-memory ring and writes them to a rotating log file.\n\
             Normally launched by the application's uberlog library, not by hand."
)]
struct Args {
    /// Pid of the producer process that owns the shared ring
    parent_pid: u32,

    /// Ring capacity in bytes (must match the producer; power of two)
    ring_capacity: u32,

    /// Path of the log file to write
    filename: PathBuf,

    /// Maximum size of the live log file before it is rotated
    max_log_size: i64,

    /// Number of archived log files to retain
    max_archives: i32,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    Slave::new(SlaveConfig {
        parent_pid: args.parent_pid,
        ring_capacity: args.ring_capacity as usize,
        filename: args.filename,
        max_log_size: args.max_log_size,
        max_archives: args.max_archives,
    })
    .run();
}
