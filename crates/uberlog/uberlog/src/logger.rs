//! The producer-side logger.
//!
//! A [`Logger`] owns the shared segment and the writer child process. Log
//! calls format a prefixed message and enqueue it as one atomic frame on the
//! ring; the filesystem is never touched from the calling process. The
//! writer child is spawned on [`Logger::open`] and joined (with a bounded
//! timeout) on [`Logger::close`].
//!
//! All public entry points serialize on one internal mutex, so the ring sees
//! a single producer even when the application logs from many threads. The
//! level filter is an atomic checked before the mutex, keeping suppressed
//! messages free of contention.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use uberlog_ring::RingBuffer;
use uberlog_shm::{segment_name, segment_size_for_ring, SharedSegment, ShmError};

use crate::fmtbuf::{self, Rendered};
use crate::frame::{self, MessageHeader, HEADER_SIZE};
use crate::out_of_band_warning;
use crate::timekeeper::{format_uint_hex, TimeKeeper, TIMESTAMP_LEN};
use crate::Level;

const DEFAULT_RING_SIZE: usize = 1 << 20;
const DEFAULT_MAX_FILE_SIZE: i64 = 30 * 1_048_576;
const DEFAULT_MAX_ARCHIVES: i32 = 3;

/// How long the first log call may wait for the writer child to attach and
/// drain the ring. See [`Logger::log_raw`].
const CHILD_INIT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `close()` waits for the writer child to exit.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Ring back-pressure: after stalling this long, warn once per message.
const STALL_WARN_AFTER: Duration = Duration::from_secs(2);

/// Fixed width of the `YYYY-MM-DDTHH:MM:SS.mmm±HHMM [L] xxxxxxxx ` prefix.
pub(crate) const PREFIX_LEN: usize = 42;
/// Stack scratch for rendering a message; larger messages spill to the heap.
const STACK_SCRATCH: usize = 200;

#[cfg(windows)]
const EOL: &[u8] = b"\r\n";
#[cfg(not(windows))]
const EOL: &[u8] = b"\n";

/// Name of the writer program, resolved next to the running executable
/// unless overridden with [`Logger::set_writer_program`].
const WRITER_PROGRAM: &str = "uberlogger";

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to set up the shared-memory ring")]
    Shm(#[from] ShmError),

    #[error("failed to spawn the log writer '{program}'")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct Logger {
    level: AtomicU8,
    inner: Mutex<Inner>,
}

struct Inner {
    filename: String,
    writer_program: Option<PathBuf>,
    ring_size: usize,
    max_file_size: i64,
    max_archives: i32,
    time: TimeKeeper,
    prefix_override: Option<[u8; PREFIX_LEN]>,
    runtime: Option<Runtime>,
}

/// Everything that exists only while the logger is open.
struct Runtime {
    child: Option<Child>,
    ring: RingBuffer,
    // Keeps the mapping (and therefore `ring`'s backing memory) alive.
    segment: SharedSegment,
    messages_sent: u64,
}

impl Logger {
    pub fn new() -> Logger {
        Logger {
            level: AtomicU8::new(Level::Debug as u8),
            inner: Mutex::new(Inner {
                filename: String::new(),
                writer_program: None,
                ring_size: DEFAULT_RING_SIZE,
                max_file_size: DEFAULT_MAX_FILE_SIZE,
                max_archives: DEFAULT_MAX_ARCHIVES,
                time: TimeKeeper::new(),
                prefix_override: None,
                runtime: None,
            }),
        }
    }

    /// Creates the shared segment, spawns the writer child and marks the
    /// logger open. Idempotent: a second call on an open logger is a no-op.
    ///
    /// The child is handed the producer pid, the ring capacity, the absolute
    /// log filename and the archive settings on its command line; it derives
    /// the segment name from the first and third of those, exactly as this
    /// side does.
    pub fn open(&self, filename: impl AsRef<Path>) -> Result<(), OpenError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.runtime.is_some() {
            return Ok(());
        }
        inner.filename = absolute_path_string(filename.as_ref());

        let pid = std::process::id();
        let name = segment_name(pid, &inner.filename);
        let mut segment = SharedSegment::create(&name, segment_size_for_ring(inner.ring_size))?;
        // SAFETY: the segment is at least ring_size + HEAD_SIZE bytes and we
        // are the creating side, so we reset the cursors.
        let ring = unsafe { RingBuffer::attach(segment.as_mut_ptr(), inner.ring_size, true) };

        let program = inner
            .writer_program
            .clone()
            .unwrap_or_else(default_writer_program);
        let child = Command::new(&program)
            .arg(pid.to_string())
            .arg(inner.ring_size.to_string())
            .arg(&inner.filename)
            .arg(inner.max_file_size.to_string())
            .arg(inner.max_archives.to_string())
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(source) => {
                drop(ring);
                drop(segment);
                let _ = SharedSegment::unlink(&name);
                return Err(OpenError::Spawn { program, source });
            }
        };

        inner.runtime = Some(Runtime {
            child: Some(child),
            ring,
            segment,
            messages_sent: 0,
        });
        Ok(())
    }

    /// Enqueues a `Close` frame, waits up to ten seconds for the writer to
    /// exit, then unmaps and unlinks the segment. Safe to call repeatedly;
    /// also runs on drop.
    ///
    /// On timeout the child handle is released rather than killed: the
    /// writer notices parent death on its own and drains whatever is left.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut runtime) = inner.runtime.take() else {
            return;
        };
        runtime.send(frame::Command::Close, &[]);
        if !runtime.wait_for_child_exit(CHILD_EXIT_TIMEOUT) {
            out_of_band_warning("uberlog: timed out waiting for the log writer to exit");
        }
        let name = runtime.segment.name().to_string();
        drop(runtime);
        let _ = SharedSegment::unlink(&name);
    }

    /// Sets the ring capacity, rounded up to the next power of two. Must be
    /// called before `open`; afterwards it warns and does nothing.
    pub fn set_ring_buffer_size(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.runtime.is_some() {
            out_of_band_warning("uberlog: set_ring_buffer_size must be called before open");
            return;
        }
        inner.ring_size = bytes.next_power_of_two();
    }

    /// Sets the rollover threshold and archive retention count. Must be
    /// called before `open`; afterwards it warns and does nothing.
    pub fn set_archive_settings(&self, max_file_size: i64, max_archives: i32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.runtime.is_some() {
            out_of_band_warning("uberlog: set_archive_settings must be called before open");
            return;
        }
        inner.max_file_size = max_file_size;
        inner.max_archives = max_archives;
    }

    /// Overrides where the writer program is found. Must be called before
    /// `open`; afterwards it warns and does nothing.
    pub fn set_writer_program(&self, path: impl Into<PathBuf>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.runtime.is_some() {
            out_of_band_warning("uberlog: set_writer_program must be called before open");
            return;
        }
        inner.writer_program = Some(path.into());
    }

    /// Sets the level threshold. Must be called before `open`; afterwards it
    /// warns and does nothing.
    pub fn set_level(&self, level: Level) {
        if self.inner.lock().unwrap().runtime.is_some() {
            out_of_band_warning("uberlog: set_level must be called before open");
            return;
        }
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Sets the level threshold from a string; only the first character is
    /// consulted. Unrecognized strings warn and leave the level unchanged.
    pub fn set_level_str(&self, level: &str) {
        match Level::parse(level) {
            Some(level) => self.set_level(level),
            None => out_of_band_warning(format_args!("uberlog: unrecognized log level '{level}'")),
        }
    }

    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn filename(&self) -> String {
        self.inner.lock().unwrap().filename.clone()
    }

    /// Enqueues raw bytes as one log message, with no prefix and no line
    /// terminator. Messages that cannot fit the ring in one frame are
    /// truncated with a warning.
    pub fn log_raw(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        enqueue_log(&mut inner, data);
    }

    /// Writes a formatted message in the default layout: the fixed 42-byte
    /// `date [level] thread-id ` prefix, the rendered message, then the
    /// platform line terminator. Messages below the current level return
    /// without doing any work. `Level::Fatal` aborts the process after the
    /// message is enqueued, without waiting for the writer.
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if (level as u8) < self.level.load(Ordering::Relaxed) {
            return;
        }

        let mut stack = [0u8; STACK_SCRATCH];
        let rendered = fmtbuf::render(&mut stack[PREFIX_LEN..STACK_SCRATCH - EOL.len()], args);

        let mut inner = self.inner.lock().unwrap();
        let fatal_text = match rendered {
            Rendered::Fit(len) => {
                let total = PREFIX_LEN + len + EOL.len();
                compose_prefix(&inner, level, &mut stack[..PREFIX_LEN]);
                stack[PREFIX_LEN + len..total].copy_from_slice(EOL);
                enqueue_log(&mut inner, &stack[..total]);
                (level == Level::Fatal)
                    .then(|| String::from_utf8_lossy(&stack[PREFIX_LEN..PREFIX_LEN + len]).into_owned())
            }
            Rendered::Spilled(message) => {
                let mut payload = Vec::with_capacity(PREFIX_LEN + message.len() + EOL.len());
                payload.resize(PREFIX_LEN, 0);
                compose_prefix(&inner, level, &mut payload[..PREFIX_LEN]);
                payload.extend_from_slice(&message);
                payload.extend_from_slice(EOL);
                enqueue_log(&mut inner, &payload);
                (level == Level::Fatal).then(|| String::from_utf8_lossy(&message).into_owned())
            }
        };

        if let Some(text) = fatal_text {
            drop(inner);
            println!("uberlog fatal: {text}");
            std::process::abort();
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn fatal(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Fatal, args);
    }

    /// Pins the 42-byte prefix to a fixed value, so tests can predict file
    /// contents byte for byte.
    #[doc(hidden)]
    pub fn set_prefix_override(&self, prefix: [u8; PREFIX_LEN]) {
        self.inner.lock().unwrap().prefix_override = Some(prefix);
    }
}

impl Default for Logger {
    fn default() -> Logger {
        Logger::new()
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.close();
    }
}

/// Truncates oversized payloads, sends the frame, and on the first message
/// of this session blocks until the writer has attached and drained the
/// ring. That wait is what makes the very first message crash-proof: once
/// the child holds its own reference to the segment, the segment outlives a
/// producer that faults immediately afterwards.
fn enqueue_log(inner: &mut Inner, payload: &[u8]) {
    let Some(runtime) = inner.runtime.as_mut() else {
        out_of_band_warning("uberlog: log call ignored, the log is not open");
        return;
    };

    let max = runtime.ring.max_atomic_write() - HEADER_SIZE;
    let payload = if payload.len() > max {
        out_of_band_warning(format_args!(
            "uberlog: message of {} bytes exceeds the ring capacity, truncating to {max}",
            payload.len()
        ));
        &payload[..max]
    } else {
        payload
    };

    runtime.messages_sent += 1;
    runtime.send(frame::Command::LogMsg, payload);

    if runtime.messages_sent == 1 && !runtime.wait_for_ring_empty(CHILD_INIT_TIMEOUT) {
        out_of_band_warning("uberlog: timed out waiting for the log writer to consume messages");
    }
}

impl Runtime {
    /// Two-phase framed write with back-pressure. Spins through a tiered
    /// sleep schedule while the ring lacks space, warning once per message
    /// after the stall grows past [`STALL_WARN_AFTER`].
    fn send(&self, command: frame::Command, payload: &[u8]) {
        let header = MessageHeader {
            command,
            payload_len: payload.len(),
        }
        .encode();
        let need = HEADER_SIZE + payload.len();

        let mut spins: u32 = 0;
        let mut started: Option<Instant> = None;
        let mut warned = false;
        while self.ring.available_for_write() < need {
            if spins < 1000 {
                std::thread::yield_now();
            } else if spins < 2000 {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                std::thread::sleep(Duration::from_millis(5));
            }
            spins = spins.saturating_add(1);
            let since = *started.get_or_insert_with(Instant::now);
            if !warned && since.elapsed() >= STALL_WARN_AFTER {
                eprintln!("uberlog: stalled waiting for ring space ({need} bytes needed)");
                warned = true;
            }
        }

        self.ring.write_uncommitted(0, &header);
        if !payload.is_empty() {
            self.ring.write_uncommitted(HEADER_SIZE, payload);
        }
        self.ring.commit(need);
    }

    fn wait_for_ring_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.ring.available_for_read() != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Polls `try_wait` until the child exits or the timeout passes. Polling
    /// (rather than a blocking `wait`) keeps the close path bounded even if
    /// the writer wedges.
    fn wait_for_child_exit(&mut self, timeout: Duration) -> bool {
        let Some(mut child) = self.child.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(_) => return false,
            }
        }
    }
}

/// Writes the 42-byte prefix: 28 bytes of timestamp, the bracketed level
/// code, eight lowercase hex digits of thread id, and a trailing space.
fn compose_prefix(inner: &Inner, level: Level, buf: &mut [u8]) {
    debug_assert_eq!(buf.len(), PREFIX_LEN);
    if let Some(prefix) = inner.prefix_override {
        buf.copy_from_slice(&prefix);
        return;
    }
    inner.time.format_into(&mut buf[..TIMESTAMP_LEN]);
    buf[28] = b' ';
    buf[29] = b'[';
    buf[30] = level.code() as u8;
    buf[31] = b']';
    buf[32] = b' ';
    format_uint_hex(&mut buf[33..41], thread_id());
    buf[41] = b' ';
}

#[cfg(target_os = "linux")]
fn thread_id() -> u32 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::gettid() as u32 }
}

#[cfg(not(target_os = "linux"))]
fn thread_id() -> u32 {
    // No cheap numeric thread id off Linux; the pid at least stays stable
    // within a process.
    std::process::id()
}

fn absolute_path_string(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute.to_string_lossy().into_owned()
}

fn default_writer_program() -> PathBuf {
    match std::env::current_exe() {
        Ok(exe) => match exe.parent() {
            Some(dir) => dir.join(WRITER_PROGRAM),
            None => PathBuf::from(WRITER_PROGRAM),
        },
        Err(_) => PathBuf::from(WRITER_PROGRAM),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_layout() {
        let inner = Inner {
            filename: String::new(),
            writer_program: None,
            ring_size: DEFAULT_RING_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_archives: DEFAULT_MAX_ARCHIVES,
            time: TimeKeeper::new(),
            prefix_override: None,
            runtime: None,
        };
        let mut buf = [0u8; PREFIX_LEN];
        compose_prefix(&inner, Level::Warn, &mut buf);

        assert_eq!(buf[10], b'T');
        assert_eq!(buf[19], b'.');
        assert_eq!(&buf[28..30], b" [");
        assert_eq!(buf[30], b'W');
        assert_eq!(&buf[31..33], b"] ");
        assert!(buf[33..41]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b)));
        assert_eq!(buf[41], b' ');
    }

    #[test]
    fn prefix_override_wins() {
        let mut inner = Inner {
            filename: String::new(),
            writer_program: None,
            ring_size: DEFAULT_RING_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_archives: DEFAULT_MAX_ARCHIVES,
            time: TimeKeeper::new(),
            prefix_override: None,
            runtime: None,
        };
        let pinned = *b"2015-07-15T14:53:51.979+0200 [I] 00001fdc ";
        inner.prefix_override = Some(pinned);
        let mut buf = [0u8; PREFIX_LEN];
        compose_prefix(&inner, Level::Error, &mut buf);
        assert_eq!(buf, pinned);
    }

    #[test]
    fn mutators_reject_nothing_before_open() {
        let log = Logger::new();
        log.set_ring_buffer_size(1000);
        assert_eq!(log.inner.lock().unwrap().ring_size, 1024, "rounded up to a power of two");
        log.set_archive_settings(4096, 7);
        log.set_level(Level::Error);
        assert_eq!(log.level(), Level::Error);
        log.set_level_str("warning");
        assert_eq!(log.level(), Level::Warn);
        log.set_level_str("bogus");
        assert_eq!(log.level(), Level::Warn, "unrecognized levels are ignored");
    }

    #[test]
    fn logging_while_closed_is_a_no_op() {
        let log = Logger::new();
        log.log_raw(b"dropped");
        log.info(format_args!("also dropped"));
        log.close();
    }
}
