//! The writer slave: drains the shared ring and persists messages.
//!
//! This side runs in the `uberlogger` child process. It attaches to the
//! segment by the same well-known name the producer derived, polls the ring
//! with exponential backoff, batches payloads through a small staging buffer
//! to amortize `write` syscalls, and exits when it either receives a `Close`
//! frame or notices that its parent died. In the parent-death case it drains
//! one final time first, which is what makes an acknowledged message survive
//! a producer crash.

mod logfile;

pub use logfile::LogFile;

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;
use uberlog_ring::RingBuffer;
use uberlog_shm::{segment_name, segment_size_for_ring, SharedSegment};

use crate::frame::{Command, MessageHeader, HEADER_SIZE};
use crate::out_of_band_warning;

/// Size of the staging buffer between the ring and the file. Large enough to
/// keep the syscall rate down, small enough not to churn the cache; payloads
/// that exceed it bypass staging entirely via the ring's zero-copy read.
const WRITE_BUF_SIZE: usize = 1024;

/// Idle backoff doubles up to this ceiling.
const MAX_SLEEP_MS: u64 = 1024;
/// Sleep between attach attempts while the producer is still creating the
/// segment.
const ATTACH_RETRY_MS: u64 = 1;

/// Moves committed frames from the ring into the log file.
pub struct Drainer {
    log: LogFile,
    staging: [u8; WRITE_BUF_SIZE],
    close_received: bool,
}

impl Drainer {
    pub fn new(log: LogFile) -> Drainer {
        Drainer {
            log,
            staging: [0; WRITE_BUF_SIZE],
            close_received: false,
        }
    }

    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Consumes every whole frame currently in the ring and returns how many
    /// log messages that was. Payloads are gathered in the staging buffer
    /// and flushed when it fills and once more on exit, so the file sees one
    /// `write` per batch rather than per message.
    ///
    /// # Panics
    /// Panics on a command byte that is neither `Close` nor `LogMsg`; the
    /// stream is corrupt and continuing would write garbage to the file.
    pub fn drain(&mut self, ring: &RingBuffer) -> u64 {
        let mut staged = 0usize;
        let mut messages = 0u64;

        loop {
            let avail = ring.available_for_read();
            if avail < HEADER_SIZE {
                break;
            }
            let mut head = [0u8; HEADER_SIZE];
            let got = ring.read(&mut head);
            debug_assert_eq!(got, HEADER_SIZE);
            let (raw_command, payload_len) = MessageHeader::decode(&head);

            match Command::from_wire(raw_command) {
                Some(Command::Close) => self.close_received = true,
                Some(Command::LogMsg) => {
                    messages += 1;
                    // Commit is all-or-nothing on the producer side, so a
                    // visible header guarantees a visible payload.
                    assert!(
                        payload_len <= avail - HEADER_SIZE,
                        "message payload missing from ring"
                    );

                    if payload_len > WRITE_BUF_SIZE - staged {
                        self.flush(&mut staged);
                    }
                    if payload_len <= WRITE_BUF_SIZE {
                        let got = ring.read(&mut self.staging[staged..staged + payload_len]);
                        debug_assert_eq!(got, payload_len);
                        staged += payload_len;
                    } else {
                        // Too large to ever stage: hand the in-ring spans
                        // straight to the file, then release them.
                        debug_assert_eq!(staged, 0);
                        let (first, second) = ring.read_nocopy(payload_len);
                        let mut outcome = self.log.write(first);
                        if outcome.is_ok() && !second.is_empty() {
                            outcome = self.log.write(second);
                        }
                        if let Err(e) = outcome {
                            out_of_band_warning(format_args!(
                                "uberlogger: failed to write to log file: {e}"
                            ));
                        }
                        ring.advance_read(payload_len);
                    }
                }
                Some(Command::Null) | None => {
                    panic!("corrupt command {raw_command} in the log ring")
                }
            }
        }

        self.flush(&mut staged);
        messages
    }

    fn flush(&mut self, staged: &mut usize) {
        if *staged == 0 {
            return;
        }
        if let Err(e) = self.log.write(&self.staging[..*staged]) {
            out_of_band_warning(format_args!(
                "uberlogger: failed to write to log file: {e}"
            ));
        }
        *staged = 0;
    }
}

pub struct SlaveConfig {
    pub parent_pid: u32,
    pub ring_capacity: usize,
    pub filename: PathBuf,
    pub max_log_size: i64,
    pub max_archives: i32,
}

struct Attachment {
    ring: RingBuffer,
    // Keeps the mapping behind `ring` alive.
    _segment: SharedSegment,
}

/// The writer process proper: attach, drain, watch the parent, shut down.
pub struct Slave {
    segment_name: String,
    segment_size: usize,
    ring_capacity: usize,
    drainer: Drainer,
    attachment: Option<Attachment>,
    parent_dead: bool,
}

impl Slave {
    pub fn new(config: SlaveConfig) -> Slave {
        let filename = config.filename.to_string_lossy().into_owned();
        Slave {
            segment_name: segment_name(config.parent_pid, &filename),
            segment_size: segment_size_for_ring(config.ring_capacity),
            ring_capacity: config.ring_capacity,
            drainer: Drainer::new(LogFile::new(
                config.filename,
                config.max_log_size,
                config.max_archives,
            )),
            attachment: None,
            parent_dead: false,
        }
    }

    pub fn run(&mut self) {
        debug!(segment = %self.segment_name, "log writer starting");

        // Open the file eagerly so a bad path shows up at startup rather
        // than at the first message.
        if let Err(e) = self.drainer.log.open() {
            out_of_band_warning(format_args!("uberlogger: cannot open log file: {e}"));
        }

        let mut sleep_ms: u64 = 0;
        while !self.parent_dead && !self.drainer.close_received {
            let mut idle = false;
            if self.attachment.is_none() {
                self.try_attach();
            }
            if let Some(attachment) = self.attachment.as_ref() {
                if self.drainer.drain(&attachment.ring) == 0 {
                    idle = true;
                }
            }

            if idle {
                sleep_ms = (sleep_ms.max(1) * 2).min(MAX_SLEEP_MS);
            } else if self.attachment.is_some() {
                sleep_ms = 0;
            } else {
                sleep_ms = ATTACH_RETRY_MS;
            }

            self.poll_parent_death();
            if sleep_ms > 0 {
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }

        // A dead parent can no longer commit new frames, but whatever it
        // already committed is still in the mapping. Take it all.
        if self.parent_dead {
            if let Some(attachment) = self.attachment.as_ref() {
                self.drainer.drain(&attachment.ring);
            }
            debug!("log writer stopping: parent process died");
        }
        if self.drainer.close_received {
            debug!("log writer stopping: close frame received");
        }

        self.attachment = None;
        self.drainer.log.close();
    }

    fn try_attach(&mut self) {
        if let Ok(mut segment) = SharedSegment::open(&self.segment_name, self.segment_size) {
            // SAFETY: the producer created and sized this segment for the
            // same capacity it passed on our command line; we attach without
            // resetting the cursors.
            let ring =
                unsafe { RingBuffer::attach(segment.as_mut_ptr(), self.ring_capacity, false) };
            self.attachment = Some(Attachment {
                ring,
                _segment: segment,
            });
        }
        // Failure just means the producer has not finished creating the
        // segment yet; the run loop retries.
    }

    fn poll_parent_death(&mut self) {
        // Once the parent dies this process is reparented to init, so the
        // parent pid collapses to 1 (or 0 on some platforms).
        let ppid = nix::unistd::getppid().as_raw();
        if ppid == 0 || ppid == 1 {
            self.parent_dead = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uberlog_ring::HEAD_SIZE;

    fn region(capacity: usize) -> Box<[usize]> {
        vec![0usize; (capacity + HEAD_SIZE) / std::mem::size_of::<usize>()].into_boxed_slice()
    }

    fn ring_pair(buf: &mut [usize], capacity: usize) -> (RingBuffer, RingBuffer) {
        let base = buf.as_mut_ptr() as *mut u8;
        let producer = unsafe { RingBuffer::attach(base, capacity, true) };
        let consumer = unsafe { RingBuffer::attach(base, capacity, false) };
        (producer, consumer)
    }

    fn enqueue(ring: &RingBuffer, command: Command, payload: &[u8]) {
        let header = MessageHeader {
            command,
            payload_len: payload.len(),
        }
        .encode();
        ring.write_uncommitted(0, &header);
        if !payload.is_empty() {
            ring.write_uncommitted(HEADER_SIZE, payload);
        }
        ring.commit(HEADER_SIZE + payload.len());
    }

    fn test_log(tag: &str) -> (std::path::PathBuf, LogFile) {
        let dir = std::env::temp_dir().join(format!("uberlog-drain-{}-{tag}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create test dir");
        let path = dir.join("drain.log");
        let log = LogFile::new(path.clone(), 1 << 30, 3);
        (path, log)
    }

    #[test]
    fn drain_preserves_message_concatenation() {
        let mut buf = region(4096);
        let (producer, consumer) = ring_pair(&mut buf, 4096);
        let (path, log) = test_log("concat");
        let mut drainer = Drainer::new(log);

        // Sizes chosen to cross the staging buffer boundary mid-drain.
        let mut expect = Vec::new();
        for (i, size) in [1usize, 200, 200, 200, 200, 200, 3, 57].into_iter().enumerate() {
            let msg: Vec<u8> = (0..size).map(|k| (i * 31 + k) as u8).collect();
            enqueue(&producer, Command::LogMsg, &msg);
            expect.extend_from_slice(&msg);
        }
        let consumed = drainer.drain(&consumer);
        assert_eq!(consumed, 8);
        assert!(!drainer.close_received());
        drainer.log.close();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, expect);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn payloads_larger_than_the_staging_buffer_take_the_zero_copy_path() {
        let capacity = 4096;
        let mut buf = region(capacity);
        let (producer, consumer) = ring_pair(&mut buf, capacity);
        let (path, log) = test_log("zerocopy");
        let mut drainer = Drainer::new(log);

        let big_a: Vec<u8> = (0..3000).map(|k| k as u8).collect();
        let big_b: Vec<u8> = (0..3000).map(|k| (k * 7) as u8).collect();

        // First drain leaves the read cursor past the midpoint, so the
        // second large payload wraps and arrives as two spans.
        enqueue(&producer, Command::LogMsg, &big_a);
        assert_eq!(drainer.drain(&consumer), 1);
        enqueue(&producer, Command::LogMsg, &big_b);
        assert_eq!(drainer.drain(&consumer), 1);
        drainer.log.close();

        let mut expect = big_a;
        expect.extend_from_slice(&big_b);
        assert_eq!(std::fs::read(&path).unwrap(), expect);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn close_frame_sets_the_flag_and_later_messages_still_land() {
        let mut buf = region(1024);
        let (producer, consumer) = ring_pair(&mut buf, 1024);
        let (path, log) = test_log("close");
        let mut drainer = Drainer::new(log);

        enqueue(&producer, Command::LogMsg, b"before");
        enqueue(&producer, Command::Close, &[]);
        enqueue(&producer, Command::LogMsg, b"after");

        let consumed = drainer.drain(&consumer);
        assert_eq!(consumed, 2, "close frames are not counted as messages");
        assert!(drainer.close_received());
        drainer.log.close();
        assert_eq!(std::fs::read(&path).unwrap(), b"beforeafter");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    #[should_panic(expected = "corrupt command")]
    fn corrupt_command_aborts_the_drain() {
        let mut buf = region(1024);
        let (producer, consumer) = ring_pair(&mut buf, 1024);
        let (_path, log) = test_log("corrupt");
        let mut drainer = Drainer::new(log);

        let mut head = [0u8; HEADER_SIZE];
        head[0] = 7;
        producer.write_uncommitted(0, &head);
        producer.commit(HEADER_SIZE);
        drainer.drain(&consumer);
    }

    #[test]
    fn empty_ring_drains_nothing() {
        let mut buf = region(256);
        let (_producer, consumer) = ring_pair(&mut buf, 256);
        let (path, log) = test_log("empty");
        let mut drainer = Drainer::new(log);
        assert_eq!(drainer.drain(&consumer), 0);
        drainer.log.close();
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
