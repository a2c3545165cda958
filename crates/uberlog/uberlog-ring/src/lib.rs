//! `uberlog-ring`: single-producer single-consumer byte ring over shared memory.
//!
//! This crate provides the wire between a logging application (the producer)
//! and its log writer child process (the consumer). The ring is a plain byte
//! window of power-of-two capacity followed by two word-sized atomic cursors,
//! laid out so that both processes can map the same region and agree on every
//! offset.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┬───────────┬───────────┐
//! │              ring bytes (capacity)           │ read      │ write     │
//! │                                              │ cursor    │ cursor    │
//! └──────────────────────────────────────────────┴───────────┴───────────┘
//!                                                 +capacity   +capacity+8
//! ```
//!
//! # Protocol
//!
//! - Only the producer stores the write cursor; only the consumer stores the
//!   read cursor. Each side merely loads the other's cursor.
//! - One slot is permanently reserved, so a full ring is distinguishable from
//!   an empty one: `readable + writable == capacity - 1`.
//! - Writes are two-phase: [`RingBuffer::write_uncommitted`] stages bytes at
//!   an offset past the write cursor, and [`RingBuffer::commit`] publishes
//!   them with a release store. A consumer that acquires the write cursor
//!   therefore sees either none or all of a staged message.
//! - Reads have a copying form ([`RingBuffer::read`]) and a zero-copy form
//!   ([`RingBuffer::read_nocopy`] followed by [`RingBuffer::advance_read`]).
//!
//! Cursors are stored already reduced modulo `capacity`; all arithmetic is
//! bitmasking, which is why the capacity must be a power of two.

use std::mem::size_of;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes occupied by the two cursors at the tail of the mapped region.
pub const HEAD_SIZE: usize = 2 * size_of::<usize>();

/// A view of an SPSC byte ring living in a caller-provided memory region.
///
/// `RingBuffer` does not own the region. Both processes construct their own
/// view over the same mapping with [`RingBuffer::attach`]; the producer
/// resets the cursors, the consumer attaches to whatever state is there.
pub struct RingBuffer {
    buf: *mut u8,
    capacity: usize,
}

// SAFETY: the view is a pointer plus a length. Moving it across threads is
// fine; the SPSC discipline (one committing side, one advancing side) is the
// caller's contract, exactly as with the underlying shared mapping.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Attaches a ring view to `buf`.
    ///
    /// If `reset` is true, both cursors are zeroed; the creating side of the
    /// shared segment passes `true`, the attaching side `false`. Both sides
    /// must agree on `capacity`.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    ///
    /// # Safety
    /// `buf` must be valid for reads and writes of `capacity + HEAD_SIZE`
    /// bytes for the lifetime of the view, and must be at least word-aligned
    /// (a page-aligned shared mapping always is). At most one producer view
    /// and one consumer view may operate on the region at a time.
    pub unsafe fn attach(buf: *mut u8, capacity: usize, reset: bool) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two, got {capacity}"
        );
        let ring = Self { buf, capacity };
        if reset {
            ring.read_cursor().store(0, Ordering::Relaxed);
            ring.write_cursor().store(0, Ordering::Relaxed);
        }
        ring
    }

    #[inline(always)]
    fn mask(&self) -> usize {
        self.capacity - 1
    }

    #[inline(always)]
    fn read_cursor(&self) -> &AtomicUsize {
        // SAFETY: attach() guarantees the region extends HEAD_SIZE bytes past
        // the ring window; the cursor slots are word-aligned within it.
        unsafe { &*(self.buf.add(self.capacity) as *const AtomicUsize) }
    }

    #[inline(always)]
    fn write_cursor(&self) -> &AtomicUsize {
        // SAFETY: as for read_cursor(), one word further along.
        unsafe { &*(self.buf.add(self.capacity + size_of::<usize>()) as *const AtomicUsize) }
    }

    /// Ring window size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The largest message that can ever be transmitted in one commit: one
    /// slot stays reserved to disambiguate a full ring from an empty one.
    pub fn max_atomic_write(&self) -> usize {
        self.capacity - 1
    }

    /// Bytes currently committed and not yet consumed.
    pub fn available_for_read(&self) -> usize {
        let r = self.read_cursor().load(Ordering::Acquire);
        let w = self.write_cursor().load(Ordering::Acquire);
        w.wrapping_sub(r) & self.mask()
    }

    /// Bytes that can be staged and committed right now.
    pub fn available_for_write(&self) -> usize {
        self.capacity - 1 - self.available_for_read()
    }

    /// Stages `data` at `offset` bytes past the write cursor without
    /// publishing it. Splits the copy across the wrap when needed.
    ///
    /// # Panics
    /// Panics if `offset + data.len()` exceeds [`Self::available_for_write`].
    pub fn write_uncommitted(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.available_for_write(),
            "attempt to stage {} bytes at offset {offset} with only {} writable",
            data.len(),
            self.available_for_write()
        );
        let start = (self.write_cursor().load(Ordering::Relaxed) + offset) & self.mask();
        let first = data.len().min(self.capacity - start);
        // SAFETY: start < capacity and the assert above bounds the total
        // staged length to the writable region, so neither copy leaves the
        // ring window.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.buf.add(start), first);
            if first < data.len() {
                ptr::copy_nonoverlapping(data.as_ptr().add(first), self.buf, data.len() - first);
            }
        }
    }

    /// Publishes `len` previously staged bytes by advancing the write cursor.
    ///
    /// The release store is what makes a staged message visible to the
    /// consumer as a unit: the staging memcpy happens-before it, and the
    /// consumer's acquire load of the write cursor happens-before its reads
    /// of the payload bytes.
    pub fn commit(&self, len: usize) {
        let w = self.write_cursor().load(Ordering::Relaxed);
        self.write_cursor()
            .store(w.wrapping_add(len) & self.mask(), Ordering::Release);
    }

    /// Copies up to `dst.len()` readable bytes into `dst` and advances the
    /// read cursor. Returns the number of bytes copied.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available_for_read());
        let start = self.read_cursor().load(Ordering::Relaxed);
        let first = n.min(self.capacity - start);
        // SAFETY: start < capacity and n is bounded by the readable region.
        unsafe {
            ptr::copy_nonoverlapping(self.buf.add(start), dst.as_mut_ptr(), first);
            if first < n {
                ptr::copy_nonoverlapping(self.buf, dst.as_mut_ptr().add(first), n - first);
            }
        }
        self.read_cursor()
            .store(start.wrapping_add(n) & self.mask(), Ordering::Release);
        n
    }

    /// Returns one or two spans inside the ring that together hold the next
    /// `len` readable bytes, without advancing the read cursor. The second
    /// span is empty unless the data wraps. Call [`Self::advance_read`] once
    /// the spans have been consumed.
    ///
    /// # Panics
    /// Panics if `len` exceeds [`Self::available_for_read`].
    pub fn read_nocopy(&self, len: usize) -> (&[u8], &[u8]) {
        assert!(
            len <= self.available_for_read(),
            "attempt to read {len} bytes with only {} readable",
            self.available_for_read()
        );
        let start = self.read_cursor().load(Ordering::Relaxed);
        if start + len <= self.capacity {
            // SAFETY: the span lies inside the ring window; the producer will
            // not overwrite it until the read cursor advances past it.
            (unsafe { slice::from_raw_parts(self.buf.add(start), len) }, &[])
        } else {
            let first = self.capacity - start;
            // SAFETY: as above, split at the wrap point.
            unsafe {
                (
                    slice::from_raw_parts(self.buf.add(start), first),
                    slice::from_raw_parts(self.buf, len - first),
                )
            }
        }
    }

    /// Advances the read cursor by `len` bytes, releasing the space back to
    /// the producer.
    pub fn advance_read(&self, len: usize) {
        debug_assert!(len <= self.available_for_read());
        let r = self.read_cursor().load(Ordering::Relaxed);
        self.read_cursor()
            .store(r.wrapping_add(len) & self.mask(), Ordering::Release);
    }
}
