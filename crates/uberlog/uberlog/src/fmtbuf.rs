//! Rendering of format arguments into a caller-supplied scratch buffer.
//!
//! The logger renders most messages into a small stack buffer; only messages
//! that outgrow it pay for a heap allocation. [`render`] is the interface the
//! logger consumes: hand it a scratch slice and the `format_args!` bundle,
//! get back either the number of bytes written in place or the spilled heap
//! buffer (which also contains whatever had already landed in the scratch).

use std::fmt::{self, Write};

pub(crate) enum Rendered {
    /// The message fit; this many bytes of the scratch slice are valid.
    Fit(usize),
    /// The message outgrew the scratch; the full message is in the vec.
    Spilled(Vec<u8>),
}

pub(crate) fn render(scratch: &mut [u8], args: fmt::Arguments<'_>) -> Rendered {
    let mut buf = SpillBuffer {
        scratch,
        len: 0,
        heap: None,
    };
    // write_str never fails, so fmt::write cannot either.
    let _ = fmt::write(&mut buf, args);
    match buf.heap {
        Some(heap) => Rendered::Spilled(heap),
        None => Rendered::Fit(buf.len),
    }
}

struct SpillBuffer<'a> {
    scratch: &'a mut [u8],
    len: usize,
    heap: Option<Vec<u8>>,
}

impl Write for SpillBuffer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if let Some(heap) = self.heap.as_mut() {
            heap.extend_from_slice(bytes);
            return Ok(());
        }
        if self.len + bytes.len() <= self.scratch.len() {
            self.scratch[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
        } else {
            let mut heap = Vec::with_capacity((self.len + bytes.len()) * 2);
            heap.extend_from_slice(&self.scratch[..self.len]);
            heap.extend_from_slice(bytes);
            self.heap = Some(heap);
        }
        Ok(())
    }
}
