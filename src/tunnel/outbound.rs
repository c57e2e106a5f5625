//! Per-descriptor buffered writes
//!
//! A non-blocking socket may accept only part of a write. Whatever it
//! refuses stays queued here, in order, until the next writable event.

use bytes::{Buf, BytesMut};
use std::io::{self, ErrorKind, Write};

/// Result of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued has been written
    Drained,
    /// The writer would block; bytes remain queued
    Pending,
}

/// Ordered queue of bytes waiting to be written
#[derive(Debug, Default)]
pub struct WriteBuffer {
    queued: BytesMut,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes behind anything already queued
    pub fn push(&mut self, data: &[u8]) {
        self.queued.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Write as much as `writer` accepts.
    ///
    /// Returns an error only for failures other than `WouldBlock` and
    /// `Interrupted`; a writer that accepts zero bytes is treated as closed.
    pub fn flush_into<W: Write>(&mut self, writer: &mut W) -> io::Result<Flush> {
        while !self.queued.is_empty() {
            match writer.write(&self.queued) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.queued.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Flush::Drained)
    }
}
