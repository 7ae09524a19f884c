//! Growable read/write byte buffer backing connection and log I/O.
//!
//! The buffer keeps two cursors into one contiguous region:
//! `[read_pos, write_pos)` is readable, `[write_pos, capacity)` is
//! writable. Appends that outgrow the tail first reclaim the consumed
//! prefix by shifting readable bytes to offset 0, and only then grow the
//! backing storage.

use std::io::{self, IoSliceMut, Read, Write};

const INITIAL_CAPACITY: usize = 1024;

/// Scratch region used by [`Buffer::read_from`] so a single scatter read
/// can pull in more than the current tail holds.
const SCRATCH_LEN: usize = 64 * 1024;

/// A growable, contiguous byte buffer with separate read and write cursors.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Creates a buffer with at least `capacity` writable bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn remaining(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be written before the buffer has to
    /// compact or grow.
    pub fn remaining_mut(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Marks `n` bytes as consumed. Consuming everything resets both
    /// cursors so the full capacity becomes writable again.
    pub fn mark_read(&mut self, n: usize) {
        self.read_pos = self.write_pos.min(self.read_pos + n);
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Marks `n` bytes of the writable tail as filled.
    pub fn mark_written(&mut self, n: usize) {
        self.write_pos = self.data.len().min(self.write_pos + n);
    }

    /// Discards all readable bytes.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Consumes every readable byte into a `String` (lossy on invalid
    /// UTF-8).
    pub fn take_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.clear();
        s
    }

    /// Appends `bytes`, compacting or growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.make_room(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Ensures at least `needed` writable bytes. Compacts when the tail
    /// plus the consumed prefix suffice, otherwise grows to
    /// `write_pos + needed`.
    fn make_room(&mut self, needed: usize) {
        if self.remaining_mut() >= needed {
            return;
        }
        if self.read_pos + self.remaining_mut() >= needed {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        } else {
            self.data.resize(self.write_pos + needed, 0);
        }
    }

    /// Scatter-reads from `src` into the writable tail and a stack
    /// scratch region in one vectored call, appending any scratch
    /// overflow afterwards. Returns the total bytes read; `Ok(0)` is end
    /// of stream.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_LEN];
        let tail_len = self.remaining_mut();
        let n = {
            let (_, tail) = self.data.split_at_mut(self.write_pos);
            let mut regions = [IoSliceMut::new(tail), IoSliceMut::new(&mut scratch)];
            src.read_vectored(&mut regions)?
        };
        if n <= tail_len {
            self.mark_written(n);
        } else {
            self.write_pos = self.data.len();
            self.append(&scratch[..n - tail_len]);
        }
        Ok(n)
    }

    /// Writes readable bytes to `dst`, consuming whatever was accepted.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        let n = dst.write(self.peek())?;
        self.mark_read(n);
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
