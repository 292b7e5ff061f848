//! Runtime helpers
//!
//! Fixed-capacity text formatting for places where building an `alloc`
//! string is not wanted: debugger output and CSV rows.

use core::fmt;

/// Fixed-size line buffer implementing `fmt::Write`
///
/// Formatting past the end truncates and marks the buffer as overflowed
/// instead of failing, so a long record degrades to a clipped line.
pub struct LineBuffer<const N: usize> {
    buf: [u8; N],
    len: usize,
    overflowed: bool,
}

impl<const N: usize> LineBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            overflowed: false,
        }
    }

    /// Bytes written so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole `&str` slices are ever copied in, except on truncation
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                // Truncation split a multi-byte character; drop the tail
                let valid = e.valid_up_to();
                core::str::from_utf8(&self.buf[..valid]).unwrap_or("")
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether any output was dropped
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Shorten to `len` bytes; longer lengths are ignored
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
            self.overflowed = true;
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.overflowed = false;
    }

    /// NUL-terminated copy for C string consumers
    ///
    /// The terminator takes the last slot if the buffer is full.
    pub fn as_c_bytes(&mut self) -> &[u8] {
        if self.len == N {
            if N == 0 {
                return &[];
            }
            self.len = N - 1;
            self.overflowed = true;
        }
        self.buf[self.len] = 0;
        &self.buf[..=self.len]
    }
}

impl<const N: usize> fmt::Write for LineBuffer<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let room = N - self.len;
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        if take < bytes.len() {
            self.overflowed = true;
        }
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for LineBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineBuffer")
            .field("text", &self.as_str())
            .field("overflowed", &self.overflowed)
            .finish()
    }
}
