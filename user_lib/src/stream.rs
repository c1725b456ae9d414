//! In-memory `printf`-style stream with seek/truncate (C12).
//!
//! The original's `FILE` is three raw pointers (`ptr`/`base`/`end`) into a
//! caller-supplied buffer; here they're offsets into a borrowed `&mut
//! [u8]`, which gets the same "write through a fixed window, track how far
//! you've gone" semantics without unsafe pointer arithmetic.
use core::fmt;

use snafu::Snafu;

/// The origin `seek` measures from, matching the C `SEEK_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Relative to the start of the buffer.
    Set,
    /// Relative to the current position.
    Cur,
    /// Relative to the current end of written data.
    End,
}

/// Errors from the stream library.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `fmemopen` was given a mode other than `"w"`/`"a"`.
    #[snafu(display("unsupported mode"))]
    BadMode,
    /// A write would overrun the backing buffer.
    #[snafu(display("buffer full"))]
    BufferFull,
    /// `fseek` targeted an offset outside `[base, end]`.
    #[snafu(display("seek out of range"))]
    SeekOutOfRange,
}

/// An in-memory stream over a fixed byte buffer, opened in `"w"` or `"a"`
/// mode.
pub struct MemoryStream<'a> {
    buf: &'a mut [u8],
    /// Current write/read cursor, as an offset into `buf`.
    ptr: usize,
    /// Start of the valid extent. Always `0`: the original's `base` only
    /// ever differs from the buffer start when reopening a sub-window,
    /// which this API doesn't expose.
    base: usize,
    /// One past the last byte written so far.
    end: usize,
}

impl<'a> MemoryStream<'a> {
    /// Opens `buf` for writing.
    ///
    /// `"w"` starts empty (`ptr == base == end == 0`). `"a"` starts
    /// positioned after `buf`'s existing NUL-terminated contents, appending
    /// to them. Any other mode is rejected.
    pub fn open(buf: &'a mut [u8], mode: &str) -> Result<Self, Error> {
        match mode {
            "w" => Ok(MemoryStream {
                buf,
                ptr: 0,
                base: 0,
                end: 0,
            }),
            "a" => {
                let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                Ok(MemoryStream {
                    buf,
                    ptr: len,
                    base: 0,
                    end: len,
                })
            }
            _ => BadModeSnafu.fail(),
        }
    }

    /// Writes formatted text at the current position, advancing it and
    /// extending `end` if the write moves past it. Returns the number of
    /// bytes written.
    pub fn write_fmt_counted(&mut self, args: fmt::Arguments<'_>) -> Result<usize, Error> {
        let mut writer = Cursor { stream: self, written: 0 };
        fmt::Write::write_fmt(&mut writer, args).map_err(|_| Error::BufferFull)?;
        Ok(writer.written)
    }

    /// Moves the cursor. `offset` is interpreted relative to `whence`, and
    /// must land inside `[base, end]`; on failure the cursor is left
    /// unchanged.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<(), Error> {
        let origin = match whence {
            Whence::Set => self.base as i64,
            Whence::Cur => self.ptr as i64,
            Whence::End => self.end as i64,
        };
        let target = origin + offset;
        if target < self.base as i64 || target > self.end as i64 {
            return SeekOutOfRangeSnafu.fail();
        }
        self.ptr = target as usize;
        Ok(())
    }

    /// Writes a terminating NUL at `end` and returns the written byte
    /// range's length. Mirrors the original's `fclose`, which exists to
    /// NUL-terminate the buffer for callers that then treat it as a C
    /// string; there is no resource to release.
    pub fn close(mut self) -> Result<usize, Error> {
        if self.end >= self.buf.len() {
            return BufferFullSnafu.fail();
        }
        self.buf[self.end] = 0;
        Ok(self.end)
    }

    /// The buffer's current contents from `base` to `end`.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.buf[self.base..self.end]
    }
}

struct Cursor<'a, 'b> {
    stream: &'b mut MemoryStream<'a>,
    written: usize,
}

impl fmt::Write for Cursor<'_, '_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let end = self.stream.ptr + bytes.len();
        if end > self.stream.buf.len() {
            return Err(fmt::Error);
        }
        self.stream.buf[self.stream.ptr..end].copy_from_slice(bytes);
        self.stream.ptr = end;
        if end > self.stream.end {
            self.stream.end = end;
        }
        self.written += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_write_seek_read_round_trips() {
        let mut buf = [0u8; 64];
        buf[..7].copy_from_slice(b"abclo, ");
        let mut s = MemoryStream::open(&mut buf, "a").unwrap();
        let n = s.write_fmt_counted(format_args!("{} {}", "MOS", 2025)).unwrap();
        assert_eq!(n, 8);
        s.seek(0, Whence::Set).unwrap();
        let n = s.write_fmt_counted(format_args!("{}", "Hel")).unwrap();
        assert_eq!(n, 3);
        s.seek(0, Whence::End).unwrap();
        let n = s.write_fmt_counted(format_args!("{}", '!')).unwrap();
        assert_eq!(n, 1);
        let end = s.close().unwrap();
        assert_eq!(&buf[..end], b"Hello, MOS 2025!");
    }

    #[test]
    fn seek_outside_extent_is_rejected_and_leaves_position() {
        let mut buf = [0u8; 16];
        let mut s = MemoryStream::open(&mut buf, "w").unwrap();
        s.write_fmt_counted(format_args!("{}", "hi")).unwrap();
        assert!(s.seek(100, Whence::Set).is_err());
        assert_eq!(s.ptr, 2);
    }

    #[test]
    fn bad_mode_is_rejected() {
        let mut buf = [0u8; 8];
        assert!(MemoryStream::open(&mut buf, "r").is_err());
    }
}
