//! Single-bit corruption of byte streams.
//!
//! [`CorruptingReader`] decorates any [`Read`] source and inverts exactly one
//! bit, addressed globally from the start of the stream. Everything else
//! passes through untouched.
//!
//! # Bit addressing
//!
//! Offsets count bits from the start of the stream, most significant bit
//! first (the same convention the bzip2 block scanner uses):
//!
//! ```text
//! byte:      0                 1
//! bit:    0 1 2 3 4 5 6 7 | 8 9 10 11 12 13 14 15
//! mask:  80 40 20 10 8 4 2 1|80 40 20 10  8  4  2  1
//! ```
//!
//! Offset `n` lands in byte `n / 8` under mask `0x80 >> (n % 8)`.
//!
//! # Streaming
//!
//! The reader never buffers. Corruption is applied to whatever the caller's
//! buffer received from the inner source, so the stream length does not need
//! to be known and unbounded sources work.

use std::io::{self, Read};

use thiserror::Error;

/// Errors raised by [`CorruptingReader`] configuration.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The target offset can only be replaced before the first byte is read.
    #[error("cannot re-target corruption after {position} bytes were consumed")]
    AlreadyConsumed { position: u64 },
}

/// A reader that flips one bit of its inner source.
///
/// # Examples
///
/// ```
/// use bitflip::CorruptingReader;
/// use std::io::Read;
///
/// let mut reader = CorruptingReader::with_offset(&[0x00u8, 0x00][..], Some(14));
/// let mut out = Vec::new();
/// reader.read_to_end(&mut out).unwrap();
/// assert_eq!(out, vec![0x00, 0x02]);
/// ```
#[derive(Debug)]
pub struct CorruptingReader<R> {
    inner: R,
    offset: Option<u64>,
    position: u64,
}

impl<R: Read> CorruptingReader<R> {
    /// Wraps `inner` without any corruption configured.
    pub fn new(inner: R) -> Self {
        Self::with_offset(inner, None)
    }

    /// Wraps `inner`, flipping the bit at `offset` (`None` = pass-through).
    pub fn with_offset(inner: R, offset: Option<u64>) -> Self {
        Self {
            inner,
            offset,
            position: 0,
        }
    }

    /// Reads a single byte, or `None` once the inner source is exhausted.
    ///
    /// End-of-stream leaves the position untouched.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.corrupt(&mut byte);
        self.position += 1;
        Ok(Some(byte[0]))
    }
}

impl<R> CorruptingReader<R> {
    /// The configured target bit, if any.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Replaces the target bit.
    ///
    /// Only allowed while nothing has been consumed yet; a stream that already
    /// yielded bytes has to be rebuilt with [`CorruptingReader::with_offset`].
    pub fn set_offset(&mut self, offset: Option<u64>) -> Result<(), StreamError> {
        if self.position > 0 {
            return Err(StreamError::AlreadyConsumed {
                position: self.position,
            });
        }
        self.offset = offset;
        Ok(())
    }

    /// Number of bytes yielded so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// `offset - position * 8`: where the target bit sits relative to the next
    /// byte to be produced.
    ///
    /// A value in `0..8` means the next byte is the one that gets corrupted,
    /// `>= 8` means it is still ahead and a negative value means it already
    /// went by.
    pub fn bit_index_in_current_byte(&self) -> Option<i64> {
        self.offset.map(|offset| {
            let index = offset as i128 - self.position as i128 * 8;
            index.clamp(i64::MIN as i128, i64::MAX as i128) as i64
        })
    }

    /// Unwraps the reader, returning the inner source.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Applies the flip to `chunk`, which holds the bytes starting at the
    /// current position.
    fn corrupt(&self, chunk: &mut [u8]) {
        let Some(offset) = self.offset else {
            return;
        };
        let target_byte = offset / 8;
        if target_byte < self.position {
            return;
        }
        let Ok(rel) = usize::try_from(target_byte - self.position) else {
            return;
        };
        if let Some(byte) = chunk.get_mut(rel) {
            *byte = flip_bit_in_byte(*byte, (offset % 8) as u8);
        }
    }
}

impl<R: Read> Read for CorruptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.corrupt(&mut buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

/// Inverts bit `bit` of `byte`, counting from the most significant bit.
#[inline]
pub fn flip_bit_in_byte(byte: u8, bit: u8) -> u8 {
    debug_assert!(bit < 8);
    byte ^ (0x80 >> (bit & 7))
}

/// Inverts global bit `bit` of `data` in place.
///
/// Indices past the end of the buffer are ignored.
///
/// ```
/// let mut data = [0xAAu8, 0xBB];
/// bitflip::flip_bit(&mut data, 15);
/// assert_eq!(data, [0xAA, 0xBA]);
/// bitflip::flip_bit(&mut data, 16);
/// assert_eq!(data, [0xAA, 0xBA]);
/// ```
pub fn flip_bit(data: &mut [u8], bit: u64) {
    let Ok(index) = usize::try_from(bit / 8) else {
        return;
    };
    if let Some(byte) = data.get_mut(index) {
        *byte = flip_bit_in_byte(*byte, (bit % 8) as u8);
    }
}
