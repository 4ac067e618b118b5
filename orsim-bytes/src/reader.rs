//! Internal: the Reader cursor.

use crate::{Error, Readable, Result};

/// A cursor over a borrowed byte slice, for decoding small
/// fixed-layout structures such as cell headers.
///
/// Every read is bounds-checked and fails with [`Error::Truncated`]
/// when the slice runs out, leaving the cursor where it was.
/// Multi-byte integers are big-endian, as everything on the wire is.
///
/// # Example
///
/// ```
/// use orsim_bytes::{Reader, Result};
/// // Circuit id 7, command 2, then two padding bytes we skip.
/// let wire = [0x00, 0x07, 0x02, 0x00, 0x00];
/// let mut r = Reader::from_slice(&wire);
/// assert_eq!(r.take_u16()?, 7);
/// assert_eq!(r.take_u8()?, 2);
/// r.advance(2)?;
/// assert_eq!(r.remaining(), 0);
/// # Result::Ok(())
/// ```
pub struct Reader<'a> {
    /// The bytes being decoded.
    data: &'a [u8],
    /// Offset of the next unread byte.
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start a cursor at the beginning of `slice`.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader {
            data: slice,
            pos: 0,
        }
    }

    /// Return how many bytes are left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Skip over `n` bytes.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::Truncated);
        }
        self.pos += n;
        Ok(())
    }

    /// Consume and return the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated);
        }
        let taken = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(taken)
    }

    /// Consume one byte.
    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    /// Consume a big-endian u16.
    pub fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Consume a big-endian u32.
    pub fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Decode a [`Readable`] structure from the cursor.
    ///
    /// On failure the cursor is rewound to where it started, so a
    /// half-decoded structure consumes nothing.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        let mark = self.pos;
        let result = E::take_from(self);
        if result.is_err() {
            self.pos = mark;
        }
        result
    }
}
