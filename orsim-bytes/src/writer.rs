//! Internal: the Writer sink trait and its buffer implementations.

use bytes::BytesMut;

/// A sink for encoding small byte-oriented structures.
///
/// Unlike `std::io::Write`, these methods cannot fail: every sink is
/// an in-memory buffer.  Multi-byte integers are written big-endian.
///
/// # Example
///
/// ```
/// use orsim_bytes::Writer;
/// let mut w: Vec<u8> = Vec::new();
/// w.write_u16(7);     // a circuit id
/// w.write_u8(2);      // a command
/// w.write_zeros(2);   // padding
/// assert_eq!(w, [0x00, 0x07, 0x02, 0x00, 0x00]);
/// ```
pub trait Writer {
    /// Append `bytes` to this writer.
    fn write_all(&mut self, bytes: &[u8]);

    /// Append one byte.
    fn write_u8(&mut self, x: u8) {
        self.write_all(&[x]);
    }
    /// Append a u16, big-endian.
    fn write_u16(&mut self, x: u16) {
        self.write_all(&x.to_be_bytes());
    }
    /// Append a u32, big-endian.
    fn write_u32(&mut self, x: u32) {
        self.write_all(&x.to_be_bytes());
    }
    /// Append `n` zero bytes, as used for header and payload padding.
    fn write_zeros(&mut self, n: usize) {
        for _ in 0..n {
            self.write_u8(0);
        }
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
    fn write_zeros(&mut self, n: usize) {
        let len = self.len() + n;
        self.resize(len, 0);
    }
}

impl Writer for BytesMut {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
    fn write_zeros(&mut self, n: usize) {
        let len = self.len() + n;
        self.resize(len, 0);
    }
}
