//! The fixed-layout header prefixing each cell on a relay-to-relay
//! connection.
//!
//! The implemented format is:
//!
//! ```ignore
//!     u16 circ_id;
//!     u8 command;
//!     u8 type;
//!     u16 stream_id;
//!     u32 digest;
//!     u16 length;
//!     u16 padding;
//! ```
//!
//! All fields are encoded big-endian.  The digest is opaque to the
//! simulator and carried unmodified.

use crate::{Error, Result};
use caret::caret_int;
use orsim_bytes::{Readable, Reader, Writer};

/// Total number of bytes in a cell on a relay-to-relay connection.
pub const CELL_NETWORK_SIZE: usize = 512;

/// The amount of data sent in a single cell.
///
/// Cells are 512 bytes long once the 14-byte header is added, so the
/// payload is what remains.
pub const CELL_PAYLOAD_SIZE: usize = CELL_NETWORK_SIZE - CELL_HEADER_LEN;

/// Number of bytes in an encoded cell header.
pub const CELL_HEADER_LEN: usize = 14;

/// The stream identifier carried by locally-originated SENDME cells.
const SENDME_STREAM_ID: u16 = 42;

/// Identifier for a circuit on this relay.
///
/// Circuit IDs are 16 bits long and process-unique: every circuit a
/// relay participates in has a distinct id, whichever connection a
/// cell for it arrives on.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct CircId(u16);

impl From<u16> for CircId {
    fn from(item: u16) -> Self {
        Self(item)
    }
}
impl From<CircId> for u16 {
    fn from(id: CircId) -> u16 {
        id.0
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

caret_int! {
    /// A CellCmd is the command of a relay cell.  The simulator
    /// interprets RELAY_DATA and RELAY_SENDME; cells carrying any
    /// other command are forwarded verbatim without inspection.
    pub struct CellCmd(u8) {
        /// Open a stream (forwarded, not interpreted)
        RELAY_BEGIN = 1,
        /// Data on a stream
        RELAY_DATA = 2,
        /// Close a stream (forwarded, not interpreted)
        RELAY_END = 3,
        /// Stream opened (forwarded, not interpreted)
        RELAY_CONNECTED = 4,
        /// Flow control: replenish the peer's package window
        RELAY_SENDME = 5,
    }
}

caret_int! {
    /// The type tag of a cell: relay cells carry circuit traffic,
    /// everything else is channel-level control.
    pub struct CellType(u8) {
        /// Channel-level control cell
        CONTROL = 0,
        /// Cell transmitted over a circuit
        RELAY = 3,
    }
}

/// A decoded cell header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellHeader {
    /// Circuit ID associated with this cell.
    circ_id: CircId,
    /// Command of this cell.
    cmd: CellCmd,
    /// Type tag of this cell.
    cell_type: CellType,
    /// Stream this cell belongs to, within its circuit.
    stream_id: u16,
    /// Integrity field; opaque to the simulator.
    digest: u32,
    /// Number of meaningful payload bytes in this cell.
    length: u16,
}

impl CellHeader {
    /// Construct the header for a freshly packaged data cell carrying
    /// `length` meaningful payload bytes.
    pub fn data(circ_id: CircId, length: u16) -> Self {
        CellHeader {
            circ_id,
            cmd: CellCmd::RELAY_DATA,
            cell_type: CellType::RELAY,
            stream_id: 0,
            digest: 0,
            length,
        }
    }

    /// Construct the header for a circuit-level SENDME cell.
    pub fn sendme(circ_id: CircId) -> Self {
        CellHeader {
            circ_id,
            cmd: CellCmd::RELAY_SENDME,
            cell_type: CellType::RELAY,
            stream_id: SENDME_STREAM_ID,
            digest: 0,
            length: 0,
        }
    }

    /// Return the circuit ID of this header.
    pub fn circ_id(&self) -> CircId {
        self.circ_id
    }
    /// Return the command of this header.
    pub fn cmd(&self) -> CellCmd {
        self.cmd
    }
    /// Return the type tag of this header.
    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }
    /// Return the stream ID of this header.
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }
    /// Return the (opaque) integrity field of this header.
    pub fn digest(&self) -> u32 {
        self.digest
    }
    /// Return the number of meaningful payload bytes.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Encode this header onto the end of `w`, padding included.
    pub fn encode_onto<W: Writer + ?Sized>(&self, w: &mut W) {
        w.write_u16(self.circ_id.into());
        w.write_u8(self.cmd.into());
        w.write_u8(self.cell_type.into());
        w.write_u16(self.stream_id);
        w.write_u32(self.digest);
        w.write_u16(self.length);
        w.write_zeros(2);
    }

    /// Decode a header from the first [`CELL_HEADER_LEN`] bytes of
    /// `slice` without consuming them.
    ///
    /// Returns [`Error::Truncated`] if the slice is too short.
    pub fn peek(slice: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(slice);
        r.extract().map_err(|_| Error::Truncated)
    }

    /// Decode and remove a header from the front of `buf`.
    ///
    /// Returns [`Error::Truncated`] if fewer than [`CELL_HEADER_LEN`]
    /// bytes are available.
    pub fn remove(buf: &mut bytes::BytesMut) -> Result<Self> {
        if buf.len() < CELL_HEADER_LEN {
            return Err(Error::Truncated);
        }
        let taken = buf.split_to(CELL_HEADER_LEN);
        let mut r = Reader::from_slice(&taken[..]);
        r.extract().map_err(|_| Error::Truncated)
    }
}

impl Readable for CellHeader {
    fn take_from(b: &mut Reader<'_>) -> orsim_bytes::Result<Self> {
        let circ_id: CircId = b.take_u16()?.into();
        let cmd: CellCmd = b.take_u8()?.into();
        let cell_type: CellType = b.take_u8()?.into();
        let stream_id = b.take_u16()?;
        let digest = b.take_u32()?;
        let length = b.take_u16()?;
        b.advance(2)?; // padding
        Ok(CellHeader {
            circ_id,
            cmd,
            cell_type,
            stream_id,
            digest,
            length,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_data_header() {
        let h = CellHeader::data(43.into(), 498);
        let mut v: Vec<u8> = Vec::new();
        h.encode_onto(&mut v);
        assert_eq!(v.len(), CELL_HEADER_LEN);
        assert_eq!(&v[..], &hex!("002b 0203 0000 00000000 01f2 0000")[..]);
    }

    #[test]
    fn encode_sendme_header() {
        let h = CellHeader::sendme(7.into());
        let mut v: Vec<u8> = Vec::new();
        h.encode_onto(&mut v);
        assert_eq!(&v[..], &hex!("0007 0503 002a 00000000 0000 0000")[..]);
    }

    #[test]
    fn peek_roundtrip() {
        let h = CellHeader::data(0x0102.into(), 40);
        let mut v: Vec<u8> = Vec::new();
        h.encode_onto(&mut v);
        let h2 = CellHeader::peek(&v[..]).unwrap();
        assert_eq!(h, h2);
        // peeking doesn't care about trailing bytes.
        v.extend_from_slice(&[0xff; 20]);
        let h3 = CellHeader::peek(&v[..]).unwrap();
        assert_eq!(h, h3);
    }

    #[test]
    fn peek_truncated() {
        let h = CellHeader::data(1.into(), 498);
        let mut v: Vec<u8> = Vec::new();
        h.encode_onto(&mut v);
        for n in 0..CELL_HEADER_LEN {
            assert_eq!(CellHeader::peek(&v[..n]), Err(Error::Truncated));
        }
    }

    #[test]
    fn remove_consumes() {
        let h = CellHeader::sendme(99.into());
        let mut buf = bytes::BytesMut::new();
        h.encode_onto(&mut buf);
        buf.extend_from_slice(b"payload bytes");
        let h2 = CellHeader::remove(&mut buf).unwrap();
        assert_eq!(h, h2);
        assert_eq!(&buf[..], b"payload bytes");

        let mut short = bytes::BytesMut::from(&b"too short"[..]);
        assert_eq!(CellHeader::remove(&mut short), Err(Error::Truncated));
        // a failed remove consumes nothing.
        assert_eq!(&short[..], b"too short");
    }

    #[test]
    fn unrecognized_command_survives() {
        // Commands we don't know about must round-trip unchanged.
        let mut v: Vec<u8> = Vec::new();
        CellHeader {
            circ_id: 5.into(),
            cmd: 99.into(),
            cell_type: CellType::CONTROL,
            stream_id: 0,
            digest: 0xdead_beef,
            length: 17,
        }
        .encode_onto(&mut v);
        let h = CellHeader::peek(&v[..]).unwrap();
        assert!(!h.cmd().is_recognized());
        assert_eq!(u8::from(h.cmd()), 99);
        assert_eq!(h.digest(), 0xdead_beef);
        assert_eq!(h.length(), 17);
    }
}
