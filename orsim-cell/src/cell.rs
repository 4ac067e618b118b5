//! The cell type queued and forwarded by the relay scheduler.

use crate::header::{CellCmd, CellHeader, CircId, CELL_HEADER_LEN, CELL_PAYLOAD_SIZE};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use orsim_bytes::Writer;

/// A single cell, as queued on a circuit and written to a socket.
///
/// A cell is *framed* when its buffer begins with an encoded
/// [`CellHeader`] (the form cells take on relay-to-relay connections),
/// and *bare* when it is a headerless payload (the form used on edge
/// connections, and the form a framed cell takes once its header has
/// been stripped for delivery).
#[derive(Debug, Clone)]
pub struct Cell {
    /// The encoded bytes of this cell.
    body: BytesMut,
    /// True if `body` starts with a 14-byte header.
    framed: bool,
}

impl Cell {
    /// Construct a framed cell from bytes read off a relay-to-relay
    /// connection.
    pub fn from_wire(data: &[u8]) -> Self {
        Cell {
            body: BytesMut::from(data),
            framed: true,
        }
    }

    /// Construct a bare cell from bytes read off an edge connection.
    pub fn bare(data: &[u8]) -> Self {
        Cell {
            body: BytesMut::from(data),
            framed: false,
        }
    }

    /// Package `payload` into a fresh RELAY_DATA cell for `circ_id`.
    ///
    /// The payload is padded with zeros up to [`CELL_PAYLOAD_SIZE`];
    /// the header's length field records how many of the payload bytes
    /// are meaningful.
    pub fn package(circ_id: CircId, payload: &[u8]) -> Result<Self> {
        if payload.len() > CELL_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLong);
        }
        let header = CellHeader::data(circ_id, payload.len() as u16);
        let mut body = BytesMut::with_capacity(CELL_HEADER_LEN + CELL_PAYLOAD_SIZE);
        header.encode_onto(&mut body);
        body.write_all(payload);
        body.write_zeros(CELL_PAYLOAD_SIZE - payload.len());
        Ok(Cell { body, framed: true })
    }

    /// Construct a fresh circuit-level SENDME cell for `circ_id`.
    pub fn sendme(circ_id: CircId) -> Self {
        let mut body = BytesMut::with_capacity(CELL_HEADER_LEN + CELL_PAYLOAD_SIZE);
        CellHeader::sendme(circ_id).encode_onto(&mut body);
        body.write_zeros(CELL_PAYLOAD_SIZE);
        Cell { body, framed: true }
    }

    /// Return true if this cell carries a header.
    pub fn is_framed(&self) -> bool {
        self.framed
    }

    /// Decode this cell's header without consuming it.
    pub fn header(&self) -> Result<CellHeader> {
        if !self.framed {
            return Err(Error::MissingHeader);
        }
        CellHeader::peek(&self.body[..])
    }

    /// Return the circuit ID from this cell's header.
    pub fn circ_id(&self) -> Result<CircId> {
        Ok(self.header()?.circ_id())
    }

    /// Return true if this is a framed RELAY_SENDME cell.
    ///
    /// Bare cells are never SENDMEs: inbound SENDMEs are consumed
    /// before their headers are stripped.
    pub fn is_sendme(&self) -> bool {
        self.framed
            && matches!(self.header(), Ok(h) if h.cmd() == CellCmd::RELAY_SENDME)
    }

    /// Remove and return this cell's header, leaving a bare payload.
    pub fn strip_header(&mut self) -> Result<CellHeader> {
        let header = self.header()?;
        self.body.advance(CELL_HEADER_LEN);
        self.framed = false;
        Ok(header)
    }

    /// Return the number of bytes this cell occupies on the wire.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Return true if this cell is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Return the encoded bytes of this cell.
    pub fn as_bytes(&self) -> &[u8] {
        &self.body[..]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::CELL_NETWORK_SIZE;

    #[test]
    fn package_pads_to_payload_size() {
        let cell = Cell::package(9.into(), &[0xab; 40]).unwrap();
        assert!(cell.is_framed());
        assert_eq!(cell.len(), CELL_NETWORK_SIZE);
        let h = cell.header().unwrap();
        assert_eq!(h.cmd(), CellCmd::RELAY_DATA);
        assert_eq!(h.circ_id(), 9.into());
        assert_eq!(h.length(), 40);
        assert_eq!(&cell.as_bytes()[CELL_HEADER_LEN..CELL_HEADER_LEN + 40], &[0xab; 40]);
        assert!(cell.as_bytes()[CELL_HEADER_LEN + 40..].iter().all(|b| *b == 0));
    }

    #[test]
    fn package_full_cell() {
        let cell = Cell::package(1.into(), &[0x11; CELL_PAYLOAD_SIZE]).unwrap();
        assert_eq!(cell.len(), CELL_NETWORK_SIZE);
        assert_eq!(cell.header().unwrap().length() as usize, CELL_PAYLOAD_SIZE);
    }

    #[test]
    fn package_too_long() {
        let r = Cell::package(1.into(), &[0; CELL_PAYLOAD_SIZE + 1]);
        assert_eq!(r.unwrap_err(), Error::PayloadTooLong);
    }

    #[test]
    fn sendme_shape() {
        let cell = Cell::sendme(77.into());
        assert!(cell.is_sendme());
        assert_eq!(cell.len(), CELL_NETWORK_SIZE);
        let h = cell.header().unwrap();
        assert_eq!(h.cmd(), CellCmd::RELAY_SENDME);
        assert_eq!(h.stream_id(), 42);
        assert_eq!(h.length(), 0);
    }

    #[test]
    fn strip_header() {
        let mut cell = Cell::package(3.into(), b"some edge data").unwrap();
        let h = cell.strip_header().unwrap();
        assert_eq!(h.length(), 14);
        assert!(!cell.is_framed());
        assert!(!cell.is_sendme());
        assert_eq!(cell.len(), CELL_PAYLOAD_SIZE);
        assert_eq!(&cell.as_bytes()[..14], b"some edge data");
        assert_eq!(cell.header(), Err(Error::MissingHeader));
    }

    #[test]
    fn wire_roundtrip() {
        let cell = Cell::package(12.into(), b"roundtrip").unwrap();
        let again = Cell::from_wire(cell.as_bytes());
        assert_eq!(again.as_bytes(), cell.as_bytes());
        assert_eq!(again.header().unwrap(), cell.header().unwrap());
    }

    #[test]
    fn bare_cells_are_never_sendme() {
        // A bare payload that happens to look like a SENDME header must
        // not be treated as one.
        let mut fake: Vec<u8> = Vec::new();
        CellHeader::sendme(5.into()).encode_onto(&mut fake);
        fake.resize(CELL_PAYLOAD_SIZE, 0);
        let cell = Cell::bare(&fake[..]);
        assert!(!cell.is_sendme());
        assert_eq!(cell.header(), Err(Error::MissingHeader));
    }
}
