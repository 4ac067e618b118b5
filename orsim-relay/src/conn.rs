//! Connections: the byte-level endpoints a relay multiplexes circuits
//! over.
//!
//! A connection owns one socket to a neighbor (another relay, or an
//! edge traffic generator), the leftover buffers that recover short
//! reads and writes, the `reading_blocked` flag that implements
//! package-window back-pressure, and the head of its active-circuit
//! ring.  The ring itself lives in the circuit arena; see
//! [`crate::circuit`].

use crate::circuit::CircIndex;
use crate::pseudo::TimingHook;
use crate::relay::{dispatch_read, dispatch_write, RelayInner};

use log::trace;
use orsim_cell::{Cell, CELL_NETWORK_SIZE, CELL_PAYLOAD_SIZE};
use orsim_rt::{EventId, EventLoop, SimSocket, SocketRef, ValueStream};
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// The type of a connection: relay-to-relay, or relay-to-edge.
///
/// The numeric values are part of the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnType {
    /// A connection to another relay; carries framed 512-byte cells.
    Or = 0,
    /// A connection to an edge endpoint; carries bare 498-byte
    /// payloads.
    Edge = 1,
}

impl ConnType {
    /// Return true for edge connections.
    pub fn is_edge(self) -> bool {
        matches!(self, ConnType::Edge)
    }
}

/// The role of one end of a circuit, as declared at configuration
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HopKind {
    /// The neighbor is another relay.
    RelayEdge,
    /// The neighbor is a pseudo client behind a proxy edge.
    ProxyEdge,
    /// The neighbor is a pseudo server behind an exit edge.
    ServerEdge,
}

impl HopKind {
    /// Return the connection type this hop kind implies.
    pub fn conn_type(self) -> ConnType {
        match self {
            HopKind::RelayEdge => ConnType::Or,
            HopKind::ProxyEdge | HopKind::ServerEdge => ConnType::Edge,
        }
    }
}

/// A connection to one neighbor, as stored in the relay's table.
pub struct Connection {
    /// Our index in the relay's connection table.
    index: usize,
    /// Back-pointer to the relay, for scheduling our callbacks.
    app: Weak<RefCell<RelayInner>>,
    /// Handle to the event loop.
    ev: EventLoop,
    /// The neighbor's address.
    remote: Ipv4Addr,
    /// Relay-to-relay or edge.
    conn_type: ConnType,
    /// The socket, once one has been dialed, accepted, or injected.
    socket: Option<SocketRef>,
    /// Bytes read off the socket that did not fill a whole cell.
    /// Always shorter than one cell.
    inbuf: Vec<u8>,
    /// Staged bytes the socket did not accept on the last write.
    outbuf: Vec<u8>,
    /// True while package-window back-pressure forbids reading.
    reading_blocked: bool,
    /// Head of our active-circuit ring.
    active_circuits: Option<CircIndex>,
    /// Handle of the last scheduled read callback.
    read_event: Option<EventId>,
    /// Handle of the last scheduled write callback.
    write_event: Option<EventId>,
    /// Request-size stream for a pseudo client edge.
    rng_request: Option<Box<dyn ValueStream>>,
    /// Think-time stream for a pseudo client edge.
    rng_think: Option<Box<dyn ValueStream>>,
    /// Time-to-first-byte hook for a pseudo client edge.
    ttfb: Option<TimingHook>,
    /// Time-to-last-byte hook for a pseudo client edge.
    ttlb: Option<TimingHook>,
}

impl Connection {
    /// Create a connection record for `remote`.  The socket arrives
    /// later: dialed or accepted at start-up, or injected by the host.
    pub(crate) fn new(
        index: usize,
        app: Weak<RefCell<RelayInner>>,
        ev: EventLoop,
        remote: Ipv4Addr,
        conn_type: ConnType,
    ) -> Self {
        Connection {
            index,
            app,
            ev,
            remote,
            conn_type,
            socket: None,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            reading_blocked: false,
            active_circuits: None,
            read_event: None,
            write_event: None,
            rng_request: None,
            rng_think: None,
            ttfb: None,
            ttlb: None,
        }
    }

    /// Return the neighbor's address.
    pub fn remote(&self) -> Ipv4Addr {
        self.remote
    }

    /// Return this connection's type.
    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    /// Return true while reading is blocked on package-window credit.
    pub fn is_blocked(&self) -> bool {
        self.reading_blocked
    }

    /// Return how many leftover bytes sit in the read buffer.
    pub fn inbuf_len(&self) -> usize {
        self.inbuf.len()
    }

    /// Return how many unsent bytes sit in the write buffer.
    pub fn outbuf_len(&self) -> usize {
        self.outbuf.len()
    }

    /// Return the cell size this connection reads and writes in.
    pub fn cell_base(&self) -> usize {
        if self.conn_type.is_edge() {
            CELL_PAYLOAD_SIZE
        } else {
            CELL_NETWORK_SIZE
        }
    }

    /// Set or clear the `reading_blocked` flag.
    pub(crate) fn set_blocked(&mut self, blocked: bool) {
        self.reading_blocked = blocked;
    }

    /// Return a handle to our socket, if we have one.
    pub(crate) fn socket(&self) -> Option<SocketRef> {
        self.socket.as_ref().map(Rc::clone)
    }

    /// Install a socket.
    pub(crate) fn set_socket(&mut self, socket: SocketRef) {
        self.socket = Some(socket);
    }

    /// Return the head of our active-circuit ring.
    pub(crate) fn active_circuits(&self) -> Option<CircIndex> {
        self.active_circuits
    }

    /// Set the head of our active-circuit ring.
    pub(crate) fn set_active_circuits(&mut self, head: Option<CircIndex>) {
        self.active_circuits = head;
    }

    /// Store the request/think streams for a pseudo client edge.
    pub(crate) fn set_streams(
        &mut self,
        request: Box<dyn ValueStream>,
        think: Box<dyn ValueStream>,
    ) {
        self.rng_request = Some(request);
        self.rng_think = Some(think);
    }

    /// Take the request/think streams, leaving None behind.
    pub(crate) fn take_streams(&mut self) -> Option<(Box<dyn ValueStream>, Box<dyn ValueStream>)> {
        match (self.rng_request.take(), self.rng_think.take()) {
            (Some(req), Some(think)) => Some((req, think)),
            _ => None,
        }
    }

    /// Store the time-to-first-byte hook.
    pub(crate) fn set_ttfb_hook(&mut self, hook: TimingHook) {
        self.ttfb = Some(hook);
    }

    /// Store the time-to-last-byte hook.
    pub(crate) fn set_ttlb_hook(&mut self, hook: TimingHook) {
        self.ttlb = Some(hook);
    }

    /// Take both timing hooks, leaving None behind.
    pub(crate) fn take_timing_hooks(&mut self) -> (Option<TimingHook>, Option<TimingHook>) {
        (self.ttfb.take(), self.ttlb.take())
    }

    /// Read up to `max_read` fresh bytes from the socket and slice the
    /// result (with any carried-over bytes) into whole cells.
    ///
    /// The trailing partial cell, if any, is stashed in the read
    /// buffer for next time.  On an edge connection a trailing partial
    /// is flushed as a final short cell once the socket has nothing
    /// more to offer: that is the end of the peer's burst, and its
    /// bytes must not wait for traffic that may never come.
    ///
    /// Returns the cells and the count of fresh bytes consumed from
    /// the socket.
    pub(crate) fn read(&mut self, max_read: usize) -> (Vec<Cell>, usize) {
        if self.reading_blocked {
            return (Vec::new(), 0);
        }
        let socket = match &self.socket {
            Some(s) => Rc::clone(s),
            None => return (Vec::new(), 0),
        };

        let (fresh, rx_left) = {
            let mut sock = socket.borrow_mut();
            let fresh = sock.recv(max_read);
            let rx_left = sock.rx_available();
            (fresh, rx_left)
        };
        let read_bytes = fresh.len();

        let mut raw = std::mem::take(&mut self.inbuf);
        raw.extend_from_slice(&fresh);

        let base = self.cell_base();
        let mut cells = Vec::with_capacity(raw.len() / base + 1);
        let mut off = 0;
        while raw.len() - off >= base {
            let chunk = &raw[off..off + base];
            cells.push(if self.conn_type.is_edge() {
                Cell::bare(chunk)
            } else {
                Cell::from_wire(chunk)
            });
            off += base;
        }

        if self.conn_type.is_edge() && off < raw.len() && rx_left == 0 {
            cells.push(Cell::bare(&raw[off..]));
            off = raw.len();
        }

        self.inbuf = raw.split_off(off);
        trace!(
            "conn {}: read {} bytes, {} cells, {} left over",
            self.remote,
            read_bytes,
            cells.len(),
            self.inbuf.len()
        );
        (cells, read_bytes)
    }

    /// Take the staged-but-unsent bytes from the last write.
    pub(crate) fn take_outbuf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbuf)
    }

    /// Send at most `max_write` bytes of `staged` to the socket, and
    /// stash whatever is left (unsent tail included) for next time.
    pub(crate) fn transmit(&mut self, mut staged: Vec<u8>, max_write: usize) -> usize {
        let socket = match &self.socket {
            Some(s) => Rc::clone(s),
            None => {
                self.outbuf = staged;
                return 0;
            }
        };
        let to_send = std::cmp::min(max_write, staged.len());
        let sent = if to_send > 0 {
            socket.borrow_mut().send(&staged[..to_send])
        } else {
            0
        };
        self.outbuf = staged.split_off(sent);
        trace!(
            "conn {}: wrote {} bytes, {} held back",
            self.remote,
            sent,
            self.outbuf.len()
        );
        sent
    }

    /// Arm a one-shot read callback `delay` from now.
    ///
    /// Coalesces: if the previous read event is still pending, the
    /// call does nothing.
    pub(crate) fn schedule_read(&mut self, delay: Duration) {
        if self.socket.is_none() {
            return;
        }
        if let Some(id) = self.read_event {
            if self.ev.is_pending(id) {
                return;
            }
        }
        let app = self.app.clone();
        let index = self.index;
        self.read_event = Some(
            self.ev
                .schedule_in(delay, move || dispatch_read(&app, index)),
        );
    }

    /// Arm a one-shot write callback `delay` from now.  Coalesces like
    /// [`schedule_read`](Connection::schedule_read).
    pub(crate) fn schedule_write(&mut self, delay: Duration) {
        if self.socket.is_none() {
            return;
        }
        if let Some(id) = self.write_event {
            if self.ev.is_pending(id) {
                return;
            }
        }
        let app = self.app.clone();
        let index = self.index;
        self.write_event = Some(
            self.ev
                .schedule_in(delay, move || dispatch_write(&app, index)),
        );
    }

    /// Cancel pending callbacks and close the socket.
    pub(crate) fn shutdown(&mut self) {
        if let Some(id) = self.read_event.take() {
            self.ev.cancel(id);
        }
        if let Some(id) = self.write_event.take() {
            self.ev.cancel(id);
        }
        if let Some(socket) = &self.socket {
            socket.borrow_mut().close();
        }
    }
}
