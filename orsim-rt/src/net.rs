//! In-memory transport for the simulator.
//!
//! The relay scheduler treats every byte source and sink uniformly
//! through the [`SimSocket`] capability set.  This module provides the
//! trait itself, the [`PipeSocket`] transport that connects two relays
//! with a fixed one-way latency, and the [`SimNet`] registry that
//! stands in for the host's TCP stack: relays listen on their address
//! and dial their neighbors through it.

use crate::time::EventLoop;

use log::trace;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;
use thiserror::Error;

/// Callback invoked when a socket becomes readable, or when bytes it
/// accepted for transmission have left its buffer.
pub type SocketCallback = Rc<dyn Fn()>;

/// Shared handle to a socket object.
pub type SocketRef = Rc<RefCell<dyn SimSocket>>;

/// Callback invoked by [`SimNet`] when an inbound connection arrives
/// on a listening address.  Receives the new socket and the dialer's
/// address.
pub type AcceptCallback = Rc<dyn Fn(SocketRef, Ipv4Addr)>;

/// An error produced by the transport registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetError {
    /// Tried to listen on an address that already has a listener.
    #[error("address {0} is already listening")]
    AddressInUse(Ipv4Addr),
}

/// The capability set the relay scheduler expects from a socket.
///
/// Real network sockets and the pseudo client/server traffic
/// generators all implement this trait; the scheduler cannot tell them
/// apart.  None of these methods may invoke a callback synchronously:
/// readiness is always signalled through a scheduled event.
pub trait SimSocket {
    /// Number of bytes available to read right now.
    fn rx_available(&self) -> usize;
    /// Number of bytes the transmit buffer can accept right now.
    fn tx_available(&self) -> usize;
    /// Read and consume up to `max` available bytes.
    fn recv(&mut self, max: usize) -> Vec<u8>;
    /// Queue up to `tx_available()` bytes for transmission; returns
    /// how many were accepted.
    fn send(&mut self, data: &[u8]) -> usize;
    /// Close the socket.  Further sends are discarded, pending
    /// receive data is dropped, and no more callbacks fire.
    fn close(&mut self);
    /// Install the callback that fires when new bytes arrive.
    ///
    /// If data is already waiting, the callback is scheduled
    /// immediately so that no arrival is ever missed.
    fn set_on_readable(&mut self, cb: SocketCallback);
    /// Install the callback that fires when previously accepted bytes
    /// drain from the transmit buffer.
    fn set_on_sent(&mut self, cb: SocketCallback);
}

/// Default transmit-buffer capacity of a [`PipeSocket`], in bytes.
const DEFAULT_TX_CAPACITY: usize = 64 * 1024;

/// One endpoint of an in-memory byte pipe between two peers.
///
/// Bytes accepted by [`send`](SimSocket::send) occupy the transmit
/// buffer for one latency period, then appear in the peer's receive
/// buffer; at that moment the sender's `on_sent` and the receiver's
/// `on_readable` callbacks fire (in that order, as separate calls from
/// a single delivery event).
pub struct PipeSocket {
    /// Handle to the event loop, for scheduling deliveries.
    ev: EventLoop,
    /// Weak handle to ourselves, captured by delivery events.
    self_ref: Weak<RefCell<PipeSocket>>,
    /// The other end of the pipe.
    peer: Weak<RefCell<PipeSocket>>,
    /// One-way delivery latency.
    latency: Duration,
    /// Bytes delivered and not yet consumed by `recv`.
    rx: VecDeque<u8>,
    /// Transmit-buffer capacity.  Test harnesses lower this to model a
    /// stalled link.
    tx_capacity: usize,
    /// Bytes accepted by `send` and not yet delivered.
    in_flight: usize,
    /// Readable-callback, if installed.
    on_readable: Option<SocketCallback>,
    /// Sent-callback, if installed.
    on_sent: Option<SocketCallback>,
    /// True once the socket is closed.
    closed: bool,
}

impl PipeSocket {
    /// Create a connected pair of pipe endpoints with the given
    /// one-way latency and the default transmit capacity.
    pub fn pair(
        ev: &EventLoop,
        latency: Duration,
    ) -> (Rc<RefCell<PipeSocket>>, Rc<RefCell<PipeSocket>>) {
        let mk = || {
            Rc::new(RefCell::new(PipeSocket {
                ev: ev.clone(),
                self_ref: Weak::new(),
                peer: Weak::new(),
                latency,
                rx: VecDeque::new(),
                tx_capacity: DEFAULT_TX_CAPACITY,
                in_flight: 0,
                on_readable: None,
                on_sent: None,
                closed: false,
            }))
        };
        let a = mk();
        let b = mk();
        a.borrow_mut().self_ref = Rc::downgrade(&a);
        a.borrow_mut().peer = Rc::downgrade(&b);
        b.borrow_mut().self_ref = Rc::downgrade(&b);
        b.borrow_mut().peer = Rc::downgrade(&a);
        (a, b)
    }

    /// Adjust the transmit-buffer capacity.
    ///
    /// Raising the capacity on a socket whose writer was starved
    /// schedules its `on_sent` callback so the writer resumes.
    pub fn set_tx_capacity(&mut self, capacity: usize) {
        let was_full = self.tx_available() == 0;
        self.tx_capacity = capacity;
        if was_full && self.tx_available() > 0 {
            if let Some(cb) = self.on_sent.clone() {
                self.ev.schedule_in(Duration::from_secs(0), move || cb());
            }
        }
    }

    /// Deliver `bytes` to the peer and credit the sender's transmit
    /// buffer.  Runs as a scheduled event, one latency after `send`.
    fn deliver(this: &Weak<RefCell<PipeSocket>>, peer: &Weak<RefCell<PipeSocket>>, bytes: Vec<u8>) {
        let n = bytes.len();
        let mut sent_cb = None;
        if let Some(this) = this.upgrade() {
            let mut sock = this.borrow_mut();
            sock.in_flight = sock.in_flight.saturating_sub(n);
            if !sock.closed {
                sent_cb = sock.on_sent.clone();
            }
        }
        let mut readable_cb = None;
        if let Some(peer) = peer.upgrade() {
            let mut sock = peer.borrow_mut();
            if !sock.closed {
                sock.rx.extend(bytes);
                readable_cb = sock.on_readable.clone();
            }
        }
        // Both borrows are released before any callback runs.
        if let Some(cb) = sent_cb {
            cb();
        }
        if let Some(cb) = readable_cb {
            cb();
        }
    }
}

impl SimSocket for PipeSocket {
    fn rx_available(&self) -> usize {
        self.rx.len()
    }

    fn tx_available(&self) -> usize {
        if self.closed {
            0
        } else {
            self.tx_capacity.saturating_sub(self.in_flight)
        }
    }

    fn recv(&mut self, max: usize) -> Vec<u8> {
        let n = std::cmp::min(max, self.rx.len());
        self.rx.drain(..n).collect()
    }

    fn send(&mut self, data: &[u8]) -> usize {
        if self.closed {
            return 0;
        }
        let n = std::cmp::min(data.len(), self.tx_available());
        if n == 0 {
            return 0;
        }
        self.in_flight += n;
        let bytes = data[..n].to_vec();
        let this = self.self_ref.clone();
        let peer = self.peer.clone();
        trace!("pipe: sending {} bytes", n);
        self.ev.schedule_in(self.latency, move || {
            PipeSocket::deliver(&this, &peer, bytes);
        });
        n
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx.clear();
        self.on_readable = None;
        self.on_sent = None;
    }

    fn set_on_readable(&mut self, cb: SocketCallback) {
        if !self.rx.is_empty() {
            let poke = Rc::clone(&cb);
            self.ev.schedule_in(Duration::from_secs(0), move || poke());
        }
        self.on_readable = Some(cb);
    }

    fn set_on_sent(&mut self, cb: SocketCallback) {
        self.on_sent = Some(cb);
    }
}

/// Shared state of a [`SimNet`].
struct NetInner {
    /// Accept callbacks, by listening address.
    listeners: HashMap<Ipv4Addr, AcceptCallback>,
}

/// The listen/dial registry connecting relays to each other.
///
/// There is no routing: dialing an address creates a [`PipeSocket`]
/// pair and, one latency later, hands the far end to whatever listener
/// is registered at that address.  Dialing an address nobody listens
/// on is a topology bug and aborts the simulation.
#[derive(Clone)]
pub struct SimNet {
    /// Handle to the event loop.
    ev: EventLoop,
    /// Shared listener table.
    inner: Rc<RefCell<NetInner>>,
    /// One-way latency applied to every link.
    latency: Duration,
}

impl SimNet {
    /// Create a new registry whose links all have the given one-way
    /// latency.
    pub fn new(ev: &EventLoop, latency: Duration) -> Self {
        SimNet {
            ev: ev.clone(),
            inner: Rc::new(RefCell::new(NetInner {
                listeners: HashMap::new(),
            })),
            latency,
        }
    }

    /// Register an accept callback for `addr`.
    pub fn listen(&self, addr: Ipv4Addr, cb: AcceptCallback) -> Result<(), NetError> {
        let mut inner = self.inner.borrow_mut();
        if inner.listeners.contains_key(&addr) {
            return Err(NetError::AddressInUse(addr));
        }
        inner.listeners.insert(addr, cb);
        Ok(())
    }

    /// Remove the listener for `addr`, if any.
    pub fn unlisten(&self, addr: Ipv4Addr) {
        self.inner.borrow_mut().listeners.remove(&addr);
    }

    /// Dial from `local` to `remote`.
    ///
    /// Returns the near end of the new pipe immediately; the far end
    /// is delivered to `remote`'s listener one latency later.
    ///
    /// # Panics
    ///
    /// Aborts the simulation if no listener exists at `remote` when
    /// the connection arrives: the topology is closed, so this is a
    /// configuration bug.
    pub fn connect(&self, local: Ipv4Addr, remote: Ipv4Addr) -> SocketRef {
        let (near, far) = PipeSocket::pair(&self.ev, self.latency);
        let inner = Rc::clone(&self.inner);
        trace!("net: {} dialing {}", local, remote);
        self.ev.schedule_in(self.latency, move || {
            let cb = inner
                .borrow()
                .listeners
                .get(&remote)
                .map(Rc::clone)
                .unwrap_or_else(|| panic!("connect from {} to {}: nobody listening", local, remote));
            let far: SocketRef = far;
            cb(far, local);
        });
        near
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pipe_delivers_after_latency() {
        let ev = EventLoop::new();
        let (a, b) = PipeSocket::pair(&ev, Duration::from_millis(5));

        let n = a.borrow_mut().send(b"hello pipe");
        assert_eq!(n, 10);
        assert_eq!(a.borrow().in_flight, 10);
        assert_eq!(b.borrow().rx_available(), 0);

        ev.run_until(Duration::from_millis(4));
        assert_eq!(b.borrow().rx_available(), 0);

        ev.run_until(Duration::from_millis(5));
        assert_eq!(b.borrow().rx_available(), 10);
        assert_eq!(a.borrow().in_flight, 0);
        assert_eq!(b.borrow_mut().recv(5), b"hello".to_vec());
        assert_eq!(b.borrow_mut().recv(100), b" pipe".to_vec());
    }

    #[test]
    fn pipe_respects_tx_capacity() {
        let ev = EventLoop::new();
        let (a, _b) = PipeSocket::pair(&ev, Duration::from_millis(1));
        a.borrow_mut().set_tx_capacity(4);
        assert_eq!(a.borrow().tx_available(), 4);
        let n = a.borrow_mut().send(b"too much data");
        assert_eq!(n, 4);
        assert_eq!(a.borrow().tx_available(), 0);
        assert_eq!(a.borrow_mut().send(b"x"), 0);
        ev.run();
        assert_eq!(a.borrow().tx_available(), 4);
    }

    #[test]
    fn raising_capacity_pokes_writer() {
        let ev = EventLoop::new();
        let (a, _b) = PipeSocket::pair(&ev, Duration::from_millis(1));
        a.borrow_mut().set_tx_capacity(0);

        let poked = Rc::new(RefCell::new(false));
        let poked2 = Rc::clone(&poked);
        a.borrow_mut()
            .set_on_sent(Rc::new(move || *poked2.borrow_mut() = true));

        a.borrow_mut().set_tx_capacity(1024);
        ev.run();
        assert!(*poked.borrow());
    }

    #[test]
    fn readable_callback_fires_for_waiting_data() {
        let ev = EventLoop::new();
        let (a, b) = PipeSocket::pair(&ev, Duration::from_millis(1));
        a.borrow_mut().send(b"early");
        ev.run();
        // Data arrived before anyone was listening.
        assert_eq!(b.borrow().rx_available(), 5);

        let seen = Rc::new(RefCell::new(false));
        let seen2 = Rc::clone(&seen);
        b.borrow_mut()
            .set_on_readable(Rc::new(move || *seen2.borrow_mut() = true));
        ev.run();
        assert!(*seen.borrow());
    }

    #[test]
    fn closed_socket_goes_quiet() {
        let ev = EventLoop::new();
        let (a, b) = PipeSocket::pair(&ev, Duration::from_millis(1));
        a.borrow_mut().send(b"data");
        b.borrow_mut().close();
        ev.run();
        assert_eq!(b.borrow().rx_available(), 0);
        assert_eq!(b.borrow_mut().send(b"reply"), 0);
    }

    #[test]
    fn net_connects_to_listener() {
        let ev = EventLoop::new();
        let net = SimNet::new(&ev, Duration::from_millis(2));
        let accepted: Rc<RefCell<Vec<Ipv4Addr>>> = Rc::new(RefCell::new(Vec::new()));

        let accepted2 = Rc::clone(&accepted);
        net.listen(
            Ipv4Addr::new(10, 0, 0, 2),
            Rc::new(move |sock, from| {
                accepted2.borrow_mut().push(from);
                // The pipe is live immediately.
                assert_eq!(sock.borrow_mut().send(b"hi"), 2);
            }),
        )
        .unwrap();

        let near = net.connect(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        ev.run();
        assert_eq!(*accepted.borrow(), vec![Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(near.borrow_mut().recv(10), b"hi".to_vec());
    }

    #[test]
    fn duplicate_listen_rejected() {
        let ev = EventLoop::new();
        let net = SimNet::new(&ev, Duration::from_millis(1));
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        net.listen(addr, Rc::new(|_, _| {})).unwrap();
        assert_eq!(
            net.listen(addr, Rc::new(|_, _| {})),
            Err(NetError::AddressInUse(addr))
        );
    }
}
