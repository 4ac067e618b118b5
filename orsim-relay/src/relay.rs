//! The relay scheduler: the component that owns the connections and
//! circuits, and moves cells between them.
//!
//! One [`Relay`] models one onion-routing node.  Its read callback
//! ingests bytes from a socket, slices them into cells, and either
//! *packages* them (prepending a fresh header, at an edge) or *relays*
//! them (looking up the circuit from the header, in the middle) onto
//! the opposite circuit queue.  Its write callback drains each
//! connection's active-circuit ring round-robin, one cell per circuit
//! per pass.  Two global token buckets gate the two directions, and
//! the circuit windows implement SENDME back-pressure end to end.

use crate::bucket::TokenBucket;
use crate::circuit::{CellDirection, CircIndex, Circuit, ConnIndex, PushOutcome};
use crate::conn::{ConnType, Connection, HopKind};
use crate::pseudo::{PseudoClientSocket, PseudoServerSocket, TimingCallback, TimingHook};
use crate::{Error, Result};

use log::{debug, trace};
use orsim_cell::{Cell, CircId, CELL_NETWORK_SIZE};
use orsim_rt::{EventId, EventLoop, SimNet, SimSocket, SocketRef, UniformStream, ValueStream};

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// How often the host tops the token buckets up.
const BUCKET_REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Virtual processing cost of reading one byte; re-reads of a busy
/// socket are delayed by this much per byte just read.
const READ_DELAY_PER_BYTE_NS: u64 = 2;

/// Delay before a read wake-up after a bucket refill.
const REFILL_WAKE_DELAY: Duration = Duration::from_nanos(10);

/// Configuration for one relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Human-readable name, used in log messages.
    name: String,
    /// The address this relay listens on and dials from.
    local_addr: Ipv4Addr,
    /// Token-bucket refill rate, in bytes per second.
    bandwidth_rate: u64,
    /// Token-bucket burst ceiling, in bytes.
    bandwidth_burst: u64,
    /// Seed for the start-up stagger stream; derived from the local
    /// address when unset.
    stagger_seed: Option<u64>,
}

impl RelayConfig {
    /// Create a configuration with default bandwidth (10 MB/s rate,
    /// 1 MB burst).
    pub fn new(name: &str, local_addr: Ipv4Addr) -> Self {
        RelayConfig {
            name: name.to_string(),
            local_addr,
            bandwidth_rate: 10_000_000,
            bandwidth_burst: 1_000_000,
            stagger_seed: None,
        }
    }

    /// Set the token-bucket rate and burst.
    pub fn bandwidth(mut self, rate: u64, burst: u64) -> Self {
        self.bandwidth_rate = rate;
        self.bandwidth_burst = burst;
        self
    }

    /// Seed the stream that staggers pseudo-client start-up.
    ///
    /// Every run with the same topology and seeds replays the same
    /// schedule.  When unset, the seed is derived from the relay's
    /// address, which keeps runs reproducible while giving each relay
    /// a distinct stagger sequence.
    pub fn stagger_seed(mut self, seed: u64) -> Self {
        self.stagger_seed = Some(seed);
        self
    }
}

/// One simulated relay.
///
/// This is a cheap handle; the state lives behind it and is shared
/// with the callbacks the relay has scheduled.
pub struct Relay {
    /// The shared relay state.
    inner: Rc<RefCell<RelayInner>>,
}

/// The state of one relay.
pub(crate) struct RelayInner {
    /// Weak handle to ourselves, captured by every scheduled callback.
    self_ref: Weak<RefCell<RelayInner>>,
    /// Handle to the event loop.
    ev: EventLoop,
    /// Handle to the transport registry.
    net: SimNet,
    /// Our name, for logging.
    name: String,
    /// Our address.
    local_addr: Ipv4Addr,
    /// Every connection, indexed by [`ConnIndex`].  Deduplicated by
    /// remote address.
    conns: Vec<Connection>,
    /// The circuit arena, indexed by [`CircIndex`].
    circuits: Vec<Circuit>,
    /// Map from circuit id to arena index.
    circ_ids: HashMap<CircId, CircIndex>,
    /// Token bucket gating reads.
    read_bucket: TokenBucket,
    /// Token bucket gating writes.
    write_bucket: TokenBucket,
    /// The pending bucket-refill event.
    refill_event: Option<EventId>,
    /// Seeded stream of pseudo-client start-up delays, in seconds.
    stagger: UniformStream,
    /// True between start() and stop().
    started: bool,
    /// True while our listener is registered.
    listening: bool,
}

impl Relay {
    /// Create a relay on the given event loop and transport registry.
    pub fn new(ev: &EventLoop, net: &SimNet, config: RelayConfig) -> Relay {
        let stagger_seed = config
            .stagger_seed
            .unwrap_or_else(|| u64::from(u32::from(config.local_addr)));
        let inner = Rc::new(RefCell::new(RelayInner {
            self_ref: Weak::new(),
            ev: ev.clone(),
            net: net.clone(),
            name: config.name,
            local_addr: config.local_addr,
            conns: Vec::new(),
            circuits: Vec::new(),
            circ_ids: HashMap::new(),
            read_bucket: TokenBucket::new(config.bandwidth_rate, config.bandwidth_burst),
            write_bucket: TokenBucket::new(config.bandwidth_rate, config.bandwidth_burst),
            refill_event: None,
            stagger: UniformStream::from_seed(0.1, 1.0, stagger_seed),
            started: false,
            listening: false,
        }));
        inner.borrow_mut().self_ref = Rc::downgrade(&inner);
        Relay { inner }
    }

    /// Return this relay's name.
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    /// Return the address this relay listens on.
    pub fn local_addr(&self) -> Ipv4Addr {
        self.inner.borrow().local_addr
    }

    /// Configure a circuit through this relay.
    ///
    /// `n_ip`/`n_kind` describe the next (outbound) side, `p_ip`/
    /// `p_kind` the previous (inbound) side.  Connections are created
    /// lazily and shared by remote address.
    pub fn add_circuit(
        &self,
        id: CircId,
        n_ip: Ipv4Addr,
        n_kind: HopKind,
        p_ip: Ipv4Addr,
        p_kind: HopKind,
    ) -> Result<()> {
        self.inner
            .borrow_mut()
            .add_circuit(id, n_ip, n_kind, p_ip, p_kind, None)
    }

    /// Configure a circuit whose previous side is a proxy edge, with
    /// the request-size and think-time streams that drive its pseudo
    /// client.
    pub fn add_circuit_with_streams(
        &self,
        id: CircId,
        n_ip: Ipv4Addr,
        n_kind: HopKind,
        p_ip: Ipv4Addr,
        p_kind: HopKind,
        rng_request: Box<dyn ValueStream>,
        rng_think: Box<dyn ValueStream>,
    ) -> Result<()> {
        self.inner.borrow_mut().add_circuit(
            id,
            n_ip,
            n_kind,
            p_ip,
            p_kind,
            Some((rng_request, rng_think)),
        )
    }

    /// Set the refill rate of both token buckets, in bytes per second.
    pub fn set_bandwidth_rate(&self, rate: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.read_bucket.set_rate(rate);
        inner.write_bucket.set_rate(rate);
    }

    /// Set the burst ceiling of both token buckets, in bytes.
    pub fn set_bandwidth_burst(&self, burst: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.read_bucket.set_burst(burst);
        inner.write_bucket.set_burst(burst);
    }

    /// Set the read bucket's balance directly.  This is the host's
    /// knob for scenario setups (e.g. starting a bucket empty).
    pub fn set_read_bucket_level(&self, level: i64) {
        self.inner.borrow_mut().read_bucket.set_level(level);
    }

    /// Set the write bucket's balance directly.
    pub fn set_write_bucket_level(&self, level: i64) {
        self.inner.borrow_mut().write_bucket.set_level(level);
    }

    /// Inject a socket for the pre-declared connection to `remote`.
    ///
    /// Test harnesses use this to stand in for a neighbor before
    /// `start()`; the relay installs its callbacks on the socket at
    /// start-up and will not dial or build a pseudo socket for a
    /// connection that already has one.
    pub fn set_conn_socket(&self, remote: Ipv4Addr, socket: SocketRef) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.conns.iter().position(|c| c.remote() == remote) {
            Some(idx) => {
                inner.conns[idx].set_socket(socket);
                Ok(())
            }
            None => Err(Error::UnknownPeer(remote)),
        }
    }

    /// Register a time-to-first-byte callback on the (proxy edge)
    /// connection to `remote`.
    pub fn set_ttfb_callback(
        &self,
        remote: Ipv4Addr,
        cb: TimingCallback,
        id: i32,
        desc: &str,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.conns.iter().position(|c| c.remote() == remote) {
            Some(idx) => {
                inner.conns[idx].set_ttfb_hook(TimingHook {
                    cb,
                    id,
                    desc: desc.to_string(),
                });
                Ok(())
            }
            None => Err(Error::UnknownPeer(remote)),
        }
    }

    /// Register a time-to-last-byte callback on the (proxy edge)
    /// connection to `remote`.
    pub fn set_ttlb_callback(
        &self,
        remote: Ipv4Addr,
        cb: TimingCallback,
        id: i32,
        desc: &str,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.conns.iter().position(|c| c.remote() == remote) {
            Some(idx) => {
                inner.conns[idx].set_ttlb_hook(TimingHook {
                    cb,
                    id,
                    desc: desc.to_string(),
                });
                Ok(())
            }
            None => Err(Error::UnknownPeer(remote)),
        }
    }

    /// Start the relay: listen, dial neighbors, build edge sockets,
    /// and begin refilling the buckets.
    pub fn start(&self) -> Result<()> {
        self.inner.borrow_mut().start()
    }

    /// Stop the relay: cancel timers, drain queues, close sockets.
    /// Safe to call more than once.
    pub fn stop(&self) {
        self.inner.borrow_mut().stop();
    }

    /// Run `f` against the circuit with the given id, if it exists.
    pub fn with_circuit<T>(&self, id: CircId, f: impl FnOnce(&Circuit) -> T) -> Option<T> {
        let inner = self.inner.borrow();
        inner
            .circ_ids
            .get(&id)
            .map(|idx| f(&inner.circuits[*idx]))
    }

    /// Run `f` against the connection to `remote`, if it exists.
    pub fn with_connection<T>(
        &self,
        remote: Ipv4Addr,
        f: impl FnOnce(&Connection) -> T,
    ) -> Option<T> {
        let inner = self.inner.borrow();
        inner
            .conns
            .iter()
            .find(|c| c.remote() == remote)
            .map(f)
    }

    /// Return the remote address of every connection, in creation
    /// order.
    pub fn connection_addrs(&self) -> Vec<Ipv4Addr> {
        self.inner.borrow().conns.iter().map(|c| c.remote()).collect()
    }

    /// Pop one cell from the given circuit and hand it straight to the
    /// outgoing socket, bypassing the staging buffers.
    ///
    /// Returns 0 if the queue is empty, the target connection is
    /// blocked, or its socket cannot accept a whole cell.
    pub fn send_cell(&self, id: CircId, direction: CellDirection) -> usize {
        let mut inner = self.inner.borrow_mut();
        let idx = match inner.circ_ids.get(&id) {
            Some(idx) => *idx,
            None => return 0,
        };
        inner.circuit_send_cell(idx, direction)
    }
}

impl RelayInner {
    /// Find or create the connection to `ip`.
    fn add_connection(&mut self, ip: Ipv4Addr, conn_type: ConnType) -> ConnIndex {
        if let Some(idx) = self.conns.iter().position(|c| c.remote() == ip) {
            return idx;
        }
        let idx = self.conns.len();
        self.conns.push(Connection::new(
            idx,
            self.self_ref.clone(),
            self.ev.clone(),
            ip,
            conn_type,
        ));
        idx
    }

    /// Insert `circ` into `conn`'s active-circuit ring.
    fn add_active_circuit(&mut self, conn: ConnIndex, circ: CircIndex) {
        match self.conns[conn].active_circuits() {
            None => {
                self.conns[conn].set_active_circuits(Some(circ));
                self.circuits[circ].set_next_circ_on(conn, Some(circ));
            }
            Some(head) => {
                let successor = self.circuits[head]
                    .next_circ_on(conn)
                    .expect("active-circuit ring is broken");
                self.circuits[circ].set_next_circ_on(conn, Some(successor));
                self.circuits[head].set_next_circ_on(conn, Some(circ));
            }
        }
    }

    /// Implementation of both `add_circuit` variants.
    fn add_circuit(
        &mut self,
        id: CircId,
        n_ip: Ipv4Addr,
        n_kind: HopKind,
        p_ip: Ipv4Addr,
        p_kind: HopKind,
        streams: Option<(Box<dyn ValueStream>, Box<dyn ValueStream>)>,
    ) -> Result<()> {
        if self.circ_ids.contains_key(&id) {
            return Err(Error::DuplicateCircuit(id));
        }

        let p_conn = self.add_connection(p_ip, p_kind.conn_type());
        let n_conn = self.add_connection(n_ip, n_kind.conn_type());
        if let Some((request, think)) = streams {
            self.conns[p_conn].set_streams(request, think);
        }

        let circ = Circuit::new(
            id,
            n_conn,
            self.conns[n_conn].conn_type(),
            p_conn,
            self.conns[p_conn].conn_type(),
        );
        let idx = self.circuits.len();
        self.circuits.push(circ);

        self.add_active_circuit(p_conn, idx);
        self.add_active_circuit(n_conn, idx);
        self.circ_ids.insert(id, idx);
        debug!("{}: added circuit {} ({} <-> {})", self.name, id, p_ip, n_ip);
        Ok(())
    }

    /// Start the relay.
    fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        // Listen for inbound connections from our neighbors.
        let app = self.self_ref.clone();
        self.net.listen(
            self.local_addr,
            Rc::new(move |sock, from| dispatch_accept(&app, sock, from)),
        )?;
        self.listening = true;

        self.schedule_refill();

        for i in 0..self.conns.len() {
            if self.conns[i].socket().is_some() {
                // A socket was injected; just hook it up.
                self.install_callbacks(i);
                continue;
            }
            match self.conns[i].conn_type() {
                ConnType::Or => {
                    // Exactly one socket per pair: the side with the
                    // smaller address dials, the other accepts.
                    if self.local_addr < self.conns[i].remote() {
                        let sock = self.net.connect(self.local_addr, self.conns[i].remote());
                        self.install_socket(i, sock);
                    }
                }
                ConnType::Edge => {
                    if self.conns[i].remote().is_loopback() {
                        self.build_edge_socket(i)?;
                    }
                }
            }
        }

        debug!("{}: started, ip={}", self.name, self.local_addr);
        Ok(())
    }

    /// Build the pseudo socket for the edge connection `i`.
    fn build_edge_socket(&mut self, i: ConnIndex) -> Result<()> {
        let head = self.conns[i]
            .active_circuits()
            .ok_or(Error::Internal("edge connection with no circuit"))?;
        if self.circuits[head].direction_of(i) == CellDirection::Outbound {
            // Exit-to-server edge.
            let sock = PseudoServerSocket::new();
            self.install_socket(i, sock);
        } else {
            // Proxy-to-client edge.
            let streams = self.conns[i].take_streams();
            let sock = match streams {
                Some((request, think)) => PseudoClientSocket::new(&self.ev, request, think),
                None => {
                    return Err(Error::Internal(
                        "proxy edge connection has no request/think streams",
                    ))
                }
            };
            let (ttfb, ttlb) = self.conns[i].take_timing_hooks();
            {
                let mut client = sock.borrow_mut();
                if let Some(hook) = ttfb {
                    client.set_ttfb_hook(hook);
                }
                if let Some(hook) = ttlb {
                    client.set_ttlb_hook(hook);
                }
            }
            self.install_socket(i, sock);
            // Stagger client start-up so flows don't move in lockstep.
            let delay = self.stagger.next_value();
            self.conns[i].schedule_read(Duration::from_secs_f64(delay));
        }
        Ok(())
    }

    /// Give connection `i` this socket, and hook its readiness
    /// callbacks up to our read/write paths.
    fn install_socket(&mut self, i: ConnIndex, sock: SocketRef) {
        self.conns[i].set_socket(sock);
        self.install_callbacks(i);
    }

    /// Install read/write dispatch callbacks on connection `i`'s
    /// socket.
    fn install_callbacks(&mut self, i: ConnIndex) {
        let sock = match self.conns[i].socket() {
            Some(s) => s,
            None => return,
        };
        let mut sock = sock.borrow_mut();
        let app = self.self_ref.clone();
        sock.set_on_readable(Rc::new(move || dispatch_read(&app, i)));
        let app = self.self_ref.clone();
        sock.set_on_sent(Rc::new(move || dispatch_write(&app, i)));
    }

    /// Stop the relay.  Idempotent.
    fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        if self.listening {
            self.net.unlisten(self.local_addr);
            self.listening = false;
        }
        if let Some(id) = self.refill_event.take() {
            self.ev.cancel(id);
        }
        for conn in &mut self.conns {
            conn.shutdown();
        }
        for circ in &mut self.circuits {
            circ.clear_queues();
        }
        debug!("{}: stopped", self.name);
    }

    /// Accept an inbound connection: bind the socket to the
    /// pre-declared connection for this peer.
    fn handle_accept(&mut self, sock: SocketRef, from: Ipv4Addr) -> Result<()> {
        let idx = self
            .conns
            .iter()
            .position(|c| c.remote() == from && c.socket().is_none())
            .ok_or(Error::UnknownPeer(from))?;
        debug!("{}: accepted connection from {}", self.name, from);
        self.install_socket(idx, sock);
        Ok(())
    }

    /// The read path: ingest bytes from connection `i` and package or
    /// relay the resulting cells.
    fn conn_read_callback(&mut self, i: ConnIndex) -> Result<()> {
        if self.conns[i].is_blocked() {
            trace!("{}: reading blocked on {}", self.name, self.conns[i].remote());
            return Ok(());
        }
        let socket = match self.conns[i].socket() {
            Some(s) => s,
            None => return Ok(()),
        };
        let edge = self.conns[i].conn_type().is_edge();
        let base = self.conns[i].cell_base();

        let mut max_read = round_robin(base, self.read_bucket.level());
        max_read = std::cmp::min(max_read, socket.borrow().rx_available());
        if max_read == 0 {
            return Ok(());
        }

        if edge {
            // An edge connection serves exactly one circuit; never
            // ingest beyond its package window.  Carried-over bytes
            // already count against the budget, since a flushed short
            // tail becomes a packaged cell of its own.
            let head = self.conns[i]
                .active_circuits()
                .ok_or(Error::Internal("edge connection with no circuit"))?;
            let window = std::cmp::max(self.circuits[head].package_window(), 0) as usize;
            let budget = (window * base).saturating_sub(self.conns[i].inbuf_len());
            max_read = std::cmp::min(max_read, budget);
            if max_read == 0 {
                return Ok(());
            }
        }

        let (cells, read_bytes) = self.conns[i].read(max_read);
        trace!(
            "{}: read {} bytes ({} cells) from {}",
            self.name,
            read_bytes,
            cells.len(),
            self.conns[i].remote()
        );

        for cell in cells {
            if edge {
                self.package_relay_cell(i, &cell)?;
            } else {
                self.receive_relay_cell(i, cell)?;
            }
        }

        if read_bytes > 0 {
            self.read_bucket.decrement(read_bytes as u64);
            if socket.borrow().rx_available() > 0 {
                // Charge some virtual processing time before reading more.
                let delay = Duration::from_nanos(READ_DELAY_PER_BYTE_NS * read_bytes as u64);
                self.conns[i].schedule_read(delay);
            }
        }
        Ok(())
    }

    /// Package a bare payload read from edge connection `i` into a
    /// fresh RELAY_DATA cell and queue it away from the edge.
    fn package_relay_cell(&mut self, i: ConnIndex, payload: &Cell) -> Result<()> {
        let circ = self.conns[i]
            .active_circuits()
            .ok_or(Error::Internal("edge connection with no circuit"))?;
        let cell = Cell::package(self.circuits[circ].id(), payload.as_bytes())?;
        let direction = self.circuits[circ].opposite_direction_of(i);
        self.append_cell(circ, cell, direction)
    }

    /// Relay a framed cell received on connection `i` onto the
    /// opposite side of its circuit, unchanged.
    fn receive_relay_cell(&mut self, i: ConnIndex, cell: Cell) -> Result<()> {
        let id = cell.header()?.circ_id();
        let circ = *self.circ_ids.get(&id).ok_or(Error::UnknownCircuit(id))?;
        let direction = self.circuits[circ].opposite_direction_of(i);
        self.append_cell(circ, cell, direction)
    }

    /// Add `cell` to the queue of `circ` in `direction`, apply the
    /// flow-control consequences, and schedule a write on the target
    /// connection.
    fn append_cell(&mut self, circ: CircIndex, cell: Cell, direction: CellDirection) -> Result<()> {
        let target = self.circuits[circ].conn(direction);
        match self.circuits[circ].push_cell(cell, direction)? {
            PushOutcome::Queued { block_input } => {
                if block_input {
                    let opposite = self.circuits[circ].conn(direction.opposite());
                    debug!(
                        "[Circuit {}] package window empty; blocking reads from {}",
                        self.circuits[circ].id(),
                        self.conns[opposite].remote()
                    );
                    self.conns[opposite].set_blocked(true);
                }
            }
            PushOutcome::SendmeConsumed => {
                if self.conns[target].is_blocked() {
                    self.conns[target].set_blocked(false);
                    self.conns[target].schedule_read(Duration::from_secs(0));
                }
            }
        }
        self.conns[target].schedule_write(Duration::from_secs(0));
        Ok(())
    }

    /// The write path: fill a byte budget from connection `i`'s
    /// active-circuit ring and send it.
    fn conn_write_callback(&mut self, i: ConnIndex) -> Result<()> {
        let socket = match self.conns[i].socket() {
            Some(s) => s,
            None => return Ok(()),
        };
        let base = self.conns[i].cell_base();
        let newtx = socket.borrow().tx_available();

        let mut max_write = round_robin(base, self.write_bucket.level());
        max_write = std::cmp::min(max_write, newtx);
        if max_write == 0 {
            return Ok(());
        }

        let written = self.conn_write(i, max_write)?;
        trace!(
            "{}: wrote {} bytes to {}",
            self.name,
            written,
            self.conns[i].remote()
        );

        if written > 0 {
            self.write_bucket.decrement(written as u64);
            // There may be more cells queued; try flushing again.
            self.conns[i].schedule_write(Duration::from_secs(0));
        }
        Ok(())
    }

    /// Stage up to `max_write` bytes from connection `i`'s ring
    /// (one cell per circuit per pass) and transmit them.
    fn conn_write(&mut self, i: ConnIndex, max_write: usize) -> Result<usize> {
        let mut staged = self.conns[i].take_outbuf();

        if let Some(start) = self.conns[i].active_circuits() {
            let mut flushed_some = false;
            while staged.len() < max_write {
                let circ = self.conns[i]
                    .active_circuits()
                    .ok_or(Error::Internal("active-circuit ring emptied mid-pass"))?;
                let direction = self.circuits[circ].direction_of(i);
                let outcome = self.circuits[circ].pop_cell(direction);
                if let Some(cell) = outcome.cell {
                    staged.extend_from_slice(cell.as_bytes());
                    flushed_some = true;
                }
                if outcome.wake_opposite {
                    let opposite = self.circuits[circ].conn(direction.opposite());
                    self.conns[opposite].schedule_write(Duration::from_secs(0));
                }

                let next = self.circuits[circ]
                    .next_circ_on(i)
                    .ok_or(Error::Internal("active-circuit ring is broken"))?;
                self.conns[i].set_active_circuits(Some(next));

                if self.conns[i].active_circuits() == Some(start) {
                    if !flushed_some {
                        break;
                    }
                    flushed_some = false;
                }
            }
        }

        Ok(self.conns[i].transmit(staged, max_write))
    }

    /// Pop one cell from `circ` in `direction` and hand it straight to
    /// the socket.
    fn circuit_send_cell(&mut self, circ: CircIndex, direction: CellDirection) -> usize {
        if self.circuits[circ].queue_len(direction) == 0 {
            return 0;
        }
        let target = self.circuits[circ].conn(direction);
        let socket = match self.conns[target].socket() {
            Some(s) => s,
            None => return 0,
        };
        if self.conns[target].is_blocked()
            || socket.borrow().tx_available() < CELL_NETWORK_SIZE
        {
            return 0;
        }
        let outcome = self.circuits[circ].pop_cell(direction);
        if outcome.wake_opposite {
            let opposite = self.circuits[circ].conn(direction.opposite());
            self.conns[opposite].schedule_write(Duration::from_secs(0));
        }
        match outcome.cell {
            Some(cell) => socket.borrow_mut().send(cell.as_bytes()),
            None => 0,
        }
    }

    /// Arm the next bucket-refill event.
    fn schedule_refill(&mut self) {
        let app = self.self_ref.clone();
        self.refill_event = Some(
            self.ev
                .schedule_in(BUCKET_REFILL_INTERVAL, move || dispatch_refill(&app)),
        );
    }

    /// Top both buckets up, wake connections on the empty-to-nonempty
    /// transitions, and re-arm the refill timer.
    fn refill_tick(&mut self) {
        let prev_read = self.read_bucket.refill(BUCKET_REFILL_INTERVAL);
        if prev_read <= 0 && self.read_bucket.level() > 0 {
            debug!(
                "{}: read bucket was {}, now {}; waking readers",
                self.name,
                prev_read,
                self.read_bucket.level()
            );
            for i in 0..self.conns.len() {
                self.conns[i].schedule_read(REFILL_WAKE_DELAY);
            }
        }

        let prev_write = self.write_bucket.refill(BUCKET_REFILL_INTERVAL);
        if prev_write <= 0 && self.write_bucket.level() > 0 {
            debug!(
                "{}: write bucket was {}, now {}; waking writers",
                self.name,
                prev_write,
                self.write_bucket.level()
            );
            for i in 0..self.conns.len() {
                self.conns[i].schedule_write(Duration::from_secs(0));
            }
        }

        self.schedule_refill();
    }
}

/// Decide how many bytes of `bucket` one transaction may spend.
///
/// One eighth of the bucket, rounded down to a whole number of cells,
/// clamped into [4 cells, 32 cells] and then to the bucket itself.
/// The clamp order matters: the low clamp may raise the value above a
/// nearly-empty bucket, and the final clamp restores the invariant.
/// Yes, this is how Tor allocates its buckets; no kidding.
fn round_robin(base: usize, bucket: i64) -> usize {
    let num_bytes_high = 32 * base as i64;
    let num_bytes_low = 4 * base as i64;
    let mut at_most = bucket / 8;
    at_most -= at_most % base as i64;

    if at_most > num_bytes_high {
        at_most = num_bytes_high;
    } else if at_most < num_bytes_low {
        at_most = num_bytes_low;
    }

    if at_most > bucket {
        at_most = bucket;
    }

    if at_most < 0 {
        return 0;
    }
    at_most as usize
}

/// Run a fallible piece of relay work from event context, treating an
/// error as the fatal invariant violation it is.
fn dispatch(
    app: &Weak<RefCell<RelayInner>>,
    what: &str,
    f: impl FnOnce(&mut RelayInner) -> Result<()>,
) {
    if let Some(rc) = app.upgrade() {
        let result = {
            let mut inner = rc.borrow_mut();
            if !inner.started {
                return;
            }
            f(&mut inner)
        };
        if let Err(e) = result {
            panic!("fatal error in {}: {}", what, e);
        }
    }
}

/// Entry point for read events and socket-readable callbacks.
pub(crate) fn dispatch_read(app: &Weak<RefCell<RelayInner>>, conn: ConnIndex) {
    dispatch(app, "connection read", |inner| inner.conn_read_callback(conn));
}

/// Entry point for write events and data-sent callbacks.
pub(crate) fn dispatch_write(app: &Weak<RefCell<RelayInner>>, conn: ConnIndex) {
    dispatch(app, "connection write", |inner| {
        inner.conn_write_callback(conn)
    });
}

/// Entry point for inbound connections.
fn dispatch_accept(app: &Weak<RefCell<RelayInner>>, sock: SocketRef, from: Ipv4Addr) {
    dispatch(app, "accept", |inner| inner.handle_accept(sock, from));
}

/// Entry point for the bucket-refill timer.
fn dispatch_refill(app: &Weak<RefCell<RelayInner>>) {
    dispatch(app, "bucket refill", |inner| {
        inner.refill_tick();
        Ok(())
    });
}
