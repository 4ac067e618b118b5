//! Circuits: the per-flow state multiplexed over connections.
//!
//! A circuit pins together two connections on this relay (its
//! *previous* and *next* sides) and carries one FIFO cell queue per
//! direction, the two flow-control windows, and the intrusive links
//! that make it a member of each connection's active-circuit ring.
//!
//! Circuits live in an arena owned by the relay; all cross-references
//! (to connections and to ring successors) are indices into the
//! relay's tables, so there are no reference cycles to break at
//! shutdown.

use crate::conn::ConnType;
use crate::sendme::{Window, CIRCWINDOW_INCREMENT, CIRCWINDOW_START};
use crate::Result;
use log::{debug, trace};
use orsim_cell::{Cell, CircId, CELL_PAYLOAD_SIZE};
use std::collections::VecDeque;

/// Index of a connection in the relay's connection table.
pub(crate) type ConnIndex = usize;

/// Index of a circuit in the relay's circuit arena.
pub(crate) type CircIndex = usize;

/// The direction a cell travels on a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CellDirection {
    /// Toward the circuit's next connection.
    Outbound,
    /// Toward the circuit's previous connection.
    Inbound,
}

impl CellDirection {
    /// Return the other direction.
    pub fn opposite(self) -> CellDirection {
        match self {
            CellDirection::Outbound => CellDirection::Inbound,
            CellDirection::Inbound => CellDirection::Outbound,
        }
    }
}

/// What the relay must do after pushing a cell onto a circuit queue.
#[derive(Debug)]
pub(crate) enum PushOutcome {
    /// The cell was queued toward its direction.
    Queued {
        /// True if the package window just ran out: the opposite
        /// (edge) connection must stop reading.
        block_input: bool,
    },
    /// The cell was a SENDME bound for our edge; it was consumed and
    /// the package window replenished.  Reading on the (target) edge
    /// connection may resume.
    SendmeConsumed,
}

/// What the relay must do after popping a cell from a circuit queue.
#[derive(Debug)]
pub(crate) struct PopOutcome {
    /// The dequeued cell, if the queue was non-empty.
    pub(crate) cell: Option<Cell>,
    /// True if this pop generated a SENDME on the opposite direction:
    /// the opposite connection needs a write scheduled.
    pub(crate) wake_opposite: bool,
}

/// Per-direction statistics counters.
#[derive(Debug, Clone, Copy, Default)]
struct DirStats {
    /// Payload bytes pushed onto this direction's queue.
    bytes_read: u32,
    /// Payload bytes popped off this direction's queue.
    bytes_written: u32,
}

/// A circuit, as stored in the relay's arena.
pub struct Circuit {
    /// This circuit's process-unique id.
    id: CircId,
    /// Index of the next (outbound-side) connection.
    n_conn: ConnIndex,
    /// Index of the previous (inbound-side) connection.
    p_conn: ConnIndex,
    /// Type of the next connection.
    n_kind: ConnType,
    /// Type of the previous connection.
    p_kind: ConnType,
    /// Cells waiting to be written toward the next connection.
    n_queue: VecDeque<Cell>,
    /// Cells waiting to be written toward the previous connection.
    p_queue: VecDeque<Cell>,
    /// How many data cells we may still package (read from our edge)
    /// before we must see a SENDME.
    package_window: Window,
    /// How many data cells we may still deliver (write to our edge)
    /// before we owe the upstream packager a SENDME.
    deliver_window: Window,
    /// Successor in the ring of circuits active on `n_conn`.
    next_on_n: Option<CircIndex>,
    /// Successor in the ring of circuits active on `p_conn`.
    next_on_p: Option<CircIndex>,
    /// Statistics for the outbound direction.
    stats_n: DirStats,
    /// Statistics for the inbound direction.
    stats_p: DirStats,
}

impl Circuit {
    /// Construct a new circuit between the given connections.
    pub(crate) fn new(
        id: CircId,
        n_conn: ConnIndex,
        n_kind: ConnType,
        p_conn: ConnIndex,
        p_kind: ConnType,
    ) -> Self {
        Circuit {
            id,
            n_conn,
            p_conn,
            n_kind,
            p_kind,
            n_queue: VecDeque::new(),
            p_queue: VecDeque::new(),
            package_window: Window::new(),
            deliver_window: Window::new(),
            next_on_n: None,
            next_on_p: None,
            stats_n: DirStats::default(),
            stats_p: DirStats::default(),
        }
    }

    /// Return this circuit's id.
    pub fn id(&self) -> CircId {
        self.id
    }

    /// Return the current package window.
    pub fn package_window(&self) -> i32 {
        self.package_window.get()
    }

    /// Return the current deliver window.
    pub fn deliver_window(&self) -> i32 {
        self.deliver_window.get()
    }

    /// Return the number of cells queued toward `direction`.
    pub fn queue_len(&self, direction: CellDirection) -> usize {
        self.queue(direction).len()
    }

    /// Return the payload bytes pushed toward `direction` so far.
    pub fn stats_bytes_read(&self, direction: CellDirection) -> u32 {
        self.stats(direction).bytes_read
    }

    /// Return the payload bytes popped toward `direction` so far.
    pub fn stats_bytes_written(&self, direction: CellDirection) -> u32 {
        self.stats(direction).bytes_written
    }

    /// Zero all statistics counters.
    pub fn reset_stats(&mut self) {
        self.stats_n = DirStats::default();
        self.stats_p = DirStats::default();
    }

    /// Return the connection that cells moving in `direction` are
    /// written to.
    pub(crate) fn conn(&self, direction: CellDirection) -> ConnIndex {
        match direction {
            CellDirection::Outbound => self.n_conn,
            CellDirection::Inbound => self.p_conn,
        }
    }

    /// Return the type of the connection in `direction`.
    pub(crate) fn kind(&self, direction: CellDirection) -> ConnType {
        match direction {
            CellDirection::Outbound => self.n_kind,
            CellDirection::Inbound => self.p_kind,
        }
    }

    /// Return the direction that leads *into* `conn`: outbound if
    /// `conn` is our next connection, inbound otherwise.
    pub(crate) fn direction_of(&self, conn: ConnIndex) -> CellDirection {
        if self.n_conn == conn {
            CellDirection::Outbound
        } else {
            CellDirection::Inbound
        }
    }

    /// Return the direction that leads *away* from `conn`.
    pub(crate) fn opposite_direction_of(&self, conn: ConnIndex) -> CellDirection {
        self.direction_of(conn).opposite()
    }

    /// Return our successor in `conn`'s active-circuit ring.
    pub(crate) fn next_circ_on(&self, conn: ConnIndex) -> Option<CircIndex> {
        if self.n_conn == conn {
            self.next_on_n
        } else {
            self.next_on_p
        }
    }

    /// Set our successor in `conn`'s active-circuit ring.
    pub(crate) fn set_next_circ_on(&mut self, conn: ConnIndex, circ: Option<CircIndex>) {
        if self.n_conn == conn {
            self.next_on_n = circ;
        } else {
            self.next_on_p = circ;
        }
    }

    /// Enqueue `cell` toward `direction`.
    ///
    /// If the opposite connection is an edge, this cell was freshly
    /// packaged: spend package-window credit, and report whether the
    /// window just ran out.  If the target connection is an edge, the
    /// cell is about to be delivered: SENDMEs are consumed here (they
    /// replenish the package window and never reach a queue), and
    /// anything else has its header stripped first.
    pub(crate) fn push_cell(&mut self, cell: Cell, direction: CellDirection) -> Result<PushOutcome> {
        let mut block_input = false;
        if self.kind(direction.opposite()) == ConnType::Edge {
            // Freshly packaged cell.
            if self.package_window.dec() <= 0 {
                block_input = true;
            }
        }

        let mut cell = cell;
        if self.kind(direction) == ConnType::Edge {
            // Delivery.
            if cell.is_sendme() {
                self.package_window.inc();
                debug!(
                    "[Circuit {}] received SENDME cell; package window now {}",
                    self.id,
                    self.package_window.get()
                );
                // No stats and no queueing for SENDME cells.
                return Ok(PushOutcome::SendmeConsumed);
            }
            cell.strip_header()?;
        }

        self.stats_mut(direction).bytes_read += CELL_PAYLOAD_SIZE as u32;
        self.queue_mut(direction).push_back(cell);
        trace!(
            "[Circuit {}] queued cell; queue holds {} cells",
            self.id,
            self.queue(direction).len()
        );
        Ok(PushOutcome::Queued { block_input })
    }

    /// Dequeue the next cell headed in `direction`, updating stats and
    /// the deliver window.
    ///
    /// SENDME generation happens here rather than at push time so that
    /// back-pressure follows the actual drain rate of the downstream
    /// connection: a short circuit would otherwise keep more than a
    /// window-ful of cells in flight.
    pub(crate) fn pop_cell(&mut self, direction: CellDirection) -> PopOutcome {
        let cell = self.queue_mut(direction).pop_front();
        let mut wake_opposite = false;

        if let Some(ref cell) = cell {
            let sendme = cell.is_sendme();
            if !sendme {
                self.stats_mut(direction).bytes_written += CELL_PAYLOAD_SIZE as u32;
            }

            // Window accounting counts data cells only.
            if self.kind(direction) == ConnType::Edge && !sendme {
                if self.deliver_window.dec() <= CIRCWINDOW_START - CIRCWINDOW_INCREMENT {
                    self.deliver_window.inc();
                    debug!("[Circuit {}] sending SENDME cell", self.id);
                    let sendme_cell = Cell::sendme(self.id);
                    self.queue_mut(direction.opposite()).push_back(sendme_cell);
                    wake_opposite = true;
                }
            }
        }

        PopOutcome {
            cell,
            wake_opposite,
        }
    }

    /// Drop every queued cell.  Used at shutdown.
    pub(crate) fn clear_queues(&mut self) {
        self.n_queue.clear();
        self.p_queue.clear();
    }

    /// Return the queue for `direction`.
    fn queue(&self, direction: CellDirection) -> &VecDeque<Cell> {
        match direction {
            CellDirection::Outbound => &self.n_queue,
            CellDirection::Inbound => &self.p_queue,
        }
    }

    /// Return the queue for `direction`, mutably.
    fn queue_mut(&mut self, direction: CellDirection) -> &mut VecDeque<Cell> {
        match direction {
            CellDirection::Outbound => &mut self.n_queue,
            CellDirection::Inbound => &mut self.p_queue,
        }
    }

    /// Return the stats for `direction`.
    fn stats(&self, direction: CellDirection) -> &DirStats {
        match direction {
            CellDirection::Outbound => &self.stats_n,
            CellDirection::Inbound => &self.stats_p,
        }
    }

    /// Return the stats for `direction`, mutably.
    fn stats_mut(&mut self, direction: CellDirection) -> &mut DirStats {
        match direction {
            CellDirection::Outbound => &mut self.stats_n,
            CellDirection::Inbound => &mut self.stats_p,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conn::ConnType;
    use orsim_cell::CELL_NETWORK_SIZE;

    /// A proxy-style circuit: previous side is an edge, next side a
    /// relay connection.
    fn proxy_circuit() -> Circuit {
        Circuit::new(1.into(), 0, ConnType::Or, 1, ConnType::Edge)
    }

    /// An exit-style circuit: previous side is a relay connection,
    /// next side an edge.
    fn exit_circuit() -> Circuit {
        Circuit::new(2.into(), 0, ConnType::Edge, 1, ConnType::Or)
    }

    /// A middle-style circuit: both sides are relay connections.
    fn middle_circuit() -> Circuit {
        Circuit::new(3.into(), 0, ConnType::Or, 1, ConnType::Or)
    }

    fn data_cell(id: u16, payload: &[u8]) -> Cell {
        Cell::package(id.into(), payload).unwrap()
    }

    #[test]
    fn fifo_order_preserved() {
        let mut circ = middle_circuit();
        for i in 0..50_u8 {
            let cell = data_cell(3, &[i; 10]);
            circ.push_cell(cell, CellDirection::Outbound).unwrap();
        }
        for i in 0..50_u8 {
            let out = circ.pop_cell(CellDirection::Outbound);
            let cell = out.cell.unwrap();
            assert_eq!(cell.as_bytes()[14], i);
        }
        assert!(circ.pop_cell(CellDirection::Outbound).cell.is_none());
    }

    #[test]
    fn packaging_spends_package_window() {
        let mut circ = proxy_circuit();
        // Outbound cells originate at our (previous-side) edge.
        for n in 0..999 {
            let outcome = circ
                .push_cell(data_cell(1, b"x"), CellDirection::Outbound)
                .unwrap();
            assert!(matches!(outcome, PushOutcome::Queued { block_input: false }));
            assert_eq!(circ.package_window(), 999 - n);
        }
        let outcome = circ
            .push_cell(data_cell(1, b"x"), CellDirection::Outbound)
            .unwrap();
        assert!(matches!(outcome, PushOutcome::Queued { block_input: true }));
        assert_eq!(circ.package_window(), 0);
    }

    #[test]
    fn sendme_replenishes_and_is_consumed() {
        let mut circ = proxy_circuit();
        for _ in 0..150 {
            circ.push_cell(data_cell(1, b"x"), CellDirection::Outbound)
                .unwrap();
        }
        assert_eq!(circ.package_window(), 850);

        // A SENDME delivered toward our edge is consumed, not queued.
        let outcome = circ
            .push_cell(Cell::sendme(1.into()), CellDirection::Inbound)
            .unwrap();
        assert!(matches!(outcome, PushOutcome::SendmeConsumed));
        assert_eq!(circ.package_window(), 950);
        assert_eq!(circ.queue_len(CellDirection::Inbound), 0);

        // Replenishment is capped at the window's starting value.
        circ.push_cell(Cell::sendme(1.into()), CellDirection::Inbound)
            .unwrap();
        assert_eq!(circ.package_window(), CIRCWINDOW_START);
    }

    #[test]
    fn delivery_strips_header() {
        let mut circ = exit_circuit();
        circ.push_cell(data_cell(2, b"edge payload"), CellDirection::Outbound)
            .unwrap();
        let out = circ.pop_cell(CellDirection::Outbound);
        let cell = out.cell.unwrap();
        assert!(!cell.is_framed());
        assert_eq!(cell.len(), CELL_PAYLOAD_SIZE);
        assert_eq!(&cell.as_bytes()[..12], b"edge payload");
    }

    #[test]
    fn deliver_window_hysteresis() {
        let mut circ = exit_circuit();
        // Queue and deliver 100 cells; the SENDME appears exactly at
        // the threshold crossing.
        for _ in 0..100 {
            circ.push_cell(data_cell(2, b"d"), CellDirection::Outbound)
                .unwrap();
        }
        for n in 0..99 {
            let out = circ.pop_cell(CellDirection::Outbound);
            assert!(!out.wake_opposite, "early SENDME after {} cells", n + 1);
        }
        assert_eq!(circ.deliver_window(), 901);

        let out = circ.pop_cell(CellDirection::Outbound);
        assert!(out.wake_opposite);
        // Topped back up after the SENDME.
        assert_eq!(circ.deliver_window(), CIRCWINDOW_START);
        // The SENDME waits on the opposite queue.
        assert_eq!(circ.queue_len(CellDirection::Inbound), 1);
        let sendme = circ.pop_cell(CellDirection::Inbound).cell.unwrap();
        assert!(sendme.is_sendme());
    }

    #[test]
    fn window_bounds_hold() {
        let mut circ = exit_circuit();
        for _ in 0..1000 {
            circ.push_cell(data_cell(2, b"d"), CellDirection::Outbound)
                .unwrap();
            let out = circ.pop_cell(CellDirection::Outbound);
            assert!(out.cell.is_some());
            assert!(circ.deliver_window() >= 0);
            assert!(circ.deliver_window() <= CIRCWINDOW_START);
        }
    }

    #[test]
    fn middle_relay_leaves_windows_alone() {
        let mut circ = middle_circuit();
        for _ in 0..300 {
            circ.push_cell(data_cell(3, b"fwd"), CellDirection::Inbound)
                .unwrap();
            circ.pop_cell(CellDirection::Inbound);
        }
        assert_eq!(circ.package_window(), CIRCWINDOW_START);
        assert_eq!(circ.deliver_window(), CIRCWINDOW_START);
    }

    #[test]
    fn forwarded_cells_keep_their_header() {
        let mut circ = middle_circuit();
        let cell = data_cell(3, b"relay me");
        let wire = cell.as_bytes().to_vec();
        circ.push_cell(cell, CellDirection::Outbound).unwrap();
        let out = circ.pop_cell(CellDirection::Outbound).cell.unwrap();
        assert!(out.is_framed());
        assert_eq!(out.len(), CELL_NETWORK_SIZE);
        assert_eq!(out.as_bytes(), &wire[..]);
    }

    #[test]
    fn stats_count_payload_bytes() {
        let mut circ = middle_circuit();
        for _ in 0..4 {
            circ.push_cell(data_cell(3, b"s"), CellDirection::Outbound)
                .unwrap();
        }
        assert_eq!(
            circ.stats_bytes_read(CellDirection::Outbound),
            4 * CELL_PAYLOAD_SIZE as u32
        );
        circ.pop_cell(CellDirection::Outbound);
        assert_eq!(
            circ.stats_bytes_written(CellDirection::Outbound),
            CELL_PAYLOAD_SIZE as u32
        );
        circ.reset_stats();
        assert_eq!(circ.stats_bytes_read(CellDirection::Outbound), 0);
        assert_eq!(circ.stats_bytes_written(CellDirection::Outbound), 0);
    }

    #[test]
    fn ring_links_select_the_right_slot() {
        let mut circ = Circuit::new(9.into(), 4, ConnType::Or, 7, ConnType::Or);
        circ.set_next_circ_on(4, Some(11));
        circ.set_next_circ_on(7, Some(22));
        assert_eq!(circ.next_circ_on(4), Some(11));
        assert_eq!(circ.next_circ_on(7), Some(22));
        assert_eq!(circ.direction_of(4), CellDirection::Outbound);
        assert_eq!(circ.direction_of(7), CellDirection::Inbound);
        assert_eq!(circ.opposite_direction_of(4), CellDirection::Inbound);
    }
}
