//! Token-bucket tests: starvation with an empty bucket, the refill
//! wake-up, and clean shutdown.

use orsim_cell::{Cell, CELL_PAYLOAD_SIZE};
use orsim_relay::{CellDirection, HopKind, Relay, RelayConfig};
use orsim_rt::{EventLoop, PipeSocket, SimNet, SimSocket};
use std::net::Ipv4Addr;
use std::time::Duration;

fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

/// An exit relay whose neighbor is played by the test through an
/// injected pipe.  Returns the relay and the test's end of the pipe.
fn exit_with_test_neighbor(
    ev: &EventLoop,
    net: &SimNet,
) -> (Relay, std::rc::Rc<std::cell::RefCell<PipeSocket>>) {
    let exit = Relay::new(ev, net, RelayConfig::new("exit", ip(10, 0, 0, 2)));
    exit.add_circuit(
        1.into(),
        ip(127, 0, 0, 1),
        HopKind::ServerEdge,
        ip(10, 0, 0, 1),
        HopKind::RelayEdge,
    )
    .unwrap();

    let (near, far) = PipeSocket::pair(ev, Duration::from_millis(1));
    exit.set_conn_socket(ip(10, 0, 0, 1), near).unwrap();
    (exit, far)
}

#[test]
fn empty_read_bucket_starves_until_refill() {
    let ev = EventLoop::new();
    let net = SimNet::new(&ev, Duration::from_millis(1));
    let (exit, far) = exit_with_test_neighbor(&ev, &net);

    // 5120 bytes/s refill: each 100 ms tick is worth one 512-byte cell.
    exit.set_bandwidth_rate(5120);
    exit.set_bandwidth_burst(5120);
    exit.start().unwrap();
    exit.set_read_bucket_level(0);

    // Two cells arrive from the neighbor right away.
    let cell = Cell::package(1.into(), &[0xaa; CELL_PAYLOAD_SIZE]).unwrap();
    far.borrow_mut().send(cell.as_bytes());
    far.borrow_mut().send(cell.as_bytes());

    let delivered = |exit: &Relay| {
        exit.with_circuit(1.into(), |c| c.stats_bytes_read(CellDirection::Outbound))
            .unwrap()
    };

    // Before the first refill, not a byte is read.
    ev.run_until(Duration::from_millis(99));
    assert_eq!(delivered(&exit), 0);

    // The refill at t=100ms wakes the connection; one cell's worth of
    // budget lets one cell through.
    ev.run_until(Duration::from_millis(150));
    assert_eq!(delivered(&exit), 498);

    // The next refill pays for the second cell.
    ev.run_until(Duration::from_millis(250));
    assert_eq!(delivered(&exit), 2 * 498);

    exit.stop();
}

#[test]
fn stop_leaves_no_scheduled_timers() {
    let ev = EventLoop::new();
    let net = SimNet::new(&ev, Duration::from_millis(1));
    let (exit, far) = exit_with_test_neighbor(&ev, &net);
    exit.start().unwrap();

    let cell = Cell::package(1.into(), &[0x42; CELL_PAYLOAD_SIZE]).unwrap();
    far.borrow_mut().send(cell.as_bytes());
    ev.run_until(Duration::from_millis(250));

    // The relay has forwarded the cell; only its refill timer remains.
    assert_eq!(ev.pending_events(), 1);
    exit.stop();
    assert_eq!(ev.pending_events(), 0);

    // A second stop is safe and changes nothing.
    exit.stop();
    assert_eq!(ev.pending_events(), 0);
    ev.run();
}
