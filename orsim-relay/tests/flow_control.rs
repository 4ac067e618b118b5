//! Flow-control tests: SENDME round trips and window stalls across a
//! two-relay chain (pseudo client -> proxy -> exit -> pseudo server).

use orsim_relay::{CellDirection, HopKind, Relay, RelayConfig};
use orsim_rt::{ConstantStream, EventLoop, PipeSocket, SimNet};
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

/// Build a proxy relay (pseudo client edge, request of `request_bytes`
/// bytes) and an exit relay (pseudo server edge), sharing circuit 1
/// over one relay link.
fn two_relay_chain(ev: &EventLoop, net: &SimNet, request_bytes: f64) -> (Relay, Relay) {
    let proxy = Relay::new(
        ev,
        net,
        RelayConfig::new("proxy", ip(10, 0, 0, 1)).bandwidth(1 << 30, 1 << 30),
    );
    proxy
        .add_circuit_with_streams(
            1.into(),
            ip(10, 0, 0, 2),
            HopKind::RelayEdge,
            ip(127, 0, 0, 1),
            HopKind::ProxyEdge,
            Box::new(ConstantStream::new(request_bytes)),
            Box::new(ConstantStream::new(3_600.0)),
        )
        .unwrap();

    let exit = Relay::new(
        ev,
        net,
        RelayConfig::new("exit", ip(10, 0, 0, 2)).bandwidth(1 << 30, 1 << 30),
    );
    exit.add_circuit(
        1.into(),
        ip(127, 0, 0, 1),
        HopKind::ServerEdge,
        ip(10, 0, 0, 1),
        HopKind::RelayEdge,
    )
    .unwrap();

    (proxy, exit)
}

#[test]
fn sendme_round_trip() {
    let ev = EventLoop::new();
    let net = SimNet::new(&ev, Duration::from_millis(1));
    // 100 kB = 201 cells; the deliver window crosses its threshold
    // after cells 100 and 200.
    let (proxy, exit) = two_relay_chain(&ev, &net, 100_000.0);

    let ttfb: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
    let ttlb: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
    let ttfb2 = Rc::clone(&ttfb);
    let ttlb2 = Rc::clone(&ttlb);
    proxy
        .set_ttfb_callback(
            ip(127, 0, 0, 1),
            Rc::new(move |_id, t, _desc| ttfb2.borrow_mut().push(t)),
            1,
            "client 1",
        )
        .unwrap();
    proxy
        .set_ttlb_callback(
            ip(127, 0, 0, 1),
            Rc::new(move |_id, t, _desc| ttlb2.borrow_mut().push(t)),
            1,
            "client 1",
        )
        .unwrap();

    proxy.start().unwrap();
    exit.start().unwrap();
    ev.run_until(Duration::from_secs(30));

    // Exactly two SENDMEs were emitted by the exit and consumed by the
    // proxy: both windows end at 1000 - 201 + 200.
    assert_eq!(
        proxy
            .with_circuit(1.into(), |c| c.package_window())
            .unwrap(),
        999
    );
    assert_eq!(
        exit.with_circuit(1.into(), |c| c.deliver_window()).unwrap(),
        999
    );

    // Every cell of the request reached the server edge.
    let delivered = exit
        .with_circuit(1.into(), |c| c.stats_bytes_written(CellDirection::Outbound))
        .unwrap();
    assert_eq!(delivered, 201 * 498);

    // One request: one first byte, one last byte, in order.
    assert_eq!(ttfb.borrow().len(), 1);
    assert_eq!(ttlb.borrow().len(), 1);
    assert!(ttfb.borrow()[0] > 0.0);
    assert!(ttlb.borrow()[0] >= ttfb.borrow()[0]);

    proxy.stop();
    exit.stop();
}

#[test]
fn window_stall_blocks_reading_and_sendme_release_resumes() {
    let ev = EventLoop::new();
    let net = SimNet::new(&ev, Duration::from_millis(1));
    // 600 kB = 1205 cells, more than a window-ful.
    let (proxy, exit) = two_relay_chain(&ev, &net, 600_000.0);

    // Replace the relay link with a pipe whose proxy-side transmit
    // buffer is held at zero.
    let (near, far) = PipeSocket::pair(&ev, Duration::from_millis(1));
    near.borrow_mut().set_tx_capacity(0);
    proxy
        .set_conn_socket(ip(10, 0, 0, 2), near.clone())
        .unwrap();
    exit.set_conn_socket(ip(10, 0, 0, 1), far).unwrap();

    proxy.start().unwrap();
    exit.start().unwrap();

    // Phase 1: the link is stalled.  The proxy packages exactly one
    // window-ful, then blocks its edge.
    ev.run_until(Duration::from_secs(5));
    assert_eq!(
        proxy
            .with_circuit(1.into(), |c| c.package_window())
            .unwrap(),
        0
    );
    assert!(proxy
        .with_connection(ip(127, 0, 0, 1), |c| c.is_blocked())
        .unwrap());
    assert_eq!(
        proxy
            .with_circuit(1.into(), |c| c.queue_len(CellDirection::Outbound))
            .unwrap(),
        1000
    );
    assert_eq!(
        exit.with_circuit(1.into(), |c| c.stats_bytes_read(CellDirection::Outbound))
            .unwrap(),
        0
    );

    // Phase 2: release the link.  Cells drain, SENDMEs come back
    // every 100 delivered cells, reading resumes, and the whole
    // request gets through.
    near.borrow_mut().set_tx_capacity(1 << 20);
    ev.run_until(Duration::from_secs(40));

    // 1205 cells crossed; 12 SENDMEs (one per 100 deliveries).
    assert_eq!(
        proxy
            .with_circuit(1.into(), |c| c.package_window())
            .unwrap(),
        1000 - 1205 + 1200
    );
    assert_eq!(
        exit.with_circuit(1.into(), |c| c.deliver_window()).unwrap(),
        1000 - 1205 + 1200
    );
    assert!(!proxy
        .with_connection(ip(127, 0, 0, 1), |c| c.is_blocked())
        .unwrap());
    assert_eq!(
        proxy
            .with_circuit(1.into(), |c| c.queue_len(CellDirection::Outbound))
            .unwrap(),
        0
    );
    assert_eq!(
        exit.with_circuit(1.into(), |c| c.stats_bytes_written(CellDirection::Outbound))
            .unwrap(),
        1205 * 498
    );

    proxy.stop();
    exit.stop();
}
