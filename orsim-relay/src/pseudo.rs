//! Pseudo sockets: the traffic generators behind edge connections.
//!
//! A proxy edge talks to a [`PseudoClientSocket`], which produces
//! requests whose sizes come from an injected request stream and
//! pauses between them for an injected think time.  An exit edge talks
//! to a [`PseudoServerSocket`], which swallows and counts whatever is
//! delivered to it.  Both implement [`SimSocket`], so the scheduler
//! cannot tell them from a real transport.

use log::{debug, trace};
use orsim_rt::{EventId, EventLoop, SimSocket, SocketCallback, ValueStream};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Callback invoked for a time-to-first-byte or time-to-last-byte
/// measurement: receives the configured id, the elapsed virtual
/// seconds, and the configured description.
///
/// Timing callbacks run while the relay is mid-callback and must not
/// call back into it.
pub type TimingCallback = Rc<dyn Fn(i32, f64, &str)>;

/// A registered timing callback with its id and description.
#[derive(Clone)]
pub(crate) struct TimingHook {
    /// The callback itself.
    pub(crate) cb: TimingCallback,
    /// Caller-chosen identifier, passed through on every invocation.
    pub(crate) id: i32,
    /// Caller-chosen description, passed through on every invocation.
    pub(crate) desc: String,
}

impl TimingHook {
    /// Invoke the hook with an elapsed time.
    fn fire(&self, elapsed: Duration) {
        (self.cb)(self.id, elapsed.as_secs_f64(), &self.desc);
    }
}

/// A pseudo client: the byte source and sink behind a proxy edge.
///
/// The client arms a request immediately on creation.  Request bytes
/// become readable all at once; when the relay has consumed the last
/// of them, the client thinks for a while and then arms the next
/// request.  Bytes written toward the client are counted and
/// discarded.
pub struct PseudoClientSocket {
    /// Handle to the event loop.
    ev: EventLoop,
    /// Weak handle to ourselves, captured by think-time events.
    self_ref: Weak<RefCell<PseudoClientSocket>>,
    /// Stream of request sizes, in bytes.
    rng_request: Box<dyn ValueStream>,
    /// Stream of think times, in seconds.
    rng_think: Box<dyn ValueStream>,
    /// Bytes of the current request not yet consumed by the relay.
    remaining: usize,
    /// When the current request was armed.
    request_started: Duration,
    /// True once the relay has consumed the first byte of the current
    /// request.
    first_byte_seen: bool,
    /// Number of requests armed so far.
    requests_started: u64,
    /// Total bytes delivered to the client.
    total_received: u64,
    /// Pending think-time event, if any.
    think_event: Option<EventId>,
    /// Time-to-first-byte hook.
    ttfb: Option<TimingHook>,
    /// Time-to-last-byte hook.
    ttlb: Option<TimingHook>,
    /// Readable-callback, if installed.
    on_readable: Option<SocketCallback>,
    /// Sent-callback, if installed.
    on_sent: Option<SocketCallback>,
    /// True once the socket is closed.
    closed: bool,
}

impl PseudoClientSocket {
    /// Create a pseudo client driven by the given request and think
    /// streams, with its first request already armed.
    pub fn new(
        ev: &EventLoop,
        rng_request: Box<dyn ValueStream>,
        rng_think: Box<dyn ValueStream>,
    ) -> Rc<RefCell<Self>> {
        let sock = Rc::new(RefCell::new(PseudoClientSocket {
            ev: ev.clone(),
            self_ref: Weak::new(),
            rng_request,
            rng_think,
            remaining: 0,
            request_started: ev.now(),
            first_byte_seen: false,
            requests_started: 0,
            total_received: 0,
            think_event: None,
            ttfb: None,
            ttlb: None,
            on_readable: None,
            on_sent: None,
            closed: false,
        }));
        {
            let mut s = sock.borrow_mut();
            s.self_ref = Rc::downgrade(&sock);
            s.arm_next_request();
        }
        sock
    }

    /// Install a time-to-first-byte hook.
    pub fn set_ttfb_callback(&mut self, cb: TimingCallback, id: i32, desc: &str) {
        self.ttfb = Some(TimingHook {
            cb,
            id,
            desc: desc.to_string(),
        });
    }

    /// Install a time-to-last-byte hook.
    pub fn set_ttlb_callback(&mut self, cb: TimingCallback, id: i32, desc: &str) {
        self.ttlb = Some(TimingHook {
            cb,
            id,
            desc: desc.to_string(),
        });
    }

    /// Install a hook struct directly.
    pub(crate) fn set_ttfb_hook(&mut self, hook: TimingHook) {
        self.ttfb = Some(hook);
    }

    /// Install a hook struct directly.
    pub(crate) fn set_ttlb_hook(&mut self, hook: TimingHook) {
        self.ttlb = Some(hook);
    }

    /// Return the total bytes delivered to this client.
    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Return how many requests have been armed so far.
    pub fn requests_started(&self) -> u64 {
        self.requests_started
    }

    /// Draw the next request size and make it readable.
    fn arm_next_request(&mut self) {
        let size = self.rng_request.next_value().max(0.0).round() as usize;
        self.remaining = size;
        self.request_started = self.ev.now();
        self.first_byte_seen = false;
        self.requests_started += 1;
        debug!("pseudo client: armed request of {} bytes", size);
    }
}

impl SimSocket for PseudoClientSocket {
    fn rx_available(&self) -> usize {
        if self.closed {
            0
        } else {
            self.remaining
        }
    }

    fn tx_available(&self) -> usize {
        if self.closed {
            0
        } else {
            usize::MAX
        }
    }

    fn recv(&mut self, max: usize) -> Vec<u8> {
        let n = std::cmp::min(max, self.remaining);
        if n == 0 {
            return Vec::new();
        }
        let elapsed = self.ev.now() - self.request_started;
        if !self.first_byte_seen {
            self.first_byte_seen = true;
            if let Some(hook) = &self.ttfb {
                hook.fire(elapsed);
            }
        }
        self.remaining -= n;
        trace!("pseudo client: {} bytes consumed, {} left", n, self.remaining);
        if self.remaining == 0 {
            if let Some(hook) = &self.ttlb {
                hook.fire(elapsed);
            }
            // Think, then arm the next request.
            let think = self.rng_think.next_value().max(0.0);
            let this = self.self_ref.clone();
            self.think_event = Some(self.ev.schedule_in(
                Duration::from_secs_f64(think),
                move || {
                    if let Some(sock) = this.upgrade() {
                        let readable = {
                            let mut s = sock.borrow_mut();
                            if s.closed {
                                None
                            } else {
                                s.arm_next_request();
                                s.on_readable.clone()
                            }
                        };
                        if let Some(cb) = readable {
                            cb();
                        }
                    }
                },
            ));
        }
        vec![0_u8; n]
    }

    fn send(&mut self, data: &[u8]) -> usize {
        if self.closed {
            return 0;
        }
        self.total_received += data.len() as u64;
        data.len()
    }

    fn close(&mut self) {
        self.closed = true;
        self.remaining = 0;
        if let Some(id) = self.think_event.take() {
            self.ev.cancel(id);
        }
        self.on_readable = None;
        self.on_sent = None;
    }

    fn set_on_readable(&mut self, cb: SocketCallback) {
        // No readiness poke here: request bytes are available from the
        // moment a request is armed, and the relay schedules its first
        // read explicitly (with a start-up stagger).  Re-arms after a
        // think pause invoke the callback themselves.
        self.on_readable = Some(cb);
    }

    fn set_on_sent(&mut self, cb: SocketCallback) {
        self.on_sent = Some(cb);
    }
}

/// A pseudo server: the byte sink behind an exit edge.
pub struct PseudoServerSocket {
    /// Total bytes delivered to this server.
    total_delivered: u64,
    /// True once the socket is closed.
    closed: bool,
}

impl PseudoServerSocket {
    /// Create a pseudo server.
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(PseudoServerSocket {
            total_delivered: 0,
            closed: false,
        }))
    }

    /// Return the total bytes delivered to this server.
    pub fn total_delivered(&self) -> u64 {
        self.total_delivered
    }
}

impl SimSocket for PseudoServerSocket {
    fn rx_available(&self) -> usize {
        0
    }

    fn tx_available(&self) -> usize {
        if self.closed {
            0
        } else {
            usize::MAX
        }
    }

    fn recv(&mut self, _max: usize) -> Vec<u8> {
        Vec::new()
    }

    fn send(&mut self, data: &[u8]) -> usize {
        if self.closed {
            return 0;
        }
        self.total_delivered += data.len() as u64;
        data.len()
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn set_on_readable(&mut self, _cb: SocketCallback) {}

    fn set_on_sent(&mut self, _cb: SocketCallback) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use orsim_rt::ConstantStream;

    #[test]
    fn client_serves_one_request() {
        let ev = EventLoop::new();
        let sock = PseudoClientSocket::new(
            &ev,
            Box::new(ConstantStream::new(1000.0)),
            Box::new(ConstantStream::new(60.0)),
        );
        assert_eq!(sock.borrow().rx_available(), 1000);
        let got = sock.borrow_mut().recv(400);
        assert_eq!(got.len(), 400);
        assert_eq!(sock.borrow().rx_available(), 600);
        let got = sock.borrow_mut().recv(10_000);
        assert_eq!(got.len(), 600);
        assert_eq!(sock.borrow().rx_available(), 0);
    }

    #[test]
    fn client_thinks_then_rearms() {
        let ev = EventLoop::new();
        let sock = PseudoClientSocket::new(
            &ev,
            Box::new(ConstantStream::new(100.0)),
            Box::new(ConstantStream::new(2.0)),
        );
        sock.borrow_mut().recv(100);
        assert_eq!(sock.borrow().rx_available(), 0);

        ev.run_until(Duration::from_secs(1));
        assert_eq!(sock.borrow().rx_available(), 0);
        ev.run_until(Duration::from_secs(2));
        assert_eq!(sock.borrow().rx_available(), 100);
        assert_eq!(sock.borrow().requests_started(), 2);
    }

    #[test]
    fn client_fires_timing_hooks() {
        let ev = EventLoop::new();
        let sock = PseudoClientSocket::new(
            &ev,
            Box::new(ConstantStream::new(200.0)),
            Box::new(ConstantStream::new(60.0)),
        );
        let seen: Rc<RefCell<Vec<(i32, String)>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_a = Rc::clone(&seen);
        let seen_b = Rc::clone(&seen);
        sock.borrow_mut().set_ttfb_callback(
            Rc::new(move |id, _t, desc| seen_a.borrow_mut().push((id, desc.to_string()))),
            1,
            "first",
        );
        sock.borrow_mut().set_ttlb_callback(
            Rc::new(move |id, _t, desc| seen_b.borrow_mut().push((id, desc.to_string()))),
            2,
            "last",
        );

        sock.borrow_mut().recv(150);
        assert_eq!(seen.borrow().len(), 1);
        sock.borrow_mut().recv(50);
        assert_eq!(
            *seen.borrow(),
            vec![(1, "first".to_string()), (2, "last".to_string())]
        );
    }

    #[test]
    fn closed_client_goes_quiet() {
        let ev = EventLoop::new();
        let sock = PseudoClientSocket::new(
            &ev,
            Box::new(ConstantStream::new(100.0)),
            Box::new(ConstantStream::new(0.5)),
        );
        sock.borrow_mut().recv(100); // schedules a think event
        sock.borrow_mut().close();
        assert_eq!(ev.pending_events(), 0);
        ev.run();
        assert_eq!(sock.borrow().rx_available(), 0);
        assert_eq!(sock.borrow_mut().send(b"late"), 0);
    }

    #[test]
    fn server_counts_deliveries() {
        let sock = PseudoServerSocket::new();
        assert_eq!(sock.borrow_mut().send(&[0_u8; 498]), 498);
        assert_eq!(sock.borrow_mut().send(&[0_u8; 498]), 498);
        assert_eq!(sock.borrow().total_delivered(), 996);
        assert_eq!(sock.borrow().rx_available(), 0);
        assert!(sock.borrow_mut().recv(100).is_empty());
    }
}
