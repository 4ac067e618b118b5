//! The relay cell scheduler of the orsim onion-routing simulator.
//!
//! # Overview
//!
//! One [`Relay`] models the data plane of a single onion-routing node:
//! it multiplexes many [`Circuit`]s over a set of long-lived
//! [`Connection`]s to neighboring relays and edge endpoints, under
//! relay-wide token-bucket rate limits and per-circuit window/SENDME
//! flow control.
//!
//! Bytes arrive on a socket; the connection slices them into cells;
//! the relay *packages* each cell (at an edge) or *relays* it (in the
//! middle) onto the opposite circuit queue; when the outgoing socket
//! drains, the connection pops one cell from each of its active
//! circuits in round-robin order and sends the batch.  The package
//! window stops an edge from ingesting more than a window-ful of
//! unacknowledged cells; the deliver window emits the SENDME cells
//! that replenish the upstream window as cells actually drain.
//!
//! Circuits are configured externally through
//! [`Relay::add_circuit`]: there is no circuit construction protocol,
//! no path selection, and no cryptography here.  Cells are opaque
//! payloads behind a fixed 14-byte header (see the `orsim-cell`
//! crate), and the host runtime (event loop, sockets, random streams)
//! comes from `orsim-rt`.
//!
//! # Example
//!
//! ```no_run
//! use orsim_relay::{HopKind, Relay, RelayConfig};
//! use orsim_rt::{ConstantStream, EventLoop, SimNet};
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! let ev = EventLoop::new();
//! let net = SimNet::new(&ev, Duration::from_millis(10));
//!
//! let proxy = Relay::new(&ev, &net, RelayConfig::new("proxy", Ipv4Addr::new(10, 0, 0, 1)));
//! proxy.add_circuit_with_streams(
//!     1.into(),
//!     Ipv4Addr::new(10, 0, 0, 2),
//!     HopKind::RelayEdge,
//!     Ipv4Addr::new(127, 0, 0, 1),
//!     HopKind::ProxyEdge,
//!     Box::new(ConstantStream::new(50_000.0)),
//!     Box::new(ConstantStream::new(5.0)),
//! )?;
//! proxy.start()?;
//! ev.run_until(Duration::from_secs(30));
//! proxy.stop();
//! # orsim_relay::Result::Ok(())
//! ```

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::cargo_common_metadata)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::trait_duplication_in_bounds)]
#![warn(clippy::unseparated_literal_suffix)]

mod bucket;
pub mod circuit;
pub mod conn;
mod err;
pub mod pseudo;
pub mod relay;
mod sendme;

pub use circuit::{CellDirection, Circuit};
pub use conn::{ConnType, Connection, HopKind};
pub use err::Error;
pub use pseudo::{PseudoClientSocket, PseudoServerSocket, TimingCallback};
pub use relay::{Relay, RelayConfig};
pub use sendme::{CIRCWINDOW_INCREMENT, CIRCWINDOW_START};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
