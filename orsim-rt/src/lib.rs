//! Host runtime for the orsim relay simulator.
//!
//! The relay scheduler is written against a small set of host
//! capabilities: a discrete-event loop with a monotonic virtual clock
//! and cancellable one-shot timers, sockets that report their buffer
//! state and signal readiness through callbacks, and random-value
//! streams that drive the pseudo traffic generators.  This crate
//! provides all three.
//!
//! Everything here is single-threaded and deterministic (given seeded
//! streams): callbacks run to completion in virtual-time order, and a
//! callback never invokes another callback synchronously; it may only
//! schedule one.
//!
//! # Overview
//!
//! * [`time::EventLoop`] — the event queue and virtual clock.
//! * [`net::SimSocket`] — the capability set the scheduler expects
//!   from a socket; [`net::PipeSocket`] is the in-memory transport
//!   used between relays, and [`net::SimNet`] the listen/dial
//!   registry that stands in for the host's TCP stack.
//! * [`stream::ValueStream`] — "next value" streams for request sizes
//!   and think times.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::cargo_common_metadata)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
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

pub mod net;
pub mod stream;
pub mod time;

pub use net::{AcceptCallback, NetError, PipeSocket, SimNet, SimSocket, SocketCallback, SocketRef};
pub use stream::{ConstantStream, UniformStream, ValueStream};
pub use time::{EventId, EventLoop};
