//! Cells for the orsim relay simulator
//!
//! A 'cell' is the fixed-size unit of transmission between relays.  On
//! a relay-to-relay connection every cell is 512 bytes long: a 14-byte
//! header followed by a 498-byte payload.  On an edge connection (to a
//! pseudo client or pseudo server) cells are bare 498-byte payloads
//! with no header.
//!
//! This crate implements the [`CellHeader`] codec and the [`Cell`]
//! type that the relay scheduler queues and forwards.  Payloads are
//! opaque: the simulator does no cryptography, and the header's digest
//! field is carried without interpretation.

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
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::trait_duplication_in_bounds)]
#![warn(clippy::unseparated_literal_suffix)]

pub mod cell;
mod err;
pub mod header;

pub use cell::Cell;
pub use err::Error;
pub use header::{CellCmd, CellHeader, CellType, CircId};
pub use header::{CELL_HEADER_LEN, CELL_NETWORK_SIZE, CELL_PAYLOAD_SIZE};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
