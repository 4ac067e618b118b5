//! Byte-level encoding and decoding helpers for the orsim simulator.
//!
//! The only wire objects in the simulator are small and fixed-layout
//! (chiefly the 14-byte cell header), so this crate provides just the
//! pieces their codecs are built from: a bounds-checked [`Reader`]
//! cursor over borrowed bytes, a [`Writer`] sink trait implemented by
//! the in-memory buffer types, and the [`Readable`] seam through which
//! a structure declares how to decode itself.
//!
//! Nothing here does I/O; sockets hand the simulator whole byte
//! slices and take them back the same way.

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

mod err;
mod reader;
mod writer;

pub use err::Error;
pub use reader::Reader;
pub use writer::Writer;

/// Result type returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for a structure that can be decoded from a [`Reader`].
pub trait Readable: Sized {
    /// Try to decode a value of this type, advancing the reader past
    /// its bytes.
    fn take_from(r: &mut Reader<'_>) -> Result<Self>;
}
