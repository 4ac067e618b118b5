//! Define an error type for the orsim-relay crate.
//!
//! Every error here is a simulation-local invariant violation: it
//! points at a topology or configuration bug, not a runtime condition
//! a relay could recover from.  The event dispatchers treat them as
//! fatal.

use orsim_cell::CircId;
use std::net::Ipv4Addr;
use thiserror::Error;

/// An error originating in the relay scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to configure a circuit with an id already in use.
    #[error("circuit {0} already exists")]
    DuplicateCircuit(CircId),
    /// Received a cell for a circuit this relay knows nothing about.
    #[error("cell for unknown circuit {0}")]
    UnknownCircuit(CircId),
    /// No pre-declared connection matches this peer address.
    #[error("no pre-declared connection for peer {0}")]
    UnknownPeer(Ipv4Addr),
    /// A problem occurred while encoding or decoding a cell.
    #[error("cell error: {0}")]
    CellErr(#[from] orsim_cell::Error),
    /// A problem occurred in the host transport registry.
    #[error("network error: {0}")]
    NetErr(#[from] orsim_rt::NetError),
    /// An internal programming error.
    #[error("internal programming error: {0}")]
    Internal(&'static str),
}
