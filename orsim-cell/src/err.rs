//! Define an error type for the orsim-cell crate.

use thiserror::Error;

/// An error type for the orsim-cell crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The cell (or its header) was shorter than the format requires.
    #[error("cell truncated or malformed")]
    Truncated,
    /// Tried to read a header from a cell that carries none.
    #[error("unframed cell has no header")]
    MissingHeader,
    /// Tried to package more bytes than fit in one cell payload.
    #[error("payload too long for a cell")]
    PayloadTooLong,
}
