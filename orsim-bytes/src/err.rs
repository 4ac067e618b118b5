//! Error type for orsim-bytes.

use thiserror::Error;

/// An error from decoding a byte-encoded object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The input ran out before the object ended.
    #[error("input ended in the middle of an object")]
    Truncated,
}
