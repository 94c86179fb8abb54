//! Error types shared across the crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// An input array's column count disagrees with a dimensionality baked
    /// into the expression graph. Raised at evaluation time, when shapes
    /// first become known.
    #[error("shape mismatch: expected {expected} columns, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    /// A density parameter rejected at construction time.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An operation applied to operand shapes it does not support.
    #[error("computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
