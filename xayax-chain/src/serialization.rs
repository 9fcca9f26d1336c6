//! Errors for the stored block envelope.

use thiserror::Error;

/// An error decoding a stored block envelope back into a
/// [`BlockData`](crate::BlockData).
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The envelope bytes do not decode to the expected block shape.
    #[error("malformed block envelope")]
    Malformed(#[from] serde_json::Error),
}
