use thiserror::Error;

use xayax_chain::serialization::SerializationError;

/// Errors raised by the chain-state store.
///
/// Everything except [`StateError::ChainMismatch`] indicates either an I/O
/// problem or corruption of the stored tree; both are fatal for the process,
/// because the store is the local source of truth and cannot be silently
/// rebuilt.
#[derive(Debug, Error)]
pub enum StateError {
    /// An underlying SQLite error.
    #[error("chain state database error")]
    Database(#[from] rusqlite::Error),

    /// A stored block envelope failed to decode.
    #[error("stored block envelope is corrupt")]
    Envelope(#[from] SerializationError),

    /// The connector reports a different chain than the one this state was
    /// built for.  Mixing data from two networks would corrupt the store.
    #[error("chain state is for {stored:?}, but the connector reports {actual:?}")]
    ChainMismatch {
        /// Chain id recorded in the store.
        stored: String,
        /// Chain id reported by the connector.
        actual: String,
    },

    /// A structural invariant of the stored block tree does not hold.
    #[error("chain state corruption: {0}")]
    Corruption(String),
}

/// Result type for chain-state operations.
pub type Result<T> = std::result::Result<T, StateError>;
