//! Main crate error.

#[derive(thiserror::Error, Debug)]
/// Kadmos crate error enum.
pub enum Error {
    /// An id was built from a slice of the wrong length.
    #[error("Invalid id size: expected 20 bytes, got {0}")]
    InvalidIdSize(usize),

    /// An id string failed to parse.
    #[error("Invalid id encoding: {0}")]
    InvalidIdEncoding(&'static str),

    /// The node no longer accepts operations.
    #[error("Node is shutting down")]
    ShuttingDown,

    /// Bootstrap-only nodes serve the network but never initiate
    /// put/get/listen operations.
    #[error("Bootstrap-only node does not initiate operations")]
    BootstrapOnly,

    /// A values export blob failed to decode.
    #[error("Failed to decode values export: {0}")]
    ImportDecode(#[from] serde_bencode::Error),
}
