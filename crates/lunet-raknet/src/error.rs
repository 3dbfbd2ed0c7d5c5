use lunet_binary::BinaryError;
use std::io;
use thiserror::Error;

/// Errors raised by the reliability layer. Wire-parse errors and protocol
/// violations both close the offending connection; neither reaches the
/// application.
#[derive(Error, Debug)]
pub enum RakNetError {
    /// An I/O error on the underlying UDP socket.
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    /// A malformed bit-level field in an incoming datagram.
    #[error("wire decode error: {0}")]
    Binary(#[from] BinaryError),

    /// A reliability value outside the wire encoding.
    #[error("invalid reliability value: {0}")]
    InvalidReliability(u8),

    /// ReliableSequenced is reserved and never accepted on the wire.
    #[error("reserved reliability ReliableSequenced on the wire")]
    ReservedReliability,

    /// Only ordering channel 0 exists in this protocol.
    #[error("nonzero ordering channel: {0}")]
    OrderingChannel(u8),

    /// Split-packet metadata that cannot describe a valid reassembly.
    #[error("invalid split packet: {0}")]
    InvalidSplit(String),
}

/// Result type alias for reliability-layer operations.
pub type Result<T> = std::result::Result<T, RakNetError>;
