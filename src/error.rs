//! Error types for the collaboration engine.
//!
//! Each layer has its own error enum; non-destructive failures are reported
//! through the session's `error` event rather than propagated, so most of
//! these only ever cross a function boundary inside the crate.

use std::fmt;

/// Errors raised by a substrate implementation.
#[derive(Debug, Clone)]
pub enum SubstrateError {
    /// Read/write/remove against the backing store failed.
    Io(String),
    /// The value at a path did not have the expected shape.
    Malformed(String),
    /// The substrate connection is gone.
    Disconnected,
}

impl fmt::Display for SubstrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstrateError::Io(e) => write!(f, "substrate I/O error: {e}"),
            SubstrateError::Malformed(e) => write!(f, "malformed substrate value: {e}"),
            SubstrateError::Disconnected => write!(f, "substrate disconnected"),
        }
    }
}

impl std::error::Error for SubstrateError {}

/// Errors raised by a peer transport implementation.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Offer/answer applied in the wrong signaling state.
    InvalidState(String),
    /// The data channel is not open.
    ChannelClosed,
    /// The connection has been closed or failed.
    ConnectionClosed,
    /// Transport-internal failure (ICE, SDP parse, socket).
    Internal(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidState(e) => write!(f, "invalid signaling state: {e}"),
            TransportError::ChannelClosed => write!(f, "data channel closed"),
            TransportError::ConnectionClosed => write!(f, "peer connection closed"),
            TransportError::Internal(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors in wire envelope encoding, chunking, and reassembly.
#[derive(Debug, Clone)]
pub enum FramingError {
    SerializationError(String),
    DeserializationError(String),
    /// Chunk index outside `0..total_chunks`.
    ChunkOutOfRange { index: u32, total: u32 },
    /// Chunks of one message disagree about the total.
    ChunkCountMismatch { expected: u32, got: u32 },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::SerializationError(e) => write!(f, "serialization error: {e}"),
            FramingError::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            FramingError::ChunkOutOfRange { index, total } => {
                write!(f, "chunk index {index} out of range for {total} chunks")
            }
            FramingError::ChunkCountMismatch { expected, got } => {
                write!(f, "chunk count mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// Errors surfaced by the session and its subcomponents.
#[derive(Debug, Clone)]
pub enum EngineError {
    Substrate(SubstrateError),
    Transport(TransportError),
    Framing(FramingError),
    /// CRDT decode/apply failure.
    Crdt(String),
    /// A persisted record could not be decoded (base64, JSON, checksum).
    Snapshot(String),
    /// Required configuration is missing or contradictory.
    Config(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Substrate(e) => write!(f, "{e}"),
            EngineError::Transport(e) => write!(f, "{e}"),
            EngineError::Framing(e) => write!(f, "{e}"),
            EngineError::Crdt(e) => write!(f, "CRDT error: {e}"),
            EngineError::Snapshot(e) => write!(f, "snapshot error: {e}"),
            EngineError::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<SubstrateError> for EngineError {
    fn from(e: SubstrateError) -> Self {
        EngineError::Substrate(e)
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        EngineError::Transport(e)
    }
}

impl From<FramingError> for EngineError {
    fn from(e: FramingError) -> Self {
        EngineError::Framing(e)
    }
}
