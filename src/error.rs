//! Error types for the relay
//!
//! Two layers: `TorError` is the ordinary error enum used throughout the
//! crate, and `CellError` wraps one together with the action the connection
//! actor must take for it (close the link, destroy a circuit, end a stream).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum TorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("malformed cell: {0}")]
    MalformedCell(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("registry error: {0}")]
    Registry(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// DESTROY cell reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestroyReason {
    None = 0,
    Protocol = 1,
    Internal = 2,
    Requested = 3,
    Hibernating = 4,
    ResourceLimit = 5,
    ConnectFailed = 6,
    OrIdentity = 7,
    OrConnClosed = 8,
    Finished = 9,
    Timeout = 10,
    Destroyed = 11,
    NoSuchService = 12,
}

impl DestroyReason {
    /// Parse a reason byte. Unknown values collapse to `None`.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => DestroyReason::Protocol,
            2 => DestroyReason::Internal,
            3 => DestroyReason::Requested,
            4 => DestroyReason::Hibernating,
            5 => DestroyReason::ResourceLimit,
            6 => DestroyReason::ConnectFailed,
            7 => DestroyReason::OrIdentity,
            8 => DestroyReason::OrConnClosed,
            9 => DestroyReason::Finished,
            10 => DestroyReason::Timeout,
            11 => DestroyReason::Destroyed,
            12 => DestroyReason::NoSuchService,
            _ => DestroyReason::None,
        }
    }
}

/// RELAY_END reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamEndReason {
    Misc = 1,
    ResolveFailed = 2,
    ConnectRefused = 3,
    ExitPolicy = 4,
    Destroy = 5,
    Done = 6,
    Timeout = 7,
    NoRoute = 8,
    Hibernating = 9,
    Internal = 10,
    ResourceLimit = 11,
    ConnReset = 12,
    TorProtocol = 13,
    NotDirectory = 14,
}

/// An error plus the action the connection actor takes for it.
///
/// `Refuse` variants mean no local state was installed for the offending
/// circuit or stream; `Close` variants mean installed state must be torn
/// down as well. A circuit ID (or stream ID) of zero escalates either
/// circuit (stream) action to `CloseConnection` at the dispatch site.
#[derive(Debug)]
pub enum CellError {
    CloseConnection(TorError),
    CloseCircuit(TorError, DestroyReason),
    RefuseCircuit(TorError, DestroyReason),
    CloseStream(TorError, StreamEndReason),
    RefuseStream(TorError, StreamEndReason),
}

/// Result type for cell and circuit-command handlers.
pub type HandlerResult = std::result::Result<(), CellError>;

impl CellError {
    pub fn close_connection(err: TorError) -> CellError {
        CellError::CloseConnection(err)
    }

    pub fn close_circuit(err: TorError, reason: DestroyReason) -> CellError {
        CellError::CloseCircuit(err, reason)
    }

    pub fn refuse_circuit(err: TorError, reason: DestroyReason) -> CellError {
        CellError::RefuseCircuit(err, reason)
    }

    pub fn close_stream(err: TorError, reason: StreamEndReason) -> CellError {
        CellError::CloseStream(err, reason)
    }

    pub fn refuse_stream(err: TorError, reason: StreamEndReason) -> CellError {
        CellError::RefuseStream(err, reason)
    }

    /// The wrapped error, for logging.
    pub fn error(&self) -> &TorError {
        match self {
            CellError::CloseConnection(e)
            | CellError::CloseCircuit(e, _)
            | CellError::RefuseCircuit(e, _)
            | CellError::CloseStream(e, _)
            | CellError::RefuseStream(e, _) => e,
        }
    }
}

impl std::fmt::Display for CellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_reason_roundtrip() {
        for v in 0..=12u8 {
            assert_eq!(DestroyReason::from_u8(v) as u8, v);
        }
        // Unknown reasons collapse to None rather than failing.
        assert_eq!(DestroyReason::from_u8(200), DestroyReason::None);
    }

    #[test]
    fn cell_error_exposes_inner() {
        let err = CellError::close_circuit(
            TorError::Protocol("bad".into()),
            DestroyReason::Protocol,
        );
        assert!(matches!(err.error(), TorError::Protocol(_)));
    }
}
