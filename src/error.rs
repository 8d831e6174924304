//! Error types for Nexum

use thiserror::Error;

use crate::common::Destination;

/// Main error type for Nexum
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Target not specified")]
    MissingTarget,

    #[error("Failed to dial {0}: {1}")]
    DialFailed(Destination, #[source] Box<Error>),

    #[error("DNS lookup failed for {0}: {1}")]
    LookupFailed(String, String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Cancelled")]
    Cancelled,

    #[error("Copy read error: {0}")]
    CopyRead(#[source] Box<Error>),

    #[error("Copy write error: {0}")]
    CopyWrite(#[source] Box<Error>),

    #[error("Balancing strategy returned empty tag")]
    EmptyTag,

    #[error("No such balancer: {0}")]
    NoSuchBalancer(String),

    #[error("Strategy does not expose a principle target")]
    UnsupportedPrincipleTarget,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unknown outbound: {0}")]
    UnknownOutbound(String),
}

impl Error {
    /// True for errors that mean the peer or the session went away
    /// rather than something being wrong with the request itself.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Cancelled | Error::DeadlineExceeded => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Error::CopyRead(inner) | Error::CopyWrite(inner) => inner.is_closed(),
            _ => false,
        }
    }
}

/// Result type alias for Nexum
pub type Result<T> = std::result::Result<T, Error>;
