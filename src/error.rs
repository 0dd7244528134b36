//! Crate-wide error taxonomy for port mapping operations.

use thiserror::Error;

/// Errors that can occur while probing or driving a port mapping protocol.
///
/// These never escape the public orchestrator API (see `orchestrator.rs`):
/// per-candidate and per-protocol errors are swallowed internally and only
/// surface as an `err_info` string on a failed `Mapping`. The variants exist
/// so each protocol module has a precise internal vocabulary.
#[derive(Debug, Error)]
pub enum MappingError {
    /// No reply arrived within the per-request timeout.
    #[error("request timed out")]
    Timeout,

    /// A reply arrived but could not be parsed as a valid response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The gateway replied with a non-success result code.
    #[error("gateway error: {0}")]
    GatewayError(String),

    /// Every candidate in both waves failed to respond.
    #[error("no router responded")]
    NoGateway,

    /// Local IPv4 enumeration returned nothing within its timeout.
    #[error("no local IPv4 address found")]
    NoLocalIp,

    /// The gateway does not support this protocol (used by probing).
    #[error("protocol not supported")]
    NotSupported,

    /// Underlying I/O failure (socket, HTTP transport).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that doesn't fit the taxonomy above.
    #[error("internal error: {0}")]
    Internal(String),

    /// All three protocols were attempted and none produced a mapping.
    #[error("all protocols failed: {0}")]
    AllProtocolsFailed(String),
}
