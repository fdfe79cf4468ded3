use thiserror::Error;

/// Failure kinds surfaced by the rendezvous service and the relay socket
/// server. Every variant terminates the affected call or connection; there is
/// no local recovery and no retry at any layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A request field was missing or malformed. The message names the field.
    #[error("{0}")]
    InvalidArgument(String),

    /// The counterpart did not show up within the blocking timeout.
    #[error("{0}")]
    Timeout(&'static str),

    /// A receiver is already parked for this fingerprint.
    #[error("a receiver is already listening for this fingerprint")]
    ReceiverBusy,

    /// Socket handshake referenced a session that is unknown or expired.
    #[error("unknown or expired session: {0}")]
    SessionAbsent(String),

    /// Malformed handshake line, unknown role, duplicate role, or a non-ACK
    /// line where ACK was expected.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The partner connection went away while relaying.
    #[error("peer connection lost")]
    PeerLost,

    /// A freshly generated session id collided with an existing one.
    #[error("session id collision: {0}")]
    DuplicateSession(String),
}
