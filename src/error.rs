//! Instrument Errors
//!
//! Failure taxonomy shared by the codec, correlator, connection and scanner.

use crate::infrastructure::bluetooth::protocol::CommandKind;
use thiserror::Error;

/// Result type used throughout the instrument core
pub type Result<T> = std::result::Result<T, InstrumentError>;

/// Errors surfaced by instrument operations
///
/// `Clone` so one failure can be delivered to every drained pending request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InstrumentError {
    /// Radio adapter absent or disabled
    #[error("bluetooth adapter unavailable")]
    TransportUnavailable,

    /// The link dropped while an operation was in flight
    #[error("connection lost")]
    ConnectionLost,

    /// Discovery completed but the instrument service is missing
    #[error("instrument service not found")]
    ServiceNotFound,

    /// Service discovery or notification setup could not be performed
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Command issued while the connection is not ready
    #[error("not connected")]
    NotConnected,

    /// A request of the same kind is already awaiting its response
    #[error("a {0:?} request is already in flight")]
    RequestAlreadyInFlight(CommandKind),

    /// A frame failed to decode, or a reply did not fit its command
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Radio-level scan error
    #[error("scan failed with code {0}")]
    ScanFailed(i32),

    /// The caller stopped waiting for the request
    #[error("cancelled")]
    Cancelled,

    /// Wrong number of float arguments for a command
    #[error("{kind:?} takes {expected} argument(s), got {actual}")]
    InvalidArguments {
        kind: CommandKind,
        expected: usize,
        actual: usize,
    },

    /// No response within the configured command timeout
    #[error("timed out waiting for response")]
    Timeout,

    /// The instrument answered with an error frame
    #[error("instrument rejected the command")]
    Rejected,
}

/// Failures reported by a transport implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("adapter unavailable")]
    Unavailable,
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl From<TransportError> for InstrumentError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable => InstrumentError::TransportUnavailable,
            TransportError::UnknownDevice(_) | TransportError::OperationFailed(_) => {
                InstrumentError::ConnectionLost
            }
        }
    }
}
