//! Protocol error kinds shared by both ends of a transfer.

use thiserror::Error;

use crate::fileset::FileSetError;
use crate::wire::WireError;

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Every way a transfer can fail, classified by what the receiver is
/// allowed to do about it: a non-fatal error after a completed join
/// re-enters the reconnect loop, a fatal one surfaces to the caller.
#[derive(Debug, Error)]
pub enum TransferError {
    /// PSK mismatch or sealed-channel failure. Never retried.
    #[error("authentication failed")]
    AuthFailed,

    /// Reconnect found a different file list. Local partials are cleaned.
    #[error("payload changed between connections")]
    PayloadMismatch,

    /// Admission limits exceeded for this attempt.
    #[error("admission refused: {0}")]
    Refused(String),

    /// Undecodable frame or datagram; treated as a transport failure.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] WireError),

    /// Control-channel I/O failure.
    #[error("transport lost: {0}")]
    TransportLost(#[from] std::io::Error),

    /// Settings or block-size derivation rejected at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Cooperative cancellation.
    #[error("cancelled")]
    Cancelled,

    /// Payload storage failure.
    #[error(transparent)]
    FileSet(#[from] FileSetError),

    /// An error raised before authentication and join completed; the
    /// receiver cannot reconnect its way out of it.
    #[error("session aborted: {0}")]
    SessionAborted(#[source] Box<TransferError>),
}

impl TransferError {
    /// Wrap a pre-join failure.
    pub fn aborted(inner: TransferError) -> Self {
        match inner {
            already @ TransferError::SessionAborted(_) => already,
            other => TransferError::SessionAborted(Box::new(other)),
        }
    }

    /// Kinds that must never re-enter the reconnect loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::AuthFailed
                | TransferError::PayloadMismatch
                | TransferError::ConfigInvalid(_)
                | TransferError::Cancelled
                | TransferError::FileSet(_)
                | TransferError::SessionAborted(_)
        )
    }
}
