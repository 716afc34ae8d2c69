//! # Error Handling
//!
//! This module provides the error taxonomy for the whole crate.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Cancellation                                                      │
//! │  │   └── Cancelled(CancelError)   - closer fired (Cancel or Timeout)   │
//! │  │                                                                      │
//! │  ├── Server Errors                                                     │
//! │  │   └── Server(ServerError)      - ack-error frame from the SFU       │
//! │  │                                                                      │
//! │  ├── Transport Errors                                                  │
//! │  │   ├── Transport(String)        - WebSocket read/write failure       │
//! │  │   └── Handshake(String)        - connect/upgrade failure            │
//! │  │                                                                      │
//! │  ├── Protocol Errors                                                   │
//! │  │   └── Protocol(String)         - unexpected message shape           │
//! │  │                                                                      │
//! │  └── Programmer Errors                                                 │
//! │      └── Invariant(String)        - violated an internal contract      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a [`crate::cancel::CloseSignal`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An explicit `close()` call.
    Cancel,
    /// The armed timer elapsed.
    Timeout,
}

/// Carried by every cancellation. Distinct from transport errors: a
/// `CancelError` always means "the closer fired", never "the network broke".
#[derive(Debug, Clone, Error)]
#[error("cancelled ({reason:?}): {reason_text}")]
pub struct CancelError {
    /// `Cancel` or `Timeout`.
    pub reason: CancelReason,
    /// The reason string attached to the close (or timeout) call.
    pub reason_text: String,
    /// Optional identifier of the call site that observed the cancellation,
    /// useful when several `select!` branches could have produced it.
    pub call_site: Option<&'static str>,
}

impl CancelError {
    /// Build a cancel error with no call-site annotation.
    pub fn new(reason: CancelReason, reason_text: impl Into<String>) -> Self {
        Self {
            reason,
            reason_text: reason_text.into(),
            call_site: None,
        }
    }

    /// Attach a call-site identifier for diagnostics.
    pub fn at(mut self, call_site: &'static str) -> Self {
        self.call_site = Some(call_site);
        self
    }

    /// True if this cancellation was a timeout rather than an explicit close.
    pub fn is_timeout(&self) -> bool {
        self.reason == CancelReason::Timeout
    }
}

/// An ack-error frame from the SFU, per §7 of the protocol spec.
#[derive(Debug, Clone, Error)]
#[error("server error {code}: {msg}")]
pub struct ServerError {
    /// Server-defined error code.
    pub code: i64,
    /// Human-readable message.
    pub msg: String,
    /// Optional structured payload accompanying the error.
    pub data: Option<serde_json::Value>,
}

/// Top-level error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A `CloseSignal` fired while this operation was suspended.
    #[error(transparent)]
    Cancelled(#[from] CancelError),

    /// The SFU responded with an ack-error frame.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The WebSocket transport failed to read or write.
    #[error("transport error: {0}")]
    Transport(String),

    /// The initial HTTP upgrade / WebSocket handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A message arrived that the protocol state machine did not expect
    /// (e.g. an `Offer` where an `Answer` was required).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying peer-connection collaborator reported an error.
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    /// An internal invariant was violated — a programmer error, never a
    /// runtime condition a caller should retry around.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// JSON payload failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for building a [`Error::Cancelled`] from an explicit close.
    pub fn cancel(reason_text: impl Into<String>) -> Self {
        Error::Cancelled(CancelError::new(CancelReason::Cancel, reason_text))
    }

    /// Shorthand for building a [`Error::Cancelled`] from a timer firing.
    pub fn timeout(reason_text: impl Into<String>) -> Self {
        Error::Cancelled(CancelError::new(CancelReason::Timeout, reason_text))
    }

    /// True if retrying this exact operation could plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Handshake(_))
    }

    /// True if this is a cancellation rather than a domain error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}
