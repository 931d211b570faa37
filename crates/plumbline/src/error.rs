//! Error taxonomy for the session core.

use thiserror::Error;

/// Failures recorded on a transition and delivered through its completion callback.
///
/// Cloneable so that one failure can reach every waiter attached to the
/// same activation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Asynchronous error reported by the remote peer for one handle.
    #[error("remote error (seq {seq}, code {code}): {message}")]
    Protocol { seq: i32, code: i32, message: String },

    /// Local programming defect: missing step handler, state machine misuse.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object backing an operation went away before it finished.
    #[error("activation aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    /// Invariant violations are logged louder than everything else.
    pub fn is_invariant(&self) -> bool {
        matches!(self, SessionError::Invariant(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
