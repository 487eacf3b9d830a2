//! Crate-wide error taxonomy
//!
//! One enum per *kind*, not per component: every asynchronous operation in
//! the core completes its caller with one of these. Component-local error
//! enums (`ScriptError`, `GuiderError`, `SequencerError`) convert into this
//! at the boundary via `From`, the way `taskdaemon`'s `StateError` is
//! bubbled into `eyre::Report` at the binary edge.

use thiserror::Error;

/// A structured error kind shared by every completion-channel in the core.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Named entity (task, command, script, target) absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input failed a pre-dispatch invariant check.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation forbidden in current state (e.g. second concurrent settle).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Deadline exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Caller-initiated cancellation, including abort.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Transport failure to an external peer.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A user-supplied callback raised; detail preserved.
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    /// Safety gate refused execution.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Structural invariants violated at load (dependency cycle, duplicate names).
    #[error("definition error: {0}")]
    DefinitionError(String),
}

impl CoreError {
    /// The stable kind name, used in wire envelopes and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidState(_) => "InvalidState",
            Self::Timeout(_) => "Timeout",
            Self::Canceled(_) => "Canceled",
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::HandlerFailed(_) => "HandlerFailed",
            Self::PolicyViolation(_) => "PolicyViolation",
            Self::DefinitionError(_) => "DefinitionError",
        }
    }
}

/// Result alias used across completion channels.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(CoreError::NotFound("x".into()).kind(), "NotFound");
        assert_eq!(CoreError::Timeout("x".into()).kind(), "Timeout");
        assert_eq!(CoreError::PolicyViolation("x".into()).kind(), "PolicyViolation");
    }

    #[test]
    fn display_includes_detail() {
        let err = CoreError::HandlerFailed("boom".into());
        assert_eq!(err.to_string(), "handler failed: boom");
    }
}
