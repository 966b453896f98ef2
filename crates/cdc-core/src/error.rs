//! Cross-cutting error kinds shared by the orchestrator and its components.
//!
//! Individual components raise their own narrower error enums
//! ([`crate::event::EventError`], [`crate::position::PositionError`],
//! [`crate::auth::AuthError`]) for the cases that need detail; [`CdcError`]
//! is the shape the orchestrator uses to classify a failure for logging and
//! supervision decisions (`{stream, action, error_type, recoverable}`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdcError {
    /// Invalid or missing configuration field. Fatal at startup only.
    #[error("config error: {0}")]
    Config(String),

    /// Transient connectivity failure, retried with exponential backoff by
    /// the component that raised it.
    #[error("connection error: {0}")]
    Connection(String),

    /// Token/credential failure. Treated as fatal — auth does not heal by
    /// retry alone.
    #[error("auth error: {0}")]
    Auth(String),

    /// A lookup failed to find its target. Position-not-found is the
    /// legitimate "start from scratch" signal upstream; a sink resource not
    /// found is fatal for that sink but isolated from others.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rule or config schema mismatch. Fatal at load time.
    #[error("validation error: {0}")]
    Validation(String),

    /// A transform rule's action failed. Subject to the rule's
    /// `error_policy`.
    #[error("transform error: {0}")]
    Transform(String),

    /// A sink's write failed. Isolated — does not fail the event for other
    /// sinks.
    #[error("write error: {0}")]
    Write(String),
}

impl CdcError {
    /// Whether this error class is expected to heal itself given retries,
    /// used to populate the `recoverable` field of structured error logs.
    pub fn recoverable(&self) -> bool {
        matches!(self, CdcError::Connection(_) | CdcError::Write(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CdcError::Config(_) => "config",
            CdcError::Connection(_) => "connection",
            CdcError::Auth(_) => "auth",
            CdcError::NotFound(_) => "not_found",
            CdcError::Validation(_) => "validation",
            CdcError::Transform(_) => "transform",
            CdcError::Write(_) => "write",
        }
    }
}
