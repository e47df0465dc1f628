// Error handling module
// Defines the error kinds raised by ALM operations

use thiserror::Error;

/// Errors that can occur while talking to the ALM server
#[derive(Error, Debug)]
pub enum AlmError {
    /// Login or authentication check rejected
    #[error("Authentication failed: {status} - {message}")]
    AuthenticationFailure {
        status: u16,
        message: String,
        body: String,
    },

    /// Session create/extend/teardown rejected
    #[error("Session renewal failed: {status} - {message}")]
    SessionRenewalFailure {
        status: u16,
        message: String,
        body: String,
    },

    /// Any other call answered with an unexpected status
    #[error("Remote operation failed: {status} - {message}")]
    RemoteOperationFailure {
        status: u16,
        message: String,
        body: String,
    },

    /// Acquiring or releasing an entity lock failed
    #[error("Lock failed: {status} - {message}")]
    LockFailure {
        status: u16,
        message: String,
        body: String,
    },

    /// Writing entity fields failed
    #[error("Update failed: {status} - {message}")]
    UpdateFailure {
        status: u16,
        message: String,
        body: String,
    },

    /// Network failure after all retries
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: &'static str, message: String },

    /// Response payload could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Operation aborted through the client's cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid client or profile configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AlmError {
    /// HTTP status carried by the error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            AlmError::AuthenticationFailure { status, .. }
            | AlmError::SessionRenewalFailure { status, .. }
            | AlmError::RemoteOperationFailure { status, .. }
            | AlmError::LockFailure { status, .. }
            | AlmError::UpdateFailure { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw response body carried by the error
    pub fn body(&self) -> Option<&str> {
        match self {
            AlmError::AuthenticationFailure { body, .. }
            | AlmError::SessionRenewalFailure { body, .. }
            | AlmError::RemoteOperationFailure { body, .. }
            | AlmError::LockFailure { body, .. }
            | AlmError::UpdateFailure { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether "hide custom errors" mode turns this error into a failure sentinel.
    /// Cancellation and configuration problems always surface.
    pub fn is_suppressible(&self) -> bool {
        !matches!(self, AlmError::Cancelled | AlmError::Config(_))
    }
}

/// Result type alias for ALM operations
pub type Result<T> = std::result::Result<T, AlmError>;
