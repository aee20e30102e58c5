use std::fmt;

use thiserror::Error;

/// Failure taxonomy of the delivery pipeline.
///
/// Every variant carries a human-readable message. The pipeline never
/// retries on its own; the caller decides based on [`DeliveryError::kind`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("page rendered an error: {0}")]
    ApplicationRender(String),

    #[error("email sending is not configured: {0}")]
    NotConfigured(String),

    #[error("incomplete configuration: {0}")]
    IncompleteConfig(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("failed to refresh auth token: {0}")]
    Refresh(String),

    #[error("credentials rejected by mail server: {0}")]
    AuthRejected(String),

    #[error("persistence error: {0}")]
    Persist(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    ApplicationRender,
    NotConfigured,
    IncompleteConfig,
    Unauthenticated,
    Refresh,
    AuthRejected,
    Persist,
    Cancelled,
    InvalidRequest,
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Transport(_) => ErrorKind::Transport,
            DeliveryError::Timeout(_) => ErrorKind::Timeout,
            DeliveryError::ApplicationRender(_) => ErrorKind::ApplicationRender,
            DeliveryError::NotConfigured(_) => ErrorKind::NotConfigured,
            DeliveryError::IncompleteConfig(_) => ErrorKind::IncompleteConfig,
            DeliveryError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            DeliveryError::Refresh(_) => ErrorKind::Refresh,
            DeliveryError::AuthRejected(_) => ErrorKind::AuthRejected,
            DeliveryError::Persist(_) => ErrorKind::Persist,
            DeliveryError::Cancelled(_) => ErrorKind::Cancelled,
            DeliveryError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            DeliveryError::Transport(m)
            | DeliveryError::Timeout(m)
            | DeliveryError::ApplicationRender(m)
            | DeliveryError::NotConfigured(m)
            | DeliveryError::IncompleteConfig(m)
            | DeliveryError::Unauthenticated(m)
            | DeliveryError::Refresh(m)
            | DeliveryError::AuthRejected(m)
            | DeliveryError::Persist(m)
            | DeliveryError::Cancelled(m)
            | DeliveryError::InvalidRequest(m) => m,
        }
    }

    /// The mailer session can no longer be used and the user has to log in again.
    /// A refresh failure is never retried automatically.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, DeliveryError::Refresh(_) | DeliveryError::Unauthenticated(_))
    }

    /// Worth retrying later without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transport(_) | DeliveryError::Timeout(_))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ApplicationRender => "application_render",
            ErrorKind::NotConfigured => "not_configured",
            ErrorKind::IncompleteConfig => "incomplete_config",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Refresh => "refresh",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::Persist => "persist",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
