//! Tunnel client errors
//!
//! Every error here is `Clone`: a single coalesced queue execution hands
//! the same result to all of its waiters.

use netx_runtime::{QueueError, TaskFailure};

/// Failure of the tunnel controller or the lease manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("VPN permission not granted")]
    NoPermission,

    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    #[error("Another tunnel transition is in progress")]
    Busy,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Platform rejected the request: {0}")]
    PlatformRejected(String),

    #[error("Tunnel process: {0}")]
    Transport(#[from] TransportError),

    #[error("Backend: {0}")]
    Backend(#[from] BackendError),

    #[error("Tunnel stopped without being asked to")]
    UnexpectedStop,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TunnelError {
    pub fn config_missing(what: &str) -> Self {
        TunnelError::ConfigMissing(what.to_string())
    }
}

impl TaskFailure for TunnelError {
    fn is_timeout(&self) -> bool {
        matches!(
            self,
            TunnelError::Timeout(_)
                | TunnelError::Transport(TransportError::Timeout)
                | TunnelError::Backend(BackendError::Timeout)
        )
    }
}

impl From<QueueError<TunnelError>> for TunnelError {
    fn from(err: QueueError<TunnelError>) -> Self {
        match err {
            QueueError::Failed(e) => e,
            QueueError::Timeout { queue } => TunnelError::Timeout(queue),
            other => TunnelError::Internal(other.to_string()),
        }
    }
}

/// Failure of a message exchange with the running tunnel process
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no reply in time")]
    Timeout,

    #[error("tunnel process is not running")]
    NoReply,

    /// `error: code: N` reply; N is an HTTP status of a protected request
    #[error("remote code {0}")]
    Code(i32),

    /// `error: ...` reply
    #[error("remote error: {0}")]
    Remote(String),
}

/// Failure of the lease/gateway backend API
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("too many devices on this account")]
    TooManyDevices,

    #[error("lease not found")]
    LeaseNotFound,

    #[error("HTTP status {0}")]
    Http(u16),

    #[error("network: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

impl BackendError {
    /// Map an HTTP status the way the API client does
    pub fn from_status(status: u16) -> Self {
        match status {
            403 => BackendError::TooManyDevices,
            404 => BackendError::LeaseNotFound,
            code => BackendError::Http(code),
        }
    }

    /// The backend gave a definitive answer (as opposed to being unreachable)
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            BackendError::TooManyDevices | BackendError::LeaseNotFound | BackendError::Http(_)
        )
    }
}

/// Refusal by the OS VPN manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("permission denied")]
    NoPermission,

    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<PlatformError> for TunnelError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NoPermission => TunnelError::NoPermission,
            PlatformError::Rejected(reason) => TunnelError::PlatformRejected(reason),
        }
    }
}
