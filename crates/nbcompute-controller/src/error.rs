use nbcompute_client::RemoteError;
use nbcompute_control_plane::{FailureKind, FailureReason};

/// Why `start` did not produce an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("storage attach failed: {0}")]
    AttachFailed(String),

    #[error("instance failed: {0}")]
    InstanceFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A concurrent `stop` interrupted the start.
    #[error("start cancelled by stop")]
    Cancelled,
}

impl ControllerError {
    /// The reason recorded in `Failed`, or `None` for a cancellation, which never
    /// marks the session failed.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        let (kind, message) = match self {
            Self::RemoteRejected(m) => (FailureKind::RemoteRejected, m),
            Self::RemoteUnavailable(m) => (FailureKind::RemoteUnavailable, m),
            Self::NotFound(m) => (FailureKind::NotFound, m),
            Self::AttachFailed(m) => (FailureKind::AttachFailed, m),
            Self::InstanceFailed(m) => (FailureKind::InstanceFailed, m),
            Self::Timeout(m) => (FailureKind::Timeout, m),
            Self::MalformedResponse(m) => (FailureKind::MalformedResponse, m),
            Self::Cancelled => return None,
        };
        Some(FailureReason::new(kind, message.clone()))
    }
}

impl From<FailureReason> for ControllerError {
    fn from(reason: FailureReason) -> Self {
        let FailureReason { kind, message } = reason;
        match kind {
            FailureKind::RemoteRejected => Self::RemoteRejected(message),
            FailureKind::RemoteUnavailable => Self::RemoteUnavailable(message),
            FailureKind::NotFound => Self::NotFound(message),
            FailureKind::AttachFailed => Self::AttachFailed(message),
            FailureKind::InstanceFailed => Self::InstanceFailed(message),
            FailureKind::Timeout => Self::Timeout(message),
            FailureKind::MalformedResponse => Self::MalformedResponse(message),
        }
    }
}

impl From<RemoteError> for ControllerError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Rejected { status, detail } => {
                Self::RemoteRejected(format!("{status}: {detail}"))
            }
            RemoteError::Unavailable(m) => Self::RemoteUnavailable(m),
            RemoteError::NotFound(m) => Self::NotFound(m),
            RemoteError::AlreadyExists(name) => {
                Self::RemoteRejected(format!("instance {name} already exists"))
            }
            RemoteError::AttachFailed(m) => Self::AttachFailed(m),
            RemoteError::MalformedResponse(m) => Self::MalformedResponse(m),
        }
    }
}
