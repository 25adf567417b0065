use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INSTANCE_SIZE: &str = "Standard_DS1_v2";
pub const DEFAULT_IMAGE: &str = "jupyter-datascience:latest";
pub const DEFAULT_ENDPOINT_APPLICATION: &str = "Jupyter Lab";
pub const DEFAULT_INSTANCE_NAME_SUFFIX: &str = "-nb";

const MAX_INSTANCE_NAME_LEN: usize = 23;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("identity must be a non-empty string")]
pub struct InvalidIdentity;

/// Opaque key for one user/workspace pairing.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidIdentity> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidIdentity);
        }
        if trimmed.len() == raw.len() {
            Ok(Self(raw))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = InvalidIdentity;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a reachable notebook server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceSpec {
    pub instance_size: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_user_id: Option<String>,
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self {
            instance_size: DEFAULT_INSTANCE_SIZE.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            share_ref: None,
            assigned_user_id: None,
        }
    }
}

/// Per-request overrides supplied by the host on `start`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, Default)]
pub struct InstanceSpecOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_user_id: Option<String>,
}

impl InstanceSpecOverride {
    /// Layers the non-blank overrides on top of `base`.
    pub fn apply(&self, base: &InstanceSpec) -> InstanceSpec {
        InstanceSpec {
            instance_size: non_blank(self.instance_size.as_deref())
                .unwrap_or(&base.instance_size)
                .to_string(),
            image: non_blank(self.image.as_deref())
                .unwrap_or(&base.image)
                .to_string(),
            share_ref: non_blank(self.share_ref.as_deref())
                .map(str::to_string)
                .or_else(|| base.share_ref.clone()),
            assigned_user_id: non_blank(self.assigned_user_id.as_deref())
                .map(str::to_string)
                .or_else(|| base.assigned_user_id.clone()),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// State as reported by the remote compute API.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Creating,
    Updating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Failed,
}

impl ProvisioningState {
    pub fn is_started(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            Self::Stopping | Self::Stopped | Self::Deleting | Self::Deleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    pub id: String,
    pub name: String,
    pub identity: Identity,
    pub provisioning_state: ProvisioningState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_address: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub applications: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ResourceDescriptor {
    /// The endpoint, but only once the remote reports the instance as running.
    pub fn reachable_endpoint(&self) -> Option<&Endpoint> {
        if self.provisioning_state == ProvisioningState::Running {
            self.endpoint_address.as_ref()
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RemoteRejected,
    RemoteUnavailable,
    NotFound,
    AttachFailed,
    /// The remote reported the instance itself as failed.
    InstanceFailed,
    Timeout,
    MalformedResponse,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteRejected => "remote_rejected",
            Self::RemoteUnavailable => "remote_unavailable",
            Self::NotFound => "not_found",
            Self::AttachFailed => "attach_failed",
            Self::InstanceFailed => "instance_failed",
            Self::Timeout => "timeout",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Local view of a session's progress.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Provisioning,
    WaitingReachable,
    Running,
    Stopping,
    Stopped,
    Failed(FailureReason),
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::WaitingReachable => "waiting_reachable",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }

    /// Provisioning or waiting for the instance to become reachable.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Provisioning | Self::WaitingReachable)
    }

    pub fn can_transition_to(&self, next: &LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Idle, Provisioning) => true,
            (Provisioning, WaitingReachable) => true,
            (WaitingReachable, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            // stop() while still starting skips straight to teardown.
            (Provisioning | WaitingReachable, Stopping) => true,
            (Failed(_), Stopping) => true,
            // A fresh attempt after a terminal state.
            (Stopped | Failed(_), Provisioning) => true,
            (Idle, Stopping) => true,
            (current, Failed(_)) => !current.is_terminal() && *current != Idle,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub message: String,
    pub progress: u8,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>, progress: u8) -> Self {
        Self {
            message: message.into(),
            progress: progress.min(100),
        }
    }
}

/// Everything a session publishes to its subscribers, in order.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Progress(ProgressEvent),
    StateChanged { state: LifecycleState },
}

/// Outcome of a live health check, mapped onto the exit codes hosts expect.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Active,
    NotStarted,
    Unknown,
    Errored,
    Unhealthy,
    Stopped,
}

impl SessionHealth {
    /// `None` while the session is alive.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            Self::Active => None,
            Self::NotStarted | Self::Unknown => Some(0),
            Self::Errored => Some(1),
            Self::Unhealthy => Some(2),
            Self::Stopped => Some(3),
        }
    }

    pub fn classify(state: ProvisioningState, errors: &[String]) -> Self {
        if state.is_started() {
            Self::Active
        } else if state.is_stopped() {
            Self::Stopped
        } else if state == ProvisioningState::Failed {
            Self::Unhealthy
        } else if !errors.is_empty() {
            Self::Errored
        } else {
            Self::Unknown
        }
    }
}

/// Remote instance name for `identity`: `[-0-9a-zA-Z]` only, starts with a letter,
/// at most 23 characters.
pub fn instance_name(identity: &Identity, suffix: &str) -> String {
    let mut name: String = identity
        .as_str()
        .chars()
        .chain(suffix.chars())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert_str(0, "A-");
    }
    name.truncate(MAX_INSTANCE_NAME_LEN);
    name
}
