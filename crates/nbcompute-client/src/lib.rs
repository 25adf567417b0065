//! Typed access to the remote compute and storage APIs.
//!
//! Nothing in this crate retries or remembers anything: each call maps one request to one
//! response and classifies failures into [`RemoteError`] so callers can decide what is
//! transient.

mod http;

use async_trait::async_trait;
use nbcompute_control_plane::{Identity, InstanceSpec, ResourceDescriptor};

pub use http::{ClientConfig, HttpComputeClient, DEFAULT_REQUEST_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Bad spec, quota exhausted, or otherwise refused. Never retried.
    #[error("remote rejected request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// Network fault, timeout, throttling, or a 5xx.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    /// Create refused because an instance with the same name exists.
    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("storage attach failed: {0}")]
    AttachFailed(String),

    /// The response did not match the expected schema.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// The cloud compute surface the lifecycle controller drives.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Requests creation. Success means the request was accepted, not that the
    /// instance exists yet.
    async fn create(
        &self,
        identity: &Identity,
        spec: &InstanceSpec,
    ) -> Result<ResourceDescriptor, RemoteError>;

    async fn describe(&self, resource_id: &str) -> Result<ResourceDescriptor, RemoteError>;

    /// Looks up the instance carrying `identity`'s deterministic name, if any.
    async fn find_instance(
        &self,
        identity: &Identity,
    ) -> Result<Option<ResourceDescriptor>, RemoteError>;

    /// Asks a stopped instance to start again. Success means the request was accepted.
    async fn start_instance(&self, resource_id: &str) -> Result<(), RemoteError>;

    /// Idempotent: deleting a resource that is already gone succeeds.
    async fn delete(&self, resource_id: &str) -> Result<(), RemoteError>;

    async fn attach_storage(&self, resource_id: &str, share_ref: &str)
    -> Result<(), RemoteError>;
}
