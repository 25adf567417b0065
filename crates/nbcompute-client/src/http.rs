use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nbcompute_control_plane::{
    DEFAULT_ENDPOINT_APPLICATION, DEFAULT_INSTANCE_NAME_SUFFIX, Endpoint, Identity, InstanceSpec,
    ProvisioningState, ResourceDescriptor, instance_name,
};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ComputeApi, RemoteError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    /// Application whose URI becomes the session endpoint.
    pub endpoint_application: String,
    pub instance_name_suffix: String,
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            api_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            endpoint_application: DEFAULT_ENDPOINT_APPLICATION.to_string(),
            instance_name_suffix: DEFAULT_INSTANCE_NAME_SUFFIX.to_string(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let api_base_url = required_non_empty_env("NBCOMPUTE_API_BASE_URL")
            .context("NBCOMPUTE_API_BASE_URL must point at the compute API")?;
        let request_timeout = std::env::var("NBCOMPUTE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs.max(MIN_REQUEST_TIMEOUT_SECS)))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Ok(Self {
            api_base_url,
            api_token: optional_non_empty_env("NBCOMPUTE_API_TOKEN"),
            request_timeout,
            endpoint_application: optional_non_empty_env("NBCOMPUTE_ENDPOINT_APPLICATION")
                .unwrap_or_else(|| DEFAULT_ENDPOINT_APPLICATION.to_string()),
            instance_name_suffix: std::env::var("NBCOMPUTE_INSTANCE_SUFFIX")
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|_| DEFAULT_INSTANCE_NAME_SUFFIX.to_string()),
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateInstanceRequest<'a> {
    name: &'a str,
    identity: &'a str,
    instance_size: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    assigned_user_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct MountRequest<'a> {
    share: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApplicationResponse {
    display_name: String,
    endpoint_uri: String,
}

#[derive(Debug, Deserialize)]
struct InstanceListResponse {
    instances: Vec<InstanceResponse>,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    id: String,
    name: String,
    identity: String,
    provisioning_state: ProvisioningState,
    #[serde(default)]
    endpoint_address: Option<String>,
    #[serde(default)]
    applications: Vec<ApplicationResponse>,
    #[serde(default)]
    errors: Vec<String>,
    created_at: DateTime<Utc>,
}

impl InstanceResponse {
    fn into_descriptor(self, endpoint_application: &str) -> Result<ResourceDescriptor, RemoteError> {
        if self.id.trim().is_empty() {
            return Err(RemoteError::MalformedResponse(
                "instance id is empty".to_string(),
            ));
        }
        let identity = Identity::new(self.identity).map_err(|err| {
            RemoteError::MalformedResponse(format!("instance {}: {err}", self.id))
        })?;

        let mut applications = std::collections::BTreeMap::new();
        for app in self.applications {
            validate_endpoint(&app.endpoint_uri)?;
            applications.insert(app.display_name, app.endpoint_uri);
        }
        let endpoint_address = match applications.get(endpoint_application) {
            Some(uri) => Some(Endpoint::new(uri.clone())),
            None => match self.endpoint_address.as_deref().map(str::trim) {
                Some(raw) if !raw.is_empty() => {
                    validate_endpoint(raw)?;
                    Some(Endpoint::new(raw))
                }
                _ => None,
            },
        };

        Ok(ResourceDescriptor {
            id: self.id,
            name: self.name,
            identity,
            provisioning_state: self.provisioning_state,
            endpoint_address,
            applications,
            errors: self.errors,
            created_at: self.created_at,
        })
    }
}

fn validate_endpoint(raw: &str) -> Result<(), RemoteError> {
    let url = Url::parse(raw)
        .map_err(|err| RemoteError::MalformedResponse(format!("endpoint {raw:?}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RemoteError::MalformedResponse(format!(
            "endpoint {raw:?} is not http(s)"
        )));
    }
    Ok(())
}

/// [`ComputeApi`] over the JSON/HTTP compute service.
#[derive(Debug, Clone)]
pub struct HttpComputeClient {
    client: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
    request_timeout: Duration,
    endpoint_application: String,
    instance_name_suffix: String,
}

impl HttpComputeClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let base_url = config.api_base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            anyhow::bail!("compute API base URL cannot be empty");
        }
        let base_url = Url::parse(&base_url)
            .with_context(|| format!("parse compute API base URL {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("compute API base URL {base_url} cannot carry a path");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_token: config.api_token,
            request_timeout: config.request_timeout,
            endpoint_application: config.endpoint_application,
            instance_name_suffix: config.instance_name_suffix,
        })
    }

    /// `{base}/v1/instances/{segments...}`, each segment percent-encoded.
    fn instances_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["v1", "instances"])
                .extend(segments);
        }
        url
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(self.request_timeout);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        action: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        self.request(builder)
            .send()
            .await
            .map_err(|err| RemoteError::Unavailable(format!("{action}: {err}")))
    }

    async fn decode_instance(
        &self,
        resp: reqwest::Response,
        action: &str,
    ) -> Result<ResourceDescriptor, RemoteError> {
        let text = resp
            .text()
            .await
            .map_err(|err| RemoteError::Unavailable(format!("{action}: read body: {err}")))?;
        let instance: InstanceResponse = serde_json::from_str(&text)
            .map_err(|err| RemoteError::MalformedResponse(format!("{action}: {err}")))?;
        instance.into_descriptor(&self.endpoint_application)
    }

    fn check_identity(
        descriptor: &ResourceDescriptor,
        identity: &Identity,
        action: &str,
    ) -> Result<(), RemoteError> {
        if &descriptor.identity != identity {
            return Err(RemoteError::MalformedResponse(format!(
                "{action} returned identity {} for request {identity}",
                descriptor.identity
            )));
        }
        Ok(())
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let body = resp.text().await.unwrap_or_default();
    let body = body.trim();
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        body.chars().take(MAX_ERROR_BODY_CHARS).collect()
    } else {
        body.to_string()
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

async fn classify_failure(resp: reqwest::Response, action: &str, resource: &str) -> RemoteError {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return RemoteError::NotFound(resource.to_string());
    }
    let body = error_body(resp).await;
    if is_transient_status(status) {
        return RemoteError::Unavailable(format!("{action} failed: {status} {body}"));
    }
    RemoteError::Rejected {
        status: status.as_u16(),
        detail: format!("{action} failed: {body}"),
    }
}

#[async_trait]
impl ComputeApi for HttpComputeClient {
    async fn create(
        &self,
        identity: &Identity,
        spec: &InstanceSpec,
    ) -> Result<ResourceDescriptor, RemoteError> {
        let name = instance_name(identity, &self.instance_name_suffix);
        let body = CreateInstanceRequest {
            name: &name,
            identity: identity.as_str(),
            instance_size: &spec.instance_size,
            image: &spec.image,
            assigned_user_id: spec.assigned_user_id.as_deref(),
        };
        debug!(%identity, instance = %name, size = %spec.instance_size, "creating compute instance");
        let resp = self
            .send(self.client.post(self.instances_url(&[])).json(&body), "create instance")
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(RemoteError::AlreadyExists(name));
        }
        if !resp.status().is_success() {
            return Err(match classify_failure(resp, "create instance", &name).await {
                // A 404 on the collection means the workspace itself is missing.
                RemoteError::NotFound(_) => RemoteError::Rejected {
                    status: StatusCode::NOT_FOUND.as_u16(),
                    detail: "create instance failed: compute workspace not found".to_string(),
                },
                other => other,
            });
        }
        let descriptor = self.decode_instance(resp, "decode create instance").await?;
        Self::check_identity(&descriptor, identity, "create instance")?;
        Ok(descriptor)
    }

    async fn find_instance(
        &self,
        identity: &Identity,
    ) -> Result<Option<ResourceDescriptor>, RemoteError> {
        let name = instance_name(identity, &self.instance_name_suffix);
        let mut url = self.instances_url(&[]);
        url.query_pairs_mut().append_pair("name", &name);
        let resp = self.send(self.client.get(url), "find instance").await?;
        if !resp.status().is_success() {
            return match classify_failure(resp, "find instance", &name).await {
                RemoteError::NotFound(_) => Ok(None),
                other => Err(other),
            };
        }
        let text = resp
            .text()
            .await
            .map_err(|err| RemoteError::Unavailable(format!("find instance: read body: {err}")))?;
        let list: InstanceListResponse = serde_json::from_str(&text)
            .map_err(|err| RemoteError::MalformedResponse(format!("find instance: {err}")))?;
        let Some(found) = list.instances.into_iter().find(|instance| instance.name == name) else {
            return Ok(None);
        };
        let descriptor = found.into_descriptor(&self.endpoint_application)?;
        Self::check_identity(&descriptor, identity, "find instance")?;
        debug!(%identity, resource_id = %descriptor.id, state = %descriptor.provisioning_state, "found existing instance");
        Ok(Some(descriptor))
    }

    async fn start_instance(&self, resource_id: &str) -> Result<(), RemoteError> {
        let url = self.instances_url(&[resource_id, "start"]);
        let resp = self.send(self.client.post(url), "start instance").await?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(classify_failure(resp, "start instance", resource_id).await)
    }

    async fn describe(&self, resource_id: &str) -> Result<ResourceDescriptor, RemoteError> {
        let url = self.instances_url(&[resource_id]);
        let resp = self
            .send(self.client.get(url), "describe instance")
            .await?;
        if !resp.status().is_success() {
            return Err(classify_failure(resp, "describe instance", resource_id).await);
        }
        let descriptor = self.decode_instance(resp, "decode describe instance").await?;
        if descriptor.id != resource_id {
            return Err(RemoteError::MalformedResponse(format!(
                "describe {resource_id} returned instance {}",
                descriptor.id
            )));
        }
        Ok(descriptor)
    }

    async fn delete(&self, resource_id: &str) -> Result<(), RemoteError> {
        let url = self.instances_url(&[resource_id]);
        let resp = self
            .send(self.client.delete(url), "delete instance")
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        match classify_failure(resp, "delete instance", resource_id).await {
            RemoteError::NotFound(_) => {
                debug!(resource_id, "instance already gone");
                Ok(())
            }
            other => Err(other),
        }
    }

    async fn attach_storage(
        &self,
        resource_id: &str,
        share_ref: &str,
    ) -> Result<(), RemoteError> {
        let url = self.instances_url(&[resource_id, "mounts"]);
        let resp = self
            .send(
                self.client.post(url).json(&MountRequest { share: share_ref }),
                "attach storage",
            )
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = error_body(resp).await;
        if is_transient_status(status) {
            return Err(RemoteError::Unavailable(format!(
                "attach storage failed: {status} {body}"
            )));
        }
        Err(RemoteError::AttachFailed(format!(
            "mount {share_ref} on {resource_id}: {status} {body}"
        )))
    }
}

fn required_non_empty_env(key: &str) -> anyhow::Result<String> {
    let value = std::env::var(key).with_context(|| format!("{key} must be set"))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        anyhow::bail!("{key} must be non-empty");
    }
    Ok(trimmed.to_string())
}

fn optional_non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
