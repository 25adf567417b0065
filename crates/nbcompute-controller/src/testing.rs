//! Scripted in-memory compute API for controller tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nbcompute_client::{ComputeApi, RemoteError};
use nbcompute_control_plane::{
    DEFAULT_INSTANCE_NAME_SUFFIX, Endpoint, Identity, InstanceSpec, ProvisioningState,
    ResourceDescriptor, instance_name,
};
use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub(crate) enum Describe {
    State(ProvisioningState),
    Error(RemoteError),
}

struct Script {
    create: VecDeque<Result<(), RemoteError>>,
    describe: VecDeque<Describe>,
    describe_default: Describe,
    attach: VecDeque<Result<(), RemoteError>>,
    delete: VecDeque<Result<(), RemoteError>>,
    start: VecDeque<Result<(), RemoteError>>,
    identities: BTreeMap<String, Identity>,
    deleted: HashSet<String>,
    next_id: usize,
    calls: Vec<String>,
}

/// Replays queued results per operation, falling back to success (and a running
/// instance for `describe`) once a queue is drained. Deleted ids describe as
/// `NotFound`.
pub(crate) struct ScriptedCompute {
    script: Mutex<Script>,
}

impl ScriptedCompute {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                create: VecDeque::new(),
                describe: VecDeque::new(),
                describe_default: Describe::State(ProvisioningState::Running),
                attach: VecDeque::new(),
                delete: VecDeque::new(),
                start: VecDeque::new(),
                identities: BTreeMap::new(),
                deleted: HashSet::new(),
                next_id: 0,
                calls: Vec::new(),
            }),
        })
    }

    pub(crate) fn script_create(&self, results: impl IntoIterator<Item = Result<(), RemoteError>>) {
        self.script.lock().create.extend(results);
    }

    pub(crate) fn script_describe(&self, results: impl IntoIterator<Item = Describe>) {
        self.script.lock().describe.extend(results);
    }

    pub(crate) fn describe_default(&self, default: Describe) {
        self.script.lock().describe_default = default;
    }

    pub(crate) fn script_attach(&self, results: impl IntoIterator<Item = Result<(), RemoteError>>) {
        self.script.lock().attach.extend(results);
    }

    pub(crate) fn script_delete(&self, results: impl IntoIterator<Item = Result<(), RemoteError>>) {
        self.script.lock().delete.extend(results);
    }

    pub(crate) fn script_start(&self, results: impl IntoIterator<Item = Result<(), RemoteError>>) {
        self.script.lock().start.extend(results);
    }

    /// Registers an instance the controller did not create, as if left behind by
    /// a lost create response or an earlier process. Returns its id.
    pub(crate) fn seed_instance(&self, identity: &Identity) -> String {
        let mut script = self.script.lock();
        script.next_id += 1;
        let id = format!("ci-{}", script.next_id);
        script.identities.insert(id.clone(), identity.clone());
        id
    }

    /// Number of recorded calls to `op` (`create`, `find`, `describe`, `start`,
    /// `delete`, `attach`).
    pub(crate) fn calls(&self, op: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    pub(crate) fn deletes_of(&self, resource_id: &str) -> usize {
        let expected = format!("delete {resource_id}");
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| **call == expected)
            .count()
    }

    fn descriptor(id: &str, identity: &Identity, state: ProvisioningState) -> ResourceDescriptor {
        ResourceDescriptor {
            id: id.to_string(),
            name: instance_name(identity, DEFAULT_INSTANCE_NAME_SUFFIX),
            identity: identity.clone(),
            provisioning_state: state,
            endpoint_address: (state == ProvisioningState::Running)
                .then(|| endpoint_for(id)),
            applications: BTreeMap::new(),
            errors: if state == ProvisioningState::Failed {
                vec!["image pull failed".to_string()]
            } else {
                Vec::new()
            },
            created_at: Utc::now(),
        }
    }
}

pub(crate) fn endpoint_for(resource_id: &str) -> Endpoint {
    Endpoint::new(format!("https://{resource_id}.compute.test/lab"))
}

#[async_trait]
impl ComputeApi for ScriptedCompute {
    async fn create(
        &self,
        identity: &Identity,
        _spec: &InstanceSpec,
    ) -> Result<ResourceDescriptor, RemoteError> {
        let result = {
            let mut script = self.script.lock();
            script.calls.push("create".to_string());
            match script.create.pop_front().unwrap_or(Ok(())) {
                Ok(()) => {
                    script.next_id += 1;
                    let id = format!("ci-{}", script.next_id);
                    script.identities.insert(id.clone(), identity.clone());
                    Ok(Self::descriptor(&id, identity, ProvisioningState::Creating))
                }
                Err(err) => Err(err),
            }
        };
        tokio::task::yield_now().await;
        result
    }

    async fn describe(&self, resource_id: &str) -> Result<ResourceDescriptor, RemoteError> {
        let result = {
            let mut script = self.script.lock();
            script.calls.push(format!("describe {resource_id}"));
            let identity = script.identities.get(resource_id).cloned();
            match identity {
                None => Err(RemoteError::NotFound(format!("instance {resource_id}"))),
                Some(_) if script.deleted.contains(resource_id) => {
                    Err(RemoteError::NotFound(format!("instance {resource_id}")))
                }
                Some(identity) => {
                    let next = script
                        .describe
                        .pop_front()
                        .unwrap_or_else(|| script.describe_default.clone());
                    match next {
                        Describe::State(state) => Ok(Self::descriptor(resource_id, &identity, state)),
                        Describe::Error(err) => Err(err),
                    }
                }
            }
        };
        tokio::task::yield_now().await;
        result
    }

    async fn find_instance(
        &self,
        identity: &Identity,
    ) -> Result<Option<ResourceDescriptor>, RemoteError> {
        let found = {
            let mut script = self.script.lock();
            script.calls.push(format!("find {identity}"));
            script
                .identities
                .iter()
                .rev()
                .find(|(id, owner)| *owner == identity && !script.deleted.contains(*id))
                .map(|(id, owner)| Self::descriptor(id, owner, ProvisioningState::Creating))
        };
        tokio::task::yield_now().await;
        Ok(found)
    }

    async fn start_instance(&self, resource_id: &str) -> Result<(), RemoteError> {
        let result = {
            let mut script = self.script.lock();
            script.calls.push(format!("start {resource_id}"));
            script.start.pop_front().unwrap_or(Ok(()))
        };
        tokio::task::yield_now().await;
        result
    }

    async fn delete(&self, resource_id: &str) -> Result<(), RemoteError> {
        let result = {
            let mut script = self.script.lock();
            script.calls.push(format!("delete {resource_id}"));
            let result = script.delete.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                script.deleted.insert(resource_id.to_string());
            }
            result
        };
        tokio::task::yield_now().await;
        result
    }

    async fn attach_storage(&self, resource_id: &str, _share_ref: &str) -> Result<(), RemoteError> {
        let result = {
            let mut script = self.script.lock();
            script.calls.push(format!("attach {resource_id}"));
            script.attach.pop_front().unwrap_or(Ok(()))
        };
        tokio::task::yield_now().await;
        result
    }
}
