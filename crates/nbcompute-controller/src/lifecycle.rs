use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nbcompute_client::{ComputeApi, RemoteError};
use nbcompute_control_plane::{
    Endpoint, Identity, InstanceSpec, LifecycleState, ProgressEvent, ProvisioningState,
    ResourceDescriptor, SessionEvent,
};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::poll::{PollOutcome, Probe, deadline_after, poll_until};

/// Cheap copy of a session's state, readable without taking the machine lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// Start attempts begun so far.
    pub attempt: u64,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            state: LifecycleState::Idle,
            resource_id: None,
            endpoint: None,
            attempt: 0,
        }
    }

    /// The last attempt that had already finished when this snapshot was taken.
    pub fn settled_attempt(&self) -> u64 {
        if self.state.is_starting() {
            self.attempt.saturating_sub(1)
        } else {
            self.attempt
        }
    }
}

/// Why the reachability wait gave up.
enum ReachFailure {
    Gone(String),
    InstanceFailed(String),
    Remote(RemoteError),
}

/// One identity's lifecycle. Callers serialize access; every remote call is
/// made while the owner holds exclusive access.
pub struct LifecycleMachine {
    identity: Identity,
    api: Arc<dyn ComputeApi>,
    config: Arc<ControllerConfig>,
    state: LifecycleState,
    descriptor: Option<ResourceDescriptor>,
    endpoint: Option<Endpoint>,
    attempt: u64,
    started_at: Option<Instant>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl LifecycleMachine {
    pub fn new(
        identity: Identity,
        api: Arc<dyn ComputeApi>,
        config: Arc<ControllerConfig>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::idle());
        Self {
            identity,
            api,
            config,
            state: LifecycleState::Idle,
            descriptor: None,
            endpoint: None,
            attempt: 0,
            started_at: None,
            snapshot,
            events,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.descriptor.as_ref().map(|d| d.id.as_str())
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            resource_id: self.resource_id().map(str::to_string),
            endpoint: self.endpoint.clone(),
            attempt: self.attempt,
        }
    }

    /// Drives the session to `Running` and returns its endpoint.
    ///
    /// Already running: returns the current endpoint without remote calls.
    /// Mid-start (a previous caller went away): resumes where it left off.
    /// Idle, stopped or failed: begins a fresh attempt. `cancel` firing returns
    /// [`ControllerError::Cancelled`] and leaves the state for `stop` to clean up.
    pub async fn advance_to_running(
        &mut self,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, ControllerError> {
        if self.state == LifecycleState::Running {
            if let Some(endpoint) = &self.endpoint {
                return Ok(endpoint.clone());
            }
        }
        if self.state == LifecycleState::Stopping {
            // a stop was interrupted before it finished
            self.stop().await;
        }
        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }
        if !self.state.is_starting() {
            self.begin_attempt().await;
        }

        match self.provision(spec, cancel).await {
            Ok(endpoint) => Ok(endpoint),
            Err(err) => {
                match err.failure_reason() {
                    Some(reason) => {
                        warn!(
                            identity = %self.identity,
                            attempt = self.attempt,
                            resource_id = self.resource_id().unwrap_or("-"),
                            error = %reason,
                            "session start failed"
                        );
                        self.transition(LifecycleState::Failed(reason));
                    }
                    None => info!(
                        identity = %self.identity,
                        state = self.state.name(),
                        "session start cancelled"
                    ),
                }
                Err(err)
            }
        }
    }

    /// Tears the session down to `Stopped`. Never fails: remote errors are logged
    /// and the local state still reaches `Stopped`.
    pub async fn stop(&mut self) {
        if matches!(self.state, LifecycleState::Idle | LifecycleState::Stopped) {
            debug!(identity = %self.identity, state = self.state.name(), "nothing to stop");
            return;
        }
        if self.state != LifecycleState::Stopping {
            self.transition(LifecycleState::Stopping);
        }
        if let Some(resource_id) = self.resource_id().map(str::to_string) {
            self.teardown(&resource_id).await;
        }
        self.descriptor = None;
        self.started_at = None;
        self.transition(LifecycleState::Stopped);
    }

    async fn begin_attempt(&mut self) {
        if let Some(stale) = self.descriptor.take() {
            // left behind by a failed attempt
            if let Err(err) = self.api.delete(&stale.id).await {
                warn!(
                    identity = %self.identity,
                    resource_id = %stale.id,
                    error = %err,
                    "failed to delete stale instance"
                );
            }
        }
        self.endpoint = None;
        self.attempt += 1;
        self.started_at = Some(Instant::now());
        info!(identity = %self.identity, attempt = self.attempt, "starting session");
        self.transition(LifecycleState::Provisioning);
        self.progress("Initializing session", 0);
    }

    async fn provision(
        &mut self,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, ControllerError> {
        let deadline = self.deadline();
        if self.state == LifecycleState::Provisioning {
            if self.descriptor.is_none() {
                self.progress("Creating compute instance", 15);
                self.create_instance(spec, cancel, deadline).await?;
                self.progress("Compute instance created", 20);
            }
            self.attach_storage(spec, cancel, deadline).await?;
            self.transition(LifecycleState::WaitingReachable);
        }
        self.await_reachable(spec, cancel, deadline).await
    }

    fn deadline(&self) -> Instant {
        deadline_after(
            self.started_at.unwrap_or_else(Instant::now),
            self.config.poll.provisioning_deadline,
        )
    }

    async fn create_instance(
        &mut self,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), ControllerError> {
        let api = &*self.api;
        let identity = &self.identity;
        let outcome = poll_until(&self.config.poll.backoff, deadline, cancel, |_| async move {
            match api.create(identity, spec).await {
                Ok(descriptor) => Probe::Ready((descriptor, false)),
                // an earlier create was accepted but its response never arrived,
                // or a previous process left the instance behind
                Err(RemoteError::AlreadyExists(name)) => match api.find_instance(identity).await {
                    Ok(Some(existing)) => Probe::Ready((existing, true)),
                    Ok(None) => Probe::Retry(format!("instance {name} exists but is not listed")),
                    Err(err) => remote_probe(Err(err)),
                },
                Err(err) => remote_probe(Err(err)),
            }
        })
        .await;
        let (descriptor, adopted) = settle(outcome, "create")?;

        info!(
            identity = %self.identity,
            resource_id = %descriptor.id,
            name = %descriptor.name,
            state = %descriptor.provisioning_state,
            adopted,
            "compute instance accepted"
        );
        self.descriptor = Some(descriptor);
        self.publish();
        // a stop arriving mid-create still needs the id for cleanup
        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }
        Ok(())
    }

    async fn attach_storage(
        &mut self,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), ControllerError> {
        let Some(share_ref) = spec.share_ref.as_deref() else {
            return Ok(());
        };
        let resource_id = self.require_resource_id()?;
        self.progress("Attaching storage", 25);

        let api = &*self.api;
        let id = resource_id.as_str();
        let outcome = poll_until(&self.config.poll.backoff, deadline, cancel, |_| async move {
            remote_probe(api.attach_storage(id, share_ref).await)
        })
        .await;
        settle(outcome, "storage attach")?;
        debug!(identity = %self.identity, resource_id = %resource_id, share_ref, "storage attached");
        Ok(())
    }

    async fn await_reachable(
        &mut self,
        spec: &InstanceSpec,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Endpoint, ControllerError> {
        let mut recreated = false;
        loop {
            let resource_id = self.require_resource_id()?;
            let outcome = self.poll_reachable(&resource_id, cancel, deadline).await;

            match outcome {
                PollOutcome::Ready((descriptor, endpoint)) => {
                    info!(
                        identity = %self.identity,
                        resource_id = %descriptor.id,
                        endpoint = %endpoint,
                        "notebook server reachable"
                    );
                    self.descriptor = Some(descriptor);
                    self.endpoint = Some(endpoint.clone());
                    self.transition(LifecycleState::Running);
                    self.progress("Notebook server ready", 100);
                    return Ok(endpoint);
                }
                PollOutcome::Failed(ReachFailure::Gone(message)) if !recreated => {
                    warn!(
                        identity = %self.identity,
                        resource_id = %resource_id,
                        %message,
                        "instance vanished while starting; recreating once"
                    );
                    recreated = true;
                    self.descriptor = None;
                    self.publish();
                    self.create_instance(spec, cancel, deadline).await?;
                    self.attach_storage(spec, cancel, deadline).await?;
                }
                PollOutcome::Failed(ReachFailure::Gone(message)) => {
                    return Err(ControllerError::NotFound(message));
                }
                PollOutcome::Failed(ReachFailure::InstanceFailed(message)) => {
                    return Err(ControllerError::InstanceFailed(message));
                }
                PollOutcome::Failed(ReachFailure::Remote(err)) => return Err(err.into()),
                PollOutcome::Timeout {
                    attempts,
                    last_error,
                } => return Err(timeout_error("reachability wait", attempts, last_error)),
                PollOutcome::Cancelled { .. } => return Err(ControllerError::Cancelled),
            }
        }
    }

    async fn poll_reachable(
        &self,
        resource_id: &str,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> PollOutcome<(ResourceDescriptor, Endpoint), ReachFailure> {
        let api = &*self.api;
        let events = &self.events;
        let identity = &self.identity;
        let window = self.config.progress_window;
        let waiting_since = Instant::now();
        let restart_requested = &AtomicBool::new(false);

        poll_until(&self.config.poll.backoff, deadline, cancel, |attempt| async move {
            let progress = reachability_progress(waiting_since.elapsed(), window);
            let _ = events.send(SessionEvent::Progress(ProgressEvent::new(
                "Waiting for notebook server",
                progress,
            )));

            let descriptor = match api.describe(resource_id).await {
                Ok(descriptor) => descriptor,
                Err(RemoteError::NotFound(message)) => {
                    return Probe::Fail(ReachFailure::Gone(message));
                }
                Err(err) if err.is_transient() => return Probe::Retry(err.to_string()),
                Err(err) => return Probe::Fail(ReachFailure::Remote(err)),
            };
            debug!(
                identity = %identity,
                resource_id,
                attempt = attempt.attempt_number,
                state = %descriptor.provisioning_state,
                "polled instance"
            );

            match descriptor.provisioning_state {
                ProvisioningState::Running => match descriptor.reachable_endpoint().cloned() {
                    Some(endpoint) => Probe::Ready((descriptor, endpoint)),
                    None => Probe::Pending,
                },
                ProvisioningState::Failed => Probe::Fail(ReachFailure::InstanceFailed(
                    describe_errors(&descriptor),
                )),
                ProvisioningState::Deleting | ProvisioningState::Deleted => {
                    Probe::Fail(ReachFailure::Gone(format!("instance {resource_id} was deleted")))
                }
                ProvisioningState::Stopped => {
                    if restart_requested.swap(true, Ordering::SeqCst) {
                        return Probe::Pending;
                    }
                    info!(identity = %identity, resource_id, "starting stopped instance");
                    match api.start_instance(resource_id).await {
                        Ok(()) => Probe::Pending,
                        Err(RemoteError::NotFound(message)) => {
                            Probe::Fail(ReachFailure::Gone(message))
                        }
                        Err(err) if err.is_transient() => {
                            restart_requested.store(false, Ordering::SeqCst);
                            Probe::Retry(err.to_string())
                        }
                        Err(err) => Probe::Fail(ReachFailure::Remote(err)),
                    }
                }
                ProvisioningState::Stopping
                | ProvisioningState::Creating
                | ProvisioningState::Updating
                | ProvisioningState::Starting => Probe::Pending,
            }
        })
        .await
    }

    /// Deletes `resource_id` and waits for it to disappear, within the teardown deadline.
    async fn teardown(&self, resource_id: &str) {
        let deadline = deadline_after(Instant::now(), self.config.poll.teardown_deadline);
        let backoff = &self.config.poll.backoff;
        let uncancellable = CancellationToken::new();
        let api = &*self.api;

        let deleted = poll_until(backoff, deadline, &uncancellable, |_| async move {
            remote_probe(api.delete(resource_id).await)
        })
        .await;
        match deleted {
            PollOutcome::Ready(()) => {
                info!(identity = %self.identity, resource_id, "instance delete accepted")
            }
            PollOutcome::Failed(err) => {
                warn!(identity = %self.identity, resource_id, error = %err, "instance delete failed");
                return;
            }
            PollOutcome::Timeout { last_error, .. } => {
                warn!(
                    identity = %self.identity,
                    resource_id,
                    last_error = last_error.as_deref().unwrap_or("-"),
                    "instance delete did not complete before the teardown deadline"
                );
                return;
            }
            PollOutcome::Cancelled { .. } => return,
        }

        let gone = poll_until(backoff, deadline, &uncancellable, |_| async move {
            match api.describe(resource_id).await {
                Ok(d) if d.provisioning_state == ProvisioningState::Deleted => Probe::Ready(()),
                Ok(_) => Probe::Pending,
                Err(RemoteError::NotFound(_)) => Probe::Ready(()),
                Err(err) if err.is_transient() => Probe::Retry(err.to_string()),
                Err(err) => Probe::Fail(err),
            }
        })
        .await;
        match gone {
            PollOutcome::Ready(()) => debug!(identity = %self.identity, resource_id, "instance gone"),
            PollOutcome::Failed(err) => {
                warn!(identity = %self.identity, resource_id, error = %err, "could not confirm instance deletion")
            }
            PollOutcome::Timeout { .. } | PollOutcome::Cancelled { .. } => warn!(
                identity = %self.identity,
                resource_id,
                "instance still present at the teardown deadline"
            ),
        }
    }

    fn require_resource_id(&self) -> Result<String, ControllerError> {
        self.resource_id().map(str::to_string).ok_or_else(|| {
            ControllerError::NotFound(format!("no instance recorded for {}", self.identity))
        })
    }

    fn transition(&mut self, next: LifecycleState) {
        if !self.state.can_transition_to(&next) {
            warn!(
                identity = %self.identity,
                from = self.state.name(),
                to = next.name(),
                "ignoring invalid lifecycle transition"
            );
            return;
        }
        debug!(
            identity = %self.identity,
            from = self.state.name(),
            to = next.name(),
            "lifecycle transition"
        );
        if next != LifecycleState::Running {
            self.endpoint = None;
        }
        self.state = next;
        self.publish();
        let _ = self.events.send(SessionEvent::StateChanged {
            state: self.state.clone(),
        });
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.snapshot());
    }

    fn progress(&self, message: &str, progress: u8) {
        debug!(identity = %self.identity, progress, message, "session progress");
        let _ = self
            .events
            .send(SessionEvent::Progress(ProgressEvent::new(message, progress)));
    }
}

fn remote_probe<T>(result: Result<T, RemoteError>) -> Probe<T, RemoteError> {
    match result {
        Ok(value) => Probe::Ready(value),
        Err(err) if err.is_transient() => Probe::Retry(err.to_string()),
        Err(err) => Probe::Fail(err),
    }
}

fn settle<T>(outcome: PollOutcome<T, RemoteError>, what: &str) -> Result<T, ControllerError> {
    match outcome {
        PollOutcome::Ready(value) => Ok(value),
        PollOutcome::Failed(err) => Err(err.into()),
        PollOutcome::Timeout {
            attempts,
            last_error,
        } => Err(timeout_error(what, attempts, last_error)),
        PollOutcome::Cancelled { .. } => Err(ControllerError::Cancelled),
    }
}

fn timeout_error(what: &str, attempts: u32, last_error: Option<String>) -> ControllerError {
    ControllerError::Timeout(match last_error {
        Some(err) => format!("{what} gave up after {attempts} attempts; last error: {err}"),
        None => format!("{what} gave up after {attempts} attempts"),
    })
}

fn describe_errors(descriptor: &ResourceDescriptor) -> String {
    if descriptor.errors.is_empty() {
        format!("instance {} reported failed", descriptor.id)
    } else {
        descriptor.errors.join("; ")
    }
}

/// 30% when the wait begins, climbing linearly to 70% over `window`.
fn reachability_progress(elapsed: std::time::Duration, window: std::time::Duration) -> u8 {
    if window.is_zero() {
        return 70;
    }
    let fraction = (elapsed.as_secs_f64() / window.as_secs_f64()).min(1.0);
    30 + (fraction * 40.0).round() as u8
}
