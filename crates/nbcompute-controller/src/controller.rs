use std::sync::Arc;

use futures::future::join_all;
use nbcompute_client::{ComputeApi, RemoteError};
use nbcompute_control_plane::{
    Endpoint, Identity, InstanceSpec, InstanceSpecOverride, LifecycleState, SessionEvent,
    SessionHealth,
};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::lifecycle::SessionSnapshot;
use crate::registry::{SessionEntry, SessionRegistry};

/// Host-facing entry point: start, stop and observe per-identity notebook sessions.
///
/// Operations on one identity are serialized; different identities never wait on
/// each other.
pub struct Controller {
    api: Arc<dyn ComputeApi>,
    config: Arc<ControllerConfig>,
    registry: SessionRegistry,
}

impl Controller {
    pub fn new(api: Arc<dyn ComputeApi>, config: ControllerConfig) -> Self {
        let config = Arc::new(config.normalized());
        Self {
            registry: SessionRegistry::new(api.clone(), config.clone()),
            api,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Blocks until the session is running and returns its endpoint.
    ///
    /// Concurrent callers for the same identity share one attempt: whoever queues
    /// behind an in-flight start gets its endpoint or its failure.
    pub async fn start(
        &self,
        identity: &Identity,
        overrides: Option<&InstanceSpecOverride>,
    ) -> Result<Endpoint, ControllerError> {
        let spec = self.resolve_spec(overrides);
        loop {
            let entry = self.registry.get_or_create(identity);
            entry.touch();
            let cancel = entry.cancel_token();
            let settled = entry.snapshot().settled_attempt();

            let mut machine = entry.lock().await;
            if entry.is_retired() {
                continue;
            }
            if let LifecycleState::Failed(reason) = machine.state() {
                if machine.attempt() > settled {
                    debug!(identity = %identity, "joining failed attempt");
                    return Err(reason.clone().into());
                }
            }
            let result = machine.advance_to_running(&spec, &cancel).await;
            drop(machine);
            entry.touch();
            return result;
        }
    }

    /// Drives the session to `Stopped`, cancelling any start in flight. Unknown
    /// identities and already-stopped sessions are a no-op.
    pub async fn stop(&self, identity: &Identity) {
        let Some(entry) = self.registry.get(identity) else {
            debug!(identity = %identity, "stop for unknown session");
            return;
        };
        entry.cancel_in_flight();
        let mut machine = entry.lock().await;
        if !entry.is_retired() {
            machine.stop().await;
        }
    }

    /// Stops every registered session concurrently.
    pub async fn stop_all(&self) {
        let entries = self.registry.entries();
        info!(sessions = entries.len(), "stopping all sessions");
        join_all(entries.iter().map(|entry| self.stop(entry.identity()))).await;
    }

    /// Current state without waiting on any in-flight operation; `Idle` for
    /// identities the registry does not know.
    pub fn status(&self, identity: &Identity) -> LifecycleState {
        self.snapshot(identity)
            .map(|snapshot| snapshot.state)
            .unwrap_or(LifecycleState::Idle)
    }

    pub fn snapshot(&self, identity: &Identity) -> Option<SessionSnapshot> {
        self.registry.get(identity).map(|entry| entry.snapshot())
    }

    /// Records activity for the idle sweep. Returns false for unknown identities.
    pub fn touch(&self, identity: &Identity) -> bool {
        match self.registry.get(identity) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Progress and state-change events for `identity`. Registers an idle session
    /// if none exists so a subscriber can attach before calling `start`.
    pub fn subscribe_events(&self, identity: &Identity) -> broadcast::Receiver<SessionEvent> {
        self.registry.get_or_create(identity).subscribe()
    }

    /// Live check of the remote instance behind `identity`.
    pub async fn health(&self, identity: &Identity) -> SessionHealth {
        let Some(resource_id) = self.snapshot(identity).and_then(|s| s.resource_id) else {
            return SessionHealth::NotStarted;
        };
        match self.api.describe(&resource_id).await {
            Ok(descriptor) => {
                SessionHealth::classify(descriptor.provisioning_state, &descriptor.errors)
            }
            Err(RemoteError::NotFound(_)) => SessionHealth::Stopped,
            Err(err) => {
                warn!(identity = %identity, resource_id = %resource_id, error = %err, "health check failed");
                SessionHealth::Unknown
            }
        }
    }

    /// One pass of the idle sweep. Running (and failed) sessions idle past the
    /// timeout are stopped; idle and stopped ones are dropped from the registry.
    /// Returns how many sessions were stopped.
    pub async fn sweep_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let mut stale = Vec::new();
        for entry in self.registry.entries() {
            if entry.idle_for() < timeout {
                continue;
            }
            match entry.snapshot().state {
                LifecycleState::Running | LifecycleState::Failed(_) => stale.push(entry),
                LifecycleState::Idle | LifecycleState::Stopped => self.reap(&entry),
                _ => {}
            }
        }

        let stopped = join_all(stale.iter().map(|entry| self.stop_idle(entry))).await;
        stopped.into_iter().filter(|stopped| *stopped).count()
    }

    /// Runs [`Controller::sweep_idle`] every `idle_sweep_interval` until `shutdown` fires.
    pub async fn run_idle_sweeper(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.idle_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let stopped = self.sweep_idle().await;
                    if stopped > 0 {
                        info!(stopped, "idle sweep stopped sessions");
                    }
                }
            }
        }
        debug!("idle sweeper exiting");
    }

    async fn stop_idle(&self, entry: &Arc<SessionEntry>) -> bool {
        let mut machine = entry.lock().await;
        let idle_for = entry.idle_for();
        if entry.is_retired() || idle_for < self.config.idle_timeout {
            return false;
        }
        if !matches!(
            machine.state(),
            LifecycleState::Running | LifecycleState::Failed(_)
        ) {
            return false;
        }
        info!(
            identity = %entry.identity(),
            idle_secs = idle_for.as_secs(),
            "stopping idle session"
        );
        machine.stop().await;
        true
    }

    fn reap(&self, entry: &Arc<SessionEntry>) {
        // busy entries are picked up by a later sweep
        let Some(machine) = entry.try_lock() else {
            return;
        };
        if entry.idle_for() >= self.config.idle_timeout && self.registry.remove(entry, &machine) {
            debug!(identity = %entry.identity(), "reaped idle session");
        }
    }

    fn resolve_spec(&self, overrides: Option<&InstanceSpecOverride>) -> InstanceSpec {
        match overrides {
            Some(overrides) => overrides.apply(&self.config.instance),
            None => self.config.instance.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Describe, ScriptedCompute, endpoint_for};
    use nbcompute_control_plane::{FailureKind, ProvisioningState};
    use std::time::Duration;
    use tokio::time::Instant;

    fn identity(raw: &str) -> Identity {
        Identity::new(raw).expect("valid identity")
    }

    fn controller(api: &Arc<ScriptedCompute>) -> Controller {
        controller_with(api, ControllerConfig::default())
    }

    fn controller_with(api: &Arc<ScriptedCompute>, config: ControllerConfig) -> Controller {
        Controller::new(api.clone(), config)
    }

    fn drain_states(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<LifecycleState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged { state } = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_create_once() {
        let api = ScriptedCompute::new();
        let controller = controller(&api);
        let alice = identity("alice");

        let (first, second) = tokio::join!(
            controller.start(&alice, None),
            controller.start(&alice, None)
        );
        assert_eq!(first, Ok(endpoint_for("ci-1")));
        assert_eq!(second, Ok(endpoint_for("ci-1")));
        assert_eq!(api.calls("create"), 1);
        assert_eq!(controller.status(&alice), LifecycleState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_share_a_failed_attempt() {
        let api = ScriptedCompute::new();
        api.script_create([Err(RemoteError::Rejected {
            status: 403,
            detail: "quota exceeded".to_string(),
        })]);
        let controller = controller(&api);
        let alice = identity("alice");

        let (first, second) = tokio::join!(
            controller.start(&alice, None),
            controller.start(&alice, None)
        );
        let expected = ControllerError::RemoteRejected("403: quota exceeded".to_string());
        assert_eq!(first, Err(expected.clone()));
        assert_eq!(second, Err(expected));
        assert_eq!(api.calls("create"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_walks_through_states_and_returns_endpoint() {
        let api = ScriptedCompute::new();
        api.script_describe([
            Describe::State(ProvisioningState::Creating),
            Describe::State(ProvisioningState::Creating),
        ]);
        let controller = controller(&api);
        let alice = identity("alice");
        let mut events = controller.subscribe_events(&alice);
        let started = Instant::now();

        let endpoint = controller.start(&alice, None).await.expect("start succeeds");

        assert_eq!(endpoint, endpoint_for("ci-1"));
        assert_eq!(
            drain_states(&mut events),
            vec![
                LifecycleState::Provisioning,
                LifecycleState::WaitingReachable,
                LifecycleState::Running,
            ]
        );
        assert_eq!(api.calls("describe"), 3);
        // describe at 0s, 2s and 6s
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        let snapshot = controller.snapshot(&alice).expect("registered");
        assert_eq!(snapshot.resource_id.as_deref(), Some("ci-1"));
        assert_eq!(snapshot.endpoint, Some(endpoint));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_events_climb_to_ready() {
        let api = ScriptedCompute::new();
        api.script_describe([Describe::State(ProvisioningState::Starting)]);
        let controller = controller(&api);
        let alice = identity("alice");
        let mut events = controller.subscribe_events(&alice);

        controller.start(&alice, None).await.expect("start succeeds");

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Progress(event) = event {
                progress.push(event.progress);
            }
        }
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(progress.contains(&30));
    }

    #[tokio::test(start_paused = true)]
    async fn never_running_times_out_and_fails() {
        let api = ScriptedCompute::new();
        api.describe_default(Describe::State(ProvisioningState::Creating));
        let mut config = ControllerConfig::default();
        config.poll.provisioning_deadline = Duration::from_secs(60);
        let controller = controller_with(&api, config);
        let alice = identity("alice");
        let started = Instant::now();

        let result = controller.start(&alice, None).await;

        assert!(matches!(result, Err(ControllerError::Timeout(_))), "{result:?}");
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        match controller.status(&alice) {
            LifecycleState::Failed(reason) => assert_eq!(reason.kind, FailureKind::Timeout),
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_instance_is_recreated_once() {
        let api = ScriptedCompute::new();
        api.script_describe([Describe::Error(RemoteError::NotFound("ci-1".to_string()))]);
        let controller = controller(&api);
        let alice = identity("alice");

        let endpoint = controller.start(&alice, None).await.expect("recreated");

        assert_eq!(endpoint, endpoint_for("ci-2"));
        assert_eq!(api.calls("create"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_disappearance_fails_with_not_found() {
        let api = ScriptedCompute::new();
        api.script_describe([
            Describe::Error(RemoteError::NotFound("ci-1".to_string())),
            Describe::Error(RemoteError::NotFound("ci-2".to_string())),
        ]);
        let controller = controller(&api);
        let alice = identity("alice");

        let result = controller.start(&alice, None).await;

        assert_eq!(result, Err(ControllerError::NotFound("ci-2".to_string())));
        assert_eq!(api.calls("create"), 2);
        assert!(matches!(
            controller.status(&alice),
            LifecycleState::Failed(reason) if reason.kind == FailureKind::NotFound
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_instance_failure_is_terminal() {
        let api = ScriptedCompute::new();
        api.script_describe([Describe::State(ProvisioningState::Failed)]);
        let controller = controller(&api);
        let alice = identity("alice");

        let result = controller.start(&alice, None).await;

        assert_eq!(
            result,
            Err(ControllerError::InstanceFailed("image pull failed".to_string()))
        );
        assert_eq!(api.calls("describe"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_create_errors_are_retried() {
        let api = ScriptedCompute::new();
        api.script_create([
            Err(RemoteError::Unavailable("503".to_string())),
            Err(RemoteError::Unavailable("timeout".to_string())),
        ]);
        let controller = controller(&api);
        let alice = identity("alice");

        let endpoint = controller.start(&alice, None).await.expect("start succeeds");

        assert_eq!(endpoint, endpoint_for("ci-1"));
        assert_eq!(api.calls("create"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_failure_is_hard() {
        let api = ScriptedCompute::new();
        api.script_attach([Err(RemoteError::AttachFailed("share missing".to_string()))]);
        let controller = controller(&api);
        let alice = identity("alice");
        let overrides = InstanceSpecOverride {
            share_ref: Some("files/home".to_string()),
            ..InstanceSpecOverride::default()
        };

        let result = controller.start(&alice, Some(&overrides)).await;

        assert_eq!(
            result,
            Err(ControllerError::AttachFailed("share missing".to_string()))
        );
        assert_eq!(api.calls("attach"), 1);
        assert_eq!(api.calls("describe"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_failure_cleans_up_stale_instance() {
        let api = ScriptedCompute::new();
        api.script_describe([Describe::State(ProvisioningState::Failed)]);
        let controller = controller(&api);
        let alice = identity("alice");

        assert!(controller.start(&alice, None).await.is_err());
        let endpoint = controller.start(&alice, None).await.expect("fresh attempt");

        assert_eq!(endpoint, endpoint_for("ci-2"));
        assert_eq!(api.deletes_of("ci-1"), 1);
        assert_eq!(controller.snapshot(&alice).map(|s| s.attempt), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let api = ScriptedCompute::new();
        let controller = controller(&api);
        let alice = identity("alice");

        controller.stop(&alice).await;
        assert_eq!(api.calls("delete"), 0);
        assert_eq!(controller.status(&alice), LifecycleState::Idle);

        controller.start(&alice, None).await.expect("start succeeds");
        controller.stop(&alice).await;
        controller.stop(&alice).await;

        assert_eq!(controller.status(&alice), LifecycleState::Stopped);
        assert_eq!(api.deletes_of("ci-1"), 1);
        assert_eq!(api.calls("delete"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_timeout_deletes_partial_instance() {
        let api = ScriptedCompute::new();
        api.describe_default(Describe::State(ProvisioningState::Creating));
        let mut config = ControllerConfig::default();
        config.poll.provisioning_deadline = Duration::from_secs(30);
        let controller = controller_with(&api, config);
        let alice = identity("alice");

        assert!(controller.start(&alice, None).await.is_err());
        controller.stop(&alice).await;

        assert_eq!(api.deletes_of("ci-1"), 1);
        assert_eq!(controller.status(&alice), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_start_in_flight() {
        let api = ScriptedCompute::new();
        api.script_attach((0..100).map(|_| Err(RemoteError::Unavailable("503".to_string()))));
        let mut config = ControllerConfig::default();
        config.instance.share_ref = Some("files/home".to_string());
        let controller = Arc::new(controller_with(&api, config));
        let alice = identity("alice");

        let starter = {
            let controller = controller.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                let result = controller.start(&alice, None).await;
                (result, Instant::now())
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.status(&alice), LifecycleState::Provisioning);

        let stop_requested = Instant::now();
        controller.stop(&alice).await;
        let (result, finished) = starter.await.expect("start task");

        assert_eq!(result, Err(ControllerError::Cancelled));
        assert!(finished.duration_since(stop_requested) <= Duration::from_secs(2));
        assert_eq!(api.deletes_of("ci-1"), 1);
        assert_eq!(controller.status(&alice), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_stop_provisions_again() {
        let api = ScriptedCompute::new();
        let controller = controller(&api);
        let alice = identity("alice");

        controller.start(&alice, None).await.expect("first start");
        controller.stop(&alice).await;
        let endpoint = controller.start(&alice, None).await.expect("second start");

        assert_eq!(endpoint, endpoint_for("ci-2"));
        assert_eq!(controller.status(&alice), LifecycleState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_stops_inactive_sessions() {
        let api = ScriptedCompute::new();
        let mut config = ControllerConfig::default();
        config.idle_timeout = Duration::from_secs(600);
        let controller = controller_with(&api, config);
        let alice = identity("alice");
        let bob = identity("bob");

        controller.start(&alice, None).await.expect("alice starts");
        controller.start(&bob, None).await.expect("bob starts");
        tokio::time::advance(Duration::from_secs(400)).await;
        assert!(controller.touch(&bob));
        tokio::time::advance(Duration::from_secs(201)).await;

        assert_eq!(controller.sweep_idle().await, 1);
        assert_eq!(controller.status(&alice), LifecycleState::Stopped);
        assert_eq!(controller.status(&bob), LifecycleState::Running);

        // stopped sessions are forgotten once they have been idle a full timeout
        tokio::time::advance(Duration::from_secs(601)).await;
        controller.touch(&bob);
        assert_eq!(controller.sweep_idle().await, 0);
        assert!(controller.snapshot(&alice).is_none());
        assert_eq!(controller.status(&alice), LifecycleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn health_reflects_remote_state() {
        let api = ScriptedCompute::new();
        let controller = controller(&api);
        let alice = identity("alice");

        assert_eq!(controller.health(&alice).await, SessionHealth::NotStarted);
        controller.start(&alice, None).await.expect("start succeeds");
        assert_eq!(controller.health(&alice).await, SessionHealth::Active);

        api.script_describe([Describe::State(ProvisioningState::Failed)]);
        assert_eq!(controller.health(&alice).await, SessionHealth::Unhealthy);

        api.script_describe([Describe::Error(RemoteError::Unavailable("502".to_string()))]);
        assert_eq!(controller.health(&alice).await, SessionHealth::Unknown);

        controller.stop(&alice).await;
        assert_eq!(controller.health(&alice).await, SessionHealth::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweeper_exits_on_shutdown() {
        let api = ScriptedCompute::new();
        let controller = Arc::new(controller(&api));
        let shutdown = CancellationToken::new();
        let sweeper = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run_idle_sweeper(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(180)).await;
        shutdown.cancel();
        sweeper.await.expect("sweeper task");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_tears_down_every_session() {
        let api = ScriptedCompute::new();
        let controller = controller(&api);
        for name in ["alice", "bob", "carol"] {
            controller
                .start(&identity(name), None)
                .await
                .expect("start succeeds");
        }

        controller.stop_all().await;

        assert_eq!(api.calls("delete"), 3);
        for name in ["alice", "bob", "carol"] {
            assert_eq!(controller.status(&identity(name)), LifecycleState::Stopped);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_issued_during_teardown_runs_after_stop() {
        let api = ScriptedCompute::new();
        let controller = Arc::new(controller(&api));
        let alice = identity("alice");

        controller.start(&alice, None).await.expect("first start");
        api.script_delete([
            Err(RemoteError::Unavailable("503".to_string())),
            Err(RemoteError::Unavailable("503".to_string())),
        ]);
        let stopper = {
            let controller = controller.clone();
            let alice = alice.clone();
            tokio::spawn(async move { controller.stop(&alice).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.status(&alice), LifecycleState::Stopping);

        let endpoint = controller
            .start(&alice, None)
            .await
            .expect("start queued behind stop succeeds");
        stopper.await.expect("stop task");

        assert_eq!(endpoint, endpoint_for("ci-2"));
        assert_eq!(api.deletes_of("ci-1"), 3);
        assert_eq!(controller.status(&alice), LifecycleState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_deadlines_do_not_overflow() {
        let api = ScriptedCompute::new();
        api.script_describe([Describe::State(ProvisioningState::Creating)]);
        let mut config = ControllerConfig::default();
        config.poll.provisioning_deadline = Duration::from_secs(u64::MAX);
        config.poll.teardown_deadline = Duration::from_secs(u64::MAX);
        config.poll.backoff.max_delay = Duration::from_secs(u64::MAX);
        let controller = controller_with(&api, config);
        let alice = identity("alice");

        let endpoint = controller.start(&alice, None).await.expect("start succeeds");
        controller.stop(&alice).await;

        assert_eq!(endpoint, endpoint_for("ci-1"));
        assert_eq!(controller.status(&alice), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn create_conflict_adopts_existing_instance() {
        let api = ScriptedCompute::new();
        let alice = identity("alice");
        let existing = api.seed_instance(&alice);
        // the first create is accepted remotely but its response is lost
        api.script_create([
            Err(RemoteError::Unavailable("connection reset".to_string())),
            Err(RemoteError::AlreadyExists("alice-nb".to_string())),
        ]);
        let controller = controller(&api);

        let endpoint = controller.start(&alice, None).await.expect("adopts instance");

        assert_eq!(endpoint, endpoint_for(&existing));
        assert_eq!(api.calls("create"), 2);
        assert_eq!(api.calls("find"), 1);
        assert_eq!(
            controller.snapshot(&alice).and_then(|s| s.resource_id),
            Some(existing.clone())
        );

        controller.stop(&alice).await;
        assert_eq!(api.deletes_of(&existing), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_instance_is_started_again() {
        let api = ScriptedCompute::new();
        api.script_describe([
            Describe::State(ProvisioningState::Stopped),
            Describe::State(ProvisioningState::Stopped),
            Describe::State(ProvisioningState::Starting),
        ]);
        let controller = controller(&api);
        let alice = identity("alice");

        let endpoint = controller.start(&alice, None).await.expect("restarted");

        assert_eq!(endpoint, endpoint_for("ci-1"));
        assert_eq!(api.calls("start"), 1);
        assert_eq!(api.calls("describe"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_restart_fails_the_session() {
        let api = ScriptedCompute::new();
        api.script_describe([Describe::State(ProvisioningState::Stopped)]);
        api.script_start([Err(RemoteError::Rejected {
            status: 403,
            detail: "start not permitted".to_string(),
        })]);
        let controller = controller(&api);
        let alice = identity("alice");

        let result = controller.start(&alice, None).await;

        assert_eq!(
            result,
            Err(ControllerError::RemoteRejected(
                "403: start not permitted".to_string()
            ))
        );
        assert!(matches!(
            controller.status(&alice),
            LifecycleState::Failed(reason) if reason.kind == FailureKind::RemoteRejected
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_create_retries_issues_no_delete() {
        let api = ScriptedCompute::new();
        api.script_create((0..100).map(|_| Err(RemoteError::Unavailable("503".to_string()))));
        let controller = Arc::new(controller(&api));
        let alice = identity("alice");

        let starter = {
            let controller = controller.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                let result = controller.start(&alice, None).await;
                (result, Instant::now())
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.status(&alice), LifecycleState::Provisioning);
        assert_eq!(controller.snapshot(&alice).and_then(|s| s.resource_id), None);

        let stop_requested = Instant::now();
        controller.stop(&alice).await;
        let (result, finished) = starter.await.expect("start task");

        assert_eq!(result, Err(ControllerError::Cancelled));
        assert!(finished.duration_since(stop_requested) <= Duration::from_secs(2));
        assert_eq!(api.calls("delete"), 0);
        assert_eq!(controller.status(&alice), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_session_is_reclaimed_after_idle_timeout() {
        let api = ScriptedCompute::new();
        let mut config = ControllerConfig::default();
        config.idle_timeout = Duration::from_secs(600);
        let controller = controller_with(&api, config);
        let alice = identity("alice");

        controller.start(&alice, None).await.expect("start succeeds");
        controller.stop(&alice).await;
        assert_eq!(controller.status(&alice), LifecycleState::Stopped);

        tokio::time::advance(Duration::from_secs(300)).await;
        controller.sweep_idle().await;
        assert!(controller.snapshot(&alice).is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(controller.sweep_idle().await, 0);
        assert!(controller.snapshot(&alice).is_none());
        assert_eq!(api.deletes_of("ci-1"), 1);
    }
}
