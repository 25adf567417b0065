use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nbcompute_client::ComputeApi;
use nbcompute_control_plane::{Identity, LifecycleState, SessionEvent};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::lifecycle::{LifecycleMachine, SessionSnapshot};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registry slot for one identity: the serialized machine plus the pieces that
/// must stay readable while a start or stop holds the machine lock.
pub struct SessionEntry {
    identity: Identity,
    machine: tokio::sync::Mutex<LifecycleMachine>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    cancel: Mutex<CancellationToken>,
    last_activity: Mutex<Instant>,
    retired: AtomicBool,
}

impl SessionEntry {
    fn new(identity: Identity, api: Arc<dyn ComputeApi>, config: Arc<ControllerConfig>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let machine = LifecycleMachine::new(identity.clone(), api, config, events.clone());
        let snapshot = machine.watch();
        Self {
            identity,
            machine: tokio::sync::Mutex::new(machine),
            snapshot,
            events,
            cancel: Mutex::new(CancellationToken::new()),
            last_activity: Mutex::new(Instant::now()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, LifecycleMachine> {
        self.machine.lock().await
    }

    pub(crate) fn try_lock(&self) -> Option<tokio::sync::MutexGuard<'_, LifecycleMachine>> {
        self.machine.try_lock().ok()
    }

    /// Token a start polls against; fired by `stop`.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Cancels starts already holding the current token and arms a fresh one, so
    /// a start issued after this call queues behind the stop instead of failing.
    pub(crate) fn cancel_in_flight(&self) {
        std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new()).cancel();
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// A retired entry has been dropped from the registry; callers holding it
    /// must look the identity up again.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// Identity → session map. The map lock is never held across an await.
pub struct SessionRegistry {
    api: Arc<dyn ComputeApi>,
    config: Arc<ControllerConfig>,
    entries: Mutex<HashMap<Identity, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new(api: Arc<dyn ComputeApi>, config: Arc<ControllerConfig>) -> Self {
        Self {
            api,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the entry for `identity`, creating an idle one if absent.
    pub fn get_or_create(&self, identity: &Identity) -> Arc<SessionEntry> {
        let mut entries = self.entries.lock();
        entries
            .entry(identity.clone())
            .or_insert_with(|| {
                tracing::debug!(identity = %identity, "registering session");
                Arc::new(SessionEntry::new(
                    identity.clone(),
                    self.api.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<SessionEntry>> {
        self.entries.lock().get(identity).cloned()
    }

    /// Drops `entry` if it is still the registered one and its machine holds no
    /// remote resources (`Idle` or `Stopped`). The caller must hold the machine lock
    /// so no start can slip in between the check and the removal.
    pub fn remove(&self, entry: &Arc<SessionEntry>, machine: &LifecycleMachine) -> bool {
        if !matches!(
            machine.state(),
            LifecycleState::Idle | LifecycleState::Stopped
        ) {
            return false;
        }
        let mut entries = self.entries.lock();
        match entries.get(entry.identity()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entry.retire();
                entries.remove(entry.identity());
                tracing::debug!(identity = %entry.identity(), "session removed");
                true
            }
            _ => false,
        }
    }

    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.entries.lock().values().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
