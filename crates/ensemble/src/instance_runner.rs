//! At most one live instance per id on this node, with idle passivation.
//!
//! Access to an instance goes through [`InstanceRunner::use_instance`], which
//! holds the id's gate for the duration of the caller's body. The passivation
//! sweep only stops an instance after it has closed the gate with no
//! listeners inside, so an instance is never stopped while a caller holds it
//! or while one of its asks is in flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::actor::{Handle, Message};
use crate::error::ClusterError;
use crate::fatal;
use crate::metrics::ClusterMetrics;
use crate::types::{ActorAddress, EntityId};

/// Creates the instance for an id.
pub type InstanceFactory =
    Arc<dyn Fn(EntityId) -> BoxFuture<'static, Result<Handle, ClusterError>> + Send + Sync>;

/// Runs after an instance has been passivated, while its gate is still closed.
pub type PostPassivation = Arc<dyn Fn(EntityId) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct Gate {
    listeners: usize,
    closing: bool,
}

#[derive(Debug, Clone, Copy)]
struct Stat {
    in_flight: usize,
    last: Instant,
}

#[derive(Default)]
struct RunnerState {
    gates: HashMap<EntityId, Gate>,
    stats: HashMap<EntityId, Stat>,
    running: HashMap<EntityId, Handle>,
    shut_down: bool,
}

struct Shared {
    kind: String,
    state: Mutex<RunnerState>,
    /// Signalled on every gate transition.
    changed: Notify,
    metrics: Arc<ClusterMetrics>,
}

/// Owns the running instances of one actor kind on this node.
pub struct InstanceRunner {
    shared: Arc<Shared>,
    factory: InstanceFactory,
    passivate_after: Option<Duration>,
    sweep_interval: Duration,
    post_passivation: Option<PostPassivation>,
    spawn_locks: DashMap<EntityId, Arc<tokio::sync::Mutex<()>>>,
}

impl InstanceRunner {
    pub fn new(
        kind: impl Into<String>,
        factory: InstanceFactory,
        passivate_after: Option<Duration>,
        sweep_interval: Duration,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind: kind.into(),
                state: Mutex::new(RunnerState::default()),
                changed: Notify::new(),
                metrics,
            }),
            factory,
            passivate_after,
            sweep_interval,
            post_passivation: None,
            spawn_locks: DashMap::new(),
        }
    }

    /// Hook invoked with the id of every passivated instance.
    pub fn with_post_passivation(mut self, hook: PostPassivation) -> Self {
        self.post_passivation = Some(hook);
        self
    }

    pub fn kind(&self) -> &str {
        &self.shared.kind
    }

    /// Run `body` against the instance for `id`, creating it if needed.
    ///
    /// Waits while the instance is being passivated. The gate is released
    /// when `body` finishes, fails or is dropped.
    pub async fn use_instance<F, Fut, T>(&self, id: &EntityId, body: F) -> Result<T, ClusterError>
    where
        F: FnOnce(TrackedHandle) -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let _gate = self.enter(id).await?;
        let handle = self.instance(id).await?;
        body(TrackedHandle {
            id: id.clone(),
            handle,
            shared: Arc::clone(&self.shared),
        })
        .await
    }

    /// Like [`use_instance`](Self::use_instance), but checks `admit` once the
    /// gate is held and before any instance is created. Returns `Ok(None)`
    /// without running `body` when `admit` refuses.
    pub async fn use_instance_if<A, F, Fut, T>(
        &self,
        id: &EntityId,
        admit: A,
        body: F,
    ) -> Result<Option<T>, ClusterError>
    where
        A: FnOnce() -> bool,
        F: FnOnce(TrackedHandle) -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let _gate = self.enter(id).await?;
        if !admit() {
            return Ok(None);
        }
        let handle = self.instance(id).await?;
        body(TrackedHandle {
            id: id.clone(),
            handle,
            shared: Arc::clone(&self.shared),
        })
        .await
        .map(Some)
    }

    async fn enter(&self, id: &EntityId) -> Result<GateGuard, ClusterError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.shut_down {
                    return Err(ClusterError::ShuttingDown);
                }
                let gate = state.gates.entry(id.clone()).or_default();
                if !gate.closing {
                    gate.listeners += 1;
                    return Ok(GateGuard {
                        id: id.clone(),
                        shared: Arc::clone(&self.shared),
                    });
                }
            }
            notified.await;
        }
    }

    fn running(&self, id: &EntityId) -> Option<Handle> {
        self.shared.state.lock().running.get(id).cloned()
    }

    async fn instance(&self, id: &EntityId) -> Result<Handle, ClusterError> {
        if let Some(handle) = self.running(id) {
            return Ok(handle);
        }

        let lock = self.spawn_locks.entry(id.clone()).or_default().clone();
        let _spawning = lock.lock().await;
        if let Some(handle) = self.running(id) {
            return Ok(handle);
        }

        let handle = (self.factory)(id.clone()).await?;
        {
            let mut state = self.shared.state.lock();
            state.running.insert(id.clone(), Arc::clone(&handle));
            state.stats.insert(
                id.clone(),
                Stat {
                    in_flight: 0,
                    last: Instant::now(),
                },
            );
        }
        self.shared.metrics.active_instances.inc();
        tracing::debug!(kind = %self.shared.kind, entity_id = %id, "instance activated");
        Ok(handle)
    }

    /// Number of running instances.
    pub fn active_count(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    pub fn is_running(&self, id: &EntityId) -> bool {
        self.shared.state.lock().running.contains_key(id)
    }

    /// Callers currently inside `use_instance` for `id`.
    pub fn listeners(&self, id: &EntityId) -> usize {
        self.shared
            .state
            .lock()
            .gates
            .get(id)
            .map(|g| g.listeners)
            .unwrap_or(0)
    }

    /// Run the passivation sweep every sweep interval until `cancel` fires.
    ///
    /// Returns immediately when passivation is disabled.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.passivate_after.is_none() {
            return;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.sweep_interval) => {
                    self.passivate_idle().await;
                }
            }
        }
    }

    /// One passivation sweep. Returns the number of instances stopped.
    #[instrument(skip(self), fields(kind = %self.shared.kind))]
    pub async fn passivate_idle(&self) -> usize {
        let Some(after) = self.passivate_after else {
            return 0;
        };

        let candidates: Vec<EntityId> = {
            let state = self.shared.state.lock();
            let now = Instant::now();
            state
                .stats
                .iter()
                .filter(|(_, stat)| stat.in_flight == 0 && now.duration_since(stat.last) >= after)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut passivated = 0;
        for id in candidates {
            if self.passivate(&id, after).await {
                passivated += 1;
            }
        }
        if passivated > 0 {
            tracing::debug!(passivated, "passivated idle instances");
        }
        passivated
    }

    async fn passivate(&self, id: &EntityId, after: Duration) -> bool {
        // Close the gate once nobody is inside.
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.shut_down {
                    return false;
                }
                let gate = state.gates.entry(id.clone()).or_default();
                if gate.listeners == 0 && !gate.closing {
                    gate.closing = true;
                    break;
                }
            }
            notified.await;
        }

        let handle = {
            let mut state = self.shared.state.lock();
            let idle = state
                .stats
                .get(id)
                .is_some_and(|s| s.in_flight == 0 && s.last.elapsed() >= after);
            if idle {
                state.running.get(id).cloned()
            } else {
                None
            }
        };
        let Some(handle) = handle else {
            self.open(id);
            return false;
        };

        match handle.stop().await {
            Ok(0) => {}
            Ok(undelivered) => {
                tracing::error!(
                    kind = %self.shared.kind,
                    entity_id = %id,
                    undelivered,
                    "passivated instance still had queued messages"
                );
                fatal::invariant_violated("passivated instance had undelivered messages");
            }
            Err(e) => {
                tracing::warn!(kind = %self.shared.kind, entity_id = %id, error = %e, "failed to stop idle instance");
            }
        }

        {
            let mut state = self.shared.state.lock();
            state.running.remove(id);
            state.stats.remove(id);
        }
        self.spawn_locks.remove(id);
        self.shared.metrics.active_instances.dec();
        self.shared.metrics.passivations.inc();
        tracing::debug!(kind = %self.shared.kind, entity_id = %id, "instance passivated");

        if let Some(hook) = &self.post_passivation {
            hook(id.clone()).await;
        }
        self.open(id);
        true
    }

    /// Reopen a closed gate, dropping it if nobody is waiting on it.
    fn open(&self, id: &EntityId) {
        {
            let mut state = self.shared.state.lock();
            if let Some(gate) = state.gates.get_mut(id) {
                gate.closing = false;
                if gate.listeners == 0 {
                    state.gates.remove(id);
                }
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Stop every running instance. Later `use_instance` calls fail.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<(EntityId, Handle)> = {
            let mut state = self.shared.state.lock();
            state.shut_down = true;
            state.stats.clear();
            state.running.drain().collect()
        };
        self.shared.changed.notify_waiters();

        let stopped = handles.len();
        for (id, handle) in handles {
            if let Err(e) = handle.stop().await {
                tracing::warn!(kind = %self.shared.kind, entity_id = %id, error = %e, "failed to stop instance");
            }
            self.shared.metrics.active_instances.dec();
        }
        stopped
    }
}

struct GateGuard {
    id: EntityId,
    shared: Arc<Shared>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if let Some(gate) = state.gates.get_mut(&self.id) {
                gate.listeners = gate.listeners.saturating_sub(1);
                if gate.listeners == 0 && !gate.closing {
                    state.gates.remove(&self.id);
                }
            }
        }
        self.shared.changed.notify_waiters();
    }
}

/// Instance handle given to a `use_instance` body.
///
/// Every call is counted as in flight until it completes, and completion
/// refreshes the idle clock.
pub struct TrackedHandle {
    id: EntityId,
    handle: Handle,
    shared: Arc<Shared>,
}

impl TrackedHandle {
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn address(&self) -> &ActorAddress {
        self.handle.address()
    }

    pub async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
        let _in_flight = self.begin();
        self.handle.ask(message).await
    }

    fn begin(&self) -> InFlight<'_> {
        if let Some(stat) = self.shared.state.lock().stats.get_mut(&self.id) {
            stat.in_flight += 1;
        }
        InFlight { handle: self }
    }
}

struct InFlight<'a> {
    handle: &'a TrackedHandle,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.handle.shared.state.lock();
        if let Some(stat) = state.stats.get_mut(&self.handle.id) {
            stat.in_flight = stat.in_flight.saturating_sub(1);
            stat.last = Instant::now();
        }
    }
}
