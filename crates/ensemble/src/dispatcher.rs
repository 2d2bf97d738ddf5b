//! Sharded dispatcher: routes every message of an actor kind to the node that
//! owns the message's id.
//!
//! Ownership of an id is decided by an election in scope
//! `distributed-<kind>-<id>`. The winner runs the instance locally through an
//! [`InstanceRunner`]; every other node forwards to the winner. Routes are
//! cached per scope and dropped when the owner's candidate disappears or the
//! local instance is passivated.
//!
//! The dispatch loop only groups and schedules. Messages of one id run in
//! arrival order on a per-id lane while different ids proceed in parallel, so
//! a slow or remote instance never blocks the queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::actor::{ActorHandle, ActorSystem, Handle, Message, Router};
use crate::config::ClusterConfig;
use crate::election::ElectionService;
use crate::error::ClusterError;
use crate::fatal;
use crate::instance_runner::{InstanceFactory, InstanceRunner, PostPassivation};
use crate::metrics::ClusterMetrics;
use crate::types::{ActorAddress, EntityId, MemberId};

/// Extracts the instance id a message is addressed to.
pub type MessageToId = Arc<dyn Fn(&Message) -> Result<EntityId, ClusterError> + Send + Sync>;

type Reply = oneshot::Sender<Result<Vec<u8>, ClusterError>>;

struct Pending {
    message: Message,
    reply: Option<Reply>,
}

impl Pending {
    fn resolve(self, result: Result<Vec<u8>, ClusterError>) {
        match self.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!(tag = %self.message.tag, error = %e, "dispatched tell failed");
                }
            }
        }
    }
}

/// Where the messages of one id go.
#[derive(Clone)]
pub enum Route {
    /// This node owns the id.
    Local,
    /// Another node owns the id.
    Remote(Handle),
    /// Nothing cached for the id.
    Unresolved,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Local => write!(f, "Local"),
            Route::Remote(handle) => write!(f, "Remote({})", handle.address()),
            Route::Unresolved => write!(f, "Unresolved"),
        }
    }
}

/// Election scope deciding the owner of `id`.
pub fn scope_for(kind: &str, id: &EntityId) -> String {
    format!("distributed-{kind}-{id}")
}

/// Cached routes and the candidates this node holds for its local instances.
struct RouteTable {
    kind: String,
    election: ElectionService,
    routes: DashMap<String, Route>,
    candidates: DashMap<EntityId, String>,
    /// Serialises routing decisions against ownership releases. Never held
    /// while executing.
    routing: tokio::sync::Mutex<()>,
    metrics: Arc<ClusterMetrics>,
}

impl RouteTable {
    fn get(&self, scope: &str) -> Route {
        self.routes
            .get(scope)
            .map(|r| r.value().clone())
            .unwrap_or(Route::Unresolved)
    }

    fn is_local(&self, scope: &str) -> bool {
        matches!(self.get(scope), Route::Local)
    }

    /// Whether `leader` is the candidate this node recorded for `id`.
    fn holds(&self, id: &EntityId, leader: &MemberId) -> bool {
        self.candidates
            .get(id)
            .is_some_and(|path| MemberId::from_path(path.value()) == *leader)
    }

    fn cache(&self, scope: &str, route: Route) {
        if self.routes.insert(scope.to_string(), route).is_none() {
            self.metrics.cached_routes.inc();
        }
    }

    fn invalidate(&self, scope: &str) -> bool {
        let removed = self.routes.remove(scope).is_some();
        if removed {
            self.metrics.cached_routes.dec();
        }
        removed
    }

    /// Drop a remote route, but only if it is still the one that was watched.
    fn invalidate_remote(&self, scope: &str, watched: &Handle) -> bool {
        let removed = self
            .routes
            .remove_if(scope, |_, route| {
                matches!(route, Route::Remote(h) if Arc::ptr_eq(h, watched))
            })
            .is_some();
        if removed {
            self.metrics.cached_routes.dec();
        }
        removed
    }

    /// Forget the route of a passivated instance and give up its ownership.
    ///
    /// Routing decisions for any id wait until the candidate is gone.
    async fn release(&self, id: &EntityId) {
        let scope = scope_for(&self.kind, id);
        let _decision = self.routing.lock().await;
        self.invalidate(&scope);
        if let Some((_, path)) = self.candidates.remove(id) {
            if let Err(e) = self.election.leave(&path).await {
                tracing::warn!(scope = %scope, error = %e, "failed to leave election after passivation");
            }
        }
        tracing::debug!(scope = %scope, "released ownership");
    }
}

struct Core {
    kind: String,
    system: ActorSystem,
    election: ElectionService,
    runner: InstanceRunner,
    table: Arc<RouteTable>,
    message_to_id: MessageToId,
    batch_size: usize,
    cancel: CancellationToken,
}

impl Core {
    /// Resolve the route for `id`, electing an owner if there is none.
    ///
    /// This node owns `id` only while the leader is the candidate it recorded
    /// for `id`.
    async fn resolve(&self, id: &EntityId) -> Result<Route, ClusterError> {
        let scope = scope_for(&self.kind, id);
        let _decision = self.table.routing.lock().await;

        match self.table.get(&scope) {
            Route::Unresolved => {}
            cached => return Ok(cached),
        }

        self.election.init_scope(&scope).await?;
        loop {
            let Some(leader) = self.election.leader_id(&scope).await? else {
                let path = self.election.join(&scope).await?;
                match self.election.leader_id(&scope).await? {
                    None => fatal::invariant_violated("election scope has no leader right after joining"),
                    Some(leader) if leader == MemberId::from_path(&path) => {
                        tracing::debug!(scope = %scope, "won ownership election");
                        self.table.candidates.insert(id.clone(), path);
                        self.table.cache(&scope, Route::Local);
                        return Ok(Route::Local);
                    }
                    Some(_) => {
                        self.election.leave(&path).await?;
                        continue;
                    }
                }
            };

            if self.table.holds(id, &leader) {
                self.table.cache(&scope, Route::Local);
                return Ok(Route::Local);
            }

            let host_port = self.election.leader_host_port(&scope, &leader).await?;
            if &host_port == self.system.host_port() {
                // Ours, but no longer backing a local instance.
                tracing::warn!(scope = %scope, leader = %leader, "leaving stale ownership candidate");
                self.election
                    .leave(&self.election.candidate_path(&scope, &leader))
                    .await?;
                continue;
            }

            let address = self
                .system
                .remote_address(host_port, &format!("{}/{}", self.kind, id));
            let handle = self.system.resolve_remote(&address);
            self.table.cache(&scope, Route::Remote(Arc::clone(&handle)));
            self.watch_owner(scope, leader, Arc::clone(&handle));
            return Ok(Route::Remote(handle));
        }
    }

    /// Invalidate a remote route once the owner's candidate is deleted.
    fn watch_owner(&self, scope: String, owner: MemberId, handle: Handle) {
        let table = Arc::clone(&self.table);
        let cancel = self.cancel.clone();
        let path = self.election.candidate_path(&scope, &owner);
        let coordination = Arc::clone(self.election.coordination());
        tracing::debug!(scope = %scope, owner = %owner, address = %handle.address(), "routing to remote owner");
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = coordination.wait_delete(&path) => {
                    if let Err(e) = result {
                        tracing::warn!(scope = %scope, error = %e, "owner watch failed");
                    }
                    if table.invalidate_remote(&scope, &handle) {
                        tracing::debug!(scope = %scope, owner = %owner, "owner departed, route invalidated");
                    }
                }
            }
        });
    }

    /// Deliver one id's messages in order.
    async fn execute(&self, id: &EntityId, group: Vec<Pending>) {
        let scope = scope_for(&self.kind, id);
        let mut pending = Some(group);

        while let Some(group) = pending.take() {
            let route = match self.resolve(id).await {
                Ok(route) => route,
                Err(e) => {
                    tracing::warn!(scope = %scope, error = %e, "route resolution failed");
                    fail_all(group, &e);
                    return;
                }
            };

            match route {
                Route::Remote(handle) => {
                    for item in group {
                        let result = handle.ask(item.message.clone()).await;
                        item.resolve(result);
                    }
                }
                Route::Local | Route::Unresolved => {
                    // The group is handed back if the route changed while the
                    // gate was being acquired.
                    let mut slot = Some(group);
                    let table = &self.table;
                    let scope_ref = scope.as_str();
                    let outcome = {
                        let slot = &mut slot;
                        self.runner
                            .use_instance_if(
                                id,
                                || table.is_local(scope_ref),
                                move |instance| async move {
                                    if let Some(group) = slot.take() {
                                        for item in group {
                                            let result = instance.ask(item.message.clone()).await;
                                            item.resolve(result);
                                        }
                                    }
                                    Ok(())
                                },
                            )
                            .await
                    };
                    match outcome {
                        Ok(Some(())) => {}
                        Ok(None) => {
                            tracing::debug!(scope = %scope, "route changed during activation, re-routing");
                            pending = slot;
                        }
                        Err(e) => {
                            if let Some(group) = slot {
                                fail_all(group, &e);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn fail_all(group: Vec<Pending>, error: &ClusterError) {
    for item in group {
        item.resolve(Err(error.replicate()));
    }
}

/// Dispatcher for one sharded actor kind on this node.
pub struct ShardedDispatcher {
    core: Arc<Core>,
    tx: mpsc::UnboundedSender<Pending>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ShardedDispatcher {
    /// Start the dispatcher for `kind` and expose it on path prefix `kind`.
    ///
    /// `factory` creates the local instance for an id this node wins.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        kind: impl Into<String>,
        config: &ClusterConfig,
        system: ActorSystem,
        election: ElectionService,
        factory: InstanceFactory,
        message_to_id: MessageToId,
        metrics: Arc<ClusterMetrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let kind = kind.into();
        let table = Arc::new(RouteTable {
            kind: kind.clone(),
            election: election.clone(),
            routes: DashMap::new(),
            candidates: DashMap::new(),
            routing: tokio::sync::Mutex::new(()),
            metrics: Arc::clone(&metrics),
        });
        let post_passivation: PostPassivation = {
            let table = Arc::clone(&table);
            Arc::new(move |id: EntityId| {
                let table = Arc::clone(&table);
                async move { table.release(&id).await }.boxed()
            })
        };
        let runner = InstanceRunner::new(
            kind.clone(),
            factory,
            config.passivate_after,
            config.passivation_sweep_interval,
            metrics,
        )
        .with_post_passivation(post_passivation);

        let core = Arc::new(Core {
            kind: kind.clone(),
            system: system.clone(),
            election,
            runner,
            table,
            message_to_id,
            batch_size: config.dispatch_batch_size.max(1),
            cancel: cancel.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&core), rx, cancel.clone()));
        let sweep = {
            let core = Arc::clone(&core);
            let cancel = cancel.clone();
            tokio::spawn(async move { core.runner.run(cancel).await })
        };

        system.serve(
            &kind,
            Arc::new(DispatchRouter {
                system: system.clone(),
                tx: tx.clone(),
            }),
        );
        tracing::info!(kind = %kind, "sharded dispatcher started");

        Arc::new(Self {
            core,
            tx,
            tasks: parking_lot::Mutex::new(vec![dispatch, sweep]),
        })
    }

    pub fn kind(&self) -> &str {
        &self.core.kind
    }

    /// Route `message` to its instance and wait for the reply.
    pub async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
        enqueue_ask(&self.tx, message).await
    }

    /// Route `message` to its instance without waiting for it to be handled.
    pub fn tell(&self, message: Message) -> Result<(), ClusterError> {
        self.tx
            .send(Pending {
                message,
                reply: None,
            })
            .map_err(|_| ClusterError::ShuttingDown)
    }

    /// Cached route for `id`.
    pub fn route_of(&self, id: &EntityId) -> Route {
        self.core.table.get(&scope_for(&self.core.kind, id))
    }

    /// Local instances of this kind.
    pub fn runner(&self) -> &InstanceRunner {
        &self.core.runner
    }

    /// Stop dispatching, stop local instances and give up their ownership.
    #[instrument(skip(self), fields(kind = %self.core.kind))]
    pub async fn shutdown(&self) {
        self.core.cancel.cancel();
        self.core.system.unserve(&self.core.kind);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let stopped = self.core.runner.shutdown().await;
        let owned: Vec<EntityId> = self
            .core
            .table
            .candidates
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in owned {
            self.core.table.release(&id).await;
        }
        let cached = self.core.table.routes.len() as i64;
        self.core.table.routes.clear();
        self.core.table.metrics.cached_routes.sub(cached);
        tracing::info!(stopped, "sharded dispatcher stopped");
    }
}

async fn enqueue_ask(
    tx: &mpsc::UnboundedSender<Pending>,
    message: Message,
) -> Result<Vec<u8>, ClusterError> {
    let (reply, rx) = oneshot::channel();
    tx.send(Pending {
        message,
        reply: Some(reply),
    })
    .map_err(|_| ClusterError::ShuttingDown)?;
    rx.await.map_err(|_| ClusterError::ShuttingDown)?
}

async fn dispatch_loop(
    core: Arc<Core>,
    mut rx: mpsc::UnboundedReceiver<Pending>,
    cancel: CancellationToken,
) {
    let mut lanes: HashMap<EntityId, JoinHandle<()>> = HashMap::new();

    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };
        let mut batch = vec![first];
        while batch.len() < core.batch_size {
            match rx.try_recv() {
                Ok(pending) => batch.push(pending),
                Err(_) => break,
            }
        }

        lanes.retain(|_, lane| !lane.is_finished());
        for (id, group) in group_by_id(&core, batch) {
            let previous = lanes.remove(&id);
            let core = Arc::clone(&core);
            let lane_id = id.clone();
            let lane = tokio::spawn(async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                core.execute(&lane_id, group).await;
            });
            lanes.insert(id, lane);
        }
    }

    rx.close();
    while let Ok(pending) = rx.try_recv() {
        pending.resolve(Err(ClusterError::ShuttingDown));
    }
    for (_, lane) in lanes {
        let _ = lane.await;
    }
    tracing::debug!(kind = %core.kind, "dispatch loop stopped");
}

/// Group a batch by id, keeping arrival order within each id and the order in
/// which ids first appeared.
fn group_by_id(core: &Core, batch: Vec<Pending>) -> Vec<(EntityId, Vec<Pending>)> {
    let mut groups: Vec<(EntityId, Vec<Pending>)> = Vec::new();
    let mut index: HashMap<EntityId, usize> = HashMap::new();
    for pending in batch {
        let id = match (core.message_to_id)(&pending.message) {
            Ok(id) => id,
            Err(e) => {
                pending.resolve(Err(e));
                continue;
            }
        };
        match index.get(&id) {
            Some(&i) => groups[i].1.push(pending),
            None => {
                index.insert(id.clone(), groups.len());
                groups.push((id, vec![pending]));
            }
        }
    }
    groups
}

/// Accepts remote deliveries for every path under the kind's prefix.
struct DispatchRouter {
    system: ActorSystem,
    tx: mpsc::UnboundedSender<Pending>,
}

impl Router for DispatchRouter {
    fn route(&self, path: &str) -> Result<Handle, ClusterError> {
        Ok(Arc::new(DispatchHandle {
            address: self.system.address_of(path),
            tx: self.tx.clone(),
        }))
    }
}

struct DispatchHandle {
    address: ActorAddress,
    tx: mpsc::UnboundedSender<Pending>,
}

#[async_trait]
impl ActorHandle for DispatchHandle {
    fn address(&self) -> &ActorAddress {
        &self.address
    }

    async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
        enqueue_ask(&self.tx, message).await
    }

    async fn tell(&self, message: Message) -> Result<(), ClusterError> {
        self.tx
            .send(Pending {
                message,
                reply: None,
            })
            .map_err(|_| ClusterError::ShuttingDown)
    }

    async fn stop(&self) -> Result<usize, ClusterError> {
        Err(ClusterError::handler(format!(
            "sharded instance {} is stopped by passivation only",
            self.address
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorContext, Behavior, LocalNetwork, LoggingSupervisor};
    use crate::coordination::memory::{MemoryCoordination, MemorySession};
    use crate::coordination::{Coordination, CreateMode};
    use crate::types::HostPort;
    use std::time::Duration;

    /// Counts messages and reports the node that handled them.
    struct Counter;

    #[async_trait]
    impl Behavior for Counter {
        type State = u32;

        async fn receive(
            &self,
            state: &mut u32,
            ctx: &ActorContext,
            message: Message,
        ) -> Result<Vec<u8>, ClusterError> {
            if message.tag == "slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            *state += 1;
            crate::error::encode(&(ctx.system().host_port().port, *state))
        }
    }

    struct Node {
        session: Arc<MemorySession>,
        system: ActorSystem,
        dispatcher: Arc<ShardedDispatcher>,
    }

    fn id_of() -> MessageToId {
        Arc::new(|m: &Message| m.decode::<String>().map(EntityId::new))
    }

    /// Artificial latency injected into one node.
    #[derive(Debug, Default, Clone, Copy)]
    struct Delays {
        remove: Duration,
        stop: Duration,
    }

    /// Session whose removals take `delay` to complete.
    struct DelayedRemoval {
        inner: Arc<MemorySession>,
        delay: Duration,
    }

    #[async_trait]
    impl Coordination for DelayedRemoval {
        async fn mkdir(&self, path: &str) -> Result<(), ClusterError> {
            self.inner.mkdir(path).await
        }

        async fn create(
            &self,
            prefix: &str,
            mode: CreateMode,
            data: &[u8],
        ) -> Result<String, ClusterError> {
            self.inner.create(prefix, mode, data).await
        }

        async fn remove(&self, path: &str) -> Result<(), ClusterError> {
            tokio::time::sleep(self.delay).await;
            self.inner.remove(path).await
        }

        async fn get_children(&self, path: &str) -> Result<Vec<String>, ClusterError> {
            self.inner.get_children(path).await
        }

        async fn get_data(&self, path: &str) -> Result<Vec<u8>, ClusterError> {
            self.inner.get_data(path).await
        }

        async fn wait_delete(&self, path: &str) -> Result<(), ClusterError> {
            self.inner.wait_delete(path).await
        }
    }

    /// Instance handle that takes `delay` to stop.
    struct SlowStop {
        inner: Handle,
        delay: Duration,
    }

    #[async_trait]
    impl ActorHandle for SlowStop {
        fn address(&self) -> &ActorAddress {
            self.inner.address()
        }

        async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
            self.inner.ask(message).await
        }

        async fn tell(&self, message: Message) -> Result<(), ClusterError> {
            self.inner.tell(message).await
        }

        async fn stop(&self) -> Result<usize, ClusterError> {
            tokio::time::sleep(self.delay).await;
            self.inner.stop().await
        }
    }

    fn node(
        coord: &MemoryCoordination,
        network: &Arc<LocalNetwork>,
        port: u16,
        config: &ClusterConfig,
    ) -> Node {
        node_with(coord, network, port, config, Delays::default())
    }

    fn node_with(
        coord: &MemoryCoordination,
        network: &Arc<LocalNetwork>,
        port: u16,
        config: &ClusterConfig,
        delays: Delays,
    ) -> Node {
        let session = Arc::new(coord.session());
        let system = ActorSystem::new(
            "demo",
            "ensemble",
            HostPort::new("127.0.0.1", port),
            Arc::clone(network) as Arc<dyn crate::actor::RemoteTransport>,
        );
        network.register(&system);
        let coordination: Arc<dyn Coordination> = Arc::new(DelayedRemoval {
            inner: Arc::clone(&session),
            delay: delays.remove,
        });
        let election = ElectionService::new(
            coordination,
            "/ensemble",
            HostPort::new("127.0.0.1", port),
            Duration::from_millis(10),
        );
        let factory: InstanceFactory = {
            let system = system.clone();
            Arc::new(move |id: EntityId| {
                let system = system.clone();
                async move {
                    let handle = system.spawn(
                        &format!("counters/{id}"),
                        Arc::new(LoggingSupervisor),
                        Counter,
                        0,
                    )?;
                    Ok::<Handle, ClusterError>(Arc::new(SlowStop {
                        inner: handle.into_handle(),
                        delay: delays.stop,
                    }))
                }
                .boxed()
            })
        };
        let dispatcher = ShardedDispatcher::start(
            "counters",
            config,
            system.clone(),
            election,
            factory,
            id_of(),
            Arc::new(ClusterMetrics::unregistered()),
            CancellationToken::new(),
        );
        Node {
            session,
            system,
            dispatcher,
        }
    }

    fn spawn_ask(node: &Node, id: &str) -> JoinHandle<(u16, u32)> {
        let dispatcher = Arc::clone(&node.dispatcher);
        let message = Message::encode("count", &id.to_string()).unwrap();
        tokio::spawn(async move {
            let reply = dispatcher.ask(message).await.unwrap();
            crate::error::decode(&reply).unwrap()
        })
    }

    fn spawn_sweep(node: &Node) -> JoinHandle<usize> {
        let dispatcher = Arc::clone(&node.dispatcher);
        tokio::spawn(async move { dispatcher.runner().passivate_idle().await })
    }

    async fn ask(node: &Node, id: &str) -> (u16, u32) {
        let reply = node
            .dispatcher
            .ask(Message::encode("count", &id.to_string()).unwrap())
            .await
            .unwrap();
        crate::error::decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn first_caller_becomes_owner() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let config = ClusterConfig::default();
        let a = node(&coord, &network, 1, &config);
        let b = node(&coord, &network, 2, &config);

        assert_eq!(ask(&a, "x").await, (1, 1));
        assert_eq!(ask(&b, "x").await, (1, 2));
        assert_eq!(ask(&b, "y").await, (2, 1));
        assert_eq!(ask(&a, "y").await, (2, 2));

        assert!(matches!(a.dispatcher.route_of(&EntityId::new("x")), Route::Local));
        assert!(matches!(b.dispatcher.route_of(&EntityId::new("x")), Route::Remote(_)));
        assert_eq!(a.dispatcher.runner().active_count(), 1);
        assert_eq!(b.dispatcher.runner().active_count(), 1);
    }

    #[tokio::test]
    async fn replies_keep_per_id_order_within_a_batch() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, &ClusterConfig::default());
        let dispatcher = Arc::clone(&a.dispatcher);

        let asks: Vec<_> = (0..20)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                let id = if i % 2 == 0 { "even" } else { "odd" };
                let message = Message::encode("count", &id.to_string()).unwrap();
                tokio::spawn(async move { dispatcher.ask(message).await })
            })
            .collect();
        let mut even = Vec::new();
        for (i, task) in asks.into_iter().enumerate() {
            let (_, n): (u16, u32) = crate::error::decode(&task.await.unwrap().unwrap()).unwrap();
            if i % 2 == 0 {
                even.push(n);
            }
        }
        even.sort();
        assert_eq!(even, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn slow_id_does_not_block_other_ids() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, &ClusterConfig::default());
        ask(&a, "slow").await;

        let slow = {
            let dispatcher = Arc::clone(&a.dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .ask(Message::encode("slow", &"slow".to_string()).unwrap())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::time::timeout(Duration::from_millis(30), ask(&a, "fast"))
            .await
            .expect("other ids are served while one is busy");
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remote_route_is_dropped_when_owner_departs() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let config = ClusterConfig::default();
        let a = node(&coord, &network, 1, &config);
        let b = node(&coord, &network, 2, &config);

        assert_eq!(ask(&a, "x").await, (1, 1));
        assert_eq!(ask(&b, "x").await, (1, 2));

        network.deregister(a.system.host_port());
        a.session.expire();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            b.dispatcher.route_of(&EntityId::new("x")),
            Route::Unresolved
        ));

        // b takes over with a fresh instance.
        assert_eq!(ask(&b, "x").await, (2, 1));
    }

    #[tokio::test]
    async fn passivation_releases_ownership() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let config = ClusterConfig {
            passivate_after: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let a = node(&coord, &network, 1, &config);
        let b = node(&coord, &network, 2, &config);

        assert_eq!(ask(&a, "x").await, (1, 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.dispatcher.runner().passivate_idle().await, 1);
        assert!(matches!(
            a.dispatcher.route_of(&EntityId::new("x")),
            Route::Unresolved
        ));

        // Ownership is free again; the next caller wins it.
        assert_eq!(ask(&b, "x").await, (2, 1));
    }

    #[tokio::test]
    async fn reactivation_during_release_keeps_one_owner() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let config = ClusterConfig {
            passivate_after: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let a = node_with(
            &coord,
            &network,
            1,
            &config,
            Delays {
                remove: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let b = node(&coord, &network, 2, &config);
        let x = EntityId::new("x");

        assert_eq!(ask(&a, "x").await, (1, 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sweep = spawn_sweep(&a);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // The candidate is still being withdrawn.
        let again = spawn_ask(&a, "x");

        assert_eq!(sweep.await.unwrap(), 1);
        assert_eq!(again.await.unwrap(), (1, 1));
        assert_eq!(ask(&b, "x").await, (1, 2));

        assert!(a.dispatcher.runner().is_running(&x));
        assert!(!b.dispatcher.runner().is_running(&x));
        assert!(matches!(b.dispatcher.route_of(&x), Route::Remote(_)));
    }

    #[tokio::test]
    async fn stale_local_candidate_is_withdrawn_before_routing() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let config = ClusterConfig::default();
        let a = node(&coord, &network, 1, &config);
        let b = node(&coord, &network, 2, &config);
        let x = EntityId::new("x");

        // A leftover candidate of a, not backing any instance.
        let election = ElectionService::new(
            Arc::clone(&a.session) as Arc<dyn Coordination>,
            "/ensemble",
            HostPort::new("127.0.0.1", 1),
            Duration::from_millis(10),
        );
        let scope = scope_for("counters", &x);
        election.init_scope(&scope).await.unwrap();
        let stale = election.join(&scope).await.unwrap();

        assert_eq!(ask(&a, "x").await, (1, 1));
        assert!(coord.session().get_data(&stale).await.is_err());
        assert_eq!(ask(&b, "x").await, (1, 2));
        assert_eq!(election.candidates(&scope).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_waiting_on_a_closing_gate_is_rerouted() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let config = ClusterConfig {
            passivate_after: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let a = node_with(
            &coord,
            &network,
            1,
            &config,
            Delays {
                stop: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let b = node(&coord, &network, 2, &config);
        let x = EntityId::new("x");

        assert_eq!(ask(&a, "x").await, (1, 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sweep = spawn_sweep(&a);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Gate closed, instance stopping, route still cached as local.
        assert!(matches!(a.dispatcher.route_of(&x), Route::Local));
        let waiting = spawn_ask(&a, "x");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());

        assert_eq!(sweep.await.unwrap(), 1);
        // Re-routed after release: a wins again with a fresh instance.
        assert_eq!(waiting.await.unwrap(), (1, 1));
        assert_eq!(ask(&b, "x").await, (1, 2));
        assert_eq!(a.dispatcher.runner().active_count(), 1);
    }

    #[tokio::test]
    async fn idle_instances_are_swept_on_a_timer() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let config = ClusterConfig {
            passivate_after: Some(Duration::from_millis(20)),
            passivation_sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let a = node(&coord, &network, 1, &config);
        let b = node(&coord, &network, 2, &config);
        let x = EntityId::new("x");

        assert_eq!(ask(&a, "x").await, (1, 1));
        let scope = format!("/ensemble/{}", scope_for("counters", &x));
        let observer = coord.session();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !observer.get_children(&scope).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("idle instance is passivated without an explicit sweep");
        assert!(!a.dispatcher.runner().is_running(&x));
        assert!(matches!(a.dispatcher.route_of(&x), Route::Unresolved));

        assert_eq!(ask(&b, "x").await, (2, 1));
    }

    #[tokio::test]
    async fn undecodable_message_fails_only_its_caller() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, &ClusterConfig::default());
        let err = a
            .dispatcher
            .ask(Message::new("count", vec![0xc1]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Codec { .. }));
        assert_eq!(ask(&a, "x").await, (1, 1));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_messages() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, &ClusterConfig::default());
        ask(&a, "x").await;
        a.dispatcher.shutdown().await;
        assert_eq!(a.dispatcher.runner().active_count(), 0);
        let err = a
            .dispatcher
            .ask(Message::encode("count", &"x".to_string()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ShuttingDown));
    }
}
