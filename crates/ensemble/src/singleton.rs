//! Cluster-wide singletons.
//!
//! Every node that registers a singleton joins its election scope
//! (`singleton-<name>`). The leader runs the one instance at path `<name>`;
//! other nodes forward to it. Messages wait until the slot holds a handle.
//!
//! Each node also serves path `<name>` through its own mailbox, so traffic
//! forwarded to a node that has just won leadership waits for the instance
//! instead of failing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::actor::{ActorHandle, ActorSystem, Handle, Message, Router};
use crate::election::ElectionService;
use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::types::{ActorAddress, MemberId};

/// Starts the singleton instance on the node that wins leadership.
pub type SingletonFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Handle, ClusterError>> + Send + Sync>;

/// Background work that runs on the leader for as long as leadership holds.
pub type Auxiliary = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Election scope of a singleton.
pub fn singleton_scope(name: &str) -> String {
    format!("singleton-{name}")
}

struct Pending {
    message: Message,
    reply: Option<oneshot::Sender<Result<Vec<u8>, ClusterError>>>,
}

impl Pending {
    fn resolve(self, result: Result<Vec<u8>, ClusterError>) {
        match self.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!(tag = %self.message.tag, error = %e, "singleton tell failed");
                }
            }
        }
    }
}

struct Shared {
    name: String,
    scope: String,
    system: ActorSystem,
    election: ElectionService,
    factory: SingletonFactory,
    auxiliary: Option<Auxiliary>,
    slot: watch::Sender<Option<Handle>>,
    /// Instance this node runs while it leads.
    instance: Mutex<Option<Handle>>,
    leading: AtomicBool,
    retry_delay: Duration,
    metrics: Arc<ClusterMetrics>,
}

/// Publishes a handle in the slot and clears it when the branch ends.
struct Published<'a> {
    shared: &'a Shared,
}

impl<'a> Published<'a> {
    fn new(shared: &'a Shared, handle: Handle) -> Self {
        shared.slot.send_replace(Some(handle));
        Self { shared }
    }
}

impl Drop for Published<'_> {
    fn drop(&mut self) {
        self.shared.slot.send_replace(None);
        if self.shared.leading.swap(false, Ordering::AcqRel) {
            tracing::info!(scope = %self.shared.scope, "singleton leadership lost");
        }
        if let Some(instance) = self.shared.instance.lock().take() {
            tokio::spawn(async move {
                if let Err(e) = instance.stop().await {
                    tracing::warn!(actor = %instance.address(), error = %e, "failed to stop singleton");
                }
            });
        }
    }
}

impl Shared {
    async fn lead(&self) {
        let instance = match (self.factory)().await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(scope = %self.scope, error = %e, "failed to start singleton, retrying");
                tokio::time::sleep(self.retry_delay).await;
                return;
            }
        };
        *self.instance.lock() = Some(Arc::clone(&instance));
        self.leading.store(true, Ordering::Release);
        self.metrics.leadership_changes.inc();
        tracing::info!(scope = %self.scope, "singleton started on this node");
        let _published = Published::new(self, instance);

        if let Some(auxiliary) = &self.auxiliary {
            auxiliary().await;
            tracing::debug!(scope = %self.scope, "singleton auxiliary task finished");
        }
        std::future::pending::<()>().await
    }

    async fn follow(&self, leader: MemberId) {
        loop {
            match self.election.leader_host_port(&self.scope, &leader).await {
                Ok(host_port) => {
                    let address = self.system.remote_address(host_port, &self.name);
                    tracing::debug!(scope = %self.scope, leader = %leader, address = %address, "forwarding to singleton leader");
                    let _published = Published::new(self, self.system.resolve_remote(&address));
                    return std::future::pending::<()>().await;
                }
                Err(e) => {
                    tracing::warn!(scope = %self.scope, leader = %leader, error = %e, "failed to resolve singleton leader, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

/// Dispatcher for one cluster-wide singleton.
pub struct SingletonDispatcher {
    shared: Arc<Shared>,
    my_path: String,
    tx: mpsc::UnboundedSender<Pending>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SingletonDispatcher {
    /// Join the singleton's election and start forwarding messages.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(system, election, factory, auxiliary, metrics, cancel))]
    pub async fn start(
        name: String,
        system: ActorSystem,
        election: ElectionService,
        factory: SingletonFactory,
        auxiliary: Option<Auxiliary>,
        retry_delay: Duration,
        metrics: Arc<ClusterMetrics>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ClusterError> {
        let scope = singleton_scope(&name);
        election.init_scope(&scope).await?;
        let my_path = election.join(&scope).await?;

        let (slot, slot_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            name,
            scope: scope.clone(),
            system,
            election: election.clone(),
            factory,
            auxiliary,
            slot,
            instance: Mutex::new(None),
            leading: AtomicBool::new(false),
            retry_delay,
            metrics,
        });

        let election_task = {
            let shared = Arc::clone(&shared);
            let my_path = my_path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let leader_side = Arc::clone(&shared);
                let follower_side = Arc::clone(&shared);
                election
                    .run_on_leader(
                        &scope,
                        &my_path,
                        move || {
                            let shared = Arc::clone(&leader_side);
                            async move { shared.lead().await }
                        },
                        move |leader| {
                            let shared = Arc::clone(&follower_side);
                            async move { shared.follow(leader).await }
                        },
                        cancel,
                    )
                    .await
            })
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox_task = tokio::spawn(mailbox_loop(rx, slot_rx, cancel.clone()));
        shared.system.serve(
            &shared.name,
            Arc::new(SingletonRouter {
                system: shared.system.clone(),
                tx: tx.clone(),
            }),
        );

        Ok(Arc::new(Self {
            shared,
            my_path,
            tx,
            cancel,
            tasks: Mutex::new(vec![election_task, mailbox_task]),
        }))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether this node currently runs the singleton.
    pub fn is_leading(&self) -> bool {
        self.shared.leading.load(Ordering::Acquire)
    }

    /// Handle currently published in the slot.
    pub fn current(&self) -> Option<Handle> {
        self.shared.slot.borrow().clone()
    }

    /// Send `message` to the singleton and wait for the reply.
    pub async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
        enqueue_ask(&self.tx, message).await
    }

    /// Send `message` to the singleton without waiting for it to be handled.
    pub fn tell(&self, message: Message) -> Result<(), ClusterError> {
        enqueue_tell(&self.tx, message)
    }

    /// Stop the local instance, if any, and withdraw from the election.
    #[instrument(skip(self), fields(scope = %self.shared.scope))]
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        let instance = self.shared.instance.lock().take();
        if let Some(instance) = instance {
            instance.stop().await?;
        }
        self.cancel.cancel();
        self.shared.system.unserve(&self.shared.name);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.shared.election.leave(&self.my_path).await
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

fn enqueue_tell(tx: &mpsc::UnboundedSender<Pending>, message: Message) -> Result<(), ClusterError> {
    tx.send(Pending {
        message,
        reply: None,
    })
    .map_err(|_| ClusterError::ShuttingDown)
}

/// Inbound traffic for the singleton's path goes through the mailbox.
struct SingletonRouter {
    system: ActorSystem,
    tx: mpsc::UnboundedSender<Pending>,
}

impl Router for SingletonRouter {
    fn route(&self, path: &str) -> Result<Handle, ClusterError> {
        Ok(Arc::new(SingletonHandle {
            address: self.system.address_of(path),
            tx: self.tx.clone(),
        }))
    }
}

struct SingletonHandle {
    address: ActorAddress,
    tx: mpsc::UnboundedSender<Pending>,
}

#[async_trait]
impl ActorHandle for SingletonHandle {
    fn address(&self) -> &ActorAddress {
        &self.address
    }

    async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
        enqueue_ask(&self.tx, message).await
    }

    async fn tell(&self, message: Message) -> Result<(), ClusterError> {
        enqueue_tell(&self.tx, message)
    }

    async fn stop(&self) -> Result<usize, ClusterError> {
        Err(ClusterError::handler(format!(
            "singleton {} is stopped with its dispatcher only",
            self.address
        )))
    }
}

async fn current_handle(slot: &mut watch::Receiver<Option<Handle>>) -> Option<Handle> {
    slot.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|published| published.clone())
}

async fn mailbox_loop(
    mut rx: mpsc::UnboundedReceiver<Pending>,
    mut slot: watch::Receiver<Option<Handle>>,
    cancel: CancellationToken,
) {
    loop {
        let pending = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };
        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            handle = current_handle(&mut slot) => handle,
        };
        let Some(handle) = handle else {
            pending.resolve(Err(ClusterError::ShuttingDown));
            break;
        };
        let result = match pending.reply {
            Some(_) => handle.ask(pending.message.clone()).await,
            None => handle
                .tell(pending.message.clone())
                .await
                .map(|()| Vec::new()),
        };
        pending.resolve(result);
    }

    rx.close();
    while let Ok(pending) = rx.try_recv() {
        pending.resolve(Err(ClusterError::ShuttingDown));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{
        ActorContext, Behavior, LocalNetwork, LoggingSupervisor, RemoteTransport,
    };
    use crate::coordination::memory::{MemoryCoordination, MemorySession};
    use crate::coordination::Coordination;
    use crate::types::HostPort;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    struct Where;

    #[async_trait]
    impl Behavior for Where {
        type State = ();

        async fn receive(
            &self,
            _state: &mut (),
            ctx: &ActorContext,
            _message: Message,
        ) -> Result<Vec<u8>, ClusterError> {
            crate::error::encode(&ctx.system().host_port().port)
        }
    }

    struct Node {
        session: Arc<MemorySession>,
        system: ActorSystem,
        singleton: Arc<SingletonDispatcher>,
    }

    async fn node(
        coord: &MemoryCoordination,
        network: &Arc<LocalNetwork>,
        port: u16,
        auxiliary: Option<Auxiliary>,
    ) -> Node {
        let session = Arc::new(coord.session());
        let host_port = HostPort::new("127.0.0.1", port);
        let system = ActorSystem::new(
            "demo",
            "ensemble",
            host_port.clone(),
            Arc::clone(network) as Arc<dyn RemoteTransport>,
        );
        network.register(&system);
        let election = ElectionService::new(
            Arc::clone(&session) as Arc<dyn Coordination>,
            "/ensemble",
            host_port,
            Duration::from_millis(10),
        );
        let factory: SingletonFactory = {
            let system = system.clone();
            Arc::new(move || {
                let system = system.clone();
                async move {
                    let handle = system.spawn("clock", Arc::new(LoggingSupervisor), Where, ())?;
                    Ok::<Handle, ClusterError>(handle.into_handle())
                }
                .boxed()
            })
        };
        let singleton = SingletonDispatcher::start(
            "clock".to_string(),
            system.clone(),
            election,
            factory,
            auxiliary,
            Duration::from_millis(10),
            Arc::new(ClusterMetrics::unregistered()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        Node {
            session,
            system,
            singleton,
        }
    }

    async fn where_is(node: &Node) -> u16 {
        let reply = tokio::time::timeout(
            Duration::from_secs(1),
            node.singleton.ask(Message::new("where", vec![])),
        )
        .await
        .expect("singleton should answer")
        .unwrap();
        crate::error::decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn every_node_reaches_the_one_instance() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, None).await;
        let b = node(&coord, &network, 2, None).await;

        assert_eq!(where_is(&a).await, 1);
        assert_eq!(where_is(&b).await, 1);
        assert!(a.singleton.is_leading());
        assert!(!b.singleton.is_leading());
        assert_eq!(b.system.actor_count(), 0);
    }

    #[tokio::test]
    async fn singleton_fails_over_to_next_candidate() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, None).await;
        let b = node(&coord, &network, 2, None).await;
        assert_eq!(where_is(&b).await, 1);

        network.deregister(a.system.host_port());
        a.session.expire();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(where_is(&b).await, 2);
        assert!(b.singleton.is_leading());
    }

    #[tokio::test]
    async fn inbound_deliveries_pass_through_the_mailbox() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, None).await;
        let b = node(&coord, &network, 2, None).await;

        // b runs no instance; its served path forwards to the leader.
        let reply = tokio::time::timeout(
            Duration::from_secs(1),
            b.system.deliver("clock", Message::new("where", vec![])),
        )
        .await
        .expect("delivery should be answered")
        .unwrap();
        assert_eq!(crate::error::decode::<u16>(&reply).unwrap(), 1);
        assert_eq!(b.system.actor_count(), 0);

        a.singleton.shutdown().await.unwrap();
        assert!(a.system.deliver("clock", Message::new("where", vec![])).await.is_err());
    }

    #[tokio::test]
    async fn auxiliary_runs_only_on_the_leader() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let started = Arc::new(AtomicUsize::new(0));
        let auxiliary: Auxiliary = {
            let started = Arc::clone(&started);
            Arc::new(move || {
                started.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().boxed()
            })
        };
        let a = node(&coord, &network, 1, Some(Arc::clone(&auxiliary))).await;
        let _b = node(&coord, &network, 2, Some(auxiliary)).await;
        where_is(&a).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_hands_leadership_over() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1, None).await;
        let b = node(&coord, &network, 2, None).await;
        assert_eq!(where_is(&b).await, 1);

        a.singleton.shutdown().await.unwrap();
        assert_eq!(a.system.actor_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(where_is(&b).await, 2);
    }
}
