//! A cluster node: configuration, coordination, actor system, membership and
//! the dispatchers registered on it.
//!
//! # Example
//!
//! ```ignore
//! let node = ClusterNode::start(config, coordination, transport, journal, metrics).await?;
//! let users = node.persistent("users", users::message_to_id(), |_| (UsersHandler, UserState::Initial))?;
//! let reply = users.ask(users::create("mike")?).await?;
//! node.shutdown().await?;
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::actor::{ActorSystem, Behavior, Handle, LoggingSupervisor, RemoteTransport};
use crate::config::ClusterConfig;
use crate::coordination::Coordination;
use crate::dispatcher::{MessageToId, ShardedDispatcher};
use crate::election::ElectionService;
use crate::error::ClusterError;
use crate::instance_runner::InstanceFactory;
use crate::membership::Membership;
use crate::metrics::ClusterMetrics;
use crate::persistence::transactional::{PersistentHandler, Transactional};
use crate::persistence::JournalStorage;
use crate::singleton::{Auxiliary, SingletonDispatcher, SingletonFactory};
use crate::types::{EntityId, HostPort};

/// Address used by a node that is not clustered and has no remoting address.
const STANDALONE_HOST_PORT: (&str, u16) = ("localhost", 0);

/// One node of the cluster.
pub struct ClusterNode {
    config: ClusterConfig,
    system: ActorSystem,
    election: ElectionService,
    transport: Arc<dyn RemoteTransport>,
    journal: Arc<dyn JournalStorage>,
    membership: Option<Membership>,
    dispatchers: DashMap<String, Arc<ShardedDispatcher>>,
    singletons: DashMap<String, Arc<SingletonDispatcher>>,
    metrics: Arc<ClusterMetrics>,
    cancel: CancellationToken,
}

impl ClusterNode {
    /// Validate `config`, start the actor system and, when clustered, join the
    /// cluster's membership.
    #[instrument(skip_all, fields(cluster = %config.cluster_name, system = %config.system_name))]
    pub async fn start(
        config: ClusterConfig,
        coordination: Arc<dyn Coordination>,
        transport: Arc<dyn RemoteTransport>,
        journal: Arc<dyn JournalStorage>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let host_port = config.remoting.clone().unwrap_or_else(|| {
            HostPort::new(STANDALONE_HOST_PORT.0, STANDALONE_HOST_PORT.1)
        });

        let system = ActorSystem::new(
            config.system_name.clone(),
            config.scheme.clone(),
            host_port.clone(),
            Arc::clone(&transport),
        );
        let election = ElectionService::new(
            coordination,
            config.coordination_root.clone(),
            host_port.clone(),
            config.leader_retry_delay,
        );
        let cancel = CancellationToken::new();
        transport.attach(&system);

        let membership = if config.clustered {
            let started = Membership::start(
                system.clone(),
                election.clone(),
                config.cluster_scope(),
                config.membership_resync_interval,
                Arc::clone(&metrics),
                cancel.child_token(),
            )
            .await;
            match started {
                Ok(membership) => Some(membership),
                Err(e) => {
                    transport.detach(&host_port);
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::info!(host_port = %host_port, clustered = config.clustered, "cluster node started");
        Ok(Self {
            config,
            system,
            election,
            transport,
            journal,
            membership,
            dispatchers: DashMap::new(),
            singletons: DashMap::new(),
            metrics,
            cancel,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    pub fn host_port(&self) -> &HostPort {
        self.system.host_port()
    }

    pub fn election(&self) -> &ElectionService {
        &self.election
    }

    pub fn journal(&self) -> &Arc<dyn JournalStorage> {
        &self.journal
    }

    pub fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }

    /// Membership of this node, `None` when not clustered.
    pub fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    /// Dispatcher registered for `kind`.
    pub fn dispatcher(&self, kind: &str) -> Option<Arc<ShardedDispatcher>> {
        self.dispatchers.get(kind).map(|d| Arc::clone(d.value()))
    }

    /// Singleton registered under `name`.
    pub fn singleton_dispatcher(&self, name: &str) -> Option<Arc<SingletonDispatcher>> {
        self.singletons.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Register a sharded actor kind. Instances run at path `<kind>/<id>` on
    /// the node that owns the id.
    pub fn sharded<B, F>(
        &self,
        kind: &str,
        message_to_id: MessageToId,
        make: F,
    ) -> Result<Arc<ShardedDispatcher>, ClusterError>
    where
        B: Behavior,
        F: Fn(&EntityId) -> (B, B::State) + Send + Sync + 'static,
    {
        let entry = match self.dispatchers.entry(kind.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ClusterError::InvalidConfig {
                    reason: format!("actor kind {kind:?} is already registered"),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let make = Arc::new(make);
        let factory: InstanceFactory = {
            let system = self.system.clone();
            let kind = kind.to_string();
            Arc::new(move |id: EntityId| {
                let system = system.clone();
                let (behavior, initial) = make(&id);
                let path = format!("{kind}/{id}");
                async move {
                    let handle =
                        system.spawn(&path, Arc::new(LoggingSupervisor), behavior, initial)?;
                    Ok::<Handle, ClusterError>(handle.into_handle())
                }
                .boxed()
            })
        };

        let dispatcher = ShardedDispatcher::start(
            kind,
            &self.config,
            self.system.clone(),
            self.election.clone(),
            factory,
            message_to_id,
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        );
        entry.insert(Arc::clone(&dispatcher));
        Ok(dispatcher)
    }

    /// Register a sharded kind whose instances journal every message through
    /// this node's journal.
    pub fn persistent<H, F>(
        &self,
        kind: &str,
        message_to_id: MessageToId,
        make: F,
    ) -> Result<Arc<ShardedDispatcher>, ClusterError>
    where
        H: PersistentHandler,
        F: Fn(&EntityId) -> (H, H::State) + Send + Sync + 'static,
    {
        let journal = Arc::clone(&self.journal);
        self.sharded(kind, message_to_id, move |id| {
            let (handler, initial) = make(id);
            (Transactional::new(handler, Arc::clone(&journal)), initial)
        })
    }

    /// Register a cluster-wide singleton running at path `<name>` on the
    /// leader of scope `singleton-<name>`.
    pub async fn singleton<B, F>(
        &self,
        name: &str,
        make: F,
        auxiliary: Option<Auxiliary>,
    ) -> Result<Arc<SingletonDispatcher>, ClusterError>
    where
        B: Behavior,
        F: Fn() -> (B, B::State) + Send + Sync + 'static,
    {
        if self.singletons.contains_key(name) {
            return Err(ClusterError::InvalidConfig {
                reason: format!("singleton {name:?} is already registered"),
            });
        }
        let make = Arc::new(make);
        let factory: SingletonFactory = {
            let system = self.system.clone();
            let path = name.to_string();
            Arc::new(move || {
                let system = system.clone();
                let (behavior, initial) = make();
                let path = path.clone();
                async move {
                    let handle =
                        system.spawn(&path, Arc::new(LoggingSupervisor), behavior, initial)?;
                    Ok::<Handle, ClusterError>(handle.into_handle())
                }
                .boxed()
            })
        };
        let singleton = SingletonDispatcher::start(
            name.to_string(),
            self.system.clone(),
            self.election.clone(),
            factory,
            auxiliary,
            self.config.leader_retry_delay,
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        )
        .await?;
        self.singletons
            .insert(name.to_string(), Arc::clone(&singleton));
        Ok(singleton)
    }

    /// Graceful shutdown: hand over every owned id and singleton, leave the
    /// cluster and stop the actor system.
    #[instrument(skip(self), fields(host_port = %self.system.host_port()))]
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        let dispatchers: Vec<Arc<ShardedDispatcher>> =
            self.dispatchers.iter().map(|d| Arc::clone(d.value())).collect();
        for dispatcher in dispatchers {
            dispatcher.shutdown().await;
        }

        let singletons: Vec<Arc<SingletonDispatcher>> =
            self.singletons.iter().map(|s| Arc::clone(s.value())).collect();
        for singleton in singletons {
            if let Err(e) = singleton.shutdown().await {
                tracing::warn!(singleton = %singleton.name(), error = %e, "singleton shutdown failed");
            }
        }

        if let Some(membership) = &self.membership {
            if let Err(e) = membership.leave().await {
                tracing::warn!(error = %e, "failed to leave cluster membership");
            }
        }

        self.cancel.cancel();
        self.transport.detach(self.system.host_port());
        self.system.shutdown().await;
        tracing::info!("cluster node stopped");
        Ok(())
    }

    /// Stop all local work without touching the coordination service, as a
    /// crashed process would. Candidates disappear only when the session does.
    pub async fn abort(&self) {
        self.cancel.cancel();
        self.transport.detach(self.system.host_port());
        self.system.shutdown().await;
        tracing::warn!(host_port = %self.system.host_port(), "cluster node aborted");
    }
}
