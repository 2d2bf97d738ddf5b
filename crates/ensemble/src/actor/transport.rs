use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::actor::handle::ActorHandle;
use crate::actor::system::ActorSystem;
use crate::actor::Message;
use crate::error::ClusterError;
use crate::types::{ActorAddress, HostPort};

/// Carries ask/tell/stop to an actor on another node.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn ask(&self, to: &ActorAddress, message: Message) -> Result<Vec<u8>, ClusterError>;

    async fn tell(&self, to: &ActorAddress, message: Message) -> Result<(), ClusterError>;

    async fn stop(&self, to: &ActorAddress) -> Result<usize, ClusterError>;

    /// Start accepting inbound traffic for `system`.
    fn attach(&self, _system: &ActorSystem) {}

    /// Stop accepting inbound traffic for the node at `host_port`.
    fn detach(&self, _host_port: &HostPort) {}
}

/// Handle that forwards every operation through a [`RemoteTransport`].
///
/// The target is resolved on each call, so a handle outlives restarts of the
/// actor it points at.
pub struct RemoteHandle {
    address: ActorAddress,
    transport: Arc<dyn RemoteTransport>,
}

impl RemoteHandle {
    pub fn new(address: ActorAddress, transport: Arc<dyn RemoteTransport>) -> Self {
        Self { address, transport }
    }
}

#[async_trait]
impl ActorHandle for RemoteHandle {
    fn address(&self) -> &ActorAddress {
        &self.address
    }

    async fn ask(&self, message: Message) -> Result<Vec<u8>, ClusterError> {
        self.transport.ask(&self.address, message).await
    }

    async fn tell(&self, message: Message) -> Result<(), ClusterError> {
        self.transport.tell(&self.address, message).await
    }

    async fn stop(&self) -> Result<usize, ClusterError> {
        self.transport.stop(&self.address).await
    }
}

/// In-process network connecting actor systems by host and port.
///
/// Nodes of a test cluster share one `LocalNetwork`; a node that is
/// deregistered becomes unreachable, like a process that went away.
#[derive(Default)]
pub struct LocalNetwork {
    systems: DashMap<HostPort, ActorSystem>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, system: &ActorSystem) {
        tracing::debug!(host_port = %system.host_port(), "node attached to local network");
        self.systems.insert(system.host_port().clone(), system.clone());
    }

    pub fn deregister(&self, host_port: &HostPort) {
        if self.systems.remove(host_port).is_some() {
            tracing::debug!(host_port = %host_port, "node detached from local network");
        }
    }

    fn system(&self, to: &ActorAddress) -> Result<ActorSystem, ClusterError> {
        self.systems
            .get(&to.host_port)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::ActorNotFound {
                path: to.to_string(),
            })
    }
}

#[async_trait]
impl RemoteTransport for LocalNetwork {
    async fn ask(&self, to: &ActorAddress, message: Message) -> Result<Vec<u8>, ClusterError> {
        let system = self.system(to)?;
        system.lookup(&to.path)?.ask(message).await
    }

    async fn tell(&self, to: &ActorAddress, message: Message) -> Result<(), ClusterError> {
        let system = self.system(to)?;
        system.lookup(&to.path)?.tell(message).await
    }

    async fn stop(&self, to: &ActorAddress) -> Result<usize, ClusterError> {
        let system = self.system(to)?;
        system.lookup(&to.path)?.stop().await
    }

    fn attach(&self, system: &ActorSystem) {
        self.register(system);
    }

    fn detach(&self, host_port: &HostPort) {
        self.deregister(host_port);
    }
}
