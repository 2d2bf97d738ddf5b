use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::actor::handle::{ActorHandle, Handle, LocalHandle};
use crate::actor::supervisor::Supervisor;
use crate::actor::transport::{RemoteHandle, RemoteTransport};
use crate::actor::Message;
use crate::error::ClusterError;
use crate::types::{ActorAddress, HostPort};

/// Message processing logic of an actor.
///
/// `receive` is called for one message at a time with exclusive access to the
/// actor's state. The returned bytes are the reply to an `ask`.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    type State: Send + 'static;

    async fn receive(
        &self,
        state: &mut Self::State,
        ctx: &ActorContext,
        message: Message,
    ) -> Result<Vec<u8>, ClusterError>;
}

/// Resolves paths under a served prefix to handles.
///
/// Used for endpoints that are not a single actor, such as a dispatcher that
/// accepts traffic for every id of its kind.
pub trait Router: Send + Sync {
    fn route(&self, path: &str) -> Result<Handle, ClusterError>;
}

/// Context handed to a behavior with every message.
#[derive(Clone)]
pub struct ActorContext {
    address: ActorAddress,
    system: ActorSystem,
}

impl ActorContext {
    pub fn address(&self) -> &ActorAddress {
        &self.address
    }

    pub fn path(&self) -> &str {
        &self.address.path
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// `<system>(<path>)`, e.g. `EffectTsActorsDemo(users/mike)`.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}({})", self.system.name(), self.address.path)
    }
}

/// Registry of local actors and served endpoints of one node.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    name: String,
    scheme: String,
    host_port: HostPort,
    actors: DashMap<String, LocalHandle>,
    routers: DashMap<String, Arc<dyn Router>>,
    transport: Arc<dyn RemoteTransport>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ActorSystem {
    /// Create an actor system reachable at `host_port` that reaches other
    /// nodes through `transport`.
    pub fn new(
        name: impl Into<String>,
        scheme: impl Into<String>,
        host_port: HostPort,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(SystemInner {
                name: name.into(),
                scheme: scheme.into(),
                host_port,
                actors: DashMap::new(),
                routers: DashMap::new(),
                transport,
                next_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn host_port(&self) -> &HostPort {
        &self.inner.host_port
    }

    /// Address of `path` on this node.
    pub fn address_of(&self, path: &str) -> ActorAddress {
        ActorAddress::new(
            self.inner.scheme.clone(),
            self.inner.name.clone(),
            self.inner.host_port.clone(),
            path,
        )
    }

    /// Address of `path` on the node at `host_port`.
    pub fn remote_address(&self, host_port: HostPort, path: &str) -> ActorAddress {
        ActorAddress::new(
            self.inner.scheme.clone(),
            self.inner.name.clone(),
            host_port,
            path,
        )
    }

    /// Start an actor at `path`.
    pub fn spawn<B: Behavior>(
        &self,
        path: &str,
        supervisor: Arc<dyn Supervisor>,
        behavior: B,
        initial_state: B::State,
    ) -> Result<LocalHandle, ClusterError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ClusterError::ShuttingDown);
        }
        let path = path.trim_start_matches('/').to_string();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = ActorContext {
            address: self.address_of(&path),
            system: self.clone(),
        };

        match self.inner.actors.entry(path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ClusterError::ActorExists { path }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let weak: Weak<SystemInner> = Arc::downgrade(&self.inner);
                let exit_path = path.clone();
                let handle = LocalHandle::start(id, ctx, supervisor, behavior, initial_state, move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.actors.remove_if(&exit_path, |_, h| h.id() == id);
                    }
                });
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Expose `router` for every path equal to or below `prefix`.
    pub fn serve(&self, prefix: &str, router: Arc<dyn Router>) {
        let prefix = prefix.trim_matches('/').to_string();
        tracing::debug!(system = %self.inner.name, prefix = %prefix, "serving endpoint");
        self.inner.routers.insert(prefix, router);
    }

    pub fn unserve(&self, prefix: &str) {
        self.inner.routers.remove(prefix.trim_matches('/'));
    }

    /// Handle for a path on this node: the router serving the longest matching
    /// prefix, otherwise the actor running at exactly that path.
    ///
    /// Served prefixes win so that traffic for sharded instances always passes
    /// through their dispatcher.
    pub fn lookup(&self, path: &str) -> Result<Handle, ClusterError> {
        let path = path.trim_start_matches('/');
        let router = self
            .inner
            .routers
            .iter()
            .filter(|entry| {
                let prefix = entry.key().as_str();
                path == prefix
                    || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
            })
            .max_by_key(|entry| entry.key().len())
            .map(|entry| Arc::clone(entry.value()));
        if let Some(router) = router {
            return router.route(path);
        }
        match self.inner.actors.get(path) {
            Some(handle) => Ok(handle.value().clone().into_handle()),
            None => Err(ClusterError::ActorNotFound {
                path: path.to_string(),
            }),
        }
    }

    /// Deliver an inbound `ask` addressed to `path` on this node.
    pub async fn deliver(&self, path: &str, message: Message) -> Result<Vec<u8>, ClusterError> {
        self.lookup(path)?.ask(message).await
    }

    /// Handle for an actor address. Addresses of this node resolve locally.
    pub fn resolve_remote(&self, address: &ActorAddress) -> Handle {
        let transport: Arc<dyn RemoteTransport> = if self.is_local(address) {
            Arc::new(Loopback {
                system: Arc::downgrade(&self.inner),
            })
        } else {
            Arc::clone(&self.inner.transport)
        };
        Arc::new(RemoteHandle::new(address.clone(), transport))
    }

    pub fn is_local(&self, address: &ActorAddress) -> bool {
        address.host_port == self.inner.host_port && address.system == self.inner.name
    }

    /// Number of running actors.
    pub fn actor_count(&self) -> usize {
        self.inner.actors.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Stop every running actor and drop all served endpoints.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.routers.clear();
        let handles: Vec<LocalHandle> = self
            .inner
            .actors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            match handle.stop().await {
                Ok(0) => {}
                Ok(undelivered) => tracing::warn!(
                    actor = %handle.address(),
                    undelivered,
                    "actor stopped with undelivered messages during shutdown"
                ),
                Err(e) => tracing::warn!(actor = %handle.address(), error = %e, "failed to stop actor"),
            }
        }
        tracing::info!(system = %self.inner.name, "actor system shut down");
    }
}

/// Transport for addresses that point back at this node.
struct Loopback {
    system: Weak<SystemInner>,
}

impl Loopback {
    fn lookup(&self, to: &ActorAddress) -> Result<Handle, ClusterError> {
        let inner = self.system.upgrade().ok_or(ClusterError::ShuttingDown)?;
        ActorSystem { inner }.lookup(&to.path)
    }
}

#[async_trait]
impl RemoteTransport for Loopback {
    async fn ask(&self, to: &ActorAddress, message: Message) -> Result<Vec<u8>, ClusterError> {
        self.lookup(to)?.ask(message).await
    }

    async fn tell(&self, to: &ActorAddress, message: Message) -> Result<(), ClusterError> {
        self.lookup(to)?.tell(message).await
    }

    async fn stop(&self, to: &ActorAddress) -> Result<usize, ClusterError> {
        self.lookup(to)?.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::supervisor::{LoggingSupervisor, StopSupervisor};
    use crate::actor::LocalNetwork;
    use std::time::Duration;

    struct Counter;

    #[async_trait]
    impl Behavior for Counter {
        type State = u64;

        async fn receive(
            &self,
            state: &mut u64,
            ctx: &ActorContext,
            message: Message,
        ) -> Result<Vec<u8>, ClusterError> {
            match message.tag.as_str() {
                "inc" => {
                    *state += 1;
                    Ok(state.to_be_bytes().to_vec())
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Vec::new())
                }
                "fail" => Err(ClusterError::handler("boom")),
                "name" => Ok(ctx.fully_qualified_name().into_bytes()),
                _ => Ok(state.to_be_bytes().to_vec()),
            }
        }
    }

    fn system() -> ActorSystem {
        ActorSystem::new(
            "EffectTsActorsDemo",
            "ensemble",
            HostPort::new("127.0.0.1", 1),
            Arc::new(LocalNetwork::new()),
        )
    }

    fn count(bytes: Vec<u8>) -> u64 {
        u64::from_be_bytes(bytes.try_into().unwrap())
    }

    #[tokio::test]
    async fn ask_is_processed_sequentially() {
        let sys = system();
        let handle = sys
            .spawn("counter", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        for expected in 1..=3 {
            let reply = handle.ask(Message::new("inc", vec![])).await.unwrap();
            assert_eq!(count(reply), expected);
        }
    }

    #[tokio::test]
    async fn fully_qualified_name_uses_system_and_path() {
        let sys = system();
        let handle = sys
            .spawn("users/mike", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        let reply = handle.ask(Message::new("name", vec![])).await.unwrap();
        assert_eq!(String::from_utf8(reply).unwrap(), "EffectTsActorsDemo(users/mike)");
    }

    #[tokio::test]
    async fn duplicate_path_is_rejected() {
        let sys = system();
        sys.spawn("a", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        let err = sys
            .spawn("a", Arc::new(LoggingSupervisor), Counter, 0)
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::ActorExists { .. }));
    }

    #[tokio::test]
    async fn failure_resumes_under_logging_supervisor() {
        let sys = system();
        let handle = sys
            .spawn("a", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        handle.ask(Message::new("inc", vec![])).await.unwrap();
        let err = handle.ask(Message::new("fail", vec![])).await.unwrap_err();
        assert!(matches!(err, ClusterError::HandlerFailed { .. }));
        let reply = handle.ask(Message::new("get", vec![])).await.unwrap();
        assert_eq!(count(reply), 1);
    }

    #[tokio::test]
    async fn failure_stops_under_stop_supervisor() {
        let sys = system();
        let handle = sys
            .spawn("a", Arc::new(StopSupervisor), Counter, 0)
            .unwrap();
        assert!(handle.ask(Message::new("fail", vec![])).await.is_err());
        let err = handle.ask(Message::new("get", vec![])).await.unwrap_err();
        assert!(matches!(err, ClusterError::MailboxClosed { .. }));
    }

    #[tokio::test]
    async fn stop_reports_undelivered_messages() {
        let sys = system();
        let handle = sys
            .spawn("a", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        handle.tell(Message::new("slow", vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.tell(Message::new("inc", vec![])).await.unwrap();
        handle.tell(Message::new("inc", vec![])).await.unwrap();

        let undelivered = handle.stop().await.unwrap();
        assert_eq!(undelivered, 2);
        assert!(handle.is_stopped());
        assert_eq!(sys.actor_count(), 0);
        assert_eq!(handle.stop().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_of_idle_actor_has_nothing_undelivered() {
        let sys = system();
        let handle = sys
            .spawn("a", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        handle.ask(Message::new("inc", vec![])).await.unwrap();
        assert_eq!(handle.stop().await.unwrap(), 0);
        // The path can be reused once the actor is gone.
        sys.spawn("a", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
    }

    struct Fixed(Handle);

    impl Router for Fixed {
        fn route(&self, _path: &str) -> Result<Handle, ClusterError> {
            Ok(Arc::clone(&self.0))
        }
    }

    #[tokio::test]
    async fn lookup_prefers_served_prefix_over_actor() {
        let sys = system();
        let counter = sys
            .spawn("counter", Arc::new(LoggingSupervisor), Counter, 41)
            .unwrap();
        sys.spawn("users/mike", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        sys.serve("users", Arc::new(Fixed(counter.clone().into_handle())));

        let reply = sys.deliver("users/mike", Message::new("inc", vec![])).await.unwrap();
        assert_eq!(count(reply), 42);
        assert!(matches!(
            sys.lookup("usersx/mike").err().unwrap(),
            ClusterError::ActorNotFound { .. }
        ));
        assert!(sys.lookup("counter").is_ok());
    }

    #[tokio::test]
    async fn resolve_remote_short_circuits_locally() {
        let sys = system();
        sys.spawn("counter", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        let address = sys.address_of("counter");
        let handle = sys.resolve_remote(&address);
        let reply = handle.ask(Message::new("inc", vec![])).await.unwrap();
        assert_eq!(count(reply), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let sys = system();
        let handle = sys
            .spawn("a", Arc::new(LoggingSupervisor), Counter, 0)
            .unwrap();
        sys.shutdown().await;
        assert!(handle.is_stopped());
        assert!(matches!(
            sys.spawn("b", Arc::new(LoggingSupervisor), Counter, 0).err().unwrap(),
            ClusterError::ShuttingDown
        ));
    }
}
