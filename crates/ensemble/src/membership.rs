//! Cluster membership.
//!
//! Every node joins one election scope per cluster (`cluster-<name>`). The
//! leader of that scope reconciles the member lists of all nodes: it learns
//! about joins and departures from the coordination service and tells each
//! member which peers to add or remove. Each node keeps its own view in a
//! mailbox actor at path [`MEMBERSHIP_PATH`], so updates are applied one at a
//! time in arrival order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::actor::{
    ActorContext, ActorHandle, ActorSystem, Behavior, Handle, LocalHandle, LoggingSupervisor,
    Message,
};
use crate::election::ElectionService;
use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::types::{HostPort, MemberId};

/// Path of the membership mailbox on every node.
pub const MEMBERSHIP_PATH: &str = "membership";

const MEMBERSHIP_TAG: &str = "membership";

/// Commands understood by the membership mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipCommand {
    /// Re-read the scope and replace the view with its candidates.
    Init,
    /// Leader only: a member joined; reconcile it with everyone else.
    Join(MemberId),
    /// Leader only: a member left; tell everyone else.
    Leave(MemberId),
    /// Add a member to the local view.
    Add(MemberId),
    /// Remove a member from the local view.
    Remove(MemberId),
    /// Reply with the current view.
    GetMembers,
}

impl MembershipCommand {
    fn to_message(&self) -> Result<Message, ClusterError> {
        Message::encode(MEMBERSHIP_TAG, self)
    }
}

struct Core {
    system: ActorSystem,
    election: ElectionService,
    scope: String,
    my_id: MemberId,
    host_ports: DashMap<MemberId, HostPort>,
    view: watch::Sender<BTreeSet<MemberId>>,
    metrics: Arc<ClusterMetrics>,
}

impl Core {
    async fn member_host_port(&self, id: &MemberId) -> Result<HostPort, ClusterError> {
        if let Some(host_port) = self.host_ports.get(id) {
            return Ok(host_port.value().clone());
        }
        let host_port = self.election.leader_host_port(&self.scope, id).await?;
        self.host_ports.insert(id.clone(), host_port.clone());
        Ok(host_port)
    }

    /// Best-effort delivery to a member's mailbox.
    async fn tell(&self, to: &MemberId, command: &MembershipCommand) {
        let result = async {
            let host_port = self.member_host_port(to).await?;
            let address = self.system.remote_address(host_port, MEMBERSHIP_PATH);
            self.system
                .resolve_remote(&address)
                .tell(command.to_message()?)
                .await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(scope = %self.scope, member = %to, command = ?command, error = %e, "membership tell failed");
        }
    }

    fn publish(&self, members: &BTreeSet<MemberId>) {
        self.metrics.members.set(members.len() as i64);
        self.view.send_replace(members.clone());
    }
}

/// Mailbox behavior owning this node's view of the cluster.
struct MembershipMailbox {
    core: Arc<Core>,
}

#[async_trait]
impl Behavior for MembershipMailbox {
    type State = BTreeSet<MemberId>;

    async fn receive(
        &self,
        members: &mut BTreeSet<MemberId>,
        _ctx: &ActorContext,
        message: Message,
    ) -> Result<Vec<u8>, ClusterError> {
        let core = &self.core;
        let command: MembershipCommand = message.decode()?;
        match command {
            MembershipCommand::Init => {
                let candidates = core.election.candidates(&core.scope).await?;
                *members = candidates.into_iter().collect();
                tracing::debug!(scope = %core.scope, members = members.len(), "membership initialised");
            }
            MembershipCommand::Join(joined) => {
                let others: Vec<MemberId> = members
                    .iter()
                    .filter(|m| **m != joined)
                    .cloned()
                    .collect();
                for member in others.iter().filter(|m| **m != core.my_id) {
                    core.tell(member, &MembershipCommand::Add(joined.clone())).await;
                }
                if joined != core.my_id {
                    for member in &others {
                        core.tell(&joined, &MembershipCommand::Add(member.clone())).await;
                    }
                }
                if members.insert(joined.clone()) {
                    tracing::info!(scope = %core.scope, member = %joined, "member joined");
                }
            }
            MembershipCommand::Leave(left) => {
                if members.remove(&left) {
                    tracing::info!(scope = %core.scope, member = %left, "member left");
                }
                let others: Vec<MemberId> = members
                    .iter()
                    .filter(|m| **m != core.my_id)
                    .cloned()
                    .collect();
                for member in &others {
                    core.tell(member, &MembershipCommand::Remove(left.clone())).await;
                }
                core.host_ports.remove(&left);
            }
            MembershipCommand::Add(member) => {
                if members.insert(member.clone()) {
                    tracing::debug!(scope = %core.scope, member = %member, "member added");
                }
            }
            MembershipCommand::Remove(member) => {
                if members.remove(&member) {
                    tracing::debug!(scope = %core.scope, member = %member, "member removed");
                }
                core.host_ports.remove(&member);
            }
            MembershipCommand::GetMembers => {
                let snapshot: Vec<MemberId> = members.iter().cloned().collect();
                return crate::error::encode(&snapshot);
            }
        }
        core.publish(members);
        Ok(Vec::new())
    }
}

async fn enqueue(mailbox: &Handle, command: MembershipCommand) {
    let result = match command.to_message() {
        Ok(message) => mailbox.tell(message).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(command = ?command, error = %e, "failed to enqueue membership command");
    }
}

/// Leader branch: reconcile joins and departures until leadership ends.
async fn lead(core: Arc<Core>, mailbox: Handle, resync_interval: Duration) {
    core.metrics.leadership_changes.inc();
    tracing::info!(scope = %core.scope, "membership leadership acquired");

    let watchers = CancellationToken::new();
    let _stop_watchers = watchers.clone().drop_guard();
    let known: Arc<Mutex<BTreeSet<MemberId>>> = Arc::new(Mutex::new(BTreeSet::new()));

    enqueue(&mailbox, MembershipCommand::Init).await;
    loop {
        match core.election.candidates(&core.scope).await {
            Ok(current) => {
                let current: BTreeSet<MemberId> = current.into_iter().collect();
                let (joined, departed) = {
                    let mut known = known.lock();
                    let joined: Vec<MemberId> = current.difference(&known).cloned().collect();
                    let departed: Vec<MemberId> = known.difference(&current).cloned().collect();
                    known.extend(joined.iter().cloned());
                    for member in &departed {
                        known.remove(member);
                    }
                    (joined, departed)
                };
                for member in joined {
                    enqueue(&mailbox, MembershipCommand::Join(member.clone())).await;
                    if member != core.my_id {
                        watch_member(&core, &mailbox, &known, &watchers, member);
                    }
                }
                for member in departed {
                    enqueue(&mailbox, MembershipCommand::Leave(member)).await;
                }
            }
            Err(e) => {
                tracing::warn!(scope = %core.scope, error = %e, "membership resync failed");
            }
        }
        tokio::time::sleep(resync_interval).await;
    }
}

/// Enqueue a `Leave` once the member's candidate is deleted.
fn watch_member(
    core: &Arc<Core>,
    mailbox: &Handle,
    known: &Arc<Mutex<BTreeSet<MemberId>>>,
    watchers: &CancellationToken,
    member: MemberId,
) {
    let path = core.election.candidate_path(&core.scope, &member);
    let coordination = Arc::clone(core.election.coordination());
    let mailbox = Arc::clone(mailbox);
    let known = Arc::clone(known);
    let cancel = watchers.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = coordination.wait_delete(&path) => {
                if let Err(e) = result {
                    tracing::warn!(member = %member, error = %e, "member watch failed");
                    return;
                }
                let departed = known.lock().remove(&member);
                if departed {
                    enqueue(&mailbox, MembershipCommand::Leave(member)).await;
                }
            }
        }
    });
}

/// Follower branch: refresh the local view and announce ourselves.
async fn follow(core: Arc<Core>, mailbox: Handle, leader: MemberId) {
    enqueue(&mailbox, MembershipCommand::Init).await;
    core.tell(&leader, &MembershipCommand::Join(core.my_id.clone()))
        .await;
}

/// This node's membership in a cluster.
pub struct Membership {
    core: Arc<Core>,
    my_path: String,
    mailbox: LocalHandle,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Membership {
    /// Join the cluster scope and start the membership mailbox and the
    /// leadership loop.
    #[instrument(skip(system, election, metrics, cancel))]
    pub async fn start(
        system: ActorSystem,
        election: ElectionService,
        scope: String,
        resync_interval: Duration,
        metrics: Arc<ClusterMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self, ClusterError> {
        election.init_scope(&scope).await?;
        let my_path = election.join(&scope).await?;
        let my_id = MemberId::from_path(&my_path);
        let seed = BTreeSet::from([my_id.clone()]);

        let host_ports = DashMap::new();
        host_ports.insert(my_id.clone(), election.host_port().clone());
        let core = Arc::new(Core {
            system: system.clone(),
            election: election.clone(),
            scope: scope.clone(),
            my_id: my_id.clone(),
            host_ports,
            view: watch::channel(seed.clone()).0,
            metrics,
        });
        core.publish(&seed);

        let mailbox = match system.spawn(
            MEMBERSHIP_PATH,
            Arc::new(LoggingSupervisor),
            MembershipMailbox {
                core: Arc::clone(&core),
            },
            seed,
        ) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                election.leave(&my_path).await?;
                return Err(e);
            }
        };

        let task = {
            let core = Arc::clone(&core);
            let handle = mailbox.clone().into_handle();
            let my_path = my_path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let lead_core = Arc::clone(&core);
                let lead_mailbox = Arc::clone(&handle);
                election
                    .run_on_leader(
                        &scope,
                        &my_path,
                        move || lead(Arc::clone(&lead_core), Arc::clone(&lead_mailbox), resync_interval),
                        move |leader| follow(Arc::clone(&core), Arc::clone(&handle), leader),
                        cancel,
                    )
                    .await
            })
        };

        tracing::info!(member = %my_id, "joined cluster");
        Ok(Self {
            core,
            my_path,
            mailbox,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// This node's member id.
    pub fn my_id(&self) -> &MemberId {
        &self.core.my_id
    }

    pub fn scope(&self) -> &str {
        &self.core.scope
    }

    /// Current view of the cluster, in election order.
    pub fn members(&self) -> BTreeSet<MemberId> {
        self.core.view.borrow().clone()
    }

    /// First member of the current view.
    pub fn leader(&self) -> Option<MemberId> {
        self.core.view.borrow().first().cloned()
    }

    /// Receiver notified on every change of the view.
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<MemberId>> {
        self.core.view.subscribe()
    }

    /// View as seen by the mailbox, after everything queued before it.
    pub async fn fetch_members(&self) -> Result<Vec<MemberId>, ClusterError> {
        let reply = self
            .mailbox
            .ask(MembershipCommand::GetMembers.to_message()?)
            .await?;
        crate::error::decode(&reply)
    }

    /// Address a member published when it joined. Memoized per member.
    pub async fn member_host_port(&self, id: &MemberId) -> Result<HostPort, ClusterError> {
        self.core.member_host_port(id).await
    }

    /// Leave the cluster: stop the leadership loop, withdraw our candidate and
    /// stop the mailbox.
    #[instrument(skip(self), fields(member = %self.core.my_id))]
    pub async fn leave(&self) -> Result<(), ClusterError> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.core.election.leave(&self.my_path).await?;
        self.mailbox.stop().await?;
        tracing::info!("left cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::LocalNetwork;
    use crate::coordination::memory::{MemoryCoordination, MemorySession};

    struct Node {
        session: Arc<MemorySession>,
        membership: Membership,
    }

    async fn node(coord: &MemoryCoordination, network: &Arc<LocalNetwork>, port: u16) -> Node {
        let session = Arc::new(coord.session());
        let host_port = HostPort::new("127.0.0.1", port);
        let system = ActorSystem::new(
            "demo",
            "ensemble",
            host_port.clone(),
            Arc::clone(network) as Arc<dyn crate::actor::RemoteTransport>,
        );
        network.register(&system);
        let election = ElectionService::new(
            Arc::clone(&session) as Arc<dyn crate::coordination::Coordination>,
            "/ensemble",
            host_port,
            Duration::from_millis(10),
        );
        let membership = Membership::start(
            system,
            election,
            "cluster-test".to_string(),
            Duration::from_millis(20),
            Arc::new(ClusterMetrics::unregistered()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        Node {
            session,
            membership,
        }
    }

    async fn converge(membership: &Membership, expected: usize) -> BTreeSet<MemberId> {
        let mut rx = membership.subscribe();
        let members = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|m| m.len() == expected))
            .await
            .expect("membership should converge")
            .unwrap()
            .clone();
        members
    }

    #[tokio::test]
    async fn all_nodes_converge_on_the_same_view() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1).await;
        let b = node(&coord, &network, 2).await;
        let c = node(&coord, &network, 3).await;

        let view = converge(&a.membership, 3).await;
        assert_eq!(converge(&b.membership, 3).await, view);
        assert_eq!(converge(&c.membership, 3).await, view);
        assert_eq!(b.membership.leader(), Some(a.membership.my_id().clone()));
        assert_eq!(
            c.membership.fetch_members().await.unwrap(),
            view.into_iter().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn crashed_member_is_removed_everywhere() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1).await;
        let b = node(&coord, &network, 2).await;
        let c = node(&coord, &network, 3).await;
        converge(&a.membership, 3).await;
        converge(&c.membership, 3).await;

        network.deregister(&HostPort::new("127.0.0.1", 2));
        b.session.expire();

        let view = converge(&a.membership, 2).await;
        assert!(!view.contains(b.membership.my_id()));
        assert_eq!(converge(&c.membership, 2).await, view);
    }

    #[tokio::test]
    async fn leader_crash_hands_reconciliation_over() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1).await;
        let b = node(&coord, &network, 2).await;
        converge(&b.membership, 2).await;

        network.deregister(&HostPort::new("127.0.0.1", 1));
        a.session.expire();
        converge(&b.membership, 1).await;
        assert_eq!(b.membership.leader(), Some(b.membership.my_id().clone()));

        // The new leader reconciles nodes that join later.
        let c = node(&coord, &network, 3).await;
        let view = converge(&b.membership, 2).await;
        assert_eq!(converge(&c.membership, 2).await, view);
    }

    #[tokio::test]
    async fn member_host_port_reads_candidate_payload() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1).await;
        let b = node(&coord, &network, 2).await;
        assert_eq!(
            a.membership
                .member_host_port(b.membership.my_id())
                .await
                .unwrap(),
            HostPort::new("127.0.0.1", 2)
        );
    }

    #[tokio::test]
    async fn graceful_leave_is_seen_by_others() {
        let coord = MemoryCoordination::new();
        let network = Arc::new(LocalNetwork::new());
        let a = node(&coord, &network, 1).await;
        let b = node(&coord, &network, 2).await;
        converge(&a.membership, 2).await;

        b.membership.leave().await.unwrap();
        converge(&a.membership, 1).await;
    }
}
