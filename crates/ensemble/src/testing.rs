//! In-process multi-node test cluster.
//!
//! Nodes share one [`MemoryCoordination`], one [`LocalNetwork`] and one
//! [`MemoryJournal`], so a whole cluster runs inside a single test without
//! external services. Each node gets its own coordination session, which can
//! be expired to simulate a crash.

use std::sync::Arc;

use crate::actor::LocalNetwork;
use crate::cluster::ClusterNode;
use crate::config::ClusterConfig;
use crate::coordination::memory::{MemoryCoordination, MemorySession};
use crate::metrics::ClusterMetrics;
use crate::persistence::memory::MemoryJournal;
use crate::types::HostPort;

const FIRST_PORT: u16 = 34322;

/// One node of a [`TestCluster`] together with its coordination session.
pub struct TestNode {
    pub node: ClusterNode,
    pub session: Arc<MemorySession>,
}

/// A cluster of in-process nodes for tests.
///
/// # Example
///
/// ```ignore
/// let cluster = TestCluster::new(3).await;
/// let users = demo::register(cluster.node(0)).unwrap();
/// cluster.crash(0).await;
/// cluster.shutdown().await;
/// ```
pub struct TestCluster {
    config: ClusterConfig,
    coordination: MemoryCoordination,
    network: Arc<LocalNetwork>,
    journal: MemoryJournal,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `size` nodes with default configuration.
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, ClusterConfig::default()).await
    }

    /// Start `size` nodes. Each node gets `config` with its own remoting port.
    pub async fn with_config(size: usize, config: ClusterConfig) -> Self {
        let mut cluster = Self {
            journal: MemoryJournal::new(config.journal_shard_count),
            config,
            coordination: MemoryCoordination::new(),
            network: Arc::new(LocalNetwork::new()),
            nodes: Vec::new(),
        };
        for _ in 0..size {
            cluster.add_node().await;
        }
        cluster
    }

    /// Start one more node and return its index.
    pub async fn add_node(&mut self) -> usize {
        let index = self.nodes.len();
        let port = FIRST_PORT + index as u16;
        let config = ClusterConfig {
            remoting: Some(HostPort::new("127.0.0.1", port)),
            ..self.config.clone()
        };
        let session = Arc::new(self.coordination.session());
        let node = ClusterNode::start(
            config,
            Arc::clone(&session) as Arc<dyn crate::coordination::Coordination>,
            Arc::clone(&self.network) as Arc<dyn crate::actor::RemoteTransport>,
            Arc::new(self.journal.clone()),
            Arc::new(ClusterMetrics::unregistered()),
        )
        .await
        .expect("TestCluster node should start");
        self.nodes.push(TestNode { node, session });
        index
    }

    pub fn node(&self, index: usize) -> &ClusterNode {
        &self.nodes[index].node
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().map(|n| &n.node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Journal shared by every node.
    pub fn journal(&self) -> &MemoryJournal {
        &self.journal
    }

    pub fn coordination(&self) -> &MemoryCoordination {
        &self.coordination
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Kill a node: stop its work and expire its session so every candidate
    /// it held disappears.
    pub async fn crash(&self, index: usize) {
        let test_node = &self.nodes[index];
        test_node.node.abort().await;
        test_node.session.expire();
    }

    /// Gracefully stop every node that is still alive.
    pub async fn shutdown(&self) {
        for test_node in &self.nodes {
            if test_node.session.is_expired() {
                continue;
            }
            if let Err(e) = test_node.node.shutdown().await {
                tracing::warn!(host_port = %test_node.node.host_port(), error = %e, "test node shutdown failed");
            }
        }
    }
}
