use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::coordination::{parent_path, sequential_name, Coordination, CreateMode};
use crate::error::ClusterError;

/// In-memory coordination service shared by any number of sessions.
///
/// Each [`MemorySession`] owns the ephemeral nodes it creates. Expiring a
/// session deletes them, the same way a crashed client loses its nodes.
#[derive(Clone)]
pub struct MemoryCoordination {
    store: Arc<Store>,
}

struct Store {
    inner: Mutex<Inner>,
    /// Bumped on every deletion so `wait_delete` callers re-check.
    deletions: watch::Sender<u64>,
    next_session: AtomicU64,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    /// Next sequence number per parent directory.
    sequences: HashMap<String, u64>,
}

struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let (deletions, _) = watch::channel(0);
        Self {
            store: Arc::new(Store {
                inner: Mutex::new(Inner::default()),
                deletions,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new client session.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            store: Arc::clone(&self.store),
            id: self.store.next_session.fetch_add(1, Ordering::Relaxed),
            expired: AtomicBool::new(false),
        }
    }

    /// Number of nodes currently stored (excluding the implicit root).
    pub fn node_count(&self) -> usize {
        self.store.inner.lock().nodes.len()
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    fn bump(&self) {
        self.deletions.send_modify(|rev| *rev += 1);
    }
}

impl Inner {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children_of<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let start = prefix.clone();
        self.nodes
            .range(start..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter_map(move |(k, _)| {
                let rest = &k[k.rfind('/').map(|i| i + 1).unwrap_or(0)..];
                (parent_path(k) == path).then_some(rest)
            })
    }
}

/// A client session on a [`MemoryCoordination`] store.
pub struct MemorySession {
    store: Arc<Store>,
    id: u64,
    expired: AtomicBool,
}

impl MemorySession {
    /// End this session, deleting every ephemeral node it owns.
    pub fn expire(&self) {
        if self.expired.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = {
            let mut inner = self.store.inner.lock();
            let before = inner.nodes.len();
            inner.nodes.retain(|_, node| node.owner != Some(self.id));
            before - inner.nodes.len()
        };
        tracing::debug!(session = self.id, removed, "coordination session expired");
        self.store.bump();
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> Result<(), ClusterError> {
        if self.is_expired() {
            return Err(ClusterError::Coordination {
                reason: format!("session {} expired", self.id),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Coordination for MemorySession {
    async fn mkdir(&self, path: &str) -> Result<(), ClusterError> {
        self.check_alive()?;
        let mut inner = self.store.inner.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            inner.nodes.entry(current.clone()).or_insert(Node {
                data: Vec::new(),
                owner: None,
            });
        }
        Ok(())
    }

    async fn create(
        &self,
        prefix: &str,
        mode: CreateMode,
        data: &[u8],
    ) -> Result<String, ClusterError> {
        self.check_alive()?;
        let mut inner = self.store.inner.lock();
        let parent = parent_path(prefix).to_string();
        if !inner.exists(&parent) {
            return Err(ClusterError::NoNode { path: parent });
        }

        let path = if mode.is_sequential() {
            let seq = inner.sequences.entry(parent).or_insert(0);
            *seq += 1;
            sequential_name(prefix, *seq)
        } else {
            prefix.to_string()
        };

        if inner.nodes.contains_key(&path) {
            return Err(ClusterError::NodeExists { path });
        }
        inner.nodes.insert(
            path.clone(),
            Node {
                data: data.to_vec(),
                owner: mode.is_ephemeral().then_some(self.id),
            },
        );
        Ok(path)
    }

    async fn remove(&self, path: &str) -> Result<(), ClusterError> {
        self.check_alive()?;
        {
            let mut inner = self.store.inner.lock();
            if inner.children_of(path).next().is_some() {
                return Err(ClusterError::Coordination {
                    reason: format!("node {path} has children"),
                    source: None,
                });
            }
            if inner.nodes.remove(path).is_none() {
                return Err(ClusterError::NoNode {
                    path: path.to_string(),
                });
            }
        }
        self.store.bump();
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, ClusterError> {
        self.check_alive()?;
        let inner = self.store.inner.lock();
        if !inner.exists(path) {
            return Err(ClusterError::NoNode {
                path: path.to_string(),
            });
        }
        let mut children: Vec<String> = inner.children_of(path).map(str::to_string).collect();
        children.sort();
        Ok(children)
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, ClusterError> {
        self.check_alive()?;
        let inner = self.store.inner.lock();
        inner
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| ClusterError::NoNode {
                path: path.to_string(),
            })
    }

    async fn wait_delete(&self, path: &str) -> Result<(), ClusterError> {
        self.check_alive()?;
        // Subscribe before checking so a deletion between the check and the
        // wait is not missed.
        let mut rx = self.store.deletions.subscribe();
        loop {
            if !self.store.inner.lock().exists(path) {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(ClusterError::Coordination {
                    reason: "coordination store dropped".to_string(),
                    source: None,
                });
            }
        }
    }
}
