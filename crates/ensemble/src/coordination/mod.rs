//! Coordination service client surface.
//!
//! A ZooKeeper-like hierarchical namespace: persistent directories, ephemeral
//! nodes bound to the creating session, and ephemeral-sequential nodes whose
//! names carry a fixed-width monotonic suffix so that lexical order equals
//! creation order.

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;

use crate::error::ClusterError;

/// Width of the numeric suffix appended to sequential nodes.
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a monotonic suffix appended to the given prefix.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

/// Client of the coordination service.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Create a persistent directory and any missing parents. Idempotent.
    async fn mkdir(&self, path: &str) -> Result<(), ClusterError>;

    /// Create a node. For sequential modes `prefix` is extended with the
    /// sequence suffix; the full path of the created node is returned.
    async fn create(
        &self,
        prefix: &str,
        mode: CreateMode,
        data: &[u8],
    ) -> Result<String, ClusterError>;

    /// Delete a node.
    async fn remove(&self, path: &str) -> Result<(), ClusterError>;

    /// Names (not full paths) of the direct children of `path`, sorted.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, ClusterError>;

    /// Payload of a node.
    async fn get_data(&self, path: &str) -> Result<Vec<u8>, ClusterError>;

    /// Resolve once `path` no longer exists. Resolves immediately if it is absent.
    async fn wait_delete(&self, path: &str) -> Result<(), ClusterError>;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a path, `/` for top-level nodes.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

pub(crate) fn sequential_name(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:0width$}", width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_parent() {
        assert_eq!(join_path("/a/b", "c"), "/a/b/c");
        assert_eq!(join_path("/", "c"), "/c");
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
    }

    #[test]
    fn sequential_names_sort_by_sequence() {
        let nine = sequential_name("/s/candidate-", 9);
        let ten = sequential_name("/s/candidate-", 10);
        assert_eq!(nine, "/s/candidate-0000000009");
        assert!(nine < ten);
    }
}
