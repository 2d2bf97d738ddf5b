use crate::error::ClusterError;
use crate::types::HostPort;
use std::time::Duration;

/// Configuration for a cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Name of the cluster. The membership scope is `cluster-<name>`.
    pub cluster_name: String,
    /// Actor system name, used in remote addresses and persistence ids.
    pub system_name: String,
    /// Scheme used in remote actor addresses. Default: "ensemble".
    pub scheme: String,
    /// Address this node is reachable on. Required when `clustered` is set.
    pub remoting: Option<HostPort>,
    /// Whether this node participates in a cluster. Default: true.
    pub clustered: bool,
    /// Root directory for all coordination nodes. Default: "/ensemble".
    pub coordination_root: String,
    /// Idle time after which a sharded instance is passivated. None disables passivation.
    pub passivate_after: Option<Duration>,
    /// How often the passivation sweep runs. Default: 1s.
    pub passivation_sweep_interval: Duration,
    /// Maximum number of queued messages routed in one dispatch round. Default: 100.
    pub dispatch_batch_size: usize,
    /// Number of storage partitions for journal rows. Default: 16.
    pub journal_shard_count: u32,
    /// Delay before re-reading an election scope that has no leader. Default: 100ms.
    pub leader_retry_delay: Duration,
    /// How often the membership leader re-reads the member list. Default: 5s.
    pub membership_resync_interval: Duration,
}

impl ClusterConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - a clustered node has a remoting address
    /// - `dispatch_batch_size >= 1`
    /// - `journal_shard_count >= 1`
    /// - durations are non-zero
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.clustered && self.remoting.is_none() {
            return Err(ClusterError::InvalidConfig {
                reason: "clustering requires a remoting address".to_string(),
            });
        }
        if self.cluster_name.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "cluster_name must not be empty".to_string(),
            });
        }
        if self.system_name.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "system_name must not be empty".to_string(),
            });
        }
        if !self.coordination_root.starts_with('/') {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "coordination_root must be an absolute path, got {:?}",
                    self.coordination_root
                ),
            });
        }
        if self.dispatch_batch_size == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "dispatch_batch_size must be >= 1".to_string(),
            });
        }
        if self.journal_shard_count == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "journal_shard_count must be >= 1".to_string(),
            });
        }
        if matches!(self.passivate_after, Some(d) if d.is_zero()) {
            return Err(ClusterError::InvalidConfig {
                reason: "passivate_after must be > 0 when set".to_string(),
            });
        }
        if self.passivation_sweep_interval.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "passivation_sweep_interval must be > 0".to_string(),
            });
        }
        if self.leader_retry_delay.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "leader_retry_delay must be > 0".to_string(),
            });
        }
        if self.membership_resync_interval.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "membership_resync_interval must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Membership scope for this cluster.
    pub fn cluster_scope(&self) -> String {
        format!("cluster-{}", self.cluster_name)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            system_name: "ensemble".to_string(),
            scheme: "ensemble".to_string(),
            remoting: Some(HostPort::new("127.0.0.1", 34322)),
            clustered: true,
            coordination_root: "/ensemble".to_string(),
            passivate_after: None,
            passivation_sweep_interval: Duration::from_secs(1),
            dispatch_batch_size: 100,
            journal_shard_count: 16,
            leader_retry_delay: Duration::from_millis(100),
            membership_resync_interval: Duration::from_secs(5),
        }
    }
}
