//! Leader election over the coordination service.
//!
//! Each election scope is a directory under the coordination root. Candidates
//! are ephemeral-sequential children named `candidate-<seq>` whose payload is
//! the JSON-encoded [`HostPort`] of the node that joined. The leader is the
//! lowest-sequence living candidate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::coordination::{join_path, Coordination, CreateMode};
use crate::error::ClusterError;
use crate::types::{HostPort, MemberId};

/// Name prefix of candidate nodes inside a scope.
pub const CANDIDATE_PREFIX: &str = "candidate-";

/// States of the [`ElectionService::run_on_leader`] loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    /// Reading the scope to find the current leader.
    Electing,
    /// This node's candidate is the leader.
    Leading,
    /// Another candidate leads the scope.
    Following(MemberId),
}

/// Reusable election primitives bound to one coordination session.
#[derive(Clone)]
pub struct ElectionService {
    coordination: Arc<dyn Coordination>,
    root: String,
    host_port: HostPort,
    retry_delay: Duration,
}

impl ElectionService {
    pub fn new(
        coordination: Arc<dyn Coordination>,
        root: impl Into<String>,
        host_port: HostPort,
        retry_delay: Duration,
    ) -> Self {
        Self {
            coordination,
            root: root.into(),
            host_port,
            retry_delay,
        }
    }

    /// Address published by this node's candidates.
    pub fn host_port(&self) -> &HostPort {
        &self.host_port
    }

    pub fn coordination(&self) -> &Arc<dyn Coordination> {
        &self.coordination
    }

    /// Full coordination path of a scope directory.
    pub fn scope_path(&self, scope: &str) -> String {
        join_path(&self.root, scope)
    }

    /// Full coordination path of a candidate inside a scope.
    pub fn candidate_path(&self, scope: &str, candidate: &MemberId) -> String {
        join_path(&self.scope_path(scope), candidate.as_ref())
    }

    /// Create the scope directory. Idempotent.
    pub async fn init_scope(&self, scope: &str) -> Result<(), ClusterError> {
        self.coordination.mkdir(&self.scope_path(scope)).await
    }

    /// Enter the election for `scope`, returning the full path of our candidate.
    #[instrument(skip(self))]
    pub async fn join(&self, scope: &str) -> Result<String, ClusterError> {
        let payload = serde_json::to_vec(&self.host_port)
            .map_err(|e| ClusterError::codec("encode candidate payload", e))?;
        let prefix = join_path(&self.scope_path(scope), CANDIDATE_PREFIX);
        let path = self
            .coordination
            .create(&prefix, CreateMode::EphemeralSequential, &payload)
            .await?;
        tracing::debug!(scope, path = %path, "joined election");
        Ok(path)
    }

    /// Withdraw a candidate. A candidate that is already gone is not an error.
    pub async fn leave(&self, path: &str) -> Result<(), ClusterError> {
        match self.coordination.remove(path).await {
            Ok(()) | Err(ClusterError::NoNode { .. }) => {
                tracing::debug!(path, "left election");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Lowest-sequence living candidate of `scope`, if any.
    pub async fn leader_id(&self, scope: &str) -> Result<Option<MemberId>, ClusterError> {
        let children = self.coordination.get_children(&self.scope_path(scope)).await?;
        Ok(children
            .into_iter()
            .filter(|c| c.starts_with(CANDIDATE_PREFIX))
            .min()
            .map(MemberId::new))
    }

    /// All living candidates of `scope`, in election order.
    pub async fn candidates(&self, scope: &str) -> Result<Vec<MemberId>, ClusterError> {
        let children = self.coordination.get_children(&self.scope_path(scope)).await?;
        Ok(children
            .into_iter()
            .filter(|c| c.starts_with(CANDIDATE_PREFIX))
            .map(MemberId::new)
            .collect())
    }

    /// Resolve once the current leader of `scope` is gone.
    ///
    /// Fails with [`ClusterError::NoLeader`] if the scope has no leader.
    pub async fn watch_leader(&self, scope: &str) -> Result<(), ClusterError> {
        let leader = self
            .leader_id(scope)
            .await?
            .ok_or_else(|| ClusterError::NoLeader {
                scope: scope.to_string(),
            })?;
        self.coordination
            .wait_delete(&self.candidate_path(scope, &leader))
            .await
    }

    /// Address published by a candidate of `scope`.
    pub async fn leader_host_port(
        &self,
        scope: &str,
        leader: &MemberId,
    ) -> Result<HostPort, ClusterError> {
        let data = self
            .coordination
            .get_data(&self.candidate_path(scope, leader))
            .await?;
        serde_json::from_slice(&data).map_err(|e| ClusterError::codec("decode candidate payload", e))
    }

    /// Drive leadership for `scope` until `cancel` fires.
    ///
    /// `my_path` is this node's candidate path as returned by [`join`](Self::join).
    /// While our candidate leads, `on_leader` runs; it is expected to run for as
    /// long as leadership holds and is restarted if it returns. Otherwise
    /// `follower_of(leader)` runs and is cancelled as soon as the leader's
    /// candidate disappears. Coordination errors are logged and retried after
    /// the configured delay.
    #[instrument(skip(self, on_leader, follower_of, cancel))]
    pub async fn run_on_leader<L, LF, F, FF>(
        &self,
        scope: &str,
        my_path: &str,
        mut on_leader: L,
        mut follower_of: F,
        cancel: CancellationToken,
    ) where
        L: FnMut() -> LF,
        LF: Future<Output = ()>,
        F: FnMut(MemberId) -> FF,
        FF: Future<Output = ()>,
    {
        let my_id = MemberId::from_path(my_path);
        let mut state = ElectionState::Electing;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            state = match state {
                ElectionState::Electing => match self.leader_id(scope).await {
                    Ok(Some(leader)) if leader == my_id => ElectionState::Leading,
                    Ok(Some(leader)) => ElectionState::Following(leader),
                    Ok(None) => {
                        tracing::debug!(scope, "no leader yet, retrying");
                        if self.pause(&cancel).await {
                            return;
                        }
                        ElectionState::Electing
                    }
                    Err(e) => {
                        tracing::warn!(scope, error = %e, "failed to read election scope, retrying");
                        if self.pause(&cancel).await {
                            return;
                        }
                        ElectionState::Electing
                    }
                },
                ElectionState::Leading => {
                    tracing::info!(scope, candidate = %my_id, "leadership acquired");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = on_leader() => {
                            tracing::debug!(scope, "leader branch returned, re-electing");
                        }
                    }
                    ElectionState::Electing
                }
                ElectionState::Following(leader) => {
                    tracing::debug!(scope, leader = %leader, "following");
                    let leader_path = self.candidate_path(scope, &leader);
                    let departure = self.coordination.wait_delete(&leader_path);
                    tokio::pin!(departure);
                    let follower = follower_of(leader.clone());
                    tokio::pin!(follower);

                    let departed = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = &mut departure => Some(result),
                        _ = &mut follower => None,
                    };
                    // A follower branch that finishes early still waits for
                    // the leader to go before re-electing.
                    let result = match departed {
                        Some(result) => result,
                        None => tokio::select! {
                            _ = cancel.cancelled() => return,
                            result = &mut departure => result,
                        },
                    };
                    match result {
                        Ok(()) => tracing::info!(scope, leader = %leader, "leader departed"),
                        Err(e) => {
                            tracing::warn!(scope, error = %e, "leader watch failed, retrying");
                            if self.pause(&cancel).await {
                                return;
                            }
                        }
                    }
                    ElectionState::Electing
                }
            };
        }
    }

    /// Sleep for the retry delay. Returns true if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.retry_delay) => false,
        }
    }
}
