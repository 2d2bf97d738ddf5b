use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, LeaseGrantOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::Mutex;

use crate::coordination::{parent_path, sequential_name, Coordination, CreateMode};
use crate::error::ClusterError;

/// Key prefix holding per-directory sequence counters.
const SEQUENCES_PREFIX: &str = "/.sequences";

/// etcd-backed coordination session.
///
/// One lease is granted per session and kept alive by a background task.
/// Ephemeral nodes are attached to that lease, so they disappear when the
/// process stops refreshing it.
pub struct EtcdCoordination {
    client: Arc<Mutex<Client>>,
    lease_id: i64,
    keep_alive_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EtcdCoordination {
    /// Grant a session lease and start keeping it alive.
    ///
    /// - `client`: Connected etcd client.
    /// - `lease_ttl`: TTL in seconds of the session lease.
    pub async fn connect(client: Client, lease_ttl: i64) -> Result<Self, ClusterError> {
        if lease_ttl <= 0 {
            return Err(ClusterError::InvalidConfig {
                reason: format!("lease_ttl must be positive, got {lease_ttl}"),
            });
        }
        let client = Arc::new(Mutex::new(client));
        let lease_id = {
            let mut c = client.lock().await;
            c.lease_grant(lease_ttl, None::<LeaseGrantOptions>)
                .await
                .map_err(map_err)?
                .id()
        };
        let handle = spawn_keep_alive(Arc::clone(&client), lease_id, lease_ttl);
        tracing::info!(lease_id, lease_ttl, "etcd coordination session started");
        Ok(Self {
            client,
            lease_id,
            keep_alive_handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    /// Revoke the session lease, deleting every ephemeral node of this session.
    pub async fn close(&self) -> Result<(), ClusterError> {
        if let Some(handle) = self.keep_alive_handle.lock().take() {
            handle.abort();
        }
        let mut c = self.client.lock().await;
        c.lease_revoke(self.lease_id).await.map_err(map_err)?;
        tracing::info!(lease_id = self.lease_id, "etcd coordination session closed");
        Ok(())
    }

    async fn next_sequence(&self, parent: &str) -> Result<u64, ClusterError> {
        let key = format!("{SEQUENCES_PREFIX}{parent}");
        const MAX_CAS_RETRIES: u32 = 100;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > MAX_CAS_RETRIES {
                return Err(ClusterError::Coordination {
                    reason: format!(
                        "sequence CAS failed after {MAX_CAS_RETRIES} retries on key '{key}'"
                    ),
                    source: None,
                });
            }

            let claimed = {
                let mut c = self.client.lock().await;
                let resp = c.get(key.as_bytes(), None).await.map_err(map_err)?;
                let (current, mod_revision) = match resp.kvs().first() {
                    Some(kv) => {
                        let value = std::str::from_utf8(kv.value())
                            .ok()
                            .and_then(|s| s.parse::<u64>().ok())
                            .ok_or_else(|| ClusterError::Coordination {
                                reason: format!("sequence counter '{key}' is not an integer"),
                                source: None,
                            })?;
                        (value, kv.mod_revision())
                    }
                    None => (0, 0),
                };
                let candidate = current + 1;
                let guard = if mod_revision == 0 {
                    Compare::create_revision(key.clone(), CompareOp::Equal, 0)
                } else {
                    Compare::mod_revision(key.clone(), CompareOp::Equal, mod_revision)
                };
                let txn = Txn::new()
                    .when([guard])
                    .and_then([TxnOp::put(key.clone(), candidate.to_string(), None)]);
                let resp = c.txn(txn).await.map_err(map_err)?;
                resp.succeeded().then_some(candidate)
            };

            if let Some(sequence) = claimed {
                return Ok(sequence);
            }
            tracing::debug!(attempt, key = %key, "etcd sequence CAS conflict, retrying");
            let backoff_ms = (1u64 << attempt.min(6)).min(100);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, ClusterError> {
        if path == "/" {
            return Ok(true);
        }
        let mut c = self.client.lock().await;
        let resp = c
            .get(path, Some(GetOptions::new().with_keys_only()))
            .await
            .map_err(map_err)?;
        Ok(!resp.kvs().is_empty())
    }
}

impl Drop for EtcdCoordination {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive_handle.lock().take() {
            handle.abort();
        }
    }
}

fn map_err(e: etcd_client::Error) -> ClusterError {
    ClusterError::Coordination {
        reason: e.to_string(),
        source: Some(Box::new(e)),
    }
}

/// How one keep-alive stream ended.
enum Refresh {
    /// The server reports the lease as gone.
    Expired,
    /// The stream broke; a new one may still save the lease.
    Broken,
}

/// Refresh the lease over one keep-alive stream until it breaks.
async fn refresh_until_broken(
    client: &Mutex<Client>,
    lease_id: i64,
    interval: Duration,
    last_ack: &mut Instant,
) -> Refresh {
    let opened = {
        let mut c = client.lock().await;
        c.lease_keep_alive(lease_id).await
    };
    let (mut keeper, mut stream) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(lease_id, error = %e, "failed to open etcd keep-alive stream");
            return Refresh::Broken;
        }
    };
    loop {
        if let Err(e) = keeper.keep_alive().await {
            tracing::warn!(lease_id, error = %e, "etcd keep-alive request failed");
            return Refresh::Broken;
        }
        match tokio::time::timeout(interval, stream.message()).await {
            Ok(Ok(Some(resp))) if resp.ttl() > 0 => *last_ack = Instant::now(),
            Ok(Ok(Some(_))) => return Refresh::Expired,
            Ok(Ok(None)) => return Refresh::Broken,
            Ok(Err(e)) => {
                tracing::warn!(lease_id, error = %e, "etcd keep-alive response failed");
                return Refresh::Broken;
            }
            Err(_) => return Refresh::Broken,
        }
        tokio::time::sleep(interval).await;
    }
}

/// Keep the session lease alive. Once a whole TTL passes without an
/// acknowledged refresh the server has dropped the lease, so every ephemeral
/// node of the session is gone and retrying is pointless.
fn spawn_keep_alive(
    client: Arc<Mutex<Client>>,
    lease_id: i64,
    lease_ttl: i64,
) -> tokio::task::JoinHandle<()> {
    let ttl = Duration::from_secs(lease_ttl.unsigned_abs());
    let interval = (ttl / 3).max(Duration::from_millis(500));
    tokio::spawn(async move {
        let mut last_ack = Instant::now();
        loop {
            match refresh_until_broken(&client, lease_id, interval, &mut last_ack).await {
                Refresh::Expired => {
                    tracing::error!(lease_id, "etcd session lease expired");
                    return;
                }
                Refresh::Broken if last_ack.elapsed() >= ttl => {
                    tracing::error!(lease_id, "etcd session lease lapsed while disconnected");
                    return;
                }
                Refresh::Broken => {
                    tracing::debug!(lease_id, "reopening etcd keep-alive stream");
                    tokio::time::sleep(interval.min(Duration::from_secs(1))).await;
                }
            }
        }
    })
}

#[async_trait]
impl Coordination for EtcdCoordination {
    async fn mkdir(&self, path: &str) -> Result<(), ClusterError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            let txn = Txn::new()
                .when([Compare::create_revision(
                    current.clone(),
                    CompareOp::Equal,
                    0,
                )])
                .and_then([TxnOp::put(current.clone(), Vec::<u8>::new(), None)]);
            let mut c = self.client.lock().await;
            c.txn(txn).await.map_err(map_err)?;
        }
        Ok(())
    }

    async fn create(
        &self,
        prefix: &str,
        mode: CreateMode,
        data: &[u8],
    ) -> Result<String, ClusterError> {
        let parent = parent_path(prefix);
        if !self.exists(parent).await? {
            return Err(ClusterError::NoNode {
                path: parent.to_string(),
            });
        }
        let path = if mode.is_sequential() {
            sequential_name(prefix, self.next_sequence(parent).await?)
        } else {
            prefix.to_string()
        };
        let options = mode
            .is_ephemeral()
            .then(|| PutOptions::new().with_lease(self.lease_id));
        let txn = Txn::new()
            .when([Compare::create_revision(path.clone(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(path.clone(), data.to_vec(), options)]);

        let resp = {
            let mut c = self.client.lock().await;
            c.txn(txn).await.map_err(map_err)?
        };
        if !resp.succeeded() {
            return Err(ClusterError::NodeExists { path });
        }
        Ok(path)
    }

    async fn remove(&self, path: &str) -> Result<(), ClusterError> {
        if !self.get_children(path).await.unwrap_or_default().is_empty() {
            return Err(ClusterError::Coordination {
                reason: format!("node {path} has children"),
                source: None,
            });
        }
        let mut c = self.client.lock().await;
        let resp = c.delete(path, None).await.map_err(map_err)?;
        if resp.deleted() == 0 {
            return Err(ClusterError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, ClusterError> {
        if !self.exists(path).await? {
            return Err(ClusterError::NoNode {
                path: path.to_string(),
            });
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let resp = {
            let mut c = self.client.lock().await;
            c.get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(map_err)?
        };
        let mut children: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        children.sort();
        Ok(children)
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, ClusterError> {
        let mut c = self.client.lock().await;
        let resp = c.get(path, None).await.map_err(map_err)?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| ClusterError::NoNode {
                path: path.to_string(),
            })
    }

    async fn wait_delete(&self, path: &str) -> Result<(), ClusterError> {
        // Watch from the revision after the read so no delete can slip between
        // the existence check and the watch.
        let (mut watcher, mut stream) = {
            let mut c = self.client.lock().await;
            let resp = c.get(path, None).await.map_err(map_err)?;
            if resp.kvs().is_empty() {
                return Ok(());
            }
            let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
            c.watch(
                path,
                Some(WatchOptions::new().with_start_revision(revision + 1)),
            )
            .await
            .map_err(map_err)?
        };

        loop {
            match stream.message().await.map_err(map_err)? {
                Some(resp) => {
                    if resp.canceled() {
                        return Err(ClusterError::Coordination {
                            reason: format!("watch on {path} was canceled"),
                            source: None,
                        });
                    }
                    if resp
                        .events()
                        .iter()
                        .any(|e| e.event_type() == EventType::Delete)
                    {
                        let _ = watcher.cancel().await;
                        return Ok(());
                    }
                }
                None => {
                    return Err(ClusterError::Coordination {
                        reason: format!("watch stream on {path} ended"),
                        source: None,
                    });
                }
            }
        }
    }
}
