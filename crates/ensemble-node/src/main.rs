//! Ensemble node - runs the users demo on a set of in-process nodes
//!
//! Run with: `cargo run --package ensemble-node -- --nodes 3 --user mike`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ensemble::actor::{LocalNetwork, RemoteTransport};
use ensemble::coordination::memory::MemoryCoordination;
use ensemble::coordination::Coordination;
use ensemble::demo;
use ensemble::metrics::ClusterMetrics;
use ensemble::persistence::memory::MemoryJournal;
use ensemble::persistence::JournalStorage;
use ensemble::types::HostPort;
use ensemble::{ClusterConfig, ClusterNode};
use prometheus::{Registry, TextEncoder};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ensemble-node", about = "Run the users demo on in-process ensemble nodes")]
struct Args {
    /// Number of nodes to start.
    #[arg(long, env = "ENSEMBLE_NODES", default_value_t = 3)]
    nodes: u16,

    /// Host every node binds its remoting address to.
    #[arg(long, env = "ENSEMBLE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port of the first node; the others take the following ports.
    #[arg(long, env = "ENSEMBLE_PORT", default_value_t = 34322)]
    port: u16,

    #[arg(long, env = "ENSEMBLE_CLUSTER_NAME", default_value = "ensemble")]
    cluster_name: String,

    /// Idle time in seconds before a user instance is passivated.
    #[arg(long, env = "ENSEMBLE_PASSIVATE_AFTER_SECS")]
    passivate_after_secs: Option<u64>,

    /// User created from every node on startup.
    #[arg(long, env = "ENSEMBLE_USER", default_value = "mike")]
    user: String,

    /// Comma separated etcd endpoints. In-memory coordination when unset.
    #[cfg(feature = "etcd")]
    #[arg(long, env = "ENSEMBLE_ETCD_ENDPOINTS", value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// TTL in seconds of each node's etcd session lease.
    #[cfg(feature = "etcd")]
    #[arg(long, env = "ENSEMBLE_ETCD_LEASE_TTL", default_value_t = 10)]
    etcd_lease_ttl: i64,

    /// PostgreSQL connection url. In-memory journal when unset.
    #[cfg(feature = "sql")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

impl Args {
    fn config(&self, index: u16) -> ClusterConfig {
        ClusterConfig {
            cluster_name: self.cluster_name.clone(),
            system_name: demo::SYSTEM_NAME.to_string(),
            remoting: Some(HostPort::new(self.host.clone(), self.port + index)),
            passivate_after: self.passivate_after_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

/// Coordination sessions are per node, so crashes stay isolated.
enum Coordinator {
    Memory(MemoryCoordination),
    #[cfg(feature = "etcd")]
    Etcd {
        endpoints: Vec<String>,
        lease_ttl: i64,
    },
}

impl Coordinator {
    #[cfg_attr(not(feature = "etcd"), allow(unused_variables))]
    fn from_args(args: &Args) -> Self {
        #[cfg(feature = "etcd")]
        if !args.etcd_endpoints.is_empty() {
            return Coordinator::Etcd {
                endpoints: args.etcd_endpoints.clone(),
                lease_ttl: args.etcd_lease_ttl,
            };
        }
        Coordinator::Memory(MemoryCoordination::new())
    }

    async fn session(&self) -> anyhow::Result<Arc<dyn Coordination>> {
        match self {
            Coordinator::Memory(coordination) => Ok(Arc::new(coordination.session())),
            #[cfg(feature = "etcd")]
            Coordinator::Etcd {
                endpoints,
                lease_ttl,
            } => {
                let client = etcd_client::Client::connect(endpoints, None)
                    .await
                    .context("connecting to etcd")?;
                let session =
                    ensemble::coordination::etcd::EtcdCoordination::connect(client, *lease_ttl)
                        .await?;
                Ok(Arc::new(session))
            }
        }
    }
}

#[cfg_attr(not(feature = "sql"), allow(unused_variables))]
async fn journal(args: &Args) -> anyhow::Result<Arc<dyn JournalStorage>> {
    let shard_count = ClusterConfig::default().journal_shard_count;
    #[cfg(feature = "sql")]
    if let Some(url) = &args.database_url {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .context("connecting to postgres")?;
        let journal = ensemble::persistence::sql::SqlJournal::new(pool, shard_count);
        journal.migrate().await?;
        tracing::info!("using postgres journal");
        return Ok(Arc::new(journal));
    }
    Ok(Arc::new(MemoryJournal::new(shard_count)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ensemble=info".parse()?))
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.nodes > 0, "--nodes must be at least 1");

    let coordinator = Coordinator::from_args(&args);
    let network: Arc<dyn RemoteTransport> = Arc::new(LocalNetwork::new());
    let journal = journal(&args).await?;
    let registry = Registry::new();

    let mut nodes = Vec::with_capacity(args.nodes as usize);
    for index in 0..args.nodes {
        let config = args.config(index);
        let label = config
            .remoting
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("node-{index}"));
        let node = ClusterNode::start(
            config,
            coordinator.session().await?,
            Arc::clone(&network),
            Arc::clone(&journal),
            Arc::new(ClusterMetrics::for_node(&registry, &label)?),
        )
        .await
        .with_context(|| format!("starting node {index}"))?;
        let users = demo::register(&node)?;
        nodes.push((node, users));
    }

    for (node, users) in &nodes {
        let reply = demo::create_user(users, &args.user).await?;
        let state = demo::get_user(users, &args.user).await?;
        tracing::info!(node = %node.host_port(), ?reply, ?state, "users demo");
    }
    if let Some(membership) = nodes[0].0.membership() {
        tracing::info!(members = ?membership.members(), "cluster membership");
    }
    log_metrics(&registry);

    tracing::info!("running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    for (node, _) in nodes.iter().rev() {
        if let Err(e) = node.shutdown().await {
            tracing::warn!(node = %node.host_port(), error = %e, "node shutdown failed");
        }
    }
    log_metrics(&registry);
    tracing::info!("ensemble node shutdown");
    Ok(())
}

fn log_metrics(registry: &Registry) {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(text) => tracing::info!("metrics\n{text}"),
        Err(e) => tracing::warn!(error = %e, "failed to encode metrics"),
    }
}
