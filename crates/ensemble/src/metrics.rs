use std::collections::HashMap;

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Node-level prometheus metrics.
pub struct ClusterMetrics {
    /// Members in this node's view of the cluster.
    pub members: IntGauge,
    /// Instances currently running on this node.
    pub active_instances: IntGauge,
    /// Cached dispatcher routes.
    pub cached_routes: IntGauge,
    /// Instances stopped by the passivation sweep.
    pub passivations: IntCounter,
    /// Times this node gained leadership of any scope.
    pub leadership_changes: IntCounter,
}

impl ClusterMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Self::with_const_labels(registry, HashMap::new())
    }

    /// Register one node's metrics in a registry shared by several nodes.
    ///
    /// Every series carries a `node` label set to `node`.
    pub fn for_node(registry: &Registry, node: &str) -> Result<Self, prometheus::Error> {
        Self::with_const_labels(
            registry,
            HashMap::from([("node".to_string(), node.to_string())]),
        )
    }

    fn with_const_labels(
        registry: &Registry,
        labels: HashMap<String, String>,
    ) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(labels.clone());
        let members = IntGauge::with_opts(opts(
            "ensemble_members",
            "Members in this node's view of the cluster",
        ))?;
        let active_instances = IntGauge::with_opts(opts(
            "ensemble_active_instances",
            "Instances running on this node",
        ))?;
        let cached_routes =
            IntGauge::with_opts(opts("ensemble_cached_routes", "Cached dispatcher routes"))?;
        let passivations = IntCounter::with_opts(opts(
            "ensemble_passivations_total",
            "Instances stopped by the passivation sweep",
        ))?;
        let leadership_changes = IntCounter::with_opts(opts(
            "ensemble_leadership_changes_total",
            "Times this node gained leadership of a scope",
        ))?;

        registry.register(Box::new(members.clone()))?;
        registry.register(Box::new(active_instances.clone()))?;
        registry.register(Box::new(cached_routes.clone()))?;
        registry.register(Box::new(passivations.clone()))?;
        registry.register(Box::new(leadership_changes.clone()))?;

        Ok(Self {
            members,
            active_instances,
            cached_routes,
            passivations,
            leadership_changes,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            members: IntGauge::new("ensemble_members", "members").expect("valid metric name"),
            active_instances: IntGauge::new("ensemble_active_instances", "instances")
                .expect("valid metric name"),
            cached_routes: IntGauge::new("ensemble_cached_routes", "routes")
                .expect("valid metric name"),
            passivations: IntCounter::new("ensemble_passivations_total", "passivations")
                .expect("valid metric name"),
            leadership_changes: IntCounter::new("ensemble_leadership_changes_total", "leadership")
                .expect("valid metric name"),
        }
    }
}
