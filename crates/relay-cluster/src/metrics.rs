use prometheus::{Gauge, IntCounter, IntCounterVec, Opts, Registry};

fn opts(subsystem: &str, name: &str, help: &str) -> Opts {
    Opts::new(name, help)
        .namespace("secretrelay")
        .subsystem(subsystem)
}

/// Counters and gauges owned by the cluster core.
pub struct ClusterMetrics {
    pub leader_changes_seen: IntCounter,
    pub nodes_total: Gauge,
    pub nodes_joined: IntCounterVec,
    pub nodes_left: IntCounterVec,
    pub nodes_failed: IntCounterVec,
    pub nodes_reaped: IntCounterVec,
    pub secret_pushes: IntCounterVec,
    pub secret_push_failures: IntCounterVec,
}

impl ClusterMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let leader_changes_seen = IntCounter::with_opts(opts(
            "raft",
            "leader_changes_seen_total",
            "The total number of leader changes seen.",
        ))?;

        let nodes_total = Gauge::with_opts(opts(
            "raft",
            "nodes_total",
            "The total number of raft nodes in the cluster.",
        ))?;

        let nodes_joined = IntCounterVec::new(
            opts(
                "gossip",
                "nodes_joined_total",
                "The total number of times a node joined the cluster using gossip.",
            ),
            &["node"],
        )?;

        let nodes_left = IntCounterVec::new(
            opts(
                "gossip",
                "nodes_left_total",
                "The total number of times a node left the cluster using gossip.",
            ),
            &["node"],
        )?;

        let nodes_failed = IntCounterVec::new(
            opts(
                "gossip",
                "nodes_failed_total",
                "The total number of times a gossip node failed.",
            ),
            &["node"],
        )?;

        let nodes_reaped = IntCounterVec::new(
            opts(
                "gossip",
                "nodes_reaped_total",
                "The total number of times a gossip node was reaped.",
            ),
            &["node"],
        )?;

        let secret_pushes = IntCounterVec::new(
            opts(
                "server",
                "secret_pushes_total",
                "The total number of secrets pushed.",
            ),
            &["approle"],
        )?;

        let secret_push_failures = IntCounterVec::new(
            opts(
                "server",
                "secret_push_failures_total",
                "The total number of times a secret push failed.",
            ),
            &["approle"],
        )?;

        registry.register(Box::new(leader_changes_seen.clone()))?;
        registry.register(Box::new(nodes_total.clone()))?;
        registry.register(Box::new(nodes_joined.clone()))?;
        registry.register(Box::new(nodes_left.clone()))?;
        registry.register(Box::new(nodes_failed.clone()))?;
        registry.register(Box::new(nodes_reaped.clone()))?;
        registry.register(Box::new(secret_pushes.clone()))?;
        registry.register(Box::new(secret_push_failures.clone()))?;

        Ok(Self {
            leader_changes_seen,
            nodes_total,
            nodes_joined,
            nodes_left,
            nodes_failed,
            nodes_reaped,
            secret_pushes,
            secret_push_failures,
        })
    }
}
