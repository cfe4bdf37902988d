use std::time::Duration;

use tracing::warn;

use crate::crd::{ManagedCluster, NodePhase};

/// Tunables for the reconcile engine.
///
/// A single instance is built at startup and shared by every reconcile;
/// per-cluster thresholds from `spec.healthCheck` override the two health
/// defaults.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Baseline requeue when nothing demands a faster retry.
    pub default_requeue_after: Duration,

    /// Requeue applied by the runtime error policy.
    pub error_requeue_after: Duration,

    /// Requeue while replacement work is still pending.
    pub fast_requeue_after: Duration,

    /// Optimistic-concurrency retry budget for status writes.
    pub status_update_retries: u32,
    pub status_retry_interval: Duration,

    /// Replacements and decommissions one reconcile may initiate.
    /// Net-new scale-up is never bounded by this.
    pub max_concurrent_heals: usize,

    /// Deadline for the cloud to report a public IP on a new server.
    pub server_ip_timeout: Duration,
    pub server_ip_poll_interval: Duration,

    /// Deadline for a configured machine to register as a Ready node.
    pub node_ready_timeout: Duration,
    pub node_ready_poll_interval: Duration,

    /// Per-node drain deadline during replacement or decommission.
    pub drain_timeout: Duration,

    /// Default dwell before an unready node becomes a replacement candidate.
    pub node_not_ready_threshold: Duration,

    /// Default dwell before an unhealthy etcd member is acted on.
    pub etcd_unhealthy_threshold: Duration,

    pub enable_metrics: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_requeue_after: Duration::from_secs(30),
            error_requeue_after: Duration::from_secs(60),
            fast_requeue_after: Duration::from_secs(5),
            status_update_retries: 5,
            status_retry_interval: Duration::from_secs(2),
            max_concurrent_heals: 2,
            server_ip_timeout: Duration::from_secs(5 * 60),
            server_ip_poll_interval: Duration::from_secs(5),
            node_ready_timeout: Duration::from_secs(10 * 60),
            node_ready_poll_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5 * 60),
            node_not_ready_threshold: Duration::from_secs(5 * 60),
            etcd_unhealthy_threshold: Duration::from_secs(5 * 60),
            enable_metrics: true,
        }
    }
}

impl OperatorConfig {
    /// Wall-clock budget a node may spend in a phase before the stuck-node
    /// sweeper fails it. `Ready`, `Unhealthy` and `Failed` have no budget.
    pub fn phase_timeout(&self, phase: NodePhase) -> Option<Duration> {
        let minutes = match phase {
            NodePhase::CreatingServer => 10,
            NodePhase::WaitingForIP => 5,
            NodePhase::WaitingForTalosAPI => 10,
            NodePhase::ApplyingTalosConfig => 5,
            NodePhase::RebootingWithConfig => 10,
            NodePhase::WaitingForK8s => 10,
            NodePhase::NodeInitializing => 10,
            NodePhase::Draining => 15,
            NodePhase::RemovingFromEtcd => 5,
            NodePhase::DeletingServer => 5,
            NodePhase::Ready | NodePhase::Unhealthy | NodePhase::Failed => return None,
        };
        Some(Duration::from_secs(minutes * 60))
    }

    /// Effective not-ready dwell for a cluster, honoring `spec.healthCheck`.
    pub fn node_not_ready_threshold_for(&self, cluster: &ManagedCluster) -> Duration {
        cluster
            .spec
            .health_check
            .as_ref()
            .and_then(|hc| hc.node_not_ready_threshold.as_deref())
            .and_then(|raw| parse_threshold(raw, "nodeNotReadyThreshold"))
            .unwrap_or(self.node_not_ready_threshold)
    }

    /// Effective etcd-unhealthy dwell for a cluster.
    pub fn etcd_unhealthy_threshold_for(&self, cluster: &ManagedCluster) -> Duration {
        cluster
            .spec
            .health_check
            .as_ref()
            .and_then(|hc| hc.etcd_unhealthy_threshold.as_deref())
            .and_then(|raw| parse_threshold(raw, "etcdUnhealthyThreshold"))
            .unwrap_or(self.etcd_unhealthy_threshold)
    }
}

fn parse_threshold(raw: &str, field: &str) -> Option<Duration> {
    match parse_duration::parse(raw) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(field, value = raw, error = %e, "health_check_threshold_unparseable");
            None
        }
    }
}
