use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::crd::{NodeGroupStatus, NodePhase, NodeRole};
use crate::error::Error;
use crate::ledger::{self, NodePatch};
use crate::reconcile::{ReconcileJob, Reconciler};

/// Names of nodes that have overstayed their phase budget.
///
/// `Ready`, `Unhealthy` and `Failed` carry no budget; records without a
/// transition timestamp are skipped.
pub fn check_stuck_nodes(
    group: &NodeGroupStatus,
    cfg: &OperatorConfig,
    now: DateTime<Utc>,
) -> Vec<String> {
    group
        .nodes
        .iter()
        .filter(|node| {
            let Some(timeout) = cfg.phase_timeout(node.phase) else {
                return false;
            };
            let Some(since) = node.phase_transition_time.as_ref() else {
                return false;
            };
            let elapsed = now.signed_duration_since(since.0);
            elapsed.to_std().map(|e| e > timeout).unwrap_or(false)
        })
        .map(|node| node.name.clone())
        .collect()
}

impl Reconciler {
    /// Fails and cleans up every stuck node in both groups.
    pub(crate) async fn sweep_stuck_nodes(&self, job: &ReconcileJob) -> Result<(), Error> {
        let now = Utc::now();
        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            let stuck = {
                let cluster = job.cluster.lock().await;
                let Some(status) = cluster.status.as_ref() else { continue };
                check_stuck_nodes(status.group(role), &self.cfg, now)
            };
            for name in stuck {
                self.handle_stuck_node(job, role, &name, now).await?;
            }
        }
        Ok(())
    }

    /// Marks the record `Failed`, best-effort deletes the server, then
    /// removes the record. A failed delete is logged but never blocks the
    /// removal.
    async fn handle_stuck_node(
        &self,
        job: &ReconcileJob,
        role: NodeRole,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let (phase, elapsed, timeout) = {
            let cluster = job.cluster.lock().await;
            let Some(record) = cluster
                .status
                .as_ref()
                .and_then(|s| s.group(role).node(name))
            else {
                return Ok(());
            };
            let elapsed = record
                .phase_transition_time
                .as_ref()
                .map(|t| now.signed_duration_since(t.0))
                .and_then(|d| d.to_std().ok())
                .unwrap_or_default();
            (record.phase, elapsed, self.cfg.phase_timeout(record.phase))
        };
        let Some(timeout) = timeout else { return Ok(()) };

        warn!(node = name, phase = %phase, ?elapsed, ?timeout, "node_stuck");
        self.update_node(
            job,
            role,
            name,
            NodePatch::phase_with_reason(
                NodePhase::Failed,
                format!("stuck in {phase} for {elapsed:?} (timeout {timeout:?})"),
            ),
        )
        .await?;

        match self.cloud_client().await {
            Ok(cloud) => {
                if let Err(e) = cloud.delete_server(name).await {
                    warn!(server = name, error = %e, "stuck_node_delete_failed");
                }
            }
            Err(e) => warn!(server = name, error = %e, "stuck_node_cleanup_without_cloud"),
        }

        let mut cluster = job.cluster.lock().await;
        if let Some(status) = cluster.status.as_mut() {
            ledger::remove(status, role, name);
        }
        crate::status::persist(self.kube.as_ref(), &mut cluster, &self.cfg).await?;
        info!(node = name, "stuck_node_removed");
        Ok(())
    }
}
