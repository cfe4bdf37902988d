use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{info, warn};

use crate::crd::{NodeGroupStatus, NodeRole};
use crate::error::Error;
use crate::healing::{find_unhealthy_nodes, quorum_needed, select_workers_for_removal};
use crate::kube_api::{REASON_QUORUM_LOST, REASON_SCALING_DOWN, REASON_SCALING_UP};
use crate::provision::generate_server_name;
use crate::reconcile::{ReconcileJob, Reconciler};
use crate::state::ClusterState;
use crate::status::{
    CONDITION_CONTROL_PLANE_READY, CONDITION_FALSE, CONDITION_SPEC_VALID, set_condition,
};

/// Nodes in phases 1 through 7. Any such node blocks further scale-up so
/// concurrent reconciles cannot double-create servers.
pub fn count_in_early_provisioning(group: &NodeGroupStatus) -> usize {
    group
        .nodes
        .iter()
        .filter(|n| n.phase.is_early_provisioning())
        .count()
}

/// Drops `Failed` records that never obtained a server. There is nothing
/// left to clean up for them, and keeping them would block the group from
/// ever reaching its desired count.
pub fn clear_failed_orphans(group: &mut NodeGroupStatus) -> usize {
    let before = group.nodes.len();
    group
        .nodes
        .retain(|n| !(n.phase == crate::crd::NodePhase::Failed && n.server_id == 0));
    before - group.nodes.len()
}

impl Reconciler {
    /// Brings the worker group to its desired count, then replaces
    /// unhealthy workers within the heal budget.
    pub(crate) async fn reconcile_workers(
        &self,
        job: &ReconcileJob,
        state: &ClusterState,
    ) -> Result<Option<Duration>, Error> {
        let role = NodeRole::Worker;
        let (cluster_name, desired, threshold, group) = {
            let mut cluster = job.cluster.lock().await;
            let threshold = self.cfg.node_not_ready_threshold_for(&cluster);
            let name = cluster.metadata.name.clone().unwrap_or_default();
            let desired = cluster.spec.workers.count;
            let status = cluster.status.get_or_insert_with(Default::default);
            let dropped = clear_failed_orphans(&mut status.workers);
            if dropped > 0 {
                info!(cluster = %name, dropped, "failed_worker_records_cleared");
            }
            (name, desired, threshold, status.workers.clone())
        };

        let in_flight = count_in_early_provisioning(&group);
        if in_flight > 0 {
            info!(cluster = %cluster_name, in_flight, "worker_scaling_deferred");
            return Ok(Some(self.cfg.default_requeue_after));
        }

        let current = group.nodes.len() as i32;

        if current < desired {
            let missing = (desired - current) as usize;
            self.emit(
                job,
                REASON_SCALING_UP,
                &format!("scaling workers {current} -> {desired}"),
                false,
            )
            .await;

            let names: Vec<String> = (0..missing)
                .map(|_| generate_server_name(&cluster_name, role))
                .collect();

            // All create requests are dispatched concurrently; only the
            // cloud's own rate limits bound this.
            let mut runs: FuturesUnordered<_> = names
                .iter()
                .map(|name| async move {
                    let server = self.provision_server(job, role, name, state).await?;
                    self.configure_worker_node(job, state, &server).await
                })
                .collect();

            let mut created = 0usize;
            while let Some(result) = runs.next().await {
                match result {
                    Ok(()) => created += 1,
                    Err(e) => warn!(cluster = %cluster_name, error = %e, "worker_scale_up_failed"),
                }
            }
            if created < missing {
                warn!(
                    cluster = %cluster_name,
                    created,
                    requested = missing,
                    "only created {created} of {missing} workers"
                );
                return Ok(Some(self.cfg.default_requeue_after));
            }
            return Ok(Some(self.cfg.fast_requeue_after));
        }

        if current > desired {
            let excess = (current - desired) as usize;
            self.emit(
                job,
                REASON_SCALING_DOWN,
                &format!("scaling workers {current} -> {desired}"),
                false,
            )
            .await;

            let victims = select_workers_for_removal(&group, excess);
            for name in victims.iter().take(self.cfg.max_concurrent_heals) {
                if let Err(e) = self.decommission_worker(job, name).await {
                    warn!(worker = %name, error = %e, "worker_decommission_failed");
                }
            }
            return Ok(Some(self.cfg.fast_requeue_after));
        }

        let unhealthy = find_unhealthy_nodes(&group.nodes, threshold, Utc::now());
        if unhealthy.is_empty() {
            return Ok(None);
        }
        for name in unhealthy.iter().take(self.cfg.max_concurrent_heals) {
            if let Err(e) = self.replace_worker(job, state, name).await {
                warn!(worker = %name, error = %e, "worker_replacement_failed");
            }
        }
        Ok(Some(self.cfg.fast_requeue_after))
    }

    /// Brings the control-plane group to its desired count and replaces
    /// unhealthy members while quorum allows.
    pub(crate) async fn reconcile_control_planes(
        &self,
        job: &ReconcileJob,
        state: &ClusterState,
    ) -> Result<Option<Duration>, Error> {
        let role = NodeRole::ControlPlane;
        let (cluster_name, desired, threshold, group) = {
            let mut cluster = job.cluster.lock().await;
            let threshold = self.cfg.node_not_ready_threshold_for(&cluster);
            let name = cluster.metadata.name.clone().unwrap_or_default();
            let desired = cluster.spec.control_planes.count;
            let status = cluster.status.get_or_insert_with(Default::default);
            let dropped = clear_failed_orphans(&mut status.control_planes);
            if dropped > 0 {
                info!(cluster = %name, dropped, "failed_control_plane_records_cleared");
            }
            (name, desired, threshold, status.control_planes.clone())
        };

        let in_flight = count_in_early_provisioning(&group);
        if in_flight > 0 {
            info!(cluster = %cluster_name, in_flight, "control_plane_scaling_deferred");
            return Ok(Some(self.cfg.default_requeue_after));
        }

        let current = group.nodes.len() as i32;

        if current < desired {
            let missing = (desired - current) as usize;
            self.emit(
                job,
                REASON_SCALING_UP,
                &format!("scaling control planes {current} -> {desired}"),
                false,
            )
            .await;

            let names: Vec<String> = (0..missing)
                .map(|_| generate_server_name(&cluster_name, role))
                .collect();

            // Servers come up in parallel, but configs are applied strictly
            // one at a time: each etcd member must be added before the next
            // one contacts the cluster.
            let mut runs: FuturesUnordered<_> = names
                .iter()
                .map(|name| self.provision_server(job, role, name, state))
                .collect();

            let mut provisioned = Vec::new();
            while let Some(result) = runs.next().await {
                match result {
                    Ok(server) => provisioned.push(server),
                    Err(e) => {
                        warn!(cluster = %cluster_name, error = %e, "control_plane_provision_failed")
                    }
                }
            }
            for server in &provisioned {
                if let Err(e) = self.configure_cp_node(job, state, server).await {
                    warn!(server = %server.name, error = %e, "control_plane_config_failed");
                }
            }
            return Ok(Some(self.cfg.fast_requeue_after));
        }

        if current > desired {
            warn!(cluster = %cluster_name, current, desired, "control_plane_scale_down_refused");
            let mut cluster = job.cluster.lock().await;
            let status = cluster.status.get_or_insert_with(Default::default);
            set_condition(
                status,
                CONDITION_SPEC_VALID,
                CONDITION_FALSE,
                "ControlPlaneScaleDownUnsupported",
                &format!("cannot scale control planes {current} -> {desired}"),
            );
            return Ok(Some(self.cfg.default_requeue_after));
        }

        // Single-CP clusters have nothing to fail over to.
        if desired <= 1 {
            return Ok(None);
        }

        let unhealthy = find_unhealthy_nodes(&group.nodes, threshold, Utc::now());
        if unhealthy.is_empty() {
            return Ok(None);
        }

        let mut replaced = 0usize;
        for name in unhealthy.iter() {
            if replaced >= self.cfg.max_concurrent_heals {
                break;
            }
            // Re-check quorum from live status before every removal.
            let ready = {
                let cluster = job.cluster.lock().await;
                cluster
                    .status
                    .as_ref()
                    .map(|s| s.control_planes.nodes.iter().filter(|n| n.healthy).count() as i32)
                    .unwrap_or(0)
            };
            let needed = quorum_needed(desired);
            if ready < needed {
                warn!(cluster = %cluster_name, ready, needed, "quorum_blocks_replacement");
                {
                    let mut cluster = job.cluster.lock().await;
                    let status = cluster.status.get_or_insert_with(Default::default);
                    set_condition(
                        status,
                        CONDITION_CONTROL_PLANE_READY,
                        CONDITION_FALSE,
                        REASON_QUORUM_LOST,
                        &format!("{ready} of {desired} control planes ready, quorum needs {needed}"),
                    );
                }
                self.emit(
                    job,
                    REASON_QUORUM_LOST,
                    &format!("refusing replacement: {ready}/{desired} ready, quorum {needed}"),
                    true,
                )
                .await;
                return Ok(Some(self.cfg.default_requeue_after));
            }

            if let Err(e) = self.replace_control_plane(job, state, name).await {
                warn!(node = %name, error = %e, "control_plane_replacement_failed");
            }
            replaced += 1;
        }
        Ok(Some(self.cfg.fast_requeue_after))
    }
}
