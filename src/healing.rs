use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::crd::{NodeGroupStatus, NodePhase, NodeRole, NodeStatus};
use crate::error::Error;
use crate::kube_api::{REASON_NODE_REPLACED, REASON_NODE_REPLACING};
use crate::ledger::NodePatch;
use crate::provision::generate_replacement_server_name;
use crate::reconcile::{ReconcileJob, Reconciler};
use crate::state::ClusterState;
use crate::talos::find_member_for_node;

/// Strict majority of the declared control-plane count.
pub fn quorum_needed(count: i32) -> i32 {
    count / 2 + 1
}

/// Nodes whose unhealthy dwell has passed the threshold. Nodes that were
/// never classified (`unhealthy_since` unset) are skipped.
pub fn find_unhealthy_nodes(
    nodes: &[NodeStatus],
    threshold: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    nodes
        .iter()
        .filter(|node| !node.healthy)
        .filter(|node| {
            node.unhealthy_since.as_ref().is_some_and(|since| {
                now.signed_duration_since(since.0)
                    .to_std()
                    .map(|elapsed| elapsed > threshold)
                    .unwrap_or(false)
            })
        })
        .map(|node| node.name.clone())
        .collect()
}

/// Picks `k` workers for scale-down: unhealthy ones in list order first,
/// then the newest (last-appended) healthy workers.
pub fn select_workers_for_removal(group: &NodeGroupStatus, k: usize) -> Vec<String> {
    let mut selected: Vec<String> = group
        .nodes
        .iter()
        .filter(|n| !n.healthy)
        .take(k)
        .map(|n| n.name.clone())
        .collect();

    for node in group.nodes.iter().rev() {
        if selected.len() >= k {
            break;
        }
        if node.healthy && !selected.contains(&node.name) {
            selected.push(node.name.clone());
        }
    }
    selected
}

impl Reconciler {
    /// Replaces one control plane. The caller has already verified quorum
    /// survives the removal.
    pub(crate) async fn replace_control_plane(
        &self,
        job: &ReconcileJob,
        state: &ClusterState,
        name: &str,
    ) -> Result<(), Error> {
        let role = NodeRole::ControlPlane;
        self.mark_healing(job).await;
        self.emit(job, REASON_NODE_REPLACING, &format!("replacing control plane {name}"), false)
            .await;
        self.record_replacement(job, role).await;

        self.update_node(job, role, name, NodePatch::phase(NodePhase::RemovingFromEtcd))
            .await?;
        self.remove_etcd_member_for(job, name).await;

        self.update_node(job, role, name, NodePatch::phase(NodePhase::DeletingServer))
            .await?;
        let cloud = self.cloud_client().await?;
        cloud.delete_server(name).await?;

        {
            let mut cluster = job.cluster.lock().await;
            if let Some(status) = cluster.status.as_mut() {
                crate::ledger::remove(status, role, name);
            }
            crate::status::persist(self.kube.as_ref(), &mut cluster, &self.cfg).await?;
        }

        let replacement = {
            let cluster = job.cluster.lock().await;
            generate_replacement_server_name(
                &cluster.metadata.name.clone().unwrap_or_default(),
                role,
            )
        };
        let server = self.provision_server(job, role, &replacement, state).await?;
        self.configure_cp_node(job, state, &server).await?;

        self.emit(
            job,
            REASON_NODE_REPLACED,
            &format!("control plane {name} replaced by {replacement}"),
            false,
        )
        .await;
        info!(old = name, new = %replacement, "control_plane_replaced");
        Ok(())
    }

    /// Locates and removes the etcd member backing `name` through a healthy
    /// control plane. An absent member or unreachable Talos API is logged
    /// and skipped: the node is already gone from the cluster's view.
    async fn remove_etcd_member_for(&self, job: &ReconcileJob, name: &str) {
        let (probe_ip, member_ips) = {
            let cluster = job.cluster.lock().await;
            let Some(status) = cluster.status.as_ref() else { return };
            let healthy_ip = status
                .control_planes
                .nodes
                .iter()
                .filter(|n| n.healthy && n.name != name)
                .map(|n| {
                    if n.public_ip.is_empty() { n.private_ip.clone() } else { n.public_ip.clone() }
                })
                .find(|ip| !ip.is_empty());
            let target = status.control_planes.node(name);
            (
                healthy_ip,
                target
                    .map(|n| vec![n.private_ip.clone(), n.public_ip.clone()])
                    .unwrap_or_default(),
            )
        };

        let Some(probe_ip) = probe_ip else {
            warn!(node = name, "no_healthy_cp_for_etcd_removal");
            return;
        };

        let members = match self.talos.get_etcd_members(&probe_ip).await {
            Ok(members) => members,
            Err(e) => {
                warn!(node = name, error = %e, "etcd_member_list_unreachable");
                return;
            }
        };

        let ips: Vec<&str> = member_ips.iter().map(String::as_str).collect();
        let Some(member) = find_member_for_node(&members, name, &ips) else {
            info!(node = name, "etcd_member_already_absent");
            return;
        };

        if let Err(e) = self.talos.remove_etcd_member(&probe_ip, member.id).await {
            warn!(node = name, member = member.id, error = %e, "etcd_member_removal_failed");
        } else {
            info!(node = name, member = member.id, "etcd_member_removed");
        }
    }

    /// Replaces one worker: drain, delete, reprovision under a fresh name.
    pub(crate) async fn replace_worker(
        &self,
        job: &ReconcileJob,
        state: &ClusterState,
        name: &str,
    ) -> Result<(), Error> {
        let role = NodeRole::Worker;
        self.mark_healing(job).await;
        self.emit(job, REASON_NODE_REPLACING, &format!("replacing worker {name}"), false)
            .await;
        self.record_replacement(job, role).await;

        self.decommission_worker(job, name).await?;

        let replacement = {
            let cluster = job.cluster.lock().await;
            generate_replacement_server_name(
                &cluster.metadata.name.clone().unwrap_or_default(),
                role,
            )
        };
        let server = self.provision_server(job, role, &replacement, state).await?;
        self.configure_worker_node(job, state, &server).await?;

        self.emit(
            job,
            REASON_NODE_REPLACED,
            &format!("worker {name} replaced by {replacement}"),
            false,
        )
        .await;
        info!(old = name, new = %replacement, "worker_replaced");
        Ok(())
    }

    /// Drains and deletes a worker without provisioning a successor.
    pub(crate) async fn decommission_worker(
        &self,
        job: &ReconcileJob,
        name: &str,
    ) -> Result<(), Error> {
        let role = NodeRole::Worker;

        self.update_node(job, role, name, NodePatch::phase(NodePhase::Draining))
            .await?;
        self.drain_node(name).await;

        self.update_node(job, role, name, NodePatch::phase(NodePhase::DeletingServer))
            .await?;
        let cloud = self.cloud_client().await?;
        cloud.delete_server(name).await?;
        if let Err(e) = self.kube.delete_node(name).await {
            warn!(node = name, error = %e, "node_object_delete_failed");
        }

        let mut cluster = job.cluster.lock().await;
        if let Some(status) = cluster.status.as_mut() {
            crate::ledger::remove(status, role, name);
        }
        crate::status::persist(self.kube.as_ref(), &mut cluster, &self.cfg).await?;
        Ok(())
    }

    /// Cordons the node and evicts its pods with a bounded deadline. A
    /// missing node object is non-fatal; the machine may already be gone.
    async fn drain_node(&self, name: &str) {
        if let Err(e) = self.kube.cordon_node(name).await {
            warn!(node = name, error = %e, "cordon_failed");
            return;
        }
        let eviction = tokio::time::timeout(self.cfg.drain_timeout, self.kube.evict_node_pods(name));
        match eviction.await {
            Ok(Ok(())) => info!(node = name, "node_drained"),
            Ok(Err(e)) => warn!(node = name, error = %e, "drain_failed"),
            Err(_) => warn!(node = name, timeout = ?self.cfg.drain_timeout, "drain_deadline_exceeded"),
        }
    }

    async fn mark_healing(&self, job: &ReconcileJob) {
        let mut cluster = job.cluster.lock().await;
        let status = cluster.status.get_or_insert_with(Default::default);
        status.phase = Some(crate::crd::ClusterPhase::Healing);
    }

    async fn record_replacement(&self, job: &ReconcileJob, role: NodeRole) {
        if let Some(metrics) = self.metrics.as_ref() {
            let cluster = job.cluster.lock().await;
            let name = cluster.metadata.name.clone().unwrap_or_default();
            metrics
                .node_replacement_total
                .with_label_values(&[&name, role.as_str()])
                .inc();
        }
    }
}
