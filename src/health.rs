use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::{debug, info};

use crate::crd::{NodePhase, NodeRole};
use crate::ledger::{self, NodePatch};
use crate::reconcile::{ReconcileJob, Reconciler};

/// Whether the Kubernetes node carries `Ready=True`.
pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Short code for why a node is unhealthy, in fixed priority order.
pub fn unhealthy_reason(node: &Node) -> &'static str {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref());
    let Some(conditions) = conditions else {
        return "NodeNotReady";
    };

    let active = |type_: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    };

    if conditions.iter().any(|c| c.type_ == "Ready" && c.status != "True") {
        return "NodeNotReady";
    }
    if active("MemoryPressure") {
        return "MemoryPressure";
    }
    if active("DiskPressure") {
        return "DiskPressure";
    }
    if active("PIDPressure") {
        return "PIDPressure";
    }
    if active("NetworkUnavailable") {
        return "NetworkUnavailable";
    }
    "NodeNotReady"
}

/// Internal and external addresses reported by the kubelet.
pub fn node_addresses(node: &Node) -> (Option<String>, Option<String>) {
    let mut internal = None;
    let mut external = None;
    if let Some(addresses) = node.status.as_ref().and_then(|s| s.addresses.as_ref()) {
        for addr in addresses {
            match addr.type_.as_str() {
                "InternalIP" if internal.is_none() => internal = Some(addr.address.clone()),
                "ExternalIP" if external.is_none() => external = Some(addr.address.clone()),
                _ => {}
            }
        }
    }
    (internal, external)
}

impl Reconciler {
    /// Reconciles every node record against the live Kubernetes nodes:
    /// health flips, `unhealthySince` bookkeeping and IP backfill from the
    /// kubelet-reported addresses.
    pub(crate) async fn classify_node_health(&self, job: &ReconcileJob) -> Result<(), crate::error::Error> {
        let k8s_nodes = self.kube.list_nodes().await?;
        let mut cluster = job.cluster.lock().await;
        let Some(status) = cluster.status.as_mut() else {
            return Ok(());
        };

        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            let names: Vec<String> = status
                .group(role)
                .nodes
                .iter()
                .map(|n| n.name.clone())
                .collect();

            for name in names {
                // Records already in a replacement or terminal phase are
                // lifecycle-owned; health bookkeeping stays out.
                let phase = status.group(role).node(&name).map(|n| n.phase);
                if matches!(
                    phase,
                    Some(
                        NodePhase::Draining
                            | NodePhase::RemovingFromEtcd
                            | NodePhase::DeletingServer
                            | NodePhase::Failed
                    )
                ) {
                    continue;
                }

                let Some(k8s_node) =
                    k8s_nodes.iter().find(|n| n.metadata.name.as_deref() == Some(name.as_str()))
                else {
                    // Record without a Node object; the verifier owns that case.
                    continue;
                };

                let (internal, external) = node_addresses(k8s_node);
                ledger::update(
                    status,
                    role,
                    &name,
                    NodePatch { private_ip: internal, public_ip: external, ..Default::default() },
                );

                if node_ready(k8s_node) {
                    let record = status.group(role).node(&name).cloned().unwrap_or_default();
                    if ledger::should_advance(record.phase, NodePhase::Ready) {
                        info!(node = %name, from = %record.phase, "node_became_ready");
                        ledger::update(status, role, &name, NodePatch::phase(NodePhase::Ready));
                    }
                    if let Some(record) = status.group_mut(role).node_mut(&name) {
                        record.unhealthy_since = None;
                        record.unhealthy_reason = None;
                    }
                } else {
                    let record = status.group(role).node(&name).cloned().unwrap_or_default();
                    // Only nodes that made it to Ready degrade into Unhealthy;
                    // everything earlier is still provisioning.
                    if !matches!(record.phase, NodePhase::Ready | NodePhase::Unhealthy) {
                        continue;
                    }
                    let reason = unhealthy_reason(k8s_node);
                    if record.phase == NodePhase::Ready {
                        debug!(node = %name, reason, "node_flipped_unhealthy");
                        ledger::update(status, role, &name, NodePatch::phase(NodePhase::Unhealthy));
                    }
                    if let Some(record) = status.group_mut(role).node_mut(&name) {
                        if record.unhealthy_since.is_none() {
                            record.unhealthy_since = Some(Time(Utc::now()));
                        }
                        record.unhealthy_reason = Some(reason.to_string());
                    }
                }
            }
        }
        Ok(())
    }
}
