use tracing::debug;

use crate::cloud::{SERVER_STATUS_RUNNING, SERVER_STATUS_STARTING};
use crate::crd::{NodePhase, NodeRole, NodeStatus};
use crate::error::Error;
use crate::health;
use crate::ledger::{self, NodePatch};
use crate::reconcile::{ReconcileJob, Reconciler};

impl Reconciler {
    /// Reconciles each node record's advertised phase with what the
    /// Kubernetes, Talos and cloud APIs actually report.
    ///
    /// Derived phases only land when `should_advance` allows, so a flaky
    /// read can never drag a node backwards; a probe error skips the node
    /// entirely rather than guessing.
    pub(crate) async fn verify_node_states(&self, job: &ReconcileJob) -> Result<(), Error> {
        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            let records: Vec<NodeStatus> = {
                let cluster = job.cluster.lock().await;
                match cluster.status.as_ref() {
                    Some(status) => status.group(role).nodes.clone(),
                    None => continue,
                }
            };

            for record in records {
                if matches!(record.phase, NodePhase::Failed | NodePhase::DeletingServer) {
                    continue;
                }
                let Some((derived, reason)) = self.derive_node_state(&record).await else {
                    continue;
                };
                if !ledger::should_advance(record.phase, derived) {
                    continue;
                }
                debug!(
                    node = %record.name,
                    advertised = %record.phase,
                    derived = %derived,
                    "node_state_verified"
                );
                let mut cluster = job.cluster.lock().await;
                if let Some(status) = cluster.status.as_mut() {
                    ledger::update(
                        status,
                        role,
                        &record.name,
                        NodePatch::phase_with_reason(derived, reason),
                    );
                }
            }
        }
        Ok(())
    }

    /// Probe cascade: Kubernetes node, Talos kubelet/config/maintenance,
    /// Talos API reachability, cloud server existence.
    async fn derive_node_state(&self, record: &NodeStatus) -> Option<(NodePhase, String)> {
        let name = record.name.as_str();

        let k8s_node = match self.kube.get_node(name).await {
            Ok(node) => node,
            Err(e) => {
                debug!(node = name, error = %e, "verify_k8s_read_failed");
                return None;
            }
        };

        let talos_ip = if record.public_ip.is_empty() {
            record.private_ip.as_str()
        } else {
            record.public_ip.as_str()
        };

        if let Some(node) = k8s_node {
            if health::node_ready(&node) {
                return Some((NodePhase::Ready, "node reports Ready".to_string()));
            }
            if talos_ip.is_empty() {
                return None;
            }
            return match self.talos.is_kubelet_running(talos_ip).await {
                Ok(true) => Some((
                    NodePhase::NodeInitializing,
                    "kubelet running, node not yet Ready".to_string(),
                )),
                Ok(false) => Some((
                    NodePhase::WaitingForK8s,
                    "node object exists, kubelet down".to_string(),
                )),
                Err(e) => {
                    debug!(node = name, error = %e, "verify_kubelet_read_failed");
                    None
                }
            };
        }

        if !talos_ip.is_empty() {
            match self.talos.is_api_reachable(talos_ip).await {
                Ok(true) => {
                    match self.talos.is_node_in_maintenance_mode(talos_ip).await {
                        Ok(true) => {
                            return Some((
                                NodePhase::WaitingForTalosAPI,
                                "machine in maintenance mode".to_string(),
                            ));
                        }
                        Ok(false) => {}
                        Err(e) => {
                            debug!(node = name, error = %e, "verify_maintenance_read_failed");
                            return None;
                        }
                    }
                    return match self.talos.is_machine_configured(talos_ip).await {
                        Ok(true) => match self.talos.is_kubelet_running(talos_ip).await {
                            Ok(true) => Some((
                                NodePhase::WaitingForK8s,
                                "configured, kubelet running".to_string(),
                            )),
                            Ok(false) => Some((
                                NodePhase::RebootingWithConfig,
                                "configured, kubelet not yet up".to_string(),
                            )),
                            Err(e) => {
                                debug!(node = name, error = %e, "verify_kubelet_read_failed");
                                None
                            }
                        },
                        Ok(false) => Some((
                            NodePhase::ApplyingTalosConfig,
                            "talos reachable, machine state unknown".to_string(),
                        )),
                        Err(e) => {
                            debug!(node = name, error = %e, "verify_config_read_failed");
                            None
                        }
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(node = name, error = %e, "verify_talos_probe_failed");
                    return None;
                }
            }
        }

        let cloud = match self.cloud_client().await {
            Ok(cloud) => cloud,
            Err(e) => {
                debug!(node = name, error = %e, "verify_without_cloud_client");
                return None;
            }
        };
        match cloud.get_server_by_name(name).await {
            Ok(Some(server)) => match server.status.as_str() {
                SERVER_STATUS_RUNNING => Some((
                    NodePhase::WaitingForTalosAPI,
                    "server running, talos unreachable".to_string(),
                )),
                SERVER_STATUS_STARTING => {
                    Some((NodePhase::WaitingForIP, "server starting".to_string()))
                }
                other => Some((
                    NodePhase::CreatingServer,
                    format!("server status {other}"),
                )),
            },
            Ok(None) => Some((NodePhase::Failed, "cloud server does not exist".to_string())),
            Err(e) => {
                debug!(node = name, error = %e, "verify_cloud_read_failed");
                None
            }
        }
    }
}
