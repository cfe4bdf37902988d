use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, warn};

use crate::crd::{NodePhase, NodeRole};
use crate::error::Error;
use crate::health;
use crate::kube_api::{
    REASON_CONFIG_APPLY_ERROR, REASON_NODE_READY_TIMEOUT, REASON_SERVER_CREATION_ERROR,
};
use crate::ledger::NodePatch;
use crate::reconcile::{ReconcileJob, Reconciler};
use crate::state::ClusterState;

/// Label selector locating the Talos snapshot servers boot from.
pub const TALOS_SNAPSHOT_SELECTOR: &str = "os=talos";

/// Outcome of a successful server provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionedServer {
    pub name: String,
    pub server_id: i64,
    pub public_ip: String,
    pub private_ip: String,
    /// Address Talos is reachable on: public IP when present, else private.
    pub talos_ip: String,
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .take(5)
        .collect()
}

/// `<cluster>-<roleShort>-<5 char id>`. Names are never reused across
/// machine lifetimes.
pub fn generate_server_name(cluster: &str, role: NodeRole) -> String {
    format!("{cluster}-{}-{}", role.short(), random_suffix())
}

/// Replacement machines get a fresh name so the old record and server can
/// be traced independently.
pub fn generate_replacement_server_name(cluster: &str, role: NodeRole) -> String {
    generate_server_name(cluster, role)
}

impl Reconciler {
    /// Creates a cloud server and waits for its public IP.
    ///
    /// The `CreatingServer` record is persisted before the create call so a
    /// crash leaves a replay marker instead of an orphaned server.
    pub(crate) async fn provision_server(
        &self,
        job: &ReconcileJob,
        role: NodeRole,
        name: &str,
        state: &ClusterState,
    ) -> Result<ProvisionedServer, Error> {
        let cloud = self.cloud_client().await?;

        let server_type = {
            let cluster = job.cluster.lock().await;
            match role {
                NodeRole::ControlPlane => cluster.spec.control_planes.size.clone(),
                NodeRole::Worker => cluster.spec.workers.size.clone(),
            }
        };

        let snapshot = cloud
            .get_snapshot_by_labels(TALOS_SNAPSHOT_SELECTOR)
            .await?
            .ok_or_else(|| {
                Error::SpecInvalid(format!(
                    "no snapshot matches selector {TALOS_SNAPSHOT_SELECTOR}"
                ))
            })?;

        self.update_node(job, role, name, NodePatch::phase(NodePhase::CreatingServer))
            .await?;

        let mut labels = state.labels.clone();
        labels.insert("role".to_string(), role.as_str().to_string());

        let request = crate::cloud::CreateServerRequest {
            name: name.to_string(),
            image: snapshot.to_string(),
            server_type,
            location: state.region.clone(),
            ssh_keys: state.ssh_key_ids.clone(),
            labels,
            user_data: String::new(),
            placement_group: None,
            network_id: state.network_id,
            private_ip: None,
            enable_public_v4: true,
            enable_public_v6: false,
        };

        let server_id = match cloud.create_server(&request).await {
            Ok(id) => id,
            Err(e) => {
                self.emit(job, REASON_SERVER_CREATION_ERROR, &format!("creating {name}: {e}"), true)
                    .await;
                self.update_node(
                    job,
                    role,
                    name,
                    NodePatch::phase_with_reason(NodePhase::Failed, format!("server creation: {e}")),
                )
                .await?;
                return Err(Error::ServerCreation { name: name.to_string(), message: e.to_string() });
            }
        };
        info!(server = name, id = server_id, role = %role, "cloud_server_created");

        self.update_node(
            job,
            role,
            name,
            NodePatch {
                server_id: Some(server_id),
                phase: Some(NodePhase::WaitingForIP),
                ..Default::default()
            },
        )
        .await?;

        let public_ip = match self.wait_for_server_ip(name).await {
            Ok(ip) => ip,
            Err(e) => {
                self.update_node(
                    job,
                    role,
                    name,
                    NodePatch::phase_with_reason(NodePhase::Failed, format!("waiting for ip: {e}")),
                )
                .await?;
                return Err(e);
            }
        };

        let private_ip = cloud
            .get_server_by_name(name)
            .await?
            .map(|s| s.first_private_ip())
            .unwrap_or_default();

        self.update_node(
            job,
            role,
            name,
            NodePatch {
                public_ip: Some(public_ip.clone()),
                private_ip: Some(private_ip.clone()),
                ..Default::default()
            },
        )
        .await?;

        let talos_ip = if public_ip.is_empty() { private_ip.clone() } else { public_ip.clone() };
        Ok(ProvisionedServer {
            name: name.to_string(),
            server_id,
            public_ip,
            private_ip,
            talos_ip,
        })
    }

    /// Applies the control-plane machine config and waits for the node.
    ///
    /// Failure handling is asymmetric: before the config is committed the
    /// server is disposable, afterwards an etcd member may already have
    /// joined and deleting the server could cost quorum.
    pub(crate) async fn configure_cp_node(
        &self,
        job: &ReconcileJob,
        state: &ClusterState,
        server: &ProvisionedServer,
    ) -> Result<(), Error> {
        let role = NodeRole::ControlPlane;
        let name = server.name.as_str();

        self.update_node(job, role, name, NodePatch::phase(NodePhase::ApplyingTalosConfig))
            .await?;

        let extra_sans = vec![server.public_ip.clone()];
        let config = match self.talos.generate_machine_config(role, state, &extra_sans).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self.abort_unconfigured_cp(job, name, "generating machine config", e).await;
            }
        };

        if let Err(e) = self.talos.apply_config(&server.talos_ip, &config).await {
            return self.abort_unconfigured_cp(job, name, "applying machine config", e).await;
        }

        self.update_node(job, role, name, NodePatch::phase(NodePhase::RebootingWithConfig))
            .await?;
        self.update_node(job, role, name, NodePatch::phase(NodePhase::WaitingForK8s))
            .await?;

        if let Err(e) = self.wait_for_k8s_node_ready(name).await {
            // The config was accepted, so an etcd member may already exist
            // for this machine; the server must survive this failure.
            self.emit(job, REASON_NODE_READY_TIMEOUT, &format!("{name}: {e}"), true).await;
            return Err(e);
        }

        self.update_node(job, role, name, NodePatch::phase(NodePhase::NodeInitializing))
            .await?;
        Ok(())
    }

    /// Control-plane failure path for configs that were never committed:
    /// the server carries no etcd member and is torn down with the record.
    async fn abort_unconfigured_cp(
        &self,
        job: &ReconcileJob,
        name: &str,
        context: &str,
        cause: Error,
    ) -> Result<(), Error> {
        self.emit(job, REASON_CONFIG_APPLY_ERROR, &format!("{context} for {name}: {cause}"), true)
            .await;
        self.handle_provisioning_failure(job, NodeRole::ControlPlane, name).await;
        Err(Error::ConfigApply { node: name.to_string(), message: cause.to_string() })
    }

    /// Worker analogue of `configure_cp_node`. Workers hold no etcd role,
    /// so every failure tears the server down. Without Talos credentials
    /// the node is parked in `WaitingForK8s` for a later reconcile.
    pub(crate) async fn configure_worker_node(
        &self,
        job: &ReconcileJob,
        state: &ClusterState,
        server: &ProvisionedServer,
    ) -> Result<(), Error> {
        let role = NodeRole::Worker;
        let name = server.name.as_str();

        if !self.talos.has_credentials() {
            debug!(server = name, "talos_credentials_missing_deferring_config");
            self.update_node(
                job,
                role,
                name,
                NodePatch::phase_with_reason(
                    NodePhase::WaitingForK8s,
                    "talos credentials not configured",
                ),
            )
            .await?;
            return Ok(());
        }

        self.update_node(job, role, name, NodePatch::phase(NodePhase::ApplyingTalosConfig))
            .await?;

        let extra_sans = vec![server.public_ip.clone()];
        let apply = async {
            let config = self
                .talos
                .generate_machine_config(role, state, &extra_sans)
                .await?;
            self.talos.apply_config(&server.talos_ip, &config).await
        };
        if let Err(e) = apply.await {
            self.emit(job, REASON_CONFIG_APPLY_ERROR, &format!("configuring {name}: {e}"), true)
                .await;
            self.handle_provisioning_failure(job, role, name).await;
            return Err(Error::ConfigApply { node: name.to_string(), message: e.to_string() });
        }

        self.update_node(job, role, name, NodePatch::phase(NodePhase::RebootingWithConfig))
            .await?;
        self.update_node(job, role, name, NodePatch::phase(NodePhase::WaitingForK8s))
            .await?;

        if let Err(e) = self.wait_for_k8s_node_ready(name).await {
            self.emit(job, REASON_NODE_READY_TIMEOUT, &format!("{name}: {e}"), true).await;
            self.handle_provisioning_failure(job, role, name).await;
            return Err(e);
        }

        self.update_node(job, role, name, NodePatch::phase(NodePhase::NodeInitializing))
            .await?;
        Ok(())
    }

    /// Deletes the cloud server (best effort) and drops the node record.
    pub(crate) async fn handle_provisioning_failure(
        &self,
        job: &ReconcileJob,
        role: NodeRole,
        name: &str,
    ) {
        match self.cloud_client().await {
            Ok(cloud) => {
                if let Err(e) = cloud.delete_server(name).await {
                    warn!(server = name, error = %e, "cleanup_delete_failed");
                }
            }
            Err(e) => warn!(server = name, error = %e, "cleanup_without_cloud_client"),
        }

        let mut cluster = job.cluster.lock().await;
        if let Some(status) = cluster.status.as_mut() {
            crate::ledger::remove(status, role, name);
        }
        if let Err(e) = crate::status::persist(self.kube.as_ref(), &mut cluster, &self.cfg).await {
            warn!(server = name, error = %e, "cleanup_persist_failed");
        }
    }

    /// Polls the cloud until the server reports a public IP.
    async fn wait_for_server_ip(&self, name: &str) -> Result<String, Error> {
        let cloud = self.cloud_client().await?;
        let deadline = tokio::time::Instant::now() + self.cfg.server_ip_timeout;
        loop {
            match cloud.get_server_ip(name).await {
                Ok(Some(ip)) if !ip.is_empty() => return Ok(ip),
                Ok(_) => {}
                Err(e) => debug!(server = name, error = %e, "server_ip_poll_failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("public ip for {name}"),
                    timeout: self.cfg.server_ip_timeout,
                });
            }
            tokio::time::sleep(self.cfg.server_ip_poll_interval).await;
        }
    }

    /// Polls the Kubernetes API until the named node registers Ready.
    pub(crate) async fn wait_for_k8s_node_ready(&self, name: &str) -> Result<(), Error> {
        let timeout = self.cfg.node_ready_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.kube.get_node(name).await {
                Ok(Some(node)) if health::node_ready(&node) => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!(node = name, error = %e, "node_ready_poll_failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NodeReadyTimeout { name: name.to_string(), timeout });
            }
            tokio::time::sleep(self.cfg.node_ready_poll_interval).await;
        }
    }
}
