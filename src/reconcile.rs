use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cloud::{CloudFactory, CloudProvider};
use crate::config::OperatorConfig;
use crate::crd::{
    ClusterPhase, FINALIZER, ManagedCluster, ManagedClusterStatus, NodePhase, NodeRole,
};
use crate::error::Error;
use crate::kube_api::{KubeApi, REASON_PAUSED};
use crate::ledger::{self, NodePatch};
use crate::metrics::{ControllerMetrics, InstrumentedCloud};
use crate::state::{self, ClusterState};
use crate::status::{
    CONDITION_CONTROL_PLANE_READY, CONDITION_FALSE, CONDITION_PAUSED, CONDITION_TALOS_CREDENTIALS,
    CONDITION_TRUE, clear_condition, set_condition,
};
use crate::talos::TalosApi;

/// Result of one reconcile pass; the runtime maps it onto a requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue_after: Option<Duration>,
}

/// In-flight cluster shared across the concurrent node pipelines of one
/// reconcile. The runtime single-flights per cluster key, so the lock only
/// serializes this reconcile's own status writes.
pub struct ReconcileJob {
    pub(crate) cluster: Mutex<ManagedCluster>,
}

impl ReconcileJob {
    fn new(cluster: ManagedCluster) -> Self {
        Self { cluster: Mutex::new(cluster) }
    }

    pub(crate) async fn snapshot(&self) -> ManagedCluster {
        self.cluster.lock().await.clone()
    }
}

/// The reconcile engine. One instance serves every cluster; all external
/// collaborators are injected so tests construct isolated instances.
pub struct Reconciler {
    pub(crate) kube: Arc<dyn KubeApi>,
    pub(crate) talos: Arc<dyn TalosApi>,
    pub(crate) cloud: Mutex<Option<Arc<dyn CloudProvider>>>,
    pub(crate) cloud_factory: CloudFactory,
    pub(crate) cfg: OperatorConfig,
    pub(crate) metrics: Option<Arc<ControllerMetrics>>,
}

/* ============================= BUILDER ============================= */

#[derive(Default)]
pub struct ReconcilerBuilder {
    kube: Option<Arc<dyn KubeApi>>,
    talos: Option<Arc<dyn TalosApi>>,
    cloud: Option<Arc<dyn CloudProvider>>,
    cloud_factory: Option<CloudFactory>,
    cfg: Option<OperatorConfig>,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl ReconcilerBuilder {
    pub fn kube(mut self, kube: Arc<dyn KubeApi>) -> Self {
        self.kube = Some(kube);
        self
    }

    pub fn talos(mut self, talos: Arc<dyn TalosApi>) -> Self {
        self.talos = Some(talos);
        self
    }

    /// Pre-seeds the cloud client, bypassing lazy token initialization.
    pub fn cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn cloud_factory(mut self, factory: CloudFactory) -> Self {
        self.cloud_factory = Some(factory);
        self
    }

    pub fn config(mut self, cfg: OperatorConfig) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Reconciler, Error> {
        let kube = self
            .kube
            .ok_or_else(|| Error::SpecInvalid("reconciler requires a kubernetes client".into()))?;
        let talos = self
            .talos
            .ok_or_else(|| Error::SpecInvalid("reconciler requires a talos client".into()))?;
        let cfg = self.cfg.unwrap_or_default();
        let cloud = match (&self.cloud, &self.metrics) {
            (Some(provider), Some(m)) if cfg.enable_metrics => {
                Some(InstrumentedCloud::wrap(provider.clone(), m.clone()))
            }
            (Some(provider), _) => Some(provider.clone()),
            (None, _) => None,
        };
        let metrics = if cfg.enable_metrics { self.metrics } else { None };
        let cloud_factory = self.cloud_factory.unwrap_or_else(|| {
            Arc::new(|_| Err(Error::SpecInvalid("no cloud factory configured".into())))
        });
        Ok(Reconciler {
            kube,
            talos,
            cloud: Mutex::new(cloud),
            cloud_factory,
            cfg,
            metrics,
        })
    }
}

/* ============================= PHASE DERIVATION ============================= */

/// Cluster phase from group counters, preserving `Healing` while
/// replacement work is visibly in flight and `Provisioning` until the
/// first node comes up.
pub fn compute_cluster_phase(status: &ManagedClusterStatus) -> ClusterPhase {
    let cp = &status.control_planes;
    let workers = &status.workers;

    if cp.ready == cp.desired && workers.ready == workers.desired {
        return ClusterPhase::Running;
    }

    let replacement_in_flight = [cp, workers].into_iter().any(|group| {
        group.nodes.iter().any(|n| {
            matches!(
                n.phase,
                NodePhase::Draining | NodePhase::RemovingFromEtcd | NodePhase::DeletingServer
            )
        })
    });
    if status.phase == Some(ClusterPhase::Healing) && replacement_in_flight {
        return ClusterPhase::Healing;
    }

    if status.phase == Some(ClusterPhase::Provisioning) && cp.ready == 0 && workers.ready == 0 {
        return ClusterPhase::Provisioning;
    }

    ClusterPhase::Degraded
}

fn has_finalizer(cluster: &ManagedCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

/* ============================= DISPATCH ============================= */

impl Reconciler {
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::default()
    }

    /// One reconcile pass for a single cluster key.
    pub async fn reconcile(&self, cluster: &ManagedCluster) -> Result<ReconcileOutcome, Error> {
        let name = cluster.name_any();
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let started = Instant::now();

        let result = self.reconcile_inner(&namespace, &name).await;

        if let Some(metrics) = self.metrics.as_ref() {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            metrics.reconcile_total.with_label_values(&[&name, outcome]).inc();
            metrics
                .reconcile_duration
                .with_label_values(&[&name])
                .observe(started.elapsed().as_secs_f64());
        }
        result
    }

    async fn reconcile_inner(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome, Error> {
        // A deleted object needs no reconcile and no error.
        let Some(latest) = self.kube.get_cluster(namespace, name).await? else {
            return Ok(ReconcileOutcome { requeue_after: None });
        };

        if latest.metadata.deletion_timestamp.is_some() {
            return self.teardown(latest).await;
        }

        if !has_finalizer(&latest) {
            let mut finalizers = latest.metadata.finalizers.clone().unwrap_or_default();
            finalizers.push(FINALIZER.to_string());
            self.kube.set_finalizers(&latest, finalizers).await?;
        }

        let job = ReconcileJob::new(latest);

        if self.handle_paused(&job).await? {
            return Ok(ReconcileOutcome {
                requeue_after: Some(self.cfg.default_requeue_after),
            });
        }

        {
            let mut cluster = job.cluster.lock().await;
            let cp_desired = cluster.spec.control_planes.count;
            let worker_desired = cluster.spec.workers.count;
            let status = cluster.status.get_or_insert_with(Default::default);
            if matches!(status.phase, None | Some(ClusterPhase::Pending)) {
                status.phase = Some(ClusterPhase::Provisioning);
            }
            status.control_planes.desired = cp_desired;
            status.workers.desired = worker_desired;
        }

        self.ensure_cloud_client(&job).await?;

        let cluster_state = self.build_state(&job).await?;

        self.sweep_stuck_nodes(&job).await?;
        self.verify_node_states(&job).await?;
        self.classify_node_health(&job).await?;

        let cp_hint = self.reconcile_control_planes(&job, &cluster_state).await?;
        let worker_hint = self.reconcile_workers(&job, &cluster_state).await?;

        self.surface_credential_gaps(&job).await;

        {
            let mut cluster = job.cluster.lock().await;
            let status = cluster.status.get_or_insert_with(Default::default);
            ledger::recount(status);
            let phase = compute_cluster_phase(status);
            status.phase = Some(phase);
            if status.control_planes.ready == status.control_planes.desired {
                set_condition(
                    status,
                    CONDITION_CONTROL_PLANE_READY,
                    CONDITION_TRUE,
                    "Healthy",
                    &format!("{} of {} control planes ready", status.control_planes.ready,
                        status.control_planes.desired),
                );
            }
        }

        self.probe_connectivity(&job).await;

        self.persist_job(&job).await?;
        self.export_cluster_metrics(&job).await;

        let requeue = [cp_hint, worker_hint]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.cfg.default_requeue_after);
        Ok(ReconcileOutcome { requeue_after: Some(requeue) })
    }

    /// Paused clusters get a condition, an event and a requeue; nothing
    /// else runs, so no cloud call can happen while paused.
    async fn handle_paused(&self, job: &ReconcileJob) -> Result<bool, Error> {
        let paused = {
            let cluster = job.cluster.lock().await;
            cluster.spec.paused
        };
        if !paused {
            let mut cluster = job.cluster.lock().await;
            if let Some(status) = cluster.status.as_mut() {
                clear_condition(status, CONDITION_PAUSED);
            }
            return Ok(false);
        }

        info!("cluster_paused");
        {
            let mut cluster = job.cluster.lock().await;
            let status = cluster.status.get_or_insert_with(Default::default);
            set_condition(
                status,
                CONDITION_PAUSED,
                CONDITION_TRUE,
                REASON_PAUSED,
                "reconciliation suspended by spec.paused",
            );
        }
        self.emit(job, REASON_PAUSED, "reconciliation suspended by spec.paused", false)
            .await;
        self.persist_job(job).await?;
        Ok(true)
    }

    /// Cloud client cache: built lazily from the cluster's credentials
    /// secret on first need.
    async fn ensure_cloud_client(&self, job: &ReconcileJob) -> Result<(), Error> {
        if self.cloud.lock().await.is_some() {
            return Ok(());
        }

        let (namespace, name) = {
            let cluster = job.cluster.lock().await;
            (
                cluster.metadata.namespace.clone().unwrap_or_default(),
                cluster.name_any(),
            )
        };
        let secret_name = format!("{name}-credentials");
        let token = self
            .kube
            .read_secret_key(&namespace, &secret_name, "hcloud-token")
            .await?
            .ok_or_else(|| {
                Error::SpecInvalid(format!(
                    "secret {namespace}/{secret_name} has no hcloud-token"
                ))
            })?;

        let mut provider = (self.cloud_factory)(&token)?;
        if let Some(metrics) = self.metrics.as_ref() {
            provider = InstrumentedCloud::wrap(provider, metrics.clone());
        }
        *self.cloud.lock().await = Some(provider);
        info!(cluster = %name, "cloud_client_initialized");
        Ok(())
    }

    pub(crate) async fn cloud_client(&self) -> Result<Arc<dyn CloudProvider>, Error> {
        self.cloud
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::SpecInvalid("cloud client not initialized".into()))
    }

    /// Resolves the cluster state and caches a freshly discovered network
    /// id on the status.
    async fn build_state(&self, job: &ReconcileJob) -> Result<ClusterState, Error> {
        let snapshot = job.snapshot().await;
        let cloud = self.cloud_client().await?;
        let cluster_state = state::build_cluster_state(&snapshot, cloud.as_ref()).await?;

        if cluster_state.network_id != 0 {
            let mut cluster = job.cluster.lock().await;
            let status = cluster.status.get_or_insert_with(Default::default);
            let infra = status.infrastructure.get_or_insert_with(Default::default);
            if infra.network_id == 0 {
                infra.network_id = cluster_state.network_id;
            }
        }
        Ok(cluster_state)
    }

    /// Surfaces the bootstrap mode where workers sit in `WaitingForK8s`
    /// because no Talos credentials are configured, instead of letting the
    /// gap masquerade as slow provisioning.
    async fn surface_credential_gaps(&self, job: &ReconcileJob) {
        if self.talos.has_credentials() {
            let mut cluster = job.cluster.lock().await;
            if let Some(status) = cluster.status.as_mut() {
                clear_condition(status, CONDITION_TALOS_CREDENTIALS);
            }
            return;
        }

        let mut cluster = job.cluster.lock().await;
        let Some(status) = cluster.status.as_mut() else { return };
        let parked = status
            .workers
            .nodes
            .iter()
            .filter(|n| n.phase == NodePhase::WaitingForK8s)
            .count();
        if parked > 0 {
            set_condition(
                status,
                CONDITION_TALOS_CREDENTIALS,
                CONDITION_FALSE,
                "CredentialsMissing",
                &format!("{parked} worker(s) waiting for talos credentials"),
            );
        }
    }

    /* ============================= TEARDOWN ============================= */

    /// Finalizer-driven cleanup: best-effort deletion of every recorded
    /// cloud server, then finalizer removal.
    async fn teardown(&self, cluster: ManagedCluster) -> Result<ReconcileOutcome, Error> {
        let name = cluster.name_any();
        if !has_finalizer(&cluster) {
            return Ok(ReconcileOutcome { requeue_after: None });
        }
        info!(cluster = %name, "tearing_down_cluster");

        let job = ReconcileJob::new(cluster.clone());
        let cloud = match self.ensure_cloud_client(&job).await {
            Ok(()) => self.cloud_client().await.ok(),
            Err(e) => {
                warn!(cluster = %name, error = %e, "teardown_without_cloud_client");
                None
            }
        };

        if let (Some(cloud), Some(status)) = (cloud, cluster.status.as_ref()) {
            for role in [NodeRole::ControlPlane, NodeRole::Worker] {
                for node in &status.group(role).nodes {
                    if let Err(e) = cloud.delete_server(&node.name).await {
                        warn!(server = %node.name, error = %e, "teardown_delete_failed");
                    }
                }
            }
        }

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.forget_cluster(&name);
        }

        let remaining: Vec<String> = cluster
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect();
        self.kube.set_finalizers(&cluster, remaining).await?;
        info!(cluster = %name, "teardown_complete");
        Ok(ReconcileOutcome { requeue_after: None })
    }

    /* ============================= SHARED HELPERS ============================= */

    /// Ledger update followed by an in-place persist, so partial progress
    /// survives operator restart.
    pub(crate) async fn update_node(
        &self,
        job: &ReconcileJob,
        role: NodeRole,
        name: &str,
        patch: NodePatch,
    ) -> Result<(), Error> {
        let mut cluster = job.cluster.lock().await;
        let status = cluster.status.get_or_insert_with(Default::default);
        ledger::update(status, role, name, patch);
        crate::status::persist(self.kube.as_ref(), &mut cluster, &self.cfg).await
    }

    pub(crate) async fn persist_job(&self, job: &ReconcileJob) -> Result<(), Error> {
        let mut cluster = job.cluster.lock().await;
        crate::status::persist(self.kube.as_ref(), &mut cluster, &self.cfg).await
    }

    /// Best-effort event publication; a failed event never fails the
    /// reconcile.
    pub(crate) async fn emit(&self, job: &ReconcileJob, reason: &str, note: &str, warning: bool) {
        let cluster = job.snapshot().await;
        if let Err(e) = self.kube.publish_event(&cluster, reason, note, warning).await {
            warn!(reason, error = %e, "event_publish_failed");
        }
    }

    async fn export_cluster_metrics(&self, job: &ReconcileJob) {
        let Some(metrics) = self.metrics.as_ref() else { return };
        let cluster = job.cluster.lock().await;
        let name = cluster.name_any();
        let Some(status) = cluster.status.as_ref() else { return };
        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            let group = status.group(role);
            metrics
                .nodes_total
                .with_label_values(&[&name, role.as_str()])
                .set(group.nodes.len() as i64);
            metrics
                .nodes_healthy
                .with_label_values(&[&name, role.as_str()])
                .set(group.ready as i64);
            metrics
                .nodes_desired
                .with_label_values(&[&name, role.as_str()])
                .set(group.desired as i64);
        }
    }
}

/* ============================= TESTS ============================= */
