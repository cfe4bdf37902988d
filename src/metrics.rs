use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, proto::MetricFamily,
};

/// Per-instance metric set owning its registry, so tests construct isolated
/// instances instead of sharing process globals. All helpers are gated by
/// the operator's `enable_metrics` flag simply by not constructing one.
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,

    pub reconcile_total: IntCounterVec,
    pub reconcile_duration: HistogramVec,

    pub nodes_total: IntGaugeVec,
    pub nodes_healthy: IntGaugeVec,
    pub nodes_desired: IntGaugeVec,

    pub node_replacement_total: IntCounterVec,
    pub node_replacement_duration: HistogramVec,

    pub etcd_members: IntGaugeVec,
    pub etcd_healthy: IntGaugeVec,

    pub cloud_api_requests_total: IntCounterVec,
    pub cloud_api_duration: HistogramVec,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("talzner_reconcile_total", "Total reconcile cycles"),
            &["cluster", "result"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(reconcile_total.clone()))
            .expect("metric not yet registered");

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "talzner_reconcile_duration_seconds",
                "Duration of each reconcile cycle in seconds",
            ),
            &["cluster"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(reconcile_duration.clone()))
            .expect("metric not yet registered");

        let nodes_total = IntGaugeVec::new(
            Opts::new("talzner_nodes_total", "Node records per cluster and role"),
            &["cluster", "role"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(nodes_total.clone()))
            .expect("metric not yet registered");

        let nodes_healthy = IntGaugeVec::new(
            Opts::new("talzner_nodes_healthy", "Healthy nodes per cluster and role"),
            &["cluster", "role"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(nodes_healthy.clone()))
            .expect("metric not yet registered");

        let nodes_desired = IntGaugeVec::new(
            Opts::new("talzner_nodes_desired", "Desired nodes per cluster and role"),
            &["cluster", "role"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(nodes_desired.clone()))
            .expect("metric not yet registered");

        let node_replacement_total = IntCounterVec::new(
            Opts::new("talzner_node_replacement_total", "Node replacements initiated"),
            &["cluster", "role"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(node_replacement_total.clone()))
            .expect("metric not yet registered");

        let node_replacement_duration = HistogramVec::new(
            HistogramOpts::new(
                "talzner_node_replacement_duration_seconds",
                "Duration of completed node replacements in seconds",
            ),
            &["cluster"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(node_replacement_duration.clone()))
            .expect("metric not yet registered");

        let etcd_members = IntGaugeVec::new(
            Opts::new("talzner_etcd_members", "etcd members observed per cluster"),
            &["cluster"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(etcd_members.clone()))
            .expect("metric not yet registered");

        let etcd_healthy = IntGaugeVec::new(
            Opts::new("talzner_etcd_healthy", "Whether etcd quorum is intact (0/1)"),
            &["cluster"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(etcd_healthy.clone()))
            .expect("metric not yet registered");

        let cloud_api_requests_total = IntCounterVec::new(
            Opts::new("talzner_cloud_api_requests_total", "Cloud API calls"),
            &["operation", "result"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(cloud_api_requests_total.clone()))
            .expect("metric not yet registered");

        let cloud_api_duration = HistogramVec::new(
            HistogramOpts::new(
                "talzner_cloud_api_duration_seconds",
                "Cloud API call latency in seconds",
            ),
            &["operation"],
        )
        .expect("metric definition is valid");
        registry
            .register(Box::new(cloud_api_duration.clone()))
            .expect("metric not yet registered");

        Self {
            registry,
            reconcile_total,
            reconcile_duration,
            nodes_total,
            nodes_healthy,
            nodes_desired,
            node_replacement_total,
            node_replacement_duration,
            etcd_members,
            etcd_healthy,
            cloud_api_requests_total,
            cloud_api_duration,
        }
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Drops the per-cluster series once a cluster is deleted.
    pub fn forget_cluster(&self, cluster: &str) {
        for role in ["control-plane", "worker"] {
            let _ = self.nodes_total.remove_label_values(&[cluster, role]);
            let _ = self.nodes_healthy.remove_label_values(&[cluster, role]);
            let _ = self.nodes_desired.remove_label_values(&[cluster, role]);
        }
        let _ = self.etcd_members.remove_label_values(&[cluster]);
        let _ = self.etcd_healthy.remove_label_values(&[cluster]);
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/* ============================= CLOUD INSTRUMENTATION ============================= */

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::cloud::{CloudProvider, CloudServer, CreateServerRequest};
use crate::error::Error;

/// Decorator recording a counter and latency histogram around every cloud
/// call, labeled by operation and result.
pub struct InstrumentedCloud {
    inner: Arc<dyn CloudProvider>,
    metrics: Arc<ControllerMetrics>,
}

impl InstrumentedCloud {
    pub fn wrap(inner: Arc<dyn CloudProvider>, metrics: Arc<ControllerMetrics>) -> Arc<dyn CloudProvider> {
        Arc::new(Self { inner, metrics })
    }

    fn record<T>(&self, operation: &str, started: Instant, result: &Result<T, Error>) {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .cloud_api_requests_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.metrics
            .cloud_api_duration
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl CloudProvider for InstrumentedCloud {
    async fn create_server(&self, req: &CreateServerRequest) -> Result<i64, Error> {
        let started = Instant::now();
        let result = self.inner.create_server(req).await;
        self.record("CreateServer", started, &result);
        result
    }

    async fn delete_server(&self, name: &str) -> Result<(), Error> {
        let started = Instant::now();
        let result = self.inner.delete_server(name).await;
        self.record("DeleteServer", started, &result);
        result
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<CloudServer>, Error> {
        let started = Instant::now();
        let result = self.inner.get_server_by_name(name).await;
        self.record("GetServerByName", started, &result);
        result
    }

    async fn get_server_ip(&self, name: &str) -> Result<Option<String>, Error> {
        let started = Instant::now();
        let result = self.inner.get_server_ip(name).await;
        self.record("GetServerIP", started, &result);
        result
    }

    async fn get_server_id(&self, name: &str) -> Result<Option<i64>, Error> {
        let started = Instant::now();
        let result = self.inner.get_server_id(name).await;
        self.record("GetServerID", started, &result);
        result
    }

    async fn get_servers_by_label(&self, selector: &str) -> Result<Vec<CloudServer>, Error> {
        let started = Instant::now();
        let result = self.inner.get_servers_by_label(selector).await;
        self.record("GetServersByLabel", started, &result);
        result
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64, Error> {
        let started = Instant::now();
        let result = self.inner.create_ssh_key(name, public_key, labels).await;
        self.record("CreateSSHKey", started, &result);
        result
    }

    async fn delete_ssh_key(&self, name: &str) -> Result<(), Error> {
        let started = Instant::now();
        let result = self.inner.delete_ssh_key(name).await;
        self.record("DeleteSSHKey", started, &result);
        result
    }

    async fn get_network(&self, name: &str) -> Result<Option<i64>, Error> {
        let started = Instant::now();
        let result = self.inner.get_network(name).await;
        self.record("GetNetwork", started, &result);
        result
    }

    async fn get_snapshot_by_labels(&self, selector: &str) -> Result<Option<i64>, Error> {
        let started = Instant::now();
        let result = self.inner.get_snapshot_by_labels(selector).await;
        self.record("GetSnapshotByLabels", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudProvider;

    #[test]
    fn test_two_instances_have_isolated_registries() {
        let a = ControllerMetrics::new();
        let b = ControllerMetrics::new();
        a.reconcile_total.with_label_values(&["demo", "ok"]).inc();

        let count = |m: &ControllerMetrics| {
            m.gather()
                .iter()
                .filter(|f| f.get_name() == "talzner_reconcile_total")
                .flat_map(|f| f.get_metric())
                .map(|metric| metric.get_counter().get_value() as i64)
                .sum::<i64>()
        };
        assert_eq!(count(&a), 1);
        assert_eq!(count(&b), 0);
    }

    #[test]
    fn test_all_families_registered() {
        let metrics = ControllerMetrics::new();
        metrics.nodes_total.with_label_values(&["demo", "worker"]).set(2);
        metrics.etcd_members.with_label_values(&["demo"]).set(3);
        metrics
            .cloud_api_requests_total
            .with_label_values(&["CreateServer", "ok"])
            .inc();

        let names: Vec<String> = metrics
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"talzner_nodes_total".to_string()));
        assert!(names.contains(&"talzner_etcd_members".to_string()));
        assert!(names.contains(&"talzner_cloud_api_requests_total".to_string()));
    }

    #[test]
    fn test_forget_cluster_removes_series() {
        let metrics = ControllerMetrics::new();
        metrics.nodes_total.with_label_values(&["demo", "worker"]).set(2);
        metrics.forget_cluster("demo");

        let remaining: i64 = metrics
            .gather()
            .iter()
            .filter(|f| f.get_name() == "talzner_nodes_total")
            .map(|f| f.get_metric().len() as i64)
            .sum();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_instrumented_cloud_counts_calls() {
        let mut mock = MockCloudProvider::new();
        mock.expect_get_network().returning(|_| Ok(Some(1)));
        mock.expect_delete_server()
            .returning(|_| Err(Error::cloud("DeleteServer", "boom")));

        let metrics = Arc::new(ControllerMetrics::new());
        let cloud = InstrumentedCloud::wrap(Arc::new(mock), metrics.clone());

        let _ = cloud.get_network("demo-network").await;
        let _ = cloud.delete_server("demo-w-abc12").await;

        let value = |op: &str, result: &str| {
            metrics
                .cloud_api_requests_total
                .with_label_values(&[op, result])
                .get()
        };
        assert_eq!(value("GetNetwork", "ok"), 1);
        assert_eq!(value("DeleteServer", "error"), 1);
    }
}
