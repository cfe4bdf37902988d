#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus as K8sNodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use talzner::cloud::{CloudProvider, CloudServer, CreateServerRequest};
use talzner::config::OperatorConfig;
use talzner::crd::{
    FINALIZER, ManagedCluster, ManagedClusterSpec, ManagedClusterStatus, NodeGroupSpec, NodePhase,
    NodeStatus,
};
use talzner::error::Error;
use talzner::kube_api::KubeApi;
use talzner::reconcile::Reconciler;
use talzner::state::ClusterState;
use talzner::talos::{EtcdMember, TalosApi};

/* ============================= BUILDERS ============================= */

pub fn make_cluster(name: &str, cp_count: i32, worker_count: i32) -> ManagedCluster {
    ManagedCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            finalizers: Some(vec![FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: ManagedClusterSpec {
            region: "fsn1".to_string(),
            control_planes: NodeGroupSpec { count: cp_count, size: "cx32".to_string() },
            workers: NodeGroupSpec { count: worker_count, size: "cx22".to_string() },
            ..Default::default()
        },
        status: Some(ManagedClusterStatus::default()),
    }
}

pub fn ready_record(name: &str) -> NodeStatus {
    NodeStatus {
        name: name.to_string(),
        server_id: 1,
        private_ip: format!("10.0.0.{}", name.len()),
        public_ip: format!("192.0.2.{}", name.len()),
        healthy: true,
        phase: NodePhase::Ready,
        phase_transition_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

pub fn unhealthy_record(name: &str, server_id: i64, minutes_ago: i64) -> NodeStatus {
    NodeStatus {
        name: name.to_string(),
        server_id,
        private_ip: format!("10.0.0.{}", name.len()),
        public_ip: format!("192.0.2.{}", name.len()),
        healthy: false,
        unhealthy_since: Some(Time(Utc::now() - chrono::Duration::minutes(minutes_ago))),
        unhealthy_reason: Some("NodeNotReady".to_string()),
        phase: NodePhase::Unhealthy,
        phase_transition_time: Some(Time(Utc::now() - chrono::Duration::minutes(minutes_ago))),
        ..Default::default()
    }
}

pub fn make_k8s_node(name: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        status: Some(K8sNodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Config with sub-second waits so failing polls do not stall the suite.
pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        status_retry_interval: Duration::from_millis(10),
        server_ip_timeout: Duration::from_millis(200),
        server_ip_poll_interval: Duration::from_millis(20),
        node_ready_timeout: Duration::from_millis(200),
        node_ready_poll_interval: Duration::from_millis(20),
        drain_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn build_reconciler(
    kube: Arc<FakeKube>,
    talos: Arc<FakeTalos>,
    cloud: Arc<FakeCloud>,
) -> Reconciler {
    Reconciler::builder()
        .kube(kube)
        .talos(talos)
        .cloud(cloud)
        .config(test_config())
        .build()
        .expect("reconciler assembles")
}

/* ============================= FAKE KUBERNETES ============================= */

/// Recording in-memory `KubeApi`. Status writes mimic the subresource:
/// only `.status` of the stored object changes.
#[derive(Default)]
pub struct FakeKube {
    pub clusters: Mutex<HashMap<String, ManagedCluster>>,
    pub status_history: Mutex<Vec<ManagedClusterStatus>>,
    pub nodes: Mutex<Vec<Node>>,
    /// Unknown node names resolve to a Ready node, so freshly provisioned
    /// machines register instantly.
    pub auto_ready_nodes: bool,
    pub secrets: Mutex<HashMap<String, String>>,
    pub events: Mutex<Vec<(String, String, bool)>>,
    pub cordoned: Mutex<Vec<String>>,
    pub evicted: Mutex<Vec<String>>,
    pub deleted_nodes: Mutex<Vec<String>>,
    pub conflicts_remaining: Mutex<u32>,
    pub fail_status_writes: bool,
}

impl FakeKube {
    pub fn with_cluster(cluster: ManagedCluster) -> Self {
        let fake = Self::default();
        fake.store(cluster);
        fake
    }

    pub fn store(&self, cluster: ManagedCluster) {
        let key = cluster_key(&cluster);
        self.clusters.lock().unwrap().insert(key, cluster);
    }

    pub fn stored(&self, name: &str) -> ManagedCluster {
        self.clusters
            .lock()
            .unwrap()
            .get(&format!("default/{name}"))
            .cloned()
            .expect("cluster stored")
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(r, _, _)| r.clone()).collect()
    }
}

fn cluster_key(cluster: &ManagedCluster) -> String {
    format!(
        "{}/{}",
        cluster.metadata.namespace.as_deref().unwrap_or_default(),
        cluster.metadata.name.as_deref().unwrap_or_default()
    )
}

fn conflict_error() -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }),
    }
}

fn server_error() -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "internal error".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }),
    }
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedCluster>, Error> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned())
    }

    async fn replace_cluster_status(
        &self,
        cluster: &ManagedCluster,
    ) -> Result<ManagedCluster, Error> {
        if self.fail_status_writes {
            return Err(server_error());
        }
        {
            let mut conflicts = self.conflicts_remaining.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(conflict_error());
            }
        }
        let key = cluster_key(cluster);
        let mut clusters = self.clusters.lock().unwrap();
        let stored = clusters.entry(key).or_insert_with(|| cluster.clone());
        stored.status = cluster.status.clone();
        self.status_history
            .lock()
            .unwrap()
            .push(cluster.status.clone().unwrap_or_default());
        Ok(stored.clone())
    }

    async fn set_finalizers(
        &self,
        cluster: &ManagedCluster,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let key = cluster_key(cluster);
        if let Some(stored) = self.clusters.lock().unwrap().get_mut(&key) {
            stored.metadata.finalizers =
                if finalizers.is_empty() { None } else { Some(finalizers) };
        }
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let listed = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .cloned();
        if listed.is_some() {
            return Ok(listed);
        }
        if self.auto_ready_nodes {
            return Ok(Some(make_k8s_node(name, true)));
        }
        Ok(None)
    }

    async fn cordon_node(&self, name: &str) -> Result<(), Error> {
        self.cordoned.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn evict_node_pods(&self, node_name: &str) -> Result<(), Error> {
        self.evicted.lock().unwrap().push(node_name.to_string());
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        self.deleted_nodes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, Error> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}/{key}"))
            .cloned())
    }

    async fn publish_event(
        &self,
        _cluster: &ManagedCluster,
        reason: &str,
        note: &str,
        warning: bool,
    ) -> Result<(), Error> {
        self.events
            .lock()
            .unwrap()
            .push((reason.to_string(), note.to_string(), warning));
        Ok(())
    }
}

/* ============================= FAKE CLOUD ============================= */

/// Recording in-memory cloud. Created servers come up `running` with both
/// addresses assigned immediately.
pub struct FakeCloud {
    pub servers: Mutex<HashMap<String, CloudServer>>,
    pub calls: Mutex<Vec<(String, String)>>,
    pub create_requests: Mutex<Vec<CreateServerRequest>>,
    pub next_id: Mutex<i64>,
    pub network_id: Option<i64>,
    pub snapshot_id: Option<i64>,
    pub fail_create: bool,
    pub fail_delete: bool,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            create_requests: Mutex::new(Vec::new()),
            next_id: Mutex::new(1000),
            network_id: Some(100),
            snapshot_id: Some(200),
            fail_create: false,
            fail_delete: false,
        }
    }
}

impl FakeCloud {
    pub fn with_server(self, name: &str, status: &str) -> Self {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.servers.lock().unwrap().insert(
            name.to_string(),
            CloudServer {
                id,
                name: name.to_string(),
                status: status.to_string(),
                public_ip: format!("192.0.2.{}", id % 250),
                private_ips: vec![format!("10.0.1.{}", id % 250)],
            },
        );
        self
    }

    pub fn calls_named(&self, operation: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn record(&self, operation: &str, name: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), name.to_string()));
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_server(&self, req: &CreateServerRequest) -> Result<i64, Error> {
        self.record("CreateServer", &req.name);
        self.create_requests.lock().unwrap().push(req.clone());
        if self.fail_create {
            return Err(Error::cloud("CreateServer", "induced failure"));
        }
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        self.servers.lock().unwrap().insert(
            req.name.clone(),
            CloudServer {
                id,
                name: req.name.clone(),
                status: "running".to_string(),
                public_ip: format!("192.0.2.{}", id % 250),
                private_ips: vec![format!("10.0.1.{}", id % 250)],
            },
        );
        Ok(id)
    }

    async fn delete_server(&self, name: &str) -> Result<(), Error> {
        self.record("DeleteServer", name);
        if self.fail_delete {
            return Err(Error::cloud("DeleteServer", "induced delete failure"));
        }
        self.servers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<CloudServer>, Error> {
        Ok(self.servers.lock().unwrap().get(name).cloned())
    }

    async fn get_server_ip(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self
            .servers
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.public_ip.clone())
            .filter(|ip| !ip.is_empty()))
    }

    async fn get_server_id(&self, name: &str) -> Result<Option<i64>, Error> {
        Ok(self.servers.lock().unwrap().get(name).map(|s| s.id))
    }

    async fn get_servers_by_label(&self, _selector: &str) -> Result<Vec<CloudServer>, Error> {
        Ok(self.servers.lock().unwrap().values().cloned().collect())
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        _public_key: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<i64, Error> {
        self.record("CreateSSHKey", name);
        Ok(7)
    }

    async fn delete_ssh_key(&self, name: &str) -> Result<(), Error> {
        self.record("DeleteSSHKey", name);
        Ok(())
    }

    async fn get_network(&self, _name: &str) -> Result<Option<i64>, Error> {
        Ok(self.network_id)
    }

    async fn get_snapshot_by_labels(&self, _selector: &str) -> Result<Option<i64>, Error> {
        Ok(self.snapshot_id)
    }
}

/* ============================= FAKE TALOS ============================= */

#[derive(Default)]
pub struct FakeTalos {
    pub credentials_missing: bool,
    pub members: Mutex<Vec<EtcdMember>>,
    pub removed_members: Mutex<Vec<u64>>,
    pub applied_configs: Mutex<Vec<String>>,
    pub kubelet_running: Mutex<HashSet<String>>,
    pub maintenance: Mutex<HashSet<String>>,
    pub api_reachable: Mutex<HashSet<String>>,
    pub fail_apply: bool,
    pub fail_generate: bool,
    pub fail_members: bool,
}

impl FakeTalos {
    pub fn with_members(self, members: Vec<EtcdMember>) -> Self {
        *self.members.lock().unwrap() = members;
        self
    }
}

pub fn etcd_member(id: u64, name: &str, peer_ip: &str) -> EtcdMember {
    EtcdMember {
        id,
        name: name.to_string(),
        peer_endpoint: format!("https://{peer_ip}:2380"),
        is_leader: false,
    }
}

#[async_trait]
impl TalosApi for FakeTalos {
    fn has_credentials(&self) -> bool {
        !self.credentials_missing
    }

    async fn generate_machine_config(
        &self,
        _role: talzner::crd::NodeRole,
        _state: &ClusterState,
        _extra_sans: &[String],
    ) -> Result<Vec<u8>, Error> {
        if self.fail_generate {
            return Err(Error::Talos("induced generate failure".to_string()));
        }
        Ok(b"machine: config".to_vec())
    }

    async fn apply_config(&self, node_ip: &str, _config: &[u8]) -> Result<(), Error> {
        if self.fail_apply {
            return Err(Error::Talos("induced apply failure".to_string()));
        }
        self.applied_configs.lock().unwrap().push(node_ip.to_string());
        Ok(())
    }

    async fn is_node_in_maintenance_mode(&self, node_ip: &str) -> Result<bool, Error> {
        Ok(self.maintenance.lock().unwrap().contains(node_ip))
    }

    async fn is_machine_configured(&self, node_ip: &str) -> Result<bool, Error> {
        Ok(self.applied_configs.lock().unwrap().iter().any(|ip| ip == node_ip))
    }

    async fn is_kubelet_running(&self, node_ip: &str) -> Result<bool, Error> {
        Ok(self.kubelet_running.lock().unwrap().contains(node_ip))
    }

    async fn is_api_reachable(&self, node_ip: &str) -> Result<bool, Error> {
        Ok(self.api_reachable.lock().unwrap().contains(node_ip))
    }

    async fn get_etcd_members(&self, _node_ip: &str) -> Result<Vec<EtcdMember>, Error> {
        if self.fail_members {
            return Err(Error::Talos("etcd unreachable".to_string()));
        }
        Ok(self.members.lock().unwrap().clone())
    }

    async fn remove_etcd_member(&self, _node_ip: &str, member_id: u64) -> Result<(), Error> {
        self.removed_members.lock().unwrap().push(member_id);
        Ok(())
    }

    async fn wait_for_node_ready(
        &self,
        _node_ip: &str,
        _timeout: Duration,
    ) -> Result<(), Error> {
        Ok(())
    }
}
