use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying a comma-separated list of cloud SSH key identifiers.
pub const ANNOTATION_SSH_KEYS: &str = "talzner.dev/ssh-keys";

/// Annotation pinning the control-plane endpoint (IP or DNS name).
pub const ANNOTATION_CONTROL_PLANE_ENDPOINT: &str = "talzner.dev/control-plane-endpoint";

/// Finalizer ensuring cloud resources are released before the object goes away.
pub const FINALIZER: &str = "talzner.dev/cleanup";

/* ============================= ROLES ============================= */

/// Role a provisioned machine plays in the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }

    /// Short form used in generated server names.
    pub fn short(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "cp",
            NodeRole::Worker => "w",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= NODE PHASES ============================= */

/// Lifecycle phase of a single provisioned machine.
///
/// Phases are ordered; the numeric rank drives `ledger::should_advance`,
/// which forbids backward drift from transient API reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum NodePhase {
    #[default]
    CreatingServer,
    WaitingForIP,
    WaitingForTalosAPI,
    ApplyingTalosConfig,
    RebootingWithConfig,
    WaitingForK8s,
    NodeInitializing,
    Ready,
    Unhealthy,
    Draining,
    RemovingFromEtcd,
    DeletingServer,
    Failed,
}

impl NodePhase {
    /// Ordering rank. Every current variant is ranked; `None` is kept as an
    /// escape hatch so unranked variants added later advance unconditionally.
    pub fn rank(&self) -> Option<u8> {
        Some(match self {
            NodePhase::CreatingServer => 1,
            NodePhase::WaitingForIP => 2,
            NodePhase::WaitingForTalosAPI => 3,
            NodePhase::ApplyingTalosConfig => 4,
            NodePhase::RebootingWithConfig => 5,
            NodePhase::WaitingForK8s => 6,
            NodePhase::NodeInitializing => 7,
            NodePhase::Ready => 8,
            NodePhase::Unhealthy => 9,
            NodePhase::Draining => 10,
            NodePhase::RemovingFromEtcd => 11,
            NodePhase::DeletingServer => 12,
            NodePhase::Failed => 13,
        })
    }

    /// Phases 1 through 7: the machine is still being brought up and any
    /// node in one of them blocks further scale-up.
    pub fn is_early_provisioning(&self) -> bool {
        matches!(self.rank(), Some(r) if (1..=7).contains(&r))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodePhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodePhase::CreatingServer => "CreatingServer",
            NodePhase::WaitingForIP => "WaitingForIP",
            NodePhase::WaitingForTalosAPI => "WaitingForTalosAPI",
            NodePhase::ApplyingTalosConfig => "ApplyingTalosConfig",
            NodePhase::RebootingWithConfig => "RebootingWithConfig",
            NodePhase::WaitingForK8s => "WaitingForK8s",
            NodePhase::NodeInitializing => "NodeInitializing",
            NodePhase::Ready => "Ready",
            NodePhase::Unhealthy => "Unhealthy",
            NodePhase::Draining => "Draining",
            NodePhase::RemovingFromEtcd => "RemovingFromEtcd",
            NodePhase::DeletingServer => "DeletingServer",
            NodePhase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= CLUSTER PHASES ============================= */

/// Coarse phase reported for the whole cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Degraded,
    Healing,
}

impl ClusterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Provisioning => "Provisioning",
            ClusterPhase::Running => "Running",
            ClusterPhase::Degraded => "Degraded",
            ClusterPhase::Healing => "Healing",
        }
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= SPEC ============================= */

/// Desired size of one node group.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Number of machines in the group.
    pub count: i32,

    /// Cloud server type (e.g. "cx22").
    pub size: String,
}

/// Thresholds controlling when a degraded node becomes a replacement candidate.
///
/// Values are duration strings ("3m", "90s"); unset fields fall back to the
/// operator defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_not_ready_threshold: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_unhealthy_threshold: Option<String>,
}

/// ManagedCluster declares a Talos-based Kubernetes cluster provisioned on
/// Hetzner Cloud.
///
/// The operator exclusively owns the `.status` subresource; it never mutates
/// `.spec`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "talzner.dev",
    version = "v1alpha1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Cloud location for every server (e.g. "fsn1").
    pub region: String,

    /// Control-plane group sizing.
    pub control_planes: NodeGroupSpec,

    /// Worker group sizing.
    pub workers: NodeGroupSpec,

    /// Self-healing thresholds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,

    /// Addon configuration, opaque to the reconcile engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<BTreeMap<String, String>>,

    /// Public DNS name of the cluster; enables the connectivity probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// When true, reconciliation is suspended entirely.
    #[serde(default)]
    pub paused: bool,

    /// Opaque bootstrap record carried through by external tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BTreeMap<String, String>>,
}

/* ============================= STATUS ============================= */

/// One record per provisioned machine, identified by its stable cloud-server
/// name. A record may exist before any Kubernetes Node object does and may
/// outlive it during teardown.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,

    /// Cloud server handle; zero until the create call is acknowledged.
    #[serde(default)]
    pub server_id: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_ip: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_ip: String,

    /// Always recomputed as `phase == Ready` after every ledger update.
    #[serde(default)]
    pub healthy: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_reason: Option<String>,

    #[serde(default)]
    pub phase: NodePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_reason: Option<String>,

    /// Advances only when `phase` actually changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_transition_time: Option<Time>,
}

/// Observed state of one node group.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    #[serde(default)]
    pub desired: i32,

    #[serde(default)]
    pub ready: i32,

    #[serde(default)]
    pub unhealthy: i32,

    /// Unordered set keyed by `name`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeStatus>,
}

impl NodeGroupStatus {
    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut NodeStatus> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }
}

/// Human-readable condition on the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False".
    pub status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Cached cloud infrastructure handles so repeat lookups are avoided.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(default)]
    pub network_id: i64,

    #[serde(default)]
    pub load_balancer_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
}

/// Result of the last endpoint connectivity probe.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,

    #[serde(default)]
    pub reachable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// ManagedClusterStatus reports the observed cluster state.
///
/// Written only through the optimistic-concurrency persist path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,

    #[serde(default)]
    pub control_planes: NodeGroupStatus,

    #[serde(default)]
    pub workers: NodeGroupStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure: Option<InfrastructureStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<ConnectivityStatus>,

    /// Addon deployment state owned by the downstream addon phase; the
    /// engine only preserves it across status-conflict retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<BTreeMap<String, String>>,
}

impl ManagedClusterStatus {
    pub fn group(&self, role: NodeRole) -> &NodeGroupStatus {
        match role {
            NodeRole::ControlPlane => &self.control_planes,
            NodeRole::Worker => &self.workers,
        }
    }

    pub fn group_mut(&mut self, role: NodeRole) -> &mut NodeGroupStatus {
        match role {
            NodeRole::ControlPlane => &mut self.control_planes,
            NodeRole::Worker => &mut self.workers,
        }
    }
}

/* ============================= ANNOTATION ACCESSORS ============================= */

impl ManagedCluster {
    /// SSH key identifiers from the `talzner.dev/ssh-keys` annotation.
    /// Empty entries are dropped; a missing or blank annotation yields `None`.
    pub fn ssh_keys_annotation(&self) -> Option<Vec<String>> {
        let raw = self.metadata.annotations.as_ref()?.get(ANNOTATION_SSH_KEYS)?;
        let keys: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if keys.is_empty() { None } else { Some(keys) }
    }

    /// Pinned control-plane endpoint from the annotation, if any.
    pub fn control_plane_endpoint_annotation(&self) -> Option<String> {
        self.metadata
            .annotations
            .as_ref()?
            .get(ANNOTATION_CONTROL_PLANE_ENDPOINT)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResourceExt;

    fn cluster_with_annotations(pairs: &[(&str, &str)]) -> ManagedCluster {
        let annotations: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: ManagedClusterSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_crd_generates_valid_yaml() {
        let crd = ManagedCluster::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("talzner.dev"));
        assert!(yaml.contains("ManagedCluster"));
        assert!(yaml.contains("managedclusters"));
    }

    #[test]
    fn test_crd_api_group() {
        let crd = ManagedCluster::crd();
        assert_eq!(crd.spec.group, "talzner.dev");
    }

    #[test]
    fn test_crd_version() {
        let crd = ManagedCluster::crd();
        assert!(!crd.spec.versions.is_empty());
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    }

    #[test]
    fn test_crd_is_namespaced() {
        let crd = ManagedCluster::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_crd_has_status_subresource() {
        let crd = ManagedCluster::crd();
        let subresources = crd.spec.versions[0].subresources.as_ref();
        assert!(subresources.is_some_and(|s| s.status.is_some()));
    }

    #[test]
    fn test_node_phase_ranks_are_strictly_increasing() {
        let ordered = [
            NodePhase::CreatingServer,
            NodePhase::WaitingForIP,
            NodePhase::WaitingForTalosAPI,
            NodePhase::ApplyingTalosConfig,
            NodePhase::RebootingWithConfig,
            NodePhase::WaitingForK8s,
            NodePhase::NodeInitializing,
            NodePhase::Ready,
            NodePhase::Unhealthy,
            NodePhase::Draining,
            NodePhase::RemovingFromEtcd,
            NodePhase::DeletingServer,
            NodePhase::Failed,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].rank().unwrap() < pair[1].rank().unwrap());
        }
    }

    #[test]
    fn test_early_provisioning_covers_phases_one_through_seven() {
        assert!(NodePhase::CreatingServer.is_early_provisioning());
        assert!(NodePhase::WaitingForIP.is_early_provisioning());
        assert!(NodePhase::NodeInitializing.is_early_provisioning());
        assert!(!NodePhase::Ready.is_early_provisioning());
        assert!(!NodePhase::Unhealthy.is_early_provisioning());
        assert!(!NodePhase::Failed.is_early_provisioning());
        assert!(!NodePhase::Draining.is_early_provisioning());
        assert!(!NodePhase::RemovingFromEtcd.is_early_provisioning());
        assert!(!NodePhase::DeletingServer.is_early_provisioning());
    }

    #[test]
    fn test_node_phase_serializes_as_pascal_case() {
        let json = serde_json::to_string(&NodePhase::WaitingForTalosAPI).unwrap();
        assert_eq!(json, r#""WaitingForTalosAPI""#);
    }

    #[test]
    fn test_role_short_forms() {
        assert_eq!(NodeRole::ControlPlane.short(), "cp");
        assert_eq!(NodeRole::Worker.short(), "w");
    }

    #[test]
    fn test_spec_serialization_roundtrip() {
        let spec = ManagedClusterSpec {
            region: "fsn1".to_string(),
            control_planes: NodeGroupSpec { count: 3, size: "cx22".to_string() },
            workers: NodeGroupSpec { count: 2, size: "cx32".to_string() },
            health_check: Some(HealthCheckSpec {
                node_not_ready_threshold: Some("3m".to_string()),
                etcd_unhealthy_threshold: None,
            }),
            ..Default::default()
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        let back: ManagedClusterSpec = serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(back.region, "fsn1");
        assert_eq!(back.control_planes.count, 3);
        assert_eq!(back.workers.size, "cx32");
        assert_eq!(
            back.health_check.unwrap().node_not_ready_threshold.as_deref(),
            Some("3m")
        );
        assert!(!back.paused);
    }

    #[test]
    fn test_spec_paused_defaults_false() {
        let json = r#"{"region":"fsn1","controlPlanes":{"count":1,"size":"cx22"},"workers":{"count":0,"size":"cx22"}}"#;
        let spec: ManagedClusterSpec = serde_json::from_str(json).expect("should deserialize");
        assert!(!spec.paused);
        assert!(spec.health_check.is_none());
        assert!(spec.domain.is_none());
    }

    #[test]
    fn test_status_omits_empty_collections_in_json() {
        let status = ManagedClusterStatus {
            phase: Some(ClusterPhase::Running),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        assert!(json.contains("Running"));
        assert!(!json.contains("conditions"));
        assert!(!json.contains("infrastructure"));
        assert!(!json.contains("connectivity"));
    }

    #[test]
    fn test_node_status_zero_fields_omitted() {
        let node = NodeStatus {
            name: "demo-w-abc12".to_string(),
            phase: NodePhase::CreatingServer,
            ..Default::default()
        };
        let json = serde_json::to_string(&node).expect("should serialize");
        assert!(!json.contains("privateIp"));
        assert!(!json.contains("publicIp"));
        assert!(!json.contains("unhealthySince"));
        assert!(json.contains("CreatingServer"));
    }

    #[test]
    fn test_group_accessor_by_role() {
        let mut status = ManagedClusterStatus::default();
        status.control_planes.desired = 3;
        status.workers.desired = 2;
        assert_eq!(status.group(NodeRole::ControlPlane).desired, 3);
        assert_eq!(status.group(NodeRole::Worker).desired, 2);
        status.group_mut(NodeRole::Worker).desired = 5;
        assert_eq!(status.workers.desired, 5);
    }

    #[test]
    fn test_ssh_keys_annotation_split_and_trimmed() {
        let cluster = cluster_with_annotations(&[(ANNOTATION_SSH_KEYS, "ops-key, backup-key ,")]);
        assert_eq!(
            cluster.ssh_keys_annotation(),
            Some(vec!["ops-key".to_string(), "backup-key".to_string()])
        );
    }

    #[test]
    fn test_ssh_keys_annotation_missing_or_blank() {
        let cluster = cluster_with_annotations(&[]);
        assert_eq!(cluster.ssh_keys_annotation(), None);

        let blank = cluster_with_annotations(&[(ANNOTATION_SSH_KEYS, "  , ")]);
        assert_eq!(blank.ssh_keys_annotation(), None);
    }

    #[test]
    fn test_control_plane_endpoint_annotation() {
        let cluster =
            cluster_with_annotations(&[(ANNOTATION_CONTROL_PLANE_ENDPOINT, " 10.0.0.10 ")]);
        assert_eq!(
            cluster.control_plane_endpoint_annotation().as_deref(),
            Some("10.0.0.10")
        );

        let none = cluster_with_annotations(&[("other/annotation", "x")]);
        assert_eq!(none.control_plane_endpoint_annotation(), None);
    }

    #[test]
    fn test_unrecognized_annotations_ignored() {
        let cluster = cluster_with_annotations(&[
            ("example.com/unrelated", "value"),
            (ANNOTATION_SSH_KEYS, "only-key"),
        ]);
        assert_eq!(cluster.ssh_keys_annotation(), Some(vec!["only-key".to_string()]));
    }
}
