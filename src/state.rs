use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::cloud::CloudProvider;
use crate::crd::ManagedCluster;
use crate::error::Error;

/// Everything the provisioning driver needs to know about a cluster,
/// derived once per reconcile from spec, status, annotations and cloud
/// lookups.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub name: String,
    pub namespace: String,
    pub region: String,
    /// Private network id; zero when the network does not exist yet.
    pub network_id: i64,
    /// Subject alternative names baked into control-plane certs.
    pub sans: Vec<String>,
    /// Resolved control-plane endpoint; empty while nothing is reachable.
    pub control_plane_ip: String,
    pub ssh_key_ids: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// SSH keys from the annotation, falling back to the conventional
/// `<cluster>-key`.
pub fn resolve_ssh_keys(cluster: &ManagedCluster) -> Vec<String> {
    cluster
        .ssh_keys_annotation()
        .unwrap_or_else(|| vec![format!("{}-key", cluster.name_any())])
}

/// Control-plane endpoint precedence: persisted endpoint, load-balancer IP,
/// pinned annotation, then the first healthy control plane with a private
/// address. Empty when none of those exist.
pub fn resolve_control_plane_ip(cluster: &ManagedCluster) -> String {
    if let Some(status) = cluster.status.as_ref() {
        if let Some(endpoint) = status.control_plane_endpoint.as_deref()
            && !endpoint.is_empty()
        {
            return endpoint.to_string();
        }
        if let Some(lb_ip) = status
            .infrastructure
            .as_ref()
            .and_then(|infra| infra.load_balancer_ip.as_deref())
            && !lb_ip.is_empty()
        {
            return lb_ip.to_string();
        }
    }

    if let Some(endpoint) = cluster.control_plane_endpoint_annotation() {
        return endpoint;
    }

    cluster
        .status
        .as_ref()
        .and_then(|status| {
            status
                .control_planes
                .nodes
                .iter()
                .find(|n| n.healthy && !n.private_ip.is_empty())
        })
        .map(|n| n.private_ip.clone())
        .unwrap_or_default()
}

/// SANs for control-plane certs: the resolved endpoint first, then every
/// control-plane node's private and public address in list order.
pub fn build_cluster_sans(cluster: &ManagedCluster) -> Vec<String> {
    let mut sans = Vec::new();
    let mut push = |value: &str, sans: &mut Vec<String>| {
        if !value.is_empty() && !sans.iter().any(|s| s == value) {
            sans.push(value.to_string());
        }
    };

    let endpoint = resolve_control_plane_ip(cluster);
    push(&endpoint, &mut sans);

    if let Some(status) = cluster.status.as_ref() {
        for node in &status.control_planes.nodes {
            push(&node.private_ip, &mut sans);
            push(&node.public_ip, &mut sans);
        }
    }
    sans
}

/// Private network id: the status cache wins, else the cloud is asked for
/// `<cluster>-network`. A missing network resolves to zero; the caller
/// decides whether that is acceptable.
pub async fn resolve_network_id(
    cluster: &ManagedCluster,
    cloud: &dyn CloudProvider,
) -> Result<i64, Error> {
    if let Some(cached) = cluster
        .status
        .as_ref()
        .and_then(|s| s.infrastructure.as_ref())
        .map(|infra| infra.network_id)
        && cached != 0
    {
        return Ok(cached);
    }

    let name = format!("{}-network", cluster.name_any());
    Ok(cloud.get_network(&name).await?.unwrap_or(0))
}

/// Assembles the full `ClusterState` for one reconcile.
pub async fn build_cluster_state(
    cluster: &ManagedCluster,
    cloud: &dyn CloudProvider,
) -> Result<ClusterState, Error> {
    let name = cluster.name_any();
    let mut labels = BTreeMap::new();
    labels.insert("cluster".to_string(), name.clone());
    labels.insert("managed-by".to_string(), "talzner".to_string());

    Ok(ClusterState {
        namespace: cluster.metadata.namespace.clone().unwrap_or_default(),
        region: cluster.spec.region.clone(),
        network_id: resolve_network_id(cluster, cloud).await?,
        sans: build_cluster_sans(cluster),
        control_plane_ip: resolve_control_plane_ip(cluster),
        ssh_key_ids: resolve_ssh_keys(cluster),
        labels,
        name,
    })
}
