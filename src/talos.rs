use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;

use crate::crd::NodeRole;
use crate::error::Error;
use crate::state::ClusterState;

/// One member of the etcd cluster as reported by a control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMember {
    pub id: u64,
    pub name: String,
    pub peer_endpoint: String,
    pub is_leader: bool,
}

/// Narrow capability set the engine needs from the Talos node agent.
///
/// `apply_config` is idempotent on identical input; everything else is a
/// read or a targeted etcd mutation. The `talosctl`-backed adapter in
/// `talosctl` is one implementation.
#[automock]
#[async_trait]
pub trait TalosApi: Send + Sync {
    /// Whether machine-config generation credentials are available. Without
    /// them worker provisioning parks nodes for a later reconcile.
    fn has_credentials(&self) -> bool;

    /// Renders a machine config for the role with the given subject
    /// alternative names.
    async fn generate_machine_config(
        &self,
        role: NodeRole,
        state: &ClusterState,
        extra_sans: &[String],
    ) -> Result<Vec<u8>, Error>;

    /// Commits a boot config to the node.
    async fn apply_config(&self, node_ip: &str, config: &[u8]) -> Result<(), Error>;

    async fn is_node_in_maintenance_mode(&self, node_ip: &str) -> Result<bool, Error>;

    /// True once a machine config has been committed.
    async fn is_machine_configured(&self, node_ip: &str) -> Result<bool, Error>;

    async fn is_kubelet_running(&self, node_ip: &str) -> Result<bool, Error>;

    /// TCP reachability of the Talos API on port 50000.
    async fn is_api_reachable(&self, node_ip: &str) -> Result<bool, Error>;

    async fn get_etcd_members(&self, node_ip: &str) -> Result<Vec<EtcdMember>, Error>;

    async fn remove_etcd_member(&self, node_ip: &str, member_id: u64) -> Result<(), Error>;

    /// Blocks until the node's kubelet reports ready or the timeout passes.
    async fn wait_for_node_ready(&self, node_ip: &str, timeout: Duration) -> Result<(), Error>;
}

/// Locates the etcd member backing a node, matching by member name first
/// and peer endpoint second.
pub fn find_member_for_node<'a>(
    members: &'a [EtcdMember],
    node_name: &str,
    node_ips: &[&str],
) -> Option<&'a EtcdMember> {
    members.iter().find(|m| {
        m.name == node_name
            || node_ips
                .iter()
                .any(|ip| !ip.is_empty() && m.peer_endpoint.contains(ip))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str, endpoint: &str) -> EtcdMember {
        EtcdMember {
            id,
            name: name.to_string(),
            peer_endpoint: endpoint.to_string(),
            is_leader: false,
        }
    }

    #[test]
    fn test_find_member_by_name() {
        let members = vec![
            member(1, "demo-cp-aaaaa", "https://10.0.0.2:2380"),
            member(2, "demo-cp-bbbbb", "https://10.0.0.3:2380"),
        ];
        let found = find_member_for_node(&members, "demo-cp-bbbbb", &[]);
        assert_eq!(found.map(|m| m.id), Some(2));
    }

    #[test]
    fn test_find_member_by_peer_endpoint() {
        let members = vec![
            member(1, "old-hostname", "https://10.0.0.2:2380"),
            member(2, "other-hostname", "https://10.0.0.3:2380"),
        ];
        let found = find_member_for_node(&members, "demo-cp-ccccc", &["10.0.0.3", ""]);
        assert_eq!(found.map(|m| m.id), Some(2));
    }

    #[test]
    fn test_find_member_ignores_empty_ips() {
        let members = vec![member(1, "x", "https://10.0.0.2:2380")];
        assert!(find_member_for_node(&members, "unrelated", &["", ""]).is_none());
    }

    #[test]
    fn test_find_member_absent() {
        let members = vec![member(1, "a", "https://10.0.0.2:2380")];
        assert!(find_member_for_node(&members, "b", &["10.9.9.9"]).is_none());
    }
}
