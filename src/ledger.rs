use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::crd::{ManagedClusterStatus, NodePhase, NodeRole, NodeStatus};

/// Partial update applied to a node record. Unset fields, empty strings and
/// zero ids never overwrite stored values.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub server_id: Option<i64>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub phase: Option<NodePhase>,
    pub phase_reason: Option<String>,
}

impl NodePatch {
    pub fn phase(phase: NodePhase) -> Self {
        Self { phase: Some(phase), ..Default::default() }
    }

    pub fn phase_with_reason(phase: NodePhase, reason: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            phase_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Upserts a node record in the given group.
///
/// The transition timestamp is overwritten only when the phase actually
/// changes; `healthy` is recomputed as `phase == Ready` after every update.
pub fn update(status: &mut ManagedClusterStatus, role: NodeRole, name: &str, patch: NodePatch) {
    let group = status.group_mut(role);
    let now = Time(Utc::now());

    let Some(idx) = group.nodes.iter().position(|n| n.name == name) else {
        let mut node = NodeStatus {
            name: name.to_string(),
            phase: patch.phase.unwrap_or_default(),
            phase_transition_time: Some(now),
            ..Default::default()
        };
        apply_fields(&mut node, &patch);
        node.healthy = node.phase == NodePhase::Ready;
        group.nodes.push(node);
        return;
    };
    let node = &mut group.nodes[idx];

    if let Some(phase) = patch.phase
        && phase != node.phase
    {
        node.phase = phase;
        node.phase_transition_time = Some(now);
    }
    apply_fields(node, &patch);
    node.healthy = node.phase == NodePhase::Ready;
}

fn apply_fields(node: &mut NodeStatus, patch: &NodePatch) {
    if let Some(id) = patch.server_id
        && id != 0
    {
        node.server_id = id;
    }
    if let Some(ip) = patch.private_ip.as_deref()
        && !ip.is_empty()
    {
        node.private_ip = ip.to_string();
    }
    if let Some(ip) = patch.public_ip.as_deref()
        && !ip.is_empty()
    {
        node.public_ip = ip.to_string();
    }
    if let Some(reason) = patch.phase_reason.as_deref()
        && !reason.is_empty()
    {
        node.phase_reason = Some(reason.to_string());
    }
}

/// Whether a phase write from `current` to `proposed` is allowed.
///
/// Same-phase writes are no-ops; `Ready` and `Failed` are always reachable;
/// every other transition must move forward in rank. A variant without a
/// rank advances unconditionally.
pub fn should_advance(current: NodePhase, proposed: NodePhase) -> bool {
    if proposed == current {
        return false;
    }
    if matches!(proposed, NodePhase::Ready | NodePhase::Failed) {
        return true;
    }
    match (current.rank(), proposed.rank()) {
        (Some(cur), Some(next)) => next > cur,
        _ => true,
    }
}

/// Removes a node record from the group. Returns whether it existed.
pub fn remove(status: &mut ManagedClusterStatus, role: NodeRole, name: &str) -> bool {
    let group = status.group_mut(role);
    match group.nodes.iter().position(|n| n.name == name) {
        Some(idx) => {
            group.nodes.swap_remove(idx);
            true
        }
        None => false,
    }
}

/// Recomputes the ready/unhealthy counters of both groups from their node
/// records.
pub fn recount(status: &mut ManagedClusterStatus) {
    for role in [NodeRole::ControlPlane, NodeRole::Worker] {
        let group = status.group_mut(role);
        group.ready = group.nodes.iter().filter(|n| n.healthy).count() as i32;
        group.unhealthy = group
            .nodes
            .iter()
            .filter(|n| !n.healthy && n.unhealthy_since.is_some())
            .count() as i32;
    }
}
