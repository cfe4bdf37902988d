mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use common::{FakeCloud, FakeKube, FakeTalos, build_reconciler, make_cluster, make_k8s_node};
use talzner::crd::{NodePhase, NodeStatus};

// ══════════════════════════════════════════════════════════════════
// Scaler integration: the early-provisioning gate, create accounting,
// control-plane bring-up and partial-failure reporting.
// ══════════════════════════════════════════════════════════════════

fn record(name: &str, phase: NodePhase) -> NodeStatus {
    NodeStatus {
        name: name.to_string(),
        server_id: 6000,
        healthy: phase == NodePhase::Ready,
        phase,
        phase_transition_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_early_provisioning_gate_blocks_scale_up() {
    let mut cluster = make_cluster("demo", 0, 3);
    cluster
        .status
        .as_mut()
        .unwrap()
        .workers
        .nodes
        .push(record("demo-w-aaaaa", NodePhase::WaitingForIP));

    let kube = Arc::new(FakeKube::with_cluster(cluster.clone()));
    let talos = Arc::new(FakeTalos::default());
    // The in-flight machine exists and is still booting.
    let cloud = Arc::new(FakeCloud::default().with_server("demo-w-aaaaa", "starting"));
    let reconciler = build_reconciler(kube.clone(), talos, cloud.clone());

    let outcome = reconciler.reconcile(&cluster).await.expect("reconcile succeeds");

    assert!(
        cloud.calls_named("CreateServer").is_empty(),
        "no creates while a worker is in early provisioning"
    );
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_create_count_is_desired_minus_current() {
    let mut cluster = make_cluster("demo", 0, 5);
    {
        let status = cluster.status.as_mut().unwrap();
        status.workers.nodes.push(record("demo-w-aaaaa", NodePhase::Ready));
        status.workers.nodes.push(record("demo-w-bbbbb", NodePhase::Ready));
    }

    let kube = Arc::new(FakeKube {
        auto_ready_nodes: true,
        ..Default::default()
    });
    kube.store(cluster.clone());
    kube.add_node(make_k8s_node("demo-w-aaaaa", true));
    kube.add_node(make_k8s_node("demo-w-bbbbb", true));

    let talos = Arc::new(FakeTalos::default());
    let cloud = Arc::new(
        FakeCloud::default()
            .with_server("demo-w-aaaaa", "running")
            .with_server("demo-w-bbbbb", "running"),
    );
    let reconciler = build_reconciler(kube.clone(), talos, cloud.clone());

    reconciler.reconcile(&cluster).await.expect("reconcile succeeds");

    assert_eq!(cloud.calls_named("CreateServer").len(), 3);
}

#[tokio::test]
async fn test_control_plane_bring_up_configures_each_member() {
    let cluster = {
        let mut c = make_cluster("demo", 3, 0);
        // Endpoint pinned so config generation has something to chew on.
        c.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                "talzner.dev/control-plane-endpoint".to_string(),
                "203.0.113.10".to_string(),
            );
        c
    };

    let kube = Arc::new(FakeKube {
        auto_ready_nodes: true,
        ..Default::default()
    });
    kube.store(cluster.clone());

    let talos = Arc::new(FakeTalos::default());
    let cloud = Arc::new(FakeCloud::default());
    let reconciler = build_reconciler(kube.clone(), talos.clone(), cloud.clone());

    reconciler.reconcile(&cluster).await.expect("reconcile succeeds");

    let creates = cloud.calls_named("CreateServer");
    assert_eq!(creates.len(), 3);
    assert!(creates.iter().all(|n| n.starts_with("demo-cp-")));

    // Every provisioned member received a machine config.
    assert_eq!(talos.applied_configs.lock().unwrap().len(), 3);

    let status = kube.stored("demo").status.unwrap();
    assert_eq!(status.control_planes.nodes.len(), 3);
    assert!(
        status
            .control_planes
            .nodes
            .iter()
            .all(|n| n.phase == NodePhase::NodeInitializing)
    );
    assert!(kube.event_reasons().contains(&"ScalingUp".to_string()));
}

#[tokio::test]
async fn test_failed_creates_leave_failed_records_and_requeue() {
    let cluster = make_cluster("demo", 0, 2);

    let kube = Arc::new(FakeKube::with_cluster(cluster.clone()));
    let talos = Arc::new(FakeTalos::default());
    let cloud = Arc::new(FakeCloud { fail_create: true, ..Default::default() });
    let reconciler = build_reconciler(kube.clone(), talos, cloud.clone());

    let outcome = reconciler.reconcile(&cluster).await.expect("reconcile continues");

    assert_eq!(cloud.calls_named("CreateServer").len(), 2);
    assert!(kube.event_reasons().contains(&"ServerCreationError".to_string()));
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30)));

    let history = kube.status_history.lock().unwrap();
    let failed_seen = history
        .iter()
        .any(|s| s.workers.nodes.iter().any(|n| n.phase == NodePhase::Failed));
    assert!(failed_seen, "creation failures were persisted as Failed records");
}

#[tokio::test]
async fn test_failed_orphans_do_not_block_retry() {
    let cluster = make_cluster("demo", 0, 2);

    let kube = Arc::new(FakeKube {
        auto_ready_nodes: true,
        ..Default::default()
    });
    kube.store(cluster.clone());
    let talos = Arc::new(FakeTalos::default());
    let cloud = Arc::new(FakeCloud { fail_create: true, ..Default::default() });
    let reconciler = build_reconciler(kube.clone(), talos.clone(), cloud.clone());

    reconciler.reconcile(&cluster).await.expect("first reconcile");
    assert_eq!(cloud.calls_named("CreateServer").len(), 2);

    // The cloud recovers; the next reconcile retries from scratch.
    let healthy_cloud = Arc::new(FakeCloud::default());
    let reconciler = build_reconciler(kube.clone(), talos, healthy_cloud.clone());
    let stored = kube.stored("demo");
    reconciler.reconcile(&stored).await.expect("second reconcile");

    assert_eq!(healthy_cloud.calls_named("CreateServer").len(), 2);
    let status = kube.stored("demo").status.unwrap();
    assert_eq!(status.workers.nodes.len(), 2);
    assert!(
        status.workers.nodes.iter().all(|n| n.phase != NodePhase::Failed),
        "failed orphans were cleared before the retry"
    );
}
