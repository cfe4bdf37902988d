use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod, Secret};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use mockall::automock;
use tracing::{debug, warn};

use crate::crd::ManagedCluster;
use crate::error::Error;

/// Field manager used for every write this operator performs.
pub const FIELD_MANAGER: &str = "talzner-operator";

/* ============================= EVENT REASONS ============================= */

pub const REASON_PAUSED: &str = "Paused";
pub const REASON_SCALING_UP: &str = "ScalingUp";
pub const REASON_SCALING_DOWN: &str = "ScalingDown";
pub const REASON_NODE_REPLACING: &str = "NodeReplacing";
pub const REASON_NODE_REPLACED: &str = "NodeReplaced";
pub const REASON_QUORUM_LOST: &str = "QuorumLost";
pub const REASON_SERVER_CREATION_ERROR: &str = "ServerCreationError";
pub const REASON_CONFIG_APPLY_ERROR: &str = "ConfigApplyError";
pub const REASON_NODE_READY_TIMEOUT: &str = "NodeReadyTimeout";

/* ============================= CAPABILITY TRAIT ============================= */

/// Narrow capability set the engine needs from the Kubernetes API: custom
/// resource reads, status-subresource writes, node inspection and eviction,
/// secret reads and event publication.
#[automock]
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedCluster>, Error>;

    /// Replaces the status subresource; conflicts surface as `kube::Error`
    /// with code 409 so the persist path can retry.
    async fn replace_cluster_status(
        &self,
        cluster: &ManagedCluster,
    ) -> Result<ManagedCluster, Error>;

    /// Strips the operator finalizer list entry, or adds it.
    async fn set_finalizers(
        &self,
        cluster: &ManagedCluster,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    async fn cordon_node(&self, name: &str) -> Result<(), Error>;

    /// Evicts every evictable pod on the node. Daemonset-owned and mirror
    /// pods are skipped; individual eviction failures are logged, not fatal.
    async fn evict_node_pods(&self, node_name: &str) -> Result<(), Error>;

    /// Deleting an absent node is not an error.
    async fn delete_node(&self, name: &str) -> Result<(), Error>;

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, Error>;

    async fn publish_event(
        &self,
        cluster: &ManagedCluster,
        reason: &str,
        note: &str,
        warning: bool,
    ) -> Result<(), Error>;
}

/* ============================= CLIENT IMPLEMENTATION ============================= */

/// Production implementation backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    reporter: Reporter,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    fn clusters(&self, namespace: &str) -> Api<ManagedCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn object_reference(cluster: &ManagedCluster) -> ObjectReference {
        ObjectReference {
            api_version: Some("talzner.dev/v1alpha1".to_string()),
            kind: Some("ManagedCluster".to_string()),
            name: cluster.metadata.name.clone(),
            namespace: cluster.metadata.namespace.clone(),
            uid: cluster.metadata.uid.clone(),
            ..Default::default()
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedCluster>, Error> {
        Ok(self.clusters(namespace).get_opt(name).await?)
    }

    async fn replace_cluster_status(
        &self,
        cluster: &ManagedCluster,
    ) -> Result<ManagedCluster, Error> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or_default();
        let name = cluster.name_any();
        let data = serde_json::to_vec(cluster)?;
        Ok(self
            .clusters(namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }

    async fn set_finalizers(
        &self,
        cluster: &ManagedCluster,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or_default();
        let name = cluster.name_any();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.clusters(namespace)
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(name).await?)
    }

    async fn cordon_node(&self, name: &str) -> Result<(), Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({"spec": {"unschedulable": true}});
        match nodes
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn evict_node_pods(&self, node_name: &str) -> Result<(), Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let on_node = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
            .await?;

        for pod in on_node.items {
            let owned_by_daemonset = pod
                .metadata
                .owner_references
                .as_ref()
                .is_some_and(|owners| owners.iter().any(|o| o.kind == "DaemonSet"));
            let mirror = pod
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"));
            if owned_by_daemonset || mirror {
                continue;
            }

            let pod_name = pod.name_any();
            let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
            let namespaced: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            if let Err(e) = namespaced.evict(&pod_name, &EvictParams::default()).await {
                warn!(pod = %pod_name, namespace, error = %e, "pod_eviction_failed");
            } else {
                debug!(pod = %pod_name, namespace, node = node_name, "pod_evicted");
            }
        }
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = secrets.get_opt(name).await? else {
            return Ok(None);
        };
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(value)
    }

    async fn publish_event(
        &self,
        cluster: &ManagedCluster,
        reason: &str,
        note: &str,
        warning: bool,
    ) -> Result<(), Error> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            Self::object_reference(cluster),
        );
        recorder
            .publish(Event {
                type_: if warning { EventType::Warning } else { EventType::Normal },
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}
