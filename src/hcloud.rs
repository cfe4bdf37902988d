use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cloud::{CloudFactory, CloudProvider, CloudServer, CreateServerRequest};
use crate::error::Error;

const API_BASE: &str = "https://api.hetzner.cloud/v1";

/// Thin Hetzner Cloud REST adapter behind the `CloudProvider` trait.
///
/// Only the calls the engine needs are implemented; every response is
/// reduced to the trait's provider-neutral types at the boundary.
pub struct HcloudClient {
    http: reqwest::Client,
    base: String,
}

/* ============================= WIRE TYPES ============================= */

#[derive(Deserialize)]
struct ServersEnvelope {
    servers: Vec<ApiServer>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ApiServer,
}

#[derive(Deserialize)]
struct ApiServer {
    id: i64,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    public_net: Option<ApiPublicNet>,
    #[serde(default)]
    private_net: Vec<ApiPrivateNet>,
}

#[derive(Deserialize)]
struct ApiPublicNet {
    ipv4: Option<ApiIpv4>,
}

#[derive(Deserialize)]
struct ApiIpv4 {
    ip: String,
}

#[derive(Deserialize)]
struct ApiPrivateNet {
    ip: String,
}

#[derive(Deserialize)]
struct SshKeysEnvelope {
    ssh_keys: Vec<ApiSshKey>,
}

#[derive(Deserialize)]
struct SshKeyEnvelope {
    ssh_key: ApiSshKey,
}

#[derive(Deserialize)]
struct ApiSshKey {
    id: i64,
}

#[derive(Deserialize)]
struct NetworksEnvelope {
    networks: Vec<ApiNetwork>,
}

#[derive(Deserialize)]
struct ApiNetwork {
    id: i64,
}

#[derive(Deserialize)]
struct ImagesEnvelope {
    images: Vec<ApiImage>,
}

#[derive(Deserialize)]
struct ApiImage {
    id: i64,
    #[serde(default)]
    created: String,
}

impl From<ApiServer> for CloudServer {
    fn from(s: ApiServer) -> Self {
        CloudServer {
            id: s.id,
            name: s.name,
            status: s.status,
            public_ip: s
                .public_net
                .and_then(|net| net.ipv4)
                .map(|v4| v4.ip)
                .unwrap_or_default(),
            private_ips: s.private_net.into_iter().map(|net| net.ip).collect(),
        }
    }
}

/* ============================= CLIENT ============================= */

impl HcloudClient {
    pub fn new(token: &str) -> Result<Self, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::cloud("Authenticate", "API token contains invalid characters"))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::cloud("Authenticate", e.to_string()))?;

        Ok(Self { http, base: API_BASE.to_string() })
    }

    /// Factory suitable for `ReconcilerBuilder::cloud_factory`.
    pub fn factory() -> CloudFactory {
        Arc::new(|token| Ok(Arc::new(HcloudClient::new(token)?) as Arc<dyn CloudProvider>))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Error> {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .query(query)
            .send()
            .await
            .map_err(|e| Error::cloud(operation, e.to_string()))?;
        Self::decode(operation, response).await
    }

    async fn decode<T: DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T, Error> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::cloud(operation, format!("{status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::cloud(operation, e.to_string()))
    }

    async fn server_by_name(&self, name: &str) -> Result<Option<ApiServer>, Error> {
        let envelope: ServersEnvelope = self
            .get_json("GetServerByName", "/servers", &[("name", name)])
            .await?;
        Ok(envelope.servers.into_iter().find(|s| s.name == name))
    }

    async fn ssh_key_id(&self, name: &str) -> Result<Option<i64>, Error> {
        let envelope: SshKeysEnvelope = self
            .get_json("GetSSHKey", "/ssh_keys", &[("name", name)])
            .await?;
        Ok(envelope.ssh_keys.first().map(|k| k.id))
    }
}

#[async_trait]
impl CloudProvider for HcloudClient {
    async fn create_server(&self, req: &CreateServerRequest) -> Result<i64, Error> {
        let mut body = serde_json::json!({
            "name": req.name,
            "server_type": req.server_type,
            "image": req.image,
            "location": req.location,
            "ssh_keys": req.ssh_keys,
            "labels": req.labels,
            "user_data": req.user_data,
            "public_net": {
                "enable_ipv4": req.enable_public_v4,
                "enable_ipv6": req.enable_public_v6,
            },
        });
        if req.network_id != 0 {
            body["networks"] = serde_json::json!([req.network_id]);
        }
        if let Some(ip) = req.private_ip.as_deref() {
            body["networks"] = serde_json::json!([req.network_id]);
            body["private_net"] = serde_json::json!([{"network": req.network_id, "ip": ip}]);
        }
        if let Some(pg) = req.placement_group.as_deref() {
            body["placement_group"] = serde_json::json!(pg);
        }

        let response = self
            .http
            .post(format!("{}/servers", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::cloud("CreateServer", e.to_string()))?;
        let envelope: ServerEnvelope = Self::decode("CreateServer", response).await?;
        debug!(server = %req.name, id = envelope.server.id, "cloud_server_created");
        Ok(envelope.server.id)
    }

    async fn delete_server(&self, name: &str) -> Result<(), Error> {
        let Some(server) = self.server_by_name(name).await? else {
            debug!(server = name, "cloud_server_already_absent");
            return Ok(());
        };
        let response = self
            .http
            .delete(format!("{}/servers/{}", self.base, server.id))
            .send()
            .await
            .map_err(|e| Error::cloud("DeleteServer", e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::cloud("DeleteServer", format!("{status}: {body}")));
        }
        Ok(())
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<CloudServer>, Error> {
        Ok(self.server_by_name(name).await?.map(CloudServer::from))
    }

    async fn get_server_ip(&self, name: &str) -> Result<Option<String>, Error> {
        let server = self.server_by_name(name).await?;
        Ok(server
            .and_then(|s| s.public_net)
            .and_then(|net| net.ipv4)
            .map(|v4| v4.ip)
            .filter(|ip| !ip.is_empty()))
    }

    async fn get_server_id(&self, name: &str) -> Result<Option<i64>, Error> {
        Ok(self.server_by_name(name).await?.map(|s| s.id))
    }

    async fn get_servers_by_label(&self, selector: &str) -> Result<Vec<CloudServer>, Error> {
        let envelope: ServersEnvelope = self
            .get_json("GetServersByLabel", "/servers", &[("label_selector", selector)])
            .await?;
        Ok(envelope.servers.into_iter().map(CloudServer::from).collect())
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64, Error> {
        let body = serde_json::json!({
            "name": name,
            "public_key": public_key,
            "labels": labels,
        });
        let response = self
            .http
            .post(format!("{}/ssh_keys", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::cloud("CreateSSHKey", e.to_string()))?;
        let envelope: SshKeyEnvelope = Self::decode("CreateSSHKey", response).await?;
        Ok(envelope.ssh_key.id)
    }

    async fn delete_ssh_key(&self, name: &str) -> Result<(), Error> {
        let Some(id) = self.ssh_key_id(name).await? else {
            return Ok(());
        };
        let response = self
            .http
            .delete(format!("{}/ssh_keys/{id}", self.base))
            .send()
            .await
            .map_err(|e| Error::cloud("DeleteSSHKey", e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status();
            return Err(Error::cloud("DeleteSSHKey", status.to_string()));
        }
        Ok(())
    }

    async fn get_network(&self, name: &str) -> Result<Option<i64>, Error> {
        let envelope: NetworksEnvelope = self
            .get_json("GetNetwork", "/networks", &[("name", name)])
            .await?;
        Ok(envelope.networks.first().map(|n| n.id))
    }

    async fn get_snapshot_by_labels(&self, selector: &str) -> Result<Option<i64>, Error> {
        let envelope: ImagesEnvelope = self
            .get_json(
                "GetSnapshotByLabels",
                "/images",
                &[("type", "snapshot"), ("label_selector", selector)],
            )
            .await?;
        let mut images = envelope.images;
        images.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(images.first().map(|img| img.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_server_maps_to_cloud_server() {
        let json = r#"{
            "id": 42,
            "name": "demo-cp-ab1cd",
            "status": "running",
            "public_net": {"ipv4": {"ip": "192.0.2.7"}},
            "private_net": [{"ip": "10.0.0.7"}]
        }"#;
        let api: ApiServer = serde_json::from_str(json).unwrap();
        let server = CloudServer::from(api);
        assert_eq!(server.id, 42);
        assert_eq!(server.status, "running");
        assert_eq!(server.public_ip, "192.0.2.7");
        assert_eq!(server.first_private_ip(), "10.0.0.7");
    }

    #[test]
    fn test_api_server_without_public_net() {
        let json = r#"{"id": 7, "name": "demo-w-xyz12", "status": "starting"}"#;
        let api: ApiServer = serde_json::from_str(json).unwrap();
        let server = CloudServer::from(api);
        assert_eq!(server.public_ip, "");
        assert!(server.private_ips.is_empty());
    }

    #[test]
    fn test_servers_envelope_parses() {
        let json = r#"{"servers": [{"id": 1, "name": "a", "status": "off"}]}"#;
        let envelope: ServersEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.servers.len(), 1);
    }

    #[test]
    fn test_snapshot_ordering_picks_newest() {
        let mut images = vec![
            ApiImage { id: 1, created: "2026-01-01T00:00:00Z".to_string() },
            ApiImage { id: 2, created: "2026-03-01T00:00:00Z".to_string() },
            ApiImage { id: 3, created: "2026-02-01T00:00:00Z".to_string() },
        ];
        images.sort_by(|a, b| b.created.cmp(&a.created));
        assert_eq!(images.first().map(|i| i.id), Some(2));
    }

    #[test]
    fn test_factory_builds_client() {
        let factory = HcloudClient::factory();
        assert!(factory("test-token").is_ok());
    }
}
