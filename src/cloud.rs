use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;

use crate::error::Error;

/// Server status string reported while the machine is booting.
pub const SERVER_STATUS_STARTING: &str = "starting";

/// Server status string reported once the machine is up.
pub const SERVER_STATUS_RUNNING: &str = "running";

/// Parameters for a cloud server create call.
#[derive(Debug, Clone, Default)]
pub struct CreateServerRequest {
    pub name: String,
    /// Snapshot or image id the machine boots from.
    pub image: String,
    pub server_type: String,
    pub location: String,
    pub ssh_keys: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub user_data: String,
    pub placement_group: Option<String>,
    /// Private network to attach; zero means none.
    pub network_id: i64,
    pub private_ip: Option<String>,
    pub enable_public_v4: bool,
    pub enable_public_v6: bool,
}

/// Cloud-side view of a server.
#[derive(Debug, Clone, Default)]
pub struct CloudServer {
    pub id: i64,
    pub name: String,
    /// Raw provider status; anything other than `running`/`starting` is
    /// treated as "not yet up".
    pub status: String,
    pub public_ip: String,
    pub private_ips: Vec<String>,
}

impl CloudServer {
    pub fn first_private_ip(&self) -> String {
        self.private_ips.first().cloned().unwrap_or_default()
    }
}

/// Factory producing a cloud client from an API token, injected so tests
/// and alternative providers can plug in.
pub type CloudFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn CloudProvider>, Error> + Send + Sync>;

/// Narrow capability set the engine needs from the cloud provider.
///
/// The engine only ever talks to this trait; the Hetzner REST adapter in
/// `hcloud` is one implementation.
#[automock]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Issues the create call and returns the new server id.
    async fn create_server(&self, req: &CreateServerRequest) -> Result<i64, Error>;

    /// Deletes by name. Deleting an absent server is not an error.
    async fn delete_server(&self, name: &str) -> Result<(), Error>;

    async fn get_server_by_name(&self, name: &str) -> Result<Option<CloudServer>, Error>;

    /// Public IPv4 of the named server, once assigned.
    async fn get_server_ip(&self, name: &str) -> Result<Option<String>, Error>;

    async fn get_server_id(&self, name: &str) -> Result<Option<i64>, Error>;

    async fn get_servers_by_label(&self, selector: &str) -> Result<Vec<CloudServer>, Error>;

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64, Error>;

    async fn delete_ssh_key(&self, name: &str) -> Result<(), Error>;

    /// Private network id by name; `None` when the network does not exist.
    async fn get_network(&self, name: &str) -> Result<Option<i64>, Error>;

    /// Most recent snapshot matching the label selector.
    async fn get_snapshot_by_labels(&self, selector: &str) -> Result<Option<i64>, Error>;
}

/// True when the provider considers the server up or still booting.
pub fn server_is_up_or_starting(status: &str) -> bool {
    status == SERVER_STATUS_RUNNING || status == SERVER_STATUS_STARTING
}
