use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::crd::NodeRole;
use crate::error::Error;
use crate::state::ClusterState;
use crate::talos::{EtcdMember, TalosApi};

/// `TalosApi` implementation that drives the `talosctl` binary.
///
/// Machine-config generation and authenticated calls require a talosconfig;
/// without one only the insecure maintenance-mode probes work, which is the
/// bootstrap mode the worker driver understands.
pub struct TalosctlClient {
    talosconfig: Option<PathBuf>,
}

impl TalosctlClient {
    pub fn new(talosconfig: Option<PathBuf>) -> Self {
        Self { talosconfig }
    }

    /// Resolves the talosconfig from `TALOSCONFIG` or the conventional
    /// `~/.talos/config` location.
    pub fn from_env() -> Self {
        let explicit = std::env::var("TALOSCONFIG").ok().map(PathBuf::from);
        let conventional = std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".talos/config"))
            .filter(|p| p.exists());
        Self::new(explicit.or(conventional))
    }

    async fn run(&self, args: &[&str]) -> Result<String, Error> {
        let mut cmd = Command::new("talosctl");
        if let Some(cfg) = self.talosconfig.as_ref() {
            cmd.arg("--talosconfig").arg(cfg);
        }
        cmd.args(args);
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Talos(format!("failed to spawn talosctl: {e}")))?;
        if !output.status.success() {
            return Err(Error::Talos(format!(
                "talosctl {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_ok(&self, args: &[&str]) -> bool {
        self.run(args).await.is_ok()
    }
}

/// Parses the tabular `talosctl etcd members` output.
///
/// Columns: NODE, ID (hex), HOSTNAME, PEER URLS, CLIENT URLS, LEARNER.
fn parse_etcd_members(stdout: &str) -> Vec<EtcdMember> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let id = u64::from_str_radix(fields[1].trim_start_matches("0x"), 16).ok()?;
            Some(EtcdMember {
                id,
                name: fields[2].to_string(),
                peer_endpoint: fields[3].to_string(),
                is_leader: false,
            })
        })
        .collect()
}

#[async_trait]
impl TalosApi for TalosctlClient {
    fn has_credentials(&self) -> bool {
        self.talosconfig.is_some()
    }

    async fn generate_machine_config(
        &self,
        role: NodeRole,
        state: &ClusterState,
        extra_sans: &[String],
    ) -> Result<Vec<u8>, Error> {
        if state.control_plane_ip.is_empty() {
            return Err(Error::Talos(
                "cannot generate machine config without a control-plane endpoint".to_string(),
            ));
        }

        let output_dir = tempfile::tempdir()
            .map_err(|e| Error::Talos(format!("tempdir for gen config: {e}")))?;
        let endpoint = format!("https://{}:6443", state.control_plane_ip);
        let dir_arg = output_dir.path().to_string_lossy().into_owned();

        let mut sans: Vec<String> = state.sans.clone();
        for san in extra_sans {
            if !san.is_empty() && !sans.contains(san) {
                sans.push(san.clone());
            }
        }
        let sans_arg = sans.join(",");

        let mut args = vec![
            "gen",
            "config",
            state.name.as_str(),
            endpoint.as_str(),
            "--output",
            dir_arg.as_str(),
            "--with-docs=false",
            "--with-examples=false",
        ];
        if !sans_arg.is_empty() {
            args.push("--additional-sans");
            args.push(sans_arg.as_str());
        }
        self.run(&args).await?;

        let file = match role {
            NodeRole::ControlPlane => "controlplane.yaml",
            NodeRole::Worker => "worker.yaml",
        };
        tokio::fs::read(output_dir.path().join(file))
            .await
            .map_err(|e| Error::Talos(format!("reading generated {file}: {e}")))
    }

    async fn apply_config(&self, node_ip: &str, config: &[u8]) -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::Talos(format!("temp machine config: {e}")))?;
        std::io::Write::write_all(&mut file, config)
            .map_err(|e| Error::Talos(format!("writing machine config: {e}")))?;
        let path = file.path().to_string_lossy().into_owned();

        // Fresh machines serve the insecure maintenance API; machines that
        // already hold a config require the authenticated path.
        let insecure = self
            .run(&["apply-config", "--insecure", "--nodes", node_ip, "--file", path.as_str()])
            .await;
        match insecure {
            Ok(_) => Ok(()),
            Err(first) if self.has_credentials() => {
                debug!(node = node_ip, "insecure_apply_rejected_retrying_authenticated");
                self.run(&[
                    "apply-config",
                    "--nodes",
                    node_ip,
                    "--endpoints",
                    node_ip,
                    "--file",
                    path.as_str(),
                ])
                .await
                .map(|_| ())
                .map_err(|second| {
                    warn!(node = node_ip, error = %second, "authenticated_apply_failed");
                    first
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn is_node_in_maintenance_mode(&self, node_ip: &str) -> Result<bool, Error> {
        // The insecure API is only served while the machine waits for its
        // first config.
        Ok(self
            .run_ok(&["version", "--insecure", "--short", "--nodes", node_ip])
            .await)
    }

    async fn is_machine_configured(&self, node_ip: &str) -> Result<bool, Error> {
        Ok(self
            .run_ok(&["get", "machineconfig", "--nodes", node_ip, "--endpoints", node_ip])
            .await)
    }

    async fn is_kubelet_running(&self, node_ip: &str) -> Result<bool, Error> {
        let output = self
            .run(&["service", "kubelet", "--nodes", node_ip, "--endpoints", node_ip])
            .await?;
        Ok(output.contains("Running"))
    }

    async fn is_api_reachable(&self, node_ip: &str) -> Result<bool, Error> {
        let addr = format!("{node_ip}:50000");
        Ok(tokio::time::timeout(
            Duration::from_secs(5),
            tokio::net::TcpStream::connect(&addr),
        )
        .await
        .map(|conn| conn.is_ok())
        .unwrap_or(false))
    }

    async fn get_etcd_members(&self, node_ip: &str) -> Result<Vec<EtcdMember>, Error> {
        let output = self
            .run(&["etcd", "members", "--nodes", node_ip, "--endpoints", node_ip])
            .await?;
        Ok(parse_etcd_members(&output))
    }

    async fn remove_etcd_member(&self, node_ip: &str, member_id: u64) -> Result<(), Error> {
        let hex_id = format!("{member_id:x}");
        self.run(&[
            "etcd",
            "remove-member",
            hex_id.as_str(),
            "--nodes",
            node_ip,
            "--endpoints",
            node_ip,
        ])
        .await
        .map(|_| ())
    }

    async fn wait_for_node_ready(&self, node_ip: &str, timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_kubelet_running(node_ip).await.unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("kubelet on {node_ip}"),
                    timeout,
                });
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }
}
