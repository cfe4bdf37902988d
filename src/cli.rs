use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "talzner")]
#[command(about = "Talos cluster operator for Hetzner Cloud")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the ManagedCluster CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the ManagedCluster operator reconcile loop
    Operator {
        /// Disable the Prometheus metric set entirely
        #[arg(long)]
        no_metrics: bool,

        /// Listen address for /healthz, /readyz and /metrics
        #[arg(long, default_value = "0.0.0.0:9090")]
        listen: String,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}
