use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client};

use talzner::crd::ManagedCluster;

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    let version = match client.apiserver_version().await {
        Ok(v) => {
            println!("OK (v{}.{})", v.major, v.minor);
            Some(v)
        }
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    // 3. List nodes permission
    print!("  List nodes permission ....... ");
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.list(&ListParams::default()).await {
        Ok(node_list) => println!("OK ({} nodes)", node_list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. ManagedCluster CRD installed
    print!("  ManagedCluster CRD .......... ");
    let clusters: Api<ManagedCluster> = Api::all(client.clone());
    match clusters.list(&ListParams::default().limit(1)).await {
        Ok(list) => println!("OK ({} clusters)", list.items.len()),
        Err(e) => println!("FAIL ({})\n  Hint:  Install it with: talzner crd install", e),
    }

    // 5. talosctl available
    print!("  talosctl .................... ");
    match tokio::process::Command::new("talosctl").arg("version").arg("--client").output().await {
        Ok(out) if out.status.success() => println!("OK"),
        Ok(_) => println!("FAIL (talosctl returned an error)"),
        Err(_) => println!("FAIL (talosctl not found in PATH)"),
    }

    if let Some(v) = version {
        println!("\n  Kubernetes version: {}.{}", v.major, v.minor);
    }

    println!("\nAll checks completed.");
    Ok(())
}
