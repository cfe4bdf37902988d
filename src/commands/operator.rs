use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use talzner::config::OperatorConfig;
use talzner::crd::ManagedCluster;
use talzner::error::Error;
use talzner::hcloud::HcloudClient;
use talzner::kube_api::KubeClient;
use talzner::metrics::ControllerMetrics;
use talzner::reconcile::Reconciler;
use talzner::talosctl::TalosctlClient;

/* ============================= STATE ============================= */

pub(crate) struct OperatorState {
    pub(crate) ready: bool,
    pub(crate) metrics: Option<Arc<ControllerMetrics>>,
}

struct OperatorContext {
    reconciler: Reconciler,
    error_requeue: std::time::Duration,
}

/* ============================= ENTRY ============================= */

pub async fn run(no_metrics: bool, listen: &str) -> Result<()> {
    println!("Starting ManagedCluster operator...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    // Verify actual cluster connectivity before starting the controller
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let talos = TalosctlClient::from_env();
    print!("  Talos credentials ........... ");
    if talzner::talos::TalosApi::has_credentials(&talos) {
        println!("OK");
    } else {
        println!("none (workers will wait for a later reconcile)");
    }

    let mut cfg = OperatorConfig::default();
    cfg.enable_metrics = !no_metrics;

    let metrics = cfg.enable_metrics.then(|| Arc::new(ControllerMetrics::new()));

    let mut builder = Reconciler::builder()
        .kube(Arc::new(KubeClient::new(client.clone())))
        .talos(Arc::new(talos))
        .cloud_factory(HcloudClient::factory())
        .config(cfg.clone());
    if let Some(m) = metrics.as_ref() {
        builder = builder.metrics(m.clone());
    }
    let reconciler = builder.build().context("assembling reconciler")?;

    let addr: SocketAddr = listen.parse().context("parsing listen address")?;

    println!("  CRD watch ................... ManagedCluster.talzner.dev/v1alpha1");
    println!(
        "  Requeue interval ............ {}s",
        cfg.default_requeue_after.as_secs()
    );
    println!("  Metrics server .............. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!(
        "    GET /readyz ............... Readiness probe (503 until first reconcile, then 200)"
    );
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_controller_started");

    let state = Arc::new(Mutex::new(OperatorState { ready: false, metrics: metrics.clone() }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { start_http_server(http_state, http_shutdown, addr).await });

    let ctx = Arc::new(OperatorContext {
        reconciler,
        error_requeue: cfg.error_requeue_after,
    });

    let clusters: Api<ManagedCluster> = Api::all(client.clone());

    let controller_state = state.clone();
    let controller = Controller::new(clusters, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                // Mark ready after first reconcile dispatch
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                match result {
                    Ok((obj, _action)) => {
                        info!(cluster = %obj.name, "reconcile_dispatched");
                    }
                    Err(e) => {
                        warn!(error = %e, "reconcile_dispatch_error");
                    }
                }
            }
        });

    // Use select! so Ctrl+C drops (cancels) the controller stream.
    // The kube Controller has no built-in shutdown hook, so dropping
    // the future is the only way to stop it cleanly.
    tokio::select! {
        _ = controller => {
            info!("operator_controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    // Signal the HTTP server to shut down
    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("operator_stopped");
    println!("Operator stopped.");

    Ok(())
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    cluster: Arc<ManagedCluster>,
    ctx: Arc<OperatorContext>,
) -> std::result::Result<Action, Error> {
    let name = cluster.name_any();
    info!(cluster = %name, "reconcile_start");

    let outcome = ctx.reconciler.reconcile(&cluster).await?;

    Ok(match outcome.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(
    cluster: Arc<ManagedCluster>,
    error: &Error,
    ctx: Arc<OperatorContext>,
) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "reconcile_error");
    Action::requeue(ctx.error_requeue)
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_operator_router(state: Arc<Mutex<OperatorState>>) -> Router {
    Router::new()
        .route(
            "/metrics",
            get({
                let state = state.clone();
                move || operator_metrics_handler(state.clone())
            }),
        )
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || operator_ready_handler(state.clone())
            }),
        )
}

async fn start_http_server(
    state: Arc<Mutex<OperatorState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_operator_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {addr}"))?;

    info!(addr = %addr, "operator_http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn operator_ready_handler(state: Arc<Mutex<OperatorState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn operator_metrics_handler(state: Arc<Mutex<OperatorState>>) -> impl IntoResponse {
    let metrics = {
        let state = state.lock().await;
        state.metrics.clone()
    };
    let Some(metrics) = metrics else {
        return (StatusCode::OK, String::new());
    };

    let encoder = TextEncoder::new();
    let metric_families = metrics.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
