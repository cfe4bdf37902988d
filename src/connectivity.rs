use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::debug;

use crate::crd::ConnectivityStatus;
use crate::reconcile::{ReconcileJob, Reconciler};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const API_SERVER_PORT: u16 = 6443;

/// Resolves the domain and issues an HTTPS GET against the API server's
/// version endpoint behind it.
async fn probe_domain(domain: &str) -> (bool, String) {
    probe_endpoint(domain, API_SERVER_PORT).await
}

async fn probe_endpoint(domain: &str, port: u16) -> (bool, String) {
    let target = format!("{domain}:{port}");
    let addrs = match tokio::net::lookup_host(target.as_str()).await {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(e) => return (false, format!("dns resolution failed: {e}")),
    };
    if addrs.is_empty() {
        return (false, "dns resolved no addresses".to_string());
    }

    // The apiserver presents a cluster-internal certificate; the probe
    // cares about liveness, not chain validation.
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => return (false, format!("building https client: {e}")),
    };

    let url = format!("https://{target}/version");
    match client.get(&url).send().await {
        Ok(response) => {
            // Anonymous probes usually get 401/403 here; any HTTP response
            // proves the endpoint terminates HTTPS and answers requests.
            let status = response.status();
            (true, format!("{url} answered {status}"))
        }
        Err(e) => (false, format!("https probe of {url} failed: {e}")),
    }
}

impl Reconciler {
    /// Optional endpoint probe, run only when a domain is configured.
    /// Failures update `status.connectivity` and nothing else.
    pub(crate) async fn probe_connectivity(&self, job: &ReconcileJob) {
        let domain = {
            let cluster = job.cluster.lock().await;
            cluster.spec.domain.clone()
        };
        let Some(domain) = domain else { return };

        let (reachable, message) = probe_domain(&domain).await;
        debug!(domain = %domain, reachable, %message, "connectivity_probe");

        let mut cluster = job.cluster.lock().await;
        let status = cluster.status.get_or_insert_with(Default::default);
        status.connectivity = Some(ConnectivityStatus {
            last_probe_time: Some(Time(Utc::now())),
            reachable,
            message: Some(message),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_unresolvable_domain_reports_failure() {
        let (reachable, message) = probe_endpoint("does-not-exist.invalid", API_SERVER_PORT).await;
        assert!(!reachable);
        assert!(message.contains("dns"));
    }

    #[tokio::test]
    async fn test_probe_requires_an_https_answer() {
        // A listener that drops every connection resolves fine but can
        // never complete the TLS handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral port binds");
        let port = listener.local_addr().expect("bound address").port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let (reachable, message) = probe_endpoint("localhost", port).await;
        assert!(!reachable, "a dropped connection must not count as reachable");
        assert!(message.contains("https probe"), "message: {message}");
    }
}
