use std::time::Duration;

/// Errors surfaced by the reconcile engine.
///
/// Transient external failures requeue with backoff; the two status-write
/// variants distinguish retry exhaustion from immediately fatal API errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("cloud api error during {operation}: {message}")]
    Cloud {
        operation: &'static str,
        message: String,
    },

    #[error("talos api error: {0}")]
    Talos(String),

    #[error("server creation failed for {name}: {message}")]
    ServerCreation { name: String, message: String },

    #[error("machine config rejected on {node}: {message}")]
    ConfigApply { node: String, message: String },

    #[error("node {name} did not become ready within {timeout:?}")]
    NodeReadyTimeout { name: String, timeout: Duration },

    #[error("timed out waiting for {what} after {timeout:?}")]
    Timeout { what: String, timeout: Duration },

    #[error("invalid cluster spec: {0}")]
    SpecInvalid(String),

    #[error("status update exhausted {attempts} conflict retries")]
    StatusWriteExhausted { attempts: u32 },

    #[error("status update failed: {source}")]
    StatusWriteFatal { source: kube::Error },

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    pub fn cloud(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Cloud { operation, message: message.into() }
    }

    /// Transient failures keep the current phase and requeue shortly.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube { source } => is_kube_transient(source),
            Error::Cloud { .. } | Error::Talos(_) => true,
            Error::Timeout { .. } | Error::NodeReadyTimeout { .. } => true,
            _ => false,
        }
    }
}

fn is_kube_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => response.code == 409 || response.code >= 500,
        _ => true,
    }
}
