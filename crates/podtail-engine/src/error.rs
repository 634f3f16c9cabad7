use podtail_k8s::ClusterError;
use thiserror::Error;

/// Engine-level failure taxonomy.
///
/// Per-stream and per-namespace trouble is contained to its unit; only
/// bootstrap failure (or shutdown before readiness) surfaces here as a
/// whole-engine condition.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Initial list failed; the engine stays not-ready and the caller
    /// retries with backoff.
    #[error("discovery failed: {0}")]
    Discovery(#[source] ClusterError),

    /// The credential cannot read this namespace. Fatal for the
    /// namespace, never retried.
    #[error("read access denied for namespace {namespace}")]
    Permission { namespace: String },

    /// The engine was shut down before it became ready.
    #[error("engine shut down before becoming ready")]
    ShutDown,
}
