use thiserror::Error;

/// Failure modes of the cluster client, classified at the boundary so
/// callers can tell retryable transport trouble from fatal denials.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unauthorized: credential rejected by the API server")]
    Unauthorized,

    #[error("forbidden: no read access to namespace {namespace:?}")]
    Forbidden { namespace: Option<String> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("watch cursor expired at resource version {resource_version}")]
    Gone { resource_version: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    /// True for errors worth retrying with backoff. Denials are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub(crate) fn from_kube(err: kube::Error, namespace: Option<&str>) -> Self {
        match err {
            kube::Error::Api(resp) => Self::from_status(resp.code, resp.message, namespace),
            other => Self::Transport(other.to_string()),
        }
    }

    pub(crate) fn from_status(code: u16, message: String, namespace: Option<&str>) -> Self {
        match code {
            401 => Self::Unauthorized,
            403 => Self::Forbidden {
                namespace: namespace.map(str::to_string),
            },
            404 => Self::NotFound(message),
            410 => Self::Gone {
                // The server does not echo the expired cursor back; the
                // caller substitutes the one it watched from.
                resource_version: String::new(),
            },
            _ => Self::Transport(message),
        }
    }
}
