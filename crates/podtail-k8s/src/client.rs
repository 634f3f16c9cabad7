use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use podtail_types::{LogLine, PodRecord};

use crate::error::ClusterError;
use crate::event::PodWatchEvent;

pub type PodEventStream = BoxStream<'static, Result<PodWatchEvent, ClusterError>>;
pub type LogStream = BoxStream<'static, Result<LogLine, ClusterError>>;

/// Read-only view of the cluster consumed by the engine.
///
/// One implementation talks to a real API server; tests script their
/// own. All methods take `namespace: None` to mean cluster-wide.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Full pod listing plus the resource version to watch from.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
    ) -> Result<(Vec<PodRecord>, String), ClusterError>;

    /// Incremental change events from the given resource version.
    ///
    /// The stream yields `Err(ClusterError::Gone)` when the cursor has
    /// expired server-side; the caller must relist, not resume.
    async fn watch_pods(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> Result<PodEventStream, ClusterError>;

    /// Follow one container's log output, optionally from a point in
    /// time (used to resume after a dropped stream).
    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogStream, ClusterError>;
}
