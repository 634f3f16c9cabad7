//! Shared types for podtail
//!
//! This crate contains data structures used across multiple podtail crates.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Pod Identity & Records
// ============================================================================

/// Pod identity. The uid disambiguates a pod replaced under the same name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl PodId {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for PodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of a pod as the registry knows it.
///
/// Owned by the registry; mutated only by watch-event application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub containers: Vec<ContainerRef>,
    pub phase: PodPhase,
    pub restart_count: i32,
    pub resource_version: String,
    pub last_seen: DateTime<Utc>,
}

impl PodRecord {
    pub fn id(&self) -> PodId {
        PodId::new(
            self.namespace.clone(),
            self.name.clone(),
            self.uid.clone(),
        )
    }

    pub fn container_names(&self) -> impl Iterator<Item = &str> {
        self.containers.iter().map(|c| c.name.as_str())
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.iter().any(|c| c.name == name)
    }
}

/// Weak reference to a container inside its owning pod record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub name: String,
    pub pod_uid: String,
}

impl ContainerRef {
    pub fn new(name: impl Into<String>, pod_uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pod_uid: pod_uid.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Registry Events
// ============================================================================

/// Domain events published by the registry as it applies watch events.
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    PodAdded(PodRecord),
    PodUpdated(PodRecord),
    PodRemoved(PodId),
    ContainerAdded { pod: PodRecord, container: String },
    ContainerRemoved { pod: PodId, container: String },
}

impl RegistryEvent {
    /// Namespace the event applies to, used for cache invalidation.
    pub fn namespace(&self) -> &str {
        match self {
            Self::PodAdded(p) | Self::PodUpdated(p) => &p.namespace,
            Self::PodRemoved(id) => &id.namespace,
            Self::ContainerAdded { pod, .. } => &pod.namespace,
            Self::ContainerRemoved { pod, .. } => &pod.namespace,
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

/// Stream identity = pod uid + container name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub pod_uid: String,
    pub container: String,
}

impl StreamKey {
    pub fn new(pod_uid: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            pod_uid: pod_uid.into(),
            container: container.into(),
        }
    }
}

/// Lifecycle of a single tailing task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Queued, waiting for a concurrency slot.
    Pending,
    /// Opening the log stream against the API server.
    Connecting,
    /// Lines are flowing. The only state where output occurs.
    Streaming,
    /// Waiting out a retry delay after a stream error.
    Backoff,
    /// Terminal. Never restarted for the same (pod uid, container).
    Closed,
}

/// A single timestamped line as returned by the cluster client.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Aggregator output unit. Immutable once emitted; carries full
/// provenance so consumers can filter or re-sort downstream.
#[derive(Clone, Debug, Serialize)]
pub struct LogRecord {
    pub pod_uid: String,
    pub pod_name: String,
    pub namespace: String,
    pub container_name: String,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine tuning knobs. All fields have defaults so a partial TOML
/// file (or none at all) is valid.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Ceiling on simultaneously streaming (pod, container) pairs.
    pub max_concurrent_streams: usize,
    /// How long a cached pod-list snapshot may be served.
    pub cache_ttl_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Capacity of each subscription's output buffer; producers block
    /// when it is full.
    pub subscription_buffer: usize,
    /// Namespaces to watch. Empty means everything the credential can see.
    pub namespace_allowlist: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 50,
            cache_ttl_ms: 30_000,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            subscription_buffer: 1024,
            namespace_allowlist: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_phase_from_str() {
        assert_eq!(PodPhase::from("Running"), PodPhase::Running);
        assert_eq!(PodPhase::from("Evicted"), PodPhase::Unknown);
    }

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_streams, 50);
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert!(config.namespace_allowlist.is_empty());
    }

    #[test]
    fn registry_event_namespace() {
        let ev = RegistryEvent::PodRemoved(PodId::new("bizagi", "web-1", "u1"));
        assert_eq!(ev.namespace(), "bizagi");
    }
}
