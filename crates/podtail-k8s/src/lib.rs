//! Kubernetes cluster client for podtail
//!
//! This crate defines the `ClusterClient` seam the engine is written
//! against, plus the kube-backed implementation used in production.
//! Watch payloads are decoded into typed events at this boundary;
//! nothing upstream branches on raw API objects.

mod client;
mod error;
mod event;
mod kube_client;

pub use client::{ClusterClient, LogStream, PodEventStream};
pub use error::ClusterError;
pub use event::PodWatchEvent;
pub use kube_client::KubeClusterClient;

// Re-export types that are used in our public API
pub use podtail_types::{ContainerRef, LogLine, PodId, PodPhase, PodRecord};
