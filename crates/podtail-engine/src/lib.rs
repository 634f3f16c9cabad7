//! Pod discovery and log streaming engine for podtail
//!
//! The engine keeps a live registry of pods across the namespaces the
//! credential may read, supervises one tailing task per observed
//! (pod, container), and merges all output into per-subscription
//! streams of attributed records. Discovery reads can be served from a
//! TTL-bounded snapshot cache; streaming never touches the cache.

mod aggregator;
mod backoff;
mod cache;
mod engine;
mod error;
mod registry;
mod streams;

pub use aggregator::Subscription;
pub use cache::{CacheRead, MemoryStore, PodCache, SnapshotStore};
pub use engine::LogEngine;
pub use error::EngineError;

// Re-export types used in our public API
pub use podtail_types::{EngineConfig, LogRecord, PodId, PodRecord, StreamState};
