use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use podtail_k8s::ClusterClient;
use podtail_types::{EngineConfig, PodRecord};

use crate::aggregator::{self, Subscription};
use crate::backoff::Backoff;
use crate::cache::{CacheRead, MemoryStore, PodCache, SnapshotStore};
use crate::error::EngineError;
use crate::registry::{PodRegistry, sleep_or_cancel};
use crate::streams::{WorkerParams, spawn_worker};

/// Facade over the registry, cache, stream manager and aggregator.
///
/// Shared by all consumers: discovery state and the stream slot pool
/// are global, while each `subscribe` call gets its own independent
/// selection of streams and output buffer.
pub struct LogEngine {
    client: Arc<dyn ClusterClient>,
    config: EngineConfig,
    registry: Arc<PodRegistry>,
    cache: Arc<PodCache>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    next_subscription: AtomicU64,
}

impl LogEngine {
    pub fn new(client: Arc<dyn ClusterClient>, config: EngineConfig) -> Self {
        Self::with_store(client, config, Arc::new(MemoryStore::default()))
    }

    /// Build with an explicit snapshot store (external deployments
    /// back this with a shared key/value service).
    pub fn with_store(
        client: Arc<dyn ClusterClient>,
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let registry = PodRegistry::new(Arc::clone(&client), &config);
        let cache = Arc::new(PodCache::new(store, config.cache_ttl()));
        let slots = Arc::new(Semaphore::new(config.max_concurrent_streams));

        Self {
            client,
            config,
            registry,
            cache,
            slots,
            shutdown: CancellationToken::new(),
            next_subscription: AtomicU64::new(0),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.registry.is_ready()
    }

    /// One bootstrap attempt: full list per scope. The engine is not
    /// ready until this succeeds once.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        self.registry.bootstrap().await
    }

    /// Spawn the watch loops and the cache invalidation task.
    pub fn start(&self) {
        Arc::clone(&self.registry).spawn(self.shutdown.child_token());

        let mut events = self.registry.subscribe();
        let cache = Arc::clone(&self.cache);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => cache.invalidate(Some(event.namespace())),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            // Missed events cover unknown namespaces.
                            cache.invalidate(None);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Bootstrap with backoff until ready, then start the watch loops.
    pub async fn run_until_ready(&self) -> Result<(), EngineError> {
        let mut backoff = Backoff::new(self.config.base_backoff(), self.config.max_backoff());
        loop {
            match self.bootstrap().await {
                Ok(()) => {
                    self.start();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "bootstrap failed, retrying");
                    if !sleep_or_cancel(backoff.next_delay(), &self.shutdown).await {
                        return Err(EngineError::ShutDown);
                    }
                }
            }
        }
    }

    /// Start tailing every container visible through the optional
    /// namespace filter, now and as the registry changes.
    pub fn subscribe(&self, namespace: Option<String>) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();
        let (sink, subscription) =
            aggregator::channel(id, self.config.subscription_buffer, cancel.clone());

        tracing::info!(subscription = id, namespace = ?namespace, "subscription opened");
        spawn_worker(WorkerParams {
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            slots: Arc::clone(&self.slots),
            sink,
            namespace,
            cancel,
            base_backoff: self.config.base_backoff(),
            max_backoff: self.config.max_backoff(),
        });

        subscription
    }

    /// Discovery read: cache first, registry on miss (repopulating the
    /// cache). Streaming never takes this path.
    pub fn list_known_pods(&self, namespace: Option<&str>) -> Result<Vec<PodRecord>, EngineError> {
        if let Some(ns) = namespace {
            if self.registry.is_denied(ns) {
                return Err(EngineError::Permission {
                    namespace: ns.to_string(),
                });
            }
        }

        match self.cache.get(namespace) {
            CacheRead::Hit(records) => Ok(records),
            CacheRead::Miss => {
                let records = self.registry.snapshot(namespace);
                self.cache
                    .put(namespace, records.clone(), self.registry.generation());
                Ok(records)
            }
        }
    }

    /// Cancel the watch loops and every stream task. Prompt and
    /// deterministic; no stream outlives the registry.
    pub fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.shutdown.cancel();
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
