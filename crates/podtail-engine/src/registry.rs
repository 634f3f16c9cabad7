use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use podtail_k8s::{ClusterClient, ClusterError, PodWatchEvent};
use podtail_types::{EngineConfig, PodId, PodRecord, RegistryEvent};

use crate::backoff::Backoff;
use crate::error::EngineError;

/// Watch scope: a single allowlisted namespace, or `None` for the
/// whole cluster. Each scope gets its own list/watch loop and
/// resource-version bookmark.
type Scope = Option<String>;

fn scope_key(scope: &Scope) -> String {
    scope.clone().unwrap_or_else(|| "*".to_string())
}

/// Authoritative, eventually-consistent mirror of pod existence.
///
/// Single-writer discipline: only a scope's watch task mutates entries
/// for its namespaces. Readers take cloned point-in-time snapshots.
pub struct PodRegistry {
    client: Arc<dyn ClusterClient>,
    pods: RwLock<HashMap<PodId, PodRecord>>,
    /// Namespaces the credential was refused. Never retried.
    denied: RwLock<HashSet<String>>,
    /// Resource-version bookmark per scope.
    cursors: RwLock<HashMap<String, String>>,
    /// Bumped on every applied event; versions cache snapshots.
    generation: AtomicU64,
    ready: AtomicBool,
    events: broadcast::Sender<RegistryEvent>,
    scopes: Vec<Scope>,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl PodRegistry {
    pub fn new(client: Arc<dyn ClusterClient>, config: &EngineConfig) -> Arc<Self> {
        let scopes = if config.namespace_allowlist.is_empty() {
            vec![None]
        } else {
            config
                .namespace_allowlist
                .iter()
                .cloned()
                .map(Some)
                .collect()
        };
        let (events, _) = broadcast::channel(256);

        Arc::new(Self {
            client,
            pods: RwLock::new(HashMap::new()),
            denied: RwLock::new(HashSet::new()),
            cursors: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            events,
            scopes,
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_denied(&self, namespace: &str) -> bool {
        self.denied.read().contains(namespace)
    }

    /// Point-in-time read, sorted for stable output. Also used to
    /// populate the cache layer.
    pub fn snapshot(&self, namespace: Option<&str>) -> Vec<PodRecord> {
        let pods = self.pods.read();
        let mut records: Vec<PodRecord> = pods
            .values()
            .filter(|p| namespace.is_none_or(|ns| p.namespace == ns))
            .cloned()
            .collect();
        drop(pods);
        records.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        records
    }

    /// Full list per scope. Must succeed (a denied namespace counts as
    /// resolved) before the registry is considered ready.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        for scope in &self.scopes {
            match self.relist(scope).await {
                Ok(()) => {}
                Err(ClusterError::Forbidden { .. }) => self.deny_scope(scope),
                Err(e) => return Err(EngineError::Discovery(e)),
            }
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Spawn one watch loop per scope. `bootstrap` must have run.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.scopes
            .iter()
            .map(|scope| {
                let registry = Arc::clone(&self);
                let scope = scope.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { registry.watch_scope(scope, cancel).await })
            })
            .collect()
    }

    async fn watch_scope(&self, scope: Scope, cancel: CancellationToken) {
        if self.is_scope_denied(&scope) {
            return;
        }
        let key = scope_key(&scope);
        let mut backoff = Backoff::new(self.base_backoff, self.max_backoff);

        'reconnect: loop {
            if cancel.is_cancelled() {
                return;
            }

            let cursor = self.cursors.read().get(&key).cloned().unwrap_or_default();
            let watch = tokio::select! {
                _ = cancel.cancelled() => return,
                w = self.client.watch_pods(scope.as_deref(), &cursor) => w,
            };

            let mut stream = match watch {
                Ok(stream) => stream,
                Err(e) => {
                    if !self.handle_watch_error(&scope, e, &mut backoff, &cancel).await {
                        return;
                    }
                    continue 'reconnect;
                }
            };

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(event)) => {
                        backoff.reset();
                        self.apply_event(&key, event);
                    }
                    Some(Err(e)) => {
                        if !self.handle_watch_error(&scope, e, &mut backoff, &cancel).await {
                            return;
                        }
                        continue 'reconnect;
                    }
                    None => {
                        // Server closed the watch; resume from the bookmark.
                        tracing::debug!(scope = %key, "watch ended, resuming");
                        if !sleep_or_cancel(backoff.next_delay(), &cancel).await {
                            return;
                        }
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    /// Returns false when the scope's watch must stop for good.
    async fn handle_watch_error(
        &self,
        scope: &Scope,
        err: ClusterError,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> bool {
        let key = scope_key(scope);
        match err {
            // Relist-on-Gone: the cursor expired server-side, so a
            // resume would silently lose events. Never skipped.
            ClusterError::Gone { resource_version } => {
                tracing::info!(scope = %key, resource_version, "watch cursor expired, relisting");
                loop {
                    match self.relist(scope).await {
                        Ok(()) => {
                            backoff.reset();
                            return true;
                        }
                        Err(ClusterError::Forbidden { .. }) => {
                            self.deny_scope(scope);
                            return false;
                        }
                        Err(e) => {
                            tracing::warn!(scope = %key, error = %e, "relist failed, backing off");
                            if !sleep_or_cancel(backoff.next_delay(), cancel).await {
                                return false;
                            }
                        }
                    }
                }
            }
            ClusterError::Forbidden { .. } => {
                self.deny_scope(scope);
                false
            }
            e => {
                tracing::warn!(scope = %key, error = %e, "watch error, backing off");
                sleep_or_cancel(backoff.next_delay(), cancel).await
            }
        }
    }

    /// Fresh full list for a scope: replaces the scope's entries,
    /// emitting the add/update/remove deltas implied by the diff, and
    /// advances the cursor. Pods that vanished while the watch was
    /// down fall out here.
    async fn relist(&self, scope: &Scope) -> Result<(), ClusterError> {
        let (records, resource_version) = self.client.list_pods(scope.as_deref()).await?;
        let key = scope_key(scope);

        let fresh: HashMap<PodId, PodRecord> =
            records.into_iter().map(|r| (r.id(), r)).collect();

        let stale: Vec<PodId> = {
            let pods = self.pods.read();
            pods.keys()
                .filter(|id| {
                    scope.as_deref().is_none_or(|ns| id.namespace == ns)
                        && !fresh.contains_key(id)
                })
                .cloned()
                .collect()
        };

        for id in stale {
            self.pods.write().remove(&id);
            self.publish(RegistryEvent::PodRemoved(id));
        }
        for (id, record) in fresh {
            let previous = self.pods.write().insert(id, record.clone());
            match previous {
                None => self.publish(RegistryEvent::PodAdded(record)),
                Some(old) => self.publish_update(old, record),
            }
        }

        self.cursors.write().insert(key, resource_version);
        Ok(())
    }

    fn apply_event(&self, key: &str, event: PodWatchEvent) {
        match event {
            PodWatchEvent::Added(record) => {
                self.bump_cursor(key, &record.resource_version);
                let previous = self.pods.write().insert(record.id(), record.clone());
                match previous {
                    None => self.publish(RegistryEvent::PodAdded(record)),
                    // Replays after a resume can re-deliver adds.
                    Some(old) => self.publish_update(old, record),
                }
            }
            PodWatchEvent::Modified(record) => {
                self.bump_cursor(key, &record.resource_version);
                let previous = self.pods.write().insert(record.id(), record.clone());
                match previous {
                    None => self.publish(RegistryEvent::PodAdded(record)),
                    Some(old) => self.publish_update(old, record),
                }
            }
            PodWatchEvent::Deleted(record) => {
                self.bump_cursor(key, &record.resource_version);
                let id = record.id();
                if self.pods.write().remove(&id).is_some() {
                    self.publish(RegistryEvent::PodRemoved(id));
                }
            }
            PodWatchEvent::Bookmark { resource_version } => {
                self.bump_cursor(key, &resource_version);
            }
        }
    }

    /// Emit update plus container-set deltas between two versions of a
    /// pod.
    fn publish_update(&self, old: PodRecord, new: PodRecord) {
        let added: Vec<String> = new
            .container_names()
            .filter(|c| !old.has_container(c))
            .map(str::to_string)
            .collect();
        let removed: Vec<String> = old
            .container_names()
            .filter(|c| !new.has_container(c))
            .map(str::to_string)
            .collect();

        self.publish(RegistryEvent::PodUpdated(new.clone()));
        for container in added {
            self.publish(RegistryEvent::ContainerAdded {
                pod: new.clone(),
                container,
            });
        }
        for container in removed {
            self.publish(RegistryEvent::ContainerRemoved {
                pod: new.id(),
                container,
            });
        }
    }

    fn publish(&self, event: RegistryEvent) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine; subscriptions come and go.
        let _ = self.events.send(event);
    }

    fn bump_cursor(&self, key: &str, resource_version: &str) {
        if !resource_version.is_empty() {
            self.cursors
                .write()
                .insert(key.to_string(), resource_version.to_string());
        }
    }

    fn is_scope_denied(&self, scope: &Scope) -> bool {
        scope.as_deref().is_some_and(|ns| self.is_denied(ns))
    }

    fn deny_scope(&self, scope: &Scope) {
        let Some(ns) = scope.as_deref() else {
            // A cluster-wide denial means the credential is unusable;
            // surface it loudly but keep other machinery alive.
            tracing::error!("cluster-wide pod read access denied");
            return;
        };
        tracing::warn!(namespace = %ns, "namespace access denied, dropping its pods");
        self.denied.write().insert(ns.to_string());

        let doomed: Vec<PodId> = {
            let pods = self.pods.read();
            pods.keys().filter(|id| id.namespace == ns).cloned().collect()
        };
        for id in doomed {
            self.pods.write().remove(&id);
            self.publish(RegistryEvent::PodRemoved(id));
        }
    }
}

/// Sleep that loses to cancellation. Returns false when cancelled.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
