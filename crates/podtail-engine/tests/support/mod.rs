//! Scripted cluster client for engine tests.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use podtail_k8s::{ClusterClient, ClusterError, LogStream, PodEventStream, PodWatchEvent};
use podtail_types::{ContainerRef, LogLine, PodPhase, PodRecord};

pub fn record(namespace: &str, name: &str, uid: &str, containers: &[&str]) -> PodRecord {
    PodRecord {
        namespace: namespace.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        containers: containers
            .iter()
            .map(|c| ContainerRef::new(*c, uid))
            .collect(),
        phase: PodPhase::Running,
        restart_count: 0,
        resource_version: "1".to_string(),
        last_seen: Utc::now(),
    }
}

pub fn ts(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).expect("valid timestamp")
}

type StreamId = (String, String);
type WatchTx = mpsc::UnboundedSender<Result<PodWatchEvent, ClusterError>>;
type LogTx = mpsc::UnboundedSender<Result<LogLine, ClusterError>>;

#[derive(Default)]
struct Inner {
    pods: Vec<PodRecord>,
    resource_version: String,
    forbidden: HashSet<String>,
    lists_failing: bool,
    watchers: Vec<WatchTx>,
    log_senders: HashMap<StreamId, Vec<LogTx>>,
    /// `since` argument of every stream_logs call, per (pod, container).
    since_seen: HashMap<StreamId, Vec<Option<DateTime<Utc>>>>,
    list_calls: usize,
    watch_resource_versions: Vec<String>,
}

/// In-memory `ClusterClient` whose lists, watch events and log lines
/// are all driven by the test.
pub struct MockCluster {
    inner: Mutex<Inner>,
    open_streams: Arc<AtomicUsize>,
    max_open_streams: Arc<AtomicUsize>,
    open_per_stream: Mutex<HashMap<StreamId, Arc<AtomicUsize>>>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            open_streams: Arc::new(AtomicUsize::new(0)),
            max_open_streams: Arc::new(AtomicUsize::new(0)),
            open_per_stream: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_pods(&self, pods: Vec<PodRecord>, resource_version: &str) {
        let mut inner = self.inner.lock();
        inner.pods = pods;
        inner.resource_version = resource_version.to_string();
    }

    pub fn forbid(&self, namespace: &str) {
        self.inner.lock().forbidden.insert(namespace.to_string());
    }

    /// Make every list call fail with a transport error until cleared.
    pub fn set_lists_failing(&self, failing: bool) {
        self.inner.lock().lists_failing = failing;
    }

    pub fn list_calls(&self) -> usize {
        self.inner.lock().list_calls
    }

    pub fn watch_resource_versions(&self) -> Vec<String> {
        self.inner.lock().watch_resource_versions.clone()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    /// Deliver a watch event to every open watcher.
    pub fn push_event(&self, event: PodWatchEvent) {
        let inner = self.inner.lock();
        for tx in &inner.watchers {
            let _ = tx.send(Ok(event.clone()));
        }
    }

    /// Expire every open watcher's cursor (410 Gone).
    pub fn fail_watch_gone(&self) {
        let mut inner = self.inner.lock();
        for tx in inner.watchers.drain(..) {
            let _ = tx.send(Err(ClusterError::Gone {
                resource_version: "expired".to_string(),
            }));
        }
    }

    pub fn push_line(&self, pod: &str, container: &str, timestamp: DateTime<Utc>, line: &str) {
        let inner = self.inner.lock();
        if let Some(tx) = latest(&inner.log_senders, pod, container) {
            let _ = tx.send(Ok(LogLine {
                timestamp,
                line: line.to_string(),
            }));
        }
    }

    /// Inject a transport error into the newest stream for this key.
    pub fn fail_stream(&self, pod: &str, container: &str) {
        let inner = self.inner.lock();
        if let Some(tx) = latest(&inner.log_senders, pod, container) {
            let _ = tx.send(Err(ClusterError::Transport("connection reset".to_string())));
        }
    }

    /// Number of stream_logs calls made for this key.
    pub fn stream_opens(&self, pod: &str, container: &str) -> usize {
        self.inner
            .lock()
            .since_seen
            .get(&key(pod, container))
            .map_or(0, Vec::len)
    }

    /// `since` passed to the most recent stream_logs call for this key.
    pub fn last_since(&self, pod: &str, container: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .since_seen
            .get(&key(pod, container))
            .and_then(|calls| calls.last().cloned())
            .flatten()
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn max_open_streams(&self) -> usize {
        self.max_open_streams.load(Ordering::SeqCst)
    }

    pub fn open_streams_for(&self, pod: &str, container: &str) -> usize {
        self.open_per_stream
            .lock()
            .get(&key(pod, container))
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }
}

fn key(pod: &str, container: &str) -> StreamId {
    (pod.to_string(), container.to_string())
}

fn latest<'a>(
    senders: &'a HashMap<StreamId, Vec<LogTx>>,
    pod: &str,
    container: &str,
) -> Option<&'a LogTx> {
    senders.get(&key(pod, container)).and_then(|v| v.last())
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn list_pods(
        &self,
        namespace: Option<&str>,
    ) -> Result<(Vec<PodRecord>, String), ClusterError> {
        let mut inner = self.inner.lock();
        inner.list_calls += 1;
        if inner.lists_failing {
            return Err(ClusterError::Transport("api server unreachable".to_string()));
        }
        if let Some(ns) = namespace {
            if inner.forbidden.contains(ns) {
                return Err(ClusterError::Forbidden {
                    namespace: Some(ns.to_string()),
                });
            }
        }
        let records = inner
            .pods
            .iter()
            .filter(|p| namespace.is_none_or(|ns| p.namespace == ns))
            .cloned()
            .collect();
        Ok((records, inner.resource_version.clone()))
    }

    async fn watch_pods(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> Result<PodEventStream, ClusterError> {
        let mut inner = self.inner.lock();
        if let Some(ns) = namespace {
            if inner.forbidden.contains(ns) {
                return Err(ClusterError::Forbidden {
                    namespace: Some(ns.to_string()),
                });
            }
        }
        inner
            .watch_resource_versions
            .push(resource_version.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push(tx);
        Ok(RecvStream { rx }.boxed())
    }

    async fn stream_logs(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogStream, ClusterError> {
        let id = key(pod, container);
        let (tx, rx) = mpsc::unbounded_channel();

        let per_stream = {
            let mut inner = self.inner.lock();
            inner.since_seen.entry(id.clone()).or_default().push(since);
            inner.log_senders.entry(id.clone()).or_default().push(tx);
            Arc::clone(self.open_per_stream.lock().entry(id).or_default())
        };

        per_stream.fetch_add(1, Ordering::SeqCst);
        let now = self.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_streams.fetch_max(now, Ordering::SeqCst);

        Ok(CountedStream {
            rx,
            global: Arc::clone(&self.open_streams),
            per_stream,
        }
        .boxed())
    }
}

struct RecvStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Stream for RecvStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Log stream that keeps the open-stream gauges honest on drop.
struct CountedStream {
    rx: mpsc::UnboundedReceiver<Result<LogLine, ClusterError>>,
    global: Arc<AtomicUsize>,
    per_stream: Arc<AtomicUsize>,
}

impl Stream for CountedStream {
    type Item = Result<LogLine, ClusterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.global.fetch_sub(1, Ordering::SeqCst);
        self.per_stream.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll until `condition` holds, panicking after a generous deadline.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline: {what}");
}
