use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use podtail_k8s::ClusterClient;
use podtail_types::{LogRecord, PodId, PodRecord, RegistryEvent, StreamKey, StreamState};

use crate::backoff::Backoff;
use crate::registry::{PodRegistry, sleep_or_cancel};

/// Supervision handle for one tailing task.
pub(crate) struct StreamHandle {
    pub state: watch::Receiver<StreamState>,
    cancel: CancellationToken,
}

impl StreamHandle {
    fn close(&self) {
        self.cancel.cancel();
    }
}

pub(crate) struct WorkerParams {
    pub client: Arc<dyn ClusterClient>,
    pub registry: Arc<PodRegistry>,
    pub slots: Arc<Semaphore>,
    pub sink: mpsc::Sender<LogRecord>,
    pub namespace: Option<String>,
    pub cancel: CancellationToken,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// One worker per subscription: follows registry events for the
/// subscription's namespace filter and keeps exactly one tailing task
/// per live (pod uid, container) in scope. Slots are shared across all
/// subscriptions; waiters are admitted in FIFO order.
pub(crate) fn spawn_worker(params: WorkerParams) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut worker = StreamWorker {
            handles: HashMap::new(),
            params,
        };
        let mut events = worker.params.registry.subscribe();
        let cancel = worker.params.cancel.clone();
        let sink = worker.params.sink.clone();
        worker.resync();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                // Consumer dropped its subscription: release everything.
                _ = sink.closed() => break,
                event = events.recv() => match event {
                    Ok(event) => worker.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "subscription fell behind registry events, resyncing");
                        worker.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        for (key, handle) in &worker.handles {
            tracing::debug!(
                pod_uid = %key.pod_uid,
                container = %key.container,
                state = ?*handle.state.borrow(),
                "closing stream"
            );
            handle.close();
        }
    })
}

struct StreamWorker {
    handles: HashMap<StreamKey, StreamHandle>,
    params: WorkerParams,
}

impl StreamWorker {
    fn in_scope(&self, namespace: &str) -> bool {
        self.params
            .namespace
            .as_deref()
            .is_none_or(|ns| ns == namespace)
    }

    fn handle_event(&mut self, event: RegistryEvent) {
        if !self.in_scope(event.namespace()) {
            return;
        }
        match event {
            RegistryEvent::PodAdded(record) | RegistryEvent::PodUpdated(record) => {
                self.ensure_pod(&record);
            }
            RegistryEvent::PodRemoved(id) => self.close_pod(&id.uid),
            RegistryEvent::ContainerAdded { pod, container } => {
                self.ensure_stream(&pod, &container);
            }
            RegistryEvent::ContainerRemoved { pod, container } => {
                let key = StreamKey::new(pod.uid.clone(), container);
                if let Some(handle) = self.handles.remove(&key) {
                    handle.close();
                }
            }
        }
    }

    /// Re-derive the handle set from a registry snapshot (startup, or
    /// recovery after missing broadcast events).
    fn resync(&mut self) {
        let records = self
            .params
            .registry
            .snapshot(self.params.namespace.as_deref());

        let live: HashMap<StreamKey, &PodRecord> = records
            .iter()
            .flat_map(|r| {
                r.container_names()
                    .map(move |c| (StreamKey::new(r.uid.clone(), c), r))
            })
            .collect();

        let doomed: Vec<StreamKey> = self
            .handles
            .keys()
            .filter(|key| !live.contains_key(*key))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(handle) = self.handles.remove(&key) {
                handle.close();
            }
        }

        for (key, record) in live {
            self.ensure_stream(record, &key.container);
        }
    }

    fn ensure_pod(&mut self, record: &PodRecord) {
        let containers: Vec<String> =
            record.container_names().map(str::to_string).collect();
        for container in containers {
            self.ensure_stream(record, &container);
        }
    }

    fn ensure_stream(&mut self, record: &PodRecord, container: &str) {
        let key = StreamKey::new(record.uid.clone(), container);
        // One task per key; a handle that already closed is never
        // restarted while its entry remains.
        if self.handles.contains_key(&key) {
            return;
        }

        let (state_tx, state_rx) = watch::channel(StreamState::Pending);
        let cancel = self.params.cancel.child_token();

        let task = TailTask {
            client: Arc::clone(&self.params.client),
            pod: record.id(),
            container: container.to_string(),
            sink: self.params.sink.clone(),
            slots: Arc::clone(&self.params.slots),
            state: state_tx,
            cancel: cancel.clone(),
            backoff: Backoff::new(self.params.base_backoff, self.params.max_backoff),
        };
        tokio::spawn(task.run());

        self.handles.insert(
            key,
            StreamHandle {
                state: state_rx,
                cancel,
            },
        );
    }

    fn close_pod(&mut self, uid: &str) {
        self.handles.retain(|key, handle| {
            if key.pod_uid == uid {
                handle.close();
                false
            } else {
                true
            }
        });
    }
}

/// A single (pod, container) tailing task.
///
/// Lifecycle: Pending (slot queue) -> Connecting -> Streaming, with
/// Error -> Backoff -> Connecting on stream trouble and Closed as the
/// terminal state. De-duplication across reconnects is best-effort:
/// the resume point is the last emitted timestamp, and a crash mid-line
/// can still duplicate or drop a partial line.
struct TailTask {
    client: Arc<dyn ClusterClient>,
    pod: PodId,
    container: String,
    sink: mpsc::Sender<LogRecord>,
    slots: Arc<Semaphore>,
    state: watch::Sender<StreamState>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl TailTask {
    async fn run(mut self) {
        // FIFO slot admission; newly discovered containers queue at
        // the back and never pre-empt running streams.
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = self.state.send(StreamState::Closed);
                return;
            }
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = self.state.send(StreamState::Closed);
                    return;
                }
            },
        };

        let mut since: Option<DateTime<Utc>> = None;

        'reconnect: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let _ = self.state.send(StreamState::Connecting);

            let connect = tokio::select! {
                _ = self.cancel.cancelled() => break,
                c = self.client.stream_logs(
                    &self.pod.namespace,
                    &self.pod.name,
                    &self.container,
                    since,
                ) => c,
            };

            let mut stream = match connect {
                Ok(stream) => stream,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        pod = %self.pod,
                        container = %self.container,
                        error = %e,
                        "log stream connect failed, backing off"
                    );
                    let _ = self.state.send(StreamState::Backoff);
                    if !sleep_or_cancel(self.backoff.next_delay(), &self.cancel).await {
                        break;
                    }
                    continue 'reconnect;
                }
                Err(e) => {
                    // Forbidden / not found: this container cannot be
                    // tailed, and retrying will not change that.
                    tracing::warn!(
                        pod = %self.pod,
                        container = %self.container,
                        error = %e,
                        "log stream refused, closing"
                    );
                    break;
                }
            };

            let _ = self.state.send(StreamState::Streaming);

            loop {
                let item = tokio::select! {
                    _ = self.cancel.cancelled() => break 'reconnect,
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(line)) => {
                        let record = LogRecord {
                            pod_uid: self.pod.uid.clone(),
                            pod_name: self.pod.name.clone(),
                            namespace: self.pod.namespace.clone(),
                            container_name: self.container.clone(),
                            timestamp: line.timestamp,
                            line: line.line,
                        };
                        // Bounded send: a slow consumer pauses this
                        // stream rather than dropping or buffering
                        // without limit.
                        tokio::select! {
                            _ = self.cancel.cancelled() => break 'reconnect,
                            sent = self.sink.send(record) => {
                                if sent.is_err() {
                                    // Consumer went away.
                                    break 'reconnect;
                                }
                            }
                        }
                        since = Some(line.timestamp);
                        self.backoff.reset();
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            pod = %self.pod,
                            container = %self.container,
                            error = %e,
                            "log stream error, backing off"
                        );
                        let _ = self.state.send(StreamState::Backoff);
                        if !sleep_or_cancel(self.backoff.next_delay(), &self.cancel).await {
                            break 'reconnect;
                        }
                        continue 'reconnect;
                    }
                    None => {
                        // EOF: container restarted or log rotated.
                        let _ = self.state.send(StreamState::Backoff);
                        if !sleep_or_cancel(self.backoff.next_delay(), &self.cancel).await {
                            break 'reconnect;
                        }
                        continue 'reconnect;
                    }
                }
            }
        }

        let _ = self.state.send(StreamState::Closed);
    }
}
