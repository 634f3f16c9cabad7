use chrono::{DateTime, Utc};
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{ListParams, LogParams, WatchEvent, WatchParams};
use kube::core::ResourceExt;

use podtail_types::{ContainerRef, LogLine, PodPhase, PodRecord};

use crate::client::{ClusterClient, LogStream, PodEventStream};
use crate::error::ClusterError;
use crate::event::PodWatchEvent;

/// `ClusterClient` backed by a real API server.
///
/// Expects to run with an in-cluster service account or whatever
/// kubeconfig the environment provides; transport security is entirely
/// kube's concern.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Infer configuration from the environment (in-cluster service
    /// account first, local kubeconfig as a fallback).
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn pods_api(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(
        &self,
        namespace: Option<&str>,
    ) -> Result<(Vec<PodRecord>, String), ClusterError> {
        let api = self.pods_api(namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::from_kube(e, namespace))?;

        let resource_version = list.metadata.resource_version.unwrap_or_default();
        let records = list.items.into_iter().filter_map(pod_to_record).collect();
        Ok((records, resource_version))
    }

    async fn watch_pods(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
    ) -> Result<PodEventStream, ClusterError> {
        let api = self.pods_api(namespace);
        let ns = namespace.map(str::to_string);
        let watched_from = resource_version.to_string();

        let stream = api
            .watch(&WatchParams::default(), resource_version)
            .await
            .map_err(|e| ClusterError::from_kube(e, namespace))?;

        let events = stream.map(move |item| match item {
            Ok(WatchEvent::Added(pod)) => decode(pod).map(PodWatchEvent::Added),
            Ok(WatchEvent::Modified(pod)) => decode(pod).map(PodWatchEvent::Modified),
            Ok(WatchEvent::Deleted(pod)) => decode(pod).map(PodWatchEvent::Deleted),
            Ok(WatchEvent::Bookmark(b)) => Ok(PodWatchEvent::Bookmark {
                resource_version: b.metadata.resource_version,
            }),
            Ok(WatchEvent::Error(resp)) => {
                let err = ClusterError::from_status(resp.code, resp.message, ns.as_deref());
                Err(match err {
                    // 410 does not echo the cursor; report the one we watched from.
                    ClusterError::Gone { .. } => ClusterError::Gone {
                        resource_version: watched_from.clone(),
                    },
                    other => other,
                })
            }
            Err(e) => Err(ClusterError::from_kube(e, ns.as_deref())),
        });

        Ok(events.boxed())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogStream, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            follow: true,
            container: Some(container.to_string()),
            // The server prefixes each line with an RFC3339 stamp;
            // split off below so resumes can pass since_time.
            timestamps: true,
            since_time: since,
            ..Default::default()
        };

        tracing::debug!(
            namespace = %namespace,
            pod = %pod,
            container = %container,
            since = ?since,
            "opening log stream"
        );

        let reader = api
            .log_stream(pod, &params)
            .await
            .map_err(|e| ClusterError::from_kube(e, Some(namespace)))?;

        let lines = reader
            .lines()
            .map_err(|e| ClusterError::Transport(e.to_string()))
            .map_ok(|line| split_timestamp(&line));

        Ok(lines.boxed())
    }
}

/// Decode a raw pod into the registry's record shape. Pods without a
/// uid (never observed in practice) are rejected as transport noise.
fn pod_to_record(pod: Pod) -> Option<PodRecord> {
    let uid = pod.metadata.uid.clone()?;
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let resource_version = pod.resource_version().unwrap_or_default();

    let containers = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| ContainerRef::new(c.name.clone(), uid.clone()))
                .collect()
        })
        .unwrap_or_default();

    let (phase, restart_count) = match pod.status {
        Some(status) => {
            let phase = status
                .phase
                .as_deref()
                .map(PodPhase::from)
                .unwrap_or(PodPhase::Unknown);
            let restarts = status
                .container_statuses
                .unwrap_or_default()
                .iter()
                .map(|cs| cs.restart_count)
                .sum();
            (phase, restarts)
        }
        None => (PodPhase::Unknown, 0),
    };

    Some(PodRecord {
        namespace,
        name,
        uid,
        containers,
        phase,
        restart_count,
        resource_version,
        last_seen: Utc::now(),
    })
}

fn decode(pod: Pod) -> Result<PodRecord, ClusterError> {
    pod_to_record(pod)
        .ok_or_else(|| ClusterError::Transport("watch event for pod without uid".into()))
}

/// Split the server-side `timestamps: true` prefix off a log line.
/// Lines without a parseable stamp keep their full text and get the
/// client clock instead.
fn split_timestamp(raw: &str) -> LogLine {
    if let Some((stamp, rest)) = raw.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(stamp) {
            return LogLine {
                timestamp: ts.with_timezone(&Utc),
                line: rest.to_string(),
            };
        }
    }
    LogLine {
        timestamp: Utc::now(),
        line: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_rfc3339_prefix() {
        let parsed = split_timestamp("2024-03-01T12:00:00.123456789Z GET /healthz 200");
        assert_eq!(parsed.line, "GET /healthz 200");
        assert_eq!(parsed.timestamp.timezone(), Utc);
        assert_eq!(
            parsed.timestamp,
            DateTime::parse_from_rfc3339("2024-03-01T12:00:00.123456789Z").unwrap()
        );
    }

    #[test]
    fn keeps_unstamped_lines_whole() {
        let parsed = split_timestamp("no timestamp here");
        assert_eq!(parsed.line, "no timestamp here");
    }
}
