//! Best-effort pod, log and metric collection for a workload.
//!
//! Pod listing failures go back to the caller. Logs and metrics skip what
//! cannot be read. Nothing here touches runnable state.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::config::ControllerConfig;
use crate::error::{FrameworkError, Result};
use crate::model::{PodLog, PodMetric};

#[derive(Clone)]
pub struct Collectors {
    cluster: Cluster,
    config: Arc<ControllerConfig>,
}

impl Collectors {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub async fn pods(&self, selector: &str) -> Result<Vec<Pod>> {
        self.cluster
            .pods
            .list(selector)
            .await
            .map_err(|e| FrameworkError::from_kube(&e, "Pod", selector).into())
    }

    /// Tail of every container's log in the given pods.
    pub async fn logs(&self, pods: &[Pod]) -> Result<Vec<PodLog>> {
        let tail = Some(self.config.frameworks.log_tail_lines).filter(|n| *n > 0);
        let mut logs = Vec::new();
        for pod in pods {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            let containers = pod
                .spec
                .as_ref()
                .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_else(Vec::new);
            for container in containers {
                let value = match self
                    .cluster
                    .pod_logs
                    .logs(pod_name, Some(&container), tail)
                    .await
                {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            pod = %pod_name,
                            container = %container,
                            error = %e,
                            "skipping container log"
                        );
                        continue;
                    }
                };
                logs.push(PodLog {
                    pod: pod_name.to_string(),
                    container,
                    value,
                });
            }
        }
        debug!(count = logs.len(), "collected container logs");
        Ok(logs)
    }

    /// Usage samples from `metrics.k8s.io` for the given pods.
    pub async fn metrics(&self, pods: &[Pod]) -> Result<Vec<PodMetric>> {
        let mut metrics = Vec::new();
        for pod in pods {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            let sample = match self.cluster.pod_metrics.get(pod_name).await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "skipping pod metrics");
                    continue;
                }
            };
            metrics.push(PodMetric {
                pod: pod_name.to_string(),
                timestamp: sample
                    .data
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                window: sample
                    .data
                    .get("window")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                containers: sample
                    .data
                    .get("containers")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            });
        }
        Ok(metrics)
    }
}

/// Compact per-pod status recorded under `results["pods"]`.
pub fn summarize_pods(pods: &[Pod]) -> Value {
    Value::Array(
        pods.iter()
            .map(|pod| {
                let status = pod.status.as_ref();
                json!({
                    "name": pod.metadata.name,
                    "phase": status.and_then(|s| s.phase.clone()),
                    "startTime": status.and_then(|s| s.start_time.clone()),
                    "restarts": status
                        .and_then(|s| s.container_statuses.as_ref())
                        .map(|cs| cs.iter().map(|c| c.restart_count).sum::<i32>())
                        .unwrap_or(0),
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::frameworks::builder::tests::config;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use kube::api::{DynamicObject, ObjectMeta};
    use kube::discovery::ApiResource;
    use std::collections::BTreeMap;

    fn pod(name: &str, workload: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(BTreeMap::from([(
                    "runs.5dlabs.ai/workload".to_string(),
                    workload.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".into(),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..PodStatus::default()
            }),
        }
    }

    #[tokio::test]
    async fn collects_pods_by_selector_and_their_logs() {
        let memory = InMemoryCluster::new();
        memory.pods.insert(pod("p1", "j-a"));
        memory.pods.insert(pod("p2", "j-b"));
        memory.pod_logs.set("p1", "hello\n");
        let collectors = Collectors::new(memory.cluster("runs"), config());

        let pods = collectors.pods("runs.5dlabs.ai/workload=j-a").await.unwrap();
        assert_eq!(pods.len(), 1);

        let logs = collectors.logs(&pods).await.unwrap();
        assert_eq!(
            logs,
            vec![PodLog {
                pod: "p1".into(),
                container: "main".into(),
                value: "hello\n".into()
            }]
        );
        assert_eq!(summarize_pods(&pods)[0]["phase"], "Running");
    }

    #[tokio::test]
    async fn unreadable_logs_are_skipped() {
        let memory = InMemoryCluster::new();
        memory.pod_logs.set("p2", "second\n");
        let collectors = Collectors::new(memory.cluster("runs"), config());

        let logs = collectors
            .logs(&[pod("p1", "j-a"), pod("p2", "j-a")])
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].pod, "p2");
        assert_eq!(logs[0].value, "second\n");
    }

    #[tokio::test]
    async fn reads_pod_metrics() {
        let memory = InMemoryCluster::new();
        let mut sample = DynamicObject::new("p1", &ApiResource::erase::<Pod>(&()));
        sample.data = json!({
            "timestamp": "2026-01-01T00:00:00Z",
            "window": "30s",
            "containers": [{"name": "main", "usage": {"cpu": "5m", "memory": "12Mi"}}],
        });
        memory.pod_metrics.insert(sample);
        let collectors = Collectors::new(memory.cluster("runs"), config());

        let metrics = collectors
            .metrics(&[pod("p1", "j-a"), pod("p2", "j-a")])
            .await
            .unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].window.as_deref(), Some("30s"));
        assert_eq!(metrics[0].containers.len(), 1);
    }
}
