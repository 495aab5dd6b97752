//! Runnable: the backend-addressable descriptor for one execution attempt.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Credentials, SpecMap};
use crate::lifecycle::RunState;

/// Environment variable definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreEnv {
    pub name: String,
    pub value: String,
}

impl CoreEnv {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<String>,
}

/// Compute resources requested for the main container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<ResourceQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<ResourceQuantity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    PersistentVolumeClaim,
    EmptyDir,
    ConfigMap,
    Secret,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreVolume {
    pub volume_type: VolumeType,
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub spec: SpecMap,
}

/// Remote source fetched into the build context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub protocol: String,
    pub source: String,
    pub destination: String,
}

impl ContextRef {
    /// Derive a reference from a URI; the destination is the last path segment.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let (protocol, rest) = uri.split_once("://")?;
        let destination = rest
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(rest)
            .to_string();
        Some(Self {
            protocol: protocol.to_string(),
            source: uri.to_string(),
            destination,
        })
    }
}

/// Inline source file shipped base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSource {
    pub name: String,
    pub base64: String,
}

/// Container-level settings shared by every workload kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerTemplate {
    pub image: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<CoreEnv>,
    /// Project secret name to the keys exposed from it.
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub resources: Option<CoreResource>,
    #[serde(default)]
    pub volumes: Vec<CoreVolume>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub affinity: Option<Value>,
    #[serde(default)]
    pub tolerations: Vec<Value>,
    #[serde(default)]
    pub runtime_class: Option<String>,
    #[serde(default)]
    pub priority_class: Option<String>,
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
    #[serde(default)]
    pub fs_group: Option<i64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Named profile applied by the platform.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub context_refs: Vec<ContextRef>,
    #[serde(default)]
    pub context_sources: Vec<ContextSource>,
}

impl ContainerTemplate {
    pub fn has_context(&self) -> bool {
        !self.context_refs.is_empty() || !self.context_sources.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWorkload {
    #[serde(default)]
    pub backoff_limit: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobWorkload {
    pub schedule: String,
    #[serde(default)]
    pub backoff_limit: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentWorkload {
    #[serde(default)]
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    ClusterIP,
    #[default]
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServePort {
    pub port: i32,
    pub target_port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeWorkload {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub service_ports: Vec<ServePort>,
    #[serde(default)]
    pub service_type: ServiceType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomResourceWorkload {
    pub api_group: String,
    pub api_version: String,
    pub kind: String,
    pub plural: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub spec: SpecMap,
    #[serde(default)]
    pub requires_secret: bool,
}

impl CustomResourceWorkload {
    /// `group/version` as submitted to the API server.
    pub fn api_version_string(&self) -> String {
        if self.api_group.is_empty() {
            self.api_version.clone()
        } else {
            format!("{}/{}", self.api_group, self.api_version)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildWorkload {
    pub dockerfile: String,
    #[serde(default)]
    pub backoff_limit: Option<i32>,
    /// Image reference pushed by the build, set once submitted.
    #[serde(default)]
    pub destination: Option<String>,
}

/// Workload-specific part of a runnable; selects the framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    Job(JobWorkload),
    CronJob(CronJobWorkload),
    Deployment(DeploymentWorkload),
    Serve(ServeWorkload),
    CustomResource(CustomResourceWorkload),
    Build(BuildWorkload),
}

impl Default for Workload {
    fn default() -> Self {
        Workload::Job(JobWorkload::default())
    }
}

impl Workload {
    pub fn framework(&self) -> &'static str {
        match self {
            Workload::Job(_) => "k8sjob",
            Workload::CronJob(_) => "k8scronjob",
            Workload::Deployment(_) => "k8sdeployment",
            Workload::Serve(_) => "k8sserve",
            Workload::CustomResource(_) => "k8scr",
            Workload::Build(_) => "k8sbuild",
        }
    }
}

/// Log lines collected from one pod container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodLog {
    pub pod: String,
    pub container: String,
    pub value: String,
}

/// Usage sample for one pod from the metrics API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodMetric {
    pub pod: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub containers: Vec<Value>,
}

/// Ephemeral execution descriptor for one run attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Runnable {
    /// Same as the run id.
    pub id: String,
    pub project: String,
    pub runtime: String,
    pub task: String,
    #[serde(default)]
    pub state: RunState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    #[serde(default)]
    pub logs: Vec<PodLog>,
    #[serde(default)]
    pub metrics: Vec<PodMetric>,
    #[serde(default)]
    pub credentials: Credentials,
    /// Ambient configuration injected into every container.
    #[serde(default)]
    pub configurations: BTreeMap<String, String>,
    #[serde(default)]
    pub container: ContainerTemplate,
    #[serde(default)]
    pub workload: Workload,
}

impl Runnable {
    pub fn framework(&self) -> &'static str {
        self.workload.framework()
    }

    /// Record a failure on the runnable.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.state = RunState::Error;
        self.error = Some(message.clone());
        self.message = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_follows_workload() {
        let mut runnable = Runnable::default();
        assert_eq!(runnable.framework(), "k8sjob");

        runnable.workload = Workload::Serve(ServeWorkload::default());
        assert_eq!(runnable.framework(), "k8sserve");

        runnable.workload = Workload::CronJob(CronJobWorkload {
            schedule: "*/5 * * * *".into(),
            backoff_limit: None,
        });
        assert_eq!(runnable.framework(), "k8scronjob");
    }

    #[test]
    fn context_ref_from_uri() {
        let reference = ContextRef::from_uri("git://github.com/org/repo").unwrap();
        assert_eq!(reference.protocol, "git");
        assert_eq!(reference.destination, "repo");
        assert!(ContextRef::from_uri("main.py").is_none());
    }

    #[test]
    fn fail_sets_error_state() {
        let mut runnable = Runnable::default();
        runnable.fail("boom");
        assert_eq!(runnable.state, RunState::Error);
        assert_eq!(runnable.error.as_deref(), Some("boom"));
        assert_eq!(runnable.message.as_deref(), Some("boom"));
    }

    #[test]
    fn custom_resource_api_version() {
        let cr = CustomResourceWorkload {
            api_group: "serving.kserve.io".into(),
            api_version: "v1beta1".into(),
            ..CustomResourceWorkload::default()
        };
        assert_eq!(cr.api_version_string(), "serving.kserve.io/v1beta1");
    }
}
