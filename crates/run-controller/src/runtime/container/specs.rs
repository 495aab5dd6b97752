//! Spec documents of the container runtime.
//!
//! Every struct reads from the same flat effective run spec; unknown keys are
//! ignored so each view only picks the fields it owns.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{CoreEnv, CoreResource, CoreVolume, ServePort, ServiceType};

/// Function source: a URI (`git://`, `s3://`, `https://`, …) or a plain
/// path shipped inline as base64.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceCode {
    pub source: Option<String>,
    pub base64: Option<String>,
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerFunctionSpec {
    pub image: Option<String>,
    pub base_image: Option<String>,
    pub command: Option<String>,
    pub source: Option<SourceCode>,
}

/// Fields shared by every Kubernetes task kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sTaskSpec {
    /// Function reference, `container://<project>/<name>[:<version>]`.
    pub function: Option<String>,
    pub envs: Vec<CoreEnv>,
    /// Project secret names to expose.
    pub secrets: BTreeSet<String>,
    pub resources: Option<CoreResource>,
    pub volumes: Vec<CoreVolume>,
    pub node_selector: BTreeMap<String, String>,
    pub affinity: Option<Value>,
    pub tolerations: Vec<Value>,
    pub runtime_class: Option<String>,
    pub priority_class: Option<String>,
    pub profile: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub fs_group: Option<i64>,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTaskSpec {
    #[serde(flatten)]
    pub k8s: K8sTaskSpec,
    pub backoff_limit: Option<i32>,
    /// Cron expression; turns the job into a CronJob.
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployTaskSpec {
    #[serde(flatten)]
    pub k8s: K8sTaskSpec,
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeTaskSpec {
    #[serde(flatten)]
    pub k8s: K8sTaskSpec,
    pub replicas: Option<i32>,
    pub service_ports: Vec<ServePort>,
    pub service_type: ServiceType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildTaskSpec {
    #[serde(flatten)]
    pub k8s: K8sTaskSpec,
    /// Extra `RUN` instructions appended to the generated Dockerfile.
    pub instructions: Vec<String>,
    pub backoff_limit: Option<i32>,
}

/// Run-level fields plus the function spec attached when the run was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRunSpec {
    pub function_spec: ContainerFunctionSpec,
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn task_views_share_the_flat_document() {
        let doc = json!({
            "function": "container://demo/api",
            "envs": [{"name": "MODE", "value": "prod"}],
            "secrets": ["db"],
            "replicas": 2,
            "service_ports": [{"port": 80, "target_port": 8080}],
            "service_type": "ClusterIP",
            "args": ["serve"],
        });

        let serve: ServeTaskSpec = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(serve.replicas, Some(2));
        assert_eq!(serve.service_type, ServiceType::ClusterIP);
        assert_eq!(serve.k8s.envs[0].name, "MODE");
        assert!(serve.k8s.secrets.contains("db"));

        let run: ContainerRunSpec = serde_json::from_value(doc).unwrap();
        assert_eq!(run.args, vec!["serve"]);
        assert_eq!(run.function_spec, ContainerFunctionSpec::default());
    }

    #[test]
    fn malformed_fields_are_rejected() {
        let doc = json!({"backoff_limit": "three"});
        assert!(serde_json::from_value::<JobTaskSpec>(doc).is_err());
    }
}
