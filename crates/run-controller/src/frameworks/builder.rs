//! Pure translation from a runnable to Kubernetes object fragments.
//!
//! Nothing here performs I/O. Given the same runnable and configuration the
//! output is structurally identical, which is what makes `Framework::build`
//! safe to call any number of times.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{Affinity, ConfigMap, Secret, Toleration};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use super::naming::ResourceNaming;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::model::{CoreResource, CoreVolume, Runnable, VolumeType};

const SHARED_VOLUME: &str = "shared-dir";
const SHARED_MOUNT: &str = "/shared";
const INIT_VOLUME: &str = "init-config-map";
const INIT_MOUNT: &str = "/init-config-map";

/// Deserialize a JSON manifest into a typed Kubernetes object.
pub fn from_json<K: DeserializeOwned>(manifest: Value) -> Result<K> {
    serde_json::from_value(manifest).map_err(Error::from)
}

/// Options that differ between workload kinds.
#[derive(Debug, Clone, Copy)]
pub struct PodOptions<'a> {
    pub workload_name: &'a str,
    pub restart_policy: &'a str,
    /// Always add the init container, even without source contexts.
    pub force_init: bool,
    /// Overrides the configured init image.
    pub init_image: Option<&'a str>,
}

#[derive(Clone)]
pub struct K8sBuilder {
    config: Arc<ControllerConfig>,
}

impl K8sBuilder {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn label_key(&self, name: &str) -> String {
        format!("{}/{name}", self.config.labels.prefix)
    }

    /// Labels put on every object created for a runnable.
    pub fn labels(&self, runnable: &Runnable) -> BTreeMap<String, String> {
        let mut labels: BTreeMap<String, String> = runnable
            .container
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), ResourceNaming::label_value(v)))
            .collect();

        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            self.config.labels.managed_by.clone(),
        );
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            ResourceNaming::label_value(&runnable.id),
        );
        for (key, value) in [
            ("project", runnable.project.as_str()),
            ("framework", runnable.framework()),
            ("runtime", runnable.runtime.as_str()),
            ("task", runnable.task.as_str()),
            ("run", runnable.id.as_str()),
        ] {
            labels.insert(self.label_key(key), ResourceNaming::label_value(value));
        }
        labels
    }

    /// The workload correlation label alone, used as a pod selector.
    pub fn workload_label(&self, workload_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(self.label_key("workload"), workload_name.to_string())])
    }

    /// Labels for pods, adding the workload correlation label.
    pub fn pod_labels(&self, runnable: &Runnable, workload_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels(runnable);
        labels.extend(self.workload_label(workload_name));
        labels
    }

    /// Selector matching pods of one workload.
    pub fn workload_selector(&self, workload_name: &str) -> String {
        format!("{}={workload_name}", self.label_key("workload"))
    }

    /// Selector matching pods of one run.
    pub fn run_selector(&self, run_id: &str) -> String {
        format!("{}={}", self.label_key("run"), ResourceNaming::label_value(run_id))
    }

    /// Selector matching every object of one framework created by this controller.
    pub fn framework_selector(&self, framework: &str) -> String {
        format!(
            "app.kubernetes.io/managed-by={},{}={framework}",
            self.config.labels.managed_by,
            self.label_key("framework")
        )
    }

    pub fn run_label_key(&self) -> String {
        self.label_key("run")
    }

    pub fn metadata(&self, runnable: &Runnable, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": self.config.namespace,
            "labels": self.labels(runnable),
        })
    }

    /// Pod template (`metadata` + `spec`) for the runnable's main container.
    pub fn pod_template(&self, runnable: &Runnable, options: PodOptions<'_>) -> Result<Value> {
        let with_init = options.force_init || runnable.container.has_context();
        let template = &runnable.container;

        let mut spec = Map::new();
        spec.insert("restartPolicy".into(), json!(options.restart_policy));
        spec.insert(
            "containers".into(),
            json!([self.main_container(runnable, with_init)]),
        );

        let mut volumes: Vec<Value> = template.volumes.iter().map(volume).collect();
        if with_init {
            spec.insert(
                "initContainers".into(),
                json!([self.init_container(options.init_image)]),
            );
            volumes.push(json!({"name": SHARED_VOLUME, "emptyDir": {}}));
            volumes.push(json!({
                "name": INIT_VOLUME,
                "configMap": {"name": ResourceNaming::init_config_map_name(&runnable.id)},
            }));
        }
        if !volumes.is_empty() {
            spec.insert("volumes".into(), Value::Array(volumes));
        }

        if !template.node_selector.is_empty() {
            spec.insert("nodeSelector".into(), json!(template.node_selector));
        }
        if let Some(affinity) = &template.affinity {
            validate::<Affinity>(affinity, "affinity")?;
            spec.insert("affinity".into(), affinity.clone());
        }
        if !template.tolerations.is_empty() {
            for toleration in &template.tolerations {
                validate::<Toleration>(toleration, "toleration")?;
            }
            spec.insert("tolerations".into(), json!(template.tolerations));
        }
        if let Some(class) = &template.runtime_class {
            spec.insert("runtimeClassName".into(), json!(class));
        }
        if let Some(class) = &template.priority_class {
            spec.insert("priorityClassName".into(), json!(class));
        }

        let mut security = Map::new();
        if let Some(user) = template.run_as_user {
            security.insert("runAsUser".into(), json!(user));
        }
        if let Some(group) = template.run_as_group {
            security.insert("runAsGroup".into(), json!(group));
        }
        if let Some(group) = template.fs_group {
            security.insert("fsGroup".into(), json!(group));
        }
        if self.config.frameworks.disable_root {
            security.insert("runAsNonRoot".into(), json!(true));
        }
        if !security.is_empty() {
            spec.insert("securityContext".into(), Value::Object(security));
        }

        if let Some(secret) = &self.config.frameworks.registry_secret {
            spec.insert("imagePullSecrets".into(), json!([{ "name": secret }]));
        }

        Ok(json!({
            "metadata": {"labels": self.pod_labels(runnable, options.workload_name)},
            "spec": spec,
        }))
    }

    fn main_container(&self, runnable: &Runnable, with_init: bool) -> Value {
        let template = &runnable.container;

        let mut env: Vec<Value> = runnable
            .configurations
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        env.extend(
            template
                .envs
                .iter()
                .map(|e| json!({"name": e.name, "value": e.value})),
        );
        for (secret, keys) in &template.secrets {
            for key in keys {
                env.push(json!({
                    "name": ResourceNaming::env_name(key),
                    "valueFrom": {"secretKeyRef": {"name": secret, "key": key}},
                }));
            }
        }

        let mut mounts: Vec<Value> = template
            .volumes
            .iter()
            .map(|v| json!({"name": v.name, "mountPath": v.mount_path}))
            .collect();
        if with_init {
            mounts.push(json!({"name": SHARED_VOLUME, "mountPath": SHARED_MOUNT}));
        }

        let mut container = Map::new();
        container.insert("name".into(), json!("main"));
        container.insert("image".into(), json!(template.image));
        container.insert(
            "imagePullPolicy".into(),
            json!(self.config.frameworks.image_pull_policy),
        );
        if let Some(command) = &template.command {
            container.insert("command".into(), json!([command]));
        }
        if !template.args.is_empty() {
            container.insert("args".into(), json!(template.args));
        }
        if !env.is_empty() {
            container.insert("env".into(), Value::Array(env));
        }
        // The run secret may already be gone after credentials were erased.
        container.insert(
            "envFrom".into(),
            json!([{
                "secretRef": {
                    "name": ResourceNaming::run_secret_name(&runnable.id),
                    "optional": true,
                },
            }]),
        );
        if let Some(resources) = &template.resources {
            container.insert("resources".into(), self.resources(resources));
        }
        if !mounts.is_empty() {
            container.insert("volumeMounts".into(), Value::Array(mounts));
        }
        if self.config.frameworks.disable_root {
            container.insert(
                "securityContext".into(),
                json!({"allowPrivilegeEscalation": false}),
            );
        }
        Value::Object(container)
    }

    fn init_container(&self, image: Option<&str>) -> Value {
        json!({
            "name": "init",
            "image": image.unwrap_or(&self.config.frameworks.init_image),
            "imagePullPolicy": self.config.frameworks.image_pull_policy,
            "volumeMounts": [
                {"name": SHARED_VOLUME, "mountPath": SHARED_MOUNT},
                {"name": INIT_VOLUME, "mountPath": INIT_MOUNT},
            ],
        })
    }

    fn resources(&self, resources: &CoreResource) -> Value {
        let mut requests = Map::new();
        let mut limits = Map::new();
        for (key, quantity) in [
            ("cpu", &resources.cpu),
            ("memory", &resources.mem),
            (self.config.frameworks.gpu_resource_key.as_str(), &resources.gpu),
        ] {
            let Some(quantity) = quantity else { continue };
            if let Some(request) = &quantity.requests {
                requests.insert(key.to_string(), json!(request));
            }
            if let Some(limit) = &quantity.limits {
                limits.insert(key.to_string(), json!(limit));
            }
        }

        let mut out = Map::new();
        if !requests.is_empty() {
            out.insert("requests".into(), Value::Object(requests));
        }
        if !limits.is_empty() {
            out.insert("limits".into(), Value::Object(limits));
        }
        Value::Object(out)
    }

    /// Companion secret carrying the runnable's credentials, if it has any.
    pub fn run_secret(&self, runnable: &Runnable) -> Result<Option<Secret>> {
        if runnable.credentials.is_empty() {
            return Ok(None);
        }
        let data: BTreeMap<&String, &String> = runnable.credentials.iter().collect();
        let name = ResourceNaming::run_secret_name(&runnable.id);
        from_json(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": self.metadata(runnable, &name),
            "type": "Opaque",
            "stringData": data,
        }))
        .map(Some)
    }

    /// Init config map with the context files, plus any extra entries.
    pub fn init_config_map(
        &self,
        runnable: &Runnable,
        extra: BTreeMap<String, String>,
    ) -> Result<ConfigMap> {
        let mut data = extra;
        let template = &runnable.container;

        if !template.context_refs.is_empty() {
            let refs = template
                .context_refs
                .iter()
                .map(|r| format!("{},{},{}", r.protocol, r.destination, r.source))
                .collect::<Vec<_>>()
                .join("\n");
            data.insert("context-refs.txt".to_string(), refs);
        }
        for source in &template.context_sources {
            let decoded = STANDARD.decode(source.base64.trim()).map_err(|e| {
                Error::InvalidArgument(format!("context source {} is not base64: {e}", source.name))
            })?;
            let text = String::from_utf8(decoded).map_err(|_| {
                Error::InvalidArgument(format!("context source {} is not UTF-8", source.name))
            })?;
            data.insert(source.name.clone(), text);
        }

        let name = ResourceNaming::init_config_map_name(&runnable.id);
        from_json(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": self.metadata(runnable, &name),
            "data": data,
        }))
    }
}

fn volume(volume: &CoreVolume) -> Value {
    let mut source = volume.spec.clone();
    let (key, default_ref) = match volume.volume_type {
        VolumeType::PersistentVolumeClaim => ("persistentVolumeClaim", Some("claimName")),
        VolumeType::EmptyDir => ("emptyDir", None),
        VolumeType::ConfigMap => ("configMap", Some("name")),
        VolumeType::Secret => ("secret", Some("secretName")),
    };
    if let Some(field) = default_ref {
        source
            .entry(field)
            .or_insert_with(|| Value::String(volume.name.clone()));
    }
    json!({"name": volume.name, key: source})
}

fn validate<K: DeserializeOwned>(value: &Value, what: &str) -> Result<()> {
    serde_json::from_value::<K>(value.clone())
        .map(|_| ())
        .map_err(|e| Error::InvalidArgument(format!("invalid {what}: {e}")))
}
