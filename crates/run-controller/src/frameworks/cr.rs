//! Caller-defined custom resources, e.g. KServe `InferenceService`.
//!
//! The `group/version` of every submission must be on the configured
//! allow-list; the check runs in `build` so a rejected runnable never reaches
//! the API server.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde_json::{json, Value};
use tracing::info;

use super::builder::from_json;
use super::collectors::Collectors;
use super::naming::ResourceNaming;
use super::{
    create_or_get, create_or_replace, delete_named, get_named, name_of, true_condition,
    wrong_workload, Framework, K8sContext, RunnableFramework,
};
use crate::cluster::Cluster;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::lifecycle::RunState;
use crate::model::{CustomResourceWorkload, Runnable, Workload};

/// A custom resource together with the API coordinates needed to reach it.
#[derive(Debug, Clone)]
pub struct CustomResourceObject {
    pub resource: ApiResource,
    pub object: DynamicObject,
}

#[derive(Clone)]
pub struct CustomResourceFramework {
    ctx: K8sContext,
}

impl CustomResourceFramework {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self {
            ctx: K8sContext::new(cluster, config),
        }
    }

    fn workload(runnable: &Runnable) -> Result<&CustomResourceWorkload> {
        match &runnable.workload {
            Workload::CustomResource(w) => Ok(w),
            _ => Err(wrong_workload(Self::NAME, runnable)),
        }
    }

    fn ensure_allowed(&self, workload: &CustomResourceWorkload) -> Result<()> {
        let api_version = workload.api_version_string();
        let allowed = &self.ctx.builder.config().custom_resources.api_groups;
        if allowed.iter().any(|g| g == &api_version) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "custom resource {api_version} is not allowed"
            )))
        }
    }

    fn result_key(object: &CustomResourceObject) -> String {
        object.resource.kind.to_lowercase()
    }
}

fn api_resource(workload: &CustomResourceWorkload) -> ApiResource {
    ApiResource {
        group: workload.api_group.clone(),
        version: workload.api_version.clone(),
        api_version: workload.api_version_string(),
        kind: workload.kind.clone(),
        plural: workload.plural.clone(),
    }
}

/// Map `status.conditions` of an arbitrary resource onto a run state.
fn custom_resource_status(object: &DynamicObject) -> (RunState, Option<String>) {
    let conditions: Vec<(&str, &str, Option<&str>, Option<&str>)> = object
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions
                .iter()
                .filter_map(|c| {
                    Some((
                        c.get("type")?.as_str()?,
                        c.get("status")?.as_str()?,
                        c.get("reason").and_then(Value::as_str),
                        c.get("message").and_then(Value::as_str),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(message) = true_condition(conditions.iter().copied(), &["Failed"]) {
        (RunState::Error, Some(message))
    } else if true_condition(
        conditions.iter().copied(),
        &["Succeeded", "Complete", "Completed"],
    )
    .is_some()
    {
        (RunState::Completed, None)
    } else {
        (RunState::Running, None)
    }
}

#[async_trait]
impl Framework for CustomResourceFramework {
    type Object = CustomResourceObject;

    const NAME: &'static str = "k8scr";

    fn build(&self, runnable: &Runnable) -> Result<CustomResourceObject> {
        let workload = Self::workload(runnable)?;
        for (field, value) in [
            ("kind", &workload.kind),
            ("plural", &workload.plural),
            ("version", &workload.api_version),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "custom resource for run {} is missing {field}",
                    runnable.id
                )));
            }
        }
        self.ensure_allowed(workload)?;

        let name = workload
            .name
            .as_deref()
            .map(ResourceNaming::sanitize)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| ResourceNaming::custom_resource_name(runnable));

        let object = from_json(json!({
            "apiVersion": workload.api_version_string(),
            "kind": workload.kind,
            "metadata": self.ctx.builder.metadata(runnable, &name),
            "spec": workload.spec,
        }))?;
        Ok(CustomResourceObject {
            resource: api_resource(workload),
            object,
        })
    }

    async fn create(&self, object: &CustomResourceObject) -> Result<CustomResourceObject> {
        let api = self.ctx.cluster.dynamic.api(&object.resource);
        let created = create_or_get(api.as_ref(), &object.object, &object.resource.kind).await?;
        Ok(CustomResourceObject {
            resource: object.resource.clone(),
            object: created,
        })
    }

    async fn apply(&self, object: &CustomResourceObject) -> Result<CustomResourceObject> {
        let api = self.ctx.cluster.dynamic.api(&object.resource);
        let applied =
            create_or_replace(api.as_ref(), &object.object, &object.resource.kind).await?;
        Ok(CustomResourceObject {
            resource: object.resource.clone(),
            object: applied,
        })
    }

    async fn get(&self, object: &CustomResourceObject) -> Result<CustomResourceObject> {
        let api = self.ctx.cluster.dynamic.api(&object.resource);
        let current =
            get_named(api.as_ref(), &name_of(&object.object), &object.resource.kind).await?;
        Ok(CustomResourceObject {
            resource: object.resource.clone(),
            object: current,
        })
    }

    async fn delete(&self, object: &CustomResourceObject) -> Result<()> {
        let api = self.ctx.cluster.dynamic.api(&object.resource);
        delete_named(api.as_ref(), &name_of(&object.object), &object.resource.kind).await
    }

    fn observe(&self, object: &CustomResourceObject, runnable: &mut Runnable) {
        let (state, failure) = custom_resource_status(&object.object);
        runnable.state = state;
        if let Some(message) = failure {
            runnable.error = Some(message.clone());
            runnable.message = Some(message);
        }
        self.ctx.record(
            runnable,
            &Self::result_key(object),
            json!({
                "name": name_of(&object.object),
                "apiVersion": object.resource.api_version,
                "status": object.object.data.get("status").cloned().unwrap_or(Value::Null),
            }),
        );
    }

    fn selector(&self, object: &CustomResourceObject) -> String {
        let key = self.ctx.builder.run_label_key();
        match object
            .object
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&key))
        {
            Some(run) => format!("{key}={run}"),
            None => self.ctx.builder.workload_selector(&name_of(&object.object)),
        }
    }

    fn collectors(&self) -> &Collectors {
        &self.ctx.collectors
    }
}

#[async_trait]
impl RunnableFramework for CustomResourceFramework {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        let workload = Self::workload(runnable)?;
        let mut runnable = runnable.clone();

        if workload.requires_secret {
            if let Some(secret) = self.ctx.ensure_run_secret(&runnable).await? {
                self.ctx
                    .record(&mut runnable, "secret", json!({ "name": secret }));
            }
        }
        let created = self.create(&object).await?;
        let name = name_of(&created.object);
        let kind = &created.resource.kind;

        runnable.state = RunState::Running;
        runnable.message = Some(format!("CR {kind} {name} created"));
        self.ctx.record(
            &mut runnable,
            &Self::result_key(&created),
            json!({ "name": name, "apiVersion": created.resource.api_version }),
        );
        runnable.credentials.erase();

        info!(run_id = %runnable.id, framework = Self::NAME, kind = %kind, name = %name, "custom resource submitted");
        Ok(runnable)
    }

    /// Custom resources have no pause; stopping removes the object.
    async fn stop(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.delete(&object).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Stopped;
        runnable.message = Some(format!(
            "CR {} {} stopped",
            object.resource.kind,
            name_of(&object.object)
        ));
        Ok(runnable)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.create(&object).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Running;
        runnable.message = Some(format!(
            "CR {} {} resumed",
            object.resource.kind,
            name_of(&object.object)
        ));
        Ok(runnable)
    }

    async fn destroy(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.delete(&object).await?;
        self.ctx.remove_companions(&runnable.id).await?;

        let mut runnable = runnable.clone();
        self.ctx.finish_destroy(&mut runnable);
        info!(run_id = %runnable.id, framework = Self::NAME, "custom resource deleted");
        Ok(runnable)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::frameworks::builder::tests::runnable;
    use crate::frameworks::tests::context;
    use crate::model::Credentials;

    fn inference_service(api_group: &str) -> Runnable {
        let mut r = runnable();
        r.task = "serve".into();
        let spec = json!({"predictor": {"model": {"modelFormat": {"name": "sklearn"}}}});
        r.workload = Workload::CustomResource(CustomResourceWorkload {
            api_group: api_group.into(),
            api_version: "v1beta1".into(),
            kind: "InferenceService".into(),
            plural: "inferenceservices".into(),
            name: Some("iris".into()),
            spec: spec.as_object().cloned().unwrap_or_default(),
            requires_secret: true,
        });
        r
    }

    #[tokio::test]
    async fn disallowed_group_fails_before_any_call() {
        let (memory, config) = context();
        let framework = CustomResourceFramework::new(memory.cluster("runs"), config);

        let err = framework
            .run(&inference_service("evil.example.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("evil.example.com/v1beta1"));
        assert_eq!(memory.calls(), 0);
    }

    #[test]
    fn build_keeps_caller_spec() {
        let (memory, config) = context();
        let framework = CustomResourceFramework::new(memory.cluster("runs"), config);

        let built = framework.build(&inference_service("serving.kserve.io")).unwrap();
        assert_eq!(built.resource.plural, "inferenceservices");
        assert_eq!(built.object.metadata.name.as_deref(), Some("iris"));
        assert_eq!(
            built.object.data["spec"]["predictor"]["model"]["modelFormat"]["name"],
            "sklearn"
        );
    }

    #[tokio::test]
    async fn run_creates_secret_and_records_by_kind() {
        let (memory, config) = context();
        let framework = CustomResourceFramework::new(memory.cluster("runs"), config);
        let mut r = inference_service("serving.kserve.io");
        r.credentials = Credentials::new(BTreeMap::from([("token".into(), "t".into())]));

        let out = framework.run(&r).await.unwrap();

        assert_eq!(out.state, RunState::Running);
        assert_eq!(out.message.as_deref(), Some("CR InferenceService iris created"));
        assert_eq!(out.results["inferenceservice"]["name"], "iris");
        assert_eq!(out.results["secret"]["name"], "sec-run-r1");
        assert!(out.credentials.is_empty());

        let built = framework.build(&r).unwrap();
        let api = memory.dynamic.api_for(&built.resource);
        assert_eq!(api.names(), vec!["iris"]);
    }

    #[tokio::test]
    async fn observe_reads_status_conditions() {
        let (memory, config) = context();
        let framework = CustomResourceFramework::new(memory.cluster("runs"), config);
        let r = inference_service("serving.kserve.io");
        let mut built = framework.build(&r).unwrap();
        let mut out = r.clone();

        framework.observe(&built, &mut out);
        assert_eq!(out.state, RunState::Running);

        built.object.data["status"] = json!({"conditions": [
            {"type": "Ready", "status": "False"},
            {"type": "Failed", "status": "True", "message": "model not found"},
        ]});
        framework.observe(&built, &mut out);
        assert_eq!(out.state, RunState::Error);
        assert_eq!(out.error.as_deref(), Some("model not found"));

        built.object.data["status"] = json!({"conditions": [{"type": "Succeeded", "status": "True"}]});
        framework.observe(&built, &mut out);
        assert_eq!(out.state, RunState::Completed);
    }

    #[tokio::test]
    async fn destroy_removes_object_and_secret() {
        let (memory, config) = context();
        let framework = CustomResourceFramework::new(memory.cluster("runs"), config);
        let mut r = inference_service("serving.kserve.io");
        r.credentials = Credentials::new(BTreeMap::from([("token".into(), "t".into())]));
        let running = framework.run(&r).await.unwrap();

        let deleted = framework.destroy(&running).await.unwrap();
        assert_eq!(deleted.state, RunState::Deleted);
        assert!(memory.secrets.is_empty());
        let built = framework.build(&r).unwrap();
        assert!(memory.dynamic.api_for(&built.resource).is_empty());
        assert!(framework.get(&built).await.unwrap_err().is_not_found());
    }

    #[test]
    fn selector_uses_run_label() {
        let (memory, config) = context();
        let framework = CustomResourceFramework::new(memory.cluster("runs"), config);
        let built = framework.build(&inference_service("serving.kserve.io")).unwrap();
        assert_eq!(framework.selector(&built), "runs.5dlabs.ai/run=r1");
    }
}
