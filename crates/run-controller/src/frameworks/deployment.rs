use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::{json, Value};
use tracing::info;

use super::builder::{from_json, PodOptions};
use super::collectors::Collectors;
use super::naming::ResourceNaming;
use super::{
    create_or_get, create_or_replace, delete_named, get_named, name_of, true_condition,
    wrong_workload, Framework, K8sContext, RunnableFramework,
};
use crate::cluster::Cluster;
use crate::config::ControllerConfig;
use crate::error::{FrameworkError, Result};
use crate::lifecycle::RunState;
use crate::model::{Runnable, Workload};

/// Long-running workloads on `apps/v1` Deployments. Stop scales to zero.
#[derive(Clone)]
pub struct DeploymentFramework {
    ctx: K8sContext,
}

impl DeploymentFramework {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self {
            ctx: K8sContext::new(cluster, config),
        }
    }

    pub(crate) fn context(&self) -> &K8sContext {
        &self.ctx
    }

    /// Deployment manifest for any runnable; also used by the serve framework.
    pub(crate) fn build_deployment(&self, runnable: &Runnable, replicas: i32) -> Result<Deployment> {
        let name = ResourceNaming::deployment_name(runnable);
        let template = self.ctx.builder.pod_template(
            runnable,
            PodOptions {
                workload_name: &name,
                restart_policy: "Always",
                force_init: false,
                init_image: None,
            },
        )?;
        from_json(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": self.ctx.builder.metadata(runnable, &name),
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": self.ctx.builder.workload_label(&name)},
                "template": template,
            },
        }))
    }

    /// Set the replica count of an existing deployment.
    pub(crate) async fn scale(&self, name: &str, replicas: i32) -> Result<Deployment> {
        let api = self.ctx.cluster.deployments.as_ref();
        let mut deployment = get_named(api, name, "Deployment").await?;
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        api.replace(name, &deployment)
            .await
            .map_err(|e| FrameworkError::from_kube(&e, "Deployment", name).into())
    }

    /// Scale back up, recreating the deployment if it disappeared meanwhile.
    pub(crate) async fn restore(&self, deployment: &Deployment) -> Result<Deployment> {
        let name = name_of(deployment);
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        match self.scale(&name, replicas).await {
            Err(e) if e.is_not_found() => self.create(deployment).await,
            other => other,
        }
    }

    fn replicas(runnable: &Runnable) -> Option<i32> {
        match &runnable.workload {
            Workload::Deployment(w) => Some(w.replicas.unwrap_or(1)),
            _ => None,
        }
    }
}

/// State, message and result summary for a Deployment.
pub(crate) fn deployment_status(deployment: &Deployment) -> (RunState, Option<String>, Value) {
    let status = deployment.status.clone().unwrap_or_default();
    let conditions = status.conditions.clone().unwrap_or_default();

    let failure = true_condition(
        conditions.iter().map(|c| {
            (
                c.type_.as_str(),
                c.status.as_str(),
                c.reason.as_deref(),
                c.message.as_deref(),
            )
        }),
        &["ReplicaFailure"],
    )
    .or_else(|| {
        conditions
            .iter()
            .find(|c| {
                c.type_ == "Progressing"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
            })
            .map(|c| {
                c.message
                    .clone()
                    .unwrap_or_else(|| "progress deadline exceeded".to_string())
            })
    });

    let state = if failure.is_some() {
        RunState::Error
    } else {
        RunState::Running
    };
    let summary = json!({
        "name": name_of(deployment),
        "replicas": deployment.spec.as_ref().and_then(|s| s.replicas),
        "readyReplicas": status.ready_replicas.unwrap_or(0),
        "availableReplicas": status.available_replicas.unwrap_or(0),
        "updatedReplicas": status.updated_replicas.unwrap_or(0),
    });
    (state, failure, summary)
}

#[async_trait]
impl Framework for DeploymentFramework {
    type Object = Deployment;

    const NAME: &'static str = "k8sdeployment";

    fn build(&self, runnable: &Runnable) -> Result<Deployment> {
        let replicas = Self::replicas(runnable).ok_or_else(|| wrong_workload(Self::NAME, runnable))?;
        self.build_deployment(runnable, replicas)
    }

    async fn create(&self, deployment: &Deployment) -> Result<Deployment> {
        create_or_get(self.ctx.cluster.deployments.as_ref(), deployment, "Deployment").await
    }

    async fn apply(&self, deployment: &Deployment) -> Result<Deployment> {
        create_or_replace(self.ctx.cluster.deployments.as_ref(), deployment, "Deployment").await
    }

    async fn get(&self, deployment: &Deployment) -> Result<Deployment> {
        get_named(
            self.ctx.cluster.deployments.as_ref(),
            &name_of(deployment),
            "Deployment",
        )
        .await
    }

    async fn delete(&self, deployment: &Deployment) -> Result<()> {
        delete_named(
            self.ctx.cluster.deployments.as_ref(),
            &name_of(deployment),
            "Deployment",
        )
        .await
    }

    fn observe(&self, deployment: &Deployment, runnable: &mut Runnable) {
        let (state, failure, summary) = deployment_status(deployment);
        runnable.state = state;
        if let Some(message) = failure {
            runnable.error = Some(message.clone());
            runnable.message = Some(message);
        }
        self.ctx.record(runnable, "deployment", summary);
    }

    fn selector(&self, deployment: &Deployment) -> String {
        self.ctx.builder.workload_selector(&name_of(deployment))
    }

    fn collectors(&self) -> &Collectors {
        &self.ctx.collectors
    }
}

#[async_trait]
impl RunnableFramework for DeploymentFramework {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, runnable: &Runnable) -> Result<Runnable> {
        let deployment = self.build(runnable)?;
        let mut runnable = runnable.clone();

        self.ctx.ensure_init_config_map(&runnable).await?;
        self.ctx.ensure_run_secret(&runnable).await?;
        let created = self.create(&deployment).await?;
        let name = name_of(&created);

        runnable.state = RunState::Running;
        runnable.message = Some(format!("deployment {name} created"));
        self.ctx.record(&mut runnable, "deployment", json!({ "name": name }));
        runnable.credentials.erase();

        info!(run_id = %runnable.id, framework = Self::NAME, deployment = %name, "deployment submitted");
        Ok(runnable)
    }

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable> {
        let name = ResourceNaming::deployment_name(runnable);
        self.scale(&name, 0).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Stopped;
        runnable.message = Some(format!("deployment {name} scaled to 0"));
        info!(run_id = %runnable.id, framework = Self::NAME, "deployment stopped");
        Ok(runnable)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable> {
        let deployment = self.build(runnable)?;
        self.restore(&deployment).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Running;
        runnable.message = Some(format!("deployment {} resumed", name_of(&deployment)));
        info!(run_id = %runnable.id, framework = Self::NAME, "deployment resumed");
        Ok(runnable)
    }

    async fn destroy(&self, runnable: &Runnable) -> Result<Runnable> {
        let deployment = self.build(runnable)?;
        self.delete(&deployment).await?;
        self.ctx.remove_companions(&runnable.id).await?;

        let mut runnable = runnable.clone();
        self.ctx.finish_destroy(&mut runnable);
        info!(run_id = %runnable.id, framework = Self::NAME, "deployment deleted");
        Ok(runnable)
    }
}
