use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde_json::{json, Value};
use tracing::info;

use super::builder::from_json;
use super::collectors::Collectors;
use super::naming::ResourceNaming;
use super::{
    create_or_get, create_or_replace, delete_named, get_named, name_of, wrong_workload,
    DeploymentFramework, Framework, RunnableFramework,
};
use crate::cluster::Cluster;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::lifecycle::RunState;
use crate::model::{Runnable, ServeWorkload, Workload};

/// A served deployment and the service exposing it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServeObject {
    pub deployment: Deployment,
    pub service: Service,
}

/// Model serving: a Deployment fronted by a Service.
///
/// Owns a [`DeploymentFramework`] for the deployment half; stop scales it to
/// zero and removes the service, resume restores both.
#[derive(Clone)]
pub struct ServeFramework {
    deployments: DeploymentFramework,
}

impl ServeFramework {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self {
            deployments: DeploymentFramework::new(cluster, config),
        }
    }

    fn workload(runnable: &Runnable) -> Result<&ServeWorkload> {
        match &runnable.workload {
            Workload::Serve(w) => Ok(w),
            _ => Err(wrong_workload(Self::NAME, runnable)),
        }
    }

    fn build_service(
        &self,
        runnable: &Runnable,
        workload: &ServeWorkload,
        deployment_name: &str,
    ) -> Result<Service> {
        if workload.service_ports.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "serve run {} declares no service ports",
                runnable.id
            )));
        }
        let builder = &self.deployments.context().builder;
        let ports: Vec<Value> = workload
            .service_ports
            .iter()
            .map(|p| {
                json!({
                    "name": format!("port-{}", p.port),
                    "port": p.port,
                    "targetPort": p.target_port,
                    "protocol": "TCP",
                })
            })
            .collect();

        from_json(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": builder.metadata(runnable, &ResourceNaming::service_name(runnable)),
            "spec": {
                "type": workload.service_type.as_str(),
                "selector": builder.workload_label(deployment_name),
                "ports": ports,
            },
        }))
    }

    fn services(&self) -> &dyn crate::cluster::ResourceApi<Service> {
        self.deployments.context().cluster.services.as_ref()
    }
}

fn service_summary(service: &Service) -> Value {
    let spec = service.spec.clone().unwrap_or_default();
    json!({
        "name": name_of(service),
        "type": spec.type_,
        "clusterIP": spec.cluster_ip,
        "ports": spec.ports.unwrap_or_default().iter().map(|p| json!({
            "port": p.port,
            "nodePort": p.node_port,
        })).collect::<Vec<_>>(),
    })
}

#[async_trait]
impl Framework for ServeFramework {
    type Object = ServeObject;

    const NAME: &'static str = "k8sserve";

    fn build(&self, runnable: &Runnable) -> Result<ServeObject> {
        let workload = Self::workload(runnable)?;
        let deployment = self
            .deployments
            .build_deployment(runnable, workload.replicas.unwrap_or(1))?;
        let service = self.build_service(runnable, workload, &name_of(&deployment))?;
        Ok(ServeObject {
            deployment,
            service,
        })
    }

    async fn create(&self, object: &ServeObject) -> Result<ServeObject> {
        let deployment = self.deployments.create(&object.deployment).await?;
        let service = create_or_get(self.services(), &object.service, "Service").await?;
        Ok(ServeObject {
            deployment,
            service,
        })
    }

    async fn apply(&self, object: &ServeObject) -> Result<ServeObject> {
        let deployment = self.deployments.apply(&object.deployment).await?;
        let service = create_or_replace(self.services(), &object.service, "Service").await?;
        Ok(ServeObject {
            deployment,
            service,
        })
    }

    async fn get(&self, object: &ServeObject) -> Result<ServeObject> {
        let deployment = self.deployments.get(&object.deployment).await?;
        let service = get_named(self.services(), &name_of(&object.service), "Service").await?;
        Ok(ServeObject {
            deployment,
            service,
        })
    }

    async fn delete(&self, object: &ServeObject) -> Result<()> {
        delete_named(self.services(), &name_of(&object.service), "Service").await?;
        self.deployments.delete(&object.deployment).await
    }

    fn observe(&self, object: &ServeObject, runnable: &mut Runnable) {
        self.deployments.observe(&object.deployment, runnable);
        self.deployments
            .context()
            .record(runnable, "service", service_summary(&object.service));
    }

    fn selector(&self, object: &ServeObject) -> String {
        self.deployments.selector(&object.deployment)
    }

    fn collectors(&self) -> &Collectors {
        self.deployments.collectors()
    }
}

#[async_trait]
impl RunnableFramework for ServeFramework {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        let ctx = self.deployments.context();
        let mut runnable = runnable.clone();

        ctx.ensure_init_config_map(&runnable).await?;
        ctx.ensure_run_secret(&runnable).await?;
        let created = self.create(&object).await?;
        let deployment = name_of(&created.deployment);
        let service = name_of(&created.service);

        runnable.state = RunState::Running;
        runnable.message = Some(format!("deployment {deployment} exposed by service {service}"));
        ctx.record(&mut runnable, "deployment", json!({ "name": deployment }));
        ctx.record(&mut runnable, "service", service_summary(&created.service));
        runnable.credentials.erase();

        info!(run_id = %runnable.id, framework = Self::NAME, deployment = %deployment, service = %service, "serve submitted");
        Ok(runnable)
    }

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.deployments
            .scale(&name_of(&object.deployment), 0)
            .await?;
        delete_named(self.services(), &name_of(&object.service), "Service").await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Stopped;
        runnable.message = Some(format!(
            "deployment {} scaled to 0, service removed",
            name_of(&object.deployment)
        ));
        info!(run_id = %runnable.id, framework = Self::NAME, "serve stopped");
        Ok(runnable)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.deployments.restore(&object.deployment).await?;
        let service = create_or_get(self.services(), &object.service, "Service").await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Running;
        runnable.message = Some(format!("deployment {} resumed", name_of(&object.deployment)));
        self.deployments
            .context()
            .record(&mut runnable, "service", service_summary(&service));
        info!(run_id = %runnable.id, framework = Self::NAME, "serve resumed");
        Ok(runnable)
    }

    async fn destroy(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.delete(&object).await?;
        let ctx = self.deployments.context();
        ctx.remove_companions(&runnable.id).await?;

        let mut runnable = runnable.clone();
        ctx.finish_destroy(&mut runnable);
        info!(run_id = %runnable.id, framework = Self::NAME, "serve deleted");
        Ok(runnable)
    }
}
