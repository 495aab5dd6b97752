//! Image builds with Kaniko.
//!
//! The Dockerfile and any source contexts travel in the init config map; the
//! init container copies them to `/shared`, which becomes the Kaniko build
//! context. The executor itself runs as a plain Job.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::json;
use tracing::info;

use super::builder::PodOptions;
use super::collectors::Collectors;
use super::job::job_status;
use super::naming::ResourceNaming;
use super::{
    create_or_replace, delete_named, get_named, name_of, wrong_workload, Framework, JobFramework,
    K8sContext, RunnableFramework,
};
use crate::cluster::Cluster;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::lifecycle::RunState;
use crate::model::{BuildWorkload, CoreVolume, Runnable, VolumeType, Workload};

const DOCKER_CONFIG_VOLUME: &str = "docker-config";
const DOCKER_CONFIG_MOUNT: &str = "/kaniko/.docker";

/// The Kaniko job and the config map carrying its build context.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildObject {
    pub config_map: ConfigMap,
    pub job: Job,
}

#[derive(Clone)]
pub struct BuildFramework {
    jobs: JobFramework,
    ctx: K8sContext,
}

impl BuildFramework {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self {
            jobs: JobFramework::new(cluster.clone(), config.clone()),
            ctx: K8sContext::new(cluster, config),
        }
    }

    fn workload(runnable: &Runnable) -> Result<(&BuildWorkload, &str)> {
        let Workload::Build(workload) = &runnable.workload else {
            return Err(wrong_workload(Self::NAME, runnable));
        };
        let destination = workload
            .destination
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("build run {} has no destination", runnable.id))
            })?;
        if workload.dockerfile.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "build run {} has an empty Dockerfile",
                runnable.id
            )));
        }
        Ok((workload, destination))
    }

    /// The runnable as the executor sees it: Kaniko image, build args and the
    /// registry credentials volume.
    fn executor(&self, runnable: &Runnable, destination: &str) -> Runnable {
        let build = &self.ctx.builder.config().build;
        let mut executor = runnable.clone();
        let container = &mut executor.container;

        container.image = build.image.clone();
        container.command = None;
        container.args = vec![
            "--dockerfile=/shared/Dockerfile".to_string(),
            "--context=dir:///shared".to_string(),
            format!("--destination={destination}"),
        ];
        container.args.extend(build.args.iter().cloned());

        let spec = json!({
            "secretName": build.credentials_secret,
            "items": [{"key": ".dockerconfigjson", "path": "config.json"}],
        });
        container.volumes.push(CoreVolume {
            volume_type: VolumeType::Secret,
            name: DOCKER_CONFIG_VOLUME.to_string(),
            mount_path: DOCKER_CONFIG_MOUNT.to_string(),
            spec: spec.as_object().cloned().unwrap_or_default(),
        });
        executor
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        create_or_replace(self.ctx.cluster.config_maps.as_ref(), config_map, "ConfigMap").await
    }
}

#[async_trait]
impl Framework for BuildFramework {
    type Object = BuildObject;

    const NAME: &'static str = "k8sbuild";

    fn build(&self, runnable: &Runnable) -> Result<BuildObject> {
        let (workload, destination) = Self::workload(runnable)?;
        let config_map = self.ctx.builder.init_config_map(
            runnable,
            BTreeMap::from([("Dockerfile".to_string(), workload.dockerfile.clone())]),
        )?;

        let name = ResourceNaming::build_job_name(runnable);
        let job = self.jobs.build_job(
            &self.executor(runnable, destination),
            workload.backoff_limit,
            PodOptions {
                workload_name: &name,
                restart_policy: "Never",
                force_init: true,
                init_image: Some(self.ctx.builder.config().build.init_image.as_str()),
            },
        )?;
        Ok(BuildObject { config_map, job })
    }

    async fn create(&self, object: &BuildObject) -> Result<BuildObject> {
        let config_map = self.apply_config_map(&object.config_map).await?;
        let job = self.jobs.create(&object.job).await?;
        Ok(BuildObject { config_map, job })
    }

    async fn apply(&self, object: &BuildObject) -> Result<BuildObject> {
        let config_map = self.apply_config_map(&object.config_map).await?;
        let job = self.jobs.apply(&object.job).await?;
        Ok(BuildObject { config_map, job })
    }

    async fn get(&self, object: &BuildObject) -> Result<BuildObject> {
        let job = self.jobs.get(&object.job).await?;
        let config_map = get_named(
            self.ctx.cluster.config_maps.as_ref(),
            &name_of(&object.config_map),
            "ConfigMap",
        )
        .await?;
        Ok(BuildObject { config_map, job })
    }

    async fn delete(&self, object: &BuildObject) -> Result<()> {
        self.jobs.delete(&object.job).await?;
        delete_named(
            self.ctx.cluster.config_maps.as_ref(),
            &name_of(&object.config_map),
            "ConfigMap",
        )
        .await
    }

    fn observe(&self, object: &BuildObject, runnable: &mut Runnable) {
        let (state, message, summary) = job_status(&object.job);
        runnable.state = state;
        if state == RunState::Error {
            runnable.error.clone_from(&message);
        }
        if message.is_some() {
            runnable.message = message;
        }
        self.ctx.record(runnable, "job", summary);

        if state == RunState::Completed {
            if let Workload::Build(BuildWorkload {
                destination: Some(destination),
                ..
            }) = &runnable.workload
            {
                let image = json!({ "destination": destination });
                self.ctx.record(runnable, "image", image);
            }
        }
    }

    fn selector(&self, object: &BuildObject) -> String {
        self.jobs.selector(&object.job)
    }

    fn collectors(&self) -> &Collectors {
        &self.ctx.collectors
    }
}

#[async_trait]
impl RunnableFramework for BuildFramework {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        let (_, destination) = Self::workload(runnable)?;
        let mut runnable = runnable.clone();

        self.ctx.ensure_run_secret(&runnable).await?;
        let created = self.create(&object).await?;
        let name = name_of(&created.job);

        runnable.state = RunState::Running;
        runnable.message = Some(format!("build job {name} created, pushing {destination}"));
        self.ctx.record(&mut runnable, "job", json!({ "name": name }));
        runnable.credentials.erase();

        info!(run_id = %runnable.id, framework = Self::NAME, job = %name, destination, "image build submitted");
        Ok(runnable)
    }

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.jobs.delete(&object.job).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Stopped;
        runnable.message = Some(format!("build job {} stopped", name_of(&object.job)));
        Ok(runnable)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.create(&object).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Running;
        runnable.message = Some(format!("build job {} resumed", name_of(&object.job)));
        Ok(runnable)
    }

    async fn destroy(&self, runnable: &Runnable) -> Result<Runnable> {
        let object = self.build(runnable)?;
        self.delete(&object).await?;
        self.ctx.remove_companions(&runnable.id).await?;

        let mut runnable = runnable.clone();
        self.ctx.finish_destroy(&mut runnable);
        info!(run_id = %runnable.id, framework = Self::NAME, "image build deleted");
        Ok(runnable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frameworks::builder::tests::runnable;
    use crate::frameworks::tests::context;
    use k8s_openapi::api::batch::v1::JobStatus;

    const DESTINATION: &str = "registry.local/runs-hello:r1";

    fn build_runnable(destination: Option<&str>) -> Runnable {
        let mut r = runnable();
        r.task = "build".into();
        r.workload = Workload::Build(BuildWorkload {
            dockerfile: "FROM python:3.12\nRUN pip install numpy\n".into(),
            backoff_limit: Some(0),
            destination: destination.map(ToString::to_string),
        });
        r
    }

    #[test]
    fn destination_is_required() {
        let (memory, config) = context();
        let framework = BuildFramework::new(memory.cluster("runs"), config);
        assert!(matches!(
            framework.build(&build_runnable(None)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn executor_job_mounts_context_and_credentials() {
        let (memory, config) = context();
        let framework = BuildFramework::new(memory.cluster("runs"), config);

        let object = framework.build(&build_runnable(Some(DESTINATION))).unwrap();

        assert_eq!(
            object.config_map.data.as_ref().unwrap()["Dockerfile"],
            "FROM python:3.12\nRUN pip install numpy\n"
        );
        assert_eq!(object.job.metadata.name.as_deref(), Some("b-containerbuild-r1"));

        let pod = object.job.spec.unwrap().template.spec.unwrap();
        let main = &pod.containers[0];
        assert_eq!(
            main.image.as_deref(),
            Some("gcr.io/kaniko-project/executor:latest")
        );
        assert_eq!(main.command, None);
        let args = main.args.clone().unwrap();
        assert!(args.contains(&format!("--destination={DESTINATION}")));
        assert!(args.contains(&"--context=dir:///shared".to_string()));

        let init = &pod.init_containers.unwrap()[0];
        assert_eq!(init.image.as_deref(), Some("ghcr.io/5dlabs/run-init:latest"));

        let volumes = pod.volumes.unwrap();
        let docker = volumes.iter().find(|v| v.name == "docker-config").unwrap();
        assert_eq!(
            docker.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("registry-credentials")
        );
        assert!(volumes.iter().any(|v| v.name == "shared-dir"));
        assert_eq!(memory.calls(), 0);
    }

    #[tokio::test]
    async fn run_creates_config_map_then_job() {
        let (memory, config) = context();
        let framework = BuildFramework::new(memory.cluster("runs"), config);

        let out = framework.run(&build_runnable(Some(DESTINATION))).await.unwrap();

        assert_eq!(out.state, RunState::Running);
        assert!(memory.config_maps.object("init-config-map-r1").is_some());
        assert!(memory.jobs.object("b-containerbuild-r1").is_some());
    }

    #[test]
    fn completion_records_pushed_image() {
        let (memory, config) = context();
        let framework = BuildFramework::new(memory.cluster("runs"), config);
        let r = build_runnable(Some(DESTINATION));
        let mut object = framework.build(&r).unwrap();
        object.job.status = Some(JobStatus {
            succeeded: Some(1),
            ..JobStatus::default()
        });

        let mut out = r.clone();
        framework.observe(&object, &mut out);

        assert_eq!(out.state, RunState::Completed);
        assert_eq!(out.results["image"]["destination"], DESTINATION);
    }

    #[tokio::test]
    async fn destroy_cleans_everything() {
        let (memory, config) = context();
        let framework = BuildFramework::new(memory.cluster("runs"), config);
        let running = framework.run(&build_runnable(Some(DESTINATION))).await.unwrap();

        let deleted = framework.destroy(&running).await.unwrap();

        assert_eq!(deleted.state, RunState::Deleted);
        assert!(memory.jobs.is_empty());
        assert!(memory.config_maps.is_empty());
    }
}
