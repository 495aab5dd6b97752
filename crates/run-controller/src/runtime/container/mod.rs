//! The `container` runtime: runs a user image as a Job, CronJob, Deployment,
//! served Deployment, or builds a new image from it.

mod runners;
pub mod specs;

pub use runners::{
    ContainerBase, ContainerBuildRunner, ContainerDeployRunner, ContainerJobRunner,
    ContainerServeRunner,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{
    check_run_kind, merge_specs, parse_spec, ConfigurationService, CredentialsService,
    EntityName, EntityService, Runner, Runtime, SecretService, SpecRegistry,
};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::model::{BuildWorkload, Function, Run, Runnable, SpecMap, Task, Workload};
use specs::{
    BuildTaskSpec, ContainerFunctionSpec, ContainerRunSpec, DeployTaskSpec, JobTaskSpec,
    K8sTaskSpec, ServeTaskSpec,
};

pub const RUNTIME: &str = "container";
pub const RUN_KIND: &str = "container+run";

pub(crate) const JOB_TASK: &str = "job";
pub(crate) const DEPLOY_TASK: &str = "deploy";
pub(crate) const SERVE_TASK: &str = "serve";
pub(crate) const BUILD_TASK: &str = "build";

const TASKS: [&str; 4] = [JOB_TASK, DEPLOY_TASK, SERVE_TASK, BUILD_TASK];

/// Key the function spec is attached under in the effective run spec.
const FUNCTION_SPEC: &str = "function_spec";

pub struct ContainerRuntime {
    config: Arc<ControllerConfig>,
    specs: SpecRegistry,
    entities: Arc<dyn EntityService>,
    secrets: Arc<dyn SecretService>,
    credentials: Arc<dyn CredentialsService>,
    configuration: Arc<dyn ConfigurationService>,
}

impl ContainerRuntime {
    pub fn new(
        config: Arc<ControllerConfig>,
        entities: Arc<dyn EntityService>,
        secrets: Arc<dyn SecretService>,
        credentials: Arc<dyn CredentialsService>,
        configuration: Arc<dyn ConfigurationService>,
    ) -> Self {
        let mut specs = SpecRegistry::new();
        Self::register_specs(&mut specs);
        Self {
            config,
            specs,
            entities,
            secrets,
            credentials,
            configuration,
        }
    }

    /// Spec types of this runtime, one per `(kind, entity)`.
    pub fn register_specs(registry: &mut SpecRegistry) {
        registry.register_type::<ContainerFunctionSpec>(RUNTIME, RUNTIME, EntityName::Function);
        registry.register_type::<JobTaskSpec>(RUNTIME, &task_kind(JOB_TASK), EntityName::Task);
        registry.register_type::<DeployTaskSpec>(RUNTIME, &task_kind(DEPLOY_TASK), EntityName::Task);
        registry.register_type::<ServeTaskSpec>(RUNTIME, &task_kind(SERVE_TASK), EntityName::Task);
        registry.register_type::<BuildTaskSpec>(RUNTIME, &task_kind(BUILD_TASK), EntityName::Task);
        registry.register_type::<ContainerRunSpec>(RUNTIME, RUN_KIND, EntityName::Run);
    }

    fn task_name(kind: &str) -> Result<&str> {
        kind.strip_prefix("container+")
            .filter(|task| TASKS.contains(task))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "task kind {kind} not recognized by the {RUNTIME} runtime"
                ))
            })
    }

    async fn secrets_for(&self, run: &Run) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let k8s: K8sTaskSpec = parse_spec(&run.spec, "task spec")?;
        if k8s.secrets.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.secrets.secret_data(&run.project, &k8s.secrets).await
    }
}

fn task_kind(task: &str) -> String {
    format!("{RUNTIME}+{task}")
}

#[async_trait]
impl Runtime for ContainerRuntime {
    fn name(&self) -> &'static str {
        RUNTIME
    }

    fn run_kind(&self) -> &'static str {
        RUN_KIND
    }

    fn build(&self, function: &Function, task: &Task, run: &Run) -> Result<SpecMap> {
        check_run_kind(self, run)?;
        Self::task_name(&task.kind)?;

        self.specs
            .validate(RUNTIME, RUNTIME, EntityName::Function, &function.spec)?;
        self.specs
            .validate(RUNTIME, &task.kind, EntityName::Task, &task.spec)?;
        self.specs
            .validate(RUNTIME, RUN_KIND, EntityName::Run, &run.spec)?;

        let mut effective = merge_specs(&run.spec, &task.spec);
        effective.insert(FUNCTION_SPEC.to_string(), Value::Object(function.spec.clone()));
        debug!(run_id = %run.id, task = %task.kind, "built effective run spec");
        Ok(effective)
    }

    #[instrument(skip_all, fields(run_id = %run.id, task = %run.task))]
    async fn run(&self, run: &Run) -> Result<Runnable> {
        check_run_kind(self, run)?;
        let task = run.task_ref()?;
        Self::task_name(&task.kind())?;

        let spec: ContainerRunSpec = parse_spec(&run.spec, "run spec")?;
        let base = ContainerBase::new(
            spec,
            self.secrets_for(run).await?,
            self.config.labels.prefix.clone(),
        );

        let runner: Box<dyn Runner> = match task.task.as_str() {
            JOB_TASK => Box::new(ContainerJobRunner::new(base)),
            DEPLOY_TASK => Box::new(ContainerDeployRunner::new(base)),
            SERVE_TASK => Box::new(ContainerServeRunner::new(base)),
            BUILD_TASK => Box::new(ContainerBuildRunner::new(base, self.config.build.clone())),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "no {RUNTIME} runner for task {other}"
                )))
            }
        };

        let mut runnable = runner.produce(run)?;
        runnable.credentials = self.credentials.credentials(run).await?;
        runnable.configurations = self.configuration.configurations();
        info!(framework = runnable.framework(), "produced runnable");
        Ok(runnable)
    }

    async fn on_complete(&self, run: &Run, runnable: &Runnable) -> Result<()> {
        let Workload::Build(BuildWorkload {
            destination: Some(image),
            ..
        }) = &runnable.workload
        else {
            return Ok(());
        };

        let task = run.task_ref()?;
        let mut function = self.entities.function(&task).await?;
        let current = function.spec.get("image").and_then(Value::as_str);
        if current == Some(image.as_str()) {
            debug!(run_id = %run.id, function = %function.name, "function already uses built image");
            return Ok(());
        }

        function
            .spec
            .insert("image".to_string(), Value::String(image.clone()));
        let function = self.entities.update_function(function).await?;
        info!(run_id = %run.id, function = %function.name, image = %image, "function updated to built image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::lifecycle::RunState;
    use crate::model::Credentials;
    use crate::runtime::{
        InMemoryEntities, MockSecretService, StaticConfiguration, StaticCredentials,
    };

    fn map(value: Value) -> SpecMap {
        value.as_object().cloned().unwrap_or_default()
    }

    fn function() -> Function {
        Function {
            id: "f1".into(),
            project: "demo".into(),
            name: "hello".into(),
            kind: RUNTIME.into(),
            spec: map(json!({"image": "python:3.12", "command": "python"})),
        }
    }

    fn task(kind: &str, spec: Value) -> Task {
        Task {
            id: "t1".into(),
            project: "demo".into(),
            kind: kind.into(),
            spec: map(spec),
        }
    }

    fn run(task: &str, spec: Value) -> Run {
        Run::new("demo", RUN_KIND, format!("container+{task}://demo/hello"), map(spec))
    }

    fn runtime_with(entities: Arc<InMemoryEntities>, secrets: MockSecretService) -> ContainerRuntime {
        ContainerRuntime::new(
            Arc::new(ControllerConfig::default()),
            entities,
            Arc::new(secrets),
            Arc::new(StaticCredentials::new(Credentials::new(BTreeMap::from([(
                "TOKEN".to_string(),
                "abc".to_string(),
            )])))),
            Arc::new(StaticConfiguration::new(BTreeMap::from([(
                "PLATFORM".to_string(),
                "test".to_string(),
            )]))),
        )
    }

    fn runtime() -> ContainerRuntime {
        runtime_with(Arc::new(InMemoryEntities::new()), MockSecretService::new())
    }

    #[test]
    fn run_spec_wins_over_task_spec() {
        let runtime = runtime();
        let effective = runtime
            .build(
                &function(),
                &task("container+job", json!({"args": ["--slow"], "backoff_limit": 3})),
                &run("job", json!({"args": ["--fast"]})),
            )
            .unwrap();

        assert_eq!(effective["args"], json!(["--fast"]));
        assert_eq!(effective["backoff_limit"], json!(3));
        assert_eq!(effective[FUNCTION_SPEC]["image"], "python:3.12");
    }

    #[test]
    fn function_spec_is_never_overridden() {
        let effective = runtime()
            .build(
                &function(),
                &task("container+job", json!({})),
                &run("job", json!({"function_spec": {"image": "evil"}})),
            )
            .unwrap();
        assert_eq!(effective[FUNCTION_SPEC]["image"], "python:3.12");
    }

    #[test]
    fn unknown_task_kind_is_rejected() {
        let err = runtime()
            .build(&function(), &task("container+spark", json!({})), &run("job", json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn foreign_run_kind_is_rejected() {
        let mut run = run("job", json!({}));
        run.kind = "python+run".into();
        let err = runtime()
            .build(&function(), &task("container+job", json!({})), &run)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn malformed_task_spec_is_invalid() {
        let err = runtime()
            .build(
                &function(),
                &task("container+serve", json!({"replicas": "many"})),
                &run("serve", json!({})),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn job_run_produces_ready_runnable() {
        let mut secrets = MockSecretService::new();
        secrets
            .expect_secret_data()
            .withf(|project, names| project == "demo" && names.contains("db"))
            .times(1)
            .returning(|_, _| {
                Ok(BTreeMap::from([(
                    "db".to_string(),
                    BTreeSet::from(["password".to_string()]),
                )]))
            });
        let runtime = runtime_with(Arc::new(InMemoryEntities::new()), secrets);

        let mut run = run("job", json!({}));
        run.spec = runtime
            .build(
                &function(),
                &task("container+job", json!({"args": ["main.py"], "secrets": ["db"]})),
                &run,
            )
            .unwrap();

        let runnable = runtime.run(&run).await.unwrap();

        assert_eq!(runnable.id, run.id);
        assert_eq!(runnable.state, RunState::Ready);
        assert_eq!(runnable.framework(), "k8sjob");
        assert_eq!(runnable.container.image, "python:3.12");
        assert_eq!(runnable.container.command.as_deref(), Some("python"));
        assert_eq!(runnable.container.args, vec!["main.py"]);
        assert!(runnable.container.secrets.contains_key("db"));
        assert_eq!(runnable.credentials.get("TOKEN"), Some("abc"));
        assert_eq!(runnable.configurations["PLATFORM"], "test");
    }

    #[tokio::test]
    async fn build_completion_updates_function_image_once() {
        let entities = Arc::new(InMemoryEntities::new());
        entities.insert_function(function());
        let runtime = runtime_with(entities.clone(), MockSecretService::new());

        let run = run("build", json!({}));
        let runnable = Runnable {
            id: run.id.clone(),
            workload: Workload::Build(BuildWorkload {
                dockerfile: "FROM python:3.12\n".into(),
                backoff_limit: None,
                destination: Some("registry.local/runs-demo-hello:r1".into()),
            }),
            ..Runnable::default()
        };

        runtime.on_complete(&run, &runnable).await.unwrap();
        runtime.on_complete(&run, &runnable).await.unwrap();

        let updated = entities.function_named("demo", "hello").unwrap();
        assert_eq!(updated.spec["image"], "registry.local/runs-demo-hello:r1");
        assert_eq!(updated.spec["command"], "python");
    }

    #[tokio::test]
    async fn completion_of_other_workloads_is_a_no_op() {
        let runtime = runtime();
        let runnable = Runnable::default();
        runtime
            .on_complete(&run("job", json!({})), &runnable)
            .await
            .unwrap();
    }
}
