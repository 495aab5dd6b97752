use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::specs::{
    BuildTaskSpec, ContainerFunctionSpec, ContainerRunSpec, DeployTaskSpec, JobTaskSpec,
    K8sTaskSpec, ServeTaskSpec,
};
use super::{BUILD_TASK, DEPLOY_TASK, JOB_TASK, RUNTIME, SERVE_TASK};
use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::frameworks::naming::ResourceNaming;
use crate::lifecycle::RunState;
use crate::model::{
    BuildWorkload, ContainerTemplate, ContextRef, ContextSource, CoreEnv, CronJobWorkload,
    DeploymentWorkload, JobWorkload, Run, Runnable, ServeWorkload, Workload,
};
use crate::runtime::{parse_spec, Runner};

/// What every container runner starts from: the function spec and args
/// carried by the built run, and the resolved project secrets.
#[derive(Debug, Clone)]
pub struct ContainerBase {
    function: ContainerFunctionSpec,
    args: Vec<String>,
    secrets: BTreeMap<String, BTreeSet<String>>,
    label_prefix: String,
}

impl ContainerBase {
    pub fn new(
        spec: ContainerRunSpec,
        secrets: BTreeMap<String, BTreeSet<String>>,
        label_prefix: impl Into<String>,
    ) -> Self {
        Self {
            function: spec.function_spec,
            args: spec.args,
            secrets,
            label_prefix: label_prefix.into(),
        }
    }

    /// Container template from the function and the Kubernetes part of the
    /// task. `image` overrides the function image when set.
    fn template(&self, run: &Run, k8s: &K8sTaskSpec, image: Option<String>) -> Result<ContainerTemplate> {
        let image = image
            .or_else(|| self.function.image.clone())
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| {
                Error::InvalidSpec(format!("run {} has no function image", run.id))
            })?;
        let function = run.task_ref()?.function;

        let mut envs = vec![
            CoreEnv::new("PROJECT_NAME", &run.project),
            CoreEnv::new("RUN_ID", &run.id),
        ];
        envs.extend(k8s.envs.iter().cloned());

        let mut labels = k8s.labels.clone();
        labels.insert(format!("{}/function", self.label_prefix), function);

        let (context_refs, context_sources) = self.contexts();

        Ok(ContainerTemplate {
            image,
            command: self.function.command.clone(),
            args: self.args.clone(),
            envs,
            secrets: self.secrets.clone(),
            resources: k8s.resources.clone(),
            volumes: k8s.volumes.clone(),
            node_selector: k8s.node_selector.clone(),
            affinity: k8s.affinity.clone(),
            tolerations: k8s.tolerations.clone(),
            runtime_class: k8s.runtime_class.clone(),
            priority_class: k8s.priority_class.clone(),
            run_as_user: k8s.run_as_user,
            run_as_group: k8s.run_as_group,
            fs_group: k8s.fs_group,
            labels,
            template: k8s.profile.clone(),
            context_refs,
            context_sources,
        })
    }

    /// A source with a URI scheme is fetched by reference; a plain path is
    /// shipped inline when base64 content is present.
    fn contexts(&self) -> (Vec<ContextRef>, Vec<ContextSource>) {
        let Some(source) = &self.function.source else {
            return (Vec::new(), Vec::new());
        };
        let Some(path) = source.source.as_deref().filter(|s| !s.trim().is_empty()) else {
            return (Vec::new(), Vec::new());
        };

        if let Some(reference) = ContextRef::from_uri(path) {
            return (vec![reference], Vec::new());
        }
        match source.base64.as_deref().filter(|b| !b.is_empty()) {
            Some(base64) => {
                let name = path.rsplit('/').next().unwrap_or(path).to_string();
                (
                    Vec::new(),
                    vec![ContextSource {
                        name,
                        base64: base64.to_string(),
                    }],
                )
            }
            None => {
                debug!(source = path, "source has no scheme and no content, skipping");
                (Vec::new(), Vec::new())
            }
        }
    }

    fn runnable(run: &Run, task: &str, container: ContainerTemplate, workload: Workload) -> Runnable {
        Runnable {
            id: run.id.clone(),
            project: run.project.clone(),
            runtime: RUNTIME.to_string(),
            task: task.to_string(),
            state: RunState::Ready,
            container,
            workload,
            ..Runnable::default()
        }
    }
}

/// `job` task: a Job, or a CronJob when the task carries a schedule.
pub struct ContainerJobRunner {
    base: ContainerBase,
}

impl ContainerJobRunner {
    pub fn new(base: ContainerBase) -> Self {
        Self { base }
    }
}

impl Runner for ContainerJobRunner {
    fn produce(&self, run: &Run) -> Result<Runnable> {
        let task: JobTaskSpec = parse_spec(&run.spec, "job task spec")?;
        let container = self.base.template(run, &task.k8s, None)?;

        let workload = match task.schedule.filter(|s| !s.trim().is_empty()) {
            Some(schedule) => Workload::CronJob(CronJobWorkload {
                schedule,
                backoff_limit: task.backoff_limit,
            }),
            None => Workload::Job(JobWorkload {
                backoff_limit: task.backoff_limit,
            }),
        };
        Ok(ContainerBase::runnable(run, JOB_TASK, container, workload))
    }
}

/// `deploy` task: a Deployment.
pub struct ContainerDeployRunner {
    base: ContainerBase,
}

impl ContainerDeployRunner {
    pub fn new(base: ContainerBase) -> Self {
        Self { base }
    }
}

impl Runner for ContainerDeployRunner {
    fn produce(&self, run: &Run) -> Result<Runnable> {
        let task: DeployTaskSpec = parse_spec(&run.spec, "deploy task spec")?;
        let container = self.base.template(run, &task.k8s, None)?;
        let workload = Workload::Deployment(DeploymentWorkload {
            replicas: task.replicas,
        });
        Ok(ContainerBase::runnable(run, DEPLOY_TASK, container, workload))
    }
}

/// `serve` task: a Deployment exposed through a Service.
pub struct ContainerServeRunner {
    base: ContainerBase,
}

impl ContainerServeRunner {
    pub fn new(base: ContainerBase) -> Self {
        Self { base }
    }
}

impl Runner for ContainerServeRunner {
    fn produce(&self, run: &Run) -> Result<Runnable> {
        let task: ServeTaskSpec = parse_spec(&run.spec, "serve task spec")?;
        if task.service_ports.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "serve run {} declares no service ports",
                run.id
            )));
        }
        let container = self.base.template(run, &task.k8s, None)?;
        let workload = Workload::Serve(ServeWorkload {
            replicas: task.replicas,
            service_ports: task.service_ports,
            service_type: task.service_type,
        });
        Ok(ContainerBase::runnable(run, SERVE_TASK, container, workload))
    }
}

/// `build` task: a Kaniko build of the function's base image plus the task
/// instructions, pushed to the configured registry.
pub struct ContainerBuildRunner {
    base: ContainerBase,
    build: BuildConfig,
}

impl ContainerBuildRunner {
    pub fn new(base: ContainerBase, build: BuildConfig) -> Self {
        Self { base, build }
    }

    /// `<registry>/<prefix>-<image>:<run id>`.
    pub fn destination(&self, run: &Run) -> Result<String> {
        let name = match self.base.function.image.as_deref().map(strip_tag) {
            Some(image) if image.len() > 3 => ResourceNaming::sanitize(image),
            _ => {
                let function = run.task_ref()?.function;
                ResourceNaming::sanitize(&format!("{}-{function}", run.project))
            }
        };
        Ok(format!(
            "{}/{}-{name}:{}",
            self.build.image_registry.trim_end_matches('/'),
            self.build.image_prefix,
            run.id
        ))
    }
}

impl Runner for ContainerBuildRunner {
    fn produce(&self, run: &Run) -> Result<Runnable> {
        let task: BuildTaskSpec = parse_spec(&run.spec, "build task spec")?;
        let function = &self.base.function;
        let base_image = function
            .base_image
            .clone()
            .or_else(|| function.image.clone())
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| Error::InvalidSpec(format!("build run {} has no base image", run.id)))?;

        let container = self.base.template(run, &task.k8s, Some(base_image.clone()))?;
        let dockerfile = dockerfile(&base_image, &task.instructions, container.has_context());
        let destination = self.destination(run)?;
        debug!(run_id = %run.id, destination = %destination, "prepared image build");

        let workload = Workload::Build(BuildWorkload {
            dockerfile,
            backoff_limit: task.backoff_limit,
            destination: Some(destination),
        });
        Ok(ContainerBase::runnable(run, BUILD_TASK, container, workload))
    }
}

fn strip_tag(image: &str) -> &str {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].find(':') {
        Some(i) => &image[..name_start + i],
        None => image,
    }
}

fn dockerfile(base_image: &str, instructions: &[String], with_context: bool) -> String {
    let mut lines = vec![format!("FROM {base_image}")];
    if with_context {
        lines.push("COPY . /shared".to_string());
    }
    lines.push("WORKDIR /shared".to_string());
    lines.extend(instructions.iter().map(|i| format!("RUN {i}")));
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::ServiceType;
    use crate::runtime::container::specs::SourceCode;

    fn run(task: &str, spec: serde_json::Value) -> Run {
        let mut run = Run::new(
            "demo",
            "container+run",
            format!("container+{task}://demo/hello:v1"),
            spec.as_object().cloned().unwrap_or_default(),
        );
        run.id = "r1".into();
        run
    }

    fn base(function: ContainerFunctionSpec, args: &[&str]) -> ContainerBase {
        ContainerBase::new(
            ContainerRunSpec {
                function_spec: function,
                args: args.iter().map(ToString::to_string).collect(),
            },
            BTreeMap::from([("db".to_string(), BTreeSet::from(["password".to_string()]))]),
            "runs.5dlabs.ai",
        )
    }

    fn image(image: &str) -> ContainerFunctionSpec {
        ContainerFunctionSpec {
            image: Some(image.into()),
            command: Some("python".into()),
            ..ContainerFunctionSpec::default()
        }
    }

    #[test]
    fn job_runnable_is_ready_with_function_image() {
        let run = run("job", json!({"envs": [{"name": "MODE", "value": "batch"}], "backoff_limit": 2}));
        let runnable = ContainerJobRunner::new(base(image("python:3.12"), &["main.py"]))
            .produce(&run)
            .unwrap();

        assert_eq!(runnable.state, RunState::Ready);
        assert_eq!(runnable.framework(), "k8sjob");
        assert_eq!(runnable.runtime, "container");
        assert_eq!(runnable.task, "job");
        assert_eq!(runnable.container.image, "python:3.12");
        assert_eq!(runnable.container.command.as_deref(), Some("python"));
        assert_eq!(runnable.container.args, vec!["main.py"]);
        assert_eq!(
            runnable.container.envs,
            vec![
                CoreEnv::new("PROJECT_NAME", "demo"),
                CoreEnv::new("RUN_ID", "r1"),
                CoreEnv::new("MODE", "batch"),
            ]
        );
        assert_eq!(runnable.container.labels["runs.5dlabs.ai/function"], "hello");
        assert!(runnable.container.secrets.contains_key("db"));
        assert_eq!(
            runnable.workload,
            Workload::Job(JobWorkload {
                backoff_limit: Some(2)
            })
        );
    }

    #[test]
    fn schedule_turns_job_into_cron_job() {
        let run = run("job", json!({"schedule": "*/5 * * * *"}));
        let runnable = ContainerJobRunner::new(base(image("alpine"), &[]))
            .produce(&run)
            .unwrap();
        assert_eq!(runnable.framework(), "k8scronjob");
    }

    #[test]
    fn missing_image_is_invalid_spec() {
        let run = run("job", json!({}));
        let err = ContainerJobRunner::new(base(ContainerFunctionSpec::default(), &[]))
            .produce(&run)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn serve_requires_ports() {
        let runner = ContainerServeRunner::new(base(image("nginx"), &[]));
        assert!(runner.produce(&run("serve", json!({}))).is_err());

        let runnable = runner
            .produce(&run(
                "serve",
                json!({"replicas": 2, "service_ports": [{"port": 80, "target_port": 8080}]}),
            ))
            .unwrap();
        let Workload::Serve(serve) = runnable.workload else {
            panic!("expected serve workload");
        };
        assert_eq!(serve.replicas, Some(2));
        assert_eq!(serve.service_type, ServiceType::NodePort);
    }

    #[test]
    fn deploy_keeps_replicas() {
        let runnable = ContainerDeployRunner::new(base(image("nginx"), &[]))
            .produce(&run("deploy", json!({"replicas": 3})))
            .unwrap();
        assert_eq!(
            runnable.workload,
            Workload::Deployment(DeploymentWorkload { replicas: Some(3) })
        );
    }

    #[test]
    fn sources_become_contexts() {
        let mut function = image("python:3.12");
        function.source = Some(SourceCode {
            source: Some("git://github.com/org/repo".into()),
            ..SourceCode::default()
        });
        let with_ref = ContainerJobRunner::new(base(function.clone(), &[]))
            .produce(&run("job", json!({})))
            .unwrap();
        assert_eq!(with_ref.container.context_refs[0].destination, "repo");

        function.source = Some(SourceCode {
            source: Some("src/main.py".into()),
            base64: Some("cHJpbnQoJ2hpJyk=".into()),
            lang: Some("python".into()),
        });
        let inline = ContainerJobRunner::new(base(function, &[]))
            .produce(&run("job", json!({})))
            .unwrap();
        assert_eq!(inline.container.context_sources[0].name, "main.py");
        assert!(inline.container.context_refs.is_empty());
    }

    #[test]
    fn build_generates_dockerfile_and_destination() {
        let mut function = image("ghcr.io/org/app:1.0");
        function.base_image = Some("python:3.12-slim".into());
        let runner = ContainerBuildRunner::new(base(function, &[]), BuildConfig::default());

        let runnable = runner
            .produce(&run("build", json!({"instructions": ["pip install numpy"]})))
            .unwrap();

        let Workload::Build(build) = &runnable.workload else {
            panic!("expected build workload");
        };
        assert_eq!(
            build.dockerfile,
            "FROM python:3.12-slim\nWORKDIR /shared\nRUN pip install numpy\n"
        );
        assert_eq!(
            build.destination.as_deref(),
            Some("registry.local/runs-ghcr-io-org-app:r1")
        );
        assert_eq!(runnable.framework(), "k8sbuild");
    }

    #[test]
    fn build_destination_falls_back_to_function_name() {
        let mut function = ContainerFunctionSpec::default();
        function.base_image = Some("alpine".into());
        let runner = ContainerBuildRunner::new(base(function, &[]), BuildConfig::default());
        assert_eq!(
            runner.destination(&run("build", json!({}))).unwrap(),
            "registry.local/runs-demo-hello:r1"
        );
    }

    #[test]
    fn strips_tags_but_not_registry_ports() {
        assert_eq!(strip_tag("python:3.12"), "python");
        assert_eq!(strip_tag("localhost:5000/app"), "localhost:5000/app");
        assert_eq!(strip_tag("localhost:5000/app:v2"), "localhost:5000/app");
    }
}
