use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use serde_json::json;
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
use crate::error::Result;
use crate::lifecycle::RunState;
use crate::model::{Runnable, Workload};

/// Run-to-completion workloads on `batch/v1` Jobs.
#[derive(Clone)]
pub struct JobFramework {
    ctx: K8sContext,
}

impl JobFramework {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self {
            ctx: K8sContext::new(cluster, config),
        }
    }

    /// Job manifest for any runnable; also used by the build framework.
    pub(crate) fn build_job(
        &self,
        runnable: &Runnable,
        backoff_limit: Option<i32>,
        options: PodOptions<'_>,
    ) -> Result<Job> {
        let template = self.ctx.builder.pod_template(runnable, options)?;
        let mut spec = json!({ "template": template });
        if let Some(limit) = backoff_limit {
            spec["backoffLimit"] = json!(limit);
        }
        from_json(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": self.ctx.builder.metadata(runnable, options.workload_name),
            "spec": spec,
        }))
    }
}

/// State, message and result summary for a Job.
pub(crate) fn job_status(job: &Job) -> (RunState, Option<String>, serde_json::Value) {
    let status = job.status.clone().unwrap_or_default();
    let conditions = status.conditions.clone().unwrap_or_default();
    let flattened = || {
        conditions.iter().map(|c| {
            (
                c.type_.as_str(),
                c.status.as_str(),
                c.reason.as_deref(),
                c.message.as_deref(),
            )
        })
    };

    let (state, message) = if let Some(message) = true_condition(flattened(), &["Failed"]) {
        (RunState::Error, Some(message))
    } else if true_condition(flattened(), &["Complete", "SuccessCriteriaMet"]).is_some()
        || status.succeeded.unwrap_or(0) > 0 && status.active.unwrap_or(0) == 0
    {
        (RunState::Completed, Some("job completed".to_string()))
    } else {
        (RunState::Running, None)
    };

    let summary = json!({
        "name": name_of(job),
        "active": status.active.unwrap_or(0),
        "succeeded": status.succeeded.unwrap_or(0),
        "failed": status.failed.unwrap_or(0),
        "startTime": status.start_time,
        "completionTime": status.completion_time,
    });
    (state, message, summary)
}

#[async_trait]
impl Framework for JobFramework {
    type Object = Job;

    const NAME: &'static str = "k8sjob";

    fn build(&self, runnable: &Runnable) -> Result<Job> {
        let Workload::Job(workload) = &runnable.workload else {
            return Err(wrong_workload(Self::NAME, runnable));
        };
        let name = ResourceNaming::job_name(runnable);
        self.build_job(
            runnable,
            workload.backoff_limit,
            PodOptions {
                workload_name: &name,
                restart_policy: "Never",
                force_init: false,
                init_image: None,
            },
        )
    }

    async fn create(&self, job: &Job) -> Result<Job> {
        create_or_get(self.ctx.cluster.jobs.as_ref(), job, "Job").await
    }

    async fn apply(&self, job: &Job) -> Result<Job> {
        create_or_replace(self.ctx.cluster.jobs.as_ref(), job, "Job").await
    }

    async fn get(&self, job: &Job) -> Result<Job> {
        get_named(self.ctx.cluster.jobs.as_ref(), &name_of(job), "Job").await
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        delete_named(self.ctx.cluster.jobs.as_ref(), &name_of(job), "Job").await
    }

    fn observe(&self, job: &Job, runnable: &mut Runnable) {
        let (state, message, summary) = job_status(job);
        runnable.state = state;
        if state == RunState::Error {
            runnable.error.clone_from(&message);
        }
        if message.is_some() {
            runnable.message = message;
        }
        self.ctx.record(runnable, "job", summary);
    }

    fn selector(&self, job: &Job) -> String {
        self.ctx.builder.workload_selector(&name_of(job))
    }

    fn collectors(&self) -> &Collectors {
        &self.ctx.collectors
    }
}

#[async_trait]
impl RunnableFramework for JobFramework {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, runnable: &Runnable) -> Result<Runnable> {
        let job = self.build(runnable)?;
        let mut runnable = runnable.clone();

        self.ctx.ensure_init_config_map(&runnable).await?;
        self.ctx.ensure_run_secret(&runnable).await?;
        let created = self.create(&job).await?;
        let name = name_of(&created);

        runnable.state = RunState::Running;
        runnable.message = Some(format!("job {name} created"));
        self.ctx.record(&mut runnable, "job", json!({ "name": name }));
        runnable.credentials.erase();

        info!(run_id = %runnable.id, framework = Self::NAME, job = %name, "job submitted");
        Ok(runnable)
    }

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable> {
        let job = self.build(runnable)?;
        self.delete(&job).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Stopped;
        runnable.message = Some(format!("job {} stopped", name_of(&job)));
        info!(run_id = %runnable.id, framework = Self::NAME, "job stopped");
        Ok(runnable)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable> {
        let job = self.build(runnable)?;
        self.ctx.ensure_init_config_map(runnable).await?;
        self.create(&job).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Running;
        runnable.message = Some(format!("job {} resumed", name_of(&job)));
        info!(run_id = %runnable.id, framework = Self::NAME, "job resumed");
        Ok(runnable)
    }

    async fn destroy(&self, runnable: &Runnable) -> Result<Runnable> {
        let job = self.build(runnable)?;
        self.delete(&job).await?;
        self.ctx.remove_companions(&runnable.id).await?;

        let mut runnable = runnable.clone();
        self.ctx.finish_destroy(&mut runnable);
        info!(run_id = %runnable.id, framework = Self::NAME, "job deleted");
        Ok(runnable)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::frameworks::builder::tests::runnable;
    use crate::frameworks::tests::context;
    use crate::model::{Credentials, JobWorkload};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn framework() -> (crate::cluster::memory::InMemoryCluster, JobFramework) {
        let (memory, config) = context();
        let framework = JobFramework::new(memory.cluster("runs"), config);
        (memory, framework)
    }

    #[test]
    fn build_is_pure_and_deterministic() {
        let (memory, framework) = framework();
        let r = runnable();

        let first = framework.build(&r).unwrap();
        let second = framework.build(&r).unwrap();

        assert_eq!(first, second);
        assert_eq!(memory.calls(), 0);
        assert_eq!(first.metadata.name.as_deref(), Some("j-containerjob-r1"));
        assert_eq!(first.metadata.namespace.as_deref(), Some("runs"));
        let pod = first.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.containers[0].image.as_deref(), Some("python:3.12"));
    }

    #[test]
    fn build_rejects_other_workloads() {
        let (_, framework) = framework();
        let mut r = runnable();
        r.workload = Workload::Serve(Default::default());
        assert!(framework.build(&r).is_err());
    }

    #[tokio::test]
    async fn run_submits_job_and_secret_then_erases_credentials() {
        let (memory, framework) = framework();
        let mut r = runnable();
        r.workload = Workload::Job(JobWorkload {
            backoff_limit: Some(2),
        });
        r.credentials = Credentials::new(BTreeMap::from([("token".into(), "t".into())]));

        let out = framework.run(&r).await.unwrap();

        assert_eq!(out.state, RunState::Running);
        assert!(out.credentials.is_empty());
        assert_eq!(out.results["job"]["name"], "j-containerjob-r1");
        let job = memory.jobs.object("j-containerjob-r1").unwrap();
        assert_eq!(job.spec.unwrap().backoff_limit, Some(2));
        assert!(memory.secrets.object("sec-run-r1").is_some());
    }

    #[tokio::test]
    async fn run_twice_reuses_existing_job() {
        let (memory, framework) = framework();
        framework.run(&runnable()).await.unwrap();
        let again = framework.run(&runnable()).await.unwrap();
        assert_eq!(again.state, RunState::Running);
        assert_eq!(memory.jobs.names().len(), 1);
    }

    #[tokio::test]
    async fn backend_failure_surfaces_server_message() {
        let (memory, framework) = framework();
        memory.jobs.fail_with(422, "spec.template: Invalid value");
        let err = framework.run(&runnable()).await.unwrap_err();
        assert!(err.to_string().contains("spec.template: Invalid value"));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (memory, framework) = framework();
        let running = framework.run(&runnable()).await.unwrap();

        let first = framework.destroy(&running).await.unwrap();
        let second = framework.destroy(&first).await.unwrap();

        assert_eq!(first.state, RunState::Deleted);
        assert_eq!(second.state, RunState::Deleted);
        assert!(first.results.is_empty());
        assert!(memory.jobs.is_empty());
    }

    #[tokio::test]
    async fn stop_then_resume_recreates_job() {
        let (memory, framework) = framework();
        let running = framework.run(&runnable()).await.unwrap();

        let stopped = framework.stop(&running).await.unwrap();
        assert_eq!(stopped.state, RunState::Stopped);
        assert!(memory.jobs.is_empty());

        let resumed = framework.resume(&stopped).await.unwrap();
        assert_eq!(resumed.state, RunState::Running);
        assert_eq!(memory.jobs.names(), vec!["j-containerjob-r1"]);
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let (_, framework) = framework();
        let job = framework.build(&runnable()).unwrap();
        assert!(framework.get(&job).await.unwrap_err().is_not_found());
    }

    #[test]
    fn observe_maps_conditions() {
        let (_, framework) = framework();
        let mut job = framework.build(&runnable()).unwrap();
        let mut r = runnable();

        framework.observe(&job, &mut r);
        assert_eq!(r.state, RunState::Running);

        job.status = Some(JobStatus {
            failed: Some(3),
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                reason: Some("BackoffLimitExceeded".into()),
                message: Some("Job has reached the specified backoff limit".into()),
                ..JobCondition::default()
            }]),
            ..JobStatus::default()
        });
        framework.observe(&job, &mut r);
        assert_eq!(r.state, RunState::Error);
        assert_eq!(
            r.error.as_deref(),
            Some("Job has reached the specified backoff limit")
        );
        assert_eq!(r.results["job"]["failed"], 3);

        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..JobStatus::default()
        });
        framework.observe(&job, &mut r);
        assert_eq!(r.state, RunState::Completed);
    }
}
