use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::CronJob;
use serde_json::json;
use tracing::info;

use super::builder::{from_json, PodOptions};
use super::collectors::Collectors;
use super::naming::ResourceNaming;
use super::{
    create_or_get, create_or_replace, delete_named, get_named, name_of, wrong_workload, Framework,
    K8sContext, RunnableFramework,
};
use crate::cluster::Cluster;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::lifecycle::RunState;
use crate::model::{Runnable, Workload};

/// Scheduled jobs. A CronJob never completes on its own; it stays RUNNING
/// until stopped or deleted.
#[derive(Clone)]
pub struct CronJobFramework {
    ctx: K8sContext,
}

impl CronJobFramework {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self {
            ctx: K8sContext::new(cluster, config),
        }
    }
}

#[async_trait]
impl Framework for CronJobFramework {
    type Object = CronJob;

    const NAME: &'static str = "k8scronjob";

    fn build(&self, runnable: &Runnable) -> Result<CronJob> {
        let Workload::CronJob(workload) = &runnable.workload else {
            return Err(wrong_workload(Self::NAME, runnable));
        };
        if workload.schedule.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "cron job for run {} has an empty schedule",
                runnable.id
            )));
        }

        let name = ResourceNaming::cron_job_name(runnable);
        let template = self.ctx.builder.pod_template(
            runnable,
            PodOptions {
                workload_name: &name,
                restart_policy: "Never",
                force_init: false,
                init_image: None,
            },
        )?;
        let mut job_spec = json!({ "template": template });
        if let Some(limit) = workload.backoff_limit {
            job_spec["backoffLimit"] = json!(limit);
        }

        from_json(json!({
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": self.ctx.builder.metadata(runnable, &name),
            "spec": {
                "schedule": workload.schedule,
                "concurrencyPolicy": "Forbid",
                "jobTemplate": {
                    "metadata": {"labels": self.ctx.builder.labels(runnable)},
                    "spec": job_spec,
                },
            },
        }))
    }

    async fn create(&self, cron_job: &CronJob) -> Result<CronJob> {
        create_or_get(self.ctx.cluster.cron_jobs.as_ref(), cron_job, "CronJob").await
    }

    async fn apply(&self, cron_job: &CronJob) -> Result<CronJob> {
        create_or_replace(self.ctx.cluster.cron_jobs.as_ref(), cron_job, "CronJob").await
    }

    async fn get(&self, cron_job: &CronJob) -> Result<CronJob> {
        get_named(self.ctx.cluster.cron_jobs.as_ref(), &name_of(cron_job), "CronJob").await
    }

    async fn delete(&self, cron_job: &CronJob) -> Result<()> {
        delete_named(self.ctx.cluster.cron_jobs.as_ref(), &name_of(cron_job), "CronJob").await
    }

    fn observe(&self, cron_job: &CronJob, runnable: &mut Runnable) {
        let status = cron_job.status.clone().unwrap_or_default();
        runnable.state = RunState::Running;
        self.ctx.record(
            runnable,
            "cronjob",
            json!({
                "name": name_of(cron_job),
                "schedule": cron_job.spec.as_ref().map(|s| s.schedule.clone()),
                "active": status.active.map_or(0, |a| a.len()),
                "lastScheduleTime": status.last_schedule_time,
                "lastSuccessfulTime": status.last_successful_time,
            }),
        );
    }

    fn selector(&self, cron_job: &CronJob) -> String {
        self.ctx.builder.workload_selector(&name_of(cron_job))
    }

    fn collectors(&self) -> &Collectors {
        &self.ctx.collectors
    }
}

#[async_trait]
impl RunnableFramework for CronJobFramework {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(&self, runnable: &Runnable) -> Result<Runnable> {
        let cron_job = self.build(runnable)?;
        let mut runnable = runnable.clone();

        self.ctx.ensure_init_config_map(&runnable).await?;
        self.ctx.ensure_run_secret(&runnable).await?;
        let created = self.create(&cron_job).await?;
        let name = name_of(&created);

        runnable.state = RunState::Running;
        runnable.message = Some(format!("cronjob {name} scheduled"));
        self.ctx.record(&mut runnable, "cronjob", json!({ "name": name }));
        runnable.credentials.erase();

        info!(run_id = %runnable.id, framework = Self::NAME, cronjob = %name, "cron job scheduled");
        Ok(runnable)
    }

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable> {
        let cron_job = self.build(runnable)?;
        self.delete(&cron_job).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Stopped;
        runnable.message = Some(format!("cronjob {} stopped", name_of(&cron_job)));
        Ok(runnable)
    }

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable> {
        let cron_job = self.build(runnable)?;
        self.create(&cron_job).await?;

        let mut runnable = runnable.clone();
        runnable.state = RunState::Running;
        runnable.message = Some(format!("cronjob {} resumed", name_of(&cron_job)));
        Ok(runnable)
    }

    async fn destroy(&self, runnable: &Runnable) -> Result<Runnable> {
        let cron_job = self.build(runnable)?;
        self.delete(&cron_job).await?;
        self.ctx.remove_companions(&runnable.id).await?;

        let mut runnable = runnable.clone();
        self.ctx.finish_destroy(&mut runnable);
        info!(run_id = %runnable.id, framework = Self::NAME, "cron job deleted");
        Ok(runnable)
    }
}
