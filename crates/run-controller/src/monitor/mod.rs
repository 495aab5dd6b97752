//! Reconciliation of stored runnables against the cluster.
//!
//! A [`Monitor`] pairs one framework with the runnables stored under its
//! name. Each polling cycle refreshes the running ones; watchers trigger the
//! same refresh as soon as a backing object changes.

pub mod watcher;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::api::ObjectMeta;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::config::{CollectResults, ControllerConfig};
use crate::error::Result;
use crate::frameworks::collectors::summarize_pods;
use crate::frameworks::{
    BuildFramework, CronJobFramework, CustomResourceFramework, DeploymentFramework, Framework,
    JobFramework, ServeFramework,
};
use crate::lifecycle::RunState;
use crate::manager::{EventBus, KeyedLocks};
use crate::model::{Runnable, RunnableChangedEvent};
use crate::store::{KindStore, RunnableStore};

/// Object-safe handle over a [`Monitor`] of any framework.
#[async_trait]
pub trait RunnableMonitor: Send + Sync {
    fn framework(&self) -> &'static str;

    /// Refresh one stored runnable under its id lock.
    async fn refresh_id(&self, id: &str) -> Result<Option<Runnable>>;

    /// One polling pass over every running runnable. Returns how many were
    /// refreshed; zero when the previous pass is still in progress.
    async fn cycle(&self) -> usize;
}

pub struct Monitor<F: Framework> {
    framework: F,
    store: KindStore,
    locks: KeyedLocks,
    events: EventBus<RunnableChangedEvent>,
    cycle: Mutex<()>,
}

impl<F: Framework> Monitor<F> {
    pub fn new(
        framework: F,
        store: Arc<dyn RunnableStore>,
        locks: KeyedLocks,
        events: EventBus<RunnableChangedEvent>,
    ) -> Self {
        Self {
            framework,
            store: KindStore::new(F::NAME, store),
            locks,
            events,
            cycle: Mutex::new(()),
        }
    }

    /// Pull backend status into `runnable`. Never fails: a missing or
    /// invalid backing object puts the runnable in `ERROR`, other backend
    /// failures land in its error field.
    pub async fn refresh(&self, mut runnable: Runnable) -> Runnable {
        let object = match self.framework.build(&runnable) {
            Ok(object) => object,
            Err(e) => {
                runnable.fail(format!("invalid runnable: {e}"));
                return runnable;
            }
        };
        let object = match self.framework.get(&object).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                warn!(run_id = %runnable.id, framework = F::NAME, error = %e, "backing object is gone");
                runnable.fail(format!("{} resources missing: {e}", F::NAME));
                return runnable;
            }
            Err(e) => {
                warn!(run_id = %runnable.id, framework = F::NAME, error = %e, "refresh failed");
                runnable.error = Some(e.to_string());
                return runnable;
            }
        };

        runnable.error = None;
        self.framework.observe(&object, &mut runnable);
        self.collect(&object, &mut runnable).await;
        runnable
    }

    /// Pods, logs and metrics. Each failure is logged and skipped. When the
    /// pod listing fails, logs and metrics are read from the pods seen last
    /// time.
    async fn collect(&self, object: &F::Object, runnable: &mut Runnable) {
        let collectors = self.framework.collectors();
        let settings = &collectors.config().frameworks;
        let selector = self.framework.selector(object);

        let (pods, listed) = match collectors.pods(&selector).await {
            Ok(pods) => (pods, true),
            Err(e) => {
                warn!(run_id = %runnable.id, selector = %selector, error = %e, "pod listing failed, reusing known pods");
                (known_pods(runnable), false)
            }
        };
        if listed && settings.collect_results != CollectResults::Disable {
            runnable
                .results
                .insert("pods".to_string(), summarize_pods(&pods));
        }
        if settings.collect_logs {
            match collectors.logs(&pods).await {
                Ok(logs) if listed || !logs.is_empty() => runnable.logs = logs,
                Ok(_) => {}
                Err(e) => warn!(run_id = %runnable.id, error = %e, "log collection failed"),
            }
        }
        if settings.collect_metrics {
            match collectors.metrics(&pods).await {
                Ok(metrics) if listed || !metrics.is_empty() => runnable.metrics = metrics,
                Ok(_) => {}
                Err(e) => debug!(run_id = %runnable.id, error = %e, "metric collection failed"),
            }
        }
    }
}

/// Pods named by the logs and metrics already recorded on `runnable`.
fn known_pods(runnable: &Runnable) -> Vec<Pod> {
    let mut containers: BTreeMap<&str, Vec<Container>> = BTreeMap::new();
    for log in &runnable.logs {
        containers.entry(&log.pod).or_default().push(Container {
            name: log.container.clone(),
            ..Container::default()
        });
    }
    for metric in &runnable.metrics {
        containers.entry(&metric.pod).or_default();
    }
    containers
        .into_iter()
        .map(|(name, containers)| Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers,
                ..PodSpec::default()
            }),
            ..Pod::default()
        })
        .collect()
}

/// True when a refresh changed something the run manager tracks.
fn changed(before: &Runnable, after: &Runnable) -> bool {
    before.state != after.state
        || before.message != after.message
        || before.error != after.error
        || before.results != after.results
}

#[async_trait]
impl<F: Framework> RunnableMonitor for Monitor<F> {
    fn framework(&self) -> &'static str {
        F::NAME
    }

    async fn refresh_id(&self, id: &str) -> Result<Option<Runnable>> {
        let _guard = self.locks.lock(id).await;
        let Some(runnable) = self.store.find(id).await? else {
            return Ok(None);
        };
        if runnable.state != RunState::Running {
            return Ok(Some(runnable));
        }

        let refreshed = self.refresh(runnable.clone()).await;
        self.store.store(&refreshed).await?;
        if changed(&runnable, &refreshed) {
            debug!(run_id = %id, framework = F::NAME, state = %refreshed.state, "runnable changed");
            self.events
                .publish(RunnableChangedEvent::from_runnable(refreshed.clone()))
                .await;
        }
        Ok(Some(refreshed))
    }

    async fn cycle(&self) -> usize {
        let Ok(_running) = self.cycle.try_lock() else {
            debug!(framework = F::NAME, "previous cycle still running, skipping");
            return 0;
        };
        let runnables = match self.store.find_all().await {
            Ok(runnables) => runnables,
            Err(e) => {
                error!(framework = F::NAME, error = %e, "failed to list runnables");
                return 0;
            }
        };

        let mut refreshed = 0;
        for runnable in runnables.iter().filter(|r| r.state == RunState::Running) {
            match self.refresh_id(&runnable.id).await {
                Ok(Some(_)) => refreshed += 1,
                Ok(None) => {}
                Err(e) => error!(run_id = %runnable.id, framework = F::NAME, error = %e, "refresh failed"),
            }
        }
        self.locks.prune();
        refreshed
    }
}

/// One monitor per built-in Kubernetes framework.
pub fn kubernetes_monitors(
    cluster: &Cluster,
    config: &Arc<ControllerConfig>,
    store: &Arc<dyn RunnableStore>,
    locks: &KeyedLocks,
    events: &EventBus<RunnableChangedEvent>,
) -> Vec<Arc<dyn RunnableMonitor>> {
    fn monitor<F: Framework>(
        framework: F,
        store: &Arc<dyn RunnableStore>,
        locks: &KeyedLocks,
        events: &EventBus<RunnableChangedEvent>,
    ) -> Arc<dyn RunnableMonitor> {
        Arc::new(Monitor::new(framework, store.clone(), locks.clone(), events.clone()))
    }

    vec![
        monitor(JobFramework::new(cluster.clone(), config.clone()), store, locks, events),
        monitor(CronJobFramework::new(cluster.clone(), config.clone()), store, locks, events),
        monitor(DeploymentFramework::new(cluster.clone(), config.clone()), store, locks, events),
        monitor(ServeFramework::new(cluster.clone(), config.clone()), store, locks, events),
        monitor(CustomResourceFramework::new(cluster.clone(), config.clone()), store, locks, events),
        monitor(BuildFramework::new(cluster.clone(), config.clone()), store, locks, events),
    ]
}

/// Poll `monitor` every `interval` until cancelled. Late ticks are skipped
/// rather than bunched up.
pub fn spawn_monitor(
    monitor: Arc<dyn RunnableMonitor>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(framework = monitor.framework(), interval_secs = interval.as_secs(), "monitor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let refreshed = monitor.cycle().await;
                    debug!(framework = monitor.framework(), refreshed, "monitor cycle finished");
                }
            }
        }
        info!(framework = monitor.framework(), "monitor stopped");
    })
}
