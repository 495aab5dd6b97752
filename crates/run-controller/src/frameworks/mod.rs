//! Backend frameworks: translate runnables into Kubernetes objects and drive
//! their lifecycle.
//!
//! [`Framework`] carries the object-level verbs (`build`, `create`, `apply`,
//! `get`, `delete`) used by monitors. [`RunnableFramework`] is the
//! object-safe, runnable-level surface (`run`, `stop`, `resume`, `destroy`)
//! used by the dispatcher. Every framework implements both.

pub mod builder;
pub mod collectors;
pub mod naming;

mod build;
mod cr;
mod cronjob;
mod deployment;
mod job;
mod serve;

pub use build::{BuildFramework, BuildObject};
pub use cr::{CustomResourceFramework, CustomResourceObject};
pub use cronjob::CronJobFramework;
pub use deployment::DeploymentFramework;
pub use job::JobFramework;
pub use serve::{ServeFramework, ServeObject};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use kube::Resource;
use serde_json::Value;
use tracing::debug;

use crate::cluster::{Cluster, ResourceApi};
use crate::config::{CollectResults, ControllerConfig};
use crate::error::{is_status, Error, FrameworkError, Result};
use crate::lifecycle::RunState;
use crate::model::Runnable;
use builder::K8sBuilder;
use collectors::Collectors;
use naming::ResourceNaming;

/// Object-level verbs over one backend resource family.
#[async_trait]
pub trait Framework: Send + Sync + 'static {
    /// Native descriptor submitted to the backend.
    type Object: Clone + Send + Sync + 'static;

    const NAME: &'static str;

    /// Pure translation. No backend I/O.
    fn build(&self, runnable: &Runnable) -> Result<Self::Object>;

    /// Submit; an object that already exists counts as created.
    async fn create(&self, object: &Self::Object) -> Result<Self::Object>;

    /// Create or replace.
    async fn apply(&self, object: &Self::Object) -> Result<Self::Object>;

    /// Current backend state. Missing objects are `FrameworkError::NotFound`.
    async fn get(&self, object: &Self::Object) -> Result<Self::Object>;

    /// Remove. Missing objects are not an error.
    async fn delete(&self, object: &Self::Object) -> Result<()>;

    /// Map backend status into the runnable's state and results.
    fn observe(&self, object: &Self::Object, runnable: &mut Runnable);

    /// Label selector for the pods backing the object.
    fn selector(&self, object: &Self::Object) -> String;

    fn collectors(&self) -> &Collectors;
}

/// Runnable-level lifecycle verbs, object safe for registries.
#[async_trait]
pub trait RunnableFramework: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, runnable: &Runnable) -> Result<Runnable>;

    async fn stop(&self, runnable: &Runnable) -> Result<Runnable>;

    async fn resume(&self, runnable: &Runnable) -> Result<Runnable>;

    /// Tear down every object of the runnable. Idempotent.
    async fn destroy(&self, runnable: &Runnable) -> Result<Runnable>;
}

/// Frameworks keyed by name, populated once at startup.
#[derive(Clone, Default)]
pub struct FrameworkRegistry {
    frameworks: HashMap<&'static str, Arc<dyn RunnableFramework>>,
}

impl FrameworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in Kubernetes frameworks sharing one cluster handle.
    pub fn kubernetes(cluster: &Cluster, config: &Arc<ControllerConfig>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JobFramework::new(cluster.clone(), config.clone())));
        registry.register(Arc::new(CronJobFramework::new(cluster.clone(), config.clone())));
        registry.register(Arc::new(DeploymentFramework::new(cluster.clone(), config.clone())));
        registry.register(Arc::new(ServeFramework::new(cluster.clone(), config.clone())));
        registry.register(Arc::new(CustomResourceFramework::new(
            cluster.clone(),
            config.clone(),
        )));
        registry.register(Arc::new(BuildFramework::new(cluster.clone(), config.clone())));
        registry
    }

    pub fn register(&mut self, framework: Arc<dyn RunnableFramework>) {
        self.frameworks.insert(framework.name(), framework);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RunnableFramework>> {
        self.frameworks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown framework: {name}")))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.frameworks.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Shared state every Kubernetes framework holds.
#[derive(Clone)]
pub(crate) struct K8sContext {
    pub cluster: Cluster,
    pub builder: K8sBuilder,
    pub collectors: Collectors,
}

impl K8sContext {
    pub fn new(cluster: Cluster, config: Arc<ControllerConfig>) -> Self {
        Self {
            builder: K8sBuilder::new(config.clone()),
            collectors: Collectors::new(cluster.clone(), config),
            cluster,
        }
    }

    pub fn policy(&self) -> CollectResults {
        self.builder.config().frameworks.collect_results
    }

    /// Record a result unless collection is disabled.
    pub fn record(&self, runnable: &mut Runnable, key: &str, value: Value) {
        if self.policy() != CollectResults::Disable {
            runnable.results.insert(key.to_string(), value);
        }
    }

    /// Final bookkeeping after every object of a runnable is gone.
    pub fn finish_destroy(&self, runnable: &mut Runnable) {
        if self.policy() != CollectResults::Keep {
            runnable.results.clear();
        }
        runnable.state = RunState::Deleted;
        runnable.message = Some(format!("{} {} deleted", runnable.framework(), runnable.id));
    }

    /// Create the run secret when the runnable carries credentials.
    pub async fn ensure_run_secret(&self, runnable: &Runnable) -> Result<Option<String>> {
        let Some(secret) = self.builder.run_secret(runnable)? else {
            return Ok(None);
        };
        let applied = create_or_replace(self.cluster.secrets.as_ref(), &secret, "Secret").await?;
        Ok(Some(name_of(&applied)))
    }

    /// Create the init config map when the runnable ships source contexts.
    pub async fn ensure_init_config_map(&self, runnable: &Runnable) -> Result<()> {
        if !runnable.container.has_context() {
            return Ok(());
        }
        let config_map = self.builder.init_config_map(runnable, BTreeMap::new())?;
        create_or_replace(self.cluster.config_maps.as_ref(), &config_map, "ConfigMap").await?;
        Ok(())
    }

    /// Remove the run secret and the init config map, if present.
    pub async fn remove_companions(&self, runnable_id: &str) -> Result<()> {
        delete_named(
            self.cluster.secrets.as_ref(),
            &ResourceNaming::run_secret_name(runnable_id),
            "Secret",
        )
        .await?;
        delete_named(
            self.cluster.config_maps.as_ref(),
            &ResourceNaming::init_config_map_name(runnable_id),
            "ConfigMap",
        )
        .await
    }
}

pub(crate) fn name_of<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

/// Reject a runnable whose workload belongs to another framework.
pub(crate) fn wrong_workload(framework: &str, runnable: &Runnable) -> Error {
    Error::InvalidArgument(format!(
        "{framework} cannot run {} workloads (run {})",
        runnable.framework(),
        runnable.id
    ))
}

/// Create, returning the existing object on conflict.
pub(crate) async fn create_or_get<K>(api: &dyn ResourceApi<K>, object: &K, kind: &str) -> Result<K>
where
    K: Resource + Clone + Send + Sync,
{
    let name = name_of(object);
    match api.create(object).await {
        Ok(created) => Ok(created),
        Err(e) if is_status(&e, 409) => {
            debug!(kind, name = %name, "already exists, reusing");
            api.get(&name)
                .await
                .map_err(|e| FrameworkError::from_kube(&e, kind, &name).into())
        }
        Err(e) => Err(FrameworkError::from_kube(&e, kind, &name).into()),
    }
}

/// Create, replacing the existing object on conflict.
pub(crate) async fn create_or_replace<K>(
    api: &dyn ResourceApi<K>,
    object: &K,
    kind: &str,
) -> Result<K>
where
    K: Resource + Clone + Send + Sync,
{
    let name = name_of(object);
    match api.create(object).await {
        Ok(created) => Ok(created),
        Err(e) if is_status(&e, 409) => {
            let existing = api
                .get(&name)
                .await
                .map_err(|e| FrameworkError::from_kube(&e, kind, &name))?;
            let mut updated = object.clone();
            updated.meta_mut().resource_version = existing.meta().resource_version.clone();
            debug!(kind, name = %name, "already exists, replacing");
            api.replace(&name, &updated)
                .await
                .map_err(|e| FrameworkError::from_kube(&e, kind, &name).into())
        }
        Err(e) => Err(FrameworkError::from_kube(&e, kind, &name).into()),
    }
}

pub(crate) async fn get_named<K>(api: &dyn ResourceApi<K>, name: &str, kind: &str) -> Result<K>
where
    K: Send + Sync,
{
    api.get(name)
        .await
        .map_err(|e| FrameworkError::from_kube(&e, kind, name).into())
}

/// Delete, treating a missing object as already deleted.
pub(crate) async fn delete_named<K>(api: &dyn ResourceApi<K>, name: &str, kind: &str) -> Result<()>
where
    K: Send + Sync,
{
    match api.delete(name).await {
        Ok(()) => Ok(()),
        Err(e) if is_status(&e, 404) => {
            debug!(kind, name, "already deleted");
            Ok(())
        }
        Err(e) => Err(FrameworkError::from_kube(&e, kind, name).into()),
    }
}

/// True when `conditions` holds one of `types` with status `True`; returns its message.
pub(crate) fn true_condition<'a, I>(conditions: I, types: &[&str]) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str, Option<&'a str>, Option<&'a str>)>,
{
    conditions
        .into_iter()
        .find(|(kind, status, _, _)| types.contains(kind) && *status == "True")
        .map(|(kind, _, reason, message)| {
            message
                .or(reason)
                .map_or_else(|| kind.to_string(), ToString::to_string)
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::frameworks::builder::tests::config;

    pub(crate) fn context() -> (InMemoryCluster, Arc<ControllerConfig>) {
        (InMemoryCluster::new(), config())
    }

    #[test]
    fn registry_knows_every_kubernetes_framework() {
        let (memory, config) = context();
        let registry = FrameworkRegistry::kubernetes(&memory.cluster("runs"), &config);
        assert_eq!(
            registry.names(),
            vec!["k8sbuild", "k8scr", "k8scronjob", "k8sdeployment", "k8sjob", "k8sserve"]
        );
        assert!(registry.get("k8sjob").is_ok());
        assert!(matches!(registry.get("nomad"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn condition_message_prefers_message_then_reason() {
        let conditions = vec![
            ("Complete", "False", None, None),
            ("Failed", "True", Some("BackoffLimitExceeded"), Some("too many retries")),
        ];
        assert_eq!(
            true_condition(conditions.clone(), &["Failed"]).as_deref(),
            Some("too many retries")
        );
        assert_eq!(true_condition(conditions, &["Complete"]), None);
        assert_eq!(
            true_condition(vec![("Failed", "True", Some("Deadline"), None)], &["Failed"]).as_deref(),
            Some("Deadline")
        );
    }
}
