//! In-memory cluster used by tests and local dry runs.
//!
//! Mirrors API server semantics that matter to the frameworks: 409 on
//! duplicate create, 404 on missing get/replace/delete, equality label
//! selectors. Every call is counted so tests can assert that no I/O happened.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use kube::Resource;

use super::{Cluster, DynamicApiFactory, LogApi, ResourceApi};

/// Build an API error the way the server reports it.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    })
}

/// Match `k=v,k2=v2` against a label map. An empty selector matches everything.
pub fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key.trim()))
                .is_some_and(|v| v == value.trim()),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

pub struct InMemoryApi<K> {
    kind: &'static str,
    objects: Mutex<BTreeMap<String, K>>,
    calls: AtomicUsize,
    failure: Mutex<Option<(u16, String)>>,
}

impl<K> InMemoryApi<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    /// Number of API calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seed or overwrite an object without counting a call.
    pub fn insert(&self, object: K) {
        let name = object.meta().name.clone().unwrap_or_default();
        self.lock().insert(name, object);
    }

    pub fn object(&self, name: &str) -> Option<K> {
        self.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Fail every following call with the given status until cleared.
    pub fn fail_with(&self, code: u16, message: &str) {
        *self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((code, message.to_string()));
    }

    pub fn clear_failure(&self) {
        *self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, K>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> Result<(), kube::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match failure {
            Some((code, message)) => Err(api_error(code, "Injected", message)),
            None => Ok(()),
        }
    }

    fn not_found(&self, name: &str) -> kube::Error {
        api_error(404, "NotFound", format!("{} \"{name}\" not found", self.kind))
    }
}

#[async_trait]
impl<K> ResourceApi<K> for InMemoryApi<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn create(&self, object: &K) -> Result<K, kube::Error> {
        self.enter()?;
        let Some(name) = object.meta().name.clone() else {
            return Err(api_error(422, "Invalid", "metadata.name: Required value"));
        };
        let mut objects = self.lock();
        if objects.contains_key(&name) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{name}\" already exists", self.kind),
            ));
        }
        objects.insert(name, object.clone());
        Ok(object.clone())
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, kube::Error> {
        self.enter()?;
        let mut objects = self.lock();
        if !objects.contains_key(name) {
            return Err(self.not_found(name));
        }
        objects.insert(name.to_string(), object.clone());
        Ok(object.clone())
    }

    async fn get(&self, name: &str) -> Result<K, kube::Error> {
        self.enter()?;
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(name))
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        self.enter()?;
        self.lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| self.not_found(name))
    }

    async fn list(&self, selector: &str) -> Result<Vec<K>, kube::Error> {
        self.enter()?;
        Ok(self
            .lock()
            .values()
            .filter(|o| selector_matches(selector, o.meta().labels.as_ref()))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryLogs {
    logs: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl InMemoryLogs {
    pub fn set(&self, pod: &str, text: &str) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pod.to_string(), text.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogApi for InMemoryLogs {
    async fn logs(
        &self,
        pod: &str,
        _container: Option<&str>,
        _tail_lines: Option<i64>,
    ) -> Result<String, kube::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pod)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("pods \"{pod}\" not found")))
    }
}

/// One in-memory API per `apiVersion/plural`.
#[derive(Default)]
pub struct InMemoryDynamic {
    apis: Mutex<HashMap<String, Arc<InMemoryApi<DynamicObject>>>>,
}

impl InMemoryDynamic {
    pub fn api_for(&self, resource: &ApiResource) -> Arc<InMemoryApi<DynamicObject>> {
        let key = format!("{}/{}", resource.api_version, resource.plural);
        Arc::clone(
            self.apis
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key)
                .or_insert_with(|| Arc::new(InMemoryApi::new("customresource"))),
        )
    }

    /// Calls served across every dynamic API.
    pub fn calls(&self) -> usize {
        self.apis
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|api| api.calls())
            .sum()
    }
}

impl DynamicApiFactory for InMemoryDynamic {
    fn api(&self, resource: &ApiResource) -> Arc<dyn ResourceApi<DynamicObject>> {
        self.api_for(resource)
    }
}

/// Typed handles on every in-memory API, plus a [`Cluster`] view over them.
#[derive(Clone)]
pub struct InMemoryCluster {
    pub jobs: Arc<InMemoryApi<Job>>,
    pub cron_jobs: Arc<InMemoryApi<CronJob>>,
    pub deployments: Arc<InMemoryApi<Deployment>>,
    pub services: Arc<InMemoryApi<Service>>,
    pub secrets: Arc<InMemoryApi<Secret>>,
    pub config_maps: Arc<InMemoryApi<ConfigMap>>,
    pub pods: Arc<InMemoryApi<Pod>>,
    pub pod_logs: Arc<InMemoryLogs>,
    pub pod_metrics: Arc<InMemoryApi<DynamicObject>>,
    pub dynamic: Arc<InMemoryDynamic>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(InMemoryApi::new("jobs")),
            cron_jobs: Arc::new(InMemoryApi::new("cronjobs")),
            deployments: Arc::new(InMemoryApi::new("deployments")),
            services: Arc::new(InMemoryApi::new("services")),
            secrets: Arc::new(InMemoryApi::new("secrets")),
            config_maps: Arc::new(InMemoryApi::new("configmaps")),
            pods: Arc::new(InMemoryApi::new("pods")),
            pod_logs: Arc::new(InMemoryLogs::default()),
            pod_metrics: Arc::new(InMemoryApi::new("podmetrics")),
            dynamic: Arc::new(InMemoryDynamic::default()),
        }
    }

    pub fn cluster(&self, namespace: &str) -> Cluster {
        Cluster {
            namespace: namespace.to_string(),
            jobs: self.jobs.clone(),
            cron_jobs: self.cron_jobs.clone(),
            deployments: self.deployments.clone(),
            services: self.services.clone(),
            secrets: self.secrets.clone(),
            config_maps: self.config_maps.clone(),
            pods: self.pods.clone(),
            pod_logs: self.pod_logs.clone(),
            pod_metrics: self.pod_metrics.clone(),
            dynamic: self.dynamic.clone(),
        }
    }

    /// Total calls served by every API.
    pub fn calls(&self) -> usize {
        self.jobs.calls()
            + self.cron_jobs.calls()
            + self.deployments.calls()
            + self.services.calls()
            + self.secrets.calls()
            + self.config_maps.calls()
            + self.pods.calls()
            + self.pod_logs.calls()
            + self.pod_metrics.calls()
            + self.dynamic.calls()
    }
}
