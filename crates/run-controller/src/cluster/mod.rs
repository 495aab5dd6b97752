//! Cluster access seam.
//!
//! Frameworks talk to the API server only through these traits. The
//! production implementations are thin wrappers over `kube::Api`; the
//! in-memory implementations in [`memory`] back the test suite.

pub mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Namespaced CRUD over one resource kind.
#[async_trait]
pub trait ResourceApi<K>: Send + Sync {
    async fn create(&self, object: &K) -> Result<K, kube::Error>;

    async fn replace(&self, name: &str, object: &K) -> Result<K, kube::Error>;

    async fn get(&self, name: &str) -> Result<K, kube::Error>;

    /// Delete with background propagation so dependents are collected.
    async fn delete(&self, name: &str) -> Result<(), kube::Error>;

    /// List objects matching a label selector (`k=v,k2=v2`).
    async fn list(&self, selector: &str) -> Result<Vec<K>, kube::Error>;
}

#[async_trait]
impl<K> ResourceApi<K> for Api<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn create(&self, object: &K) -> Result<K, kube::Error> {
        Api::<K>::create(self, &PostParams::default(), object).await
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, kube::Error> {
        Api::<K>::replace(self, name, &PostParams::default(), object).await
    }

    async fn get(&self, name: &str) -> Result<K, kube::Error> {
        Api::<K>::get(self, name).await
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        Api::<K>::delete(self, name, &DeleteParams::background())
            .await
            .map(|_| ())
    }

    async fn list(&self, selector: &str) -> Result<Vec<K>, kube::Error> {
        let params = ListParams::default().labels(selector);
        Ok(Api::<K>::list(self, &params).await?.items)
    }
}

/// Container log access.
#[async_trait]
pub trait LogApi: Send + Sync {
    async fn logs(
        &self,
        pod: &str,
        container: Option<&str>,
        tail_lines: Option<i64>,
    ) -> Result<String, kube::Error>;
}

#[async_trait]
impl LogApi for Api<Pod> {
    async fn logs(
        &self,
        pod: &str,
        container: Option<&str>,
        tail_lines: Option<i64>,
    ) -> Result<String, kube::Error> {
        let params = LogParams {
            container: container.map(ToString::to_string),
            tail_lines,
            ..LogParams::default()
        };
        Api::<Pod>::logs(self, pod, &params).await
    }
}

/// Builds APIs for resource kinds known only at runtime (custom resources).
pub trait DynamicApiFactory: Send + Sync {
    fn api(&self, resource: &ApiResource) -> Arc<dyn ResourceApi<DynamicObject>>;
}

struct KubeDynamicApis {
    client: Client,
    namespace: String,
}

impl DynamicApiFactory for KubeDynamicApis {
    fn api(&self, resource: &ApiResource) -> Arc<dyn ResourceApi<DynamicObject>> {
        Arc::new(Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            &self.namespace,
            resource,
        ))
    }
}

/// `metrics.k8s.io` pod metrics.
pub fn pod_metrics_resource() -> ApiResource {
    ApiResource {
        group: "metrics.k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "metrics.k8s.io/v1beta1".to_string(),
        kind: "PodMetrics".to_string(),
        plural: "pods".to_string(),
    }
}

/// Every API the frameworks need, scoped to one namespace.
#[derive(Clone)]
pub struct Cluster {
    pub namespace: String,
    pub jobs: Arc<dyn ResourceApi<Job>>,
    pub cron_jobs: Arc<dyn ResourceApi<CronJob>>,
    pub deployments: Arc<dyn ResourceApi<Deployment>>,
    pub services: Arc<dyn ResourceApi<Service>>,
    pub secrets: Arc<dyn ResourceApi<Secret>>,
    pub config_maps: Arc<dyn ResourceApi<ConfigMap>>,
    pub pods: Arc<dyn ResourceApi<Pod>>,
    pub pod_logs: Arc<dyn LogApi>,
    pub pod_metrics: Arc<dyn ResourceApi<DynamicObject>>,
    pub dynamic: Arc<dyn DynamicApiFactory>,
}

impl Cluster {
    pub fn new(client: Client, namespace: &str) -> Self {
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        Self {
            namespace: namespace.to_string(),
            jobs: Arc::new(Api::<Job>::namespaced(client.clone(), namespace)),
            cron_jobs: Arc::new(Api::<CronJob>::namespaced(client.clone(), namespace)),
            deployments: Arc::new(Api::<Deployment>::namespaced(client.clone(), namespace)),
            services: Arc::new(Api::<Service>::namespaced(client.clone(), namespace)),
            secrets: Arc::new(Api::<Secret>::namespaced(client.clone(), namespace)),
            config_maps: Arc::new(Api::<ConfigMap>::namespaced(client.clone(), namespace)),
            pods: Arc::new(pods.clone()),
            pod_logs: Arc::new(pods),
            pod_metrics: Arc::new(Api::<DynamicObject>::namespaced_with(
                client.clone(),
                namespace,
                &pod_metrics_resource(),
            )),
            dynamic: Arc::new(KubeDynamicApis {
                client,
                namespace: namespace.to_string(),
            }),
        }
    }
}
