//! Collaborator services consumed by runtimes.
//!
//! Entities, secrets, credentials and ambient configuration live outside the
//! engine. Each is a trait here with a small production or in-memory
//! implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::ResourceApi;
use crate::error::{is_status, Error, FrameworkError, Result};
use crate::model::{Credentials, Function, Run, Task, TaskRef};

/// Resolves functions and tasks, and persists function updates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityService: Send + Sync {
    async fn function(&self, task: &TaskRef) -> Result<Function>;

    async fn task(&self, task: &TaskRef) -> Result<Task>;

    async fn update_function(&self, function: Function) -> Result<Function>;
}

/// Resolves project secret names into `{secret -> keys}`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretService: Send + Sync {
    async fn secret_data(
        &self,
        project: &str,
        names: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, BTreeSet<String>>>;
}

/// Ambient credentials for the caller that submitted a run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialsService: Send + Sync {
    async fn credentials(&self, run: &Run) -> Result<Credentials>;
}

/// Ambient configuration injected into every runnable.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigurationService: Send + Sync {
    fn configurations(&self) -> BTreeMap<String, String>;
}

/// Secrets read from the cluster namespace; the exposed keys are the secret's
/// data keys. Unknown names are skipped.
#[derive(Clone)]
pub struct ClusterSecretService {
    secrets: Arc<dyn ResourceApi<Secret>>,
}

impl ClusterSecretService {
    pub fn new(secrets: Arc<dyn ResourceApi<Secret>>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretService for ClusterSecretService {
    async fn secret_data(
        &self,
        project: &str,
        names: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut resolved = BTreeMap::new();
        for name in names {
            let secret = match self.secrets.get(name).await {
                Ok(secret) => secret,
                Err(e) if is_status(&e, 404) => {
                    warn!(project, secret = %name, "secret not found, skipping");
                    continue;
                }
                Err(e) => return Err(FrameworkError::from_kube(&e, "Secret", name).into()),
            };
            let mut keys: BTreeSet<String> = secret
                .data
                .map(|data| data.into_keys().collect())
                .unwrap_or_default();
            if let Some(string_data) = secret.string_data {
                keys.extend(string_data.into_keys());
            }
            if !keys.is_empty() {
                resolved.insert(name.clone(), keys);
            }
        }
        debug!(project, count = resolved.len(), "resolved project secrets");
        Ok(resolved)
    }
}

/// Fixed configuration entries, typically from the controller config.
#[derive(Debug, Clone, Default)]
pub struct StaticConfiguration(BTreeMap<String, String>);

impl StaticConfiguration {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }
}

impl ConfigurationService for StaticConfiguration {
    fn configurations(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }
}

/// The same credentials for every run.
#[derive(Clone, Default)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialsService for StaticCredentials {
    async fn credentials(&self, _run: &Run) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Functions and tasks held in memory.
#[derive(Default)]
pub struct InMemoryEntities {
    functions: DashMap<(String, String), Function>,
    tasks: DashMap<(String, String, String), Task>,
}

impl InMemoryEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_function(&self, function: Function) {
        self.functions
            .insert((function.project.clone(), function.name.clone()), function);
    }

    /// Index a task by the function its `function` reference
    /// (`<runtime>://<project>/<name>[:<version>]`) points at.
    pub fn insert_task(&self, task: Task) -> Result<()> {
        let invalid = || Error::InvalidSpec(format!("task {} has no valid function reference", task.id));
        let reference = task
            .spec
            .get("function")
            .and_then(Value::as_str)
            .ok_or_else(invalid)?;
        let name = reference
            .split_once("://")
            .and_then(|(_, path)| path.split_once('/'))
            .map(|(_, name)| name.split(':').next().unwrap_or(name))
            .filter(|name| !name.is_empty())
            .ok_or_else(invalid)?
            .to_string();
        self.tasks
            .insert((task.project.clone(), task.kind.clone(), name), task);
        Ok(())
    }

    pub fn function_named(&self, project: &str, name: &str) -> Option<Function> {
        self.functions
            .get(&(project.to_string(), name.to_string()))
            .map(|f| f.clone())
    }
}

#[async_trait]
impl EntityService for InMemoryEntities {
    async fn function(&self, task: &TaskRef) -> Result<Function> {
        self.function_named(&task.project, &task.function)
            .ok_or_else(|| Error::NotFound("function", format!("{}/{}", task.project, task.function)))
    }

    async fn task(&self, task: &TaskRef) -> Result<Task> {
        self.tasks
            .get(&(task.project.clone(), task.kind(), task.function.clone()))
            .map(|t| t.clone())
            .ok_or_else(|| Error::NotFound("task", task.to_string()))
    }

    async fn update_function(&self, function: Function) -> Result<Function> {
        self.insert_function(function.clone());
        Ok(function)
    }
}
