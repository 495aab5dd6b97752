//! Runtimes resolve a run into a runnable.
//!
//! A [`Runtime`] merges the function, task and run specs of one execution
//! kind and hands the result to a per-task [`Runner`]. Runtimes are looked up
//! by name in a [`RuntimeRegistry`] populated at startup.

pub mod container;
mod services;
mod specs;

pub use services::{
    ClusterSecretService, ConfigurationService, CredentialsService, EntityService,
    InMemoryEntities, SecretService, StaticConfiguration, StaticCredentials,
};
pub use specs::{EntityName, SpecRegistry, SpecValidator};

#[cfg(test)]
pub use services::{
    MockConfigurationService, MockCredentialsService, MockEntityService, MockSecretService,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Function, Run, Runnable, SpecMap, Task};

/// Per execution kind coordinator.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Runtime name, e.g. `container`.
    fn name(&self) -> &'static str;

    /// Run kind this runtime accepts, e.g. `container+run`.
    fn run_kind(&self) -> &'static str;

    /// Effective run spec: run values win, the task fills what the run left
    /// unset, and the function spec is attached unchanged.
    fn build(&self, function: &Function, task: &Task, run: &Run) -> Result<SpecMap>;

    /// Produce the runnable for a built run.
    async fn run(&self, run: &Run) -> Result<Runnable>;

    /// Post-processing once the run finished. Must be idempotent.
    async fn on_complete(&self, run: &Run, runnable: &Runnable) -> Result<()>;
}

/// Turns a run into a runnable for one task kind.
pub trait Runner: Send + Sync {
    fn produce(&self, run: &Run) -> Result<Runnable>;
}

/// Runtimes keyed by name.
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: HashMap<&'static str, Arc<dyn Runtime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runtime: Arc<dyn Runtime>) {
        self.runtimes.insert(runtime.name(), runtime);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Runtime>> {
        self.runtimes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown runtime: {name}")))
    }

    /// Runtime for a run, selected by the prefix of its kind.
    pub fn for_run(&self, run: &Run) -> Result<Arc<dyn Runtime>> {
        let name = run
            .kind
            .split_once('+')
            .map_or(run.kind.as_str(), |(runtime, _)| runtime);
        self.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.runtimes.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Overlay `defaults` onto `spec` for keys that are missing or null.
pub fn merge_specs(spec: &SpecMap, defaults: &SpecMap) -> SpecMap {
    let mut merged = spec.clone();
    for (key, value) in defaults {
        match merged.get(key) {
            Some(existing) if !existing.is_null() => {}
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Reject a run whose kind belongs to another runtime.
pub(crate) fn check_run_kind(runtime: &dyn Runtime, run: &Run) -> Result<()> {
    if run.kind == runtime.run_kind() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "run kind {} unsupported, expecting {}",
            run.kind,
            runtime.run_kind()
        )))
    }
}

/// Typed view over a spec document.
pub(crate) fn parse_spec<T: serde::de::DeserializeOwned>(spec: &SpecMap, what: &str) -> Result<T> {
    serde_json::from_value(Value::Object(spec.clone()))
        .map_err(|e| Error::InvalidSpec(format!("{what}: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> SpecMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn run_values_win_and_task_fills_gaps() {
        let run = map(json!({"args": ["--fast"], "replicas": null}));
        let task = map(json!({"args": ["--slow"], "replicas": 3, "envs": []}));

        let merged = merge_specs(&run, &task);

        assert_eq!(merged["args"], json!(["--fast"]));
        assert_eq!(merged["replicas"], json!(3));
        assert_eq!(merged["envs"], json!([]));
    }

    #[test]
    fn unknown_runtime_is_rejected() {
        let registry = RuntimeRegistry::new();
        let run = Run::new("demo", "nomad+run", "nomad+job://demo/x", SpecMap::new());
        assert!(matches!(registry.for_run(&run), Err(Error::InvalidArgument(_))));
    }
}
