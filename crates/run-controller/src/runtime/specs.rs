use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::parse_spec;
use crate::error::{Error, Result};
use crate::model::SpecMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityName {
    Function,
    Task,
    Run,
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityName::Function => "function",
            EntityName::Task => "task",
            EntityName::Run => "run",
        };
        f.write_str(name)
    }
}

pub type SpecValidator = Arc<dyn Fn(&SpecMap) -> Result<()> + Send + Sync>;

/// Validators keyed by `(runtime, kind, entity)`.
#[derive(Clone, Default)]
pub struct SpecRegistry {
    specs: HashMap<(String, String, EntityName), SpecValidator>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        runtime: &str,
        kind: &str,
        entity: EntityName,
        validator: SpecValidator,
    ) {
        self.specs
            .insert((runtime.to_string(), kind.to_string(), entity), validator);
    }

    /// Register a spec type; a document is valid when it deserializes into `T`.
    pub fn register_type<T>(&mut self, runtime: &str, kind: &str, entity: EntityName)
    where
        T: DeserializeOwned + 'static,
    {
        let what = format!("{kind} {entity} spec");
        self.register(
            runtime,
            kind,
            entity,
            Arc::new(move |spec: &SpecMap| parse_spec::<T>(spec, &what).map(|_| ())),
        );
    }

    pub fn contains(&self, runtime: &str, kind: &str, entity: EntityName) -> bool {
        self.specs
            .contains_key(&(runtime.to_string(), kind.to_string(), entity))
    }

    pub fn validate(
        &self,
        runtime: &str,
        kind: &str,
        entity: EntityName,
        spec: &SpecMap,
    ) -> Result<()> {
        let validator = self
            .specs
            .get(&(runtime.to_string(), kind.to_string(), entity))
            .ok_or_else(|| Error::SpecNotFound {
                runtime: runtime.to_string(),
                kind: kind.to_string(),
                entity: entity.to_string(),
            })?;
        validator(spec)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct ImageSpec {
        image: String,
    }

    #[test]
    fn unknown_triple_is_spec_not_found() {
        let registry = SpecRegistry::new();
        let err = registry
            .validate("container", "container+job", EntityName::Task, &SpecMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::SpecNotFound { .. }));
        assert!(err.to_string().contains("entity=task"));
    }

    #[test]
    fn typed_validator_checks_shape() {
        let mut registry = SpecRegistry::new();
        registry.register_type::<ImageSpec>("container", "container", EntityName::Function);

        let good = json!({"image": "nginx"}).as_object().cloned().unwrap();
        let bad = json!({"image": 42}).as_object().cloned().unwrap();

        assert!(registry
            .validate("container", "container", EntityName::Function, &good)
            .is_ok());
        assert!(matches!(
            registry.validate("container", "container", EntityName::Function, &bad),
            Err(Error::InvalidSpec(_))
        ));
        assert!(!registry.contains("container", "container", EntityName::Run));
    }
}
