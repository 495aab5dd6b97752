//! Durable keyed storage for runnable snapshots.
//!
//! Entries are keyed by `(kind, id)` where `kind` is the framework name, so
//! two execution kinds never collide even when they share an id. Snapshots
//! are CBOR encoded and must round-trip losslessly.

mod memory;
mod redb_store;

pub use memory::MemoryRunnableStore;
pub use redb_store::RedbRunnableStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::Runnable;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] Box<redb::Error>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Storage backend for runnables.
#[async_trait]
pub trait RunnableStore: Send + Sync {
    /// Insert or replace the snapshot under `(kind, runnable.id)`.
    async fn store(&self, kind: &str, runnable: &Runnable) -> Result<(), StoreError>;

    async fn find(&self, kind: &str, id: &str) -> Result<Option<Runnable>, StoreError>;

    async fn find_all(&self, kind: &str) -> Result<Vec<Runnable>, StoreError>;

    /// Remove an entry. Removing a missing entry is not an error.
    async fn remove(&self, kind: &str, id: &str) -> Result<(), StoreError>;
}

/// A store handle bound to one runnable kind.
#[derive(Clone)]
pub struct KindStore {
    kind: &'static str,
    inner: Arc<dyn RunnableStore>,
}

impl KindStore {
    pub fn new(kind: &'static str, inner: Arc<dyn RunnableStore>) -> Self {
        Self { kind, inner }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub async fn store(&self, runnable: &Runnable) -> Result<(), StoreError> {
        self.inner.store(self.kind, runnable).await
    }

    pub async fn find(&self, id: &str) -> Result<Option<Runnable>, StoreError> {
        self.inner.find(self.kind, id).await
    }

    pub async fn find_all(&self) -> Result<Vec<Runnable>, StoreError> {
        self.inner.find_all(self.kind).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.inner.remove(self.kind, id).await
    }
}

pub(crate) fn encode(runnable: &Runnable) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(runnable, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Runnable, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::lifecycle::RunState;
    use crate::model::{
        ContainerTemplate, CoreEnv, Credentials, PodLog, ServePort, ServeWorkload, Workload,
    };

    pub(crate) fn sample(id: &str) -> Runnable {
        let mut results = BTreeMap::new();
        results.insert(
            "deployment".to_string(),
            json!({"name": format!("d-containerserve-{id}"), "replicas": 2, "ready": 1.5}),
        );
        Runnable {
            id: id.to_string(),
            project: "demo".into(),
            runtime: "container".into(),
            task: "serve".into(),
            state: RunState::Running,
            message: Some("serving".into()),
            results,
            logs: vec![PodLog {
                pod: "p-1".into(),
                container: "main".into(),
                value: "listening on :8080\n".into(),
            }],
            credentials: Credentials::new(BTreeMap::from([(
                "token".to_string(),
                "abc".to_string(),
            )])),
            container: ContainerTemplate {
                image: "python:3.12".into(),
                command: Some("python".into()),
                args: vec!["main.py".into()],
                envs: vec![CoreEnv::new("RUN_ID", id)],
                ..ContainerTemplate::default()
            },
            workload: Workload::Serve(ServeWorkload {
                replicas: Some(2),
                service_ports: vec![ServePort {
                    port: 80,
                    target_port: 8080,
                }],
                ..ServeWorkload::default()
            }),
            ..Runnable::default()
        }
    }

    #[test]
    fn codec_is_lossless() {
        let runnable = sample("r1");
        let decoded = decode(&encode(&runnable).unwrap()).unwrap();
        assert_eq!(decoded, runnable);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode(&[0xff, 0x00, 0x13]),
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn kind_store_scopes_by_kind() {
        let inner: Arc<dyn RunnableStore> = Arc::new(MemoryRunnableStore::new());
        let jobs = KindStore::new("k8sjob", inner.clone());
        let serves = KindStore::new("k8sserve", inner);

        jobs.store(&sample("same")).await.unwrap();
        assert!(jobs.find("same").await.unwrap().is_some());
        assert!(serves.find("same").await.unwrap().is_none());
        assert_eq!(jobs.kind(), "k8sjob");
    }
}
