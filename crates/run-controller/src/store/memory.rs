//! In-memory runnable store. Snapshots are still CBOR encoded so callers
//! never share a live value with the store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{decode, encode, RunnableStore, StoreError};
use crate::model::Runnable;

#[derive(Default)]
pub struct MemoryRunnableStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryRunnableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunnableStore for MemoryRunnableStore {
    async fn store(&self, kind: &str, runnable: &Runnable) -> Result<(), StoreError> {
        let bytes = encode(runnable)?;
        self.entries
            .write()
            .await
            .insert((kind.to_string(), runnable.id.clone()), bytes);
        Ok(())
    }

    async fn find(&self, kind: &str, id: &str) -> Result<Option<Runnable>, StoreError> {
        self.entries
            .read()
            .await
            .get(&(kind.to_string(), id.to_string()))
            .map(|bytes| decode(bytes))
            .transpose()
    }

    async fn find_all(&self, kind: &str) -> Result<Vec<Runnable>, StoreError> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|((k, _), _)| k == kind)
            .map(|(_, bytes)| decode(bytes))
            .collect()
    }

    async fn remove(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .remove(&(kind.to_string(), id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample;

    #[tokio::test]
    async fn find_all_filters_kind() {
        let store = MemoryRunnableStore::new();
        store.store("k8sjob", &sample("a")).await.unwrap();
        store.store("k8sjob", &sample("b")).await.unwrap();
        store.store("k8sserve", &sample("c")).await.unwrap();

        let mut ids: Vec<_> = store
            .find_all("k8sjob")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn remove_missing_is_ok() {
        let store = MemoryRunnableStore::new();
        tokio_test::assert_ok!(store.remove("k8sjob", "nope").await);
    }

    #[test]
    fn store_updates_in_place() {
        let store = MemoryRunnableStore::new();
        let mut runnable = sample("a");
        tokio_test::block_on(async {
            store.store("k8sjob", &runnable).await.unwrap();
            runnable.message = Some("updated".into());
            store.store("k8sjob", &runnable).await.unwrap();

            let all = store.find_all("k8sjob").await.unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].message.as_deref(), Some("updated"));
        });
    }
}
