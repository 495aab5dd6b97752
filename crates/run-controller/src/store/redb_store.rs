//! redb-backed RunnableStore implementation.
//!
//! One table per runnable kind, keyed by runnable id, holding CBOR snapshots.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};

use super::{decode, encode, RunnableStore, StoreError};
use crate::model::Runnable;

fn db_err(e: impl Into<redb::Error>) -> StoreError {
    StoreError::Database(Box::new(e.into()))
}

fn table(kind: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(kind)
}

/// redb-backed runnable store. Writes are transactional per call.
pub struct RedbRunnableStore {
    db: Arc<Database>,
}

impl RedbRunnableStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl RunnableStore for RedbRunnableStore {
    async fn store(&self, kind: &str, runnable: &Runnable) -> Result<(), StoreError> {
        let bytes = encode(runnable)?;
        let kind = kind.to_string();
        let id = runnable.id.clone();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = write_txn.open_table(table(&kind)).map_err(db_err)?;
                table
                    .insert(id.as_str(), bytes.as_slice())
                    .map_err(db_err)?;
            }
            write_txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(StoreError::Join)?
    }

    async fn find(&self, kind: &str, id: &str) -> Result<Option<Runnable>, StoreError> {
        let kind = kind.to_string();
        let id = id.to_string();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let read_txn = db.begin_read().map_err(db_err)?;
            let table = match read_txn.open_table(table(&kind)) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(db_err(e)),
            };

            match table.get(id.as_str()).map_err(db_err)? {
                Some(data) => Ok(Some(decode(data.value())?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(StoreError::Join)?
    }

    async fn find_all(&self, kind: &str) -> Result<Vec<Runnable>, StoreError> {
        let kind = kind.to_string();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let read_txn = db.begin_read().map_err(db_err)?;
            let table = match read_txn.open_table(table(&kind)) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(db_err(e)),
            };

            let mut runnables = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (_, data) = entry.map_err(db_err)?;
                runnables.push(decode(data.value())?);
            }
            Ok(runnables)
        })
        .await
        .map_err(StoreError::Join)?
    }

    async fn remove(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        let kind = kind.to_string();
        let id = id.to_string();
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = write_txn.open_table(table(&kind)).map_err(db_err)?;
                table.remove(id.as_str()).map_err(db_err)?;
            }
            write_txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
        .map_err(StoreError::Join)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RunState;
    use crate::store::tests::sample;

    fn open() -> (tempfile::TempDir, RedbRunnableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbRunnableStore::open(dir.path().join("runnables.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trip_preserves_runnable() {
        let (_dir, store) = open();
        let runnable = sample("r1");

        store.store("k8sserve", &runnable).await.unwrap();
        let found = store.find("k8sserve", "r1").await.unwrap().unwrap();

        assert_eq!(found, runnable);
        assert_eq!(found.state, RunState::Running);
        assert_eq!(found.results, runnable.results);
    }

    #[tokio::test]
    async fn store_updates_in_place() {
        let (_dir, store) = open();
        let mut runnable = sample("r1");
        store.store("k8sserve", &runnable).await.unwrap();

        runnable.state = RunState::Completed;
        store.store("k8sserve", &runnable).await.unwrap();

        let all = store.find_all("k8sserve").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, RunState::Completed);
    }

    #[tokio::test]
    async fn kinds_do_not_collide() {
        let (_dir, store) = open();
        let mut job = sample("same");
        job.task = "job".into();
        store.store("k8sjob", &job).await.unwrap();
        store.store("k8sserve", &sample("same")).await.unwrap();

        assert_eq!(
            store.find("k8sjob", "same").await.unwrap().unwrap().task,
            "job"
        );
        assert_eq!(
            store.find("k8sserve", "same").await.unwrap().unwrap().task,
            "serve"
        );
    }

    #[tokio::test]
    async fn unknown_kind_reads_empty() {
        let (_dir, store) = open();
        assert!(store.find("k8scr", "x").await.unwrap().is_none());
        assert!(store.find_all("k8scr").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, store) = open();
        store.store("k8sjob", &sample("r1")).await.unwrap();

        store.remove("k8sjob", "r1").await.unwrap();
        store.remove("k8sjob", "r1").await.unwrap();
        assert!(store.find("k8sjob", "r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runnables.redb");
        {
            let store = RedbRunnableStore::open(&path).unwrap();
            store.store("k8sjob", &sample("r1")).await.unwrap();
        }
        let store = RedbRunnableStore::open(&path).unwrap();
        assert_eq!(store.find_all("k8sjob").await.unwrap().len(), 1);
    }
}
