//! Local persistence for offline use.
//!
//! Three object stores (`healthRecords`, `appointments`, `medicines`) keyed by
//! each record's `id`. Every store lives in memory and is mirrored to
//! `{dir}/{store}.json`; writes go to a `.tmp` file first and are renamed into
//! place so a crash never leaves a half-written store behind.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    HealthRecords,
    Appointments,
    Medicines,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::HealthRecords, Self::Appointments, Self::Medicines];

    pub fn store_name(self) -> &'static str {
        match self {
            Self::HealthRecords => "healthRecords",
            Self::Appointments => "appointments",
            Self::Medicines => "medicines",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.store_name())
    }
}

type Records = BTreeMap<String, Value>;

pub struct LocalStore {
    dir: PathBuf,
    stores: Mutex<HashMap<EntityKind, Records>>,
    /// Serializes file writes
    write_lock: TokioMutex<()>,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore").field("dir", &self.dir).finish()
    }
}

impl LocalStore {
    /// Open (or create) the stores under `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(format!("failed to create {}: {e}", dir.display())))?;

        let mut stores = HashMap::new();
        for kind in EntityKind::ALL {
            let records = load_records(&store_path(&dir, kind)).await?;
            debug!(store = %kind, count = records.len(), "store loaded");
            stores.insert(kind, records);
        }

        info!(dir = %dir.display(), "local store opened");
        Ok(Self {
            dir,
            stores: Mutex::new(stores),
            write_lock: TokioMutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Insert or replace every record. Each record must carry a string `id`.
    pub async fn put_all(&self, kind: EntityKind, records: Vec<Value>) -> Result<()> {
        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let id = record_id(&record)
                .ok_or_else(|| Error::storage(format!("{kind} record without a string `id`")))?
                .to_owned();
            keyed.push((id, record));
        }

        {
            let mut stores = self.stores.lock();
            let store = stores.entry(kind).or_default();
            for (id, record) in keyed {
                store.insert(id, record);
            }
        }
        self.persist(kind).await
    }

    pub async fn put(&self, kind: EntityKind, record: Value) -> Result<()> {
        self.put_all(kind, vec![record]).await
    }

    pub fn get_all(&self, kind: EntityKind) -> Vec<Value> {
        self.stores
            .lock()
            .get(&kind)
            .map(|store| store.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.stores
            .lock()
            .get(&kind)
            .and_then(|store| store.get(id).cloned())
    }

    /// Remove a record. Returns whether it existed.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let existed = self
            .stores
            .lock()
            .get_mut(&kind)
            .is_some_and(|store| store.remove(id).is_some());

        if existed {
            self.persist(kind).await?;
        }
        Ok(existed)
    }

    pub async fn put_all_as<T: Serialize>(&self, kind: EntityKind, records: &[T]) -> Result<()> {
        let values = records
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.put_all(kind, values).await
    }

    pub fn get_all_as<T: DeserializeOwned>(&self, kind: EntityKind) -> Result<Vec<T>> {
        self.get_all(kind)
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.stores.lock().get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    /// Flush every store and release the handle
    pub async fn close(self) -> Result<()> {
        for kind in EntityKind::ALL {
            self.persist(kind).await?;
        }
        info!(dir = %self.dir.display(), "local store closed");
        Ok(())
    }

    async fn persist(&self, kind: EntityKind) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        // snapshot under the lock, write outside it
        let snapshot = {
            let stores = self.stores.lock();
            let records: Vec<&Value> = stores.get(&kind).map(|s| s.values().collect()).unwrap_or_default();
            serde_json::to_vec_pretty(&records)?
        };

        write_atomic(&store_path(&self.dir, kind), &snapshot).await
    }
}

fn store_path(dir: &Path, kind: EntityKind) -> PathBuf {
    dir.join(format!("{}.json", kind.store_name()))
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

async fn load_records(path: &Path) -> Result<Records> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Records::new()),
        Err(e) => {
            return Err(Error::storage(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    let values: Vec<Value> = serde_json::from_slice(&raw)
        .map_err(|e| Error::storage(format!("corrupt store {}: {e}", path.display())))?;

    Ok(values
        .into_iter()
        .filter_map(|v| {
            let id = record_id(&v)?.to_owned();
            Some((id, v))
        })
        .collect())
}

/// Write to `{path}.tmp`, then rename over `path`
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");

    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(|e| Error::storage(format!("failed to write temp file: {e}")))?;

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::storage(format!("failed to rename temp file: {e}")))?;

    debug!(path = %path.display(), "written atomically");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Medicine {
        id: String,
        name: String,
        stock: u32,
    }

    #[tokio::test]
    async fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        store
            .put_all(
                EntityKind::Appointments,
                vec![
                    json!({"id": "a1", "doctor": "doc"}),
                    json!({"id": "a2", "doctor": "doc"}),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.len(EntityKind::Appointments), 2);
        assert_eq!(
            store.get(EntityKind::Appointments, "a1").unwrap()["doctor"],
            "doc"
        );
        assert!(store.is_empty(EntityKind::Medicines));

        assert!(store.delete(EntityKind::Appointments, "a1").await.unwrap());
        assert!(!store.delete(EntityKind::Appointments, "a1").await.unwrap());
        assert_eq!(store.len(EntityKind::Appointments), 1);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalStore::open(dir.path()).await.unwrap();
            store
                .put(EntityKind::HealthRecords, json!({"id": "r1", "bp": "120/80"}))
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let store = LocalStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get(EntityKind::HealthRecords, "r1"),
            Some(json!({"id": "r1", "bp": "120/80"}))
        );
        assert!(dir.path().join("healthRecords.json").exists());
        assert!(!dir.path().join("healthRecords.json.tmp").exists());
    }

    #[tokio::test]
    async fn record_without_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let err = store
            .put(EntityKind::Medicines, json!({"name": "paracetamol"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(store.is_empty(EntityKind::Medicines));
    }

    #[tokio::test]
    async fn typed_helpers_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let meds = vec![Medicine {
            id: "m1".into(),
            name: "ORS".into(),
            stock: 12,
        }];

        store.put_all_as(EntityKind::Medicines, &meds).await.unwrap();
        let loaded: Vec<Medicine> = store.get_all_as(EntityKind::Medicines).unwrap();
        assert_eq!(loaded, meds);
    }

    #[tokio::test]
    async fn corrupt_store_file_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("medicines.json"), b"not json").unwrap();
        assert!(matches!(
            LocalStore::open(dir.path()).await,
            Err(Error::Storage(_))
        ));
    }
}
