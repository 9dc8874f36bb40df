//! Durable lists kept as JSON files next to the object stores: the queue of
//! local changes not yet pushed (`pending_changes.json`) and the conflicts
//! waiting for review (`review_queue.json`).
//!
//! Every mutation builds the new list, writes it to disk and only then swaps
//! it into memory, so a failed write leaves both sides as they were.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::write_atomic;
use crate::sync::types::{Conflict, PendingChange};

pub const QUEUE_FILE: &str = "pending_changes.json";
pub const REVIEW_FILE: &str = "review_queue.json";

pub type PendingQueue = DurableList<PendingChange>;
pub type ReviewQueue = DurableList<Conflict>;

impl PendingQueue {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_file(dir.as_ref().join(QUEUE_FILE)).await
    }
}

impl ReviewQueue {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_file(dir.as_ref().join(REVIEW_FILE)).await
    }
}

#[derive(Debug)]
pub struct DurableList<T> {
    path: PathBuf,
    entries: Mutex<Vec<T>>,
    /// Serialises read-modify-write cycles
    write_lock: TokioMutex<()>,
}

impl<T> DurableList<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    async fn open_file(path: PathBuf) -> Result<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                Error::storage(format!("corrupt {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            write_lock: TokioMutex::new(()),
        })
    }

    /// Append an entry; returns the new length
    pub async fn push(&self, entry: T) -> Result<usize> {
        self.update(|entries| entries.push(entry)).await
    }

    /// Append entries the predicate does not find already present
    pub async fn extend_new<F>(&self, items: Vec<T>, present: F) -> Result<usize>
    where
        F: Fn(&T, &T) -> bool,
    {
        if items.is_empty() {
            return Ok(self.len());
        }
        self.update(|entries| {
            for item in items {
                if !entries.iter().any(|e| present(e, &item)) {
                    entries.push(item);
                }
            }
        })
        .await
    }

    /// Keep only the entries matching `keep`; returns the new length
    pub async fn retain<F>(&self, keep: F) -> Result<usize>
    where
        F: FnMut(&T) -> bool,
    {
        self.update(|entries| entries.retain(keep)).await
    }

    /// Entries in insertion order
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn update<F>(&self, apply: F) -> Result<usize>
    where
        F: FnOnce(&mut Vec<T>),
    {
        let _guard = self.write_lock.lock().await;

        let mut next = self.entries.lock().clone();
        let before = next.len();
        apply(&mut next);
        if next.len() == before {
            return Ok(before);
        }

        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.path, &bytes).await?;

        let len = next.len();
        *self.entries.lock() = next;
        debug!(file = %self.path.display(), before, after = len, "durable list written");
        Ok(len)
    }
}
