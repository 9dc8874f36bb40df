use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::EntityKind;
use crate::sync::types::{Operation, PendingChange};

/// A record as held by the remote document store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub data: Value,
    /// Unix millis of the last edit, as stamped by the writer
    pub updated_at: i64,
    pub deleted: bool,
    /// Write sequence assigned by the remote store when it accepted the
    /// write. Pull cursors are expressed in revisions, never in wall-clock
    /// time.
    #[serde(default)]
    pub revision: u64,
}

impl RemoteRecord {
    pub fn from_change(change: &PendingChange) -> Self {
        Self {
            entity_type: change.entity_type,
            entity_id: change.entity_id.clone(),
            data: change.record(),
            updated_at: change.local_timestamp,
            deleted: change.operation == Operation::Delete,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushResult {
    Applied,
    /// This change id was already applied
    Duplicate,
    /// The remote copy was written after the local edit
    Conflict(RemoteRecord),
}

/// The remote document store
pub trait RemoteStore: Send + Sync + 'static {
    /// Apply one local change. Must be idempotent by change id.
    fn push(&self, change: &PendingChange) -> impl Future<Output = Result<PushResult>> + Send;

    /// Unconditionally write the outcome of a conflict resolution
    fn push_resolved(&self, record: RemoteRecord) -> impl Future<Output = Result<()>> + Send;

    /// Records whose revision is greater than `since` (everything when
    /// `None`), in revision order
    fn pull_since(&self, since: Option<u64>)
        -> impl Future<Output = Result<Vec<RemoteRecord>>> + Send;
}

type Key = (EntityKind, String);

#[derive(Debug, Default)]
struct RemoteInner {
    records: HashMap<Key, RemoteRecord>,
    applied: HashSet<String>,
    revision: u64,
}

impl RemoteInner {
    fn write(&mut self, mut record: RemoteRecord) {
        self.revision += 1;
        record.revision = self.revision;
        let key = (record.entity_type, record.entity_id.clone());
        self.records.insert(key, record);
    }
}

/// In-process remote store with an availability switch
#[derive(Debug)]
pub struct MemoryRemote {
    inner: Mutex<RemoteInner>,
    available: AtomicBool,
    /// Fail every push after this many successful ones (0 = never)
    fail_after: AtomicUsize,
    pushes: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RemoteInner::default()),
            available: AtomicBool::new(true),
            fail_after: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Let `n` pushes through, then fail the rest
    pub fn fail_after(&self, n: usize) {
        self.pushes.store(0, Ordering::SeqCst);
        self.fail_after.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Write a record directly, as another device would
    pub fn seed(&self, record: RemoteRecord) {
        self.inner.lock().write(record);
    }

    pub fn record(&self, kind: EntityKind, entity_id: &str) -> Option<RemoteRecord> {
        self.inner
            .lock()
            .records
            .get(&(kind, entity_id.to_owned()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn round_trip(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::sync("remote store unreachable"));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemote {
    async fn push(&self, change: &PendingChange) -> Result<PushResult> {
        self.round_trip().await?;

        let limit = self.fail_after.load(Ordering::SeqCst);
        if limit > 0 && self.pushes.fetch_add(1, Ordering::SeqCst) >= limit {
            return Err(Error::sync("remote store rejected the write"));
        }

        let mut inner = self.inner.lock();
        if inner.applied.contains(&change.id) {
            debug!(change = %change.id, "duplicate push");
            return Ok(PushResult::Duplicate);
        }

        let key = (change.entity_type, change.entity_id.clone());
        if let Some(existing) = inner.records.get(&key) {
            if existing.updated_at > change.local_timestamp {
                return Ok(PushResult::Conflict(existing.clone()));
            }
        }

        inner.write(RemoteRecord::from_change(change));
        inner.applied.insert(change.id.clone());
        Ok(PushResult::Applied)
    }

    async fn push_resolved(&self, record: RemoteRecord) -> Result<()> {
        self.round_trip().await?;
        self.inner.lock().write(record);
        Ok(())
    }

    async fn pull_since(&self, since: Option<u64>) -> Result<Vec<RemoteRecord>> {
        self.round_trip().await?;
        let mut records: Vec<RemoteRecord> = self
            .inner
            .lock()
            .records
            .values()
            .filter(|r| since.map_or(true, |since| r.revision > since))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.revision);
        Ok(records)
    }
}
