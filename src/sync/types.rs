use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::store::EntityKind;
use crate::sync::remote::RemoteRecord;
use crate::utils::{now_millis, random_id};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// A local mutation waiting to be pushed
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub id: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    /// Unix millis of the local edit
    pub local_timestamp: i64,
}

impl PendingChange {
    pub fn new(
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Value,
    ) -> Self {
        Self {
            id: random_id(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            local_timestamp: now_millis(),
        }
    }

    pub fn create(entity_type: EntityKind, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(entity_type, entity_id, Operation::Create, payload)
    }

    pub fn update(entity_type: EntityKind, entity_id: impl Into<String>, payload: Value) -> Self {
        Self::new(entity_type, entity_id, Operation::Update, payload)
    }

    pub fn delete(entity_type: EntityKind, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, entity_id, Operation::Delete, Value::Null)
    }

    #[must_use]
    pub fn at(mut self, local_timestamp: i64) -> Self {
        self.local_timestamp = local_timestamp;
        self
    }

    /// The record as it should be stored, with `id` set to the entity id
    pub fn record(&self) -> Value {
        let mut record = match &self.payload {
            Value::Object(_) => self.payload.clone(),
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        if let Value::Object(map) = &mut record {
            map.insert("id".into(), Value::String(self.entity_id.clone()));
        }
        record
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    ConflictsPending,
}

/// Observable sync status; only the coordinator writes it
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncState {
    pub is_online: bool,
    pub last_sync_at: Option<i64>,
    /// Highest remote revision already pulled
    pub remote_cursor: Option<u64>,
    pub pending_count: usize,
    /// Conflicts that needed resolution during the last completed cycle
    pub conflict_count: usize,
    /// Conflicts waiting in the review queue
    pub unresolved_count: usize,
    pub progress_percent: u8,
    pub phase: SyncPhase,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    /// Conflicts settled automatically
    pub resolved: usize,
    /// Conflicts handed to the review queue
    pub queued_for_review: usize,
}

impl SyncReport {
    pub fn conflicts(&self) -> usize {
        self.resolved + self.queued_for_review
    }
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
    /// The cycle stopped early; the pending queue is untouched
    Failed(Error),
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// A change the resolver could not settle on its own
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Conflict {
    pub change: PendingChange,
    pub remote: RemoteRecord,
    pub detected_at: i64,
}
