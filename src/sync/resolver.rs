use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::store::EntityKind;
use crate::sync::remote::RemoteRecord;
use crate::sync::types::{Operation, PendingChange};

/// How a conflict is settled
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// Replace both sides with this record
    Merged(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Resolved(Resolution),
    /// Leave it to a person
    NeedsReview,
}

pub trait ConflictResolver: Send + Sync + 'static {
    fn resolve(&self, local: &PendingChange, remote: &RemoteRecord) -> Decision;
}

/// Newest write wins. For the configured kinds (health records by default)
/// edits that touch disjoint fields are merged and edits that change the
/// same field differently go to review instead.
#[derive(Debug, Clone)]
pub struct LastWriterWins {
    review_kinds: HashSet<EntityKind>,
}

impl Default for LastWriterWins {
    fn default() -> Self {
        Self::with_review_kinds([EntityKind::HealthRecords])
    }
}

impl LastWriterWins {
    pub fn with_review_kinds(kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        Self {
            review_kinds: kinds.into_iter().collect(),
        }
    }

    /// Plain timestamp comparison for every kind
    pub fn never_review() -> Self {
        Self::with_review_kinds([])
    }

    fn by_timestamp(local: &PendingChange, remote: &RemoteRecord) -> Resolution {
        if local.local_timestamp >= remote.updated_at {
            Resolution::KeepLocal
        } else {
            Resolution::KeepRemote
        }
    }
}

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, local: &PendingChange, remote: &RemoteRecord) -> Decision {
        let reviewable = self.review_kinds.contains(&local.entity_type)
            && local.operation != Operation::Delete
            && !remote.deleted;

        if !reviewable {
            return Decision::Resolved(Self::by_timestamp(local, remote));
        }

        let (Value::Object(local_fields), Value::Object(remote_fields)) =
            (&local.payload, &remote.data)
        else {
            return Decision::Resolved(Self::by_timestamp(local, remote));
        };

        if clashing_fields(local_fields, remote_fields).is_empty() {
            Decision::Resolved(Resolution::Merged(merge(local, remote_fields)))
        } else {
            Decision::NeedsReview
        }
    }
}

/// Fields both sides set to different values
pub fn clashing_fields(local: &Map<String, Value>, remote: &Map<String, Value>) -> Vec<String> {
    local
        .iter()
        .filter(|(key, _)| key.as_str() != "id")
        .filter(|(key, value)| remote.get(key.as_str()).is_some_and(|r| r != *value))
        .map(|(key, _)| key.clone())
        .collect()
}

fn merge(local: &PendingChange, remote: &Map<String, Value>) -> Value {
    let mut merged = remote.clone();
    if let Value::Object(fields) = local.record() {
        merged.extend(fields);
    }
    Value::Object(merged)
}
