use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{EntityKind, LocalStore};
use crate::sync::queue::{PendingQueue, ReviewQueue};
use crate::sync::remote::{PushResult, RemoteRecord, RemoteStore};
use crate::sync::resolver::{ConflictResolver, Decision, LastWriterWins, Resolution};
use crate::sync::types::{
    Conflict, Operation, PendingChange, SkipReason, SyncOutcome, SyncPhase, SyncReport, SyncState,
};
use crate::utils::now_millis;

/// Owns the pending queue and the sync status. Mutations go to local storage
/// first and are pushed when a cycle runs.
pub struct SyncCoordinator<R, X = LastWriterWins> {
    store: Arc<LocalStore>,
    queue: PendingQueue,
    remote: Arc<R>,
    resolver: X,
    state: watch::Sender<SyncState>,
    syncing: AtomicBool,
    review: ReviewQueue,
}

/// Clears the in-progress flag however the cycle ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<R: RemoteStore> SyncCoordinator<R, LastWriterWins> {
    /// Open the pending and review queues next to the local stores
    pub async fn open(store: Arc<LocalStore>, remote: Arc<R>) -> Result<Self> {
        let queue = PendingQueue::open(store.dir()).await?;
        let review = ReviewQueue::open(store.dir()).await?;
        let pending = queue.len();
        let unresolved = review.len();
        let (state, _) = watch::channel(SyncState {
            pending_count: pending,
            unresolved_count: unresolved,
            phase: phase_for(unresolved),
            ..SyncState::default()
        });

        if pending > 0 || unresolved > 0 {
            info!(pending, unresolved, "restored sync queues");
        }

        Ok(Self {
            store,
            queue,
            remote,
            resolver: LastWriterWins::default(),
            state,
            syncing: AtomicBool::new(false),
            review,
        })
    }
}

impl<R, X> SyncCoordinator<R, X>
where
    R: RemoteStore,
    X: ConflictResolver,
{
    pub fn with_resolver<Y: ConflictResolver>(self, resolver: Y) -> SyncCoordinator<R, Y> {
        SyncCoordinator {
            store: self.store,
            queue: self.queue,
            remote: self.remote,
            resolver,
            state: self.state,
            syncing: self.syncing,
            review: self.review,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Conflicts waiting for [`resolve_conflict`](Self::resolve_conflict)
    pub fn review_queue(&self) -> Vec<Conflict> {
        self.review.snapshot()
    }

    /// Record a connectivity change. Coming back online with pending changes
    /// starts a sync cycle, whose outcome is returned.
    pub async fn set_online(&self, online: bool) -> Option<SyncOutcome> {
        let was_online = self.state.borrow().is_online;
        if was_online == online {
            return None;
        }

        info!(online, "connectivity changed");
        self.state.send_modify(|s| s.is_online = online);

        if online && !self.queue.is_empty() {
            Some(self.sync_now().await)
        } else {
            None
        }
    }

    /// Follow a connectivity signal until its sender goes away
    pub async fn run_connectivity(&self, mut online: watch::Receiver<bool>) {
        let current = *online.borrow_and_update();
        self.set_online(current).await;

        while online.changed().await.is_ok() {
            let current = *online.borrow_and_update();
            if let Some(outcome) = self.set_online(current).await {
                debug!(?outcome, "connectivity-triggered sync finished");
            }
        }
        debug!("connectivity signal closed");
    }

    /// Apply a local mutation and queue it for the next cycle
    pub async fn enqueue(&self, change: PendingChange) -> Result<()> {
        let kind = change.entity_type;
        let previous = self.store.get(kind, &change.entity_id);
        self.apply_local_change(&change).await?;

        let (id, entity_id, op) = (change.id.clone(), change.entity_id.clone(), change.operation);
        match self.queue.push(change).await {
            Ok(pending) => {
                debug!(change = %id, entity = %kind, id = %entity_id, ?op, "change queued");
                self.state.send_modify(|s| s.pending_count = pending);
                Ok(())
            }
            Err(e) => {
                // the local write must not outlive a change that was never queued
                warn!(change = %id, error = %e, "queueing failed, rolling back local write");
                let rollback = match previous {
                    Some(record) => self.store.put(kind, record).await,
                    None => self.store.delete(kind, &entity_id).await.map(|_| ()),
                };
                if let Err(re) = rollback {
                    warn!(entity = %entity_id, error = %re, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run one push/resolve/pull cycle
    pub async fn sync_now(&self) -> SyncOutcome {
        if !self.state.borrow().is_online {
            debug!("offline, sync skipped");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("sync already running");
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        }
        let _guard = CycleGuard(&self.syncing);

        self.state.send_modify(|s| {
            s.phase = SyncPhase::Syncing;
            s.progress_percent = 0;
            s.last_error = None;
        });

        match self.run_cycle().await {
            Ok((report, cursor)) => {
                let pending = self.queue.len();
                let unresolved = self.review.len();
                info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    conflicts = report.conflicts(),
                    pending,
                    "sync completed"
                );
                self.state.send_modify(|s| {
                    s.pending_count = pending;
                    s.last_sync_at = Some(now_millis());
                    s.remote_cursor = cursor;
                    s.conflict_count = report.conflicts();
                    s.unresolved_count = unresolved;
                    s.progress_percent = 100;
                    s.phase = phase_for(unresolved);
                });
                SyncOutcome::Completed(report)
            }
            Err(e) => {
                warn!(error = %e, "sync failed");
                let unresolved = self.review.len();
                self.state.send_modify(|s| {
                    s.last_error = Some(e.to_string());
                    s.progress_percent = 0;
                    s.phase = phase_for(unresolved);
                });
                SyncOutcome::Failed(e)
            }
        }
    }

    /// Returns the report and the remote cursor to resume from
    async fn run_cycle(&self) -> Result<(SyncReport, Option<u64>)> {
        let pending = self.queue.snapshot();
        let total_steps = pending.len() + 1;
        let mut report = SyncReport::default();
        let mut done = HashSet::with_capacity(pending.len());
        let mut for_review = Vec::new();

        for (step, change) in pending.iter().enumerate() {
            match self.remote.push(change).await? {
                PushResult::Applied | PushResult::Duplicate => report.pushed += 1,
                PushResult::Conflict(remote) => match self.resolver.resolve(change, &remote) {
                    Decision::Resolved(resolution) => {
                        debug!(entity = %change.entity_id, ?resolution, "conflict resolved");
                        self.apply_resolution(change, &remote, resolution).await?;
                        report.resolved += 1;
                    }
                    Decision::NeedsReview => {
                        debug!(entity = %change.entity_id, "conflict needs review");
                        for_review.push(Conflict {
                            change: change.clone(),
                            remote,
                            detected_at: now_millis(),
                        });
                    }
                },
            }
            done.insert(change.id.clone());
            self.set_progress(step + 1, total_steps);
        }

        let cursor = self.state.borrow().remote_cursor;
        let pulled = self.remote.pull_since(cursor).await?;

        let held: HashSet<EntityKey> = for_review
            .iter()
            .chain(self.review.snapshot().iter())
            .map(|c| entity_key(&c.change))
            .collect();
        // enqueued while this cycle was pushing
        let queued: HashSet<EntityKey> = self
            .queue
            .snapshot()
            .iter()
            .filter(|c| !done.contains(&c.id))
            .map(entity_key)
            .collect();

        let mut next_cursor = cursor;
        let mut blocked = false;
        for record in pulled {
            let key = (record.entity_type, record.entity_id.clone());
            if queued.contains(&key) {
                // re-pulled once the local change has been pushed
                blocked = true;
                continue;
            }
            if !blocked {
                next_cursor = Some(record.revision);
            }
            if held.contains(&key) {
                continue;
            }
            self.apply_remote_record(&record).await?;
            report.pulled += 1;
        }
        self.set_progress(total_steps, total_steps);

        // review entries land before the queue forgets their changes
        report.queued_for_review = for_review.len();
        self.review
            .extend_new(for_review, |a, b| a.change.id == b.change.id)
            .await?;
        self.queue.retain(|c| !done.contains(&c.id)).await?;
        Ok((report, next_cursor))
    }

    /// Settle a conflict from the review queue
    pub async fn resolve_conflict(&self, entity_id: &str, resolution: Resolution) -> Result<()> {
        let conflict = self
            .review
            .snapshot()
            .into_iter()
            .find(|c| c.change.entity_id == entity_id)
            .ok_or_else(|| Error::invalid_state(format!("no conflict for {entity_id}")))?;

        self.apply_resolution(&conflict.change, &conflict.remote, resolution)
            .await?;

        let unresolved = self
            .review
            .retain(|c| c.change.id != conflict.change.id)
            .await?;
        info!(entity = %entity_id, unresolved, "conflict resolved by review");
        self.state.send_modify(|s| {
            s.unresolved_count = unresolved;
            if s.phase != SyncPhase::Syncing {
                s.phase = phase_for(unresolved);
            }
        });
        Ok(())
    }

    async fn apply_resolution(
        &self,
        change: &PendingChange,
        remote: &RemoteRecord,
        resolution: Resolution,
    ) -> Result<()> {
        match resolution {
            Resolution::KeepLocal => {
                let mut winner = RemoteRecord::from_change(change);
                winner.updated_at = now_millis().max(remote.updated_at + 1);
                self.remote.push_resolved(winner).await?;
                self.apply_local_change(change).await
            }
            Resolution::KeepRemote => self.apply_remote_record(remote).await,
            Resolution::Merged(data) => {
                let merged = RemoteRecord {
                    entity_type: change.entity_type,
                    entity_id: change.entity_id.clone(),
                    data,
                    updated_at: now_millis().max(remote.updated_at + 1),
                    deleted: false,
                    revision: 0,
                };
                self.remote.push_resolved(merged.clone()).await?;
                self.apply_remote_record(&merged).await
            }
        }
    }

    async fn apply_local_change(&self, change: &PendingChange) -> Result<()> {
        match change.operation {
            Operation::Delete => {
                self.store.delete(change.entity_type, &change.entity_id).await?;
            }
            Operation::Create | Operation::Update => {
                self.store.put(change.entity_type, change.record()).await?;
            }
        }
        Ok(())
    }

    async fn apply_remote_record(&self, record: &RemoteRecord) -> Result<()> {
        if record.deleted {
            self.store.delete(record.entity_type, &record.entity_id).await?;
            return Ok(());
        }

        let mut data = record.data.clone();
        if let serde_json::Value::Object(map) = &mut data {
            map.insert("id".into(), record.entity_id.clone().into());
        }
        self.store.put(record.entity_type, data).await
    }

    fn set_progress(&self, done: usize, total: usize) {
        let percent = (done * 100 / total.max(1)).min(100) as u8;
        self.state.send_modify(|s| s.progress_percent = percent);
    }
}

type EntityKey = (EntityKind, String);

fn entity_key(change: &PendingChange) -> EntityKey {
    (change.entity_type, change.entity_id.clone())
}

fn phase_for(unresolved: usize) -> SyncPhase {
    if unresolved > 0 {
        SyncPhase::ConflictsPending
    } else {
        SyncPhase::Idle
    }
}
