use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::signaling::channel::SignalChannel;
use crate::signaling::types::{SignalDocument, SignalMessage};

const UPDATE_CAPACITY: usize = 32;

/// Ordering key inside a session: `(timestamp millis, write sequence)`
type SignalKey = (i64, u64);

struct SessionSlot {
    messages: BTreeMap<SignalKey, SignalDocument>,
    updates: broadcast::Sender<()>,
}

impl SessionSlot {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            messages: BTreeMap::new(),
            updates,
        }
    }
}

/// In-process signal channel. Availability and clear failures can be toggled
/// to exercise the retry and redelivery paths.
pub struct MemorySignalChannel {
    sessions: Mutex<HashMap<String, SessionSlot>>,
    seq: AtomicU64,
    available: AtomicBool,
    fail_clears: AtomicBool,
    total_sent: AtomicU64,
}

impl Default for MemorySignalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySignalChannel {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            available: AtomicBool::new(true),
            fail_clears: AtomicBool::new(false),
            total_sent: AtomicU64::new(0),
        }
    }

    /// Simulate the backend going away (writes and reads fail)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `clear` fail, leaving consumed messages in place
    pub fn set_fail_clears(&self, fail: bool) {
        self.fail_clears.store(fail, Ordering::SeqCst);
    }

    /// Messages currently stored for the session (delivered-but-uncleared included)
    pub fn pending(&self, session_id: &str) -> Vec<SignalDocument> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|slot| slot.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every message ever accepted by `send`, across sessions
    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::SeqCst)
    }

    /// Re-notify subscribers of a session without changing it
    pub fn poke(&self, session_id: &str) {
        if let Some(slot) = self.sessions.lock().get(session_id) {
            let _ = slot.updates.send(());
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

impl SignalChannel for MemorySignalChannel {
    async fn send(&self, session_id: &str, message: &SignalMessage) -> Result<String> {
        if !self.is_available() {
            return Err(Error::channel_write("signal backend unavailable"));
        }

        let doc = SignalDocument::from_message(message)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = doc.id.clone();

        let mut sessions = self.sessions.lock();
        let slot = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionSlot::new);
        slot.messages.insert((doc.timestamp, seq), doc);
        self.total_sent.fetch_add(1, Ordering::SeqCst);
        trace!(session = session_id, id = %id, seq, "signal stored");
        let _ = slot.updates.send(());

        Ok(id)
    }

    async fn snapshot(&self, session_id: &str) -> Result<Vec<SignalDocument>> {
        if !self.is_available() {
            return Err(Error::channel_read("signal backend unavailable"));
        }
        Ok(self.pending(session_id))
    }

    async fn clear(&self, session_id: &str, message_id: &str) -> Result<()> {
        if !self.is_available() || self.fail_clears.load(Ordering::SeqCst) {
            return Err(Error::channel_write(format!(
                "could not clear signal {message_id}"
            )));
        }

        let mut sessions = self.sessions.lock();
        if let Some(slot) = sessions.get_mut(session_id) {
            slot.messages.retain(|_, doc| doc.id != message_id);
            debug!(session = session_id, id = message_id, "signal cleared");
        }
        Ok(())
    }

    fn watch(&self, session_id: &str) -> Result<broadcast::Receiver<()>> {
        let mut sessions = self.sessions.lock();
        let slot = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionSlot::new);
        Ok(slot.updates.subscribe())
    }
}
