use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::signaling::types::{SignalDocument, SignalMessage};

/// Session-scoped, append-only store of signaling messages.
///
/// Implementations persist each message under `(timestamp, sequence)` and
/// never overwrite. `clear` is best-effort: when it fails the message stays in
/// the snapshot and [`listen`] suppresses the redelivery.
pub trait SignalChannel: Send + Sync + 'static {
    /// Append a message to the session. Returns the stored message id.
    fn send(
        &self,
        session_id: &str,
        message: &SignalMessage,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Undelivered documents of the session, in key order
    fn snapshot(&self, session_id: &str) -> impl Future<Output = Result<Vec<SignalDocument>>> + Send;

    /// Acknowledge a consumed message
    fn clear(&self, session_id: &str, message_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Change notifications for the session
    fn watch(&self, session_id: &str) -> Result<broadcast::Receiver<()>>;
}

/// Live subscription created by [`listen`]. Delivery stops as soon as it is
/// unsubscribed or dropped.
#[derive(Debug)]
pub struct Subscription {
    session_id: String,
    participant_id: String,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!(
                session = %self.session_id,
                participant = %self.participant_id,
                "unsubscribing from signal channel"
            );
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Deliver every message addressed to `participant_id` in `session_id` to
/// `on_message`, once, then clear it from the channel.
pub fn listen<C, F>(
    channel: Arc<C>,
    session_id: impl Into<String>,
    participant_id: impl Into<String>,
    mut on_message: F,
) -> Result<Subscription>
where
    C: SignalChannel,
    F: FnMut(SignalMessage) + Send + 'static,
{
    let session_id = session_id.into();
    let participant_id = participant_id.into();

    // subscribe before the first snapshot so nothing slips in between
    let mut updates = channel.watch(&session_id)?;

    let task = tokio::spawn({
        let session_id = session_id.clone();
        let participant_id = participant_id.clone();
        async move {
            // delivered but not yet cleared
            let mut uncleared: HashSet<String> = HashSet::new();

            loop {
                match channel.snapshot(&session_id).await {
                    Ok(docs) => {
                        for doc in docs.into_iter().filter(|d| d.to == participant_id) {
                            if uncleared.contains(&doc.id) {
                                // redelivery after a failed clear; try again
                                if channel.clear(&session_id, &doc.id).await.is_ok() {
                                    uncleared.remove(&doc.id);
                                }
                                continue;
                            }

                            match doc.to_message() {
                                Ok(msg) => {
                                    debug!(
                                        session = %session_id,
                                        id = %msg.id,
                                        kind = ?msg.kind(),
                                        from = %msg.from,
                                        "delivering signal"
                                    );
                                    on_message(msg);
                                }
                                Err(e) => {
                                    warn!(session = %session_id, id = %doc.id, error = %e, "dropping undecodable signal");
                                }
                            }

                            if let Err(e) = channel.clear(&session_id, &doc.id).await {
                                warn!(session = %session_id, id = %doc.id, error = %e, "failed to clear consumed signal");
                                uncleared.insert(doc.id);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "signal snapshot failed");
                    }
                }

                match updates.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    Ok(Subscription {
        session_id,
        participant_id,
        task: Some(task),
    })
}
