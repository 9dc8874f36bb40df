//! Per-call offer/answer state machine.
//!
//! A [`Negotiator`] owns everything one call needs: the peer transport, the
//! local stream, the buffer of early remote candidates and the signaling
//! subscription. Inbound signals and transport events are funnelled into the
//! negotiator and processed one at a time by [`Negotiator::pump`], so state
//! is only ever mutated from the caller's task.
//!
//! ```text
//! Idle -> Offering -> AwaitingAnswer -> Connecting -> Connected <-> Disconnected
//!   \---> Answering -------------------/                  any state -> Closed
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::events::{CallEvent, EventEmitter};
use crate::media::{LocalStream, MediaConstraints, MediaDevices, TrackKind};
use crate::peer::ice::{apply_pending_candidates, CandidateBuffer};
use crate::peer::state::{CallState, CallStatus, CallSummary, Role};
use crate::peer::transport::{PeerTransport, TransportFactory};
use crate::peer::types::{IceCandidate, PeerState, SdpKind, SessionDescription, TransportEvent};
use crate::session::Session;
use crate::signaling::{listen, SignalBody, SignalChannel, SignalMessage, Subscription};

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// How long a disconnected transport may take to come back
    pub grace_period: Duration,
    /// Extra attempts for each signaling write
    pub send_retries: u32,
    pub constraints: MediaConstraints,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for NegotiatorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            send_retries: config.signal_send_retries,
            constraints: MediaConstraints::default(),
        }
    }
}

pub struct Negotiator<C, F, D>
where
    F: TransportFactory,
{
    session: Session,
    local_id: String,
    remote_id: String,
    channel: Arc<C>,
    factory: F,
    devices: D,
    config: NegotiatorConfig,

    state: CallState,
    role: Option<Role>,
    transport: Option<F::Transport>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    stream: Option<LocalStream>,
    candidates: CandidateBuffer,
    remote_applied: bool,

    subscription: Option<Subscription>,
    inbox_tx: mpsc::UnboundedSender<SignalMessage>,
    inbox_rx: mpsc::UnboundedReceiver<SignalMessage>,
    processed: HashSet<String>,

    grace_deadline: Option<Instant>,
    connected_at: Option<Instant>,
    connected_for: Duration,
    was_connected: bool,
    last_error: Option<String>,

    status: watch::Sender<CallStatus>,
    events: EventEmitter,
}

impl<C, F, D> Negotiator<C, F, D>
where
    C: SignalChannel,
    F: TransportFactory,
    D: MediaDevices,
{
    pub fn new(
        session: Session,
        local_id: impl Into<String>,
        channel: Arc<C>,
        factory: F,
        devices: D,
        config: NegotiatorConfig,
    ) -> Result<Self> {
        let local_id = local_id.into();
        let remote_id = session
            .peer_of(&local_id)
            .ok_or_else(|| {
                Error::invalid_state(format!(
                    "{local_id} is not a participant of session {}",
                    session.id
                ))
            })?
            .to_owned();

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(CallStatus::default());

        Ok(Self {
            session,
            local_id,
            remote_id,
            channel,
            factory,
            devices,
            config,
            state: CallState::Idle,
            role: None,
            transport: None,
            transport_rx: None,
            stream: None,
            candidates: CandidateBuffer::default(),
            remote_applied: false,
            subscription: None,
            inbox_tx,
            inbox_rx,
            processed: HashSet::new(),
            grace_deadline: None,
            connected_at: None,
            connected_for: Duration::ZERO,
            was_connected: false,
            last_error: None,
            status,
            events: EventEmitter::new(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> Option<&F::Transport> {
        self.transport.as_ref()
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    /// Remote candidates waiting for a remote description
    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Start receiving the signals addressed to the local participant
    pub fn join(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::invalid_state("cannot join a closed call"));
        }
        if self.subscription.is_some() {
            return Ok(());
        }

        let inbox = self.inbox_tx.clone();
        let subscription = listen(
            Arc::clone(&self.channel),
            self.session.id.clone(),
            self.local_id.clone(),
            move |msg| {
                // receiver lives as long as the negotiator
                let _ = inbox.send(msg);
            },
        )?;
        self.subscription = Some(subscription);

        info!(session = %self.session.id, participant = %self.local_id, "joined session signaling");
        Ok(())
    }

    /// Initiator path: acquire media, create the offer and send it to the
    /// other participant.
    pub async fn start_call(&mut self) -> Result<()> {
        if self.state != CallState::Idle {
            return Err(Error::invalid_state(format!(
                "cannot start a call in state {:?}",
                self.state
            )));
        }

        self.role = Some(Role::Initiator);
        self.set_state(CallState::Offering);

        match self.place_offer().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(e).await),
        }
    }

    async fn place_offer(&mut self) -> Result<()> {
        self.join()?;
        self.open_media().await?;
        self.open_transport().await?;

        let offer = self.active_transport()?.create_offer().await?;
        self.send_signal(SignalBody::Offer(offer)).await?;

        self.set_state(CallState::AwaitingAnswer);
        Ok(())
    }

    /// Apply one inbound signal. Duplicate ids are ignored.
    pub async fn handle_incoming(&mut self, msg: SignalMessage) -> Result<()> {
        if self.state.is_closed() {
            debug!(id = %msg.id, "call closed, ignoring signal");
            return Ok(());
        }
        if msg.to != self.local_id {
            debug!(id = %msg.id, to = %msg.to, "signal not addressed to us");
            return Ok(());
        }
        if !self.processed.insert(msg.id.clone()) {
            debug!(id = %msg.id, "duplicate signal ignored");
            return Ok(());
        }

        match msg.body {
            SignalBody::Offer(desc) => {
                if self.state != CallState::Idle {
                    warn!(state = ?self.state, from = %msg.from, "unexpected offer ignored");
                    return Ok(());
                }
                self.role = Some(Role::Responder);
                self.set_state(CallState::Answering);

                match self.accept_offer(desc).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.abort(e).await),
                }
            }
            SignalBody::Answer(desc) => {
                if self.state != CallState::AwaitingAnswer {
                    warn!(state = ?self.state, from = %msg.from, "unexpected answer ignored");
                    return Ok(());
                }

                match self.accept_answer(desc).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.abort(e).await),
                }
            }
            SignalBody::IceCandidate(candidate) => {
                self.add_remote_candidate(candidate).await;
                Ok(())
            }
        }
    }

    async fn accept_offer(&mut self, desc: SessionDescription) -> Result<()> {
        expect_kind(&desc, SdpKind::Offer)?;
        self.open_media().await?;
        self.open_transport().await?;

        self.apply_remote(desc).await?;

        let answer = self.active_transport()?.create_answer().await?;
        self.send_signal(SignalBody::Answer(answer)).await?;

        self.set_state(CallState::Connecting);
        Ok(())
    }

    async fn accept_answer(&mut self, desc: SessionDescription) -> Result<()> {
        expect_kind(&desc, SdpKind::Answer)?;
        self.apply_remote(desc).await?;
        self.set_state(CallState::Connecting);
        Ok(())
    }

    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no peer connection"))?;

        transport.set_remote_description(desc).await?;
        self.remote_applied = true;
        apply_pending_candidates(transport, &mut self.candidates).await;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.transport.as_ref() {
            Some(transport) if self.remote_applied => {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    warn!(error = %e, "remote candidate rejected");
                }
            }
            _ => self.candidates.push(candidate),
        }
    }

    /// Wait for the next inbound signal, transport event or grace-period
    /// expiry and process it.
    pub async fn pump(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::invalid_state("call is closed"));
        }

        let deadline = self.grace_deadline;
        tokio::select! {
            Some(msg) = self.inbox_rx.recv() => self.handle_incoming(msg).await,
            Some(event) = next_transport_event(&mut self.transport_rx) => {
                self.handle_transport_event(event).await
            }
            () = grace_timer(deadline) => self.grace_expired().await,
            else => Ok(()),
        }
    }

    /// Pump until the call reaches `target`. Fails if the call closes first.
    pub async fn pump_until(&mut self, target: CallState) -> Result<()> {
        while self.state != target {
            if self.state.is_closed() {
                return Err(Error::invalid_state(format!(
                    "call closed before reaching {target:?}"
                )));
            }
            self.pump().await?;
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.send_signal(SignalBody::IceCandidate(candidate)).await {
                    return Err(self.abort(e).await);
                }
                Ok(())
            }
            TransportEvent::GatheringComplete => {
                debug!(session = %self.session.id, "local candidate gathering complete");
                Ok(())
            }
            TransportEvent::StateChanged(peer_state) => self.on_peer_state(peer_state).await,
        }
    }

    async fn on_peer_state(&mut self, peer_state: PeerState) -> Result<()> {
        match peer_state {
            PeerState::New | PeerState::Connecting => Ok(()),
            PeerState::Connected => {
                match self.state {
                    CallState::Disconnected => {
                        self.grace_deadline = None;
                        self.set_state(CallState::Connected);
                        if self.was_connected {
                            info!(session = %self.session.id, "connection recovered");
                            self.events.emit_connection_recovered();
                        }
                        self.was_connected = true;
                        self.connected_at.get_or_insert_with(Instant::now);
                        self.events.emit_connected();
                    }
                    CallState::Connected | CallState::Idle | CallState::Closed => {}
                    _ => {
                        self.was_connected = true;
                        self.connected_at.get_or_insert_with(Instant::now);
                        self.set_state(CallState::Connected);
                        self.events.emit_connected();
                    }
                }
                Ok(())
            }
            PeerState::Disconnected => {
                if matches!(self.state, CallState::Connected | CallState::Connecting) {
                    let grace = self.config.grace_period;
                    warn!(session = %self.session.id, ?grace, "peer disconnected, waiting for recovery");
                    self.grace_deadline = Some(Instant::now() + grace);
                    self.set_state(CallState::Disconnected);
                    self.events.emit_connection_problem();
                    self.events.emit_connection_recovering();
                }
                Ok(())
            }
            PeerState::Failed => Err(self.abort(Error::connectivity("peer connection failed")).await),
            PeerState::Closed => {
                info!(session = %self.session.id, "peer connection closed");
                self.teardown().await;
                self.events.emit_disconnected();
                Ok(())
            }
        }
    }

    async fn grace_expired(&mut self) -> Result<()> {
        self.grace_deadline = None;
        if self.state != CallState::Disconnected {
            return Ok(());
        }
        let grace = self.config.grace_period;
        Err(self
            .abort(Error::connectivity(format!(
                "connection did not recover within {grace:?}"
            )))
            .await)
    }

    /// Mute or unmute the local track of `kind`. Returns the new value.
    pub fn toggle_track(&mut self, kind: TrackKind) -> Result<bool> {
        if !self.state.holds_media() {
            return Err(Error::invalid_state(format!(
                "no media to toggle in state {:?}",
                self.state
            )));
        }
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no local media"))?;

        let enabled = stream.toggle_track(kind)?;
        self.publish();
        Ok(enabled)
    }

    /// Hang up. Safe to call from any state, any number of times.
    pub async fn end_call(&mut self) -> CallSummary {
        if !self.state.is_closed() {
            let was_live = matches!(self.state, CallState::Connected | CallState::Disconnected);
            info!(session = %self.session.id, state = ?self.state, "ending call");
            self.teardown().await;
            if was_live {
                self.events.emit_disconnected();
            }
        }

        CallSummary {
            session_id: self.session.id.clone(),
            role: self.role,
            connected_for: self.connected_for,
            was_connected: self.was_connected,
        }
    }

    async fn open_media(&mut self) -> Result<()> {
        let stream = self.devices.acquire(&self.config.constraints).await?;
        self.stream = Some(stream);
        self.publish();
        Ok(())
    }

    async fn open_transport(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(tx).await?;

        // stored before attaching so a failed attach still gets closed on teardown
        self.transport = Some(transport);
        self.transport_rx = Some(rx);

        if let (Some(transport), Some(stream)) = (self.transport.as_ref(), self.stream.as_ref()) {
            transport.attach_stream(stream).await?;
        }
        Ok(())
    }

    fn active_transport(&self) -> Result<&F::Transport> {
        self.transport
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no peer connection"))
    }

    async fn send_signal(&self, body: SignalBody) -> Result<()> {
        let msg = SignalMessage::new(&self.local_id, &self.remote_id, body);
        let mut attempt = 0;

        loop {
            match self.channel.send(&self.session.id, &msg).await {
                Ok(_) => {
                    debug!(id = %msg.id, kind = ?msg.kind(), to = %msg.to, "signal sent");
                    return Ok(());
                }
                Err(e) if attempt < self.config.send_retries => {
                    attempt += 1;
                    warn!(id = %msg.id, attempt, error = %e, "signal send failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn abort(&mut self, err: Error) -> Error {
        warn!(session = %self.session.id, state = ?self.state, error = %err, "call aborted");
        self.last_error = Some(err.to_string());
        self.events.emit_connection_failed(err.to_string());
        self.teardown().await;
        err
    }

    async fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(stream) = self.stream.take() {
            stream.release();
        }
        self.candidates.clear();
        self.remote_applied = false;
        self.grace_deadline = None;
        self.transport_rx = None;
        if let Some(at) = self.connected_at.take() {
            self.connected_for += at.elapsed();
        }

        let transport = self.transport.take();
        self.set_state(CallState::Closed);
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    fn set_state(&mut self, next: CallState) {
        if self.state != next {
            info!(session = %self.session.id, from = ?self.state, to = ?next, "call state");
            self.state = next;
        }
        self.publish();
    }

    fn publish(&self) {
        let stream = self.stream.as_ref();
        self.status.send_replace(CallStatus {
            state: self.state,
            connection: self.state.badge(),
            role: self.role,
            audio_enabled: stream.is_some_and(|s| s.is_enabled(TrackKind::Audio)),
            video_enabled: stream.is_some_and(|s| s.is_enabled(TrackKind::Video)),
            last_error: self.last_error.clone(),
        });
    }
}

fn expect_kind(desc: &SessionDescription, kind: SdpKind) -> Result<()> {
    if desc.kind != kind {
        return Err(Error::negotiation(format!(
            "expected {kind:?} description, got {:?}",
            desc.kind
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(Error::negotiation("empty session description"));
    }
    Ok(())
}

async fn next_transport_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn grace_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
