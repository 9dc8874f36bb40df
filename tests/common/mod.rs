#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nabha_lib::error::{Error, Result};
use nabha_lib::media::LocalStream;
use nabha_lib::peer::types::{IceCandidate, PeerState, SessionDescription, TransportEvent};
use nabha_lib::peer::{PeerTransport, TransportFactory};
use nabha_lib::{MemorySignalChannel, Negotiator, NegotiatorConfig, Session, SyntheticDevices};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

pub type TestNegotiator = Negotiator<MemorySignalChannel, ScriptedFactory, SyntheticDevices>;

/// Everything a scripted transport was asked to do
#[derive(Debug, Default, Clone)]
pub struct TransportLog {
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub set_remote_calls: usize,
    pub applied_candidates: Vec<IceCandidate>,
    pub attached_tracks: usize,
    pub closed: bool,
}

struct Created {
    log: Arc<Mutex<TransportLog>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Deterministic stand-in for the webrtc-rs transport. Once both
/// descriptions are in place it reports `connecting` then `connected`
/// (unless `manual_connect` is set).
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    created: Arc<Mutex<Vec<Created>>>,
    local_candidates: Arc<Mutex<Vec<IceCandidate>>>,
    manual_connect: bool,
}

impl ScriptedFactory {
    pub fn new(label: &str) -> Self {
        let factory = Self::default();
        factory.local_candidates.lock().push(IceCandidate::host(format!(
            "candidate:{label} 1 udp 2130706431 127.0.0.1 50000 typ host"
        )));
        factory
    }

    pub fn manual_connect(mut self) -> Self {
        self.manual_connect = true;
        self
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// Log of the most recently created transport
    pub fn log(&self) -> TransportLog {
        self.created
            .lock()
            .last()
            .map(|c| c.log.lock().clone())
            .unwrap_or_default()
    }

    /// Push an event as if the transport raised it
    pub fn inject(&self, event: TransportEvent) -> bool {
        self.created
            .lock()
            .last()
            .is_some_and(|c| c.events.send(event).is_ok())
    }
}

impl TransportFactory for ScriptedFactory {
    type Transport = ScriptedTransport;

    async fn create(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<ScriptedTransport> {
        let log = Arc::new(Mutex::new(TransportLog::default()));
        self.created.lock().push(Created {
            log: Arc::clone(&log),
            events: events.clone(),
        });
        Ok(ScriptedTransport {
            log,
            events,
            local_candidates: self.local_candidates.lock().clone(),
            auto_connect: !self.manual_connect,
        })
    }
}

pub struct ScriptedTransport {
    log: Arc<Mutex<TransportLog>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    local_candidates: Vec<IceCandidate>,
    auto_connect: bool,
}

impl ScriptedTransport {
    pub fn log(&self) -> TransportLog {
        self.log.lock().clone()
    }

    fn set_local(&self, desc: SessionDescription) {
        self.log.lock().local_description = Some(desc);
        for candidate in &self.local_candidates {
            let _ = self.events.send(TransportEvent::LocalCandidate(candidate.clone()));
        }
        let _ = self.events.send(TransportEvent::GatheringComplete);
        self.maybe_connect();
    }

    fn maybe_connect(&self) {
        let ready = {
            let log = self.log.lock();
            log.local_description.is_some() && log.remote_description.is_some()
        };
        if ready && self.auto_connect {
            let _ = self.events.send(TransportEvent::StateChanged(PeerState::Connecting));
            let _ = self.events.send(TransportEvent::StateChanged(PeerState::Connected));
        }
    }
}

impl PeerTransport for ScriptedTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=scripted offer\r\n");
        self.set_local(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.log.lock().remote_description.is_none() {
            return Err(Error::negotiation("answer requested before offer"));
        }
        let answer = SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\ns=scripted answer\r\n");
        self.set_local(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if !desc.sdp.starts_with("v=0") {
            return Err(Error::negotiation("malformed session description"));
        }
        {
            let mut log = self.log.lock();
            log.set_remote_calls += 1;
            log.remote_description = Some(desc);
        }
        if self.log.lock().local_description.is_some() {
            self.maybe_connect();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut log = self.log.lock();
        if log.remote_description.is_none() {
            return Err(Error::negotiation("candidate before remote description"));
        }
        log.applied_candidates.push(candidate);
        Ok(())
    }

    async fn attach_stream(&self, stream: &LocalStream) -> Result<()> {
        self.log.lock().attached_tracks += stream.active_track_count();
        Ok(())
    }

    async fn close(&self) {
        self.log.lock().closed = true;
    }
}

pub struct Call {
    pub session: Session,
    pub channel: Arc<MemorySignalChannel>,
    pub doctor: TestNegotiator,
    pub patient: TestNegotiator,
    pub doctor_factory: ScriptedFactory,
    pub patient_factory: ScriptedFactory,
    pub doctor_devices: SyntheticDevices,
    pub patient_devices: SyntheticDevices,
}

pub fn test_config() -> NegotiatorConfig {
    NegotiatorConfig {
        grace_period: Duration::from_millis(100),
        send_retries: 1,
        ..NegotiatorConfig::default()
    }
}

pub fn call() -> Call {
    call_with(ScriptedFactory::new("doctor"), ScriptedFactory::new("patient"))
}

pub fn call_with(doctor_factory: ScriptedFactory, patient_factory: ScriptedFactory) -> Call {
    let session = Session::generate("doctor-1", "patient-1").unwrap();
    let channel = Arc::new(MemorySignalChannel::new());
    let doctor_devices = SyntheticDevices::new();
    let patient_devices = SyntheticDevices::new();

    let doctor = Negotiator::new(
        session.clone(),
        "doctor-1",
        Arc::clone(&channel),
        doctor_factory.clone(),
        doctor_devices.clone(),
        test_config(),
    )
    .unwrap();
    let patient = Negotiator::new(
        session.clone(),
        "patient-1",
        Arc::clone(&channel),
        patient_factory.clone(),
        patient_devices.clone(),
        test_config(),
    )
    .unwrap();

    Call {
        session,
        channel,
        doctor,
        patient,
        doctor_factory,
        patient_factory,
        doctor_devices,
        patient_devices,
    }
}

/// Pump one negotiator until it has nothing left to do for `idle`
pub async fn settle(negotiator: &mut TestNegotiator, idle: Duration) {
    while !negotiator.state().is_closed() {
        match timeout(idle, negotiator.pump()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => break,
        }
    }
}

/// Pump both sides in turn until `done` holds
pub async fn drive_until<P>(a: &mut TestNegotiator, b: &mut TestNegotiator, done: P)
where
    P: Fn(&TestNegotiator, &TestNegotiator) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(a, b) {
        assert!(
            Instant::now() < deadline,
            "timed out: a={:?} b={:?}",
            a.state(),
            b.state()
        );
        for negotiator in [&mut *a, &mut *b] {
            if !negotiator.state().is_closed() {
                let _ = timeout(Duration::from_millis(20), negotiator.pump()).await;
            }
        }
    }
}
