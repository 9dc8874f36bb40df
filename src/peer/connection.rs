use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::LocalStream;
use crate::peer::ice::{analyze_candidates, rtc_config};
use crate::peer::transport::{PeerTransport, TransportFactory};
use crate::peer::types::{IceCandidate, PeerState, ServerConfig, SessionDescription, TransportEvent};

/// Builds webrtc-rs peer connections with default codecs and interceptors
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            servers: config.ice_servers.clone(),
        }
    }

    pub fn with_servers(servers: Vec<ServerConfig>) -> Self {
        Self { servers }
    }
}

impl TransportFactory for RtcTransportFactory {
    type Transport = RtcTransport;

    async fn create(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<RtcTransport> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&self.servers)).await?);
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));

        install_handlers(&pc, events, Arc::clone(&gathered));
        info!(ice_servers = self.servers.len(), "peer connection created");

        Ok(RtcTransport { pc, gathered })
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
    gathered: Arc<Mutex<Vec<IceCandidate>>>,
) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        let gathered = Arc::clone(&gathered);
        Box::pin(async move {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        dump_candidate("LOCAL", &candidate);
                        gathered.lock().push(candidate.clone());
                        let _ = events.send(TransportEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!(error = %e, "could not serialize local candidate"),
                },
                None => {
                    // end of gathering
                    let snapshot = gathered.lock().clone();
                    analyze_candidates(&snapshot);
                    let _ = events.send(TransportEvent::GatheringComplete);
                }
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(|state| {
        debug!(?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    // weak ref: the handler is owned by the connection itself
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!(state = ?st, "peer connection state changed");

        let mapped = match st {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        };

        if matches!(mapped, PeerState::Disconnected | PeerState::Failed) {
            if let Some(pc) = weak.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }

        let _ = events.send(TransportEvent::StateChanged(mapped));
        Box::pin(async {})
    }));
}

/// webrtc-rs backed peer connection owned by one negotiator
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    gathered: Arc<Mutex<Vec<IceCandidate>>>,
}

impl RtcTransport {
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.gathered.lock().clone()
    }

    async fn local_description(&self) -> Result<SessionDescription> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::negotiation("local description missing after set"))?;
        SessionDescription::from_rtc(&local)
    }
}

impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        debug!("creating offer");
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        // trickle ICE: return without waiting for gathering
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        debug!("creating answer");
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        debug!(kind = ?desc.kind, "setting remote description");
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn attach_stream(&self, stream: &LocalStream) -> Result<()> {
        for track in stream.tracks() {
            let local: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
            let sender = self.pc.add_track(local).await?;

            // drain RTCP so the interceptors keep running
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            debug!(kind = %track.kind(), "track attached");
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "error while closing peer connection");
        }
    }
}
