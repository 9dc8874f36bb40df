use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;

/// Remote candidates that arrived before the connection could take them
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) {
        debug!(candidate = %candidate.candidate, "buffering remote candidate");
        self.pending.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending)
    }
}

/// Apply every buffered candidate once the remote description is in place.
/// Returns how many were accepted.
pub async fn apply_pending_candidates<T: PeerTransport>(
    transport: &T,
    buffer: &mut CandidateBuffer,
) -> usize {
    let candidates = buffer.drain();
    let total = candidates.len();
    let mut applied = 0;

    for candidate in candidates {
        debug!(candidate = %candidate.candidate, "applying buffered candidate");
        match transport.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => warn!(error = %e, "failed to apply buffered candidate"),
        }
    }

    if total > 0 {
        info!(applied, total, "flushed buffered remote candidates");
    }
    applied
}

/// Peer connection configuration for the given ICE servers
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "local candidate analysis"
    );
    if summary.relay == 0 {
        // expected without TURN; symmetric NATs may not connect
        info!("no relay candidates gathered");
    }
    summary
}
