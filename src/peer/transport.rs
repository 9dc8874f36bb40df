use std::future::Future;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::LocalStream;
use crate::peer::types::{IceCandidate, SessionDescription, TransportEvent};

/// The peer connection as seen by the negotiator. Local candidates and
/// connection-state changes are reported on the event sender handed to
/// [`TransportFactory::create`].
pub trait PeerTransport: Send + Sync + 'static {
    /// Create an offer and install it as the local description
    fn create_offer(&self) -> impl Future<Output = Result<SessionDescription>> + Send;

    /// Create an answer and install it as the local description
    fn create_answer(&self) -> impl Future<Output = Result<SessionDescription>> + Send;

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_ice_candidate(&self, candidate: IceCandidate) -> impl Future<Output = Result<()>> + Send;

    /// Send the stream's tracks over this connection
    fn attach_stream(&self, stream: &LocalStream) -> impl Future<Output = Result<()>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait TransportFactory: Send + Sync + 'static {
    type Transport: PeerTransport;

    fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> impl Future<Output = Result<Self::Transport>> + Send;
}
