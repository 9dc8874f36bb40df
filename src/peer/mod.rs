pub mod connection;
pub mod ice;
pub mod negotiator;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RtcTransport, RtcTransportFactory};
pub use negotiator::{Negotiator, NegotiatorConfig};
pub use state::{CallState, CallStatus, CallSummary, ConnectionStatus, Role};
pub use transport::{PeerTransport, TransportFactory};
pub use types::{IceCandidate, PeerState, ServerConfig, SessionDescription, TransportEvent};
