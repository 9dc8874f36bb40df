use std::time::Duration;

use serde::Serialize;

/// Negotiation state of one call
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Idle,
    /// Initiator: building and sending the offer
    Offering,
    AwaitingAnswer,
    /// Responder: applying the offer and sending the answer
    Answering,
    /// Descriptions exchanged, transport still negotiating
    Connecting,
    Connected,
    /// Transport lost; inside the recovery grace period
    Disconnected,
    Closed,
}

impl CallState {
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// States in which the call holds local media
    pub fn holds_media(self) -> bool {
        !matches!(self, Self::Idle | Self::Closed)
    }

    pub fn badge(self) -> ConnectionStatus {
        match self {
            Self::Offering | Self::AwaitingAnswer | Self::Answering | Self::Connecting => {
                ConnectionStatus::Connecting
            }
            Self::Connected => ConnectionStatus::Connected,
            Self::Idle | Self::Disconnected | Self::Closed => ConnectionStatus::Disconnected,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Status badge shown next to the video
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Read-only snapshot published after every transition
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub connection: ConnectionStatus,
    pub role: Option<Role>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub last_error: Option<String>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            connection: ConnectionStatus::Disconnected,
            role: None,
            audio_enabled: false,
            video_enabled: false,
            last_error: None,
        }
    }
}

/// What `end_call` reports back
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub session_id: String,
    pub role: Option<Role>,
    /// Time spent connected, zero if the call never connected
    pub connected_for: Duration,
    pub was_connected: bool,
}
