//! Error types for the consultation core.
//!
//! Errors are grouped by the subsystem that raised them:
//!
//! - media capture: [`Error::MediaAccessDenied`], [`Error::DeviceUnavailable`]
//! - signaling: [`Error::ChannelWrite`], [`Error::ChannelRead`]
//! - negotiation: [`Error::NegotiationFailed`], [`Error::ConnectivityLost`],
//!   [`Error::InvalidState`]
//! - offline sync: [`Error::SyncCycleFailed`], [`Error::Storage`]
//! - everything else: [`Error::Config`], [`Error::Codec`]

use std::sync::Arc;
use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The user or platform refused camera/microphone access
    #[error("media access denied: {0}")]
    MediaAccessDenied(Arc<str>),

    /// A requested capture device does not exist or is busy
    #[error("device unavailable: {0}")]
    DeviceUnavailable(Arc<str>),

    /// Writing a signaling message failed
    #[error("signal channel write failed: {0}")]
    ChannelWrite(Arc<str>),

    /// Reading or decoding a signaling message failed
    #[error("signal channel read failed: {0}")]
    ChannelRead(Arc<str>),

    /// A session description was rejected or malformed
    #[error("negotiation failed: {0}")]
    NegotiationFailed(Arc<str>),

    /// A sync cycle could not complete
    #[error("sync cycle failed: {0}")]
    SyncCycleFailed(Arc<str>),

    /// The peer connection failed or never recovered from a disconnect
    #[error("connectivity lost: {0}")]
    ConnectivityLost(Arc<str>),

    /// Operation not allowed in the current call state
    #[error("invalid state: {0}")]
    InvalidState(Arc<str>),

    /// Local persistence failure
    #[error("storage error: {0}")]
    Storage(Arc<str>),

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(Arc<str>),

    /// Payload encoding/decoding failure
    #[error("codec error: {0}")]
    Codec(Arc<str>),
}

impl Error {
    #[inline]
    pub fn media_denied(msg: impl Into<String>) -> Self {
        Self::MediaAccessDenied(Arc::from(msg.into()))
    }

    #[inline]
    pub fn device_unavailable(msg: impl Into<String>) -> Self {
        Self::DeviceUnavailable(Arc::from(msg.into()))
    }

    #[inline]
    pub fn channel_write(msg: impl Into<String>) -> Self {
        Self::ChannelWrite(Arc::from(msg.into()))
    }

    #[inline]
    pub fn channel_read(msg: impl Into<String>) -> Self {
        Self::ChannelRead(Arc::from(msg.into()))
    }

    #[inline]
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Self::NegotiationFailed(Arc::from(msg.into()))
    }

    #[inline]
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::SyncCycleFailed(Arc::from(msg.into()))
    }

    #[inline]
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::ConnectivityLost(Arc::from(msg.into()))
    }

    #[inline]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(Arc::from(msg.into()))
    }

    #[inline]
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(Arc::from(msg.into()))
    }

    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(Arc::from(msg.into()))
    }

    #[inline]
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(Arc::from(msg.into()))
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Self::negotiation(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::codec(e.to_string())
    }
}
