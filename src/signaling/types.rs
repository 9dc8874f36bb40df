use serde::{Deserialize, Serialize};

use crate::codec::{decode_payload, encode_payload};
use crate::error::{Error, Result};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::utils::{now_millis, random_id};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalBody {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// One negotiation step addressed from one participant to the other
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Unix millis at creation
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, body: SignalBody) -> Self {
        Self {
            id: random_id(),
            from: from.into(),
            to: to.into(),
            timestamp: now_millis(),
            body,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.body.kind()
    }
}

/// Stored form of a signal: `{id, to, from, type, data, timestamp}` with
/// `data` kept as an opaque encoded string
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalDocument {
    pub id: String,
    pub to: String,
    pub from: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: String,
    pub timestamp: i64,
}

impl SignalDocument {
    pub fn from_message(msg: &SignalMessage) -> Result<Self> {
        let data = match &msg.body {
            SignalBody::Offer(desc) | SignalBody::Answer(desc) => encode_payload(desc),
            SignalBody::IceCandidate(cand) => encode_payload(cand),
        }
        .map_err(|e| Error::channel_write(format!("cannot encode signal {}: {e}", msg.id)))?;

        Ok(Self {
            id: msg.id.clone(),
            to: msg.to.clone(),
            from: msg.from.clone(),
            kind: msg.kind(),
            data,
            timestamp: msg.timestamp,
        })
    }

    pub fn to_message(&self) -> Result<SignalMessage> {
        let read_err = |e: Error| Error::channel_read(format!("cannot decode signal {}: {e}", self.id));
        let body = match self.kind {
            SignalKind::Offer => SignalBody::Offer(decode_payload(&self.data).map_err(read_err)?),
            SignalKind::Answer => SignalBody::Answer(decode_payload(&self.data).map_err(read_err)?),
            SignalKind::IceCandidate => {
                SignalBody::IceCandidate(decode_payload(&self.data).map_err(read_err)?)
            }
        };

        Ok(SignalMessage {
            id: self.id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            timestamp: self.timestamp,
            body,
        })
    }
}
