//! JSON wire vocabulary spoken between the rendezvous server and its clients.
//!
//! Every frame is a JSON object carrying a `type` discriminator:
//!
//! | type        | direction      | fields                               |
//! |-------------|----------------|--------------------------------------|
//! | `matched`   | server → client | `match`, `offer`                    |
//! | `sdp`       | both           | `sdpType` (offer=0, answer=1), `sdp` |
//! | `ice`       | both           | `label`, `id`, `candidate`           |
//! | `peer-left` | server → client | none                                |

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Which half of the offer/answer exchange a descriptor belongs to.
///
/// Encoded on the wire as its ordinal (`offer = 0`, `answer = 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown descriptor kind {0}")]
pub struct UnknownDescriptorKind(pub u8);

impl TryFrom<u8> for DescriptorKind {
    type Error = UnknownDescriptorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DescriptorKind::Offer),
            1 => Ok(DescriptorKind::Answer),
            other => Err(UnknownDescriptorKind(other)),
        }
    }
}

impl From<DescriptorKind> for u8 {
    fn from(kind: DescriptorKind) -> Self {
        match kind {
            DescriptorKind::Offer => 0,
            DescriptorKind::Answer => 1,
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorKind::Offer => f.write_str("offer"),
            DescriptorKind::Answer => f.write_str("answer"),
        }
    }
}

/// Messages exchanged over a client's signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// The server paired this client with `match_id`. Exactly one side of a
    /// pair is told to make the offer.
    #[serde(rename = "matched")]
    Matched {
        #[serde(rename = "match")]
        match_id: String,
        #[serde(rename = "offer")]
        is_offerer: bool,
    },
    /// An offer or answer produced by a client's media transport.
    #[serde(rename = "sdp")]
    SessionDescriptor {
        #[serde(rename = "sdpType")]
        kind: DescriptorKind,
        #[serde(rename = "sdp")]
        payload: String,
    },
    /// A connectivity candidate produced by a client's media transport.
    #[serde(rename = "ice")]
    IceCandidate {
        #[serde(rename = "label")]
        media_line_index: u16,
        #[serde(rename = "id")]
        media_id: String,
        candidate: String,
    },
    /// The paired peer disconnected. Always synthesized by the server.
    #[serde(rename = "peer-left")]
    PeerLeft,
}

impl ClientMessage {
    pub const MATCHED: &'static str = "matched";
    pub const SDP: &'static str = "sdp";
    pub const ICE: &'static str = "ice";
    pub const PEER_LEFT: &'static str = "peer-left";

    const TAGS: [&'static str; 4] = [Self::MATCHED, Self::SDP, Self::ICE, Self::PEER_LEFT];

    /// The `type` discriminator this message carries on the wire.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ClientMessage::Matched { .. } => Self::MATCHED,
            ClientMessage::SessionDescriptor { .. } => Self::SDP,
            ClientMessage::IceCandidate { .. } => Self::ICE,
            ClientMessage::PeerLeft => Self::PEER_LEFT,
        }
    }

    /// Whether a client may send this message for relay to its peer.
    pub fn is_relayable(&self) -> bool {
        is_relayable_type(self.type_tag())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object with a string `type` field")]
    MissingType,
    #[error("unrecognized message type `{0}`")]
    UnknownType(String),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("failed to encode `{tag}` message: {source}")]
pub struct EncodeError {
    pub tag: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Decodes a single text frame.
pub fn decode(raw: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    known_tag(&value)?;
    Ok(serde_json::from_value(value)?)
}

/// Reads only the `type` discriminator of a frame, leaving every other field
/// unexamined. Relays use this so payloads pass through untouched.
pub fn message_type(raw: &str) -> Result<&'static str, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    known_tag(&value)
}

fn known_tag(value: &Value) -> Result<&'static str, DecodeError> {
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    ClientMessage::TAGS
        .into_iter()
        .find(|known| *known == tag)
        .ok_or_else(|| DecodeError::UnknownType(tag.to_owned()))
}

/// Whether a client may send frames carrying this `type` for relay.
pub fn is_relayable_type(tag: &str) -> bool {
    tag == ClientMessage::SDP || tag == ClientMessage::ICE
}

/// Decodes a frame, logging and discarding anything that is not a valid
/// message.
pub fn decode_or_log(raw: &str) -> Option<ClientMessage> {
    match decode(raw) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, frame = raw, "dropping undecodable frame");
            None
        }
    }
}

/// Encodes a message as a JSON text frame.
pub fn encode(message: &ClientMessage) -> Result<String, EncodeError> {
    serde_json::to_string(message).map_err(|source| EncodeError {
        tag: message.type_tag(),
        source,
    })
}
