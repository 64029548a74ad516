//! Boundary between the negotiation state machine and whatever actually moves
//! audio and video.

use async_trait::async_trait;
use roulette_proto::{ClientMessage, DescriptorKind};
use thiserror::Error;

use crate::call::CallEvents;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptorKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            sdp: sdp.into(),
        }
    }
}

impl From<SessionDescription> for ClientMessage {
    fn from(description: SessionDescription) -> Self {
        ClientMessage::SessionDescriptor {
            kind: description.kind,
            payload: description.sdp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
    pub candidate: String,
}

impl From<IceCandidate> for ClientMessage {
    fn from(candidate: IceCandidate) -> Self {
        ClientMessage::IceCandidate {
            media_line_index: candidate.sdp_mline_index,
            media_id: candidate.sdp_mid,
            candidate: candidate.candidate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

impl Default for IceServer {
    fn default() -> Self {
        Self::stun(DEFAULT_STUN_URL)
    }
}

/// Callbacks raised by a media transport. They are queued onto the call task
/// and never handled on the transport's own threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    LocalIceCandidate(IceCandidate),
    RemoteStreamAdded { stream_id: String },
    RemoteStreamRemoved { stream_id: String },
    /// Connectivity could not be established or was lost for good.
    ConnectionFailed { reason: String },
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media transport used before initialize")]
    NotInitialized,
    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },
    #[error("media transport already closed")]
    Closed,
}

impl MediaError {
    pub fn operation(operation: &'static str, reason: impl ToString) -> Self {
        MediaError::Operation {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Local peer-connection session driven by one call task.
///
/// Every method is invoked from that task only, one at a time. Callbacks go
/// through the `CallEvents` handed to `initialize`.
#[async_trait]
pub trait MediaTransport: Send + 'static {
    async fn initialize(
        &mut self,
        ice_servers: &[IceServer],
        events: CallEvents,
    ) -> Result<(), MediaError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    /// May be called before the remote description is known; implementations
    /// buffer as needed.
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&mut self);
}
