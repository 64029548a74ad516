//! `MediaTransport` backed by webrtc-rs.
//!
//! The first remote track announces the remote stream. The stream is
//! reported removed when that track stops delivering RTP (the peer sent BYE
//! or stopped its transceiver) or when the peer connection closes. A peer
//! that vanishes without either shows up as ICE `Failed`, which ends the call
//! as failed unless the server's `peer-left` arrives first.

use std::sync::Arc;

use async_trait::async_trait;
use roulette_proto::DescriptorKind;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::call::CallEvents;
use crate::media::{IceCandidate, IceServer, MediaError, MediaEvent, MediaTransport, SessionDescription};

/// Audio and video peer connection. Remote candidates that arrive before the
/// remote description are held back and applied once it is set.
#[derive(Default)]
pub struct RtcMediaTransport {
    peer: Option<Arc<RTCPeerConnection>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_description_set: bool,
    closed: bool,
}

impl RtcMediaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn peer(&self) -> Result<&Arc<RTCPeerConnection>, MediaError> {
        if self.closed {
            return Err(MediaError::Closed);
        }
        self.peer.as_ref().ok_or(MediaError::NotInitialized)
    }
}

fn build_api() -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| MediaError::operation("register codecs", err))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| MediaError::operation("register interceptors", err))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let parsed = match description.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(description.sdp),
        DescriptorKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| MediaError::operation("parse description", err))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => DescriptorKind::Offer,
        RTCSdpType::Answer => DescriptorKind::Answer,
        other => {
            return Err(MediaError::operation(
                "convert description",
                format!("unsupported sdp type {other}"),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

/// Clears the announced stream if `ended` is it, so removal is reported once.
fn release_stream(announced: &mut Option<String>, ended: &str) -> Option<String> {
    if announced.as_deref() == Some(ended) {
        announced.take()
    } else {
        None
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: Some(candidate.sdp_mid),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        sdp_mid: init.sdp_mid.unwrap_or_default(),
        sdp_mline_index: init.sdp_mline_index.unwrap_or_default(),
        candidate: init.candidate,
    }
}

#[async_trait]
impl MediaTransport for RtcMediaTransport {
    async fn initialize(
        &mut self,
        ice_servers: &[IceServer],
        events: CallEvents,
    ) -> Result<(), MediaError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_server).collect(),
            ..Default::default()
        };
        let peer = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|err| MediaError::operation("create peer connection", err))?,
        );

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            peer.add_transceiver_from_kind(kind, None)
                .await
                .map_err(|err| MediaError::operation("add transceiver", err))?;
        }

        let candidate_events = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.media(MediaEvent::LocalIceCandidate(from_rtc_candidate(init)));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let remote_stream = Arc::new(AsyncMutex::new(None::<String>));
        let track_events = events.clone();
        let track_stream = remote_stream.clone();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let remote_stream = track_stream.clone();
            Box::pin(async move {
                let stream_id = track.stream_id();
                let mut announced = remote_stream.lock().await;
                if announced.is_some() {
                    debug!(stream_id = %stream_id, kind = %track.kind(), "additional remote track");
                    return;
                }
                *announced = Some(stream_id.clone());
                drop(announced);
                events.media(MediaEvent::RemoteStreamAdded {
                    stream_id: stream_id.clone(),
                });

                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    let released = release_stream(&mut *remote_stream.lock().await, &stream_id);
                    if let Some(stream_id) = released {
                        debug!(stream_id = %stream_id, "remote track ended");
                        events.media(MediaEvent::RemoteStreamRemoved { stream_id });
                    }
                });
            })
        }));

        let state_events = events;
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            let remote_stream = remote_stream.clone();
            Box::pin(async move {
                debug!(?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Failed => {
                        events.media(MediaEvent::ConnectionFailed {
                            reason: "peer connection failed".into(),
                        });
                    }
                    RTCPeerConnectionState::Closed => {
                        if let Some(stream_id) = remote_stream.lock().await.take() {
                            events.media(MediaEvent::RemoteStreamRemoved { stream_id });
                        }
                    }
                    RTCPeerConnectionState::Disconnected => {
                        debug!("peer connection disconnected; waiting for ICE to recover or fail");
                    }
                    _ => {}
                }
            })
        }));

        self.peer = Some(peer);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .peer()?
            .create_offer(None)
            .await
            .map_err(|err| MediaError::operation("create offer", err))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .peer()?
            .create_answer(None)
            .await
            .map_err(|err| MediaError::operation("create answer", err))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let description = to_rtc_description(description)?;
        self.peer()?
            .set_local_description(description)
            .await
            .map_err(|err| MediaError::operation("set local description", err))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let description = to_rtc_description(description)?;
        let peer = self.peer()?.clone();
        peer.set_remote_description(description)
            .await
            .map_err(|err| MediaError::operation("set remote description", err))?;
        self.remote_description_set = true;

        for candidate in self.pending_candidates.drain(..) {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!(error = %err, "failed to apply buffered candidate");
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = to_rtc_candidate(candidate);
        if !self.remote_description_set {
            self.peer()?;
            self.pending_candidates.push(init);
            return Ok(());
        }
        self.peer()?
            .add_ice_candidate(init)
            .await
            .map_err(|err| MediaError::operation("add ice candidate", err))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_candidates.clear();
        if let Some(peer) = self.peer.take() {
            if let Err(err) = peer.close().await {
                warn!(error = %err, "failed to close peer connection");
            }
        }
    }
}
