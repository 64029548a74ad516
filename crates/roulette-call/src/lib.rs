//! Client side of a roulette call: joins the rendezvous queue over a
//! websocket and drives offer/answer negotiation against a pluggable media
//! transport.

pub mod call;
pub mod media;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod signaler;
pub mod status;

pub use call::{
    event_queue, spawn_call, CallConfig, CallEvent, CallEvents, CallHandle, CallQueue,
    NegotiationFailurePolicy, Role,
};
pub use media::{IceCandidate, IceServer, MediaError, MediaEvent, MediaTransport, SessionDescription};
#[cfg(feature = "webrtc")]
pub use rtc::RtcMediaTransport;
pub use signaler::{Outbound, Signaler, SignalerError};
pub use status::CallStatus;

/// Connects to the rendezvous server at `url` and starts a call that waits
/// for a partner.
pub async fn connect<M: MediaTransport>(
    url: &str,
    media: M,
    config: CallConfig,
) -> Result<CallHandle, SignalerError> {
    let (events, queue) = event_queue();
    let signaler = Signaler::connect(url, events.clone()).await?;
    Ok(spawn_call(media, signaler, events, queue, config))
}
