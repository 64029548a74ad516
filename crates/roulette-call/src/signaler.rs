use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use roulette_proto::ClientMessage;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::call::{CallEvent, CallEvents};
use crate::media::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum SignalerError {
    #[error("failed to connect to signaling server: {0}")]
    Connect(#[source] Box<tungstenite::Error>),
    #[error("signaling channel closed")]
    Closed,
}

/// Work queued for the websocket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Client half of the signaling channel.
///
/// Only descriptors and candidates can be sent; `matched` and `peer-left`
/// are server-originated and have no send method here.
#[derive(Debug, Clone)]
pub struct Signaler {
    outbox: UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl Signaler {
    /// A signaler backed by a bare queue instead of a socket.
    pub fn channel() -> (Self, UnboundedReceiver<Outbound>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let signaler = Self {
            outbox,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (signaler, rx)
    }

    /// Opens the websocket and starts the reader and writer tasks. Every
    /// decodable inbound frame is posted to `events`, followed by
    /// `CallEvent::SignalingClosed` once the socket ends.
    pub async fn connect(url: &str, events: CallEvents) -> Result<Self, SignalerError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| SignalerError::Connect(Box::new(err)))?;
        info!(url, "signaling connected");
        let (mut ws_write, mut ws_read) = stream.split();
        let (signaler, mut outbox) = Self::channel();

        tokio::spawn(async move {
            while let Some(outbound) = outbox.recv().await {
                match outbound {
                    Outbound::Message(message) => {
                        let text = match roulette_proto::encode(&message) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "dropping unencodable signaling message");
                                continue;
                            }
                        };
                        if let Err(err) = ws_write.send(Message::Text(text)).await {
                            debug!(error = %err, "signaling write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "hangup".into(),
                        };
                        let _ = ws_write.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        });

        let closed = signaler.closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(message) = roulette_proto::decode_or_log(&text) {
                            events.post(CallEvent::Signal(message));
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "signaling websocket error");
                        break;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            events.post(CallEvent::SignalingClosed);
        });

        Ok(signaler)
    }

    pub fn send_descriptor(&self, description: &SessionDescription) -> Result<(), SignalerError> {
        self.send(description.clone().into())
    }

    pub fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SignalerError> {
        self.send(candidate.clone().into())
    }

    fn send(&self, message: ClientMessage) -> Result<(), SignalerError> {
        if self.is_closed() {
            return Err(SignalerError::Closed);
        }
        self.outbox
            .send(Outbound::Message(message))
            .map_err(|_| SignalerError::Closed)
    }

    /// Closes the websocket with a normal close code. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbox.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
