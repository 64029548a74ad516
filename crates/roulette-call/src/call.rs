//! The per-call negotiation task.
//!
//! A call owns its media transport and signaler on a single tokio task.
//! Inbound signaling frames, transport callbacks and hangups are all posted
//! to that task as `CallEvent`s and handled strictly in order, so the
//! transport is never touched from two places at once.

use std::collections::VecDeque;
use std::future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use roulette_proto::{ClientMessage, DescriptorKind};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::media::{IceCandidate, IceServer, MediaError, MediaEvent, MediaTransport, SessionDescription};
use crate::signaler::Signaler;
use crate::status::CallStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Signal(ClientMessage),
    Media(MediaEvent),
    /// The signaling websocket ended.
    SignalingClosed,
    Hangup,
}

/// Cloneable sender side of a call's event queue.
#[derive(Debug, Clone)]
pub struct CallEvents {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl CallEvents {
    /// Returns false once the call task has gone away.
    pub fn post(&self, event: CallEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn media(&self, event: MediaEvent) -> bool {
        self.post(CallEvent::Media(event))
    }
}

pub struct CallQueue {
    rx: mpsc::UnboundedReceiver<CallEvent>,
}

pub fn event_queue() -> (CallEvents, CallQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CallEvents { tx }, CallQueue { rx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// What a call does when the media transport rejects a negotiation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationFailurePolicy {
    /// End the call as `Failed`.
    #[default]
    Fail,
    /// Log the error and keep waiting; the peer may still recover.
    LogOnly,
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    pub on_negotiation_error: NegotiationFailurePolicy,
    /// Upper bound on the time from session start until media connects.
    /// `None` waits indefinitely.
    pub negotiation_timeout: Option<Duration>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::default()],
            on_negotiation_error: NegotiationFailurePolicy::default(),
            negotiation_timeout: None,
        }
    }
}

/// Handle to a running call. Clones observe and control the same call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    status: watch::Receiver<CallStatus>,
    role: Arc<OnceLock<Role>>,
    events: CallEvents,
    signaler: Signaler,
}

impl CallHandle {
    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    /// The negotiated role, once the server has paired this call.
    pub fn role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Ends the call. The signaling channel closes immediately; the media
    /// transport is released on the call task. Repeated calls are no-ops.
    pub fn hangup(&self) {
        self.signaler.close();
        self.events.post(CallEvent::Hangup);
    }

    /// Resolves with the terminal status once the call has ended.
    pub async fn wait_terminal(&self) -> CallStatus {
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if status.changed().await.is_err() {
                return *status.borrow();
            }
        }
    }
}

/// Starts the call task. `queue` must be the receiving half of `events`.
pub fn spawn_call<M: MediaTransport>(
    media: M,
    signaler: Signaler,
    events: CallEvents,
    queue: CallQueue,
    config: CallConfig,
) -> CallHandle {
    let (status_tx, status_rx) = watch::channel(CallStatus::Unknown);
    let role = Arc::new(OnceLock::new());
    let call = Call {
        media,
        signaler: signaler.clone(),
        events: events.clone(),
        status: status_tx,
        role: role.clone(),
        config,
    };
    tokio::spawn(call.run(queue));
    CallHandle {
        status: status_rx,
        role,
        events,
        signaler,
    }
}

/// How media setup ended.
enum Startup {
    /// Initialized; events that arrived meanwhile are handed back in order.
    Ready(VecDeque<CallEvent>),
    /// The call ended before the transport came up.
    Abort(CallStatus),
}

struct Call<M> {
    media: M,
    signaler: Signaler,
    events: CallEvents,
    status: watch::Sender<CallStatus>,
    role: Arc<OnceLock<Role>>,
    config: CallConfig,
}

impl<M: MediaTransport> Call<M> {
    async fn run(mut self, mut queue: CallQueue) {
        self.transition(CallStatus::Matching);
        let deadline = self
            .config
            .negotiation_timeout
            .map(|timeout| Instant::now() + timeout);

        let mut backlog = match self.start_media(&mut queue, deadline).await {
            Startup::Ready(backlog) => backlog,
            Startup::Abort(status) => {
                self.finish(status).await;
                debug!(status = %self.current(), "call task exiting");
                return;
            }
        };

        while !self.current().is_terminal() {
            if let Some(event) = backlog.pop_front() {
                self.handle(event).await;
                continue;
            }
            let pending = deadline.filter(|_| self.current() != CallStatus::Connected);
            let event = match pending {
                Some(deadline) => tokio::select! {
                    event = queue.rx.recv() => event,
                    _ = sleep_until(deadline) => {
                        warn!(status = %self.current(), "call did not connect in time");
                        self.finish(CallStatus::Failed).await;
                        break;
                    }
                },
                None => queue.rx.recv().await,
            };
            let Some(event) = event else {
                break;
            };
            self.handle(event).await;
        }
        debug!(status = %self.current(), "call task exiting");
    }

    /// Runs `initialize` while still listening for events. Hangup, peer
    /// departure, signaling loss and the deadline all abandon the setup;
    /// anything else is queued until the transport is ready.
    async fn start_media(&mut self, queue: &mut CallQueue, deadline: Option<Instant>) -> Startup {
        let mut backlog = VecDeque::new();
        let init = self
            .media
            .initialize(&self.config.ice_servers, self.events.clone());
        tokio::pin!(init);
        let expiry = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                result = &mut init => {
                    return match result {
                        Ok(()) => Startup::Ready(backlog),
                        Err(err) => {
                            error!(error = %err, "media transport failed to initialize");
                            Startup::Abort(CallStatus::Failed)
                        }
                    };
                }
                event = queue.rx.recv() => match event {
                    Some(CallEvent::Hangup) => {
                        info!("hangup requested during media setup");
                        return Startup::Abort(CallStatus::Finished);
                    }
                    Some(CallEvent::Signal(ClientMessage::PeerLeft)) => {
                        info!("peer left during media setup");
                        return Startup::Abort(CallStatus::Finished);
                    }
                    Some(CallEvent::SignalingClosed) | None => {
                        warn!("signaling closed during media setup");
                        return Startup::Abort(CallStatus::Failed);
                    }
                    Some(event) => backlog.push_back(event),
                },
                _ = &mut expiry => {
                    warn!("media setup did not finish in time");
                    return Startup::Abort(CallStatus::Failed);
                }
            }
        }
    }

    async fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Signal(ClientMessage::Matched {
                match_id,
                is_offerer,
            }) => self.on_matched(match_id, is_offerer).await,
            CallEvent::Signal(ClientMessage::SessionDescriptor { kind, payload }) => {
                self.on_remote_description(SessionDescription { kind, sdp: payload })
                    .await
            }
            CallEvent::Signal(ClientMessage::IceCandidate {
                media_line_index,
                media_id,
                candidate,
            }) => {
                self.on_remote_candidate(IceCandidate {
                    sdp_mid: media_id,
                    sdp_mline_index: media_line_index,
                    candidate,
                })
                .await
            }
            CallEvent::Signal(ClientMessage::PeerLeft) => {
                info!("peer left");
                self.finish(CallStatus::Finished).await;
            }
            CallEvent::Media(MediaEvent::LocalIceCandidate(candidate)) => {
                if let Err(err) = self.signaler.send_candidate(&candidate) {
                    debug!(error = %err, "local candidate not sent");
                }
            }
            CallEvent::Media(MediaEvent::RemoteStreamAdded { stream_id }) => {
                info!(stream_id = %stream_id, "remote stream added");
                self.transition(CallStatus::Connected);
            }
            CallEvent::Media(MediaEvent::RemoteStreamRemoved { stream_id }) => {
                info!(stream_id = %stream_id, "remote stream removed");
                self.finish(CallStatus::Finished).await;
            }
            CallEvent::Media(MediaEvent::ConnectionFailed { reason }) => {
                warn!(reason = %reason, "media connection failed");
                self.finish(CallStatus::Failed).await;
            }
            CallEvent::SignalingClosed => {
                if self.current() == CallStatus::Connected {
                    info!("signaling closed; media stays up");
                } else {
                    warn!(status = %self.current(), "signaling closed before media connected");
                    self.finish(CallStatus::Failed).await;
                }
            }
            CallEvent::Hangup => {
                info!("hangup requested");
                self.finish(CallStatus::Finished).await;
            }
        }
    }

    async fn on_matched(&mut self, match_id: String, is_offerer: bool) {
        let role = if is_offerer {
            Role::Offerer
        } else {
            Role::Answerer
        };
        if self.role.set(role).is_err() {
            warn!(match_id = %match_id, "ignoring duplicate match");
            return;
        }
        info!(match_id = %match_id, ?role, "matched");
        self.transition(CallStatus::Connecting);

        if role == Role::Offerer {
            if let Err(err) = self.publish_local(DescriptorKind::Offer).await {
                self.negotiation_failed(err).await;
            }
        }
    }

    async fn on_remote_description(&mut self, description: SessionDescription) {
        let Some(role) = self.role.get().copied() else {
            warn!(kind = %description.kind, "descriptor arrived before match");
            return;
        };
        let kind = description.kind;
        match (role, kind) {
            (Role::Answerer, DescriptorKind::Offer) => {
                if let Err(err) = self.answer(description).await {
                    self.negotiation_failed(err).await;
                }
            }
            (Role::Offerer, DescriptorKind::Answer) => {
                match self.media.set_remote_description(description).await {
                    Ok(()) => debug!("offer/answer exchange complete"),
                    Err(err) => self.negotiation_failed(err).await,
                }
            }
            _ => warn!(?role, %kind, "unexpected descriptor for role"),
        }
    }

    /// A rejected candidate is dropped; the remaining ones may still connect.
    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.role.get().is_none() {
            warn!("candidate arrived before match");
            return;
        }
        if let Err(err) = self.media.add_ice_candidate(candidate).await {
            warn!(error = %err, "dropping remote candidate");
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), MediaError> {
        self.media.set_remote_description(offer).await?;
        self.publish_local(DescriptorKind::Answer).await
    }

    /// Creates the local offer or answer, applies it, then ships it to the
    /// peer. A failed send is not a negotiation error.
    async fn publish_local(&mut self, kind: DescriptorKind) -> Result<(), MediaError> {
        let description = match kind {
            DescriptorKind::Offer => self.media.create_offer().await?,
            DescriptorKind::Answer => self.media.create_answer().await?,
        };
        self.media
            .set_local_description(description.clone())
            .await?;
        if let Err(err) = self.signaler.send_descriptor(&description) {
            warn!(error = %err, %kind, "local descriptor not sent");
        }
        Ok(())
    }

    async fn negotiation_failed(&mut self, err: MediaError) {
        error!(error = %err, status = %self.current(), "negotiation step failed");
        if self.config.on_negotiation_error == NegotiationFailurePolicy::Fail {
            self.finish(CallStatus::Failed).await;
        }
    }

    /// Releases the signaler and media transport, then surfaces `status`.
    async fn finish(&mut self, status: CallStatus) {
        if self.current().is_terminal() {
            return;
        }
        self.signaler.close();
        self.media.close().await;
        self.transition(status);
    }

    fn transition(&self, next: CallStatus) -> bool {
        let current = self.current();
        if !current.can_transition_to(next) {
            debug!(from = %current, to = %next, "ignoring status change");
            return false;
        }
        self.status.send_replace(next);
        info!(from = %current, to = %next, "call status changed");
        true
    }

    fn current(&self) -> CallStatus {
        *self.status.borrow()
    }
}
