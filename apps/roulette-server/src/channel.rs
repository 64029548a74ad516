use std::{
    borrow::Cow,
    sync::atomic::{AtomicBool, Ordering},
};

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::Mutex;
use roulette_proto::ClientMessage;
use thiserror::Error;
use tokio::sync::mpsc;

/// Close code sent when a session is evicted by server policy.
pub const CLOSE_POLICY: u16 = 1008;
/// Close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("channel write failed: {0}")]
    Write(String),
}

/// One client's bidirectional message channel as seen by the registry.
///
/// Writes are fire-and-forget: implementations must never block the caller,
/// which may be holding the registry lock.
pub trait SessionChannel: Send + Sync {
    fn is_open(&self) -> bool;
    fn send_text(&self, text: String) -> Result<(), ChannelError>;
    fn close(&self, code: u16, reason: &str);
}

/// Websocket-backed channel. Frames are queued on an unbounded outbox that a
/// per-connection writer task drains into the socket.
pub struct WsChannel {
    outbox: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
}

impl WsChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox,
                open: AtomicBool::new(true),
            },
            rx,
        )
    }

    /// Called by the connection driver once the socket has closed or errored.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl SessionChannel for WsChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbox.is_closed()
    }

    fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.outbox
            .send(Message::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbox.send(Message::Close(Some(CloseFrame {
                code,
                reason: Cow::Owned(reason.to_string()),
            })));
        }
    }
}

/// In-memory channel that records everything written to it. Useful for
/// driving a registry without sockets.
#[derive(Default)]
pub struct MemoryChannel {
    sent: Mutex<Vec<String>>,
    closed_with: Mutex<Option<(u16, String)>>,
    shut: AtomicBool,
    failing: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the channel as no longer open without recording a close frame.
    pub fn shut(&self) {
        self.shut.store(true, Ordering::Release);
    }

    /// Makes every subsequent write fail while the channel still reports open.
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::Release);
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Drains recorded frames, decoding each one.
    pub fn take_messages(&self) -> Vec<ClientMessage> {
        self.take_sent()
            .iter()
            .filter_map(|raw| roulette_proto::decode(raw).ok())
            .collect()
    }

    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed_with.lock().clone()
    }
}

impl SessionChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.shut.load(Ordering::Acquire) && self.closed_with.lock().is_none()
    }

    fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ChannelError::Write("injected failure".into()));
        }
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let mut closed = self.closed_with.lock();
        if closed.is_none() {
            *closed = Some((code, reason.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ws_channel_queues_text_and_a_single_close() {
        let (channel, mut rx) = WsChannel::new();
        assert!(channel.is_open());
        channel.send_text("{\"type\":\"peer-left\"}".into()).expect("send");
        channel.close(CLOSE_POLICY, "match timeout");
        channel.close(CLOSE_POLICY, "again");
        assert!(!channel.is_open());

        match rx.try_recv() {
            Ok(Message::Text(text)) => assert_eq!(text, "{\"type\":\"peer-left\"}"),
            other => panic!("expected text frame, got {other:?}"),
        }
        match rx.try_recv() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CLOSE_POLICY);
                assert_eq!(frame.reason, "match timeout");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn ws_channel_reports_closed_once_writer_is_gone() {
        let (channel, rx) = WsChannel::new();
        drop(rx);
        assert!(!channel.is_open());
        assert_eq!(channel.send_text("x".into()), Err(ChannelError::Closed));
    }

    #[test_timeout::timeout]
    fn memory_channel_records_until_closed() {
        let channel = MemoryChannel::new();
        channel.send_text("a".into()).expect("send");
        channel.close(CLOSE_NORMAL, "bye");
        assert!(channel.send_text("b".into()).is_err());
        assert_eq!(channel.take_sent(), vec!["a".to_string()]);
        assert_eq!(channel.closed_with(), Some((CLOSE_NORMAL, "bye".to_string())));
    }
}
