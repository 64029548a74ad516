use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use roulette_proto::ClientMessage;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::SessionChannel;

pub type SessionId = Uuid;

/// The registry shared by every connection of one server instance.
pub type SharedRoulette = Arc<Mutex<Roulette>>;

struct Session {
    channel: Arc<dyn SessionChannel>,
    peer: Option<SessionId>,
    queued_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Paired {
        offerer: SessionId,
        answerer: SessionId,
    },
    Queued {
        position: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Relayed { to: SessionId },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The frame was not a message we understand.
    Undecodable,
    /// The message type is one clients may not send.
    ProtocolViolation,
    /// The sending session is not registered (already gone).
    UnknownSession,
    /// The sender has no live peer to relay to.
    NoPeer,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::Undecodable => "undecodable",
            DropReason::ProtocolViolation => "protocol_violation",
            DropReason::UnknownSession => "unknown_session",
            DropReason::NoPeer => "no_peer",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub paired: usize,
    pub unmatched: usize,
}

/// Session registry and FIFO matchmaking queue.
///
/// Pairing is symmetric: whenever `a.peer == Some(b)` and `b` is registered,
/// `b.peer == Some(a)`. The later arrival of a pair is always the offerer.
#[derive(Default)]
pub struct Roulette {
    sessions: HashMap<SessionId, Session>,
    unmatched: VecDeque<SessionId>,
}

impl Roulette {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRoulette {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Registers a freshly connected channel and immediately tries to pair it.
    pub fn register(&mut self, channel: Arc<dyn SessionChannel>) -> SessionId {
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            Session {
                channel,
                peer: None,
                queued_at: None,
            },
        );
        counter!("roulette_sessions_registered_total", 1);

        match self.try_match(id) {
            MatchOutcome::Paired { offerer, answerer } => {
                info!(offerer = %offerer, answerer = %answerer, "paired sessions");
            }
            MatchOutcome::Queued { position } => {
                debug!(session_id = %id, position, "session queued for a match");
            }
        }
        id
    }

    fn try_match(&mut self, id: SessionId) -> MatchOutcome {
        while let Some(other) = self.unmatched.pop_front() {
            let Some(waiting) = self.sessions.get_mut(&other) else {
                debug!(session_id = %other, "skipping stale queue entry");
                continue;
            };
            waiting.peer = Some(id);
            waiting.queued_at = None;
            if let Some(arriving) = self.sessions.get_mut(&id) {
                arriving.peer = Some(other);
            }

            self.send(
                id,
                &ClientMessage::Matched {
                    match_id: other.to_string(),
                    is_offerer: true,
                },
            );
            self.send(
                other,
                &ClientMessage::Matched {
                    match_id: id.to_string(),
                    is_offerer: false,
                },
            );
            counter!("roulette_pairs_matched_total", 1);
            self.record_queue_depth();
            return MatchOutcome::Paired {
                offerer: id,
                answerer: other,
            };
        }

        if let Some(session) = self.sessions.get_mut(&id) {
            session.queued_at = Some(Instant::now());
        }
        self.unmatched.push_back(id);
        self.record_queue_depth();
        MatchOutcome::Queued {
            position: self.unmatched.len(),
        }
    }

    /// Relays a raw frame from `id` to its peer. Only the `type` field is
    /// read: `sdp` and `ice` frames are forwarded byte for byte, everything
    /// else is logged and dropped.
    pub fn handle_message(&mut self, id: SessionId, raw: &str) -> RelayOutcome {
        let tag = match roulette_proto::message_type(raw) {
            Ok(tag) => tag,
            Err(err) => {
                warn!(session_id = %id, error = %err, "unexpected message");
                return dropped(DropReason::Undecodable);
            }
        };

        let Some(session) = self.sessions.get(&id) else {
            warn!(session_id = %id, "message from unknown session");
            return dropped(DropReason::UnknownSession);
        };

        if !roulette_proto::is_relayable_type(tag) {
            warn!(
                session_id = %id,
                message_type = tag,
                "clients may not send this message type"
            );
            return dropped(DropReason::ProtocolViolation);
        }

        let Some(peer_id) = session.peer.filter(|peer| self.sessions.contains_key(peer)) else {
            warn!(session_id = %id, message_type = tag, "no live peer to relay to");
            return dropped(DropReason::NoPeer);
        };

        self.write(peer_id, raw.to_owned(), tag);
        counter!("roulette_messages_relayed_total", 1, "type" => tag);
        RelayOutcome::Relayed { to: peer_id }
    }

    /// Writes `message` to the session's channel if it is still open. Write
    /// failures are logged; the channel's own close event decides teardown.
    pub fn send(&self, id: SessionId, message: &ClientMessage) -> bool {
        let text = match roulette_proto::encode(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(session_id = %id, error = %err, "failed to encode outbound message");
                return false;
            }
        };
        self.write(id, text, message.type_tag())
    }

    fn write(&self, id: SessionId, text: String, tag: &'static str) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };
        if !session.channel.is_open() {
            debug!(session_id = %id, message_type = tag, "channel not open; skipping send");
            return false;
        }
        match session.channel.send_text(text) {
            Ok(()) => true,
            Err(err) => {
                warn!(session_id = %id, error = %err, "error sending to session");
                false
            }
        }
    }

    /// Removes a session, telling its live peer (if any) that it left.
    /// Returns `false` when the session was already gone.
    pub fn unregister(&mut self, id: SessionId) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            return false;
        };

        if let Some(peer_id) = session.peer {
            if let Some(peer) = self.sessions.get_mut(&peer_id) {
                peer.peer = None;
                self.send(peer_id, &ClientMessage::PeerLeft);
                info!(session_id = %id, peer_id = %peer_id, "session left; notified peer");
            }
        }

        self.unmatched.retain(|queued| *queued != id);
        self.record_queue_depth();
        debug!(session_id = %id, "session unregistered");
        true
    }

    /// Removes every queued session that has waited longer than `max_wait`
    /// as of `now`, returning their channels so the caller can close them.
    pub fn expire_unmatched(
        &mut self,
        now: Instant,
        max_wait: Duration,
    ) -> Vec<(SessionId, Arc<dyn SessionChannel>)> {
        let expired: Vec<SessionId> = self
            .unmatched
            .iter()
            .copied()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .and_then(|session| session.queued_at)
                    .is_some_and(|queued_at| now.saturating_duration_since(queued_at) > max_wait)
            })
            .collect();

        let mut channels = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                channels.push((id, session.channel));
            }
        }
        if !channels.is_empty() {
            self.unmatched.retain(|id| self.sessions.contains_key(id));
            counter!("roulette_sessions_expired_total", channels.len() as u64);
            self.record_queue_depth();
        }
        channels
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn peer_of(&self, id: SessionId) -> Option<SessionId> {
        self.sessions.get(&id).and_then(|session| session.peer)
    }

    /// Queued session ids, head first.
    pub fn unmatched(&self) -> Vec<SessionId> {
        self.unmatched.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions: self.sessions.len(),
            paired: self.sessions.values().filter(|s| s.peer.is_some()).count(),
            unmatched: self.unmatched.len(),
        }
    }

    fn record_queue_depth(&self) {
        gauge!("roulette_unmatched_sessions", self.unmatched.len() as f64);
    }
}

fn dropped(reason: DropReason) -> RelayOutcome {
    counter!("roulette_messages_dropped_total", 1, "reason" => reason.as_str());
    RelayOutcome::Dropped(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use roulette_proto::DescriptorKind;
    use serde_json::json;

    fn join(roulette: &mut Roulette) -> (SessionId, Arc<MemoryChannel>) {
        let channel = Arc::new(MemoryChannel::new());
        let id = roulette.register(channel.clone());
        (id, channel)
    }

    fn assert_symmetric(roulette: &Roulette) {
        for (id, session) in &roulette.sessions {
            if let Some(peer) = session.peer {
                if let Some(other) = roulette.sessions.get(&peer) {
                    assert_eq!(other.peer, Some(*id), "pairing must be symmetric");
                }
            }
        }
    }

    #[test_timeout::timeout]
    fn first_session_waits_in_queue() {
        let mut roulette = Roulette::new();
        let (a, channel) = join(&mut roulette);
        assert_eq!(roulette.unmatched(), vec![a]);
        assert_eq!(roulette.peer_of(a), None);
        assert!(channel.take_sent().is_empty());
    }

    #[test_timeout::timeout]
    fn later_arrival_is_the_offerer() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let (b, b_chan) = join(&mut roulette);

        assert_eq!(roulette.peer_of(a), Some(b));
        assert_eq!(roulette.peer_of(b), Some(a));
        assert!(roulette.unmatched().is_empty());

        assert_eq!(
            a_chan.take_messages(),
            vec![ClientMessage::Matched {
                match_id: b.to_string(),
                is_offerer: false
            }]
        );
        assert_eq!(
            b_chan.take_messages(),
            vec![ClientMessage::Matched {
                match_id: a.to_string(),
                is_offerer: true
            }]
        );
    }

    #[test_timeout::timeout]
    fn pairs_in_fifo_order_and_leaves_odd_one_queued() {
        let mut roulette = Roulette::new();
        let ids: Vec<SessionId> = (0..5).map(|_| join(&mut roulette).0).collect();

        assert_eq!(roulette.peer_of(ids[0]), Some(ids[1]));
        assert_eq!(roulette.peer_of(ids[2]), Some(ids[3]));
        assert_eq!(roulette.peer_of(ids[4]), None);
        assert_eq!(roulette.unmatched(), vec![ids[4]]);
        assert_symmetric(&roulette);
        assert_eq!(
            roulette.stats(),
            RegistryStats {
                sessions: 5,
                paired: 4,
                unmatched: 1
            }
        );
    }

    #[test_timeout::timeout]
    fn disconnect_while_queued_skips_stale_entry() {
        let mut roulette = Roulette::new();
        let (a, _) = join(&mut roulette);
        roulette.unregister(a);
        // Simulate a stale head left behind by a racing disconnect.
        roulette.unmatched.push_back(a);

        let (b, b_chan) = join(&mut roulette);
        assert_eq!(roulette.peer_of(b), None);
        assert_eq!(roulette.unmatched(), vec![b]);
        assert!(b_chan.take_sent().is_empty());

        let (c, _) = join(&mut roulette);
        assert_eq!(roulette.peer_of(c), Some(b));
    }

    #[test_timeout::timeout]
    fn relays_descriptor_unchanged_to_peer() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let (b, b_chan) = join(&mut roulette);
        a_chan.take_sent();
        b_chan.take_sent();

        let raw = json!({"type": "sdp", "sdpType": 0, "sdp": "x"}).to_string();
        assert_eq!(
            roulette.handle_message(a, &raw),
            RelayOutcome::Relayed { to: b }
        );
        assert_eq!(
            b_chan.take_messages(),
            vec![ClientMessage::SessionDescriptor {
                kind: DescriptorKind::Offer,
                payload: "x".into()
            }]
        );
        assert!(a_chan.take_sent().is_empty());
    }

    #[test_timeout::timeout]
    fn relays_candidates_both_ways() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let (b, b_chan) = join(&mut roulette);
        a_chan.take_sent();
        b_chan.take_sent();

        let raw = r#"{"type":"ice","label":0,"id":"audio","candidate":"candidate:0"}"#;
        assert_eq!(roulette.handle_message(b, raw), RelayOutcome::Relayed { to: a });
        assert_eq!(roulette.handle_message(a, raw), RelayOutcome::Relayed { to: b });
        assert_eq!(a_chan.take_messages().len(), 1);
        assert_eq!(b_chan.take_messages().len(), 1);
    }

    #[test_timeout::timeout]
    fn relayed_payloads_are_not_validated_or_rewritten() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let (b, b_chan) = join(&mut roulette);
        a_chan.take_sent();
        b_chan.take_sent();

        let frames = [
            r#"{"type":"ice","label":-1,"id":"0","candidate":"c"}"#,
            r#"{"type":"sdp","sdpType":2,"sdp":"x"}"#,
            r#"{"type":"sdp","sdp":"x"}"#,
            r#"{"type":"ice","label":0,"id":"0","candidate":"c","usernameFragment":"uf"}"#,
        ];
        for raw in frames {
            assert_eq!(roulette.handle_message(a, raw), RelayOutcome::Relayed { to: b });
        }
        assert_eq!(b_chan.take_sent(), frames.map(str::to_owned).to_vec());
        assert!(a_chan.take_sent().is_empty());
    }

    #[test_timeout::timeout]
    fn unpaired_sender_reaches_nobody() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let raw = r#"{"type":"sdp","sdpType":0,"sdp":"x"}"#;
        assert_eq!(
            roulette.handle_message(a, raw),
            RelayOutcome::Dropped(DropReason::NoPeer)
        );
        assert!(a_chan.take_sent().is_empty());
    }

    #[test_timeout::timeout]
    fn server_only_and_garbage_frames_are_dropped() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let (_b, b_chan) = join(&mut roulette);
        a_chan.take_sent();
        b_chan.take_sent();

        let matched = r#"{"type":"matched","match":"spoof","offer":true}"#;
        let left = r#"{"type":"peer-left"}"#;
        for (raw, reason) in [
            (matched, DropReason::ProtocolViolation),
            (left, DropReason::ProtocolViolation),
            ("{not json", DropReason::Undecodable),
            (r#"{"type":"hello"}"#, DropReason::Undecodable),
        ] {
            assert_eq!(roulette.handle_message(a, raw), RelayOutcome::Dropped(reason));
        }
        assert!(b_chan.take_sent().is_empty());
        assert_eq!(roulette.len(), 2);
    }

    #[test_timeout::timeout]
    fn unregister_notifies_peer_exactly_once() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let (b, _) = join(&mut roulette);
        a_chan.take_sent();

        assert!(roulette.unregister(b));
        assert!(!roulette.unregister(b));
        assert_eq!(a_chan.take_messages(), vec![ClientMessage::PeerLeft]);
        assert_eq!(roulette.peer_of(a), None);

        let raw = r#"{"type":"ice","label":0,"id":"0","candidate":"c"}"#;
        assert_eq!(
            roulette.handle_message(a, raw),
            RelayOutcome::Dropped(DropReason::NoPeer)
        );
        assert_eq!(
            roulette.handle_message(b, raw),
            RelayOutcome::Dropped(DropReason::UnknownSession)
        );
    }

    #[test_timeout::timeout]
    fn unregister_removes_queued_session() {
        let mut roulette = Roulette::new();
        let (a, _) = join(&mut roulette);
        assert!(roulette.unregister(a));
        assert!(roulette.unmatched().is_empty());
        assert!(roulette.is_empty());
    }

    #[test_timeout::timeout]
    fn write_failures_do_not_tear_down_sessions() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        a_chan.fail_writes();
        let (b, _) = join(&mut roulette);

        assert!(roulette.contains(a));
        assert_eq!(roulette.peer_of(a), Some(b));
        assert!(!roulette.send(a, &ClientMessage::PeerLeft));
    }

    #[test_timeout::timeout]
    fn closed_channel_is_skipped() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        a_chan.shut();
        let (_b, b_chan) = join(&mut roulette);
        assert!(a_chan.take_sent().is_empty());
        assert_eq!(b_chan.take_messages().len(), 1);
    }

    #[test_timeout::timeout]
    fn expires_only_sessions_waiting_too_long() {
        let mut roulette = Roulette::new();
        let (a, _) = join(&mut roulette);
        let (b, _) = join(&mut roulette);
        let (c, _) = join(&mut roulette);

        let max_wait = Duration::from_secs(30);
        assert!(roulette.expire_unmatched(Instant::now(), max_wait).is_empty());

        let later = Instant::now() + Duration::from_secs(31);
        let expired = roulette.expire_unmatched(later, max_wait);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, c);
        assert!(!roulette.contains(c));
        assert!(roulette.unmatched().is_empty());
        assert_eq!(roulette.peer_of(a), Some(b));
    }

    #[test_timeout::timeout]
    fn abc_scenario() {
        let mut roulette = Roulette::new();
        let (a, a_chan) = join(&mut roulette);
        let (b, b_chan) = join(&mut roulette);
        let (c, c_chan) = join(&mut roulette);

        assert_eq!(
            b_chan.take_messages(),
            vec![ClientMessage::Matched {
                match_id: a.to_string(),
                is_offerer: true
            }]
        );
        a_chan.take_sent();
        assert_eq!(roulette.unmatched(), vec![c]);

        roulette.handle_message(a, r#"{"type":"sdp","sdpType":0,"sdp":"x"}"#);
        let delivered: serde_json::Value =
            serde_json::from_str(&b_chan.take_sent()[0]).expect("json");
        assert_eq!(delivered, json!({"type": "sdp", "sdpType": 0, "sdp": "x"}));

        roulette.unregister(b);
        assert_eq!(a_chan.take_messages(), vec![ClientMessage::PeerLeft]);
        assert_eq!(roulette.unmatched(), vec![c]);
        assert!(c_chan.take_sent().is_empty());
        assert_symmetric(&roulette);
    }
}
