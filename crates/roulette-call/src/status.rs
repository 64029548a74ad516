use std::fmt;

/// Lifecycle of a single call as seen by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallStatus {
    #[default]
    Unknown,
    /// Waiting in the server queue for a partner.
    Matching,
    /// Paired; exchanging descriptors and candidates.
    Connecting,
    /// Remote media is flowing.
    Connected,
    Finished,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Finished | CallStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Finished | Failed) => true,
            (Unknown, Matching) | (Matching, Connecting) | (Connecting, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallStatus::Unknown => "unknown",
            CallStatus::Matching => "matching",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Finished => "finished",
            CallStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}
