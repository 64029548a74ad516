use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::CLOSE_POLICY;
use crate::registry::SharedRoulette;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically closes sessions that have waited longer than `max_wait`
/// for a partner.
pub fn spawn_match_sweeper(roulette: SharedRoulette, max_wait: Duration) -> JoinHandle<()> {
    let period = (max_wait / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
    let mut interval = tokio::time::interval(period);
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            sweep_once(&roulette, Instant::now(), max_wait);
        }
    })
}

/// Expires overdue queued sessions and closes their channels. Returns how
/// many were closed.
pub fn sweep_once(roulette: &SharedRoulette, now: Instant, max_wait: Duration) -> usize {
    let expired = roulette.lock().expire_unmatched(now, max_wait);
    for (session_id, channel) in &expired {
        info!(
            session_id = %session_id,
            waited_secs = max_wait.as_secs(),
            "closing session that waited too long for a match"
        );
        channel.close(CLOSE_POLICY, "match timeout");
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::registry::Roulette;
    use std::sync::Arc;

    #[test_timeout::timeout]
    fn sweep_closes_overdue_sessions_with_policy_code() {
        let roulette = Roulette::shared();
        let channel = Arc::new(MemoryChannel::new());
        let id = roulette.lock().register(channel.clone());

        let max_wait = Duration::from_secs(10);
        assert_eq!(sweep_once(&roulette, Instant::now(), max_wait), 0);
        assert_eq!(
            sweep_once(&roulette, Instant::now() + Duration::from_secs(11), max_wait),
            1
        );
        assert!(!roulette.lock().contains(id));
        assert_eq!(
            channel.closed_with(),
            Some((CLOSE_POLICY, "match timeout".to_string()))
        );
    }
}
