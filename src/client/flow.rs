use std::time::Duration;

use tokio::time::Instant;

use crate::lsn::Lsn;
use crate::protocol::StandbyStatusUpdate;

use super::handler::Keepalive;

/// What the client has told (or will tell) the server about its progress.
///
/// Every LSN only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackState {
    /// Highest position seen from the server (XLogData start or keepalive end).
    pub written_lsn: Lsn,
    /// Highest position the application acknowledged.
    pub flushed_lsn: Lsn,
    /// Same as `flushed_lsn`: acknowledged means durably applied.
    pub applied_lsn: Lsn,
    pub last_send_time: Instant,
}

/// Owns [`FeedbackState`] and decides when a status update is due.
#[derive(Debug, Clone)]
pub struct FlowController {
    state: FeedbackState,
    status_interval: Duration,
}

impl FlowController {
    /// `now` counts as the last send so the first heartbeat is one interval out.
    pub fn new(status_interval: Duration, now: Instant) -> Self {
        Self {
            state: FeedbackState {
                written_lsn: Lsn::ZERO,
                flushed_lsn: Lsn::ZERO,
                applied_lsn: Lsn::ZERO,
                last_send_time: now,
            },
            status_interval,
        }
    }

    pub fn state(&self) -> &FeedbackState {
        &self.state
    }

    pub fn mark_received(&mut self, lsn: Lsn) {
        self.state.written_lsn = self.state.written_lsn.max(lsn);
    }

    /// Record an application acknowledgment.
    ///
    /// Clamped to `written_lsn`: the server is never told about a position
    /// it did not send. Returns whether flushed/applied moved.
    pub fn acknowledge(&mut self, lsn: Lsn) -> bool {
        let lsn = lsn.min(self.state.written_lsn);
        if lsn <= self.state.flushed_lsn {
            return false;
        }
        self.state.flushed_lsn = lsn;
        self.state.applied_lsn = self.state.applied_lsn.max(lsn);
        true
    }

    pub fn should_reply(&self, keepalive: Option<&Keepalive>, now: Instant) -> bool {
        if keepalive.is_some_and(|k| k.reply_requested) {
            return true;
        }
        self.heartbeat_due(now)
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        !self.status_interval.is_zero()
            && now.saturating_duration_since(self.state.last_send_time) >= self.status_interval
    }

    /// Time left before a heartbeat is due; `None` when heartbeats are off.
    pub fn time_until_heartbeat(&self, now: Instant) -> Option<Duration> {
        if self.status_interval.is_zero() {
            return None;
        }
        let due = self.state.last_send_time + self.status_interval;
        Some(due.saturating_duration_since(now))
    }

    /// Snapshot the state into a status update and stamp `last_send_time`.
    pub fn build_status_update(
        &mut self,
        now: Instant,
        client_time_micros: i64,
    ) -> StandbyStatusUpdate {
        self.state.last_send_time = now;
        StandbyStatusUpdate {
            written: self.state.written_lsn,
            flushed: self.state.flushed_lsn,
            applied: self.state.applied_lsn,
            client_time_micros,
            reply_requested: false,
        }
    }

    /// Where to restart streaming after a reconnect.
    pub fn resume_lsn(&self, configured: Option<Lsn>) -> Lsn {
        if !self.state.flushed_lsn.is_zero() {
            self.state.flushed_lsn
        } else {
            configured.unwrap_or(Lsn::ZERO)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive(reply_requested: bool) -> Keepalive {
        Keepalive {
            server_wal_end: Lsn(500),
            server_time_micros: 0,
            reply_requested,
        }
    }

    #[test]
    fn acks_are_monotonic() {
        let now = Instant::now();
        let mut fc = FlowController::new(Duration::from_secs(10), now);
        fc.mark_received(Lsn(1000));

        assert!(fc.acknowledge(Lsn(100)));
        assert!(fc.acknowledge(Lsn(300)));
        assert!(!fc.acknowledge(Lsn(200)));
        assert!(!fc.acknowledge(Lsn(300)));
        assert_eq!(fc.state().flushed_lsn, Lsn(300));
        assert_eq!(fc.state().applied_lsn, Lsn(300));
    }

    #[test]
    fn ack_is_clamped_to_written() {
        let mut fc = FlowController::new(Duration::from_secs(10), Instant::now());
        assert!(!fc.acknowledge(Lsn(50)), "nothing received yet");

        fc.mark_received(Lsn(40));
        assert!(fc.acknowledge(Lsn(50)));
        assert_eq!(fc.state().flushed_lsn, Lsn(40));
    }

    #[test]
    fn written_never_moves_back() {
        let mut fc = FlowController::new(Duration::from_secs(10), Instant::now());
        fc.mark_received(Lsn(10));
        fc.mark_received(Lsn(5));
        assert_eq!(fc.state().written_lsn, Lsn(10));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_after_interval() {
        let start = Instant::now();
        let mut fc = FlowController::new(Duration::from_secs(10), start);
        assert!(!fc.should_reply(None, start));
        assert_eq!(fc.time_until_heartbeat(start), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        let now = Instant::now();
        assert!(fc.should_reply(None, now));
        assert_eq!(fc.time_until_heartbeat(now), Some(Duration::ZERO));

        fc.build_status_update(now, 0);
        assert!(!fc.should_reply(None, now));
    }

    #[test]
    fn reply_request_always_answers() {
        let now = Instant::now();
        let fc = FlowController::new(Duration::ZERO, now);
        assert!(fc.should_reply(Some(&keepalive(true)), now));
        assert!(!fc.should_reply(Some(&keepalive(false)), now));
    }

    #[test]
    fn zero_interval_disables_heartbeat() {
        let start = Instant::now();
        let fc = FlowController::new(Duration::ZERO, start);
        assert!(!fc.should_reply(None, start + Duration::from_secs(3600)));
        assert_eq!(fc.time_until_heartbeat(start), None);
    }

    #[test]
    fn status_update_carries_state() {
        let now = Instant::now();
        let mut fc = FlowController::new(Duration::from_secs(10), now);
        fc.mark_received(Lsn(0x20));
        fc.acknowledge(Lsn(0x10));
        let su = fc.build_status_update(now, 42);
        assert_eq!(su.written, Lsn(0x20));
        assert_eq!(su.flushed, Lsn(0x10));
        assert_eq!(su.applied, Lsn(0x10));
        assert_eq!(su.client_time_micros, 42);
        assert!(!su.reply_requested);
    }

    #[test]
    fn resume_prefers_flushed() {
        let now = Instant::now();
        let mut fc = FlowController::new(Duration::from_secs(10), now);
        assert_eq!(fc.resume_lsn(None), Lsn::ZERO);
        assert_eq!(fc.resume_lsn(Some(Lsn(7))), Lsn(7));

        fc.mark_received(Lsn(100));
        fc.acknowledge(Lsn(80));
        assert_eq!(fc.resume_lsn(Some(Lsn(7))), Lsn(80));
    }
}
