use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::config::{ConfigError, MAX_RETRANSMISSIONS_LIMIT};
use crate::util::serial_number::is_newer;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RetransmissionAction {
    Idle,
    Resend(Bytes),
    /// the frame was not acknowledged by these members within the retransmission bound
    GaveUp { frame_number: u32, unacknowledged: Vec<u8> },
}

struct PendingFrame {
    frame_number: u32,
    buf: Bytes,
    attempts: u8,
    deadline: Instant,
}

/// Bounded re-sending of outbound sensor frames over the unreliable multicast data plane.
///
/// Members acknowledge a sensor frame implicitly by echoing its frame number in the frames they
///  send. A frame is re-sent while some member lags behind, until the retransmission bound is
///  exhausted - then it is considered lost, which is logged but not treated as an error.
///
/// Only the most recent sensor frame is tracked: sending a new one supersedes the pending one.
pub struct Retransmission {
    max_retransmissions: u8,
    timeout_additive: Duration,
    pending: Option<PendingFrame>,
}

impl Retransmission {
    pub fn new(max_retransmissions: u8, timeout_additive: Duration) -> Result<Retransmission, ConfigError> {
        if max_retransmissions > MAX_RETRANSMISSIONS_LIMIT {
            return Err(ConfigError::InvalidRetransmissionBound(max_retransmissions));
        }

        Ok(Retransmission {
            max_retransmissions,
            timeout_additive,
            pending: None,
        })
    }

    pub fn timeout_additive(&self) -> Duration {
        self.timeout_additive
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// to be called after a sensor frame was sent for the first time
    pub fn on_sent(&mut self, frame_number: u32, buf: Bytes, now: Instant) {
        if let Some(prev) = &self.pending {
            trace!(frame_number = prev.frame_number, "pending sensor frame superseded by #{}", frame_number);
        }

        if self.max_retransmissions == 0 {
            self.pending = None;
            return;
        }

        self.pending = Some(PendingFrame {
            frame_number,
            buf,
            attempts: 1,
            deadline: now + self.timeout_additive,
        });
    }

    /// Checks the pending frame against the members' acknowledgement state. `members` are the
    ///  non-reference members with the last frame number they echoed.
    pub fn on_tick(&mut self, now: Instant, members: impl IntoIterator<Item = (u8, u32)>) -> RetransmissionAction {
        let Some(pending) = &mut self.pending else {
            return RetransmissionAction::Idle;
        };
        if now < pending.deadline {
            return RetransmissionAction::Idle;
        }

        let lagging = members.into_iter()
            .filter(|(_, last_received_frame)| is_newer(pending.frame_number, *last_received_frame))
            .map(|(index, _)| index)
            .collect::<Vec<_>>();

        if lagging.is_empty() {
            trace!(frame_number = pending.frame_number, "sensor frame acknowledged by all members");
            self.pending = None;
            return RetransmissionAction::Idle;
        }

        if pending.attempts <= self.max_retransmissions {
            trace!(frame_number = pending.frame_number, attempt = pending.attempts, ?lagging, "re-sending sensor frame");
            pending.attempts += 1;
            pending.deadline = now + self.timeout_additive;
            return RetransmissionAction::Resend(pending.buf.clone());
        }

        let frame_number = pending.frame_number;
        warn!(frame_number, unacknowledged = ?lagging, "sensor frame was not acknowledged after {} retransmissions - giving up", self.max_retransmissions);
        self.pending = None;
        RetransmissionAction::GaveUp { frame_number, unacknowledged: lagging }
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}
