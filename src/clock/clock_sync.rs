//! Clock synchronization between the reference node (member index 0) and all other members,
//!  modelled on PTP:
//!
//! ```ascii
//!   reference                    follower
//!      t1  |--- SYNC ------------>|  t2
//!          |--- FOLLOW_UP(t1) --->|
//!      t3  |<-- DELAY_REQUEST ----|  t4
//!          |--- DELAY_RESPONSE -->|
//!                 (t3)
//! ```
//!
//! t1 and t3 are taken on the reference clock, t2 and t4 on the follower's local monotonic clock.
//!  With a symmetric network delay, `t2 - t1 = delay - offset` and `t3 - t4 = delay + offset`
//!  where `follower_local + offset = reference`, so each round yields one offset sample and the
//!  delay it was measured with.
//!
//! Samples go into a ring buffer, and the follower periodically applies the lowest-delay sample
//!  that is newer than the last applied one. Each sample is applied at most once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::clock::clock::Clock;
use crate::clock::sample_ring::SampleRing;

pub const OFFSET_BUFFER_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct ClockSyncConfig {
    /// interval between sync rounds right after session start
    pub fast_sync_interval: Duration,
    /// number of rounds at [ClockSyncConfig::fast_sync_interval] before switching to
    ///  [ClockSyncConfig::sync_interval]
    pub fast_sync_rounds: u32,
    pub sync_interval: Duration,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        ClockSyncConfig {
            fast_sync_interval: Duration::from_millis(200),
            fast_sync_rounds: 5,
            sync_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OffsetSample {
    pub round: u64,
    pub offset_us: i64,
    pub delay_us: i64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RoundState {
    Idle,
    SyncReceived { t2: i64 },
    FollowUpReceived { t1: i64, t2: i64 },
    DelayRequestSent { t1: i64, t2: i64, t4: i64 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncRole {
    Reference,
    Follower,
}

pub struct ClockSync {
    clock: Arc<Clock>,
    config: ClockSyncConfig,
    role: SyncRole,
    rounds_since_start: u32,
    round_state: RoundState,
    samples: SampleRing<OffsetSample, OFFSET_BUFFER_DEPTH>,
    next_round: u64,
    last_applied_round: Option<u64>,
}

impl ClockSync {
    pub fn new(clock: Arc<Clock>, config: ClockSyncConfig) -> ClockSync {
        ClockSync {
            clock,
            config,
            role: SyncRole::Follower,
            rounds_since_start: 0,
            round_state: RoundState::Idle,
            samples: SampleRing::new(),
            next_round: 0,
            last_applied_round: None,
        }
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    /// Called at session start. The reference node's clock *is* the reference, so its offset is
    ///  reset to zero. A follower keeps its previous offset as a starting point: samples and
    ///  offset survive across sessions.
    pub fn on_session_start(&mut self, role: SyncRole) {
        if role != self.role {
            info!("clock sync role changes from {:?} to {:?}", self.role, role);
        }
        self.role = role;
        self.rounds_since_start = 0;
        self.round_state = RoundState::Idle;

        if role == SyncRole::Reference {
            self.clock.set_offset_us(0);
        }
    }

    /// time until the next sync round: rapid rounds right after session start to converge
    ///  quickly, then steady state
    pub fn next_interval(&self) -> Duration {
        if self.rounds_since_start < self.config.fast_sync_rounds {
            self.config.fast_sync_interval
        }
        else {
            self.config.sync_interval
        }
    }

    /// Advances the round counter for the cadence. Returns `true` if this node should send
    ///  SYNC + FOLLOW_UP now, i.e. if it is the reference node.
    pub fn on_round_due(&mut self) -> bool {
        self.rounds_since_start = self.rounds_since_start.saturating_add(1);
        self.role == SyncRole::Reference
    }

    /// follower side: a SYNC frame arrived at local time `t2`
    pub fn on_sync(&mut self, t2_local_us: i64) {
        if self.role != SyncRole::Follower {
            return;
        }
        if self.round_state != RoundState::Idle {
            trace!("new SYNC received before previous round completed - starting over");
        }
        self.round_state = RoundState::SyncReceived { t2: t2_local_us };
    }

    /// Follower side: a FOLLOW_UP arrived with the precise send time of the preceding SYNC.
    ///
    /// Returns `true` if a DELAY_REQUEST should be sent to complete the round.
    pub fn on_follow_up(&mut self, t1_us: u64) -> bool {
        match self.round_state {
            RoundState::SyncReceived { t2 } => {
                self.round_state = RoundState::FollowUpReceived { t1: t1_us as i64, t2 };
                true
            }
            _ => {
                debug!("FOLLOW_UP without preceding SYNC - ignoring");
                false
            }
        }
    }

    /// follower side: the DELAY_REQUEST was sent at local time `t4`
    pub fn on_delay_request_sent(&mut self, t4_local_us: i64) {
        if let RoundState::FollowUpReceived { t1, t2 } = self.round_state {
            self.round_state = RoundState::DelayRequestSent { t1, t2, t4: t4_local_us };
        }
    }

    /// Reference side: returns the receipt timestamp to send back in a DELAY_RESPONSE, or `None`
    ///  if this node is not the reference
    pub fn on_delay_request(&self, received_at_us: u64) -> Option<u64> {
        match self.role {
            SyncRole::Reference => Some(received_at_us),
            SyncRole::Follower => None,
        }
    }

    /// follower side: completes a round, returning the new sample if it was consistent
    pub fn on_delay_response(&mut self, t3_us: u64) -> Option<OffsetSample> {
        let RoundState::DelayRequestSent { t1, t2, t4 } = self.round_state else {
            debug!("DELAY_RESPONSE without pending DELAY_REQUEST - ignoring");
            return None;
        };
        self.round_state = RoundState::Idle;

        let t3 = t3_us as i64;
        let reference_to_follower = t2 - t1;
        let follower_to_reference = t3 - t4;

        let delay_us = (reference_to_follower + follower_to_reference) / 2;
        if delay_us < 0 {
            warn!(t1, t2, t3, t4, "clock sync round with negative delay - discarding sample");
            return None;
        }

        let sample = OffsetSample {
            round: self.next_round,
            offset_us: (follower_to_reference - reference_to_follower) / 2,
            delay_us,
        };
        self.next_round += 1;

        trace!(?sample, "clock sync sample");
        let _ = self.samples.add_value(sample);
        Some(sample)
    }

    /// Applies the best sample (lowest delay) among those newer than the last applied one, and
    ///  returns it. Returns `None` and leaves the clock unchanged if there is no such sample.
    pub fn apply_best_sample(&mut self) -> Option<OffsetSample> {
        if self.role != SyncRole::Follower {
            return None;
        }

        let best = self.samples.iter()
            .filter(|s| self.last_applied_round.map_or(true, |applied| s.round > applied))
            .min_by_key(|s| (s.delay_us, std::cmp::Reverse(s.round)))
            .copied()?;

        self.last_applied_round = Some(best.round);
        let previous = self.clock.offset_us();
        self.clock.set_offset_us(best.offset_us);
        debug!(offset_us = best.offset_us, delay_us = best.delay_us, correction_us = best.offset_us - previous, "applied clock offset");
        Some(best)
    }
}
