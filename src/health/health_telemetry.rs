use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::frame::health_record::NodeHealthRecord;
use crate::health::health_core::HealthCore;
use crate::util::serial_number::serial_diff;

/// Lower bound for the time between two frames when calculating goodput. Retransmission bursts
///  can deliver frames back to back, and this avoids division by (almost) zero.
const MIN_GOODPUT_ELAPSED_SECS: f64 = 0.0001;

/// Network quality as observed for a single remote member during the current telemetry interval.
///
/// Latency and jitter are in milliseconds, goodput in bits per second.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeReport {
    pub packet_loss: f32,
    pub latency: HealthCore,
    pub jitter: HealthCore,
    pub goodput: HealthCore,
}

impl NodeReport {
    pub fn reset(&mut self) {
        *self = NodeReport::default();
    }

    pub fn to_record(&self, member_index: u8) -> NodeHealthRecord {
        NodeHealthRecord {
            member_index,
            packet_loss: self.packet_loss,
            latency: self.latency.summary(),
            jitter: self.jitter.summary(),
            goodput: self.goodput.summary(),
        }
    }
}

struct PeerTracker {
    report: NodeReport,
    /// survives interval resets: the time base for goodput is the previous frame, regardless of
    ///  the interval it was attributed to
    last_message_time_us: i64,
    /// `None` until the first CAN frame in a session established the baseline
    last_sequence_number: Option<u32>,
}

/// Per remote member health statistics, fed by incoming CAN frames and consumed once per
///  telemetry interval.
///
/// Frames are attributed to the interval during which they are processed, regardless of their
///  send timestamp: a frame that was sent before an interval boundary but arrives after it
///  counts towards the new interval.
pub struct HealthTelemetry {
    peers: BTreeMap<u8, PeerTracker>,
    /// the most recent health report received from each reporting member
    aggregate: BTreeMap<u8, Vec<NodeHealthRecord>>,
}

impl HealthTelemetry {
    pub fn new(remote_members: impl IntoIterator<Item = u8>, now_us: i64) -> HealthTelemetry {
        let peers = remote_members.into_iter()
            .map(|index| (index, PeerTracker {
                report: NodeReport::default(),
                last_message_time_us: now_us,
                last_sequence_number: None,
            }))
            .collect();

        HealthTelemetry {
            peers,
            aggregate: Default::default(),
        }
    }

    pub fn on_can_frame(&mut self, member_index: u8, sent_timestamp_us: u64, sequence_number: u32, frame_size_bytes: usize, now_us: i64) {
        let Some(peer) = self.peers.get_mut(&member_index) else {
            debug!(member_index, "CAN frame from a member without health tracking - ignoring");
            return;
        };

        let delay_us = now_us.saturating_sub(sent_timestamp_us as i64);
        let latency_millis = (delay_us as f64).abs() / 1000.0;
        peer.report.latency.update(latency_millis);
        let latency_variance = peer.report.latency.variance;
        peer.report.jitter.update(latency_variance);

        let elapsed_secs = (now_us.saturating_sub(peer.last_message_time_us) as f64 / 1_000_000.0)
            .max(MIN_GOODPUT_ELAPSED_SECS);
        peer.report.goodput.update((frame_size_bytes * 8) as f64 / elapsed_secs);
        peer.last_message_time_us = now_us;

        match peer.last_sequence_number {
            None => {
                peer.last_sequence_number = Some(sequence_number);
            }
            Some(last) => {
                let packets_lost = serial_diff(sequence_number, last.wrapping_add(1));
                if packets_lost >= 0 {
                    if packets_lost > 0 {
                        debug!(member_index, sequence_number, packets_lost, "gap in CAN sequence numbers");
                        peer.report.packet_loss += packets_lost as f32;
                    }
                    peer.last_sequence_number = Some(sequence_number);
                }
                else {
                    trace!(member_index, sequence_number, last, "duplicate or out-of-order CAN frame");
                }
            }
        }
    }

    pub fn report(&self, member_index: u8) -> Option<&NodeReport> {
        self.peers.get(&member_index)
            .map(|p| &p.report)
    }

    /// the current statistics for all tracked members, without resetting them
    pub fn snapshot(&self) -> Vec<NodeHealthRecord> {
        self.peers.iter()
            .map(|(&index, peer)| peer.report.to_record(index))
            .collect()
    }

    /// returns the statistics of the interval that just ended, and starts a new interval
    pub fn take_snapshot(&mut self) -> Vec<NodeHealthRecord> {
        let result = self.snapshot();
        for peer in self.peers.values_mut() {
            peer.report.reset();
        }
        result
    }

    pub fn on_health_report(&mut self, reporter_index: u8, records: Vec<NodeHealthRecord>) {
        for record in &records {
            if record.packet_loss > 0.0 {
                warn!(reporter_index, member_index = record.member_index, packet_loss = record.packet_loss, "member reports packet loss");
            }
        }
        self.aggregate.insert(reporter_index, records);
    }

    pub fn aggregate(&self) -> &BTreeMap<u8, Vec<NodeHealthRecord>> {
        &self.aggregate
    }
}
