use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::clock::clock::Clock;
use crate::clock::clock_sync::{ClockSync, SyncRole};
use crate::config::{ConfigError, NodeConfig};
use crate::frame::can_frame::{CanFrame, CanMessage};
use crate::frame::frame::{Frame, Payload};
use crate::frame::health_record::NodeHealthRecord;
use crate::health::health_telemetry::{HealthTelemetry, NodeReport};
use crate::session::member::{Member, Roster, REFERENCE_INDEX};
use crate::session::retransmission::{Retransmission, RetransmissionAction};
use crate::session::session_error::SessionError;
use crate::session::session_start::SessionStart;
use crate::session::telemetry::*;
use crate::transport::data_plane::{DataPlane, DataPlaneFactory};
use crate::util::serial_number::is_newer;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Active,
    Stopping,
}

/// everything that lives exactly as long as one session
struct ActiveSession {
    session_id: u64,
    roster: Roster,
    data_plane: Arc<dyn DataPlane>,
    /// on the reference node, the number of the most recent sensor frame it sent; on members, the
    ///  most recent sensor frame number they received, echoed in their own frames
    frame_number: u32,
    next_sequence_number: u32,
    health: HealthTelemetry,
    retransmission: Retransmission,
    stop_token: CancellationToken,
}

impl ActiveSession {
    async fn send(&self, timestamp_us: u64, payload: Payload) -> Result<Bytes, SessionError> {
        self.send_numbered(self.frame_number, timestamp_us, payload).await
    }

    async fn send_numbered(&self, frame_number: u32, timestamp_us: u64, payload: Payload) -> Result<Bytes, SessionError> {
        let frame = Frame {
            member_index: self.roster.own_index(),
            frame_number,
            timestamp_us,
            payload,
        };
        let buf = frame.encode()?;
        trace!(frame_number, "sending {:?} frame", frame.frame_type());
        self.data_plane.send(&buf).await
            .map_err(SessionError::DataPlane)?;
        Ok(buf)
    }
}

/// The session manager: owns the state of the current session (if any) and everything that
///  survives across sessions, i.e. clock sync and the connection to the telemetry queue.
///
/// A `Session` is not internally synchronized. The event loop keeps it behind a single mutex
///  and calls one operation at a time.
pub struct Session {
    config: Arc<NodeConfig>,
    state: SessionState,
    clock_sync: ClockSync,
    data_plane_factory: Arc<dyn DataPlaneFactory>,
    telemetry: TelemetrySender,
    shutdown: CancellationToken,
    active: Option<ActiveSession>,
}

impl Session {
    pub fn new(
        config: Arc<NodeConfig>,
        clock: Arc<Clock>,
        data_plane_factory: Arc<dyn DataPlaneFactory>,
        telemetry: TelemetrySender,
        shutdown: CancellationToken,
    ) -> Result<Session, ConfigError> {
        config.validate()?;

        Ok(Session {
            clock_sync: ClockSync::new(clock, config.clock_sync.clone()),
            config,
            state: SessionState::Idle,
            data_plane_factory,
            telemetry,
            shutdown,
            active: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn clock(&self) -> &Arc<Clock> {
        self.clock_sync.clock()
    }

    pub fn roster(&self) -> Option<&Roster> {
        self.active.as_ref()
            .map(|a| &a.roster)
    }

    pub fn member(&self, member_index: u8) -> Option<&Member> {
        self.roster()?
            .get(member_index)
    }

    pub fn frame_number(&self) -> Option<u32> {
        self.active.as_ref()
            .map(|a| a.frame_number)
    }

    /// this node's view of a remote member's network quality in the current telemetry interval
    pub fn node_report(&self, member_index: u8) -> Option<&NodeReport> {
        self.active.as_ref()?
            .health.report(member_index)
    }

    /// the most recent health report of each reporting member
    pub fn health_aggregate(&self) -> Option<&BTreeMap<u8, Vec<NodeHealthRecord>>> {
        self.active.as_ref()
            .map(|a| a.health.aggregate())
    }

    pub fn data_plane(&self) -> Option<Arc<dyn DataPlane>> {
        self.active.as_ref()
            .map(|a| a.data_plane.clone())
    }

    /// cancelled when the current session stops, or when the node shuts down
    pub fn stop_token(&self) -> Option<CancellationToken> {
        self.active.as_ref()
            .map(|a| a.stop_token.clone())
    }

    /// Opens the data plane for a new session and enters [SessionState::Active]. Returns the new
    ///  session's stop token.
    pub async fn start_session(&mut self, start: &SessionStart) -> Result<CancellationToken, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let group = match start.ip {
            IpAddr::V4(ip) if ip.is_multicast() => ip,
            other => return Err(SessionError::NotMulticast(other)),
        };

        let now_us = self.clock().local_us();
        let roster = Roster::new(start.index, &start.members, now_us)?;
        if !roster.has_reference() {
            warn!(session_id = start.id, "session has no member with index {} - clocks will not be synchronized", REFERENCE_INDEX);
        }
        let retransmission = Retransmission::new(self.config.max_retransmissions, self.config.timeout_additive())?;

        let data_plane = self.data_plane_factory.open(group, start.port).await
            .map_err(SessionError::DataPlane)?;

        let role = if roster.is_reference() { SyncRole::Reference } else { SyncRole::Follower };
        self.clock_sync.on_session_start(role);

        let health = HealthTelemetry::new(roster.remote_members().map(|m| m.index), self.clock().time_us());
        let members = roster.indices().collect::<Vec<_>>();
        let stop_token = self.shutdown.child_token();

        info!(session_id = start.id, own_index = start.index, "session started with members {:?} on {}:{}", members, group, start.port);
        self.active = Some(ActiveSession {
            session_id: start.id,
            roster,
            data_plane,
            frame_number: 0,
            next_sequence_number: 0,
            health,
            retransmission,
            stop_token: stop_token.clone(),
        });
        self.state = SessionState::Active;

        self.telemetry.send(TelemetryRecord::SessionStarted(SessionStartedData {
            session_id: start.id,
            own_index: start.index,
            members,
            recording: self.config.recording,
        }));
        Ok(stop_token)
    }

    /// Leaves the multicast group and discards all session state. Calling this without an active
    ///  session does nothing.
    pub async fn stop_session(&mut self, reason: StopReason) {
        let Some(active) = self.active.take() else {
            trace!("no active session to stop");
            return;
        };

        self.state = SessionState::Stopping;
        active.stop_token.cancel();
        if let Err(e) = active.data_plane.leave().await {
            warn!(session_id = active.session_id, "error leaving the multicast group: {:#}", e);
        }
        if active.retransmission.has_pending() {
            debug!(session_id = active.session_id, frame_number = active.frame_number, "discarding pending sensor frame");
        }

        info!(session_id = active.session_id, "session stopped: {}", reason);
        self.state = SessionState::Idle;
        self.telemetry.send(TelemetryRecord::SessionStopped(SessionStoppedData { reason }));
    }

    pub async fn handle_fatal(&mut self, err: anyhow::Error) {
        error!("session-fatal error - stopping the session: {:#}", err);
        self.stop_session(StopReason::Fatal(format!("{:#}", err))).await;
    }

    /// Dispatches a received datagram. Malformed frames and frames that do not belong to this
    ///  session are logged and dropped, so errors returned from here come from sending a reply.
    pub async fn on_datagram(&mut self, buf: &[u8]) -> Result<(), SessionError> {
        let Some(active) = &mut self.active else {
            trace!("received a datagram without an active session - dropping");
            return Ok(());
        };

        let frame = match Frame::decode(buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed frame: {}", e);
                return Ok(());
            }
        };

        let sender = frame.member_index;
        let frame_number = frame.frame_number;
        if sender == active.roster.own_index() {
            trace!(frame_number, "dropping frame looped back from this node");
            return Ok(());
        }
        if !active.roster.contains(sender) {
            debug!(member_index = sender, frame_number, "dropping frame from a member that is not part of the session");
            return Ok(());
        }

        let clock = self.clock_sync.clock().clone();
        let received_local_us = clock.local_us();
        let received_at_us = clock.timestamp_us();
        active.roster.on_frame_seen(sender, received_local_us);

        match frame.payload {
            Payload::Can(message) => {
                active.roster.on_can_frame(sender, frame_number, message.sequence_number);
                active.health.on_can_frame(sender, frame.timestamp_us, message.sequence_number, buf.len(), clock.time_us());
                self.telemetry.send(TelemetryRecord::CanMsg(CanMsgData {
                    member_index: sender,
                    frame_number,
                    timestamp_us: frame.timestamp_us,
                    message,
                }));
            }
            Payload::Sensor(signals) => {
                if sender != REFERENCE_INDEX || active.roster.is_reference() {
                    warn!(member_index = sender, frame_number, "rejecting SENSOR frame: sensor frames only flow from the reference node to members");
                    return Ok(());
                }
                if !is_newer(frame_number, active.frame_number) {
                    trace!(frame_number, "duplicate or outdated SENSOR frame - ignoring");
                    return Ok(());
                }

                active.frame_number = frame_number;
                self.telemetry.send(TelemetryRecord::SimMsg(SimMsgData {
                    frame_number,
                    timestamp_us: frame.timestamp_us,
                    signals,
                }));
            }
            Payload::HealthRequest => {
                debug!(member_index = sender, "answering health request");
                let records = active.health.snapshot();
                active.send(clock.timestamp_us(), Payload::HealthReport(records)).await?;
            }
            Payload::HealthReport(records) => {
                active.health.on_health_report(sender, records.clone());
                self.telemetry.send(TelemetryRecord::HealthReport(HealthReportData {
                    reporter_index: sender,
                    records,
                }));
            }
            Payload::Sync => {
                if sender == REFERENCE_INDEX {
                    self.clock_sync.on_sync(received_local_us);
                }
            }
            Payload::FollowUp { t1_us } => {
                if sender == REFERENCE_INDEX && self.clock_sync.on_follow_up(t1_us) {
                    let t4_local_us = clock.local_us();
                    active.send(clock.timestamp_us(), Payload::DelayRequest).await?;
                    self.clock_sync.on_delay_request_sent(t4_local_us);
                }
            }
            Payload::DelayRequest => {
                if let Some(t3_us) = self.clock_sync.on_delay_request(received_at_us) {
                    active.send(clock.timestamp_us(), Payload::DelayResponse { t3_us, requester_index: sender }).await?;
                }
            }
            Payload::DelayResponse { t3_us, requester_index } => {
                if sender == REFERENCE_INDEX && requester_index == active.roster.own_index() {
                    self.clock_sync.on_delay_response(t3_us);
                }
            }
        }
        Ok(())
    }

    /// Sends a CAN frame to all members, returning the sequence number it was sent with
    pub async fn send_can(&mut self, frame: CanFrame, needs_response: bool) -> Result<u32, SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::NotActive)?;

        let sequence_number = active.next_sequence_number;
        let message = CanMessage {
            sequence_number,
            needs_response,
            frame,
        };
        active.send(self.clock_sync.clock().timestamp_us(), Payload::Can(message)).await?;
        active.next_sequence_number = sequence_number.wrapping_add(1);
        Ok(sequence_number)
    }

    /// Sends the simulator's signals as the next sensor frame, returning its frame number. Only
    ///  the reference node sends sensor frames.
    pub async fn send_sensor(&mut self, signals: Vec<f32>) -> Result<u32, SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::NotActive)?;
        if !active.roster.is_reference() {
            return Err(SessionError::NotReference);
        }

        let frame_number = active.frame_number.wrapping_add(1);
        let buf = active.send_numbered(frame_number, self.clock_sync.clock().timestamp_us(), Payload::Sensor(signals)).await?;
        active.frame_number = frame_number;
        active.retransmission.on_sent(frame_number, buf, Instant::now());
        Ok(frame_number)
    }

    /// Runs one round of clock sync: the reference node sends SYNC and FOLLOW_UP, members apply
    ///  the best offset sample they collected. Returns the time until the next round is due.
    pub async fn sync_tick(&mut self) -> Result<Duration, SessionError> {
        let Some(active) = &self.active else {
            return Ok(self.clock_sync.next_interval());
        };

        if self.clock_sync.on_round_due() {
            let t1_us = self.clock_sync.clock().timestamp_us();
            active.send(t1_us, Payload::Sync).await?;
            active.send(self.clock_sync.clock().timestamp_us(), Payload::FollowUp { t1_us }).await?;
        }
        else if let Some(sample) = self.clock_sync.apply_best_sample() {
            trace!(offset_us = sample.offset_us, delay_us = sample.delay_us, "clock offset updated");
        }
        Ok(self.clock_sync.next_interval())
    }

    /// Ends the current telemetry interval: members send their health report to the reference
    ///  node, the reference node adds its own report to the aggregate directly.
    pub async fn health_tick(&mut self) -> Result<(), SessionError> {
        let Some(active) = &mut self.active else {
            return Ok(());
        };

        let records = active.health.take_snapshot();
        if records.is_empty() {
            return Ok(());
        }

        if active.roster.is_reference() {
            let own_index = active.roster.own_index();
            active.health.on_health_report(own_index, records.clone());
            self.telemetry.send(TelemetryRecord::HealthReport(HealthReportData {
                reporter_index: own_index,
                records,
            }));
        }
        else {
            active.send(self.clock_sync.clock().timestamp_us(), Payload::HealthReport(records)).await?;
        }
        Ok(())
    }

    pub async fn retransmission_tick(&mut self) -> Result<(), SessionError> {
        let Some(active) = &mut self.active else {
            return Ok(());
        };

        let members = active.roster.remote_members()
            .map(|m| (m.index, m.last_received_frame))
            .collect::<Vec<_>>();

        match active.retransmission.on_tick(Instant::now(), members) {
            RetransmissionAction::Resend(buf) => {
                active.data_plane.send(&buf).await
                    .map_err(SessionError::DataPlane)?;
            }
            RetransmissionAction::Idle | RetransmissionAction::GaveUp { .. } => {}
        }
        Ok(())
    }

    /// Reports members that were silent for longer than the configured member timeout. `now_s`
    ///  is on the local clock, so that clock sync corrections do not cause spurious timeouts.
    pub fn check_members(&mut self, now_s: f64) {
        let Some(active) = &mut self.active else {
            return;
        };

        let now_us = (now_s * 1e6) as i64;
        for (member_index, silent_for) in active.roster.check_timeouts(now_us, self.config.member_timeout) {
            warn!(session_id = active.session_id, member_index, "member was silent for {:?} - timed out", silent_for);
            self.telemetry.send(TelemetryRecord::MemberTimeout(MemberTimeoutData {
                member_index,
                silent_for,
            }));
        }
    }
}


#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use anyhow::anyhow;
    use tokio::time;

    use crate::frame::can_frame::CanId;
    use crate::frame::frame_header::FrameType;
    use crate::test_util::session::*;
    use crate::transport::data_plane::{MockDataPlane, MockDataPlaneFactory};
    use super::*;

    fn scenario_members() -> Vec<(u64, u8, &'static str)> {
        vec![(0, 0, "Controller"), (7, 1, "ECM")]
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_frames_from_member() {
        let mut test = TestSession::started(test_config(), 0, &scenario_members()).await;

        for sequence_number in 10..=12 {
            time::advance(Duration::from_millis(10)).await;
            let sent_at = test.session.clock().timestamp_us() - 1_000;
            test.receive(&test_can_frame(1, 3, sequence_number, sent_at)).await;
        }

        let member = test.session.member(1).unwrap();
        assert_eq!(member.last_received_frame, 3);
        assert_eq!(member.last_sequence_number, 12);

        let report = test.session.node_report(1).unwrap();
        assert_eq!(report.packet_loss, 0.0);
        assert_eq!(report.latency.count, 3);
        assert_eq!(report.latency.mean, 1.0);

        let records = test.telemetry_records();
        assert_eq!(records.len(), 3);
        for (record, expected_seq) in records.iter().zip(10..) {
            match record {
                TelemetryRecord::CanMsg(data) => {
                    assert_eq!(data.member_index, 1);
                    assert_eq!(data.frame_number, 3);
                    assert_eq!(data.message.sequence_number, expected_seq);
                    assert_eq!(data.message.frame.data, vec![1, 2, 3, 4]);
                }
                other => panic!("unexpected record {:?}", other),
            }
        }

        // a member's health request is answered with this node's view of the session
        test.receive(&test_frame(1, 3, test.session.clock().timestamp_us(), Payload::HealthRequest)).await;
        let sent = test.data_plane.sent_frames().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].member_index, 0);
        match &sent[0].payload {
            Payload::HealthReport(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].member_index, 1);
                assert_eq!(records[0].packet_loss, 0.0);
                assert_eq!(records[0].latency.count, 3);
            }
            other => panic!("expected a health report, was {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_loss_is_tracked_per_member() {
        let mut test = TestSession::started(test_config(), 0, &test_members()).await;
        for sequence_number in [0, 1, 2, 5, 6] {
            test.receive(&test_can_frame(1, 0, sequence_number, 0)).await;
        }
        test.receive(&test_can_frame(2, 0, 100, 0)).await;

        assert_eq!(test.session.node_report(1).unwrap().packet_loss, 2.0);
        assert_eq!(test.session.node_report(2).unwrap().packet_loss, 0.0);
    }

    #[tokio::test]
    async fn test_start_session() {
        let mut test = TestSession::new(test_config());
        assert_eq!(test.session.state(), SessionState::Idle);

        let token = test.session.start_session(&test_session_start(1, &test_members())).await.unwrap();
        assert_eq!(test.session.state(), SessionState::Active);
        assert!(!token.is_cancelled());
        assert_eq!(test.factory.opened().await, vec![(TEST_GROUP, TEST_PORT)]);
        assert_eq!(test.session.roster().unwrap().own_index(), 1);
        assert_eq!(test.session.frame_number(), Some(0));

        assert_eq!(test.telemetry_records(), vec![TelemetryRecord::SessionStarted(SessionStartedData {
            session_id: 1,
            own_index: 1,
            members: vec![0, 1, 2],
            recording: false,
        })]);
    }

    #[tokio::test]
    async fn test_start_session_errors() {
        let mut test = TestSession::new(test_config());

        let mut unicast = test_session_start(1, &test_members());
        unicast.ip = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1));
        assert!(matches!(test.session.start_session(&unicast).await, Err(SessionError::NotMulticast(_))));

        let no_members = test_session_start(1, &[]);
        assert!(matches!(test.session.start_session(&no_members).await, Err(SessionError::EmptyRoster)));

        let not_a_member = test_session_start(5, &test_members());
        assert!(matches!(test.session.start_session(&not_a_member).await, Err(SessionError::OwnIndexMissing(5))));

        assert_eq!(test.session.state(), SessionState::Idle);
        assert!(test.factory.opened().await.is_empty());

        test.start(1, &test_members()).await;
        assert!(matches!(test.session.start_session(&test_session_start(1, &test_members())).await, Err(SessionError::AlreadyActive)));
        assert_eq!(test.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_stop_session_is_idempotent() {
        let mut test = TestSession::started(test_config(), 1, &test_members()).await;
        let token = test.session.stop_token().unwrap();

        test.session.stop_session(StopReason::Requested).await;
        assert_eq!(test.session.state(), SessionState::Idle);
        assert!(token.is_cancelled());
        assert!(test.data_plane.has_left());
        assert!(test.session.roster().is_none());

        test.session.stop_session(StopReason::Requested).await;
        assert_eq!(test.session.state(), SessionState::Idle);
        assert!(test.session.roster().is_none());

        assert_eq!(test.telemetry_records(), vec![
            TelemetryRecord::SessionStopped(SessionStoppedData { reason: StopReason::Requested }),
        ]);
    }

    #[tokio::test]
    async fn test_restart_resets_member_state() {
        let mut test = TestSession::started(test_config(), 0, &test_members()).await;
        test.receive(&test_can_frame(1, 5, 0, 0)).await;
        assert_eq!(test.session.member(1).unwrap().last_received_frame, 5);

        test.session.stop_session(StopReason::Requested).await;
        test.start(0, &test_members()).await;
        assert_eq!(test.session.member(1).unwrap().last_received_frame, 0);
        assert_eq!(test.session.node_report(1).unwrap().latency.count, 0);
    }

    #[tokio::test]
    async fn test_frames_that_do_not_belong_to_the_session_are_dropped() {
        let mut test = TestSession::started(test_config(), 1, &test_members()).await;

        // looped back
        test.receive(&test_can_frame(1, 1, 0, 0)).await;
        // not a member
        test.receive(&test_can_frame(9, 1, 0, 0)).await;
        // malformed
        test.session.on_datagram(b"\x02\x01\x05").await.unwrap();
        test.session.on_datagram(b"\x02\x63\x05\0\0\0\0\0\0\0\0\0\0\0").await.unwrap();

        assert!(test.telemetry_records().is_empty());
        assert_eq!(test.session.member(2).unwrap().last_received_frame, 0);
        test.data_plane.assert_no_remaining_frames().await;
    }

    #[tokio::test]
    async fn test_datagram_without_session_is_dropped() {
        let mut test = TestSession::new(test_config());
        let buf = test_can_frame(1, 1, 0, 0).encode().unwrap();
        test.session.on_datagram(&buf).await.unwrap();
        assert!(test.telemetry_records().is_empty());
    }

    #[tokio::test]
    async fn test_sensor_frames_at_member() {
        let mut test = TestSession::started(test_config(), 1, &test_members()).await;

        test.receive(&test_frame(0, 1, 500, Payload::Sensor(vec![1.5, 2.5]))).await;
        assert_eq!(test.session.frame_number(), Some(1));
        // a retransmission of the same frame
        test.receive(&test_frame(0, 1, 500, Payload::Sensor(vec![1.5, 2.5]))).await;
        // sensor frames from other members are rejected
        test.receive(&test_frame(2, 7, 500, Payload::Sensor(vec![9.0]))).await;
        assert_eq!(test.session.frame_number(), Some(1));

        assert_eq!(test.telemetry_records(), vec![TelemetryRecord::SimMsg(SimMsgData {
            frame_number: 1,
            timestamp_us: 500,
            signals: vec![1.5, 2.5],
        })]);

        // outgoing CAN frames echo the sensor frame number as acknowledgement
        assert_eq!(test.session.send_can(CanFrame::classic(CanId::Standard(0x7e8), &[0x02, 0x10]), false).await.unwrap(), 0);
        assert_eq!(test.session.send_can(CanFrame::classic(CanId::Extended(0x18daf110), &[]), true).await.unwrap(), 1);

        let sent = test.data_plane.sent_frames().await;
        assert_eq!(sent.len(), 2);
        for (frame, expected_seq) in sent.iter().zip(0..) {
            assert_eq!(frame.member_index, 1);
            assert_eq!(frame.frame_number, 1);
            match &frame.payload {
                Payload::Can(msg) => assert_eq!(msg.sequence_number, expected_seq),
                other => panic!("expected a CAN frame, was {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_sensor_frames_are_rejected_at_reference() {
        let mut test = TestSession::started(test_config(), 0, &test_members()).await;
        test.receive(&test_frame(1, 4, 0, Payload::Sensor(vec![1.0]))).await;
        assert_eq!(test.session.frame_number(), Some(0));
        assert!(test.telemetry_records().is_empty());
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let mut test = TestSession::new(test_config());
        assert!(matches!(test.session.send_can(CanFrame::classic(CanId::Standard(1), &[]), false).await, Err(SessionError::NotActive)));
        assert!(matches!(test.session.send_sensor(vec![]).await, Err(SessionError::NotActive)));
    }

    #[tokio::test]
    async fn test_send_sensor_only_at_reference() {
        let mut test = TestSession::started(test_config(), 2, &test_members()).await;
        assert!(matches!(test.session.send_sensor(vec![1.0]).await, Err(SessionError::NotReference)));
    }

    #[tokio::test]
    async fn test_invalid_can_frame_is_not_fatal() {
        let mut test = TestSession::started(test_config(), 1, &test_members()).await;
        let result = test.session.send_can(CanFrame::classic(CanId::Standard(1), &[0; 9]), false).await;
        match result {
            Err(e) => assert!(!e.is_fatal()),
            Ok(_) => panic!("expected an encode error"),
        }
        assert_eq!(test.session.state(), SessionState::Active);
        // the sequence number was not consumed
        assert_eq!(test.session.send_can(CanFrame::classic(CanId::Standard(1), &[]), false).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_retransmission_gives_up() {
        let mut config = test_config();
        config.max_retransmissions = 2;
        let timeout = config.timeout_additive();
        let mut test = TestSession::started(config, 0, &test_members()).await;

        assert_eq!(test.session.send_sensor(vec![0.25]).await.unwrap(), 1);
        for _ in 0..10 {
            time::advance(timeout).await;
            test.session.retransmission_tick().await.unwrap();
        }

        let sent = test.data_plane.sent_frames().await;
        assert_eq!(sent.len(), 3);
        for frame in sent {
            assert_eq!(frame.frame_number, 1);
            assert_eq!(frame.payload, Payload::Sensor(vec![0.25]));
        }
        assert_eq!(test.session.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_sensor_frame_is_not_resent() {
        let config = test_config();
        let timeout = config.timeout_additive();
        let mut test = TestSession::started(config, 0, &test_members()).await;

        test.session.send_sensor(vec![0.25]).await.unwrap();
        test.receive(&test_can_frame(1, 1, 0, 0)).await;
        time::advance(timeout).await;
        test.session.retransmission_tick().await.unwrap();
        // member 2 lags behind
        assert_eq!(test.data_plane.sent_frames().await.len(), 2);

        test.receive(&test_can_frame(2, 1, 0, 0)).await;
        time::advance(timeout).await;
        test.session.retransmission_tick().await.unwrap();
        test.data_plane.assert_no_remaining_frames().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_sync_between_reference_and_member() {
        let mut reference = TestSession::started(test_config(), 0, &scenario_members()).await;
        // the member's local clock starts five seconds later
        time::advance(Duration::from_secs(5)).await;
        let mut member = TestSession::with_clock(test_config(), Arc::new(Clock::new()));
        member.start(1, &scenario_members()).await;

        assert_eq!(reference.session.sync_tick().await.unwrap(), Duration::from_millis(200));
        let sync_frames = reference.data_plane.sent_frames().await;
        assert_eq!(sync_frames.iter().map(|f| f.frame_type()).collect::<Vec<_>>(), vec![FrameType::Sync, FrameType::FollowUp]);
        for frame in &sync_frames {
            member.receive(frame).await;
        }

        let delay_requests = member.data_plane.sent_frames().await;
        assert_eq!(delay_requests.iter().map(|f| f.frame_type()).collect::<Vec<_>>(), vec![FrameType::DelayRequest]);
        reference.receive(&delay_requests[0]).await;

        let delay_responses = reference.data_plane.sent_frames().await;
        assert_eq!(delay_responses.len(), 1);
        assert!(matches!(delay_responses[0].payload, Payload::DelayResponse { requester_index: 1, .. }));
        member.receive(&delay_responses[0]).await;

        assert_eq!(member.session.clock().offset_us(), 0);
        member.session.sync_tick().await.unwrap();
        assert_eq!(member.session.clock().offset_us(), 5_000_000);
        assert_eq!(member.session.clock().time_us(), reference.session.clock().time_us());
        assert_eq!(reference.session.clock().offset_us(), 0);
    }

    #[tokio::test]
    async fn test_delay_response_for_other_member_is_ignored() {
        let mut test = TestSession::started(test_config(), 1, &test_members()).await;
        test.receive(&test_frame(0, 0, 1_000, Payload::Sync)).await;
        test.receive(&test_frame(0, 0, 1_000, Payload::FollowUp { t1_us: 1_000 })).await;
        assert_eq!(test.data_plane.sent_frames().await.len(), 1);

        test.receive(&test_frame(0, 0, 2_000, Payload::DelayResponse { t3_us: 2_000, requester_index: 2 })).await;
        test.session.sync_tick().await.unwrap();
        assert_eq!(test.session.clock().offset_us(), 0);
    }

    #[tokio::test]
    async fn test_member_does_not_answer_delay_requests() {
        let mut test = TestSession::started(test_config(), 1, &test_members()).await;
        test.receive(&test_frame(2, 0, 0, Payload::DelayRequest)).await;
        test.data_plane.assert_no_remaining_frames().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tick_at_member() {
        let mut test = TestSession::started(test_config(), 1, &test_members()).await;
        time::advance(Duration::from_millis(100)).await;
        test.receive(&test_can_frame(2, 0, 0, test.session.clock().timestamp_us() - 2_000)).await;
        test.telemetry_records();

        test.session.health_tick().await.unwrap();
        let sent = test.data_plane.sent_frames().await;
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            Payload::HealthReport(records) => {
                assert_eq!(records.iter().map(|r| r.member_index).collect::<Vec<_>>(), vec![0, 2]);
                assert_eq!(records[0].latency.count, 0);
                assert_eq!(records[1].latency.count, 1);
                assert_eq!(records[1].latency.mean, 2.0);
            }
            other => panic!("expected a health report, was {:?}", other),
        }

        // a new interval starts
        assert_eq!(test.session.node_report(2).unwrap().latency.count, 0);
        assert!(test.telemetry_records().is_empty());
    }

    #[tokio::test]
    async fn test_health_reports_at_reference() {
        let mut test = TestSession::started(test_config(), 0, &test_members()).await;
        let record = NodeReport::default().to_record(2);
        test.receive(&test_frame(1, 0, 0, Payload::HealthReport(vec![record]))).await;

        test.session.health_tick().await.unwrap();
        test.data_plane.assert_no_remaining_frames().await;

        let aggregate = test.session.health_aggregate().unwrap();
        assert_eq!(aggregate.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(aggregate[&1], vec![record]);

        let records = test.telemetry_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], TelemetryRecord::HealthReport(HealthReportData { reporter_index: 1, records: vec![record] }));
        assert!(matches!(&records[1], TelemetryRecord::HealthReport(data) if data.reporter_index == 0 && data.records.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_members() {
        let mut test = TestSession::started(test_config(), 0, &test_members()).await;
        time::advance(Duration::from_secs(3)).await;
        test.receive(&test_can_frame(1, 0, 0, 0)).await;
        test.telemetry_records();

        time::advance(Duration::from_secs(3)).await;
        let now_s = test.session.clock().local_us() as f64 / 1e6;
        test.session.check_members(now_s);
        test.session.check_members(now_s);

        assert_eq!(test.telemetry_records(), vec![TelemetryRecord::MemberTimeout(MemberTimeoutData {
            member_index: 2,
            silent_for: Duration::from_secs(6),
        })]);
        assert!(test.session.member(2).unwrap().timed_out);
        assert!(!test.session.member(1).unwrap().timed_out);
    }

    #[tokio::test]
    async fn test_data_plane_failure_is_fatal() {
        let mut data_plane = MockDataPlane::new();
        data_plane.expect_send()
            .returning(|_| Err(anyhow!("network is unreachable")));
        data_plane.expect_leave()
            .times(1)
            .returning(|| Ok(()));
        let data_plane: Arc<dyn DataPlane> = Arc::new(data_plane);

        let mut factory = MockDataPlaneFactory::new();
        factory.expect_open()
            .times(1)
            .returning(move |_, _| Ok(data_plane.clone()));

        let (telemetry, mut telemetry_receiver) = TelemetrySender::new(16);
        let mut session = Session::new(Arc::new(test_config()), Arc::new(Clock::new()), Arc::new(factory), telemetry, CancellationToken::new()).unwrap();
        session.start_session(&test_session_start(1, &test_members())).await.unwrap();

        let err = session.send_can(CanFrame::classic(CanId::Standard(0x100), &[1]), false).await.unwrap_err();
        assert!(err.is_fatal());
        session.handle_fatal(err.into()).await;
        assert_eq!(session.state(), SessionState::Idle);

        assert!(matches!(telemetry_receiver.try_recv(), Ok(TelemetryRecord::SessionStarted(_))));
        match telemetry_receiver.try_recv() {
            Ok(TelemetryRecord::SessionStopped(SessionStoppedData { reason: StopReason::Fatal(msg) })) => {
                assert!(msg.contains("network is unreachable"));
            }
            other => panic!("expected SessionStopped, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_session_token() {
        let shutdown = CancellationToken::new();
        let (telemetry, _telemetry_receiver) = TelemetrySender::new(16);
        let factory = Arc::new(crate::test_util::data_plane::RecordingDataPlaneFactory::new(crate::test_util::data_plane::RecordingDataPlane::new()));
        let mut session = Session::new(Arc::new(test_config()), Arc::new(Clock::new()), factory, telemetry, shutdown.clone()).unwrap();

        let token = session.start_session(&test_session_start(1, &test_members())).await.unwrap();
        shutdown.cancel();
        assert!(token.is_cancelled());
    }
}
