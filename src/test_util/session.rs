use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::clock::Clock;
use crate::config::NodeConfig;
use crate::frame::can_frame::{CanFrame, CanId, CanMessage};
use crate::frame::frame::{Frame, Payload};
use crate::session::session::Session;
use crate::session::session_start::{MemberDescriptor, SessionStart};
use crate::session::telemetry::{TelemetryRecord, TelemetrySender};
use crate::test_util::data_plane::{RecordingDataPlane, RecordingDataPlaneFactory};

pub const TEST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);
pub const TEST_PORT: u16 = 5000;

pub fn test_config() -> NodeConfig {
    NodeConfig::new("test-node", "127.0.0.1:7000".parse().unwrap(), "127.0.0.1:7001".parse().unwrap())
}

/// a session start for this node as `own_index`, with members given as `(id, index, device)`
pub fn test_session_start(own_index: u8, members: &[(u64, u8, &str)]) -> SessionStart {
    SessionStart {
        id: 1,
        index: own_index,
        ip: IpAddr::V4(TEST_GROUP),
        port: TEST_PORT,
        members: members.iter()
            .map(|&(id, index, device)| MemberDescriptor { id, index, devices: vec![device.to_string()] })
            .collect(),
    }
}

/// controller, ECM and TCU as members 0, 1 and 2
pub fn test_members() -> Vec<(u64, u8, &'static str)> {
    vec![(0, 0, "Controller"), (7, 1, "ECM"), (8, 2, "TCU")]
}

pub fn test_can_frame(member_index: u8, frame_number: u32, sequence_number: u32, timestamp_us: u64) -> Frame {
    Frame {
        member_index,
        frame_number,
        timestamp_us,
        payload: Payload::Can(CanMessage {
            sequence_number,
            needs_response: false,
            frame: CanFrame::classic(CanId::Standard(0x100), &[1, 2, 3, 4]),
        }),
    }
}

pub fn test_frame(member_index: u8, frame_number: u32, timestamp_us: u64, payload: Payload) -> Frame {
    Frame {
        member_index,
        frame_number,
        timestamp_us,
        payload,
    }
}

pub struct TestSession {
    pub session: Session,
    pub data_plane: Arc<RecordingDataPlane>,
    pub factory: Arc<RecordingDataPlaneFactory>,
    pub telemetry: mpsc::Receiver<TelemetryRecord>,
}
impl TestSession {
    pub fn new(config: NodeConfig) -> TestSession {
        Self::with_clock(config, Arc::new(Clock::new()))
    }

    pub fn with_clock(config: NodeConfig, clock: Arc<Clock>) -> TestSession {
        let data_plane = RecordingDataPlane::new();
        let factory = Arc::new(RecordingDataPlaneFactory::new(data_plane.clone()));
        let (telemetry_sender, telemetry) = TelemetrySender::new(config.telemetry_queue_size);
        let session = Session::new(Arc::new(config), clock, factory.clone(), telemetry_sender, CancellationToken::new())
            .expect("test config should be valid");

        TestSession {
            session,
            data_plane,
            factory,
            telemetry,
        }
    }

    pub async fn started(config: NodeConfig, own_index: u8, members: &[(u64, u8, &str)]) -> TestSession {
        let mut result = Self::new(config);
        result.start(own_index, members).await;
        result
    }

    /// starts a session, discarding all telemetry records up to and including the start
    ///  notification
    pub async fn start(&mut self, own_index: u8, members: &[(u64, u8, &str)]) {
        self.session.start_session(&test_session_start(own_index, members)).await
            .expect("test session should start");
        let records = self.telemetry_records();
        match records.last() {
            Some(TelemetryRecord::SessionStarted(_)) => {}
            other => panic!("expected SessionStarted, was {:?}", other),
        }
    }

    pub async fn receive(&mut self, frame: &Frame) {
        let buf = frame.encode().expect("test frames should be valid");
        self.session.on_datagram(&buf).await
            .expect("receiving a test frame should not fail");
    }

    /// returns all telemetry records emitted so far
    pub fn telemetry_records(&mut self) -> Vec<TelemetryRecord> {
        let mut result = Vec::new();
        while let Ok(record) = self.telemetry.try_recv() {
            result.push(record);
        }
        result
    }
}
