use std::fmt::{Display, Formatter};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use crate::frame::can_frame::CanMessage;
use crate::frame::health_record::NodeHealthRecord;

/// The records a node emits for consumers outside the protocol engine, e.g. a UI or a session
///  recorder.
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryRecord {
    CanMsg(CanMsgData),
    SimMsg(SimMsgData),
    HealthReport(HealthReportData),
    SessionStarted(SessionStartedData),
    SessionStopped(SessionStoppedData),
    MemberTimeout(MemberTimeoutData),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CanMsgData {
    pub member_index: u8,
    pub frame_number: u32,
    pub timestamp_us: u64,
    pub message: CanMessage,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimMsgData {
    pub frame_number: u32,
    pub timestamp_us: u64,
    pub signals: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthReportData {
    pub reporter_index: u8,
    pub records: Vec<NodeHealthRecord>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionStartedData {
    pub session_id: u64,
    pub own_index: u8,
    pub members: Vec<u8>,
    pub recording: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionStoppedData {
    pub reason: StopReason,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemberTimeoutData {
    pub member_index: u8,
    pub silent_for: Duration,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// the broker ended the session
    Requested,
    Shutdown,
    Fatal(String),
}
impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stopped by broker"),
            StopReason::Shutdown => write!(f, "node shutdown"),
            StopReason::Fatal(msg) => write!(f, "fatal error: {}", msg),
        }
    }
}


/// The sending side of the telemetry queue. Sending never waits: the queue is bounded, and
///  records are dropped with a warning while it is full.
#[derive(Clone, Debug)]
pub struct TelemetrySender {
    sender: mpsc::Sender<TelemetryRecord>,
}
impl TelemetrySender {
    pub fn new(capacity: usize) -> (TelemetrySender, mpsc::Receiver<TelemetryRecord>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (TelemetrySender { sender }, receiver)
    }

    pub fn send(&self, record: TelemetryRecord) {
        trace!("telemetry: {:?}", record);
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!("telemetry queue is full - dropping {:?}", record);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("telemetry queue has no receiver");
            }
        }
    }
}
