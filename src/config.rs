use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::clock::clock_sync::ClockSyncConfig;

pub const MAX_RETRANSMISSIONS_LIMIT: u8 = 3;

/// the simulator loop runs at least once every 1000 seconds
pub const MIN_FRAME_RATE: f64 = 0.001;
pub const MAX_FRAME_RATE: f64 = 10_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_retransmissions must be between 0 and {MAX_RETRANSMISSIONS_LIMIT}, was {0}")]
    InvalidRetransmissionBound(u8),
    #[error("frame rate must be between {MIN_FRAME_RATE} and {MAX_FRAME_RATE} frames per second, was {0}")]
    InvalidFrameRate(f64),
    #[error("{0} must not be zero")]
    ZeroInterval(&'static str),
    #[error("recording is enabled but no recording directory is configured")]
    MissingRecordingDir,
    #[error("telemetry queue size must not be zero")]
    ZeroQueueSize,
    #[error("receive buffer size must not be zero")]
    ZeroReceiveBuffer,
    #[error("re-registration delay {0:?} exceeds its maximum {1:?}")]
    InvalidReregistrationDelay(Duration, Duration),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// human readable name this node registers with at the broker
    pub node_name: String,
    /// descriptors of the devices (ECUs, simulator) attached to this node
    pub devices: Vec<String>,

    pub broker_addr: SocketAddr,
    /// the broker pushes session start / stop notifications to this address
    pub control_addr: SocketAddr,
    /// control connections that do not complete a request within this time are closed
    pub control_request_timeout: Duration,
    pub registration_timeout: Duration,
    /// the registration is re-posted this often to check that the broker is still there
    pub broker_check_interval: Duration,
    /// delay before the first re-registration after the broker was lost, doubling for each
    ///  failed attempt up to `max_reregistration_delay`
    pub reregistration_delay: Duration,
    pub max_reregistration_delay: Duration,
    /// the node gives up (and [crate::transport::event_loop::Node::run] returns an error) after
    ///  this many failed re-registrations; at least one is made
    pub max_reregistration_attempts: u32,

    /// local interface for joining multicast groups, `0.0.0.0` lets the OS pick
    pub multicast_interface: Ipv4Addr,
    pub multicast_ttl: u32,
    /// NB: frames looped back to the sending node are dropped by the session based on the member
    ///  index, so enabling this is harmless, and it is required for several nodes on one host
    pub multicast_loop: bool,
    /// the data socket's OS level receive buffer in bytes
    pub receive_buffer_size: usize,

    /// number of re-sends for an unacknowledged sensor frame, 0 to 3
    pub max_retransmissions: u8,
    /// simulator control loop frequency in frames per second
    pub frame_rate: f64,

    pub recording: bool,
    pub recording_dir: Option<PathBuf>,

    pub health_interval: Duration,
    pub clock_sync: ClockSyncConfig,
    /// a member that was silent for this long is reported as timed out
    pub member_timeout: Duration,

    pub telemetry_queue_size: usize,
}

impl NodeConfig {
    pub fn new(node_name: &str, broker_addr: SocketAddr, control_addr: SocketAddr) -> NodeConfig {
        NodeConfig {
            node_name: node_name.to_string(),
            devices: Vec::new(),
            broker_addr,
            control_addr,
            control_request_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(5),
            broker_check_interval: Duration::from_secs(5),
            reregistration_delay: Duration::from_secs(1),
            max_reregistration_delay: Duration::from_secs(30),
            max_reregistration_attempts: 5,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 16,
            multicast_loop: true,
            receive_buffer_size: 256*1024,
            max_retransmissions: 1,
            frame_rate: 20.0,
            recording: false,
            recording_dir: None,
            health_interval: Duration::from_secs(1),
            clock_sync: ClockSyncConfig::default(),
            member_timeout: Duration::from_secs(5),
            telemetry_queue_size: 1024,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retransmissions > MAX_RETRANSMISSIONS_LIMIT {
            return Err(ConfigError::InvalidRetransmissionBound(self.max_retransmissions));
        }
        if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&self.frame_rate) {
            return Err(ConfigError::InvalidFrameRate(self.frame_rate));
        }
        if self.recording && self.recording_dir.is_none() {
            return Err(ConfigError::MissingRecordingDir);
        }
        if self.telemetry_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.receive_buffer_size == 0 {
            return Err(ConfigError::ZeroReceiveBuffer);
        }
        if self.max_reregistration_delay < self.reregistration_delay {
            return Err(ConfigError::InvalidReregistrationDelay(self.reregistration_delay, self.max_reregistration_delay));
        }

        for (name, interval) in [
            ("health_interval", self.health_interval),
            ("member_timeout", self.member_timeout),
            ("registration_timeout", self.registration_timeout),
            ("control_request_timeout", self.control_request_timeout),
            ("broker_check_interval", self.broker_check_interval),
            ("reregistration_delay", self.reregistration_delay),
            ("fast_sync_interval", self.clock_sync.fast_sync_interval),
            ("sync_interval", self.clock_sync.sync_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }

    /// The time a sensor frame has to be acknowledged before it is re-sent. The retransmissions
    ///  of one frame are spread evenly over one frame period.
    pub fn timeout_additive(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate / self.max_retransmissions.max(1) as f64)
    }
}
