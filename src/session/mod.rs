pub mod member;
pub mod retransmission;
pub mod session;
pub mod session_error;
pub mod session_start;
pub mod telemetry;
