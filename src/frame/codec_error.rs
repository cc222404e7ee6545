use thiserror::Error;

use crate::frame::frame_header::FrameType;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("datagram of {len} bytes is shorter than the frame header")]
    TruncatedHeader { len: usize },
    #[error("unknown frame type {frame_type} from member {member_index} (frame #{frame_number})")]
    UnknownFrameType { frame_type: u8, member_index: u8, frame_number: u32 },
    #[error("truncated {frame_type:?} payload from member {member_index} (frame #{frame_number})")]
    TruncatedPayload { frame_type: FrameType, member_index: u8, frame_number: u32 },
    #[error("invalid {frame_type:?} payload from member {member_index} (frame #{frame_number}): {reason}")]
    InvalidPayload { frame_type: FrameType, member_index: u8, frame_number: u32, reason: String },
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum EncodeError {
    #[error("CAN id {0:#x} does not fit its identifier format")]
    InvalidCanId(u32),
    #[error("CAN data length {len} exceeds maximum of {max}")]
    CanDataTooLong { len: usize, max: usize },
    #[error("{0} sensor signals exceed the maximum of 16")]
    TooManySignals(usize),
    #[error("{0} health records do not fit a single frame")]
    TooManyHealthRecords(usize),
}
