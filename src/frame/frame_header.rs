use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::frame::codec_error::DecodeError;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum FrameType {
    Can = 1,
    /// simulator control signals, sent by the controller to the members
    Sensor = 2,
    HealthRequest = 3,
    HealthReport = 4,
    Sync = 5,
    FollowUp = 6,
    DelayRequest = 7,
    DelayResponse = 8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub member_index: u8,
    /// raw discriminator - it is kept unparsed here so that frames of unknown type can still be
    ///  attributed to their sender when they are dropped
    pub frame_type: u8,
    pub frame_number: u32,
    pub timestamp_us: u64,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 14;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.member_index);
        buf.put_u8(self.frame_type);
        buf.put_u32_le(self.frame_number);
        buf.put_u64_le(self.timestamp_us);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<FrameHeader, DecodeError> {
        let len = buf.remaining();
        if len < Self::SERIALIZED_LEN {
            return Err(DecodeError::TruncatedHeader { len });
        }

        Ok(FrameHeader {
            member_index: buf.get_u8(),
            frame_type: buf.get_u8(),
            frame_number: buf.get_u32_le(),
            timestamp_us: buf.get_u64_le(),
        })
    }

    pub fn parsed_frame_type(&self) -> Result<FrameType, DecodeError> {
        FrameType::try_from(self.frame_type)
            .map_err(|_| DecodeError::UnknownFrameType {
                frame_type: self.frame_type,
                member_index: self.member_index,
                frame_number: self.frame_number,
            })
    }
}
