use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::frame::can_frame::{CanFrame, CanMessage};
use crate::frame::codec_error::{DecodeError, EncodeError};
use crate::frame::frame_header::{FrameHeader, FrameType};
use crate::frame::health_record::NodeHealthRecord;
use crate::util::buf_ext::BufExt;

pub const MAX_SENSOR_SIGNALS: usize = 16;

/// A UDP datagram is at most 64k, and the number of health records must fit into that
pub const MAX_HEALTH_RECORDS: usize = 255;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Can(CanMessage),
    Sensor(Vec<f32>),
    HealthRequest,
    HealthReport(Vec<NodeHealthRecord>),
    /// the sync instant is the header's timestamp
    Sync,
    FollowUp { t1_us: u64 },
    DelayRequest,
    DelayResponse { t3_us: u64, requester_index: u8 },
}

impl Payload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Payload::Can(_) => FrameType::Can,
            Payload::Sensor(_) => FrameType::Sensor,
            Payload::HealthRequest => FrameType::HealthRequest,
            Payload::HealthReport(_) => FrameType::HealthReport,
            Payload::Sync => FrameType::Sync,
            Payload::FollowUp { .. } => FrameType::FollowUp,
            Payload::DelayRequest => FrameType::DelayRequest,
            Payload::DelayResponse { .. } => FrameType::DelayResponse,
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Payload::Can(msg) => msg.serialized_len(),
            Payload::Sensor(signals) => 1 + 4*signals.len(),
            Payload::HealthReport(records) => records.len() * NodeHealthRecord::SERIALIZED_LEN,
            Payload::FollowUp { .. } => 8,
            Payload::DelayResponse { .. } => 8 + 1,
            Payload::HealthRequest | Payload::Sync | Payload::DelayRequest => 0,
        }
    }

    fn validate(&self) -> Result<(), EncodeError> {
        match self {
            Payload::Can(msg) => msg.frame.validate(),
            Payload::Sensor(signals) if signals.len() > MAX_SENSOR_SIGNALS => Err(EncodeError::TooManySignals(signals.len())),
            Payload::HealthReport(records) if records.len() > MAX_HEALTH_RECORDS => Err(EncodeError::TooManyHealthRecords(records.len())),
            _ => Ok(()),
        }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Payload::Can(msg) => {
                buf.put_u32_le(msg.sequence_number);
                buf.put_u8(msg.needs_response as u8);
                buf.put_u8(msg.frame.is_fd() as u8);
                msg.frame.ser(buf);
            }
            Payload::Sensor(signals) => {
                buf.put_u8(signals.len() as u8);
                for &signal in signals {
                    buf.put_f32_le(signal);
                }
            }
            Payload::HealthReport(records) => {
                for record in records {
                    record.ser(buf);
                }
            }
            Payload::FollowUp { t1_us } => {
                buf.put_u64_le(*t1_us);
            }
            Payload::DelayResponse { t3_us, requester_index } => {
                buf.put_u64_le(*t3_us);
                buf.put_u8(*requester_index);
            }
            Payload::HealthRequest | Payload::Sync | Payload::DelayRequest => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub member_index: u8,
    pub frame_number: u32,
    pub timestamp_us: u64,
    pub payload: Payload,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            member_index: self.member_index,
            frame_type: self.frame_type().into(),
            frame_number: self.frame_number,
            timestamp_us: self.timestamp_us,
        }
    }

    pub fn serialized_len(&self) -> usize {
        FrameHeader::SERIALIZED_LEN + self.payload.serialized_len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> Result<(), EncodeError> {
        self.payload.validate()?;
        self.header().ser(buf);
        self.payload.ser(buf);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Frame, DecodeError> {
        let header = FrameHeader::try_deser(&mut buf)?;
        let frame_type = header.parsed_frame_type()?;

        let payload = Self::deser_payload(&header, frame_type, &mut buf)?;
        if buf.has_remaining() {
            trace!("ignoring {} trailing bytes after {:?} frame from member {}", buf.remaining(), frame_type, header.member_index);
        }

        Ok(Frame {
            member_index: header.member_index,
            frame_number: header.frame_number,
            timestamp_us: header.timestamp_us,
            payload,
        })
    }

    fn deser_payload(header: &FrameHeader, frame_type: FrameType, buf: &mut &[u8]) -> Result<Payload, DecodeError> {
        let truncated = || DecodeError::TruncatedPayload {
            frame_type,
            member_index: header.member_index,
            frame_number: header.frame_number,
        };
        let invalid = |reason: String| DecodeError::InvalidPayload {
            frame_type,
            member_index: header.member_index,
            frame_number: header.frame_number,
            reason,
        };

        let payload = match frame_type {
            FrameType::Can => {
                let sequence_number = buf.checked_get_u32_le().ok_or_else(truncated)?;
                let needs_response = buf.checked_get_bool().ok_or_else(truncated)?;
                let fd = buf.checked_get_bool().ok_or_else(truncated)?;
                let frame = CanFrame::try_deser(buf, fd)
                    .map_err(invalid)?
                    .ok_or_else(truncated)?;
                Payload::Can(CanMessage { sequence_number, needs_response, frame })
            }
            FrameType::Sensor => {
                let num_signals = buf.checked_get_u8().ok_or_else(truncated)? as usize;
                if num_signals > MAX_SENSOR_SIGNALS {
                    return Err(invalid(format!("{} signals exceed the maximum of {}", num_signals, MAX_SENSOR_SIGNALS)));
                }
                let mut signals = Vec::with_capacity(num_signals);
                for _ in 0..num_signals {
                    signals.push(buf.checked_get_f32_le().ok_or_else(truncated)?);
                }
                Payload::Sensor(signals)
            }
            FrameType::HealthRequest => Payload::HealthRequest,
            FrameType::HealthReport => {
                if buf.remaining() % NodeHealthRecord::SERIALIZED_LEN != 0 {
                    return Err(truncated());
                }
                let mut records = Vec::with_capacity(buf.remaining() / NodeHealthRecord::SERIALIZED_LEN);
                while buf.has_remaining() {
                    records.push(NodeHealthRecord::try_deser(buf).ok_or_else(truncated)?);
                }
                Payload::HealthReport(records)
            }
            FrameType::Sync => Payload::Sync,
            FrameType::FollowUp => Payload::FollowUp {
                t1_us: buf.checked_get_u64_le().ok_or_else(truncated)?,
            },
            FrameType::DelayRequest => Payload::DelayRequest,
            FrameType::DelayResponse => Payload::DelayResponse {
                t3_us: buf.checked_get_u64_le().ok_or_else(truncated)?,
                requester_index: buf.checked_get_u8().ok_or_else(truncated)?,
            },
        };
        Ok(payload)
    }
}
