use bytes::{Buf, BufMut};

use crate::frame::codec_error::EncodeError;

/// Marks a 29-bit identifier in the raw `can_id` field (SocketCAN convention)
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_SFF_MASK: u32 = 0x0000_07ff;
const CAN_EFF_MASK: u32 = 0x1fff_ffff;

pub const CAN_MAX_DLEN: usize = 8;
pub const CANFD_MAX_DLEN: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CanId {
    Standard(u16),
    Extended(u32),
}
impl CanId {
    pub fn raw(&self) -> u32 {
        match *self {
            CanId::Standard(id) => id as u32,
            CanId::Extended(id) => id | CAN_EFF_FLAG,
        }
    }

    pub fn from_raw(raw: u32) -> CanId {
        if raw & CAN_EFF_FLAG != 0 {
            CanId::Extended(raw & CAN_EFF_MASK)
        }
        else {
            CanId::Standard((raw & CAN_SFF_MASK) as u16)
        }
    }

    fn validate(&self) -> Result<(), EncodeError> {
        let valid = match *self {
            CanId::Standard(id) => id as u32 <= CAN_SFF_MASK,
            CanId::Extended(id) => id <= CAN_EFF_MASK,
        };
        if valid {
            Ok(())
        }
        else {
            Err(EncodeError::InvalidCanId(self.raw()))
        }
    }
}

/// A single frame as it appeared on (or is destined for) a physical CAN bus.
///
/// On the wire, classic frames use the SocketCAN `can_frame` layout (16 bytes) and FD frames the
///  `canfd_frame` layout (72 bytes), with unused data bytes zero padded:
///
/// ```ascii
/// classic: can_id (u32 LE), len (u8), pad (u8), res0 (u8), len8_dlc (u8), data (8 bytes)
/// FD:      can_id (u32 LE), len (u8), flags (u8), res0 (u8), res1 (u8), data (64 bytes)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub data: Vec<u8>,
    /// `Some(flags)` for CAN FD frames (BRS / ESI bits), `None` for classic CAN
    pub fd_flags: Option<u8>,
}

impl CanFrame {
    pub const CLASSIC_SERIALIZED_LEN: usize = 8 + CAN_MAX_DLEN;
    pub const FD_SERIALIZED_LEN: usize = 8 + CANFD_MAX_DLEN;

    pub fn classic(id: CanId, data: &[u8]) -> CanFrame {
        CanFrame {
            id,
            data: data.to_vec(),
            fd_flags: None,
        }
    }

    pub fn fd(id: CanId, flags: u8, data: &[u8]) -> CanFrame {
        CanFrame {
            id,
            data: data.to_vec(),
            fd_flags: Some(flags),
        }
    }

    pub fn is_fd(&self) -> bool {
        self.fd_flags.is_some()
    }

    pub fn max_data_len(&self) -> usize {
        if self.is_fd() { CANFD_MAX_DLEN } else { CAN_MAX_DLEN }
    }

    pub fn serialized_len(&self) -> usize {
        if self.is_fd() { Self::FD_SERIALIZED_LEN } else { Self::CLASSIC_SERIALIZED_LEN }
    }

    pub fn validate(&self) -> Result<(), EncodeError> {
        self.id.validate()?;
        if self.data.len() > self.max_data_len() {
            return Err(EncodeError::CanDataTooLong { len: self.data.len(), max: self.max_data_len() });
        }
        Ok(())
    }

    /// NB: callers are expected to [CanFrame::validate] first
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.id.raw());
        buf.put_u8(self.data.len() as u8);
        buf.put_u8(self.fd_flags.unwrap_or(0));
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_slice(&self.data);
        buf.put_bytes(0, self.max_data_len() - self.data.len());
    }

    /// Returns `Ok(None)` if the buffer is too short, and `Err` with a reason if the content is
    ///  inconsistent.
    pub fn try_deser(buf: &mut impl Buf, fd: bool) -> Result<Option<CanFrame>, String> {
        let max_len = if fd { CANFD_MAX_DLEN } else { CAN_MAX_DLEN };
        if buf.remaining() < 8 + max_len {
            return Ok(None);
        }

        let raw_id = buf.get_u32_le();
        let len = buf.get_u8() as usize;
        let flags = buf.get_u8();
        buf.advance(2);

        if len > max_len {
            return Err(format!("CAN data length {} exceeds maximum of {}", len, max_len));
        }

        let mut data = vec![0u8; max_len];
        buf.copy_to_slice(&mut data);
        data.truncate(len);

        Ok(Some(CanFrame {
            id: CanId::from_raw(raw_id),
            data,
            fd_flags: if fd { Some(flags) } else { None },
        }))
    }
}

/// The payload of a `CAN` frame: a bus frame plus relay metadata
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CanMessage {
    /// counts CAN frames only (as opposed to the frame number), used for loss detection
    pub sequence_number: u32,
    pub needs_response: bool,
    pub frame: CanFrame,
}

impl CanMessage {
    pub fn serialized_len(&self) -> usize {
        4 + 1 + 1 + self.frame.serialized_len()
    }
}
