use bytes::{Buf, BufMut};

use crate::util::buf_ext::BufExt;

/// The part of a running statistic that is reported on the wire
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct HealthSummary {
    pub count: u32,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
}

impl HealthSummary {
    pub const SERIALIZED_LEN: usize = 4 + 4*8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.count);
        buf.put_f64_le(self.min);
        buf.put_f64_le(self.max);
        buf.put_f64_le(self.mean);
        buf.put_f64_le(self.variance);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Option<HealthSummary> {
        Some(HealthSummary {
            count: buf.checked_get_u32_le()?,
            min: buf.checked_get_f64_le()?,
            max: buf.checked_get_f64_le()?,
            mean: buf.checked_get_f64_le()?,
            variance: buf.checked_get_f64_le()?,
        })
    }
}

/// One member's entry in a `HEALTH_REPORT` frame. Records are fixed size and packed contiguously.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NodeHealthRecord {
    /// the member this record is *about*, not the reporting member
    pub member_index: u8,
    pub packet_loss: f32,
    pub latency: HealthSummary,
    pub jitter: HealthSummary,
    pub goodput: HealthSummary,
}

impl NodeHealthRecord {
    pub const SERIALIZED_LEN: usize = 1 + 4 + 3*HealthSummary::SERIALIZED_LEN;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.member_index);
        buf.put_f32_le(self.packet_loss);
        self.latency.ser(buf);
        self.jitter.ser(buf);
        self.goodput.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Option<NodeHealthRecord> {
        Some(NodeHealthRecord {
            member_index: buf.checked_get_u8()?,
            packet_loss: buf.checked_get_f32_le()?,
            latency: HealthSummary::try_deser(buf)?,
            jitter: HealthSummary::try_deser(buf)?,
            goodput: HealthSummary::try_deser(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use super::*;

    fn summary(count: u32) -> HealthSummary {
        HealthSummary {
            count,
            min: 1.5,
            max: 9.25,
            mean: 4.0,
            variance: 0.125,
        }
    }

    #[test]
    fn test_record_len() {
        let record = NodeHealthRecord {
            member_index: 4,
            packet_loss: 2.0,
            latency: summary(1),
            jitter: summary(2),
            goodput: summary(3),
        };

        let mut buf = BytesMut::new();
        record.ser(&mut buf);
        assert_eq!(buf.len(), NodeHealthRecord::SERIALIZED_LEN);
        assert_eq!(buf.len(), 113);
        assert_eq!(&buf[..5], b"\x04\0\0\0\x40");
    }

    #[test]
    fn test_record_deser_after_ser_with_identity_values() {
        let empty = HealthSummary { count: 0, min: f64::INFINITY, max: f64::NEG_INFINITY, mean: 0.0, variance: 0.0 };
        let record = NodeHealthRecord {
            member_index: 1,
            packet_loss: 0.0,
            latency: empty,
            jitter: empty,
            goodput: summary(17),
        };

        let mut buf = BytesMut::new();
        record.ser(&mut buf);
        let mut parse_buf: &[u8] = &buf;
        assert_eq!(NodeHealthRecord::try_deser(&mut parse_buf), Some(record));
        assert!(parse_buf.is_empty());
    }

    #[test]
    fn test_record_deser_truncated() {
        let mut buf: &[u8] = &[0u8; NodeHealthRecord::SERIALIZED_LEN - 1];
        assert_eq!(NodeHealthRecord::try_deser(&mut buf), None);
    }
}
