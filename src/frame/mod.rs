//! The binary wire format of the data plane. Every UDP datagram carries exactly one frame, i.e.
//!  datagram boundaries are frame boundaries and there is no length prefix.
//!
//! ```ascii
//!  0: member index (u8) - index of the sending member in the session roster, 0 is the
//!      controller / reference node
//!  1: frame type (u8)
//!  2: frame number (u32 LE) - per originating member, wraps at 2^32
//!  6: timestamp (u64 LE) - microseconds on the session's synchronized clock
//! 14: payload, depending on the frame type
//! ```
//!
//! The codec is a pure transform: it has no side effects, does no sequencing and does not retry.

pub mod can_frame;
pub mod codec_error;
pub mod frame;
pub mod frame_header;
pub mod health_record;
