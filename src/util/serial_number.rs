//! Frame numbers and CAN sequence numbers are u32 counters that wrap around to 0. They are
//!  compared with serial number arithmetic (RFC 1982 style): `a` is newer than `b` if the
//!  wrapping difference `a - b`, read as a signed 32-bit value, is positive.

/// the signed distance from `from` to `to`, taking wrap-around into account
pub fn serial_diff(to: u32, from: u32) -> i32 {
    to.wrapping_sub(from) as i32
}

pub fn is_newer(candidate: u32, reference: u32) -> bool {
    serial_diff(candidate, reference) > 0
}
