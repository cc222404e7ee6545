use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{info, trace};

use crate::session::session_error::SessionError;
use crate::session::session_start::MemberDescriptor;
use crate::util::serial_number::is_newer;

/// The controller's member index. It is the clock reference and the source of sensor frames.
pub const REFERENCE_INDEX: u8 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: u64,
    pub index: u8,
    pub devices: Vec<String>,
    /// the newest frame number received from this member, never moves backwards during a session
    pub last_received_frame: u32,
    pub last_sequence_number: u32,
    /// local clock
    pub last_seen_us: i64,
    pub timed_out: bool,
}

impl Member {
    fn new(descriptor: &MemberDescriptor, now_us: i64) -> Member {
        Member {
            id: descriptor.id,
            index: descriptor.index,
            devices: descriptor.devices.clone(),
            last_received_frame: 0,
            last_sequence_number: 0,
            last_seen_us: now_us,
            timed_out: false,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.index == REFERENCE_INDEX
    }
}

/// The members of a session, indexed by their broker assigned member index. The set of members
///  is fixed for the lifetime of a session, only their per-member state changes.
#[derive(Debug)]
pub struct Roster {
    own_index: u8,
    members: BTreeMap<u8, Member>,
}

impl Roster {
    pub fn new(own_index: u8, descriptors: &[MemberDescriptor], now_us: i64) -> Result<Roster, SessionError> {
        if descriptors.is_empty() {
            return Err(SessionError::EmptyRoster);
        }

        let mut members = BTreeMap::new();
        for descriptor in descriptors {
            if members.insert(descriptor.index, Member::new(descriptor, now_us)).is_some() {
                return Err(SessionError::DuplicateMemberIndex(descriptor.index));
            }
        }
        if !members.contains_key(&own_index) {
            return Err(SessionError::OwnIndexMissing(own_index));
        }

        Ok(Roster {
            own_index,
            members,
        })
    }

    pub fn own_index(&self) -> u8 {
        self.own_index
    }

    pub fn is_reference(&self) -> bool {
        self.own_index == REFERENCE_INDEX
    }

    pub fn has_reference(&self) -> bool {
        self.members.contains_key(&REFERENCE_INDEX)
    }

    pub fn contains(&self, index: u8) -> bool {
        self.members.contains_key(&index)
    }

    pub fn get(&self, index: u8) -> Option<&Member> {
        self.members.get(&index)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn indices(&self) -> impl Iterator<Item = u8> + '_ {
        self.members.keys().copied()
    }

    /// all members except this node
    pub fn remote_members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
            .filter(|m| m.index != self.own_index)
    }

    /// Records that a frame arrived from a member, re-arming its timeout. Returns `true` if the
    ///  member was timed out before.
    pub fn on_frame_seen(&mut self, index: u8, now_us: i64) -> bool {
        let Some(member) = self.members.get_mut(&index) else {
            return false;
        };
        member.last_seen_us = now_us;

        if member.timed_out {
            info!(member_index = index, "member is active again after timing out");
            member.timed_out = false;
            true
        }
        else {
            false
        }
    }

    pub fn on_can_frame(&mut self, index: u8, frame_number: u32, sequence_number: u32) {
        let Some(member) = self.members.get_mut(&index) else {
            return;
        };

        if is_newer(frame_number, member.last_received_frame) {
            member.last_received_frame = frame_number;
        }
        else if frame_number != member.last_received_frame {
            trace!(member_index = index, frame_number, last_received_frame = member.last_received_frame, "CAN frame with an outdated frame number");
        }
        member.last_sequence_number = sequence_number;
    }

    /// Marks remote members that were silent for longer than `timeout` as timed out, returning
    ///  them with the time since they were last seen. Each member is reported once until it is
    ///  seen again.
    pub fn check_timeouts(&mut self, now_us: i64, timeout: Duration) -> Vec<(u8, Duration)> {
        let timeout_us = timeout.as_micros() as i64;
        let own_index = self.own_index;

        self.members.values_mut()
            .filter(|m| m.index != own_index && !m.timed_out)
            .filter_map(|m| {
                let silent_us = now_us.saturating_sub(m.last_seen_us);
                if silent_us > timeout_us {
                    m.timed_out = true;
                    Some((m.index, Duration::from_micros(silent_us as u64)))
                }
                else {
                    None
                }
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn descriptor(id: u64, index: u8) -> MemberDescriptor {
        MemberDescriptor { id, index, devices: vec![format!("device-{}", index)] }
    }

    fn roster(own_index: u8) -> Roster {
        Roster::new(own_index, &[descriptor(10, 0), descriptor(11, 1), descriptor(12, 2)], 0).unwrap()
    }

    #[test]
    fn test_new() {
        let roster = roster(1);
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.own_index(), 1);
        assert!(!roster.is_reference());
        assert!(roster.has_reference());
        assert_eq!(roster.remote_members().map(|m| m.index).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(roster.get(2).unwrap().id, 12);
        assert_eq!(roster.get(2).unwrap().last_received_frame, 0);
        assert!(roster.get(0).unwrap().is_reference());
    }

    #[rstest]
    #[case::empty(0, vec![], "EmptyRoster")]
    #[case::duplicate(0, vec![descriptor(1, 0), descriptor(2, 1), descriptor(3, 1)], "DuplicateMemberIndex(1)")]
    #[case::own_missing(5, vec![descriptor(1, 0), descriptor(2, 1)], "OwnIndexMissing(5)")]
    fn test_new_invalid(#[case] own_index: u8, #[case] descriptors: Vec<MemberDescriptor>, #[case] expected: &str) {
        let err = Roster::new(own_index, &descriptors, 0).unwrap_err();
        assert_eq!(format!("{:?}", err), expected);
    }

    #[rstest]
    #[case::in_order(&[1, 2, 3], 3)]
    #[case::reordered(&[1, 3, 2], 3)]
    #[case::duplicate(&[4, 4], 4)]
    #[case::wrap_around(&[0x4000_0000, 0x8000_0000, 0xc000_0000, 5], 5)]
    fn test_last_received_frame_never_decreases(#[case] frame_numbers: &[u32], #[case] expected: u32) {
        let mut roster = roster(0);
        let mut previous = 0;
        for (seq, &frame_number) in frame_numbers.iter().enumerate() {
            roster.on_can_frame(1, frame_number, seq as u32);
            let current = roster.get(1).unwrap().last_received_frame;
            assert!(current == previous || is_newer(current, previous));
            previous = current;
        }
        assert_eq!(roster.get(1).unwrap().last_received_frame, expected);
        assert_eq!(roster.get(1).unwrap().last_sequence_number, frame_numbers.len() as u32 - 1);
    }

    #[test]
    fn test_member_timeout_is_reported_once() {
        let mut roster = roster(0);
        let timeout = Duration::from_secs(5);

        roster.on_frame_seen(1, 1_000_000);
        assert!(roster.check_timeouts(5_000_000, timeout).is_empty());

        assert_eq!(roster.check_timeouts(5_500_000, timeout), vec![(2, Duration::from_micros(5_500_000))]);
        assert!(roster.check_timeouts(5_600_000, timeout).is_empty());

        assert_eq!(roster.check_timeouts(6_500_000, timeout), vec![(1, Duration::from_micros(5_500_000))]);
        assert!(roster.get(1).unwrap().timed_out);

        // re-armed by the next frame
        assert!(roster.on_frame_seen(1, 7_000_000));
        assert!(!roster.get(1).unwrap().timed_out);
        assert!(!roster.on_frame_seen(1, 7_100_000));
        assert_eq!(roster.check_timeouts(12_200_000, timeout), vec![(1, Duration::from_micros(5_100_000))]);
    }

    #[test]
    fn test_own_index_never_times_out() {
        let mut roster = roster(2);
        let timed_out = roster.check_timeouts(60_000_000, Duration::from_secs(5));
        assert_eq!(timed_out.iter().map(|(index, _)| *index).collect::<Vec<_>>(), vec![0, 1]);
    }
}
