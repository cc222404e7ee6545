macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Option<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return None;
            }
            Some(self.$getter())
        }
    }
}


/// Non-panicking variants of the [bytes::Buf] getters that are used by the wire codec. All
///  multi-byte values on the wire are little endian.
///
/// They return `None` on buffer underflow, leaving it to the caller to decide what kind of
///  truncation that represents.
pub trait BufExt: bytes::Buf {
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_u32_le, u32, get_u32_le);
    get_checked_impl!(checked_get_u64_le, u64, get_u64_le);
    get_checked_impl!(checked_get_f32_le, f32, get_f32_le);
    get_checked_impl!(checked_get_f64_le, f64, get_f64_le);

    fn checked_get_bool(&mut self) -> Option<bool> {
        self.checked_get_u8()
            .map(|b| b != 0)
    }

    fn checked_copy_to_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.remaining() < N {
            return None;
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Some(result)
    }
}

impl <T: bytes::Buf> BufExt for T {
}


#[cfg(test)]
mod tests {
    use bytes::Buf;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::exact(b"\x01\x02\x03\x04", Some(0x04030201), b"")]
    #[case::remainder(b"\x01\0\0\0\x09", Some(1), b"\x09")]
    #[case::underflow(b"\x01\x02\x03", None, b"\x01\x02\x03")]
    #[case::empty(b"", None, b"")]
    fn test_checked_get_u32_le(#[case] mut buf: &[u8], #[case] expected: Option<u32>, #[case] buf_after: &[u8]) {
        assert_eq!(buf.checked_get_u32_le(), expected);
        assert_eq!(buf, buf_after);
    }

    #[rstest]
    #[case::complete(b"abcd", Some(*b"abcd"))]
    #[case::short(b"abc", None)]
    fn test_checked_copy_to_array(#[case] mut buf: &[u8], #[case] expected: Option<[u8; 4]>) {
        assert_eq!(buf.checked_copy_to_array::<4>(), expected);
    }

    #[test]
    fn test_checked_get_bool() {
        let mut buf: &[u8] = b"\0\x01\x07";
        assert_eq!(buf.checked_get_bool(), Some(false));
        assert_eq!(buf.checked_get_bool(), Some(true));
        assert_eq!(buf.checked_get_bool(), Some(true));
        assert_eq!(buf.checked_get_bool(), None);
    }

    #[test]
    fn test_checked_getters_next_to_buf() {
        // both traits in scope, as in the codec
        let mut buf: &[u8] = b"\x05\x01\0\0\0\x02";
        assert_eq!(buf.checked_get_u8(), Some(5));
        assert_eq!(buf.get_u32_le(), 1);
        assert_eq!(buf.remaining(), 1);
        assert_eq!(buf.checked_get_u32_le(), None);
        assert_eq!(buf.checked_get_u8(), Some(2));
    }
}
