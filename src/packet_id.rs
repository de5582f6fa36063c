use std::fmt::{Display, Formatter};

/// Number of bits in a packet id on the wire.
pub const PACKET_ID_BITS: u32 = 22;

const PACKET_ID_MASK: u32 = (1 << PACKET_ID_BITS) - 1;

/// A 22-bit modular datagram sequence number. All arithmetic wraps modulo 2^22, and
///  'newer than' is defined by modular distance so the comparison stays meaningful
///  across wraparound.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value & PACKET_ID_MASK)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> PacketId {
        self.plus(1)
    }

    pub fn plus(&self, increment: u32) -> PacketId {
        PacketId(self.0.wrapping_add(increment) & PACKET_ID_MASK)
    }

    pub fn sub(&self, decrement: u32) -> PacketId {
        PacketId(self.0.wrapping_sub(decrement) & PACKET_ID_MASK)
    }

    /// The modular distance from `other` up to `self`, i.e. the number of increments
    ///  that lead from `other` to `self`.
    pub fn minus(&self, other: PacketId) -> u32 {
        if self.0 >= other.0 {
            self.0 - other.0
        } else {
            (1 << PACKET_ID_BITS) - (other.0 - self.0)
        }
    }

    /// Wraparound-tolerant ordering: `self` counts as newer if it is numerically bigger,
    ///  or if `other` is so far ahead that a wrap must have occurred in between.
    pub fn is_newer_than(&self, other: PacketId) -> bool {
        if self.0 > other.0 {
            return true;
        }
        if other.0 - self.0 >= (1 << (PACKET_ID_BITS - 1)) {
            return true;
        }
        false
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::simple(17, 17)]
    #[case::max(PACKET_ID_MASK, PACKET_ID_MASK)]
    #[case::truncated(1 << PACKET_ID_BITS, 0)]
    #[case::truncated_2((1 << PACKET_ID_BITS) + 5, 5)]
    fn test_from_raw(#[case] raw: u32, #[case] expected: u32) {
        assert_eq!(PacketId::from_raw(raw).to_raw(), expected);
    }

    #[rstest]
    #[case::regular(100, 5, 105)]
    #[case::wrap(PACKET_ID_MASK, 1, 0)]
    #[case::wrap_2(PACKET_ID_MASK - 1, 5, 3)]
    fn test_plus(#[case] id: u32, #[case] increment: u32, #[case] expected: u32) {
        assert_eq!(PacketId::from_raw(id).plus(increment).to_raw(), expected);
    }

    #[rstest]
    #[case::regular(105, 100, 5)]
    #[case::same(100, 100, 0)]
    #[case::wrap(3, PACKET_ID_MASK - 1, 5)]
    fn test_minus(#[case] id: u32, #[case] other: u32, #[case] expected: u32) {
        assert_eq!(PacketId::from_raw(id).minus(PacketId::from_raw(other)), expected);
    }

    #[rstest]
    #[case::bigger(100, 99, true)]
    #[case::smaller(99, 100, false)]
    #[case::same(100, 100, false)]
    #[case::wrapped(0, PACKET_ID_MASK, true)]
    #[case::wrapped_2(5, PACKET_ID_MASK - 100, true)]
    #[case::half_window(0, 1 << 21, true)]
    #[case::just_below_half_window(0, (1 << 21) - 1, false)]
    fn test_is_newer_than(#[case] id: u32, #[case] other: u32, #[case] expected: bool) {
        assert_eq!(PacketId::from_raw(id).is_newer_than(PacketId::from_raw(other)), expected);
    }

    /// add and sub are inverses for all relative distances
    #[rstest]
    #[case::small(10, 3)]
    #[case::wrapping(2, 7)]
    #[case::big(PACKET_ID_MASK, 1 << 20)]
    fn test_add_sub_roundtrip(#[case] a: u32, #[case] b: u32) {
        let a = PacketId::from_raw(a);
        let b = PacketId::from_raw(b);
        assert_eq!(b.plus(a.minus(b)), a);
        assert_eq!(a.sub(a.minus(b)), b);
    }
}
