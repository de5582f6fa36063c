//! Bit-granular serialization over a byte buffer. Multi-byte values go on the wire
//!  least-significant byte first, and sub-byte fields pack LSB-first with no padding
//!  across byte boundaries, so byte-aligned writes after byte-aligned writes behave
//!  exactly like a plain byte stream.

use anyhow::bail;

/// A tiered variable-length integer encoding. Values that fit `b1` bits are written as
///  `b1` bits plus a cleared continuation bit. Bigger values set the continuation bit and
///  spill into a `b2`-bit second tier, which carries its own continuation bit if a third
///  tier of `b3` bits exists. On the wire the continuation bit lands in the high bit of
///  each tier's byte(s) because of the LSB-first packing.
#[derive(Copy, Clone, Debug)]
pub struct VleEncoding {
    b1: u32,
    b2: u32,
    b3: u32,
}

/// 1.7/8: one or two bytes, 15 bits of payload. Used for the in-order packet id delta.
pub const VLE_8_16: VleEncoding = VleEncoding { b1: 7, b2: 8, b3: 0 };

/// 1.7/1.7/16: one, two or four bytes, 30 bits of payload. Used for message ids,
///  message lengths, fragment counts and fragment indices.
pub const VLE_8_16_32: VleEncoding = VleEncoding { b1: 7, b2: 7, b3: 16 };

impl VleEncoding {
    pub fn max_value(&self) -> u32 {
        let total_bits = self.b1 + self.b2 + self.b3;
        if total_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << total_bits) - 1
        }
    }

    pub fn encoded_bit_len(&self, value: u32) -> u32 {
        if value < (1 << self.b1) {
            return self.b1 + 1;
        }
        let second_tier_continuation = if self.b3 > 0 { 1 } else { 0 };
        if value < (1 << (self.b1 + self.b2)) {
            return self.b1 + 1 + self.b2 + second_tier_continuation;
        }
        self.b1 + 1 + self.b2 + second_tier_continuation + self.b3
    }

    pub fn encoded_byte_len(&self, value: u32) -> usize {
        (self.encoded_bit_len(value) as usize).div_ceil(8)
    }
}

/// Bit-level writer. The buffer grows as needed; callers that assemble bounded packets
///  check [DataSerializer::bytes_filled] against their size limit before adding data,
///  which is why the `add_*` family is infallible except for value-range violations.
pub struct DataSerializer {
    buf: Vec<u8>,
    bit_pos: u32,
}

impl DataSerializer {
    pub fn new() -> DataSerializer {
        DataSerializer {
            buf: Vec::new(),
            bit_pos: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> DataSerializer {
        DataSerializer {
            buf: Vec::with_capacity(capacity),
            bit_pos: 0,
        }
    }

    /// Number of bytes that contain written data, partially filled trailing byte included.
    pub fn bytes_filled(&self) -> usize {
        self.buf.len()
    }

    pub fn bits_filled(&self) -> u64 {
        if self.buf.is_empty() {
            0
        } else {
            (self.buf.len() as u64 - 1) * 8 + if self.bit_pos == 0 { 8 } else { self.bit_pos as u64 }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn add_bit(&mut self, value: bool) {
        if self.bit_pos == 0 {
            self.buf.push(0);
        }
        if value {
            let last = self.buf.len() - 1;
            self.buf[last] |= 1 << self.bit_pos;
        }
        self.bit_pos = (self.bit_pos + 1) % 8;
    }

    /// Writes the lowest `count` bits of `value`, LSB first.
    pub fn add_bits(&mut self, count: u32, value: u64) {
        for i in 0..count {
            self.add_bit((value >> i) & 1 != 0);
        }
    }

    pub fn add_u8(&mut self, value: u8) {
        if self.bit_pos == 0 {
            // aligned fast path
            self.buf.push(value);
        } else {
            self.add_bits(8, value as u64);
        }
    }

    pub fn add_u16(&mut self, value: u16) {
        for b in value.to_le_bytes() {
            self.add_u8(b);
        }
    }

    pub fn add_u32(&mut self, value: u32) {
        for b in value.to_le_bytes() {
            self.add_u8(b);
        }
    }

    pub fn add_u64(&mut self, value: u64) {
        for b in value.to_le_bytes() {
            self.add_u8(b);
        }
    }

    pub fn add_i8(&mut self, value: i8) {
        self.add_u8(value as u8);
    }

    pub fn add_i16(&mut self, value: i16) {
        self.add_u16(value as u16);
    }

    pub fn add_i32(&mut self, value: i32) {
        self.add_u32(value as u32);
    }

    pub fn add_i64(&mut self, value: i64) {
        self.add_u64(value as u64);
    }

    pub fn add_f32(&mut self, value: f32) {
        self.add_u32(value.to_bits());
    }

    pub fn add_f64(&mut self, value: f64) {
        self.add_u64(value.to_bits());
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        if self.bit_pos == 0 {
            self.buf.extend_from_slice(data);
        } else {
            for &b in data {
                self.add_u8(b);
            }
        }
    }

    /// A string with a one-byte length prefix, so at most 255 bytes of UTF-8.
    pub fn add_string(&mut self, value: &str) -> anyhow::Result<()> {
        if value.len() > u8::MAX as usize {
            bail!("string of {} bytes does not fit a one-byte length prefix", value.len());
        }
        self.add_u8(value.len() as u8);
        self.add_bytes(value.as_bytes());
        Ok(())
    }

    pub fn add_vle(&mut self, encoding: VleEncoding, value: u32) -> anyhow::Result<()> {
        if value > encoding.max_value() {
            bail!("value {} exceeds VLE range {}", value, encoding.max_value());
        }

        let VleEncoding { b1, b2, b3 } = encoding;

        let more_than_first = value >= (1 << b1);
        self.add_bits(b1, value as u64);
        self.add_bit(more_than_first);
        if !more_than_first {
            return Ok(());
        }

        let rest = (value >> b1) as u64;
        if b3 == 0 {
            self.add_bits(b2, rest);
            return Ok(());
        }

        let more_than_second = rest >= (1 << b2);
        self.add_bits(b2, rest);
        self.add_bit(more_than_second);
        if more_than_second {
            self.add_bits(b3, rest >> b2);
        }
        Ok(())
    }
}

/// Bit-level reader over a received buffer. Every read is bounds-checked; running out
///  of data is an error surfaced to the caller, never a silent truncation or an
///  out-of-bounds access.
pub struct DataDeserializer<'a> {
    data: &'a [u8],
    bit_pos: u64,
}

impl<'a> DataDeserializer<'a> {
    pub fn new(data: &'a [u8]) -> DataDeserializer<'a> {
        DataDeserializer { data, bit_pos: 0 }
    }

    pub fn bits_left(&self) -> u64 {
        (self.data.len() as u64) * 8 - self.bit_pos
    }

    pub fn bytes_left(&self) -> usize {
        (self.bits_left() / 8) as usize
    }

    /// Index of the byte the next read starts in.
    pub fn byte_pos(&self) -> usize {
        (self.bit_pos / 8) as usize
    }

    pub fn read_bit(&mut self) -> anyhow::Result<bool> {
        if self.bits_left() < 1 {
            bail!("buffer exhausted: no bits left");
        }
        let byte = self.data[(self.bit_pos / 8) as usize];
        let bit = (byte >> (self.bit_pos % 8)) & 1 != 0;
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, count: u32) -> anyhow::Result<u64> {
        if self.bits_left() < count as u64 {
            bail!("buffer exhausted: {} bits requested, {} left", count, self.bits_left());
        }
        let mut result = 0u64;
        for i in 0..count {
            if self.read_bit()? {
                result |= 1 << i;
            }
        }
        Ok(result)
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        if self.bit_pos % 8 == 0 {
            // aligned fast path
            let pos = (self.bit_pos / 8) as usize;
            if pos >= self.data.len() {
                bail!("buffer exhausted: u8 requested, {} bits left", self.bits_left());
            }
            self.bit_pos += 8;
            Ok(self.data[pos])
        } else {
            Ok(self.read_bits(8)? as u8)
        }
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        let mut bytes = [0u8; 2];
        for b in bytes.iter_mut() {
            *b = self.read_u8()?;
        }
        Ok(u16::from_le_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        let mut bytes = [0u8; 4];
        for b in bytes.iter_mut() {
            *b = self.read_u8()?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut() {
            *b = self.read_u8()?;
        }
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_i8(&mut self) -> anyhow::Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> anyhow::Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> anyhow::Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> anyhow::Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        if self.bits_left() < (len as u64) * 8 {
            bail!("buffer exhausted: {} bytes requested, {} left", len, self.bytes_left());
        }
        let mut result = Vec::with_capacity(len);
        for _ in 0..len {
            result.push(self.read_u8()?);
        }
        Ok(result)
    }

    pub fn read_string(&mut self) -> anyhow::Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn read_vle(&mut self, encoding: VleEncoding) -> anyhow::Result<u32> {
        let VleEncoding { b1, b2, b3 } = encoding;

        let mut value = self.read_bits(b1)? as u32;
        if !self.read_bit()? {
            return Ok(value);
        }

        if b3 == 0 {
            value |= (self.read_bits(b2)? as u32) << b1;
            return Ok(value);
        }

        value |= (self.read_bits(b2)? as u32) << b1;
        if self.read_bit()? {
            value |= (self.read_bits(b3)? as u32) << (b1 + b2);
        }
        Ok(value)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::zero(VLE_8_16, 0, 8)]
    #[case::tier1_max(VLE_8_16, 0x7F, 8)]
    #[case::tier2_min(VLE_8_16, 0x80, 16)]
    #[case::tier2_max(VLE_8_16, 0x7FFF, 16)]
    #[case::wide_zero(VLE_8_16_32, 0, 8)]
    #[case::wide_tier1_max(VLE_8_16_32, 0x7F, 8)]
    #[case::wide_tier2_min(VLE_8_16_32, 0x80, 16)]
    #[case::wide_tier2_max(VLE_8_16_32, 0x3FFF, 16)]
    #[case::wide_tier3_min(VLE_8_16_32, 0x4000, 32)]
    #[case::wide_tier3_max(VLE_8_16_32, 0x3FFF_FFFF, 32)]
    fn test_vle_roundtrip(#[case] encoding: VleEncoding, #[case] value: u32, #[case] expected_bits: u32) {
        assert_eq!(encoding.encoded_bit_len(value), expected_bits);

        let mut writer = DataSerializer::new();
        writer.add_vle(encoding, value).unwrap();
        assert_eq!(writer.bits_filled(), expected_bits as u64);

        let buf = writer.into_vec();
        assert_eq!(buf.len(), encoding.encoded_byte_len(value));

        let mut reader = DataDeserializer::new(&buf);
        assert_eq!(reader.read_vle(encoding).unwrap(), value);
        assert_eq!(reader.bits_left(), 0);
    }

    #[rstest]
    #[case::vle_8_16(VLE_8_16, 0x7FFF)]
    #[case::vle_8_16_32(VLE_8_16_32, 0x3FFF_FFFF)]
    fn test_vle_range(#[case] encoding: VleEncoding, #[case] max: u32) {
        assert_eq!(encoding.max_value(), max);

        let mut writer = DataSerializer::new();
        assert!(writer.add_vle(encoding, max).is_ok());
        assert!(writer.add_vle(encoding, max + 1).is_err());
    }

    /// The continuation bit must land in the high bit of the first byte, with the low
    ///  7 value bits below it - this is the layout the peer expects.
    #[test]
    fn test_vle_wire_layout() {
        let mut writer = DataSerializer::new();
        writer.add_vle(VLE_8_16, 0x5).unwrap();
        assert_eq!(writer.as_bytes(), &[0x05]);

        let mut writer = DataSerializer::new();
        writer.add_vle(VLE_8_16, 0x123).unwrap();
        // low 7 bits 0x23 + continuation 0x80, then the remaining 8 bits 0x02
        assert_eq!(writer.as_bytes(), &[0xA3, 0x02]);

        let mut writer = DataSerializer::new();
        writer.add_vle(VLE_8_16_32, 0x1_0000).unwrap();
        assert_eq!(writer.as_bytes(), &[0x80, 0x80, 0x04, 0x00]);
    }

    #[test]
    fn test_bit_packing_lsb_first() {
        let mut writer = DataSerializer::new();
        writer.add_bit(true);
        writer.add_bit(false);
        writer.add_bit(true);
        assert_eq!(writer.as_bytes(), &[0b101]);
        assert_eq!(writer.bits_filled(), 3);

        writer.add_bits(5, 0b11111);
        assert_eq!(writer.as_bytes(), &[0b11111101]);
        assert_eq!(writer.bytes_filled(), 1);
    }

    #[test]
    fn test_mixed_roundtrip() {
        let mut writer = DataSerializer::new();
        writer.add_bit(true);
        writer.add_u8(0xAB);
        writer.add_u16(0x1234);
        writer.add_bit(false);
        writer.add_bit(true);
        writer.add_u32(0xDEAD_BEEF);
        writer.add_i16(-1234);
        writer.add_u64(0x0123_4567_89AB_CDEF);
        writer.add_f32(3.5);
        writer.add_f64(-0.25);
        writer.add_i8(-5);
        writer.add_string("hello").unwrap();
        writer.add_bytes(&[1, 2, 3]);

        let buf = writer.into_vec();
        let mut reader = DataDeserializer::new(&buf);

        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert!(!reader.read_bit().unwrap());
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_i16().unwrap(), -1234);
        assert_eq!(reader.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(reader.read_f32().unwrap(), 3.5);
        assert_eq!(reader.read_f64().unwrap(), -0.25);
        assert_eq!(reader.read_i8().unwrap(), -5);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_bytes(3).unwrap(), vec![1, 2, 3]);
    }

    #[rstest]
    #[case::empty_u8(&[], 8)]
    #[case::partial_u32(&[1, 2, 3], 32)]
    fn test_read_past_end(#[case] data: &[u8], #[case] bits: u32) {
        let mut reader = DataDeserializer::new(data);
        assert!(reader.read_bits(bits).is_err());
    }

    #[test]
    fn test_vle_truncated_second_tier() {
        // continuation bit set but the second tier is missing
        let mut reader = DataDeserializer::new(&[0x80]);
        assert!(reader.read_vle(VLE_8_16).is_err());
    }

    #[test]
    fn test_string_too_long_for_prefix() {
        let long = "x".repeat(256);
        let mut writer = DataSerializer::new();
        assert!(writer.add_string(&long).is_err());
    }

    #[test]
    fn test_byte_pos_tracks_partial_bytes() {
        let mut reader = DataDeserializer::new(&[0xFF, 0x00, 0x11]);
        assert_eq!(reader.byte_pos(), 0);
        reader.read_u8().unwrap();
        assert_eq!(reader.byte_pos(), 1);
        assert_eq!(reader.bytes_left(), 2);
        reader.read_bit().unwrap();
        assert_eq!(reader.bytes_left(), 1);
    }
}
