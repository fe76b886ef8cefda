//! MSB-first bit writer used to assemble AV1 OBUs and headers.

use crate::error::{EncodeError, Result};

/// Maximum number of bytes a LEB128 value may occupy in an AV1 bitstream.
pub const MAX_LEB128_BYTES: usize = 8;

/// Bit writer producing a big-endian-within-byte AV1 bitstream.
#[derive(Default)]
pub struct BitstreamWriter {
    data: Vec<u8>,
    current_byte: u8,
    bit_position: u8, // number of bits currently written into current_byte (0-7)
}

impl BitstreamWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            current_byte: 0,
            bit_position: 0,
        }
    }

    /// Writer with a pre-reserved byte capacity.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            current_byte: 0,
            bit_position: 0,
        }
    }

    /// Writes the low `num_bits` bits of `value`, MSB first.
    pub fn put_bits(&mut self, mut value: u64, mut num_bits: u8) {
        debug_assert!(num_bits <= 64);
        while num_bits > 0 {
            let space = 8 - self.bit_position;
            let take = std::cmp::min(space, num_bits);

            let shift = num_bits - take;
            let bits = ((value >> shift) & ((1u64 << take) - 1)) as u8;

            // A u8 shifted by 8 panics, so a full byte is assigned directly.
            if take == 8 {
                self.current_byte = bits;
            } else {
                self.current_byte = (self.current_byte << take) | bits;
            }
            self.bit_position += take;
            num_bits -= take;
            if shift > 0 {
                value &= (1u64 << shift) - 1;
            } else {
                value = 0;
            }

            if self.bit_position == 8 {
                self.data.push(self.current_byte);
                self.current_byte = 0;
                self.bit_position = 0;
            }
        }
    }

    pub fn put_bit(&mut self, bit: bool) {
        self.put_bits(bit as u64, 1);
    }

    /// Signed value in `n + 1` bits, two's complement (`su(1+n)`).
    pub fn put_su(&mut self, value: i32, n: u8) {
        let bits = n + 1;
        let mask = (1u64 << bits) - 1;
        self.put_bits((value as i64 as u64) & mask, bits);
    }

    /// Delta-coded value: presence flag, then `su(1+n)` when non-zero.
    pub fn put_delta_q(&mut self, delta: i8) {
        if delta != 0 {
            self.put_bit(true);
            self.put_su(delta as i32, 6);
        } else {
            self.put_bit(false);
        }
    }

    /// Variable length unsigned code (`uvlc()`).
    pub fn put_uvlc(&mut self, value: u32) {
        let code = value as u64 + 1;
        let num_bits = 64 - code.leading_zeros() as u8;
        for _ in 0..num_bits - 1 {
            self.put_bit(false);
        }
        self.put_bits(code, num_bits);
    }

    /// Copies the first `num_bits` bits of `src` into this stream.
    pub fn put_bits_buffer(&mut self, src: &[u8], num_bits: u32) {
        let full_bytes = (num_bits / 8) as usize;
        if self.bit_position == 0 {
            self.data.extend_from_slice(&src[..full_bytes]);
        } else {
            for &byte in &src[..full_bytes] {
                self.put_bits(byte as u64, 8);
            }
        }
        let rest = (num_bits % 8) as u8;
        if rest > 0 {
            self.put_bits((src[full_bytes] >> (8 - rest)) as u64, rest);
        }
    }

    /// `trailing_bits()`: a one bit, then zeros up to the byte boundary.
    pub fn put_trailing_bits(&mut self) {
        self.put_bit(true);
        self.byte_align();
    }

    /// Pads with zero bits up to the next byte boundary.
    pub fn byte_align(&mut self) {
        if self.bit_position != 0 {
            let pad = 8 - self.bit_position;
            self.put_bits(0, pad);
        }
    }

    /// Writes `value` as LEB128.
    ///
    /// With `fixed_len` the value is padded to exactly that many bytes so it
    /// can be patched in place later.
    pub fn put_leb128(&mut self, value: u64, fixed_len: Option<usize>) -> Result<usize> {
        let mut buf = [0u8; MAX_LEB128_BYTES];
        let len = encode_leb128(value, fixed_len, &mut buf)?;
        for &byte in &buf[..len] {
            self.put_bits(byte as u64, 8);
        }
        Ok(len)
    }

    pub fn bit_offset(&self) -> u32 {
        self.data.len() as u32 * 8 + self.bit_position as u32
    }

    pub fn byte_offset(&self) -> usize {
        self.data.len()
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bit_position == 0
    }

    /// Flushes a partial byte (left-aligned) and returns the buffer.
    pub fn finish(mut self) -> Vec<u8> {
        if self.bit_position != 0 {
            self.current_byte <<= 8 - self.bit_position;
            self.data.push(self.current_byte);
        }
        self.data
    }
}

/// Number of bytes the shortest LEB128 encoding of `value` needs.
pub fn leb128_size(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Encodes `value` as LEB128 into `out`, returning the number of bytes written.
pub fn encode_leb128(value: u64, fixed_len: Option<usize>, out: &mut [u8]) -> Result<usize> {
    let min_len = leb128_size(value);
    let len = match fixed_len {
        Some(n) if n < min_len || n > MAX_LEB128_BYTES => {
            return Err(EncodeError::BufferTooSmall {
                needed: min_len,
                available: n,
            })
        }
        Some(n) => n,
        None => min_len,
    };
    if out.len() < len {
        return Err(EncodeError::BufferTooSmall {
            needed: len,
            available: out.len(),
        });
    }
    let mut v = value;
    for (i, byte) in out[..len].iter_mut().enumerate() {
        *byte = (v & 0x7f) as u8;
        v >>= 7;
        if i + 1 < len {
            *byte |= 0x80;
        }
    }
    Ok(len)
}

/// Decodes a LEB128 value, returning `(value, bytes_consumed)`.
pub fn decode_leb128(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().take(MAX_LEB128_BYTES).enumerate() {
        value |= ((byte & 0x7f) as u64) << (i * 7);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_bits_single_byte() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0b10101010, 8);
        assert_eq!(writer.finish(), vec![0b10101010]);
    }

    #[test]
    fn test_put_bits_across_bytes() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0b1111, 4);
        writer.put_bits(0b00001111, 8);
        assert_eq!(writer.finish(), vec![0b11110000, 0b11110000]);
    }

    #[test]
    fn test_put_bits_zero_width() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0, 0);
        assert_eq!(writer.bit_offset(), 0);
        assert_eq!(writer.finish(), Vec::<u8>::new());
    }

    #[test]
    fn test_put_su() {
        // -1 in su(1+6) is 1111111
        let mut writer = BitstreamWriter::new();
        writer.put_su(-1, 6);
        writer.put_bit(false);
        assert_eq!(writer.finish(), vec![0xFE]);

        let mut writer = BitstreamWriter::new();
        writer.put_su(3, 6);
        writer.put_bit(false);
        assert_eq!(writer.finish(), vec![0b0000_0110]);
    }

    #[test]
    fn test_put_uvlc() {
        let mut writer = BitstreamWriter::new();
        writer.put_uvlc(0);
        assert_eq!(writer.bit_offset(), 1);
        writer.put_uvlc(2);
        // 1 | 011
        assert_eq!(writer.finish(), vec![0b1011_0000]);
    }

    #[test]
    fn test_trailing_bits_aligned() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0xFF, 8);
        writer.put_trailing_bits();
        assert_eq!(writer.finish(), vec![0xFF, 0x80]);
    }

    #[test]
    fn test_trailing_bits_unaligned() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0b111, 3);
        writer.put_trailing_bits();
        assert_eq!(writer.finish(), vec![0b11110000]);
    }

    #[test]
    fn test_byte_align_is_noop_when_aligned() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0xAB, 8);
        writer.byte_align();
        assert!(writer.is_byte_aligned());
        assert_eq!(writer.finish(), vec![0xAB]);
    }

    #[test]
    fn test_put_bits_buffer_unaligned() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0b1, 1);
        writer.put_bits_buffer(&[0xFF, 0b1010_0000], 11);
        assert_eq!(writer.bit_offset(), 12);
        assert_eq!(writer.finish(), vec![0xFF, 0b1101_0000]);
    }

    #[test]
    fn test_leb128_minimal() {
        let mut buf = [0u8; 8];
        assert_eq!(encode_leb128(0, None, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0);
        assert_eq!(encode_leb128(300, None, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[0xAC, 0x02]);
    }

    #[test]
    fn test_leb128_fixed_length() {
        let mut buf = [0u8; 8];
        assert_eq!(encode_leb128(5, Some(4), &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0x85, 0x80, 0x80, 0x00]);
        assert_eq!(decode_leb128(&buf[..4]), Some((5, 4)));
    }

    #[test]
    fn test_leb128_fixed_length_too_short() {
        let mut buf = [0u8; 8];
        assert!(encode_leb128(1 << 21, Some(2), &mut buf).is_err());
    }

    #[test]
    fn test_put_leb128_tracks_offsets() {
        let mut writer = BitstreamWriter::new();
        writer.put_bits(0x12, 8);
        let n = writer.put_leb128(128, None).unwrap();
        assert_eq!(n, 2);
        assert_eq!(writer.byte_offset(), 3);
        assert_eq!(writer.finish(), vec![0x12, 0x80, 0x01]);
    }
}
