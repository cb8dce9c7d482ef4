//! Binary wire codec: variable-length integers, zig-zag mapping and the
//! reader/writer pair every packet is built on.
//!
//! Unsigned integers are split into 7-bit groups, least-significant group
//! first, with the high bit of each byte set while more groups follow.
//! Signed integers are zig-zag mapped to unsigned first so small-magnitude
//! deltas stay small regardless of sign, then encoded the same way.

use crate::math::{Quat, Vec3};
use thiserror::Error;

/// Errors raised while decoding a packet body.
///
/// Any of these is a protocol violation: the peer that produced the bytes is
/// disconnected, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("byte stream exhausted mid-field")]
    UnexpectedEof,
    #[error("variable-length integer exceeds {0}-bit width")]
    VarintOverflow(u32),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("value {0} is not a valid enumeration discriminant")]
    InvalidEnumValue(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Maps a signed 64-bit value to unsigned so that values of small magnitude
/// encode to small unsigned values: 0 → 0, -1 → 1, 1 → 2, -2 → 3, ...
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Prepends the 4-byte little-endian length prefix that frames a packet body
/// on the stream transport.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(body);
    framed
}

/// Append-only byte buffer used to serialize packet fields in declaration
/// order.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_var_u64(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;

            let remaining = value > 0;
            if remaining {
                byte |= 0x80;
            }

            self.buf.push(byte);

            if !remaining {
                break;
            }
        }
    }

    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(u64::from(value));
    }

    pub fn write_var_u16(&mut self, value: u16) {
        self.write_var_u64(u64::from(value));
    }

    pub fn write_var_i64(&mut self, value: i64) {
        self.write_var_u64(zigzag_encode(value));
    }

    pub fn write_var_i32(&mut self, value: i32) {
        self.write_var_i64(i64::from(value));
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_var_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    pub fn write_quat(&mut self, value: Quat) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
        self.write_f32(value.w);
    }
}

/// Cursor over a received packet body, decoding fields in declaration order.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, FormatError> {
        let byte = *self.data.get(self.pos).ok_or(FormatError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_f32(&mut self) -> Result<f32, FormatError> {
        if self.remaining() < 4 {
            return Err(FormatError::UnexpectedEof);
        }

        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    /// Decodes an unsigned varint that must fit in `bits` bits.
    fn read_var(&mut self, bits: u32) -> Result<u64, FormatError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;

        loop {
            let byte = self.read_u8()?;
            let group = u64::from(byte & 0x7F);

            if shift >= bits || (group != 0 && shift + 7 > bits && group >> (bits - shift) != 0) {
                return Err(FormatError::VarintOverflow(bits));
            }

            value |= group << shift;
            shift += 7;

            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    pub fn read_var_u64(&mut self) -> Result<u64, FormatError> {
        self.read_var(64)
    }

    pub fn read_var_u32(&mut self) -> Result<u32, FormatError> {
        Ok(self.read_var(32)? as u32)
    }

    pub fn read_var_u16(&mut self) -> Result<u16, FormatError> {
        Ok(self.read_var(16)? as u16)
    }

    pub fn read_var_i64(&mut self) -> Result<i64, FormatError> {
        Ok(zigzag_decode(self.read_var_u64()?))
    }

    pub fn read_var_i32(&mut self) -> Result<i32, FormatError> {
        let wide = self.read_var_i64()?;
        i32::try_from(wide).map_err(|_| FormatError::VarintOverflow(32))
    }

    pub fn read_string(&mut self) -> Result<String, FormatError> {
        let len = self.read_var_u32()? as usize;
        if self.remaining() < len {
            return Err(FormatError::UnexpectedEof);
        }

        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;

        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8)
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, FormatError> {
        Ok(Vec3 {
            x: self.read_f32()?,
            y: self.read_f32()?,
            z: self.read_f32()?,
        })
    }

    pub fn read_quat(&mut self) -> Result<Quat, FormatError> {
        Ok(Quat {
            x: self.read_f32()?,
            y: self.read_f32()?,
            z: self.read_f32()?,
            w: self.read_f32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_u64(value: u64) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.write_var_u64(value);
        writer.into_bytes()
    }

    #[test]
    fn test_zigzag_roundtrip() {
        for value in [0i64, -1, 1, -2, 2, 63, -64, i64::MAX, i64::MIN, 123456, -123456] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn test_zigzag_small_magnitudes_stay_small() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_encode(2), 4);
    }

    #[test]
    fn test_varint_zero_is_one_byte() {
        assert_eq!(encode_u64(0), vec![0]);
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(encode_u64(1), vec![0x01]);
        assert_eq!(encode_u64(127), vec![0x7F]);
        assert_eq!(encode_u64(128), vec![0x80, 0x01]);
        assert_eq!(encode_u64(300), vec![0xAC, 0x02]);
    }

    #[test]
    fn test_varint_length_monotone_in_magnitude() {
        let mut previous_len = 0;
        for shift in 0..63 {
            let len = encode_u64(1u64 << shift).len();
            assert!(len >= previous_len);
            previous_len = len;
        }
    }

    #[test]
    fn test_signed_varint_length_monotone_in_abs() {
        let mut writer_len = |v: i64| {
            let mut writer = PacketWriter::new();
            writer.write_var_i64(v);
            writer.into_bytes().len()
        };

        for shift in 0..62 {
            let magnitude = 1i64 << shift;
            assert_eq!(writer_len(magnitude), writer_len(-magnitude));
            assert!(writer_len(magnitude) <= writer_len(magnitude << 1));
        }
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let bytes = encode_u64(value);
            let mut reader = PacketReader::new(&bytes);
            assert_eq!(reader.read_var_u64().unwrap(), value);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_varint_u32_overflow_detected() {
        // u64::MAX fits in 64 bits but not 32.
        let bytes = encode_u64(u64::MAX);
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_var_u32(), Err(FormatError::VarintOverflow(32)));

        // One past u32::MAX.
        let bytes = encode_u64(u64::from(u32::MAX) + 1);
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_var_u32(), Err(FormatError::VarintOverflow(32)));

        // Exactly u32::MAX still fits.
        let bytes = encode_u64(u64::from(u32::MAX));
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_var_u32(), Ok(u32::MAX));
    }

    #[test]
    fn test_varint_truncated_stream() {
        // Continuation bit set but no following byte.
        let mut reader = PacketReader::new(&[0x80]);
        assert_eq!(reader.read_var_u64(), Err(FormatError::UnexpectedEof));
    }

    #[test]
    fn test_string_roundtrip() {
        let mut writer = PacketWriter::new();
        writer.write_string("spaceship/hull.obj");
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "spaceship/hull.obj");
    }

    #[test]
    fn test_string_truncated_payload() {
        let mut writer = PacketWriter::new();
        writer.write_string("hello");
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes[..bytes.len() - 1]);
        assert_eq!(reader.read_string(), Err(FormatError::UnexpectedEof));
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut bytes = Vec::new();
        bytes.push(2); // length
        bytes.extend_from_slice(&[0xFF, 0xFE]);

        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_string(), Err(FormatError::InvalidUtf8));
    }

    #[test]
    fn test_frame_prefix() {
        let framed = frame(&[1, 2, 3]);
        assert_eq!(framed, vec![3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_vec3_quat_roundtrip() {
        let mut writer = PacketWriter::new();
        writer.write_vec3(Vec3::new(1.0, -2.5, 3.25));
        writer.write_quat(Quat::IDENTITY);
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        let v = reader.read_vec3().unwrap();
        let q = reader.read_quat().unwrap();
        assert_eq!(v, Vec3::new(1.0, -2.5, 3.25));
        assert_eq!(q, Quat::IDENTITY);
        assert_eq!(reader.remaining(), 0);
    }
}
