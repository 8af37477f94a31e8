use crate::error::{Result, SyncError};
use bytes::Bytes;

/// Default writer capacity, sized to fit a single datagram comfortably.
pub const DEFAULT_CAPACITY: usize = 1200;

/// Packs values at bit granularity into a fixed-capacity buffer,
/// most-significant-bit-first within each byte.
///
/// The buffer never grows: a write that would exceed the capacity supplied
/// at construction fails with [`SyncError::BufferOverflow`] and leaves the
/// cursor where it was.
pub struct BitWriter {
    buffer: Vec<u8>,
    cursor: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buffer: vec![0u8; bytes],
            cursor: 0,
        }
    }

    pub fn bits_written(&self) -> usize {
        self.cursor
    }

    pub fn bytes_written(&self) -> usize {
        (self.cursor + 7) / 8
    }

    pub fn remaining_bits(&self) -> usize {
        self.buffer.len() * 8 - self.cursor
    }

    fn check_capacity(&self, bit_count: usize) -> Result<()> {
        let remaining = self.remaining_bits();
        if bit_count > remaining {
            return Err(SyncError::BufferOverflow {
                needed: bit_count,
                remaining,
            });
        }
        Ok(())
    }

    fn push_bit(&mut self, bit: bool) {
        if bit {
            self.buffer[self.cursor / 8] |= 1 << (7 - (self.cursor % 8));
        }
        self.cursor += 1;
    }

    /// Writes the low `bit_count` bits of `value`, high bit first.
    pub fn write_bits(&mut self, value: u32, bit_count: u32) -> Result<()> {
        if !(1..=32).contains(&bit_count) {
            return Err(SyncError::InvalidMessage(format!(
                "bit count {bit_count} outside 1..=32"
            )));
        }
        self.check_capacity(bit_count as usize)?;
        for i in (0..bit_count).rev() {
            self.push_bit((value >> i) & 1 != 0);
        }
        Ok(())
    }

    /// Two's-complement truncation to `bit_count` bits; round-trips exactly
    /// for any value representable in that width.
    pub fn write_signed_bits(&mut self, value: i32, bit_count: u32) -> Result<()> {
        let mask = if bit_count >= 32 {
            u32::MAX
        } else {
            (1u32 << bit_count) - 1
        };
        self.write_bits(value as u32 & mask, bit_count)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_bits(value as u32, 1)
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.write_bits(value as u32, 8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bits(value as u32, 16)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bits(value, 32)
    }

    /// IEEE-754 bits written verbatim as 4 bytes.
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_bits(value.to_bits(), 32)
    }

    /// Freezes the written span; the trailing partial byte stays zero-padded.
    pub fn finish(mut self) -> Bytes {
        self.buffer.truncate(self.bytes_written());
        Bytes::from(self.buffer)
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirror of [`BitWriter`] over a received byte span.
pub struct BitReader<'a> {
    buffer: &'a [u8],
    cursor: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, cursor: 0 }
    }

    pub fn bits_read(&self) -> usize {
        self.cursor
    }

    pub fn remaining_bits(&self) -> usize {
        self.buffer.len() * 8 - self.cursor
    }

    /// True once the cursor has consumed the entire supplied span.
    pub fn is_at_end(&self) -> bool {
        self.cursor >= self.buffer.len() * 8
    }

    fn pull_bit(&mut self) -> bool {
        let bit = self.buffer[self.cursor / 8] >> (7 - (self.cursor % 8)) & 1 != 0;
        self.cursor += 1;
        bit
    }

    pub fn read_bits(&mut self, bit_count: u32) -> Result<u32> {
        if !(1..=32).contains(&bit_count) {
            return Err(SyncError::InvalidMessage(format!(
                "bit count {bit_count} outside 1..=32"
            )));
        }
        if (bit_count as usize) > self.remaining_bits() {
            return Err(SyncError::TruncatedMessage);
        }
        let mut value = 0u32;
        for _ in 0..bit_count {
            value = (value << 1) | self.pull_bit() as u32;
        }
        Ok(value)
    }

    pub fn read_signed_bits(&mut self, bit_count: u32) -> Result<i32> {
        let raw = self.read_bits(bit_count)?;
        if bit_count < 32 && raw >> (bit_count - 1) & 1 != 0 {
            // sign-extend
            Ok((raw | (u32::MAX << bit_count)) as i32)
        } else {
            Ok(raw as i32)
        }
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_bits(32)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_bits(32)?))
    }

    /// Reads the byte at the current cursor without advancing, so a
    /// dispatcher can branch before committing to a decode routine.
    pub fn peek_byte(&self) -> Result<u8> {
        if self.remaining_bits() < 8 {
            return Err(SyncError::TruncatedMessage);
        }
        let mut lookahead = Self {
            buffer: self.buffer,
            cursor: self.cursor,
        };
        lookahead.read_byte()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_round_trip() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3).unwrap();
        writer.write_bits(0xDEAD, 16).unwrap();
        writer.write_bits(u32::MAX, 32).unwrap();

        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);

        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(16).unwrap(), 0xDEAD);
        assert_eq!(reader.read_bits(32).unwrap(), u32::MAX);
    }

    #[test]
    fn test_signed_round_trip_all_widths() {
        for bit_count in 1..=32u32 {
            let max = if bit_count == 32 {
                i32::MAX
            } else {
                (1i64 << (bit_count - 1)) as i32 - 1
            };
            let min = if bit_count == 32 {
                i32::MIN
            } else {
                -(1i64 << (bit_count - 1)) as i32
            };

            for value in [min, -1, 0, max] {
                if value < min || value > max {
                    continue;
                }
                let mut writer = BitWriter::new();
                writer.write_signed_bits(value, bit_count).unwrap();
                let bytes = writer.finish();
                let mut reader = BitReader::new(&bytes);
                assert_eq!(
                    reader.read_signed_bits(bit_count).unwrap(),
                    value,
                    "width {bit_count}"
                );
            }
        }
    }

    #[test]
    fn test_signed_sixteen_bit_extremes() {
        let mut writer = BitWriter::new();
        writer.write_signed_bits(-1, 16).unwrap();
        writer.write_signed_bits(32767, 16).unwrap();
        writer.write_signed_bits(-32768, 16).unwrap();

        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_signed_bits(16).unwrap(), -1);
        assert_eq!(reader.read_signed_bits(16).unwrap(), 32767);
        assert_eq!(reader.read_signed_bits(16).unwrap(), -32768);
    }

    #[test]
    fn test_convenience_wrappers() {
        let mut writer = BitWriter::new();
        writer.write_bool(true).unwrap();
        writer.write_byte(0xAB).unwrap();
        writer.write_u16(65535).unwrap();
        writer.write_u32(123_456_789).unwrap();
        writer.write_f32(3.25).unwrap();

        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_byte().unwrap(), 0xAB);
        assert_eq!(reader.read_u16().unwrap(), 65535);
        assert_eq!(reader.read_u32().unwrap(), 123_456_789);
        assert_eq!(reader.read_f32().unwrap(), 3.25);
    }

    #[test]
    fn test_overflow_rejected() {
        let mut writer = BitWriter::with_capacity(1);
        writer.write_bits(0xF, 4).unwrap();
        let err = writer.write_byte(0xFF).unwrap_err();
        assert!(matches!(
            err,
            SyncError::BufferOverflow {
                needed: 8,
                remaining: 4
            }
        ));
        // failed write must not advance the cursor
        assert_eq!(writer.bits_written(), 4);
    }

    #[test]
    fn test_out_of_range_bit_count_rejected() {
        let mut writer = BitWriter::new();
        assert!(matches!(
            writer.write_bits(1, 0).unwrap_err(),
            SyncError::InvalidMessage(_)
        ));
        assert!(matches!(
            writer.write_bits(1, 33).unwrap_err(),
            SyncError::InvalidMessage(_)
        ));
        assert!(matches!(
            writer.write_signed_bits(-1, 40).unwrap_err(),
            SyncError::InvalidMessage(_)
        ));
        assert_eq!(writer.bits_written(), 0);

        writer.write_byte(0xAA).unwrap();
        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);
        assert!(matches!(
            reader.read_bits(0).unwrap_err(),
            SyncError::InvalidMessage(_)
        ));
        assert!(matches!(
            reader.read_bits(33).unwrap_err(),
            SyncError::InvalidMessage(_)
        ));
        assert!(matches!(
            reader.read_signed_bits(64).unwrap_err(),
            SyncError::InvalidMessage(_)
        ));
        assert_eq!(reader.bits_read(), 0);
    }

    #[test]
    fn test_truncated_read() {
        let mut writer = BitWriter::new();
        writer.write_byte(0x42).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_byte().unwrap(), 0x42);
        assert!(matches!(
            reader.read_u16().unwrap_err(),
            SyncError::TruncatedMessage
        ));
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut writer = BitWriter::new();
        writer.write_byte(0x12).unwrap();
        writer.write_byte(0x34).unwrap();
        let bytes = writer.finish();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.peek_byte().unwrap(), 0x12);
        assert_eq!(reader.peek_byte().unwrap(), 0x12);
        assert_eq!(reader.read_byte().unwrap(), 0x12);
        assert_eq!(reader.read_byte().unwrap(), 0x34);
    }

    #[test]
    fn test_partial_byte_zero_padded() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b11, 2).unwrap();
        let bytes = writer.finish();
        assert_eq!(bytes.len(), 1);
        assert_eq!(bytes[0], 0b1100_0000);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(2).unwrap(), 0b11);
        assert!(!reader.is_at_end());
        // the pad bits after the logical end read back as zero
        assert_eq!(reader.read_bits(6).unwrap(), 0);
        assert!(reader.is_at_end());
    }
}
