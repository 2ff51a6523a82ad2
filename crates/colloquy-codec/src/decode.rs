//! Binary decoder.

use uuid::Uuid;

use crate::{CodecError, Result, LEADING_PADDING, MAX_LENGTH};

/// Reads typed values from a byte slice.
///
/// Every read validates bounds; hostile input resolves into a
/// [`CodecError`], never a panic or an unbounded allocation.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Compact decoder over a full buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Decoder over a padded frame; verifies and skips the padding prefix.
    pub fn with_leading_padding(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < LEADING_PADDING.len() {
            return Err(CodecError::UnexpectedEof(buf.len()));
        }
        if buf[..LEADING_PADDING.len()] != LEADING_PADDING {
            return Err(CodecError::InvalidPadding);
        }
        Ok(Self {
            buf,
            pos: LEADING_PADDING.len(),
        })
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the input is fully consumed.
    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Read one raw byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a boolean byte.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::InvalidTag(tag)),
        }
    }

    /// Read a fixed 4-byte big-endian int.
    pub fn read_int(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a zigzag LEB128 varint long.
    pub fn read_long(&mut self) -> Result<i64> {
        let mut zigzag: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            zigzag |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(CodecError::VarintOverflow);
            }
        }
        Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
    }

    /// Read a fixed 8-byte big-endian IEEE-754 double.
    pub fn read_double(&mut self) -> Result<f64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }

    /// Read an enum ordinal.
    pub fn read_enum(&mut self) -> Result<u8> {
        let value = self.read_long()?;
        u8::try_from(value).map_err(|_| CodecError::InvalidTag(0xff))
    }

    /// Read a length-prefixed byte slice.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_long()?;
        let length = usize::try_from(length).map_err(|_| CodecError::LengthOutOfRange(0))?;
        if length > MAX_LENGTH {
            return Err(CodecError::LengthOutOfRange(length));
        }
        Ok(self.take(length)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a UUID from 16 raw bytes.
    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }

    fn read_tag(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::InvalidTag(tag)),
        }
    }

    /// Read an optional long behind a tag byte.
    pub fn read_optional_long(&mut self) -> Result<Option<i64>> {
        if self.read_tag()? {
            Ok(Some(self.read_long()?))
        } else {
            Ok(None)
        }
    }

    /// Read an optional UUID behind a tag byte.
    pub fn read_optional_uuid(&mut self) -> Result<Option<Uuid>> {
        if self.read_tag()? {
            Ok(Some(self.read_uuid()?))
        } else {
            Ok(None)
        }
    }

    /// Read an optional string behind a tag byte.
    pub fn read_optional_string(&mut self) -> Result<Option<String>> {
        if self.read_tag()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    /// Read an optional byte slice behind a tag byte.
    pub fn read_optional_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_tag()? {
            Ok(Some(self.read_bytes()?))
        } else {
            Ok(None)
        }
    }

    /// Read a schema header: `schema_id(16) | schema_version(varint)`.
    pub fn read_schema(&mut self) -> Result<(Uuid, i32)> {
        let schema_id = self.read_uuid()?;
        let version = self.read_long()?;
        let version = i32::try_from(version).map_err(|_| CodecError::VarintOverflow)?;
        Ok((schema_id, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Encoder;

    #[test]
    fn test_long_roundtrip_boundaries() {
        let values = [
            0i64,
            1,
            -1,
            63,
            64,
            -64,
            -65,
            127,
            128,
            i64::from(i32::MAX),
            i64::from(i32::MIN),
            i64::MAX,
            i64::MIN,
        ];
        for value in values {
            let mut encoder = Encoder::new();
            encoder.write_long(value);
            let bytes = encoder.into_bytes();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_long().expect("long"), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn test_varint_overflow_rejected() {
        let bytes = [0xffu8; 11];
        let mut decoder = Decoder::new(&bytes);
        assert!(matches!(
            decoder.read_long(),
            Err(CodecError::VarintOverflow)
        ));
    }

    #[test]
    fn test_bad_optional_tag_rejected() {
        let bytes = [7u8];
        let mut decoder = Decoder::new(&bytes);
        assert!(matches!(
            decoder.read_optional_long(),
            Err(CodecError::InvalidTag(7))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_long((MAX_LENGTH + 1) as i64);
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        assert!(matches!(
            decoder.read_bytes(),
            Err(CodecError::LengthOutOfRange(_))
        ));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_long(-5);
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        assert!(decoder.read_bytes().is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&[0xff, 0xfe]);
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        assert!(matches!(
            decoder.read_string(),
            Err(CodecError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_schema_header_roundtrip() {
        let schema_id = Uuid::new_v4();
        let mut encoder = Encoder::new();
        encoder.write_schema(&schema_id, 3);
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_schema().expect("schema"), (schema_id, 3));
    }
}
