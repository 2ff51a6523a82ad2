//! # colloquy-codec
//!
//! The typed binary format shared by the wire protocol and the database
//! content blobs.
//!
//! ## Framing
//!
//! - longs: zigzag LEB128 varints (1–10 bytes)
//! - ints: fixed 4-byte big-endian
//! - doubles: fixed 8-byte big-endian IEEE-754
//! - strings / byte slices: varint length prefix, then raw bytes
//! - UUIDs: 16 raw bytes
//! - optionals: a leading tag byte, `0` absent / `1` present
//! - enums: varint ordinal
//! - schema headers: `schema_id(16) | schema_version(varint)`
//!
//! Two encoder flavors exist: one with a leading padding prefix required by
//! some transport framings ([`Encoder::with_leading_padding`]) and a compact
//! form for in-database storage ([`Encoder::new`]).

mod decode;
mod encode;

pub use decode::Decoder;
pub use encode::Encoder;

/// Padding prefix emitted before the schema header on padded frames.
pub const LEADING_PADDING: [u8; 4] = [0; 4];

/// Upper bound on any length-prefixed field, to bound allocations when
/// decoding hostile input.
pub const MAX_LENGTH: usize = 16 * 1024 * 1024;

/// Codec error types.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    #[error("invalid optional tag {0}")]
    InvalidTag(u8),

    #[error("varint longer than 10 bytes")]
    VarintOverflow,

    #[error("length {0} exceeds limit {MAX_LENGTH}")]
    LengthOutOfRange(usize),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("invalid leading padding")]
    InvalidPadding,

    #[error("unknown schema {schema_id} version {version}")]
    UnknownSchema {
        schema_id: uuid::Uuid,
        version: i32,
    },
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_compact_roundtrip_all_types() {
        let uuid = Uuid::new_v4();
        let mut encoder = Encoder::new();
        encoder.write_bool(true);
        encoder.write_int(-123_456);
        encoder.write_long(1_700_000_000_000);
        encoder.write_long(-1);
        encoder.write_double(48.8584);
        encoder.write_string("héllo");
        encoder.write_bytes(&[1, 2, 3]);
        encoder.write_uuid(&uuid);
        encoder.write_optional_long(None);
        encoder.write_optional_long(Some(42));

        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        assert!(decoder.read_bool().expect("bool"));
        assert_eq!(decoder.read_int().expect("int"), -123_456);
        assert_eq!(decoder.read_long().expect("long"), 1_700_000_000_000);
        assert_eq!(decoder.read_long().expect("long"), -1);
        assert_eq!(decoder.read_double().expect("double"), 48.8584);
        assert_eq!(decoder.read_string().expect("string"), "héllo");
        assert_eq!(decoder.read_bytes().expect("bytes"), vec![1, 2, 3]);
        assert_eq!(decoder.read_uuid().expect("uuid"), uuid);
        assert_eq!(decoder.read_optional_long().expect("opt"), None);
        assert_eq!(decoder.read_optional_long().expect("opt"), Some(42));
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_padded_roundtrip() {
        let schema_id = Uuid::new_v4();
        let mut encoder = Encoder::with_leading_padding();
        encoder.write_schema(&schema_id, 4);
        encoder.write_long(77);

        let bytes = encoder.into_bytes();
        assert_eq!(&bytes[..LEADING_PADDING.len()], &LEADING_PADDING);

        let mut decoder = Decoder::with_leading_padding(&bytes).expect("padding");
        let (id, version) = decoder.read_schema().expect("schema");
        assert_eq!(id, schema_id);
        assert_eq!(version, 4);
        assert_eq!(decoder.read_long().expect("long"), 77);
    }

    #[test]
    fn test_padding_rejected_when_nonzero() {
        let bytes = [1u8, 0, 0, 0, 5];
        assert!(matches!(
            Decoder::with_leading_padding(&bytes),
            Err(CodecError::InvalidPadding)
        ));
    }

    #[test]
    fn test_truncated_input() {
        let mut encoder = Encoder::new();
        encoder.write_string("truncate me");
        let bytes = encoder.into_bytes();

        let mut decoder = Decoder::new(&bytes[..bytes.len() - 3]);
        assert!(matches!(
            decoder.read_string(),
            Err(CodecError::UnexpectedEof(_))
        ));
    }
}
