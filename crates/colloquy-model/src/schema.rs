//! Descriptor schema registry.
//!
//! One schema id per variant; the schema version selects the envelope
//! generation. All decode dispatch goes through [`decode_descriptor`] so
//! that unknown `(schema_id, version)` pairs are dropped in exactly one
//! place.

use colloquy_codec::{Decoder, Result};
use uuid::Uuid;

use crate::descriptor::Descriptor;

/// Envelope generation without expiration/addressing extensions.
pub const ENVELOPE_VERSION_3: i32 = 3;

/// Current envelope generation.
pub const ENVELOPE_VERSION_4: i32 = 4;

/// Schema id of text-message descriptors.
pub const OBJECT_SCHEMA_ID: Uuid = Uuid::from_u128(0x8faf_1761_5a83_4bcd_9b6a_01c7_b1f0_6ae3);
/// Schema id of raw-file descriptors.
pub const FILE_SCHEMA_ID: Uuid = Uuid::from_u128(0x2d5e_9a0c_7b14_4f7e_8a14_55d2_cc0e_91b7);
/// Schema id of image descriptors.
pub const IMAGE_SCHEMA_ID: Uuid = Uuid::from_u128(0xb3a7_42f9_0d66_49c2_b5c3_7e88_1fa0_d254);
/// Schema id of audio descriptors.
pub const AUDIO_SCHEMA_ID: Uuid = Uuid::from_u128(0x60c1_ed55_2b3a_4b90_9f02_d0b9_4a6f_e812);
/// Schema id of video descriptors.
pub const VIDEO_SCHEMA_ID: Uuid = Uuid::from_u128(0xe9f3_08d1_64c7_4a35_8dd0_3bb1_907c_5fa6);
/// Schema id of named-file descriptors.
pub const NAMED_FILE_SCHEMA_ID: Uuid = Uuid::from_u128(0x74b8_c6e2_f01d_4388_a6f9_2290_d85b_3c41);
/// Schema id of group-invitation descriptors.
pub const INVITATION_SCHEMA_ID: Uuid = Uuid::from_u128(0x1c99_b04a_3e72_45d6_bd6e_66a8_f23d_07c5);
/// Schema id of geolocation descriptors.
pub const GEOLOCATION_SCHEMA_ID: Uuid = Uuid::from_u128(0x5a20_7df8_91b5_4e03_9c77_48e6_0b1a_d9f2);
/// Schema id of twincode-card descriptors.
pub const TWINCODE_SCHEMA_ID: Uuid = Uuid::from_u128(0xcd14_36a9_88e0_4f5b_b021_9dce_75f4_1e88);
/// Schema id of call-record descriptors.
pub const CALL_SCHEMA_ID: Uuid = Uuid::from_u128(0x3f82_a1d7_c54e_4c19_84bb_e107_629a_fd30);
/// Schema id of clear-marker descriptors.
pub const CLEAR_SCHEMA_ID: Uuid = Uuid::from_u128(0x9e57_0fb3_16c8_4d62_a843_ba52_0c7e_46d9);

/// Whether an envelope generation is one we can decode.
pub fn is_known_version(version: i32) -> bool {
    version == ENVELOPE_VERSION_3 || version == ENVELOPE_VERSION_4
}

/// Decode a descriptor frame: schema header, envelope, variant payload.
///
/// Returns `Ok(None)` when the schema pair is unknown; the frame is
/// dropped by the caller.
pub fn decode_descriptor(decoder: &mut Decoder<'_>) -> Result<Option<Descriptor>> {
    let (schema_id, version) = decoder.read_schema()?;
    if !is_known_version(version) {
        return Ok(None);
    }
    Descriptor::decode_variant(decoder, schema_id, version)
}
