//! Descriptor variants.

use colloquy_codec::{Decoder, Encoder, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use colloquy_types::{
    DatabaseId, DescriptorId, DescriptorType, InvitationStatus, FLAG_COPY_ALLOWED,
    FLAG_HAS_THUMBNAIL,
};

use crate::envelope::Envelope;
use crate::schema::{
    is_known_version, AUDIO_SCHEMA_ID, CALL_SCHEMA_ID, CLEAR_SCHEMA_ID, ENVELOPE_VERSION_4,
    FILE_SCHEMA_ID, GEOLOCATION_SCHEMA_ID, IMAGE_SCHEMA_ID, INVITATION_SCHEMA_ID,
    NAMED_FILE_SCHEMA_ID, OBJECT_SCHEMA_ID, TWINCODE_SCHEMA_ID, VIDEO_SCHEMA_ID,
};

/// On-disk blob attributes shared by the file-bearing variants.
///
/// `path` is local to this device; the receiver rewrites it when the
/// incoming byte stream is materialized under its own files directory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path of the blob, relative to the application files directory.
    pub path: String,
    /// File extension without the dot, when known.
    pub extension: Option<String>,
    /// Total length of the blob in bytes.
    pub length: i64,
    /// Inline thumbnail bytes, when small enough to travel with the push.
    pub thumbnail: Option<Vec<u8>>,
}

impl FileInfo {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_string(&self.path);
        encoder.write_optional_string(self.extension.as_deref());
        encoder.write_long(self.length);
        encoder.write_optional_bytes(self.thumbnail.as_deref());
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            path: decoder.read_string()?,
            extension: decoder.read_optional_string()?,
            length: decoder.read_long()?,
            thumbnail: decoder.read_optional_bytes()?,
        })
    }
}

/// Text message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub envelope: Envelope,
    /// Message body.
    pub message: String,
}

/// File-bearing descriptor; covers the raw, image, audio, video and named
/// flavors, discriminated by [`DescriptorType`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub envelope: Envelope,
    /// Which file flavor this is (File, Image, Audio, Video, NamedFile).
    pub kind: DescriptorType,
    pub file: FileInfo,
    /// Pixel width (images, videos).
    pub width: i32,
    /// Pixel height (images, videos).
    pub height: i32,
    /// Duration in milliseconds (audio, video).
    pub duration_ms: i64,
    /// User-facing name (named files).
    pub name: String,
}

/// Group invitation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvitationDescriptor {
    pub envelope: Envelope,
    /// Display name of the group.
    pub group_name: String,
    /// The group twincode the join request must target.
    pub group_twincode: Uuid,
    /// Optional group public key material, base-form string.
    pub public_key: Option<String>,
    /// Twincode of the inviting member.
    pub inviter: Uuid,
    /// Twincode allocated for the invited member.
    pub member: Uuid,
    /// Invitation lifecycle status.
    pub status: InvitationStatus,
}

impl InvitationDescriptor {
    /// Whether the status may move to `next`.
    ///
    /// `Pending` answers to anything; `Accepted` may still complete into
    /// `Joined`; `Joined` and `Withdrawn` are terminal.
    pub fn can_transition(&self, next: InvitationStatus) -> bool {
        match self.status {
            InvitationStatus::Pending => next != InvitationStatus::Pending,
            InvitationStatus::Accepted => next == InvitationStatus::Joined,
            InvitationStatus::Joined | InvitationStatus::Withdrawn => false,
        }
    }
}

/// Geolocation share.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeolocationDescriptor {
    pub envelope: Envelope,
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude in meters; `0.0` when unknown.
    pub altitude: f64,
}

/// Twincode card share.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwincodeDescriptor {
    pub envelope: Envelope,
    /// The shared twincode outbound id.
    pub twincode_id: Uuid,
    /// Card display name.
    pub name: Option<String>,
    /// Card description.
    pub description: Option<String>,
}

/// Call record. Direction, video and missed state live in envelope flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub envelope: Envelope,
    /// Call duration in milliseconds; `0` for missed calls.
    pub duration_ms: i64,
}

/// Marker recording that history up to a point was cleared.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClearDescriptor {
    pub envelope: Envelope,
    /// Everything at or before this timestamp was cleared.
    pub cleared_timestamp: i64,
}

/// A single durable unit of exchanged content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Descriptor {
    Object(ObjectDescriptor),
    File(FileDescriptor),
    Invitation(InvitationDescriptor),
    Geolocation(GeolocationDescriptor),
    Twincode(TwincodeDescriptor),
    Call(CallDescriptor),
    Clear(ClearDescriptor),
}

impl Descriptor {
    /// Build a text message descriptor.
    pub fn object(id: DescriptorId, conversation_id: DatabaseId, now: i64, message: String) -> Self {
        Self::Object(ObjectDescriptor {
            envelope: Envelope::outgoing(id, conversation_id, now),
            message,
        })
    }

    /// Build a file-bearing descriptor of the given flavor.
    pub fn file(
        id: DescriptorId,
        conversation_id: DatabaseId,
        now: i64,
        kind: DescriptorType,
        file: FileInfo,
    ) -> Self {
        let mut envelope = Envelope::outgoing(id, conversation_id, now);
        envelope.set_flag(FLAG_HAS_THUMBNAIL, file.thumbnail.is_some());
        Self::File(FileDescriptor {
            envelope,
            kind,
            file,
            width: 0,
            height: 0,
            duration_ms: 0,
            name: String::new(),
        })
    }

    /// The shared envelope.
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Object(d) => &d.envelope,
            Self::File(d) => &d.envelope,
            Self::Invitation(d) => &d.envelope,
            Self::Geolocation(d) => &d.envelope,
            Self::Twincode(d) => &d.envelope,
            Self::Call(d) => &d.envelope,
            Self::Clear(d) => &d.envelope,
        }
    }

    /// The shared envelope, mutable.
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        match self {
            Self::Object(d) => &mut d.envelope,
            Self::File(d) => &mut d.envelope,
            Self::Invitation(d) => &mut d.envelope,
            Self::Geolocation(d) => &mut d.envelope,
            Self::Twincode(d) => &mut d.envelope,
            Self::Call(d) => &mut d.envelope,
            Self::Clear(d) => &mut d.envelope,
        }
    }

    /// Descriptor identity.
    pub fn id(&self) -> DescriptorId {
        self.envelope().id
    }

    /// The persisted type code.
    pub fn descriptor_type(&self) -> DescriptorType {
        match self {
            Self::Object(_) => DescriptorType::Object,
            Self::File(d) => d.kind,
            Self::Invitation(_) => DescriptorType::Invitation,
            Self::Geolocation(_) => DescriptorType::Geolocation,
            Self::Twincode(_) => DescriptorType::Twincode,
            Self::Call(_) => DescriptorType::Call,
            Self::Clear(_) => DescriptorType::Clear,
        }
    }

    /// The schema id owning this variant's wire form.
    pub fn schema_id(&self) -> Uuid {
        match self {
            Self::Object(_) => OBJECT_SCHEMA_ID,
            Self::File(d) => match d.kind {
                DescriptorType::Image => IMAGE_SCHEMA_ID,
                DescriptorType::Audio => AUDIO_SCHEMA_ID,
                DescriptorType::Video => VIDEO_SCHEMA_ID,
                DescriptorType::NamedFile => NAMED_FILE_SCHEMA_ID,
                _ => FILE_SCHEMA_ID,
            },
            Self::Invitation(_) => INVITATION_SCHEMA_ID,
            Self::Geolocation(_) => GEOLOCATION_SCHEMA_ID,
            Self::Twincode(_) => TWINCODE_SCHEMA_ID,
            Self::Call(_) => CALL_SCHEMA_ID,
            Self::Clear(_) => CLEAR_SCHEMA_ID,
        }
    }

    /// File attributes, for the file-bearing variants.
    pub fn file_info(&self) -> Option<&FileInfo> {
        match self {
            Self::File(d) => Some(&d.file),
            _ => None,
        }
    }

    /// File attributes, mutable.
    pub fn file_info_mut(&mut self) -> Option<&mut FileInfo> {
        match self {
            Self::File(d) => Some(&mut d.file),
            _ => None,
        }
    }

    /// Whether this descriptor has expired at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.envelope().is_expired(now)
    }

    /// Whether the variant can be forwarded into another conversation.
    ///
    /// Invitations are bound to their group; call records and clear
    /// markers have no content to carry.
    pub fn can_forward(&self) -> bool {
        !matches!(
            self,
            Self::Invitation(_) | Self::Call(_) | Self::Clear(_)
        )
    }

    /// Clone the payload into a fresh descriptor for another conversation.
    ///
    /// Returns `None` for variants that cannot be forwarded.
    pub fn create_forward(
        &self,
        new_id: DescriptorId,
        new_conversation_id: DatabaseId,
        now: i64,
        expire_timeout: i64,
        send_to: Option<Uuid>,
        copy_allowed: bool,
    ) -> Option<Descriptor> {
        if !self.can_forward() {
            return None;
        }
        let mut envelope = Envelope::outgoing(new_id, new_conversation_id, now);
        envelope.expire_timeout = expire_timeout;
        envelope.send_to = send_to;
        envelope.set_flag(FLAG_COPY_ALLOWED, copy_allowed);

        Some(match self {
            Self::Object(d) => Self::Object(ObjectDescriptor {
                envelope,
                message: d.message.clone(),
            }),
            Self::File(d) => {
                envelope.set_flag(FLAG_HAS_THUMBNAIL, d.file.thumbnail.is_some());
                Self::File(FileDescriptor {
                    envelope,
                    kind: d.kind,
                    file: d.file.clone(),
                    width: d.width,
                    height: d.height,
                    duration_ms: d.duration_ms,
                    name: d.name.clone(),
                })
            }
            Self::Geolocation(d) => Self::Geolocation(GeolocationDescriptor {
                envelope,
                latitude: d.latitude,
                longitude: d.longitude,
                altitude: d.altitude,
            }),
            Self::Twincode(d) => Self::Twincode(TwincodeDescriptor {
                envelope,
                twincode_id: d.twincode_id,
                name: d.name.clone(),
                description: d.description.clone(),
            }),
            Self::Invitation(_) | Self::Call(_) | Self::Clear(_) => return None,
        })
    }

    /// Encode the wire frame: schema header, envelope, variant payload.
    pub fn encode(&self, encoder: &mut Encoder, version: i32) {
        encoder.write_schema(&self.schema_id(), version);
        self.envelope().encode(encoder, version);
        self.encode_payload(encoder);
    }

    /// Encode the storage frame: schema header and payload only. The
    /// envelope is persisted in table columns, not in the content blob.
    pub fn encode_stored(&self, encoder: &mut Encoder) {
        encoder.write_schema(&self.schema_id(), ENVELOPE_VERSION_4);
        self.encode_payload(encoder);
    }

    fn encode_payload(&self, encoder: &mut Encoder) {
        match self {
            Self::Object(d) => encoder.write_string(&d.message),
            Self::File(d) => {
                d.file.encode(encoder);
                match d.kind {
                    DescriptorType::Image => {
                        encoder.write_int(d.width);
                        encoder.write_int(d.height);
                    }
                    DescriptorType::Audio => encoder.write_long(d.duration_ms),
                    DescriptorType::Video => {
                        encoder.write_int(d.width);
                        encoder.write_int(d.height);
                        encoder.write_long(d.duration_ms);
                    }
                    DescriptorType::NamedFile => encoder.write_string(&d.name),
                    _ => {}
                }
            }
            Self::Invitation(d) => {
                encoder.write_string(&d.group_name);
                encoder.write_uuid(&d.group_twincode);
                encoder.write_optional_string(d.public_key.as_deref());
                encoder.write_uuid(&d.inviter);
                encoder.write_uuid(&d.member);
                encoder.write_enum(d.status.code());
            }
            Self::Geolocation(d) => {
                encoder.write_double(d.latitude);
                encoder.write_double(d.longitude);
                encoder.write_double(d.altitude);
            }
            Self::Twincode(d) => {
                encoder.write_uuid(&d.twincode_id);
                encoder.write_optional_string(d.name.as_deref());
                encoder.write_optional_string(d.description.as_deref());
            }
            Self::Call(d) => encoder.write_long(d.duration_ms),
            Self::Clear(d) => encoder.write_long(d.cleared_timestamp),
        }
    }

    /// Decode a wire frame body after the schema header was read.
    ///
    /// Returns `Ok(None)` for schema ids this revision does not know.
    pub fn decode_variant(
        decoder: &mut Decoder<'_>,
        schema_id: Uuid,
        version: i32,
    ) -> Result<Option<Descriptor>> {
        let envelope = Envelope::decode(decoder, version)?;
        Self::decode_payload(decoder, schema_id, envelope)
    }

    /// Decode a storage frame against an envelope hydrated from columns.
    pub fn decode_stored(
        decoder: &mut Decoder<'_>,
        envelope: Envelope,
    ) -> Result<Option<Descriptor>> {
        let (schema_id, version) = decoder.read_schema()?;
        if !is_known_version(version) {
            return Ok(None);
        }
        Self::decode_payload(decoder, schema_id, envelope)
    }

    fn decode_payload(
        decoder: &mut Decoder<'_>,
        schema_id: Uuid,
        envelope: Envelope,
    ) -> Result<Option<Descriptor>> {
        let descriptor = match schema_id {
            id if id == OBJECT_SCHEMA_ID => Self::Object(ObjectDescriptor {
                envelope,
                message: decoder.read_string()?,
            }),
            id if id == FILE_SCHEMA_ID => Self::File(FileDescriptor {
                envelope,
                kind: DescriptorType::File,
                file: FileInfo::decode(decoder)?,
                width: 0,
                height: 0,
                duration_ms: 0,
                name: String::new(),
            }),
            id if id == IMAGE_SCHEMA_ID => {
                let file = FileInfo::decode(decoder)?;
                let width = decoder.read_int()?;
                let height = decoder.read_int()?;
                Self::File(FileDescriptor {
                    envelope,
                    kind: DescriptorType::Image,
                    file,
                    width,
                    height,
                    duration_ms: 0,
                    name: String::new(),
                })
            }
            id if id == AUDIO_SCHEMA_ID => {
                let file = FileInfo::decode(decoder)?;
                let duration_ms = decoder.read_long()?;
                Self::File(FileDescriptor {
                    envelope,
                    kind: DescriptorType::Audio,
                    file,
                    width: 0,
                    height: 0,
                    duration_ms,
                    name: String::new(),
                })
            }
            id if id == VIDEO_SCHEMA_ID => {
                let file = FileInfo::decode(decoder)?;
                let width = decoder.read_int()?;
                let height = decoder.read_int()?;
                let duration_ms = decoder.read_long()?;
                Self::File(FileDescriptor {
                    envelope,
                    kind: DescriptorType::Video,
                    file,
                    width,
                    height,
                    duration_ms,
                    name: String::new(),
                })
            }
            id if id == NAMED_FILE_SCHEMA_ID => {
                let file = FileInfo::decode(decoder)?;
                let name = decoder.read_string()?;
                Self::File(FileDescriptor {
                    envelope,
                    kind: DescriptorType::NamedFile,
                    file,
                    width: 0,
                    height: 0,
                    duration_ms: 0,
                    name,
                })
            }
            id if id == INVITATION_SCHEMA_ID => {
                let group_name = decoder.read_string()?;
                let group_twincode = decoder.read_uuid()?;
                let public_key = decoder.read_optional_string()?;
                let inviter = decoder.read_uuid()?;
                let member = decoder.read_uuid()?;
                let status_code = decoder.read_enum()?;
                let status = match InvitationStatus::from_code(status_code) {
                    Some(status) => status,
                    None => return Ok(None),
                };
                Self::Invitation(InvitationDescriptor {
                    envelope,
                    group_name,
                    group_twincode,
                    public_key,
                    inviter,
                    member,
                    status,
                })
            }
            id if id == GEOLOCATION_SCHEMA_ID => Self::Geolocation(GeolocationDescriptor {
                envelope,
                latitude: decoder.read_double()?,
                longitude: decoder.read_double()?,
                altitude: decoder.read_double()?,
            }),
            id if id == TWINCODE_SCHEMA_ID => Self::Twincode(TwincodeDescriptor {
                envelope,
                twincode_id: decoder.read_uuid()?,
                name: decoder.read_optional_string()?,
                description: decoder.read_optional_string()?,
            }),
            id if id == CALL_SCHEMA_ID => Self::Call(CallDescriptor {
                envelope,
                duration_ms: decoder.read_long()?,
            }),
            id if id == CLEAR_SCHEMA_ID => Self::Clear(ClearDescriptor {
                envelope,
                cleared_timestamp: decoder.read_long()?,
            }),
            _ => return Ok(None),
        };
        Ok(Some(descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{decode_descriptor, ENVELOPE_VERSION_3, ENVELOPE_VERSION_4};

    fn sample_id() -> DescriptorId {
        DescriptorId::new(3, Uuid::new_v4(), 11)
    }

    fn roundtrip(descriptor: &Descriptor, version: i32) -> Descriptor {
        let mut encoder = Encoder::new();
        descriptor.encode(&mut encoder, version);
        let bytes = encoder.into_bytes();
        let mut decoder = Decoder::new(&bytes);
        decode_descriptor(&mut decoder)
            .expect("decode")
            .expect("known schema")
    }

    #[test]
    fn test_object_roundtrip() {
        let descriptor = Descriptor::object(sample_id(), 1, 1_700_000_000_000, "hi".into());
        let decoded = roundtrip(&descriptor, ENVELOPE_VERSION_4);
        match decoded {
            Descriptor::Object(d) => {
                assert_eq!(d.message, "hi");
                assert_eq!(d.envelope.creation_date, 1_700_000_000_000);
                assert_eq!(d.envelope.id.sequence_id, 11);
            }
            other => unreachable!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_all_file_flavors_roundtrip() {
        let file = FileInfo {
            path: "blobs/a1b2".into(),
            extension: Some("mp4".into()),
            length: 1_048_576,
            thumbnail: Some(vec![9, 9, 9]),
        };
        for kind in [
            DescriptorType::File,
            DescriptorType::Image,
            DescriptorType::Audio,
            DescriptorType::Video,
            DescriptorType::NamedFile,
        ] {
            let mut descriptor = Descriptor::file(sample_id(), 1, 5, kind, file.clone());
            if let Descriptor::File(ref mut d) = descriptor {
                d.width = 640;
                d.height = 480;
                d.duration_ms = 9000;
                d.name = "report.pdf".into();
            }
            let decoded = roundtrip(&descriptor, ENVELOPE_VERSION_4);
            assert_eq!(decoded.descriptor_type(), kind);
            let info = decoded.file_info().expect("file info");
            assert_eq!(info.length, 1_048_576);
            assert_eq!(info.thumbnail.as_deref(), Some(&[9u8, 9, 9][..]));
        }
    }

    #[test]
    fn test_invitation_roundtrip() {
        let descriptor = Descriptor::Invitation(InvitationDescriptor {
            envelope: Envelope::outgoing(sample_id(), 2, 7),
            group_name: "book club".into(),
            group_twincode: Uuid::new_v4(),
            public_key: None,
            inviter: Uuid::new_v4(),
            member: Uuid::new_v4(),
            status: InvitationStatus::Pending,
        });
        let decoded = roundtrip(&descriptor, ENVELOPE_VERSION_4);
        match (descriptor, decoded) {
            (Descriptor::Invitation(sent), Descriptor::Invitation(got)) => {
                assert_eq!(got.group_name, sent.group_name);
                assert_eq!(got.inviter, sent.inviter);
                assert_eq!(got.member, sent.member);
                assert_eq!(got.status, InvitationStatus::Pending);
            }
            _ => unreachable!("wrong variant"),
        }
    }

    #[test]
    fn test_geolocation_twincode_call_clear_roundtrip() {
        let geo = Descriptor::Geolocation(GeolocationDescriptor {
            envelope: Envelope::outgoing(sample_id(), 1, 1),
            latitude: 48.8584,
            longitude: 2.2945,
            altitude: 312.0,
        });
        match roundtrip(&geo, ENVELOPE_VERSION_4) {
            Descriptor::Geolocation(d) => {
                assert_eq!(d.latitude, 48.8584);
                assert_eq!(d.longitude, 2.2945);
            }
            _ => unreachable!("wrong variant"),
        }

        let twincode = Descriptor::Twincode(TwincodeDescriptor {
            envelope: Envelope::outgoing(sample_id(), 1, 1),
            twincode_id: Uuid::new_v4(),
            name: Some("Alice".into()),
            description: None,
        });
        match roundtrip(&twincode, ENVELOPE_VERSION_4) {
            Descriptor::Twincode(d) => assert_eq!(d.name.as_deref(), Some("Alice")),
            _ => unreachable!("wrong variant"),
        }

        let call = Descriptor::Call(CallDescriptor {
            envelope: Envelope::outgoing(sample_id(), 1, 1),
            duration_ms: 65_000,
        });
        match roundtrip(&call, ENVELOPE_VERSION_4) {
            Descriptor::Call(d) => assert_eq!(d.duration_ms, 65_000),
            _ => unreachable!("wrong variant"),
        }

        let clear = Descriptor::Clear(ClearDescriptor {
            envelope: Envelope::outgoing(sample_id(), 1, 1),
            cleared_timestamp: 1_650_000_000_000,
        });
        match roundtrip(&clear, ENVELOPE_VERSION_3) {
            Descriptor::Clear(d) => assert_eq!(d.cleared_timestamp, 1_650_000_000_000),
            _ => unreachable!("wrong variant"),
        }
    }

    #[test]
    fn test_stored_roundtrip_keeps_column_envelope() {
        let descriptor = Descriptor::object(sample_id(), 6, 500, "stored".into());
        let mut encoder = Encoder::new();
        descriptor.encode_stored(&mut encoder);
        let bytes = encoder.into_bytes();

        let mut hydrated = Envelope::outgoing(sample_id(), 6, 500);
        hydrated.read_date = 777;
        let mut decoder = Decoder::new(&bytes);
        let decoded = Descriptor::decode_stored(&mut decoder, hydrated)
            .expect("decode")
            .expect("known schema");
        match decoded {
            Descriptor::Object(d) => {
                assert_eq!(d.message, "stored");
                assert_eq!(d.envelope.read_date, 777);
            }
            _ => unreachable!("wrong variant"),
        }
    }

    #[test]
    fn test_invitation_cannot_forward() {
        let descriptor = Descriptor::Invitation(InvitationDescriptor {
            envelope: Envelope::outgoing(sample_id(), 2, 7),
            group_name: "g".into(),
            group_twincode: Uuid::new_v4(),
            public_key: None,
            inviter: Uuid::new_v4(),
            member: Uuid::new_v4(),
            status: InvitationStatus::Pending,
        });
        assert!(!descriptor.can_forward());
        assert!(descriptor
            .create_forward(sample_id(), 9, 10, 0, None, true)
            .is_none());
    }

    #[test]
    fn test_forward_clones_payload_into_fresh_envelope() {
        let original = Descriptor::object(sample_id(), 1, 100, "fwd me".into());
        let new_id = DescriptorId::new(44, Uuid::new_v4(), 2);
        let forwarded = original
            .create_forward(new_id, 9, 200, 5000, None, true)
            .expect("forwardable");
        match forwarded {
            Descriptor::Object(d) => {
                assert_eq!(d.message, "fwd me");
                assert_eq!(d.envelope.conversation_id, 9);
                assert_eq!(d.envelope.creation_date, 200);
                assert_eq!(d.envelope.expire_timeout, 5000);
                assert!(d.envelope.has_flag(FLAG_COPY_ALLOWED));
            }
            _ => unreachable!("wrong variant"),
        }
    }

    #[test]
    fn test_invitation_status_transitions() {
        let mut invitation = InvitationDescriptor {
            envelope: Envelope::outgoing(sample_id(), 2, 7),
            group_name: "g".into(),
            group_twincode: Uuid::new_v4(),
            public_key: None,
            inviter: Uuid::new_v4(),
            member: Uuid::new_v4(),
            status: InvitationStatus::Pending,
        };
        assert!(invitation.can_transition(InvitationStatus::Accepted));
        assert!(invitation.can_transition(InvitationStatus::Withdrawn));
        invitation.status = InvitationStatus::Accepted;
        assert!(invitation.can_transition(InvitationStatus::Joined));
        assert!(!invitation.can_transition(InvitationStatus::Withdrawn));
        invitation.status = InvitationStatus::Joined;
        assert!(!invitation.can_transition(InvitationStatus::Withdrawn));
    }
}
