//! All IQ packets of the conversation protocol.
//!
//! Every packet starts with `schema_id(16) | schema_version(varint)` and a
//! varint `request_id`, then family-specific fields. Frames are padded for
//! the transport framing. Unknown schema pairs decode to `None` and the
//! frame is dropped.

use colloquy_codec::{CodecError, Decoder, Encoder, Result};
use uuid::Uuid;

use colloquy_model::{schema, Descriptor, ENVELOPE_VERSION_4};
use colloquy_types::TimestampKind;

/// Wire version of the IQ framing itself.
pub const IQ_SCHEMA_VERSION: i32 = 2;

/// Upper bound on list fields inside one IQ.
const MAX_LIST_LEN: usize = 4096;

/// Schema id of `ResetConversation`.
pub const RESET_CONVERSATION_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x7a31_c04d_9b5f_41e8_8c26_d874_02ab_51f9);
/// Schema id of `OnResetConversation`.
pub const ON_RESET_CONVERSATION_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xd2e8_55b0_6c17_4f2a_9d43_1b08_77ce_a064);
/// Schema id of `PushObject`.
pub const PUSH_OBJECT_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x41f6_a8d3_0e92_4b77_b1c5_63da_90f4_2e18);
/// Schema id of `OnPushObject`.
pub const ON_PUSH_OBJECT_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x9c04_27e1_55ab_40d9_8f6e_a2b1_34c8_d570);
/// Schema id of `PushFile`.
pub const PUSH_FILE_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x6b89_f1c2_3da4_4e60_97b0_58e3_cf12_a946);
/// Schema id of `OnPushFile`.
pub const ON_PUSH_FILE_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x30d5_9e7a_82f1_4c3b_a68d_0c49_b7e5_f213);
/// Schema id of `PushFileChunk`.
pub const PUSH_FILE_CHUNK_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xe714_3b58_c9a0_4d26_b3f7_815c_d609_4ae2);
/// Schema id of `OnPushFileChunk`.
pub const ON_PUSH_FILE_CHUNK_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x58c2_d697_10b4_4f85_9e21_fa73_06d8_b35c);
/// Schema id of `PushThumbnail`.
pub const PUSH_THUMBNAIL_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xaf60_12e9_74dc_49b1_8053_27c6_e1f9_048d);
/// Schema id of `PushGeolocation`.
pub const PUSH_GEOLOCATION_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x15b7_c843_f026_4a59_b8d4_9e10_5c72_36af);
/// Schema id of `OnPushGeolocation`.
pub const ON_PUSH_GEOLOCATION_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xc9e3_06f5_218a_4db7_a5c0_4871_d3b9_e62f);
/// Schema id of `PushTwincode`.
pub const PUSH_TWINCODE_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x82d4_b961_5e38_4c07_9f12_c50a_76e8_1db3);
/// Schema id of `OnPushTwincode`.
pub const ON_PUSH_TWINCODE_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x3fa8_507c_d1b2_4960_85e4_02d7_9c31_f7a5);
/// Schema id of `PushCommand`.
pub const PUSH_COMMAND_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xb0c6_e9d2_47f3_4518_92ab_6e05_83d4_c17e);
/// Schema id of `OnPushCommand`.
pub const ON_PUSH_COMMAND_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x64a1_f30b_8c59_4ed2_b796_d1c8_20e5_9b4f);
/// Schema id of `PushTransientObject`.
pub const PUSH_TRANSIENT_OBJECT_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xf8d0_4a67_92e1_4b3c_8a5f_7309_c6d2_e081);
/// Schema id of `InviteGroup`.
pub const INVITE_GROUP_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x29c5_817d_b3f6_4084_a1d9_5e62_f04b_738c);
/// Schema id of `RevokeInviteGroup`.
pub const REVOKE_INVITE_GROUP_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x7de2_94a0_06c8_4f51_b32e_8d17_45a9_c0f6);
/// Schema id of `JoinGroup`.
pub const JOIN_GROUP_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x50b9_3ce4_a725_4d18_96f0_1c84_e7d3_62ab);
/// Schema id of `LeaveGroup`.
pub const LEAVE_GROUP_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xce17_68f2_491b_4a06_8d53_b9e0_274c_f5d8);
/// Schema id of `UpdateGroupMember`.
pub const UPDATE_GROUP_MEMBER_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x91f4_d25a_6e80_4c39_b071_38a6_d5c2_04e9);
/// Schema id of `OnResultGroup`.
pub const ON_RESULT_GROUP_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x46e8_b1c0_d973_4257_a8f4_60b5_192e_d7c3);
/// Schema id of `OnResultJoin`.
pub const ON_RESULT_JOIN_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xda39_72e5_4b08_4691_bc27_f1a4_85d0_6e3b);
/// Schema id of `UpdateDescriptorTimestamp`.
pub const UPDATE_DESCRIPTOR_TIMESTAMP_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x08a6_e4d1_27c9_4b3f_9150_cd38_6f7a_b2e4);
/// Schema id of `OnUpdateDescriptorTimestamp`.
pub const ON_UPDATE_DESCRIPTOR_TIMESTAMP_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x6753_09cb_f8a2_4d60_8b1e_24d9_c05f_71a8);
/// Schema id of `UpdateDescriptor`.
pub const UPDATE_DESCRIPTOR_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xbd21_57f0_3e64_4985_a7c2_906e_1db4_83f5);
/// Schema id of `UpdateAnnotations`.
pub const UPDATE_ANNOTATIONS_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x34c7_a90e_61d5_4f28_b906_75e1_283a_cd40);
/// Schema id of `OnUpdateAnnotations`.
pub const ON_UPDATE_ANNOTATIONS_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xe96b_20d4_583c_4a17_82f5_c7b0_4961_3d8e);
/// Schema id of `Synchronize`.
pub const SYNCHRONIZE_SCHEMA_ID: Uuid =
    Uuid::from_u128(0x1d84_f6b3_0a29_4e75_93c8_5026_e8d1_b74f);
/// Schema id of `OnSynchronize`.
pub const ON_SYNCHRONIZE_SCHEMA_ID: Uuid =
    Uuid::from_u128(0xa527_c1e8_96d0_4b42_8e39_10f7_d4a6_52c0);

/// A response carrying only the echoed request id.
#[derive(Clone, Debug, PartialEq)]
pub struct AckIq {
    pub request_id: i64,
}

/// A response echoing the request id plus the server reception timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedIq {
    pub request_id: i64,
    pub received_timestamp: i64,
}

/// Ask the peer to delete everything at or below a sequence bound, with
/// per-member bounds for groups.
#[derive(Clone, Debug, PartialEq)]
pub struct ResetConversationIq {
    pub request_id: i64,
    pub min_sequence_id: i64,
    /// `(member twincode, bound)` pairs for group fan-out.
    pub peer_bounds: Vec<(Uuid, i64)>,
    /// Whether member bookkeeping is reset too.
    pub reset_members: bool,
}

/// Deliver a descriptor (text, geolocation, twincode card, invitation or
/// content edit, depending on the owning schema id).
#[derive(Clone, Debug, PartialEq)]
pub struct PushDescriptorIq {
    pub request_id: i64,
    pub descriptor: Descriptor,
}

/// Deliver a file descriptor and announce the sender's durable position.
#[derive(Clone, Debug, PartialEq)]
pub struct PushFileIq {
    pub request_id: i64,
    pub descriptor: Descriptor,
    /// Sender's last acknowledged offset; −1 before any ACK.
    pub chunk_start: i64,
}

/// Response to `PushFile`: reception timestamp and resume position.
#[derive(Clone, Debug, PartialEq)]
pub struct OnPushFileIq {
    pub request_id: i64,
    pub received_timestamp: i64,
    pub next_chunk_start: i64,
}

/// One slice of a file byte stream. An empty `data` probes the receiver's
/// current position.
#[derive(Clone, Debug, PartialEq)]
pub struct FileChunkIq {
    pub request_id: i64,
    /// Owner twincode of the file descriptor.
    pub twincode: Uuid,
    /// Sequence id of the file descriptor.
    pub sequence_id: i64,
    pub chunk_start: i64,
    pub data: Vec<u8>,
}

/// Sliding-window ACK: the next byte offset the receiver expects.
#[derive(Clone, Debug, PartialEq)]
pub struct OnFileChunkIq {
    pub request_id: i64,
    pub next_chunk_start: i64,
}

/// Transient realtime command sidecar; never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct PushCommandIq {
    pub request_id: i64,
    pub command: Vec<u8>,
}

/// Fire-and-forget transient signal (typing, ...); no response expected.
#[derive(Clone, Debug, PartialEq)]
pub struct PushTransientObjectIq {
    pub request_id: i64,
    pub payload: Vec<u8>,
}

/// Withdraw a pending invitation identified by its descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct RevokeInviteGroupIq {
    pub request_id: i64,
    pub twincode: Uuid,
    pub sequence_id: i64,
}

/// Join a group we were invited to.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinGroupIq {
    pub request_id: i64,
    pub group_id: Uuid,
    pub member_id: Uuid,
    pub permissions: i64,
    pub public_key: Option<String>,
    pub secret: Option<Vec<u8>>,
}

/// Leave a group.
#[derive(Clone, Debug, PartialEq)]
pub struct LeaveGroupIq {
    pub request_id: i64,
    pub group_id: Uuid,
    pub member_id: Uuid,
}

/// Update a member's permission bitmap.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateGroupMemberIq {
    pub request_id: i64,
    pub group_id: Uuid,
    pub member_id: Uuid,
    pub permissions: i64,
    pub signed_off: bool,
    pub signature: Option<Vec<u8>>,
}

/// Generic group operation result.
#[derive(Clone, Debug, PartialEq)]
pub struct OnResultGroupIq {
    pub request_id: i64,
    /// `0` success; non-zero carries the peer's error code.
    pub status: i32,
}

/// One member of a resolved group roster.
#[derive(Clone, Debug, PartialEq)]
pub struct RosterEntry {
    pub member_id: Uuid,
    pub permissions: i64,
}

/// Join result: the resolved roster with permissions.
#[derive(Clone, Debug, PartialEq)]
pub struct OnResultJoinIq {
    pub request_id: i64,
    pub members: Vec<RosterEntry>,
}

/// Push a read/delete/peer-delete timestamp for a referenced descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateDescriptorTimestampIq {
    pub request_id: i64,
    pub kind: TimestampKind,
    pub twincode: Uuid,
    pub sequence_id: i64,
    pub timestamp: i64,
}

/// Carry content/flag/expiration edits for an existing message.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateDescriptorIq {
    pub request_id: i64,
    pub descriptor: Descriptor,
    /// `UPDATE_*` bits describing what changed.
    pub update_flags: u32,
}

/// Synchronize our annotation rows for one descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateAnnotationsIq {
    pub request_id: i64,
    pub twincode: Uuid,
    pub sequence_id: i64,
    /// `(kind code, value)` rows; the full replacement set.
    pub annotations: Vec<(u8, i64)>,
}

/// Reconcile state after a reconnect; carries our device state bits.
#[derive(Clone, Debug, PartialEq)]
pub struct SynchronizeIq {
    pub request_id: i64,
    pub device_state: u32,
}

/// Every packet of the conversation protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum Iq {
    ResetConversation(ResetConversationIq),
    OnResetConversation(AckIq),
    PushObject(PushDescriptorIq),
    OnPushObject(ReceivedIq),
    PushFile(PushFileIq),
    OnPushFile(OnPushFileIq),
    PushFileChunk(FileChunkIq),
    OnPushFileChunk(OnFileChunkIq),
    PushThumbnail(FileChunkIq),
    PushGeolocation(PushDescriptorIq),
    OnPushGeolocation(ReceivedIq),
    PushTwincode(PushDescriptorIq),
    OnPushTwincode(ReceivedIq),
    PushCommand(PushCommandIq),
    OnPushCommand(AckIq),
    PushTransientObject(PushTransientObjectIq),
    InviteGroup(PushDescriptorIq),
    RevokeInviteGroup(RevokeInviteGroupIq),
    JoinGroup(JoinGroupIq),
    LeaveGroup(LeaveGroupIq),
    UpdateGroupMember(UpdateGroupMemberIq),
    OnResultGroup(OnResultGroupIq),
    OnResultJoin(OnResultJoinIq),
    UpdateDescriptorTimestamp(UpdateDescriptorTimestampIq),
    OnUpdateDescriptorTimestamp(AckIq),
    UpdateDescriptor(UpdateDescriptorIq),
    UpdateAnnotations(UpdateAnnotationsIq),
    OnUpdateAnnotations(AckIq),
    Synchronize(SynchronizeIq),
    OnSynchronize(AckIq),
}

impl Iq {
    /// The request id carried by any packet.
    pub fn request_id(&self) -> i64 {
        match self {
            Self::ResetConversation(iq) => iq.request_id,
            Self::OnResetConversation(iq)
            | Self::OnPushCommand(iq)
            | Self::OnUpdateDescriptorTimestamp(iq)
            | Self::OnUpdateAnnotations(iq)
            | Self::OnSynchronize(iq) => iq.request_id,
            Self::PushObject(iq)
            | Self::PushGeolocation(iq)
            | Self::PushTwincode(iq)
            | Self::InviteGroup(iq) => iq.request_id,
            Self::OnPushObject(iq) | Self::OnPushGeolocation(iq) | Self::OnPushTwincode(iq) => {
                iq.request_id
            }
            Self::PushFile(iq) => iq.request_id,
            Self::OnPushFile(iq) => iq.request_id,
            Self::PushFileChunk(iq) | Self::PushThumbnail(iq) => iq.request_id,
            Self::OnPushFileChunk(iq) => iq.request_id,
            Self::PushCommand(iq) => iq.request_id,
            Self::PushTransientObject(iq) => iq.request_id,
            Self::RevokeInviteGroup(iq) => iq.request_id,
            Self::JoinGroup(iq) => iq.request_id,
            Self::LeaveGroup(iq) => iq.request_id,
            Self::UpdateGroupMember(iq) => iq.request_id,
            Self::OnResultGroup(iq) => iq.request_id,
            Self::OnResultJoin(iq) => iq.request_id,
            Self::UpdateDescriptorTimestamp(iq) => iq.request_id,
            Self::UpdateDescriptor(iq) => iq.request_id,
            Self::UpdateAnnotations(iq) => iq.request_id,
            Self::Synchronize(iq) => iq.request_id,
        }
    }

    /// Whether this packet is a response to an earlier request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::OnResetConversation(_)
                | Self::OnPushObject(_)
                | Self::OnPushFile(_)
                | Self::OnPushFileChunk(_)
                | Self::OnPushGeolocation(_)
                | Self::OnPushTwincode(_)
                | Self::OnPushCommand(_)
                | Self::OnResultGroup(_)
                | Self::OnResultJoin(_)
                | Self::OnUpdateDescriptorTimestamp(_)
                | Self::OnUpdateAnnotations(_)
                | Self::OnSynchronize(_)
        )
    }

    /// Serialize with descriptor envelope v4 (current peers).
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(ENVELOPE_VERSION_4)
    }

    /// Serialize, encoding any embedded descriptor at the given envelope
    /// generation.
    pub fn encode_with(&self, envelope_version: i32) -> Vec<u8> {
        let mut encoder = Encoder::with_leading_padding();
        match self {
            Self::ResetConversation(iq) => {
                encoder.write_schema(&RESET_CONVERSATION_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_long(iq.min_sequence_id);
                encoder.write_long(iq.peer_bounds.len() as i64);
                for (twincode, bound) in &iq.peer_bounds {
                    encoder.write_uuid(twincode);
                    encoder.write_long(*bound);
                }
                encoder.write_bool(iq.reset_members);
            }
            Self::OnResetConversation(iq) => {
                write_ack(&mut encoder, &ON_RESET_CONVERSATION_SCHEMA_ID, iq);
            }
            Self::PushObject(iq) => {
                write_push(&mut encoder, &PUSH_OBJECT_SCHEMA_ID, iq, envelope_version);
            }
            Self::OnPushObject(iq) => {
                write_received(&mut encoder, &ON_PUSH_OBJECT_SCHEMA_ID, iq);
            }
            Self::PushFile(iq) => {
                encoder.write_schema(&PUSH_FILE_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                iq.descriptor.encode(&mut encoder, envelope_version);
                encoder.write_long(iq.chunk_start);
            }
            Self::OnPushFile(iq) => {
                encoder.write_schema(&ON_PUSH_FILE_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_long(iq.received_timestamp);
                encoder.write_long(iq.next_chunk_start);
            }
            Self::PushFileChunk(iq) => {
                write_chunk(&mut encoder, &PUSH_FILE_CHUNK_SCHEMA_ID, iq);
            }
            Self::PushThumbnail(iq) => {
                write_chunk(&mut encoder, &PUSH_THUMBNAIL_SCHEMA_ID, iq);
            }
            Self::OnPushFileChunk(iq) => {
                encoder.write_schema(&ON_PUSH_FILE_CHUNK_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_long(iq.next_chunk_start);
            }
            Self::PushGeolocation(iq) => {
                write_push(&mut encoder, &PUSH_GEOLOCATION_SCHEMA_ID, iq, envelope_version);
            }
            Self::OnPushGeolocation(iq) => {
                write_received(&mut encoder, &ON_PUSH_GEOLOCATION_SCHEMA_ID, iq);
            }
            Self::PushTwincode(iq) => {
                write_push(&mut encoder, &PUSH_TWINCODE_SCHEMA_ID, iq, envelope_version);
            }
            Self::OnPushTwincode(iq) => {
                write_received(&mut encoder, &ON_PUSH_TWINCODE_SCHEMA_ID, iq);
            }
            Self::PushCommand(iq) => {
                encoder.write_schema(&PUSH_COMMAND_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_bytes(&iq.command);
            }
            Self::OnPushCommand(iq) => {
                write_ack(&mut encoder, &ON_PUSH_COMMAND_SCHEMA_ID, iq);
            }
            Self::PushTransientObject(iq) => {
                encoder.write_schema(&PUSH_TRANSIENT_OBJECT_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_bytes(&iq.payload);
            }
            Self::InviteGroup(iq) => {
                write_push(&mut encoder, &INVITE_GROUP_SCHEMA_ID, iq, envelope_version);
            }
            Self::RevokeInviteGroup(iq) => {
                encoder.write_schema(&REVOKE_INVITE_GROUP_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_uuid(&iq.twincode);
                encoder.write_long(iq.sequence_id);
            }
            Self::JoinGroup(iq) => {
                encoder.write_schema(&JOIN_GROUP_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_uuid(&iq.group_id);
                encoder.write_uuid(&iq.member_id);
                encoder.write_long(iq.permissions);
                encoder.write_optional_string(iq.public_key.as_deref());
                encoder.write_optional_bytes(iq.secret.as_deref());
            }
            Self::LeaveGroup(iq) => {
                encoder.write_schema(&LEAVE_GROUP_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_uuid(&iq.group_id);
                encoder.write_uuid(&iq.member_id);
            }
            Self::UpdateGroupMember(iq) => {
                encoder.write_schema(&UPDATE_GROUP_MEMBER_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_uuid(&iq.group_id);
                encoder.write_uuid(&iq.member_id);
                encoder.write_long(iq.permissions);
                encoder.write_bool(iq.signed_off);
                encoder.write_optional_bytes(iq.signature.as_deref());
            }
            Self::OnResultGroup(iq) => {
                encoder.write_schema(&ON_RESULT_GROUP_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_int(iq.status);
            }
            Self::OnResultJoin(iq) => {
                encoder.write_schema(&ON_RESULT_JOIN_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_long(iq.members.len() as i64);
                for member in &iq.members {
                    encoder.write_uuid(&member.member_id);
                    encoder.write_long(member.permissions);
                }
            }
            Self::UpdateDescriptorTimestamp(iq) => {
                encoder.write_schema(&UPDATE_DESCRIPTOR_TIMESTAMP_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_enum(iq.kind.code());
                encoder.write_uuid(&iq.twincode);
                encoder.write_long(iq.sequence_id);
                encoder.write_long(iq.timestamp);
            }
            Self::OnUpdateDescriptorTimestamp(iq) => {
                write_ack(&mut encoder, &ON_UPDATE_DESCRIPTOR_TIMESTAMP_SCHEMA_ID, iq);
            }
            Self::UpdateDescriptor(iq) => {
                encoder.write_schema(&UPDATE_DESCRIPTOR_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                iq.descriptor.encode(&mut encoder, envelope_version);
                encoder.write_long(i64::from(iq.update_flags));
            }
            Self::UpdateAnnotations(iq) => {
                encoder.write_schema(&UPDATE_ANNOTATIONS_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_uuid(&iq.twincode);
                encoder.write_long(iq.sequence_id);
                encoder.write_long(iq.annotations.len() as i64);
                for (kind, value) in &iq.annotations {
                    encoder.write_enum(*kind);
                    encoder.write_long(*value);
                }
            }
            Self::OnUpdateAnnotations(iq) => {
                write_ack(&mut encoder, &ON_UPDATE_ANNOTATIONS_SCHEMA_ID, iq);
            }
            Self::Synchronize(iq) => {
                encoder.write_schema(&SYNCHRONIZE_SCHEMA_ID, IQ_SCHEMA_VERSION);
                encoder.write_long(iq.request_id);
                encoder.write_long(i64::from(iq.device_state));
            }
            Self::OnSynchronize(iq) => {
                write_ack(&mut encoder, &ON_SYNCHRONIZE_SCHEMA_ID, iq);
            }
        }
        encoder.into_bytes()
    }

    /// Parse a padded frame. Returns `Ok(None)` for unknown schema pairs
    /// and for embedded descriptors this revision cannot decode.
    pub fn decode(bytes: &[u8]) -> Result<Option<Iq>> {
        let mut decoder = Decoder::with_leading_padding(bytes)?;
        let (schema_id, version) = decoder.read_schema()?;
        if version != IQ_SCHEMA_VERSION {
            tracing::debug!(%schema_id, version, "unknown IQ version; frame dropped");
            return Ok(None);
        }
        let request_id = decoder.read_long()?;
        let iq = match schema_id {
            id if id == RESET_CONVERSATION_SCHEMA_ID => {
                let min_sequence_id = decoder.read_long()?;
                let count = read_list_len(&mut decoder)?;
                let mut peer_bounds = Vec::with_capacity(count);
                for _ in 0..count {
                    let twincode = decoder.read_uuid()?;
                    let bound = decoder.read_long()?;
                    peer_bounds.push((twincode, bound));
                }
                let reset_members = decoder.read_bool()?;
                Iq::ResetConversation(ResetConversationIq {
                    request_id,
                    min_sequence_id,
                    peer_bounds,
                    reset_members,
                })
            }
            id if id == ON_RESET_CONVERSATION_SCHEMA_ID => {
                Iq::OnResetConversation(AckIq { request_id })
            }
            id if id == PUSH_OBJECT_SCHEMA_ID => {
                match read_push(&mut decoder, request_id)? {
                    Some(iq) => Iq::PushObject(iq),
                    None => return Ok(None),
                }
            }
            id if id == ON_PUSH_OBJECT_SCHEMA_ID => Iq::OnPushObject(ReceivedIq {
                request_id,
                received_timestamp: decoder.read_long()?,
            }),
            id if id == PUSH_FILE_SCHEMA_ID => {
                let Some(descriptor) = schema::decode_descriptor(&mut decoder)? else {
                    return Ok(None);
                };
                let chunk_start = decoder.read_long()?;
                Iq::PushFile(PushFileIq {
                    request_id,
                    descriptor,
                    chunk_start,
                })
            }
            id if id == ON_PUSH_FILE_SCHEMA_ID => Iq::OnPushFile(OnPushFileIq {
                request_id,
                received_timestamp: decoder.read_long()?,
                next_chunk_start: decoder.read_long()?,
            }),
            id if id == PUSH_FILE_CHUNK_SCHEMA_ID => {
                Iq::PushFileChunk(read_chunk(&mut decoder, request_id)?)
            }
            id if id == PUSH_THUMBNAIL_SCHEMA_ID => {
                Iq::PushThumbnail(read_chunk(&mut decoder, request_id)?)
            }
            id if id == ON_PUSH_FILE_CHUNK_SCHEMA_ID => Iq::OnPushFileChunk(OnFileChunkIq {
                request_id,
                next_chunk_start: decoder.read_long()?,
            }),
            id if id == PUSH_GEOLOCATION_SCHEMA_ID => {
                match read_push(&mut decoder, request_id)? {
                    Some(iq) => Iq::PushGeolocation(iq),
                    None => return Ok(None),
                }
            }
            id if id == ON_PUSH_GEOLOCATION_SCHEMA_ID => Iq::OnPushGeolocation(ReceivedIq {
                request_id,
                received_timestamp: decoder.read_long()?,
            }),
            id if id == PUSH_TWINCODE_SCHEMA_ID => {
                match read_push(&mut decoder, request_id)? {
                    Some(iq) => Iq::PushTwincode(iq),
                    None => return Ok(None),
                }
            }
            id if id == ON_PUSH_TWINCODE_SCHEMA_ID => Iq::OnPushTwincode(ReceivedIq {
                request_id,
                received_timestamp: decoder.read_long()?,
            }),
            id if id == PUSH_COMMAND_SCHEMA_ID => Iq::PushCommand(PushCommandIq {
                request_id,
                command: decoder.read_bytes()?,
            }),
            id if id == ON_PUSH_COMMAND_SCHEMA_ID => Iq::OnPushCommand(AckIq { request_id }),
            id if id == PUSH_TRANSIENT_OBJECT_SCHEMA_ID => {
                Iq::PushTransientObject(PushTransientObjectIq {
                    request_id,
                    payload: decoder.read_bytes()?,
                })
            }
            id if id == INVITE_GROUP_SCHEMA_ID => {
                match read_push(&mut decoder, request_id)? {
                    Some(iq) => Iq::InviteGroup(iq),
                    None => return Ok(None),
                }
            }
            id if id == REVOKE_INVITE_GROUP_SCHEMA_ID => {
                Iq::RevokeInviteGroup(RevokeInviteGroupIq {
                    request_id,
                    twincode: decoder.read_uuid()?,
                    sequence_id: decoder.read_long()?,
                })
            }
            id if id == JOIN_GROUP_SCHEMA_ID => Iq::JoinGroup(JoinGroupIq {
                request_id,
                group_id: decoder.read_uuid()?,
                member_id: decoder.read_uuid()?,
                permissions: decoder.read_long()?,
                public_key: decoder.read_optional_string()?,
                secret: decoder.read_optional_bytes()?,
            }),
            id if id == LEAVE_GROUP_SCHEMA_ID => Iq::LeaveGroup(LeaveGroupIq {
                request_id,
                group_id: decoder.read_uuid()?,
                member_id: decoder.read_uuid()?,
            }),
            id if id == UPDATE_GROUP_MEMBER_SCHEMA_ID => {
                Iq::UpdateGroupMember(UpdateGroupMemberIq {
                    request_id,
                    group_id: decoder.read_uuid()?,
                    member_id: decoder.read_uuid()?,
                    permissions: decoder.read_long()?,
                    signed_off: decoder.read_bool()?,
                    signature: decoder.read_optional_bytes()?,
                })
            }
            id if id == ON_RESULT_GROUP_SCHEMA_ID => Iq::OnResultGroup(OnResultGroupIq {
                request_id,
                status: decoder.read_int()?,
            }),
            id if id == ON_RESULT_JOIN_SCHEMA_ID => {
                let count = read_list_len(&mut decoder)?;
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    members.push(RosterEntry {
                        member_id: decoder.read_uuid()?,
                        permissions: decoder.read_long()?,
                    });
                }
                Iq::OnResultJoin(OnResultJoinIq {
                    request_id,
                    members,
                })
            }
            id if id == UPDATE_DESCRIPTOR_TIMESTAMP_SCHEMA_ID => {
                let kind_code = decoder.read_enum()?;
                let Some(kind) = TimestampKind::from_code(kind_code) else {
                    return Ok(None);
                };
                Iq::UpdateDescriptorTimestamp(UpdateDescriptorTimestampIq {
                    request_id,
                    kind,
                    twincode: decoder.read_uuid()?,
                    sequence_id: decoder.read_long()?,
                    timestamp: decoder.read_long()?,
                })
            }
            id if id == ON_UPDATE_DESCRIPTOR_TIMESTAMP_SCHEMA_ID => {
                Iq::OnUpdateDescriptorTimestamp(AckIq { request_id })
            }
            id if id == UPDATE_DESCRIPTOR_SCHEMA_ID => {
                let Some(descriptor) = schema::decode_descriptor(&mut decoder)? else {
                    return Ok(None);
                };
                let update_flags = decoder.read_long()? as u32;
                Iq::UpdateDescriptor(UpdateDescriptorIq {
                    request_id,
                    descriptor,
                    update_flags,
                })
            }
            id if id == UPDATE_ANNOTATIONS_SCHEMA_ID => {
                let twincode = decoder.read_uuid()?;
                let sequence_id = decoder.read_long()?;
                let count = read_list_len(&mut decoder)?;
                let mut annotations = Vec::with_capacity(count);
                for _ in 0..count {
                    let kind = decoder.read_enum()?;
                    let value = decoder.read_long()?;
                    annotations.push((kind, value));
                }
                Iq::UpdateAnnotations(UpdateAnnotationsIq {
                    request_id,
                    twincode,
                    sequence_id,
                    annotations,
                })
            }
            id if id == ON_UPDATE_ANNOTATIONS_SCHEMA_ID => {
                Iq::OnUpdateAnnotations(AckIq { request_id })
            }
            id if id == SYNCHRONIZE_SCHEMA_ID => Iq::Synchronize(SynchronizeIq {
                request_id,
                device_state: decoder.read_long()? as u32,
            }),
            id if id == ON_SYNCHRONIZE_SCHEMA_ID => Iq::OnSynchronize(AckIq { request_id }),
            id => {
                tracing::debug!(schema_id = %id, "unknown IQ schema; frame dropped");
                return Ok(None);
            }
        };
        Ok(Some(iq))
    }
}

fn write_ack(encoder: &mut Encoder, schema_id: &Uuid, iq: &AckIq) {
    encoder.write_schema(schema_id, IQ_SCHEMA_VERSION);
    encoder.write_long(iq.request_id);
}

fn write_received(encoder: &mut Encoder, schema_id: &Uuid, iq: &ReceivedIq) {
    encoder.write_schema(schema_id, IQ_SCHEMA_VERSION);
    encoder.write_long(iq.request_id);
    encoder.write_long(iq.received_timestamp);
}

fn write_push(
    encoder: &mut Encoder,
    schema_id: &Uuid,
    iq: &PushDescriptorIq,
    envelope_version: i32,
) {
    encoder.write_schema(schema_id, IQ_SCHEMA_VERSION);
    encoder.write_long(iq.request_id);
    iq.descriptor.encode(encoder, envelope_version);
}

fn write_chunk(encoder: &mut Encoder, schema_id: &Uuid, iq: &FileChunkIq) {
    encoder.write_schema(schema_id, IQ_SCHEMA_VERSION);
    encoder.write_long(iq.request_id);
    encoder.write_uuid(&iq.twincode);
    encoder.write_long(iq.sequence_id);
    encoder.write_long(iq.chunk_start);
    encoder.write_bytes(&iq.data);
}

fn read_push(decoder: &mut Decoder<'_>, request_id: i64) -> Result<Option<PushDescriptorIq>> {
    let Some(descriptor) = schema::decode_descriptor(decoder)? else {
        return Ok(None);
    };
    Ok(Some(PushDescriptorIq {
        request_id,
        descriptor,
    }))
}

fn read_chunk(decoder: &mut Decoder<'_>, request_id: i64) -> Result<FileChunkIq> {
    Ok(FileChunkIq {
        request_id,
        twincode: decoder.read_uuid()?,
        sequence_id: decoder.read_long()?,
        chunk_start: decoder.read_long()?,
        data: decoder.read_bytes()?,
    })
}

fn read_list_len(decoder: &mut Decoder<'_>) -> Result<usize> {
    let count = decoder.read_long()?;
    let count = usize::try_from(count).map_err(|_| CodecError::LengthOutOfRange(0))?;
    if count > MAX_LIST_LEN {
        return Err(CodecError::LengthOutOfRange(count));
    }
    Ok(count)
}
