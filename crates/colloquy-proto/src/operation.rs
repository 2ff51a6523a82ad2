//! Pending operations.
//!
//! An operation is one durable outgoing intent. Executing it against an
//! open link builds and transmits an IQ; the returned [`ErrorCode`] tells
//! the scheduler whether to await a response (`Queued`), finish now
//! (`Success`), or drop the operation (`Expired`, `BadRequest`,
//! `FeatureNotSupportedByPeer`). Send-path failures surface the link's
//! transient or fatal code unchanged.

use std::io::{Read, Seek, SeekFrom};

use uuid::Uuid;

use colloquy_codec::{Decoder, Encoder};
use colloquy_db::{OperationRow, Store};
use colloquy_model::{Conversation, Descriptor};
use colloquy_types::{
    DatabaseId, DescriptorId, ErrorCode, OperationType, TimestampKind, NOT_INITIALIZED,
    NO_REQUEST_ID,
};

use crate::chunk::ChunkTransfer;
use crate::iq::{
    FileChunkIq, Iq, JoinGroupIq, LeaveGroupIq, PushCommandIq, PushDescriptorIq, PushFileIq,
    PushTransientObjectIq, ResetConversationIq, RevokeInviteGroupIq, SynchronizeIq,
    UpdateAnnotationsIq, UpdateDescriptorIq, UpdateDescriptorTimestampIq, UpdateGroupMemberIq,
};
use crate::link::PeerLink;
use crate::versions;

/// Type-specific persisted arguments of an operation.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationContent {
    /// Sequence bounds of a conversation reset.
    Reset {
        min_sequence_id: i64,
        peer_bounds: Vec<(Uuid, i64)>,
        reset_members: bool,
        /// Local-only: keep text/media messages when applying our side.
        keep_media: bool,
    },
    /// A read/delete/peer-delete timestamp for a referenced descriptor.
    Timestamp {
        kind: TimestampKind,
        twincode: Uuid,
        sequence_id: i64,
        timestamp: i64,
    },
    /// Group join arguments.
    JoinGroup {
        group_id: Uuid,
        member_id: Uuid,
        permissions: i64,
        public_key: Option<String>,
        secret: Option<Vec<u8>>,
    },
    /// Group leave arguments.
    LeaveGroup { group_id: Uuid, member_id: Uuid },
    /// Member permission update arguments.
    UpdateMember {
        group_id: Uuid,
        member_id: Uuid,
        permissions: i64,
        signed_off: bool,
        signature: Option<Vec<u8>>,
    },
    /// Which fields of a sent message were edited.
    UpdateObject { update_flags: u32 },
}

impl OperationContent {
    /// Serialize to the operation row's content blob.
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Self::Reset {
                min_sequence_id,
                peer_bounds,
                reset_members,
                keep_media,
            } => {
                encoder.write_long(*min_sequence_id);
                encoder.write_long(peer_bounds.len() as i64);
                for (twincode, bound) in peer_bounds {
                    encoder.write_uuid(twincode);
                    encoder.write_long(*bound);
                }
                encoder.write_bool(*reset_members);
                encoder.write_bool(*keep_media);
            }
            Self::Timestamp {
                kind,
                twincode,
                sequence_id,
                timestamp,
            } => {
                encoder.write_enum(kind.code());
                encoder.write_uuid(twincode);
                encoder.write_long(*sequence_id);
                encoder.write_long(*timestamp);
            }
            Self::JoinGroup {
                group_id,
                member_id,
                permissions,
                public_key,
                secret,
            } => {
                encoder.write_uuid(group_id);
                encoder.write_uuid(member_id);
                encoder.write_long(*permissions);
                encoder.write_optional_string(public_key.as_deref());
                encoder.write_optional_bytes(secret.as_deref());
            }
            Self::LeaveGroup {
                group_id,
                member_id,
            } => {
                encoder.write_uuid(group_id);
                encoder.write_uuid(member_id);
            }
            Self::UpdateMember {
                group_id,
                member_id,
                permissions,
                signed_off,
                signature,
            } => {
                encoder.write_uuid(group_id);
                encoder.write_uuid(member_id);
                encoder.write_long(*permissions);
                encoder.write_bool(*signed_off);
                encoder.write_optional_bytes(signature.as_deref());
            }
            Self::UpdateObject { update_flags } => {
                encoder.write_long(i64::from(*update_flags));
            }
        }
        encoder.into_bytes()
    }

    /// Reconstruct from a row's content blob. `Ok(None)` when the type
    /// carries no content.
    pub fn parse(
        op_type: OperationType,
        content: Option<&[u8]>,
    ) -> colloquy_codec::Result<Option<Self>> {
        let Some(bytes) = content else {
            return Ok(None);
        };
        let mut decoder = Decoder::new(bytes);
        let parsed = match op_type {
            OperationType::ResetConversation => {
                let min_sequence_id = decoder.read_long()?;
                let count = usize::try_from(decoder.read_long()?)
                    .map_err(|_| colloquy_codec::CodecError::LengthOutOfRange(0))?;
                let mut peer_bounds = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let twincode = decoder.read_uuid()?;
                    let bound = decoder.read_long()?;
                    peer_bounds.push((twincode, bound));
                }
                let reset_members = decoder.read_bool()?;
                let keep_media = decoder.read_bool()?;
                Self::Reset {
                    min_sequence_id,
                    peer_bounds,
                    reset_members,
                    keep_media,
                }
            }
            OperationType::UpdateDescriptorTimestamp => {
                let kind_code = decoder.read_enum()?;
                let Some(kind) = TimestampKind::from_code(kind_code) else {
                    return Ok(None);
                };
                Self::Timestamp {
                    kind,
                    twincode: decoder.read_uuid()?,
                    sequence_id: decoder.read_long()?,
                    timestamp: decoder.read_long()?,
                }
            }
            OperationType::JoinGroup | OperationType::InvokeJoinGroup => Self::JoinGroup {
                group_id: decoder.read_uuid()?,
                member_id: decoder.read_uuid()?,
                permissions: decoder.read_long()?,
                public_key: decoder.read_optional_string()?,
                secret: decoder.read_optional_bytes()?,
            },
            OperationType::LeaveGroup | OperationType::InvokeLeaveGroup => Self::LeaveGroup {
                group_id: decoder.read_uuid()?,
                member_id: decoder.read_uuid()?,
            },
            OperationType::UpdateGroupMember | OperationType::InvokeAddMemberGroup => {
                Self::UpdateMember {
                    group_id: decoder.read_uuid()?,
                    member_id: decoder.read_uuid()?,
                    permissions: decoder.read_long()?,
                    signed_off: decoder.read_bool()?,
                    signature: decoder.read_optional_bytes()?,
                }
            }
            OperationType::UpdateObject => Self::UpdateObject {
                update_flags: decoder.read_long()? as u32,
            },
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

/// Everything the execution of one operation may touch.
pub struct ExecuteContext<'a> {
    pub link: &'a dyn PeerLink,
    pub store: &'a Store,
    pub conversation: &'a Conversation,
    /// Our device state bits, announced on synchronize.
    pub device_state: u32,
    pub now: i64,
}

/// One queued outgoing action.
#[derive(Debug)]
pub struct PendingOperation {
    /// Row id; `0` for transient operations that are never persisted.
    pub id: DatabaseId,
    pub creation_date: i64,
    pub conversation_id: DatabaseId,
    pub op_type: OperationType,
    /// The descriptor this operation delivers or references.
    pub descriptor_id: Option<DatabaseId>,
    pub content: Option<OperationContent>,
    /// In-flight request id; `NO_REQUEST_ID` while idle.
    pub request_id: i64,
    /// Durable sliding-window position (file pushes).
    pub chunk_start: i64,
    /// In-memory transfer state, rebuilt on every link.
    pub transfer: Option<ChunkTransfer>,
    /// Payload of transient pushes and commands.
    pub transient_payload: Option<Vec<u8>>,
}

impl PendingOperation {
    /// A fresh operation, before persistence.
    pub fn new(
        conversation_id: DatabaseId,
        op_type: OperationType,
        descriptor_id: Option<DatabaseId>,
        content: Option<OperationContent>,
        now: i64,
    ) -> Self {
        Self {
            id: 0,
            creation_date: now,
            conversation_id,
            op_type,
            descriptor_id,
            content,
            request_id: NO_REQUEST_ID,
            chunk_start: NOT_INITIALIZED,
            transfer: None,
            transient_payload: None,
        }
    }

    /// Rebuild from a persisted row. Unknown type codes and undecodable
    /// content blobs drop the row.
    pub fn from_row(row: &OperationRow) -> Option<Self> {
        let op_type = OperationType::from_code(row.op_type)?;
        let content = match OperationContent::parse(op_type, row.content.as_deref()) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(id = row.id, error = %e, "operation content undecodable; dropped");
                return None;
            }
        };
        Some(Self {
            id: row.id,
            creation_date: row.creation_date,
            conversation_id: row.conversation_id,
            op_type,
            descriptor_id: row.descriptor_id,
            content,
            request_id: NO_REQUEST_ID,
            chunk_start: row.chunk_start.unwrap_or(NOT_INITIALIZED),
            transfer: None,
            transient_payload: None,
        })
    }

    /// Serialize the type-specific arguments for persistence.
    pub fn serialize(&self) -> Option<Vec<u8>> {
        self.content.as_ref().map(OperationContent::serialize)
    }

    /// Whether this operation is currently awaiting a response.
    pub fn in_flight(&self) -> bool {
        self.request_id != NO_REQUEST_ID
    }

    /// Whether a file transfer has window room to transmit right now.
    pub fn is_ready_to_send(&self) -> bool {
        self.transfer
            .as_ref()
            .is_some_and(ChunkTransfer::is_ready_to_send)
    }

    fn load_descriptor(
        &self,
        ctx: &ExecuteContext<'_>,
    ) -> Result<std::sync::Arc<Descriptor>, ErrorCode> {
        let Some(descriptor_id) = self.descriptor_id else {
            return Err(ErrorCode::BadRequest);
        };
        let id = DescriptorId::new(descriptor_id, Uuid::nil(), 0);
        match ctx.store.load_descriptor(self.conversation_id, &id) {
            Ok(Some(descriptor)) => {
                if descriptor.is_expired(ctx.now) {
                    Err(ErrorCode::Expired)
                } else {
                    Ok(descriptor)
                }
            }
            Ok(None) => Err(ErrorCode::Expired),
            Err(e) => {
                tracing::error!(operation = self.id, error = %e, "descriptor load failed");
                Err(ErrorCode::DatabaseError)
            }
        }
    }

    fn send(&mut self, ctx: &ExecuteContext<'_>, iq: &Iq) -> ErrorCode {
        let envelope_version = versions::envelope_version_for(ctx.link);
        match ctx.link.send_packet(iq.encode_with(envelope_version)) {
            Ok(()) => ErrorCode::Queued,
            Err(code) => {
                self.request_id = NO_REQUEST_ID;
                code
            }
        }
    }

    /// Execute against an open link.
    pub fn execute(&mut self, ctx: &mut ExecuteContext<'_>) -> ErrorCode {
        if !versions::supports(ctx.link, self.op_type) {
            return ErrorCode::FeatureNotSupportedByPeer;
        }
        match self.op_type {
            OperationType::PushObject
            | OperationType::PushGeolocation
            | OperationType::PushTwincode
            | OperationType::InviteGroup => self.execute_push(ctx),
            OperationType::PushFile => self.execute_push_file(ctx),
            OperationType::ResetConversation => self.execute_reset(ctx),
            OperationType::SynchronizeConversation => {
                self.request_id = ctx.link.new_request_id();
                let iq = Iq::Synchronize(SynchronizeIq {
                    request_id: self.request_id,
                    device_state: ctx.device_state,
                });
                self.send(ctx, &iq)
            }
            OperationType::PushTransientObject => {
                let Some(payload) = self.transient_payload.clone() else {
                    return ErrorCode::BadRequest;
                };
                let iq = Iq::PushTransientObject(PushTransientObjectIq {
                    request_id: ctx.link.new_request_id(),
                    payload,
                });
                // Fire-and-forget: no response is expected or correlated.
                match self.send(ctx, &iq) {
                    ErrorCode::Queued => ErrorCode::Success,
                    other => other,
                }
            }
            OperationType::PushCommand => {
                let Some(command) = self.transient_payload.clone() else {
                    return ErrorCode::BadRequest;
                };
                self.request_id = ctx.link.new_request_id();
                let iq = Iq::PushCommand(PushCommandIq {
                    request_id: self.request_id,
                    command,
                });
                self.send(ctx, &iq)
            }
            OperationType::UpdateDescriptorTimestamp => {
                let Some(OperationContent::Timestamp {
                    kind,
                    twincode,
                    sequence_id,
                    timestamp,
                }) = self.content.clone()
                else {
                    return ErrorCode::BadRequest;
                };
                self.request_id = ctx.link.new_request_id();
                let iq = Iq::UpdateDescriptorTimestamp(UpdateDescriptorTimestampIq {
                    request_id: self.request_id,
                    kind,
                    twincode,
                    sequence_id,
                    timestamp,
                });
                self.send(ctx, &iq)
            }
            OperationType::WithdrawInviteGroup => {
                let descriptor = match self.load_descriptor(ctx) {
                    Ok(descriptor) => descriptor,
                    Err(code) => return code,
                };
                let id = descriptor.envelope().id;
                self.request_id = ctx.link.new_request_id();
                let iq = Iq::RevokeInviteGroup(RevokeInviteGroupIq {
                    request_id: self.request_id,
                    twincode: id.twincode_outbound_id,
                    sequence_id: id.sequence_id,
                });
                self.send(ctx, &iq)
            }
            OperationType::JoinGroup => {
                let Some(OperationContent::JoinGroup {
                    group_id,
                    member_id,
                    permissions,
                    public_key,
                    secret,
                }) = self.content.clone()
                else {
                    return ErrorCode::BadRequest;
                };
                self.request_id = ctx.link.new_request_id();
                let iq = Iq::JoinGroup(JoinGroupIq {
                    request_id: self.request_id,
                    group_id,
                    member_id,
                    permissions,
                    public_key,
                    secret,
                });
                self.send(ctx, &iq)
            }
            OperationType::LeaveGroup => {
                let Some(OperationContent::LeaveGroup {
                    group_id,
                    member_id,
                }) = self.content.clone()
                else {
                    return ErrorCode::BadRequest;
                };
                self.request_id = ctx.link.new_request_id();
                let iq = Iq::LeaveGroup(LeaveGroupIq {
                    request_id: self.request_id,
                    group_id,
                    member_id,
                });
                self.send(ctx, &iq)
            }
            OperationType::UpdateGroupMember => {
                let Some(OperationContent::UpdateMember {
                    group_id,
                    member_id,
                    permissions,
                    signed_off,
                    signature,
                }) = self.content.clone()
                else {
                    return ErrorCode::BadRequest;
                };
                self.request_id = ctx.link.new_request_id();
                let iq = Iq::UpdateGroupMember(UpdateGroupMemberIq {
                    request_id: self.request_id,
                    group_id,
                    member_id,
                    permissions,
                    signed_off,
                    signature,
                });
                self.send(ctx, &iq)
            }
            OperationType::UpdateAnnotations => self.execute_update_annotations(ctx),
            OperationType::InvokeJoinGroup
            | OperationType::InvokeLeaveGroup
            | OperationType::InvokeAddMemberGroup => {
                // Server-brokered: nothing traverses the P2P link. The
                // server integration drains these through engine events.
                tracing::debug!(operation = self.id, kind = ?self.op_type, "server-brokered operation");
                ErrorCode::Success
            }
            OperationType::UpdateObject => {
                let Some(OperationContent::UpdateObject { update_flags }) = self.content else {
                    return ErrorCode::BadRequest;
                };
                let descriptor = match self.load_descriptor(ctx) {
                    Ok(descriptor) => descriptor,
                    Err(code) => return code,
                };
                let iq = Iq::UpdateDescriptor(UpdateDescriptorIq {
                    request_id: ctx.link.new_request_id(),
                    descriptor: (*descriptor).clone(),
                    update_flags,
                });
                // Acknowledged implicitly by the next IQ on the link.
                match self.send(ctx, &iq) {
                    ErrorCode::Queued => ErrorCode::Success,
                    other => other,
                }
            }
        }
    }

    fn execute_push(&mut self, ctx: &mut ExecuteContext<'_>) -> ErrorCode {
        let descriptor = match self.load_descriptor(ctx) {
            Ok(descriptor) => descriptor,
            Err(code) => return code,
        };
        self.request_id = ctx.link.new_request_id();
        let push = PushDescriptorIq {
            request_id: self.request_id,
            descriptor: (*descriptor).clone(),
        };
        let iq = match self.op_type {
            OperationType::PushGeolocation => Iq::PushGeolocation(push),
            OperationType::PushTwincode => Iq::PushTwincode(push),
            OperationType::InviteGroup => Iq::InviteGroup(push),
            _ => Iq::PushObject(push),
        };
        self.send(ctx, &iq)
    }

    fn execute_update_annotations(&mut self, ctx: &mut ExecuteContext<'_>) -> ErrorCode {
        let descriptor = match self.load_descriptor(ctx) {
            Ok(descriptor) => descriptor,
            Err(code) => return code,
        };
        let id = descriptor.envelope().id;
        let rows = match ctx.store.our_annotations(self.conversation_id, id.database_id) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(operation = self.id, error = %e, "annotation load failed");
                return ErrorCode::DatabaseError;
            }
        };
        self.request_id = ctx.link.new_request_id();
        let iq = Iq::UpdateAnnotations(UpdateAnnotationsIq {
            request_id: self.request_id,
            twincode: id.twincode_outbound_id,
            sequence_id: id.sequence_id,
            annotations: rows.iter().map(|a| (a.kind.code(), a.value)).collect(),
        });
        self.send(ctx, &iq)
    }

    fn execute_reset(&mut self, ctx: &mut ExecuteContext<'_>) -> ErrorCode {
        let Some(OperationContent::Reset {
            min_sequence_id,
            peer_bounds,
            reset_members,
            ..
        }) = self.content.clone()
        else {
            return ErrorCode::BadRequest;
        };
        self.request_id = ctx.link.new_request_id();
        let iq = Iq::ResetConversation(ResetConversationIq {
            request_id: self.request_id,
            min_sequence_id,
            peer_bounds,
            reset_members,
        });
        self.send(ctx, &iq)
    }

    fn execute_push_file(&mut self, ctx: &mut ExecuteContext<'_>) -> ErrorCode {
        // A missing files directory maps onto the peer-support error for
        // compatibility, even though nothing about the peer is wrong.
        let Some(files_dir) = ctx.link.files_dir() else {
            return ErrorCode::FeatureNotSupportedByPeer;
        };
        let descriptor = match self.load_descriptor(ctx) {
            Ok(descriptor) => descriptor,
            Err(code) => return code,
        };
        let Some(info) = descriptor.file_info().cloned() else {
            return ErrorCode::BadRequest;
        };
        let id = descriptor.envelope().id;

        if self.transfer.is_none() {
            self.transfer = Some(ChunkTransfer::new(info.length, self.chunk_start));
        }
        let best_chunk_size = ctx.link.best_chunk_size();
        let (needs_probe, durable_start, ready, (offset, size)) = match self.transfer.as_ref() {
            Some(transfer) => (
                transfer.needs_probe(),
                transfer.chunk_start,
                transfer.is_ready_to_send(),
                transfer.next_chunk(best_chunk_size),
            ),
            None => return ErrorCode::BadRequest,
        };

        if needs_probe {
            self.request_id = ctx.link.new_request_id();
            let iq = if durable_start == NOT_INITIALIZED {
                // First contact: announce the descriptor itself. Oversized
                // thumbnails travel ahead as dedicated chunk IQs.
                let mut announced = (*descriptor).clone();
                if let Some(file) = announced.file_info_mut() {
                    if let Some(thumbnail) = file.thumbnail.take() {
                        if thumbnail.len() > best_chunk_size * 2 {
                            if let Err(code) =
                                send_thumbnail(ctx, &id, &thumbnail, best_chunk_size)
                            {
                                self.request_id = NO_REQUEST_ID;
                                return code;
                            }
                        } else {
                            file.thumbnail = Some(thumbnail);
                        }
                    }
                }
                Iq::PushFile(PushFileIq {
                    request_id: self.request_id,
                    descriptor: announced,
                    chunk_start: NOT_INITIALIZED,
                })
            } else {
                // Reconnect: an empty chunk at the durable position
                // solicits the receiver's current offset.
                Iq::PushFileChunk(FileChunkIq {
                    request_id: self.request_id,
                    twincode: id.twincode_outbound_id,
                    sequence_id: id.sequence_id,
                    chunk_start: durable_start,
                    data: Vec::new(),
                })
            };
            return self.send(ctx, &iq);
        }

        if !ready || size == 0 {
            // Window full (or done); acknowledgements drive the next step.
            return ErrorCode::Queued;
        }
        let data = match read_file_chunk(&files_dir.join(&info.path), offset, size) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(operation = self.id, path = %info.path, "file blob gone");
                return ErrorCode::Expired;
            }
            Err(e) => {
                tracing::error!(operation = self.id, error = %e, "file read failed");
                return ErrorCode::BadRequest;
            }
        };

        self.request_id = ctx.link.new_request_id();
        let iq = Iq::PushFileChunk(FileChunkIq {
            request_id: self.request_id,
            twincode: id.twincode_outbound_id,
            sequence_id: id.sequence_id,
            chunk_start: offset,
            data,
        });
        let code = self.send(ctx, &iq);
        if code == ErrorCode::Queued {
            if let Some(transfer) = self.transfer.as_mut() {
                transfer.advance(size);
            }
        }
        code
    }
}

fn send_thumbnail(
    ctx: &ExecuteContext<'_>,
    id: &DescriptorId,
    thumbnail: &[u8],
    best_chunk_size: usize,
) -> Result<(), ErrorCode> {
    let step = (best_chunk_size * 2).min(colloquy_types::MAX_CHUNK_SIZE).max(1);
    let mut offset = 0usize;
    while offset < thumbnail.len() {
        let end = (offset + step).min(thumbnail.len());
        let iq = Iq::PushThumbnail(FileChunkIq {
            request_id: ctx.link.new_request_id(),
            twincode: id.twincode_outbound_id,
            sequence_id: id.sequence_id,
            chunk_start: offset as i64,
            data: thumbnail[offset..end].to_vec(),
        });
        ctx.link.send_packet(iq.encode())?;
        offset = end;
    }
    Ok(())
}

fn read_file_chunk(path: &std::path::Path, offset: i64, size: usize) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut data = vec![0u8; size];
    let mut filled = 0usize;
    while filled < size {
        let read = file.read(&mut data[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    data.truncate(filled);
    Ok(data)
}
