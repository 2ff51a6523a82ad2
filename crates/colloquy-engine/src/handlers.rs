//! Inbound IQ application and response correlation.
//!
//! Requests mutate the store and answer on the same link; responses are
//! matched to their in-flight operation by `(conversation, request_id)`
//! and advance or finish it. Both run on the engine's single-writer loop.

use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use uuid::Uuid;

use colloquy_db::{DateColumn, InsertOutcome};
use colloquy_model::{Conversation, Descriptor};
use colloquy_proto::chunk::ChunkAssembly;
use colloquy_proto::iq::{
    AckIq, FileChunkIq, Iq, OnFileChunkIq, OnPushFileIq, OnResultGroupIq, OnResultJoinIq,
    PushDescriptorIq, PushFileIq, ReceivedIq, ResetConversationIq, RosterEntry,
    UpdateAnnotationsIq, UpdateDescriptorIq, UpdateDescriptorTimestampIq,
};
use colloquy_proto::OperationContent;
use colloquy_types::{
    AnnotationKind, DatabaseId, DescriptorId, ErrorCode, GroupState, OperationType, TimestampKind,
    FLAG_UPDATED,
};

use crate::engine::{FileAssembly, Runtime};
use crate::events::EngineEvent;

/// Peer status code on a rejected group operation.
const GROUP_RESULT_REJECTED: i32 = 1;

impl Runtime {
    pub(crate) fn cmd_packet_received(&mut self, conversation: Uuid, bytes: Vec<u8>, now: i64) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            tracing::warn!(%conversation, "packet for unknown conversation dropped");
            return;
        };
        let iq = match Iq::decode(&bytes) {
            Ok(Some(iq)) => iq,
            Ok(None) => {
                tracing::debug!(
                    conversation = conversation.database_id,
                    "unknown frame dropped"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    conversation = conversation.database_id,
                    error = %e,
                    "malformed frame dropped"
                );
                return;
            }
        };
        if let Some(connection) = self.connections.get_mut(&conversation.database_id) {
            connection.last_activity = now;
        }
        if iq.is_response() {
            self.apply_response(&conversation, iq, now);
        } else {
            self.apply_request(&conversation, iq, now);
        }
    }

    fn respond(&self, conversation_id: DatabaseId, iq: &Iq) {
        let Some(connection) = self.connections.get(&conversation_id) else {
            return;
        };
        if let Err(code) = connection.link.send_packet(iq.encode()) {
            tracing::debug!(conversation = conversation_id, ?code, "response send failed");
        }
    }

    // =================================================================
    // Responses
    // =================================================================

    fn apply_response(&mut self, conversation: &Conversation, iq: Iq, now: i64) {
        let id = conversation.database_id;
        let request_id = iq.request_id();
        let Some(operation_id) = self
            .connections
            .get_mut(&id)
            .and_then(|connection| connection.pending_requests.remove(&request_id))
        else {
            tracing::debug!(conversation = id, request_id, "unmatched response dropped");
            return;
        };

        match iq {
            Iq::OnPushObject(response)
            | Iq::OnPushGeolocation(response)
            | Iq::OnPushTwincode(response) => {
                self.on_push_acknowledged(conversation, operation_id, response, now);
            }
            Iq::OnResetConversation(_) => {
                self.on_reset_acknowledged(conversation, operation_id, now);
            }
            Iq::OnPushFile(response) => {
                self.on_file_progress(
                    conversation,
                    operation_id,
                    response.received_timestamp,
                    response.next_chunk_start,
                    now,
                );
            }
            Iq::OnPushFileChunk(response) => {
                self.on_file_progress(conversation, operation_id, 0, response.next_chunk_start, now);
            }
            Iq::OnResultGroup(response) => {
                self.on_group_result(conversation, operation_id, response, now);
            }
            Iq::OnResultJoin(response) => {
                self.on_join_result(conversation, operation_id, response, now);
            }
            Iq::OnUpdateDescriptorTimestamp(_)
            | Iq::OnUpdateAnnotations(_)
            | Iq::OnPushCommand(_)
            | Iq::OnSynchronize(_) => {
                self.complete_and_pump(conversation, operation_id, now);
            }
            other => {
                tracing::debug!(conversation = id, packet = ?other.request_id(), "unexpected response");
            }
        }
    }

    fn complete_and_pump(&mut self, conversation: &Conversation, operation_id: DatabaseId, now: i64) {
        let id = conversation.database_id;
        let op_type = self
            .scheduler
            .find_by_id(id, operation_id)
            .map(|operation| operation.op_type);
        if let Some(op_type) = op_type {
            self.finish_operation(id, operation_id, op_type, now);
        }
        self.pump_operations(conversation, now);
    }

    fn on_push_acknowledged(
        &mut self,
        conversation: &Conversation,
        operation_id: DatabaseId,
        response: ReceivedIq,
        now: i64,
    ) {
        let id = conversation.database_id;
        let descriptor_id = self
            .scheduler
            .find_by_id(id, operation_id)
            .and_then(|operation| operation.descriptor_id);
        if let Some(descriptor_id) = descriptor_id {
            if let Err(e) = self.store.set_descriptor_date(
                descriptor_id,
                DateColumn::Send,
                response.received_timestamp,
            ) {
                self.database_error("send date", &e);
            }
            let content_id = self.content_conversation(conversation).database_id;
            self.events.emit(EngineEvent::DescriptorUpdated {
                conversation_id: content_id,
                descriptor_id: DescriptorId::new(descriptor_id, Uuid::nil(), 0),
            });
        }
        self.complete_and_pump(conversation, operation_id, now);
    }

    fn on_reset_acknowledged(
        &mut self,
        conversation: &Conversation,
        operation_id: DatabaseId,
        now: i64,
    ) {
        let id = conversation.database_id;
        let content = self
            .scheduler
            .find_by_id(id, operation_id)
            .and_then(|operation| operation.content.clone());
        if let Some(OperationContent::Reset {
            min_sequence_id,
            peer_bounds,
            keep_media,
            ..
        }) = content
        {
            let content_conversation = self.content_conversation(conversation);
            let mut bounds = vec![DescriptorId::remote(
                content_conversation.twincode_outbound,
                min_sequence_id,
            )];
            for (twincode, bound) in peer_bounds {
                bounds.push(DescriptorId::remote(twincode, bound));
            }
            match self
                .store
                .delete_descriptors(&content_conversation, &bounds, keep_media)
            {
                Ok(outcome) => {
                    self.scheduler.evict_ids(&outcome.operation_ids);
                    self.unlink_blobs(&outcome.file_paths);
                }
                Err(e) => self.database_error("reset apply", &e),
            }
        }
        self.complete_and_pump(conversation, operation_id, now);
    }

    fn on_file_progress(
        &mut self,
        conversation: &Conversation,
        operation_id: DatabaseId,
        received_timestamp: i64,
        next_chunk_start: i64,
        now: i64,
    ) {
        let id = conversation.database_id;
        let Some(operation) = self.scheduler.find_by_id(id, operation_id) else {
            return;
        };
        let descriptor_id = operation.descriptor_id;
        let Some(transfer) = operation.transfer.as_mut() else {
            return;
        };
        if received_timestamp > 0 {
            transfer.received_timestamp = received_timestamp;
        }
        transfer.acknowledge(next_chunk_start);
        let durable = transfer.chunk_start;
        let complete = transfer.is_complete();
        let sent_when_done = if transfer.received_timestamp > 0 {
            transfer.received_timestamp
        } else {
            now
        };
        let operation_row_id = operation.id;
        operation.chunk_start = durable;

        if operation_row_id > 0 {
            if let Err(e) = self.store.update_operation_chunk(operation_row_id, durable) {
                self.database_error("chunk progress", &e);
            }
        }
        if complete {
            if let Some(descriptor_id) = descriptor_id {
                if let Err(e) =
                    self.store
                        .set_descriptor_date(descriptor_id, DateColumn::Send, sent_when_done)
                {
                    self.database_error("file send date", &e);
                }
                self.events.emit(EngineEvent::DescriptorUpdated {
                    conversation_id: id,
                    descriptor_id: DescriptorId::new(descriptor_id, Uuid::nil(), 0),
                });
            }
            self.finish_operation(id, operation_id, OperationType::PushFile, now);
            self.pump_operations(conversation, now);
        } else {
            self.pump_file(conversation, operation_id, now);
        }
    }

    fn on_group_result(
        &mut self,
        conversation: &Conversation,
        operation_id: DatabaseId,
        response: OnResultGroupIq,
        now: i64,
    ) {
        let id = conversation.database_id;
        let operation = self.scheduler.find_by_id(id, operation_id);
        let (op_type, content) = match operation {
            Some(operation) => (operation.op_type, operation.content.clone()),
            None => return,
        };
        if response.status != 0 {
            self.drop_operation(id, operation_id, op_type, Some(ErrorCode::BadRequest));
            self.pump_operations(conversation, now);
            return;
        }
        match op_type {
            OperationType::LeaveGroup => {
                if let Some(OperationContent::LeaveGroup { group_id, .. }) = content {
                    self.on_leave_acknowledged(&group_id, conversation);
                }
            }
            OperationType::InviteGroup | OperationType::WithdrawInviteGroup => {
                let descriptor_id = self
                    .scheduler
                    .find_by_id(id, operation_id)
                    .and_then(|operation| operation.descriptor_id);
                if let Some(descriptor_id) = descriptor_id {
                    if let Err(e) =
                        self.store
                            .set_descriptor_date(descriptor_id, DateColumn::Send, now)
                    {
                        self.database_error("invite send date", &e);
                    }
                }
            }
            _ => {}
        }
        self.complete_and_pump(conversation, operation_id, now);
    }

    /// One member acknowledged our leave; when every member did, the
    /// group row flips to `Left`.
    fn on_leave_acknowledged(&mut self, group_twincode: &Uuid, member: &Conversation) {
        let group = match self.store.get_group_by_twincode(group_twincode) {
            Ok(Some(group)) => group,
            Ok(None) => return,
            Err(e) => {
                self.database_error("leave lookup", &e);
                return;
            }
        };
        let Some(member_twincode) = member.peer_twincode_outbound else {
            return;
        };
        self.events.emit(EngineEvent::GroupLeft {
            group_id: group.database_id,
            member: member_twincode,
        });
        let members = match self.store.group_members(group.database_id) {
            Ok(members) => members,
            Err(e) => {
                self.database_error("leave roster", &e);
                return;
            }
        };
        let still_waiting = members.iter().any(|other| {
            other.database_id != member.database_id && self.scheduler.has_pending(other.database_id)
        });
        if !still_waiting {
            if let Err(e) = self.store.set_group_state(group.database_id, GroupState::Left) {
                self.database_error("leave state", &e);
            }
            self.conversations.remove(&group.database_id);
        }
    }

    fn on_join_result(
        &mut self,
        conversation: &Conversation,
        operation_id: DatabaseId,
        response: OnResultJoinIq,
        now: i64,
    ) {
        let id = conversation.database_id;
        let content = self
            .scheduler
            .find_by_id(id, operation_id)
            .and_then(|operation| operation.content.clone());
        if let Some(OperationContent::JoinGroup {
            group_id,
            member_id: our_member,
            ..
        }) = content
        {
            match self.store.get_group_by_twincode(&group_id) {
                Ok(Some(group)) => {
                    let mut roster = Vec::with_capacity(response.members.len());
                    for entry in &response.members {
                        if entry.member_id == our_member {
                            // Our own roster slot is not a peer row.
                            roster.push((entry.member_id, entry.permissions as u64));
                            continue;
                        }
                        match self.store.create_group_member(
                            &group,
                            entry.member_id,
                            entry.permissions as u64,
                            None,
                            now,
                        ) {
                            Ok(Some(_)) => roster.push((entry.member_id, entry.permissions as u64)),
                            Ok(None) => {
                                tracing::warn!(group = group.database_id, "roster overflow")
                            }
                            Err(e) => self.database_error("roster member", &e),
                        }
                    }
                    if let Err(e) = self
                        .store
                        .set_group_state(group.database_id, GroupState::Joined)
                    {
                        self.database_error("join state", &e);
                    }
                    self.conversations.remove(&group.database_id);
                    self.events.emit(EngineEvent::GroupJoined {
                        group_id: group.database_id,
                        members: roster,
                    });
                }
                Ok(None) => tracing::warn!(%group_id, "join result for unknown group"),
                Err(e) => self.database_error("join lookup", &e),
            }
        }
        self.complete_and_pump(conversation, operation_id, now);
    }

    // =================================================================
    // Requests
    // =================================================================

    fn apply_request(&mut self, conversation: &Conversation, iq: Iq, now: i64) {
        match iq {
            Iq::PushObject(push) => self.on_push_descriptor(conversation, push, PushKind::Object, now),
            Iq::PushGeolocation(push) => {
                self.on_push_descriptor(conversation, push, PushKind::Geolocation, now)
            }
            Iq::PushTwincode(push) => {
                self.on_push_descriptor(conversation, push, PushKind::Twincode, now)
            }
            Iq::InviteGroup(push) => self.on_invite_group(conversation, push, now),
            Iq::PushFile(push) => self.on_push_file(conversation, push, now),
            Iq::PushFileChunk(chunk) => self.on_push_file_chunk(conversation, chunk, now),
            Iq::PushThumbnail(chunk) => self.on_push_thumbnail(conversation, chunk),
            Iq::PushCommand(command) => {
                self.respond(
                    conversation.database_id,
                    &Iq::OnPushCommand(AckIq {
                        request_id: command.request_id,
                    }),
                );
                self.events.emit(EngineEvent::CommandReceived {
                    conversation_id: conversation.database_id,
                    payload: command.command,
                });
            }
            Iq::PushTransientObject(push) => {
                // Fire-and-forget by contract; nothing is answered.
                self.events.emit(EngineEvent::TransientReceived {
                    conversation_id: conversation.database_id,
                    payload: push.payload,
                });
            }
            Iq::ResetConversation(reset) => self.on_reset_request(conversation, reset, now),
            Iq::UpdateDescriptorTimestamp(update) => {
                self.on_timestamp_request(conversation, update, now)
            }
            Iq::UpdateDescriptor(update) => self.on_update_descriptor(conversation, update, now),
            Iq::UpdateAnnotations(update) => self.on_update_annotations(conversation, update, now),
            Iq::RevokeInviteGroup(revoke) => {
                self.on_revoke_invite(conversation, revoke.request_id, revoke.twincode, revoke.sequence_id, now)
            }
            Iq::JoinGroup(join) => self.on_join_request(conversation, join, now),
            Iq::LeaveGroup(leave) => self.on_leave_request(conversation, leave, now),
            Iq::UpdateGroupMember(update) => self.on_update_member_request(conversation, update, now),
            Iq::Synchronize(synchronize) => {
                self.respond(
                    conversation.database_id,
                    &Iq::OnSynchronize(AckIq {
                        request_id: synchronize.request_id,
                    }),
                );
                // The peer is reconciling; push anything we have queued.
                self.run_operations(conversation.database_id, now);
            }
            other => {
                tracing::debug!(request_id = other.request_id(), "request not handled");
            }
        }
    }

    /// Clamp peer dates, stamp reception, and store under the content row
    /// (the group row for member links). Returns the stored descriptor,
    /// whether it was fresh, and the content conversation id.
    fn store_received(
        &mut self,
        conversation: &Conversation,
        mut descriptor: Descriptor,
        now: i64,
    ) -> Option<(std::sync::Arc<Descriptor>, bool, DatabaseId)> {
        let content_conversation = self.content_conversation(conversation);
        let envelope = descriptor.envelope_mut();
        envelope.clamp_peer_dates(now);
        envelope.receive_date = now;
        match self
            .store
            .insert_or_update_descriptor(&content_conversation, descriptor)
        {
            Ok(InsertOutcome::Stored(stored)) => {
                Some((stored, true, content_conversation.database_id))
            }
            Ok(InsertOutcome::Updated(stored)) => {
                Some((stored, false, content_conversation.database_id))
            }
            Err(e) => {
                self.database_error("descriptor store", &e);
                None
            }
        }
    }

    fn on_push_descriptor(
        &mut self,
        conversation: &Conversation,
        push: PushDescriptorIq,
        kind: PushKind,
        now: i64,
    ) {
        let Some((stored, fresh, content_id)) =
            self.store_received(conversation, push.descriptor, now)
        else {
            return;
        };
        let response = ReceivedIq {
            request_id: push.request_id,
            received_timestamp: now,
        };
        let response = match kind {
            PushKind::Object => Iq::OnPushObject(response),
            PushKind::Geolocation => Iq::OnPushGeolocation(response),
            PushKind::Twincode => Iq::OnPushTwincode(response),
        };
        self.respond(conversation.database_id, &response);
        let event = if fresh {
            EngineEvent::DescriptorReceived {
                conversation_id: content_id,
                descriptor_id: stored.envelope().id,
            }
        } else {
            EngineEvent::DescriptorUpdated {
                conversation_id: content_id,
                descriptor_id: stored.envelope().id,
            }
        };
        self.events.emit(event);

        // A clear marker also applies the peer-side deletion it records.
        if let Descriptor::Clear(clear) = stored.as_ref() {
            if let Some(content_conversation) = self.conversation_by_id(content_id) {
                match self.store.mark_descriptor_deleted(
                    &content_conversation,
                    clear.cleared_timestamp,
                    now,
                    false,
                ) {
                    Ok(removed) => {
                        for descriptor_id in removed {
                            self.events.emit(EngineEvent::DescriptorDeleted {
                                conversation_id: content_id,
                                descriptor_id,
                                peer_initiated: true,
                            });
                        }
                    }
                    Err(e) => self.database_error("clear apply", &e),
                }
            }
        }
    }

    fn on_invite_group(&mut self, conversation: &Conversation, push: PushDescriptorIq, now: i64) {
        let invitation = match &push.descriptor {
            Descriptor::Invitation(invitation) => invitation.clone(),
            _ => {
                tracing::warn!("invite frame without invitation descriptor");
                return;
            }
        };
        let Some((stored, fresh, _)) = self.store_received(conversation, push.descriptor, now)
        else {
            return;
        };
        // Materialize the invited group so the join can target it.
        let group = match self.store.create_group_conversation(
            invitation.group_twincode,
            invitation.group_twincode,
            conversation.resource_id,
            false,
            now,
        ) {
            Ok(group) => group,
            Err(e) => {
                self.database_error("invited group", &e);
                return;
            }
        };
        if fresh {
            if let Err(e) = self.store.link_invitation(
                stored.envelope().id.database_id,
                group.database_id,
                invitation.inviter,
            ) {
                self.database_error("invitation link", &e);
            }
        }
        self.respond(
            conversation.database_id,
            &Iq::OnResultGroup(OnResultGroupIq {
                request_id: push.request_id,
                status: 0,
            }),
        );
        self.events.emit(EngineEvent::GroupInvited {
            conversation_id: conversation.database_id,
            descriptor_id: stored.envelope().id,
        });
    }

    fn incoming_blob_path(descriptor: &Descriptor) -> String {
        let id = descriptor.envelope().id;
        let extension = descriptor
            .file_info()
            .and_then(|info| info.extension.clone())
            .unwrap_or_else(|| "bin".to_string());
        format!(
            "incoming/{}-{}.{}",
            id.twincode_outbound_id.simple(),
            id.sequence_id,
            extension
        )
    }

    fn files_dir_for(&self, conversation_id: DatabaseId) -> Option<PathBuf> {
        if let Some(dir) = self.config.files_dir() {
            return Some(dir);
        }
        self.connections
            .get(&conversation_id)?
            .link
            .files_dir()
    }

    fn on_push_file(&mut self, conversation: &Conversation, push: PushFileIq, now: i64) {
        let id = conversation.database_id;
        let key = {
            let descriptor_id = push.descriptor.envelope().id;
            (descriptor_id.twincode_outbound_id, descriptor_id.sequence_id)
        };
        let mut descriptor = push.descriptor;
        let length = descriptor.file_info().map_or(0, |info| info.length);
        let relative_path = Self::incoming_blob_path(&descriptor);

        // A thumbnail that travelled ahead re-attaches here.
        let buffered_thumbnail = self
            .connections
            .get_mut(&id)
            .and_then(|connection| connection.thumbnails.remove(&key));
        if let Some(info) = descriptor.file_info_mut() {
            info.path = relative_path.clone();
            if info.thumbnail.is_none() {
                info.thumbnail = buffered_thumbnail;
            }
        }

        let Some((stored, fresh, content_id)) = self.store_received(conversation, descriptor, now)
        else {
            return;
        };

        // Resume point: bytes already materialized on disk.
        let mut next_chunk_start = 0i64;
        if let Some(files_dir) = self.files_dir_for(id) {
            let absolute = files_dir.join(&relative_path);
            if let Some(parent) = absolute.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!(error = %e, "cannot prepare files directory");
                }
            }
            next_chunk_start = std::fs::metadata(&absolute).map_or(0, |meta| meta.len() as i64);
            let mut assembly = ChunkAssembly::new(length);
            assembly.next_chunk_start = next_chunk_start;
            if let Some(connection) = self.connections.get_mut(&id) {
                connection.assemblies.insert(
                    key,
                    FileAssembly {
                        assembly,
                        descriptor_db_id: stored.envelope().id.database_id,
                        path: absolute,
                    },
                );
            }
        }

        self.respond(
            id,
            &Iq::OnPushFile(OnPushFileIq {
                request_id: push.request_id,
                received_timestamp: now,
                next_chunk_start,
            }),
        );
        let event = if fresh {
            EngineEvent::DescriptorReceived {
                conversation_id: content_id,
                descriptor_id: stored.envelope().id,
            }
        } else {
            EngineEvent::DescriptorUpdated {
                conversation_id: content_id,
                descriptor_id: stored.envelope().id,
            }
        };
        self.events.emit(event);
    }

    fn on_push_file_chunk(&mut self, conversation: &Conversation, chunk: FileChunkIq, now: i64) {
        let id = conversation.database_id;
        let key = (chunk.twincode, chunk.sequence_id);

        // Rebuild assembly state after a restart.
        if self
            .connections
            .get(&id)
            .is_some_and(|connection| !connection.assemblies.contains_key(&key))
        {
            self.rebuild_assembly(conversation, key);
        }

        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        let Some(entry) = connection.assemblies.get_mut(&key) else {
            tracing::debug!(conversation = id, "chunk for unknown transfer dropped");
            return;
        };

        if !chunk.data.is_empty() {
            if let Some(offset) = entry.assembly.accept(chunk.chunk_start, chunk.data.len()) {
                if let Err(e) = write_blob_chunk(&entry.path, offset, &chunk.data) {
                    tracing::error!(error = %e, "blob write failed");
                }
            }
        }
        let next_chunk_start = entry.assembly.next_chunk_start;
        let complete = entry.assembly.is_complete();
        let descriptor_db_id = entry.descriptor_db_id;
        if complete {
            connection.assemblies.remove(&key);
        }

        self.respond(
            id,
            &Iq::OnPushFileChunk(OnFileChunkIq {
                request_id: chunk.request_id,
                next_chunk_start,
            }),
        );
        if complete {
            self.events.emit(EngineEvent::DescriptorUpdated {
                conversation_id: id,
                descriptor_id: DescriptorId::new(descriptor_db_id, Uuid::nil(), 0),
            });
            let _ = now;
        }
    }

    fn rebuild_assembly(&mut self, conversation: &Conversation, key: (Uuid, i64)) {
        let id = conversation.database_id;
        let content_id = self.content_conversation(conversation).database_id;
        let loaded = match self
            .store
            .load_descriptor(content_id, &DescriptorId::remote(key.0, key.1))
        {
            Ok(Some(loaded)) => loaded,
            _ => return,
        };
        let Some(info) = loaded.file_info() else {
            return;
        };
        let Some(files_dir) = self.files_dir_for(id) else {
            return;
        };
        let absolute = files_dir.join(&info.path);
        let existing = std::fs::metadata(&absolute).map_or(0, |meta| meta.len() as i64);
        let mut assembly = ChunkAssembly::new(info.length);
        assembly.next_chunk_start = existing;
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.assemblies.insert(
                key,
                FileAssembly {
                    assembly,
                    descriptor_db_id: loaded.envelope().id.database_id,
                    path: absolute,
                },
            );
        }
    }

    fn on_push_thumbnail(&mut self, conversation: &Conversation, chunk: FileChunkIq) {
        let key = (chunk.twincode, chunk.sequence_id);
        let Some(connection) = self.connections.get_mut(&conversation.database_id) else {
            return;
        };
        let buffer = connection.thumbnails.entry(key).or_default();
        if buffer.len() as i64 == chunk.chunk_start {
            buffer.extend_from_slice(&chunk.data);
        } else {
            tracing::debug!(
                expected = buffer.len(),
                got = chunk.chunk_start,
                "out-of-order thumbnail chunk dropped"
            );
        }
    }

    fn on_reset_request(
        &mut self,
        conversation: &Conversation,
        reset: ResetConversationIq,
        now: i64,
    ) {
        let Some(peer) = conversation.peer_twincode_outbound else {
            return;
        };
        let content_conversation = self.content_conversation(conversation);
        let mut bounds = vec![DescriptorId::remote(peer, reset.min_sequence_id)];
        for (twincode, bound) in &reset.peer_bounds {
            bounds.push(DescriptorId::remote(*twincode, *bound));
        }
        match self
            .store
            .delete_descriptors(&content_conversation, &bounds, false)
        {
            Ok(outcome) => {
                self.scheduler.evict_ids(&outcome.operation_ids);
                self.unlink_blobs(&outcome.file_paths);
            }
            Err(e) => self.database_error("reset request", &e),
        }
        let _ = now;
        self.respond(
            conversation.database_id,
            &Iq::OnResetConversation(AckIq {
                request_id: reset.request_id,
            }),
        );
    }

    fn on_timestamp_request(
        &mut self,
        conversation: &Conversation,
        update: UpdateDescriptorTimestampIq,
        now: i64,
    ) {
        let id = conversation.database_id;
        let content_id = self.content_conversation(conversation).database_id;
        let loaded = match self.store.load_descriptor(
            content_id,
            &DescriptorId::remote(update.twincode, update.sequence_id),
        ) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                // Already gone locally; still acknowledge.
                self.respond(
                    id,
                    &Iq::OnUpdateDescriptorTimestamp(AckIq {
                        request_id: update.request_id,
                    }),
                );
                return;
            }
            Err(e) => {
                self.database_error("timestamp request", &e);
                return;
            }
        };
        let descriptor_id = loaded.envelope().id;
        match update.kind {
            TimestampKind::Read => {
                if let Err(e) = self.store.set_descriptor_date(
                    descriptor_id.database_id,
                    DateColumn::Read,
                    update.timestamp,
                ) {
                    self.database_error("read date", &e);
                }
                self.events.emit(EngineEvent::DescriptorUpdated {
                    conversation_id: content_id,
                    descriptor_id,
                });
            }
            TimestampKind::Delete | TimestampKind::PeerDelete => {
                if loaded.envelope().delete_date > 0 {
                    // Both sides are done with it now.
                    match self.store.delete_descriptor_row(descriptor_id.database_id) {
                        Ok(operation_ids) => {
                            self.scheduler.evict_ids(&operation_ids);
                            self.events.emit(EngineEvent::DescriptorDeleted {
                                conversation_id: content_id,
                                descriptor_id,
                                peer_initiated: true,
                            });
                        }
                        Err(e) => self.database_error("peer delete", &e),
                    }
                } else {
                    if let Err(e) = self.store.set_descriptor_date(
                        descriptor_id.database_id,
                        DateColumn::PeerDelete,
                        update.timestamp,
                    ) {
                        self.database_error("peer delete date", &e);
                    }
                    self.events.emit(EngineEvent::DescriptorUpdated {
                        conversation_id: content_id,
                        descriptor_id,
                    });
                }
            }
        }
        let _ = now;
        self.respond(
            id,
            &Iq::OnUpdateDescriptorTimestamp(AckIq {
                request_id: update.request_id,
            }),
        );
    }

    fn on_update_descriptor(
        &mut self,
        conversation: &Conversation,
        update: UpdateDescriptorIq,
        now: i64,
    ) {
        let mut descriptor = update.descriptor;
        descriptor.envelope_mut().update_date = now;
        descriptor.envelope_mut().set_flag(FLAG_UPDATED, true);
        let Some((stored, _, content_id)) = self.store_received(conversation, descriptor, now)
        else {
            return;
        };
        // Acknowledged implicitly by the next IQ; no response frame.
        self.events.emit(EngineEvent::DescriptorUpdated {
            conversation_id: content_id,
            descriptor_id: stored.envelope().id,
        });
    }

    fn on_update_annotations(
        &mut self,
        conversation: &Conversation,
        update: UpdateAnnotationsIq,
        now: i64,
    ) {
        let id = conversation.database_id;
        let Some(peer) = conversation.peer_twincode_outbound else {
            return;
        };
        let content_id = self.content_conversation(conversation).database_id;
        let loaded = match self.store.load_descriptor(
            content_id,
            &DescriptorId::remote(update.twincode, update.sequence_id),
        ) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                self.respond(
                    id,
                    &Iq::OnUpdateAnnotations(AckIq {
                        request_id: update.request_id,
                    }),
                );
                return;
            }
            Err(e) => {
                self.database_error("annotation request", &e);
                return;
            }
        };
        let rows: Vec<(AnnotationKind, i64)> = update
            .annotations
            .iter()
            .filter_map(|(kind, value)| Some((AnnotationKind::from_code(*kind)?, *value)))
            .collect();
        let descriptor_id = loaded.envelope().id;
        if let Err(e) = self.store.apply_peer_annotations(
            content_id,
            descriptor_id.database_id,
            &peer,
            &rows,
            now,
        ) {
            self.database_error("annotation apply", &e);
        }
        self.respond(
            id,
            &Iq::OnUpdateAnnotations(AckIq {
                request_id: update.request_id,
            }),
        );
        self.events.emit(EngineEvent::DescriptorUpdated {
            conversation_id: content_id,
            descriptor_id,
        });
    }

    fn on_revoke_invite(
        &mut self,
        conversation: &Conversation,
        request_id: i64,
        twincode: Uuid,
        sequence_id: i64,
        now: i64,
    ) {
        let id = conversation.database_id;
        let content_id = self.content_conversation(conversation).database_id;
        let loaded = match self
            .store
            .load_descriptor(content_id, &DescriptorId::remote(twincode, sequence_id))
        {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                self.respond(id, &Iq::OnResultGroup(OnResultGroupIq { request_id, status: 0 }));
                return;
            }
            Err(e) => {
                self.database_error("revoke lookup", &e);
                return;
            }
        };
        if let Descriptor::Invitation(invitation) = (*loaded).clone() {
            let mut updated = invitation;
            if updated.can_transition(colloquy_types::InvitationStatus::Withdrawn) {
                updated.status = colloquy_types::InvitationStatus::Withdrawn;
                let descriptor_id = updated.envelope.id;
                match self.store.update_descriptor(Descriptor::Invitation(updated)) {
                    Ok(_) => {
                        self.events.emit(EngineEvent::DescriptorUpdated {
                            conversation_id: content_id,
                            descriptor_id,
                        });
                    }
                    Err(e) => self.database_error("revoke write", &e),
                }
            }
        }
        let _ = now;
        self.respond(id, &Iq::OnResultGroup(OnResultGroupIq { request_id, status: 0 }));
    }

    fn on_join_request(
        &mut self,
        conversation: &Conversation,
        join: colloquy_proto::iq::JoinGroupIq,
        now: i64,
    ) {
        let id = conversation.database_id;
        let group = match self.store.get_group_by_twincode(&join.group_id) {
            Ok(Some(group)) => group,
            Ok(None) => {
                self.respond(
                    id,
                    &Iq::OnResultGroup(OnResultGroupIq {
                        request_id: join.request_id,
                        status: GROUP_RESULT_REJECTED,
                    }),
                );
                return;
            }
            Err(e) => {
                self.database_error("join lookup", &e);
                return;
            }
        };
        let created = match self.store.create_group_member(
            &group,
            join.member_id,
            join.permissions as u64,
            None,
            now,
        ) {
            Ok(created) => created,
            Err(e) => {
                self.database_error("join member", &e);
                return;
            }
        };
        if created.is_none() {
            self.respond(
                id,
                &Iq::OnResultGroup(OnResultGroupIq {
                    request_id: join.request_id,
                    status: GROUP_RESULT_REJECTED,
                }),
            );
            return;
        }
        let members = match self.store.group_members(group.database_id) {
            Ok(members) => members,
            Err(e) => {
                self.database_error("join roster", &e);
                return;
            }
        };
        let roster: Vec<RosterEntry> = members
            .iter()
            .filter_map(|member| {
                Some(RosterEntry {
                    member_id: member.peer_twincode_outbound?,
                    permissions: member.permissions as i64,
                })
            })
            .collect();
        self.respond(
            id,
            &Iq::OnResultJoin(OnResultJoinIq {
                request_id: join.request_id,
                members: roster.clone(),
            }),
        );
        self.events.emit(EngineEvent::GroupJoined {
            group_id: group.database_id,
            members: roster
                .iter()
                .map(|entry| (entry.member_id, entry.permissions as u64))
                .collect(),
        });
    }

    fn on_leave_request(
        &mut self,
        conversation: &Conversation,
        leave: colloquy_proto::iq::LeaveGroupIq,
        now: i64,
    ) {
        let id = conversation.database_id;
        let group = match self.store.get_group_by_twincode(&leave.group_id) {
            Ok(Some(group)) => group,
            Ok(None) => {
                self.respond(
                    id,
                    &Iq::OnResultGroup(OnResultGroupIq {
                        request_id: leave.request_id,
                        status: GROUP_RESULT_REJECTED,
                    }),
                );
                return;
            }
            Err(e) => {
                self.database_error("leave lookup", &e);
                return;
            }
        };
        let members = match self.store.group_members(group.database_id) {
            Ok(members) => members,
            Err(e) => {
                self.database_error("leave roster", &e);
                return;
            }
        };
        for member in members {
            if member.peer_twincode_outbound == Some(leave.member_id) {
                if let Err(e) = self.store.set_group_state(member.database_id, GroupState::Left) {
                    self.database_error("leave member", &e);
                }
                self.conversations.remove(&member.database_id);
            }
        }
        let _ = now;
        self.respond(
            id,
            &Iq::OnResultGroup(OnResultGroupIq {
                request_id: leave.request_id,
                status: 0,
            }),
        );
        self.events.emit(EngineEvent::GroupLeft {
            group_id: group.database_id,
            member: leave.member_id,
        });
    }

    fn on_update_member_request(
        &mut self,
        conversation: &Conversation,
        update: colloquy_proto::iq::UpdateGroupMemberIq,
        _now: i64,
    ) {
        let id = conversation.database_id;
        let group = match self.store.get_group_by_twincode(&update.group_id) {
            Ok(Some(group)) => group,
            Ok(None) => {
                self.respond(
                    id,
                    &Iq::OnResultGroup(OnResultGroupIq {
                        request_id: update.request_id,
                        status: GROUP_RESULT_REJECTED,
                    }),
                );
                return;
            }
            Err(e) => {
                self.database_error("member lookup", &e);
                return;
            }
        };
        let members = match self.store.group_members(group.database_id) {
            Ok(members) => members,
            Err(e) => {
                self.database_error("member roster", &e);
                return;
            }
        };
        for member in members {
            if member.peer_twincode_outbound == Some(update.member_id) {
                if let Err(e) = self
                    .store
                    .update_member_permissions(member.database_id, update.permissions as u64)
                {
                    self.database_error("member permissions", &e);
                }
                self.conversations.remove(&member.database_id);
            }
        }
        self.respond(
            id,
            &Iq::OnResultGroup(OnResultGroupIq {
                request_id: update.request_id,
                status: 0,
            }),
        );
    }

    /// Unlink deleted file blobs from the files directory.
    pub(crate) fn unlink_blobs(&self, paths: &[String]) {
        let Some(files_dir) = self.config.files_dir().or_else(|| {
            self.connections
                .values()
                .find_map(|connection| connection.link.files_dir())
        }) else {
            return;
        };
        for path in paths {
            let absolute = files_dir.join(path);
            match std::fs::remove_file(&absolute) {
                Ok(()) => tracing::debug!(path = %absolute.display(), "blob unlinked"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %absolute.display(), error = %e, "blob unlink failed"),
            }
        }
    }
}

/// Which push family a descriptor arrived under.
enum PushKind {
    Object,
    Geolocation,
    Twincode,
}

fn write_blob_chunk(path: &std::path::Path, offset: i64, data: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(offset as u64))?;
    file.write_all(data)
}
