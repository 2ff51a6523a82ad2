//! Transactional store facade.
//!
//! Wraps the per-table query modules into the multi-table contracts the
//! engine relies on: conversation/group creation, transactional descriptor
//! allocation, reset and media purges that drop dependent operations in the
//! same transaction, and the startup operation sweep.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use uuid::Uuid;

use colloquy_model::{Annotation, AnnotationSummary, Conversation, Descriptor};
use colloquy_types::{
    DatabaseId, DescriptorId, DescriptorType, GroupState, OperationType, DEFAULT_PERMISSIONS,
    MAX_GROUP_MEMBERS, OPERATION_MAX_AGE_MS,
};

use crate::cache::DescriptorCache;
use crate::queries::descriptors::{CallsMode, DateColumn};
use crate::queries::{annotations, conversations, descriptors, invitations, operations};
use crate::{DbError, Result};

/// Descriptor types retained by a media-keeping purge.
const KEEP_MEDIA_TYPES: [DescriptorType; 5] = [
    DescriptorType::Object,
    DescriptorType::Image,
    DescriptorType::Video,
    DescriptorType::Invitation,
    DescriptorType::Twincode,
];

/// Result of applying a received descriptor.
pub enum InsertOutcome {
    /// The descriptor was new and stored.
    Stored(Arc<Descriptor>),
    /// A row with the same identity existed and was refreshed.
    Updated(Arc<Descriptor>),
}

/// Result of a reset-style bulk delete.
#[derive(Debug, Default)]
pub struct ResetOutcome {
    /// Operations that referenced deleted descriptors; already removed
    /// from the table, returned so the scheduler can evict them.
    pub operation_ids: Vec<DatabaseId>,
    /// Blob paths of deleted file descriptors, for the caller to unlink.
    pub file_paths: Vec<String>,
}

/// Classification produced by a media purge.
#[derive(Debug, Default)]
pub struct MediaDeleteOutcome {
    /// Gone on both sides; rows removed, blobs ready to unlink.
    pub deletable: Vec<DescriptorId>,
    /// Ours; the peer still holds a copy and needs a delete notice.
    pub ours_needing_peer_delete: Vec<DescriptorId>,
    /// The peer's; it expects an acknowledgement of our removal.
    pub peers_to_acknowledge: Vec<DescriptorId>,
}

/// The persistence facade owned by the engine's run loop.
pub struct Store {
    conn: Connection,
    cache: DescriptorCache,
}

impl Store {
    /// Wrap an already opened and migrated connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            cache: DescriptorCache::new(),
        }
    }

    /// Open, migrate and wrap the database at `path`.
    pub fn open(path: &Path, subject_peers: &dyn Fn(Uuid) -> Option<Uuid>) -> Result<Self> {
        Ok(Self::new(crate::open(path, subject_peers)?))
    }

    /// In-memory store for tests.
    pub fn open_memory() -> Result<Self> {
        Ok(Self::new(crate::open_memory()?))
    }

    /// Raw connection, for read paths.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The descriptor cache.
    pub fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    // -----------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------

    /// Find or create the contact conversation for a subject.
    pub fn create_conversation(
        &mut self,
        subject: Uuid,
        our_twincode: Uuid,
        peer_twincode: Uuid,
        resource_id: Uuid,
        now: i64,
    ) -> Result<Conversation> {
        if let Some(existing) = conversations::get_contact_by_subject(&self.conn, &subject)? {
            return Ok(existing);
        }
        let mut conversation = Conversation {
            database_id: 0,
            group_id: None,
            uuid: Uuid::new_v4(),
            creation_date: now,
            subject,
            invited_contact: None,
            peer_twincode_outbound: Some(peer_twincode),
            twincode_outbound: our_twincode,
            resource_id,
            peer_resource_id: None,
            permissions: DEFAULT_PERMISSIONS,
            join_permissions: 0,
            state: None,
            next_sequence_id: 1,
            last_connect_date: None,
            last_retry_date: None,
            flags: 0,
        };
        conversation.database_id = conversations::insert(&self.conn, &conversation)?;
        tracing::debug!(id = conversation.database_id, %subject, "created contact conversation");
        Ok(conversation)
    }

    /// Find or create the group conversation for a subject.
    pub fn create_group_conversation(
        &mut self,
        subject: Uuid,
        group_twincode: Uuid,
        resource_id: Uuid,
        owner: bool,
        now: i64,
    ) -> Result<Conversation> {
        if let Some(existing) = conversations::get_group_by_subject(&self.conn, &subject)? {
            return Ok(existing);
        }
        let tx = self.conn.transaction()?;
        let mut group = Conversation {
            database_id: 0,
            group_id: None,
            uuid: Uuid::new_v4(),
            creation_date: now,
            subject,
            invited_contact: None,
            peer_twincode_outbound: None,
            twincode_outbound: group_twincode,
            resource_id,
            peer_resource_id: None,
            permissions: DEFAULT_PERMISSIONS,
            join_permissions: DEFAULT_PERMISSIONS,
            state: Some(if owner {
                GroupState::Joined
            } else {
                GroupState::Invited
            }),
            next_sequence_id: 1,
            last_connect_date: None,
            last_retry_date: None,
            flags: 0,
        };
        group.database_id = conversations::insert(&tx, &group)?;
        conversations::set_group_id(&tx, group.database_id, group.database_id)?;
        group.group_id = Some(group.database_id);
        tx.commit()?;
        tracing::debug!(id = group.database_id, %subject, owner, "created group conversation");
        Ok(group)
    }

    /// Find or create a member row of a group.
    ///
    /// An existing member gets its permissions refreshed. Returns `None`
    /// without touching the database when active members plus pending
    /// invitations already reach the group-size bound.
    pub fn create_group_member(
        &mut self,
        group: &Conversation,
        member_twincode: Uuid,
        permissions: u64,
        invited_contact: Option<Uuid>,
        now: i64,
    ) -> Result<Option<Conversation>> {
        if !group.is_group() {
            return Err(DbError::Constraint(format!(
                "conversation {} is not a group",
                group.database_id
            )));
        }
        if let Some(mut existing) =
            conversations::get_member(&self.conn, group.database_id, &member_twincode)?
        {
            conversations::update_permissions(&self.conn, existing.database_id, permissions)?;
            existing.permissions = permissions;
            return Ok(Some(existing));
        }
        let occupancy = conversations::count_members_and_invitations(&self.conn, group.database_id)?;
        if occupancy as usize >= MAX_GROUP_MEMBERS {
            tracing::warn!(
                group = group.database_id,
                occupancy,
                "group member rejected, group is full"
            );
            return Ok(None);
        }
        let mut member = Conversation {
            database_id: 0,
            group_id: Some(group.database_id),
            uuid: Uuid::new_v4(),
            creation_date: now,
            subject: group.subject,
            invited_contact,
            peer_twincode_outbound: Some(member_twincode),
            twincode_outbound: group.twincode_outbound,
            resource_id: group.resource_id,
            peer_resource_id: None,
            permissions,
            join_permissions: 0,
            state: Some(GroupState::Joined),
            next_sequence_id: 1,
            last_connect_date: None,
            last_retry_date: None,
            flags: 0,
        };
        member.database_id = conversations::insert(&self.conn, &member)?;
        Ok(Some(member))
    }

    /// Load one conversation by row id.
    pub fn get_conversation(&self, id: DatabaseId) -> Result<Option<Conversation>> {
        conversations::get_by_id(&self.conn, id)
    }

    /// Load one conversation by stable identifier.
    pub fn get_conversation_by_uuid(&self, uuid: &Uuid) -> Result<Option<Conversation>> {
        conversations::get_by_uuid(&self.conn, uuid)
    }

    /// Find the group conversation carrying a group twincode.
    pub fn get_group_by_twincode(&self, group_twincode: &Uuid) -> Result<Option<Conversation>> {
        conversations::get_group_by_twincode(&self.conn, group_twincode)
    }

    /// Member rows of a group.
    pub fn group_members(&self, group_id: DatabaseId) -> Result<Vec<Conversation>> {
        conversations::list_members(&self.conn, group_id)
    }

    /// Every conversation whose subject still exists.
    ///
    /// Conversations whose repository subject disappeared are cascade
    /// deleted during the same call and never returned.
    pub fn list_conversations(
        &mut self,
        subject_exists: &dyn Fn(Uuid) -> bool,
    ) -> Result<Vec<Conversation>> {
        let all = conversations::list_all(&self.conn)?;
        let mut purged_groups: Vec<DatabaseId> = Vec::new();
        let mut kept = Vec::new();
        for conversation in all {
            if let Some(group_id) = conversation.group_id {
                if purged_groups.contains(&group_id) {
                    continue;
                }
            }
            if subject_exists(conversation.subject) {
                kept.push(conversation);
                continue;
            }
            tracing::info!(
                id = conversation.database_id,
                subject = %conversation.subject,
                "purging conversation with missing subject"
            );
            if conversation.is_group() {
                purged_groups.push(conversation.database_id);
            }
            self.delete_conversation_by_id(conversation.database_id)?;
        }
        Ok(kept)
    }

    /// Delete a conversation; members, descriptors, annotations and
    /// operations cascade in one transaction.
    pub fn delete_conversation_by_id(&mut self, id: DatabaseId) -> Result<()> {
        let tx = self.conn.transaction()?;
        conversations::delete(&tx, id)?;
        tx.commit()?;
        self.cache
            .remove_where(|d| d.envelope().conversation_id == id);
        Ok(())
    }

    /// Record a successful link open.
    pub fn touch_last_connect(&self, id: DatabaseId, now: i64) -> Result<()> {
        conversations::update_last_connect(&self.conn, id, now)
    }

    /// Record an outgoing attempt.
    pub fn touch_last_retry(&self, id: DatabaseId, now: i64) -> Result<()> {
        conversations::update_last_retry(&self.conn, id, now)
    }

    /// Update a member's permission bitmap.
    pub fn update_member_permissions(&self, id: DatabaseId, permissions: u64) -> Result<()> {
        conversations::update_permissions(&self.conn, id, permissions)
    }

    /// Update the membership state of a group or member row.
    pub fn set_group_state(&self, id: DatabaseId, state: GroupState) -> Result<()> {
        conversations::update_state(&self.conn, id, state)
    }

    /// Record the peer device instance seen on the last link.
    pub fn set_peer_resource(&self, id: DatabaseId, peer_resource: Option<&Uuid>) -> Result<()> {
        conversations::update_peer_resource(&self.conn, id, peer_resource)
    }

    // -----------------------------------------------------------------
    // Descriptors
    // -----------------------------------------------------------------

    /// Allocate a `(database_id, sequence_id)` pair and materialize a new
    /// outgoing descriptor through `factory`, in one transaction.
    pub fn create_descriptor(
        &mut self,
        conversation: &mut Conversation,
        now: i64,
        factory: impl FnOnce(DescriptorId, i64) -> Descriptor,
    ) -> Result<Arc<Descriptor>> {
        let tx = self.conn.transaction()?;
        let sequence_id = conversation.next_sequence_id;
        conversations::update_sequence(&tx, conversation.database_id, sequence_id + 1)?;

        let id = DescriptorId::new(0, conversation.twincode_outbound, sequence_id);
        let mut descriptor = factory(id, now);
        descriptor.envelope_mut().id = id;
        descriptor.envelope_mut().conversation_id = conversation.database_id;

        let database_id = descriptors::insert(&tx, &descriptor)?;
        descriptor.envelope_mut().id.database_id = database_id;
        tx.commit()?;

        conversation.next_sequence_id = sequence_id + 1;
        let descriptor = Arc::new(descriptor);
        self.cache.insert(&descriptor);
        Ok(descriptor)
    }

    /// Attach the invitation bookkeeping row to an invitation descriptor.
    pub fn link_invitation(
        &self,
        descriptor_id: DatabaseId,
        group_id: DatabaseId,
        inviter_member: Uuid,
    ) -> Result<()> {
        invitations::insert(
            &self.conn,
            &invitations::InvitationRow {
                descriptor_id,
                group_id,
                inviter_member,
                joined_member: None,
            },
        )
    }

    /// The invitation bookkeeping row of a descriptor.
    pub fn invitation_of(&self, descriptor_id: DatabaseId) -> Result<Option<invitations::InvitationRow>> {
        invitations::get_by_descriptor(&self.conn, descriptor_id)
    }

    /// Record which member row an accepted invitation produced.
    pub fn set_invitation_joined(&self, descriptor_id: DatabaseId, member: &Uuid) -> Result<()> {
        invitations::set_joined_member(&self.conn, descriptor_id, member)
    }

    /// Store or refresh a descriptor received from the wire, deduplicated
    /// by `(conversation, twincode, sequence)`.
    pub fn insert_or_update_descriptor(
        &mut self,
        conversation: &Conversation,
        mut descriptor: Descriptor,
    ) -> Result<InsertOutcome> {
        descriptor.envelope_mut().conversation_id = conversation.database_id;
        let id = descriptor.envelope().id;
        let existing = descriptors::get_by_pair(
            &self.conn,
            conversation.database_id,
            &id.twincode_outbound_id,
            id.sequence_id,
        )?;
        match existing {
            Some(stored) => {
                let stored_envelope = stored.envelope();
                let envelope = descriptor.envelope_mut();
                envelope.id.database_id = stored_envelope.id.database_id;
                // Local delivery dates are ours, not the sender's.
                envelope.receive_date = stored_envelope.receive_date;
                envelope.read_date = stored_envelope.read_date;
                envelope.delete_date = stored_envelope.delete_date;
                descriptors::update(&self.conn, &descriptor)?;
                let descriptor = Arc::new(descriptor);
                self.cache.insert(&descriptor);
                Ok(InsertOutcome::Updated(descriptor))
            }
            None => {
                let database_id = descriptors::insert(&self.conn, &descriptor)?;
                descriptor.envelope_mut().id.database_id = database_id;
                let descriptor = Arc::new(descriptor);
                self.cache.insert(&descriptor);
                Ok(InsertOutcome::Stored(descriptor))
            }
        }
    }

    fn attach_annotations(&self, descriptor: &mut Descriptor) -> Result<()> {
        let envelope = descriptor.envelope_mut();
        envelope.annotations = annotations::summary(
            &self.conn,
            envelope.conversation_id,
            envelope.id.database_id,
        )?;
        Ok(())
    }

    /// Load one descriptor through the cache, by either identity axis.
    pub fn load_descriptor(
        &self,
        conversation_id: DatabaseId,
        id: &DescriptorId,
    ) -> Result<Option<Arc<Descriptor>>> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(Some(cached));
        }
        let loaded = if id.database_id > 0 {
            descriptors::get_by_id(&self.conn, id.database_id)?
        } else {
            descriptors::get_by_pair(
                &self.conn,
                conversation_id,
                &id.twincode_outbound_id,
                id.sequence_id,
            )?
        };
        let Some(mut descriptor) = loaded else {
            return Ok(None);
        };
        self.attach_annotations(&mut descriptor)?;
        let descriptor = Arc::new(descriptor);
        self.cache.insert(&descriptor);
        Ok(Some(descriptor))
    }

    /// Newest-first page of a conversation, annotation summaries attached
    /// through one aggregated query.
    pub fn load_descriptors(
        &self,
        conversation_id: DatabaseId,
        before: i64,
        limit: usize,
    ) -> Result<Vec<Arc<Descriptor>>> {
        let loaded = descriptors::list_before(&self.conn, conversation_id, before, limit)?;
        self.finish_batch(loaded)
    }

    /// The newest descriptor of every conversation.
    pub fn list_last_descriptors(&self, calls_mode: CallsMode) -> Result<Vec<Arc<Descriptor>>> {
        let loaded = descriptors::list_last(&self.conn, calls_mode)?;
        self.finish_batch(loaded)
    }

    /// Text search across a set of conversations.
    pub fn search_descriptors(
        &self,
        conversation_ids: &[DatabaseId],
        text: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<Arc<Descriptor>>> {
        let loaded = descriptors::search(&self.conn, conversation_ids, text, before, limit)?;
        self.finish_batch(loaded)
    }

    fn finish_batch(&self, loaded: Vec<Descriptor>) -> Result<Vec<Arc<Descriptor>>> {
        let ids: Vec<DatabaseId> = loaded
            .iter()
            .map(|d| d.envelope().id.database_id)
            .collect();
        let mut summaries = annotations::summaries_for(&self.conn, &ids)?;
        let mut result = Vec::with_capacity(loaded.len());
        for mut descriptor in loaded {
            let envelope = descriptor.envelope_mut();
            envelope.annotations = summaries
                .remove(&envelope.id.database_id)
                .unwrap_or_default();
            let descriptor = Arc::new(descriptor);
            self.cache.insert(&descriptor);
            result.push(descriptor);
        }
        Ok(result)
    }

    /// Persist an edited descriptor and refresh the cache.
    pub fn update_descriptor(&self, descriptor: Descriptor) -> Result<Arc<Descriptor>> {
        descriptors::update(&self.conn, &descriptor)?;
        let descriptor = Arc::new(descriptor);
        self.cache.insert(&descriptor);
        Ok(descriptor)
    }

    /// Set one timestamp column and invalidate the cached entry.
    pub fn set_descriptor_date(
        &self,
        descriptor_id: DatabaseId,
        column: DateColumn,
        value: i64,
    ) -> Result<()> {
        descriptors::set_date(&self.conn, descriptor_id, column, value)?;
        self.cache
            .remove(&DescriptorId::new(descriptor_id, Uuid::nil(), 0));
        Ok(())
    }

    /// Mark a descriptor permanently undeliverable.
    pub fn mark_descriptor_failed(&self, descriptor_id: DatabaseId) -> Result<()> {
        descriptors::mark_failed(&self.conn, descriptor_id)?;
        self.cache
            .remove(&DescriptorId::new(descriptor_id, Uuid::nil(), 0));
        Ok(())
    }

    /// Reset-style bulk delete: for each bound, remove descriptors of that
    /// owner older-or-equal by sequence. Operations referencing deleted
    /// descriptors are dropped in the same transaction and their ids
    /// returned for scheduler eviction.
    pub fn delete_descriptors(
        &mut self,
        conversation: &Conversation,
        bounds: &[DescriptorId],
        keep_media_messages: bool,
    ) -> Result<ResetOutcome> {
        let tx = self.conn.transaction()?;
        let mut deleted: Vec<DatabaseId> = Vec::new();
        let mut kept_media: Vec<DatabaseId> = Vec::new();
        let mut file_paths: Vec<String> = Vec::new();

        for bound in bounds {
            let rows = descriptors::rows_older_or_equal(
                &tx,
                conversation.database_id,
                &bound.twincode_outbound_id,
                bound.sequence_id,
            )?;
            for row in rows {
                let descriptor_type = DescriptorType::from_code(row.descriptor_type);
                let keep = keep_media_messages
                    && descriptor_type.is_some_and(|ty| KEEP_MEDIA_TYPES.contains(&ty));
                if keep {
                    kept_media.push(row.id);
                    continue;
                }
                if descriptor_type.is_some_and(DescriptorType::has_file) {
                    if let Some(descriptor) = descriptors::get_by_id(&tx, row.id)? {
                        if let Some(info) = descriptor.file_info() {
                            if !info.path.is_empty() {
                                file_paths.push(info.path.clone());
                            }
                        }
                    }
                }
                deleted.push(row.id);
            }
        }

        descriptors::zero_media(&tx, &kept_media)?;
        let operation_ids = operations::ids_for_descriptors(&tx, &deleted)?;
        operations::delete_by_ids(&tx, &operation_ids)?;
        descriptors::delete_by_ids(&tx, &deleted)?;
        tx.commit()?;

        for id in &deleted {
            self.cache.remove(&DescriptorId::new(*id, Uuid::nil(), 0));
        }
        for id in &kept_media {
            self.cache.remove(&DescriptorId::new(*id, Uuid::nil(), 0));
        }
        tracing::debug!(
            conversation = conversation.database_id,
            deleted = deleted.len(),
            kept = kept_media.len(),
            operations = operation_ids.len(),
            "applied descriptor reset"
        );
        Ok(ResetOutcome {
            operation_ids,
            file_paths,
        })
    }

    /// Media purge planning plus local application.
    ///
    /// Media rows created at or before `before_date` are classified; rows
    /// already deleted by the peer are removed now, the rest get their
    /// delete date stamped and are returned for follow-up operations.
    pub fn delete_media_descriptors(
        &mut self,
        conversation: &Conversation,
        before_date: i64,
        reset_date: i64,
    ) -> Result<MediaDeleteOutcome> {
        let tx = self.conn.transaction()?;
        let rows = descriptors::rows_before(&tx, conversation.database_id, before_date)?;
        let mut outcome = MediaDeleteOutcome::default();
        let mut to_delete: Vec<DatabaseId> = Vec::new();

        for row in rows {
            let Some(descriptor_type) = DescriptorType::from_code(row.descriptor_type) else {
                continue;
            };
            if !descriptor_type.has_file() {
                continue;
            }
            let id = DescriptorId::new(row.id, row.twincode_outbound, row.sequence_id);
            let ours = row.twincode_outbound == conversation.twincode_outbound;
            if ours {
                if row.peer_delete_date > 0 {
                    outcome.deletable.push(id);
                    to_delete.push(row.id);
                } else {
                    descriptors::set_date(&tx, row.id, DateColumn::Delete, reset_date)?;
                    outcome.ours_needing_peer_delete.push(id);
                }
            } else {
                descriptors::set_date(&tx, row.id, DateColumn::Delete, reset_date)?;
                outcome.peers_to_acknowledge.push(id);
            }
        }

        let operation_ids = operations::ids_for_descriptors(&tx, &to_delete)?;
        operations::delete_by_ids(&tx, &operation_ids)?;
        descriptors::delete_by_ids(&tx, &to_delete)?;
        tx.commit()?;

        for id in &to_delete {
            self.cache.remove(&DescriptorId::new(*id, Uuid::nil(), 0));
        }
        Ok(outcome)
    }

    /// Apply a peer-side clear: stamp the peer delete date on everything
    /// up to `clear_date` and physically remove the rows we had already
    /// deleted locally. Returns the ids now gone on both sides.
    pub fn mark_descriptor_deleted(
        &mut self,
        conversation: &Conversation,
        clear_date: i64,
        reset_date: i64,
        keep_media: bool,
    ) -> Result<Vec<DescriptorId>> {
        let tx = self.conn.transaction()?;
        let rows = descriptors::rows_before(&tx, conversation.database_id, clear_date)?;
        let mut removed: Vec<DescriptorId> = Vec::new();
        let mut to_delete: Vec<DatabaseId> = Vec::new();

        for row in rows {
            let descriptor_type = DescriptorType::from_code(row.descriptor_type);
            let keep = keep_media
                && descriptor_type.is_some_and(|ty| KEEP_MEDIA_TYPES.contains(&ty));
            if keep {
                continue;
            }
            descriptors::set_date(&tx, row.id, DateColumn::PeerDelete, reset_date)?;
            if row.delete_date > 0 {
                removed.push(DescriptorId::new(
                    row.id,
                    row.twincode_outbound,
                    row.sequence_id,
                ));
                to_delete.push(row.id);
            }
        }

        let operation_ids = operations::ids_for_descriptors(&tx, &to_delete)?;
        operations::delete_by_ids(&tx, &operation_ids)?;
        descriptors::delete_by_ids(&tx, &to_delete)?;
        tx.commit()?;

        for id in &to_delete {
            self.cache.remove(&DescriptorId::new(*id, Uuid::nil(), 0));
        }
        Ok(removed)
    }

    /// Remove one descriptor row outright, dropping dependent operations
    /// in the same transaction. Returns the dropped operation ids.
    pub fn delete_descriptor_row(&mut self, id: DatabaseId) -> Result<Vec<DatabaseId>> {
        let tx = self.conn.transaction()?;
        let operation_ids = operations::ids_for_descriptors(&tx, &[id])?;
        operations::delete_by_ids(&tx, &operation_ids)?;
        descriptors::delete_by_ids(&tx, &[id])?;
        tx.commit()?;
        self.cache.remove(&DescriptorId::new(id, Uuid::nil(), 0));
        Ok(operation_ids)
    }

    // -----------------------------------------------------------------
    // Annotations
    // -----------------------------------------------------------------

    /// Apply one annotation and return the fresh summary.
    pub fn annotate(&self, annotation: &Annotation) -> Result<Vec<AnnotationSummary>> {
        annotations::upsert(&self.conn, annotation)?;
        self.cache.remove(&DescriptorId::new(
            annotation.descriptor_id,
            Uuid::nil(),
            0,
        ));
        annotations::summary(
            &self.conn,
            annotation.conversation_id,
            annotation.descriptor_id,
        )
    }

    /// Our own annotation rows for one descriptor.
    pub fn our_annotations(
        &self,
        conversation_id: DatabaseId,
        descriptor_id: DatabaseId,
    ) -> Result<Vec<Annotation>> {
        annotations::list_ours(&self.conn, conversation_id, descriptor_id)
    }

    /// Replace a peer's annotation rows with a synchronized set.
    pub fn apply_peer_annotations(
        &self,
        conversation_id: DatabaseId,
        descriptor_id: DatabaseId,
        peer: &Uuid,
        rows: &[(colloquy_types::AnnotationKind, i64)],
        now: i64,
    ) -> Result<Vec<AnnotationSummary>> {
        annotations::replace_peer_rows(&self.conn, conversation_id, descriptor_id, peer, rows, now)?;
        self.cache
            .remove(&DescriptorId::new(descriptor_id, Uuid::nil(), 0));
        annotations::summary(&self.conn, conversation_id, descriptor_id)
    }

    // -----------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------

    /// Persist a new operation.
    pub fn enqueue_operation(
        &self,
        now: i64,
        conversation_id: DatabaseId,
        op_type: OperationType,
        descriptor_id: Option<DatabaseId>,
        chunk_start: Option<i64>,
        content: Option<&[u8]>,
    ) -> Result<DatabaseId> {
        operations::insert(
            &self.conn,
            now,
            conversation_id,
            op_type.code(),
            descriptor_id,
            chunk_start,
            content,
        )
    }

    /// Delete a completed or abandoned operation.
    pub fn delete_operation(&self, id: DatabaseId) -> Result<()> {
        operations::delete(&self.conn, id)
    }

    /// Delete every operation of one conversation.
    pub fn delete_operations_for_conversation(&self, conversation_id: DatabaseId) -> Result<()> {
        operations::delete_for_conversation(&self.conn, conversation_id)
    }

    /// Record sliding-window progress of a file push.
    pub fn update_operation_chunk(&self, id: DatabaseId, chunk_start: i64) -> Result<()> {
        operations::update_chunk_start(&self.conn, id, chunk_start)
    }

    /// Startup load: sweep operations past the retention age, marking
    /// their push descriptors failed, and return the survivors.
    pub fn load_operations(&mut self, now: i64) -> Result<Vec<operations::OperationRow>> {
        let tx = self.conn.transaction()?;
        let rows = operations::list_all(&tx)?;
        let cutoff = now - OPERATION_MAX_AGE_MS;
        let mut survivors = Vec::with_capacity(rows.len());
        let mut expired = 0usize;
        for row in rows {
            if row.creation_date >= cutoff {
                survivors.push(row);
                continue;
            }
            expired += 1;
            let is_push = OperationType::from_code(row.op_type).is_some_and(OperationType::is_push);
            if is_push {
                if let Some(descriptor_id) = row.descriptor_id {
                    descriptors::mark_failed(&tx, descriptor_id)?;
                }
            }
            operations::delete(&tx, row.id)?;
        }
        tx.commit()?;
        if expired > 0 {
            tracing::info!(expired, "expired stale operations at load");
        }
        Ok(survivors)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_model::FileInfo;
    use colloquy_types::AnnotationKind;

    fn store() -> Store {
        Store::open_memory().expect("open store")
    }

    fn contact(store: &mut Store) -> Conversation {
        store
            .create_conversation(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 100)
            .expect("create conversation")
    }

    #[test]
    fn test_create_conversation_is_idempotent_per_subject() {
        let mut store = store();
        let subject = Uuid::new_v4();
        let first = store
            .create_conversation(subject, Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 1)
            .expect("create");
        let second = store
            .create_conversation(subject, Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 2)
            .expect("create again");
        assert_eq!(first.database_id, second.database_id);
    }

    #[test]
    fn test_create_descriptor_allocates_sequence() {
        let mut store = store();
        let mut conversation = contact(&mut store);

        let first = store
            .create_descriptor(&mut conversation, 1000, |id, now| {
                Descriptor::object(id, 0, now, "one".into())
            })
            .expect("create");
        let second = store
            .create_descriptor(&mut conversation, 1001, |id, now| {
                Descriptor::object(id, 0, now, "two".into())
            })
            .expect("create");

        assert_eq!(first.envelope().id.sequence_id, 1);
        assert_eq!(second.envelope().id.sequence_id, 2);
        assert!(second.envelope().id.database_id > first.envelope().id.database_id);

        let reloaded = store
            .get_conversation(conversation.database_id)
            .expect("get")
            .expect("row");
        assert_eq!(reloaded.next_sequence_id, 3);
    }

    #[test]
    fn test_group_member_limit() {
        let mut store = store();
        let group = store
            .create_group_conversation(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), true, 1)
            .expect("group");

        for _ in 0..MAX_GROUP_MEMBERS {
            let member = store
                .create_group_member(&group, Uuid::new_v4(), DEFAULT_PERMISSIONS, None, 2)
                .expect("member");
            assert!(member.is_some());
        }
        let overflow = store
            .create_group_member(&group, Uuid::new_v4(), DEFAULT_PERMISSIONS, None, 3)
            .expect("overflow call");
        assert!(overflow.is_none());
        assert_eq!(
            store.group_members(group.database_id).expect("members").len(),
            MAX_GROUP_MEMBERS
        );
    }

    #[test]
    fn test_existing_member_permissions_refreshed() {
        let mut store = store();
        let group = store
            .create_group_conversation(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), true, 1)
            .expect("group");
        let twincode = Uuid::new_v4();
        store
            .create_group_member(&group, twincode, 1, None, 2)
            .expect("member")
            .expect("created");
        let updated = store
            .create_group_member(&group, twincode, 7, None, 3)
            .expect("member")
            .expect("existing");
        assert_eq!(updated.permissions, 7);
        assert_eq!(store.group_members(group.database_id).expect("m").len(), 1);
    }

    #[test]
    fn test_insert_or_update_dedupes() {
        let mut store = store();
        let conversation = contact(&mut store);
        let peer = conversation.peer_twincode_outbound.expect("peer");

        let incoming = Descriptor::object(DescriptorId::remote(peer, 1), 0, 500, "hello".into());
        let outcome = store
            .insert_or_update_descriptor(&conversation, incoming.clone())
            .expect("insert");
        assert!(matches!(outcome, InsertOutcome::Stored(_)));

        let outcome = store
            .insert_or_update_descriptor(&conversation, incoming)
            .expect("re-insert");
        assert!(matches!(outcome, InsertOutcome::Updated(_)));
    }

    #[test]
    fn test_load_descriptor_attaches_summary() {
        let mut store = store();
        let mut conversation = contact(&mut store);
        let descriptor = store
            .create_descriptor(&mut conversation, 1000, |id, now| {
                Descriptor::object(id, 0, now, "liked".into())
            })
            .expect("create");
        let database_id = descriptor.envelope().id.database_id;
        drop(descriptor);
        store.cache().purge();

        store
            .annotate(&Annotation {
                conversation_id: conversation.database_id,
                descriptor_id: database_id,
                peer_twincode: None,
                kind: AnnotationKind::Like,
                value: 2,
                creation_date: 1100,
                notification_id: None,
            })
            .expect("annotate");

        let loaded = store
            .load_descriptor(
                conversation.database_id,
                &DescriptorId::new(database_id, Uuid::nil(), 0),
            )
            .expect("load")
            .expect("descriptor");
        assert_eq!(loaded.envelope().annotations.len(), 1);
        assert_eq!(loaded.envelope().annotations[0].count, 1);
    }

    #[test]
    fn test_delete_descriptors_drops_dependent_operations() {
        let mut store = store();
        let mut conversation = contact(&mut store);
        let mut ids = Vec::new();
        for i in 0..3 {
            let descriptor = store
                .create_descriptor(&mut conversation, 1000 + i, |id, now| {
                    Descriptor::object(id, 0, now, format!("m{i}"))
                })
                .expect("create");
            ids.push(descriptor.envelope().id);
        }
        let op = store
            .enqueue_operation(
                1000,
                conversation.database_id,
                OperationType::PushObject,
                Some(ids[0].database_id),
                None,
                None,
            )
            .expect("enqueue");

        let outcome = store
            .delete_descriptors(
                &conversation,
                &[DescriptorId::remote(conversation.twincode_outbound, 2)],
                false,
            )
            .expect("reset");
        assert_eq!(outcome.operation_ids, vec![op]);

        // Sequence 3 survives, 1 and 2 are gone.
        assert!(store
            .load_descriptor(conversation.database_id, &ids[2])
            .expect("load")
            .is_some());
        assert!(store
            .load_descriptor(conversation.database_id, &ids[0])
            .expect("load")
            .is_none());
    }

    #[test]
    fn test_delete_descriptors_keep_media_zeroes_length() {
        let mut store = store();
        let mut conversation = contact(&mut store);
        let descriptor = store
            .create_descriptor(&mut conversation, 1000, |id, now| {
                Descriptor::file(
                    id,
                    0,
                    now,
                    DescriptorType::Image,
                    FileInfo {
                        path: "blobs/x".into(),
                        extension: Some("png".into()),
                        length: 4096,
                        thumbnail: None,
                    },
                )
            })
            .expect("create");
        let id = descriptor.envelope().id;
        drop(descriptor);
        store.cache().purge();

        store
            .delete_descriptors(
                &conversation,
                &[DescriptorId::remote(conversation.twincode_outbound, 1)],
                true,
            )
            .expect("reset");

        let kept = store
            .load_descriptor(conversation.database_id, &id)
            .expect("load")
            .expect("still present");
        assert_eq!(kept.file_info().expect("file").length, 0);
    }

    #[test]
    fn test_media_purge_classification() {
        let mut store = store();
        let mut conversation = contact(&mut store);
        let peer = conversation.peer_twincode_outbound.expect("peer");

        // Ours, peer already deleted its copy.
        let ours_done = store
            .create_descriptor(&mut conversation, 100, |id, now| {
                Descriptor::file(id, 0, now, DescriptorType::Video, FileInfo::default())
            })
            .expect("create");
        store
            .set_descriptor_date(
                ours_done.envelope().id.database_id,
                DateColumn::PeerDelete,
                900,
            )
            .expect("peer delete");

        // Ours, peer still holds it.
        store
            .create_descriptor(&mut conversation, 101, |id, now| {
                Descriptor::file(id, 0, now, DescriptorType::Audio, FileInfo::default())
            })
            .expect("create");

        // The peer's media.
        store
            .insert_or_update_descriptor(
                &conversation,
                Descriptor::file(
                    DescriptorId::remote(peer, 1),
                    0,
                    102,
                    DescriptorType::File,
                    FileInfo::default(),
                ),
            )
            .expect("insert");

        // A text message is not media and is untouched.
        store
            .create_descriptor(&mut conversation, 103, |id, now| {
                Descriptor::object(id, 0, now, "keep".into())
            })
            .expect("create");

        let outcome = store
            .delete_media_descriptors(&conversation, 1_000, 2_000)
            .expect("purge");
        assert_eq!(outcome.deletable.len(), 1);
        assert_eq!(outcome.ours_needing_peer_delete.len(), 1);
        assert_eq!(outcome.peers_to_acknowledge.len(), 1);
    }

    #[test]
    fn test_mark_descriptor_deleted_removes_both_sided() {
        let mut store = store();
        let mut conversation = contact(&mut store);
        let locally_deleted = store
            .create_descriptor(&mut conversation, 100, |id, now| {
                Descriptor::object(id, 0, now, "gone".into())
            })
            .expect("create");
        let kept = store
            .create_descriptor(&mut conversation, 101, |id, now| {
                Descriptor::object(id, 0, now, "stays".into())
            })
            .expect("create");
        store
            .set_descriptor_date(
                locally_deleted.envelope().id.database_id,
                DateColumn::Delete,
                500,
            )
            .expect("local delete");

        let removed = store
            .mark_descriptor_deleted(&conversation, 1_000, 2_000, false)
            .expect("clear");
        assert_eq!(removed.len(), 1);
        assert_eq!(
            removed[0].database_id,
            locally_deleted.envelope().id.database_id
        );

        let kept_id = kept.envelope().id;
        drop(kept);
        store.cache().purge();
        let survivor = store
            .load_descriptor(conversation.database_id, &kept_id)
            .expect("load")
            .expect("still present");
        assert_eq!(survivor.envelope().peer_delete_date, 2_000);
    }

    #[test]
    fn test_load_operations_expires_old_rows() {
        let mut store = store();
        let mut conversation = contact(&mut store);
        let descriptor = store
            .create_descriptor(&mut conversation, 1000, |id, now| {
                Descriptor::object(id, 0, now, "stale".into())
            })
            .expect("create");
        let descriptor_id = descriptor.envelope().id;
        drop(descriptor);
        store.cache().purge();

        let now = OPERATION_MAX_AGE_MS + 1_000_000;
        store
            .enqueue_operation(
                500, // far past the cutoff
                conversation.database_id,
                OperationType::PushObject,
                Some(descriptor_id.database_id),
                None,
                None,
            )
            .expect("stale op");
        let fresh = store
            .enqueue_operation(
                now - 1_000,
                conversation.database_id,
                OperationType::PushObject,
                None,
                None,
                None,
            )
            .expect("fresh op");

        let survivors = store.load_operations(now).expect("load");
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, fresh);

        let failed = store
            .load_descriptor(conversation.database_id, &descriptor_id)
            .expect("load")
            .expect("descriptor");
        assert_eq!(failed.envelope().send_date, -1);
        assert_eq!(failed.envelope().read_date, -1);
    }

    #[test]
    fn test_list_conversations_purges_missing_subjects() {
        let mut store = store();
        let keep = contact(&mut store);
        let purge = contact(&mut store);

        let keep_subject = keep.subject;
        let listed = store
            .list_conversations(&move |subject| subject == keep_subject)
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].database_id, keep.database_id);
        assert!(store
            .get_conversation(purge.database_id)
            .expect("get")
            .is_none());
    }

    #[test]
    fn test_delete_conversation_clears_cache() {
        let mut store = store();
        let mut conversation = contact(&mut store);
        let descriptor = store
            .create_descriptor(&mut conversation, 100, |id, now| {
                Descriptor::object(id, 0, now, "cached".into())
            })
            .expect("create");
        let id = descriptor.envelope().id;

        store
            .delete_conversation_by_id(conversation.database_id)
            .expect("delete");
        assert!(store.cache().get(&id).is_none());
        assert!(store
            .load_descriptor(conversation.database_id, &id)
            .expect("load")
            .is_none());
    }
}
