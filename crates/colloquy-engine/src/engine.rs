//! Engine facade and run loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use colloquy_db::Store;
use colloquy_model::{Conversation, Descriptor, FileInfo};
use colloquy_proto::chunk::ChunkAssembly;
use colloquy_proto::{ExecuteContext, LinkState, OperationContent, PeerLink, PendingOperation};
use colloquy_types::{
    now_ms, AnnotationKind, DatabaseId, DescriptorId, DescriptorType, ErrorCode, GroupState,
    OperationType, TimestampKind, DEVICE_STATE_FOREGROUND, DEVICE_STATE_HAS_OPERATIONS,
    DEVICE_STATE_SYNCHRONIZE_KEYS, DEVICE_STATE_VALID, FLAG_COPY_ALLOWED, FLAG_UPDATED,
    UPDATE_COPY_ALLOWED, UPDATE_EXPIRATION, UPDATE_MESSAGE,
};

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::scheduler::Scheduler;

/// Builds outgoing peer links on demand.
///
/// The returned link starts in `Opening`; the transport reports state
/// changes and inbound packets through [`Engine::link_state_changed`] and
/// [`Engine::packet_received`].
pub trait LinkFactory: Send + Sync {
    fn start_outgoing(&self, conversation: &Conversation) -> Result<Arc<dyn PeerLink>, ErrorCode>;
}

/// Retry delay when the connection limit blocks an outgoing attempt.
const LIMIT_RETRY_MS: i64 = 1_000;

pub(crate) enum Command {
    SendMessage {
        conversation: Uuid,
        message: String,
        reply_to: Option<DescriptorId>,
        expire_timeout: i64,
    },
    SendFile {
        conversation: Uuid,
        kind: DescriptorType,
        file: FileInfo,
    },
    SendGeolocation {
        conversation: Uuid,
        latitude: f64,
        longitude: f64,
        altitude: f64,
    },
    SendTwincode {
        conversation: Uuid,
        twincode_id: Uuid,
        name: Option<String>,
        description: Option<String>,
    },
    SendTransient {
        conversation: Uuid,
        payload: Vec<u8>,
    },
    SendCommand {
        conversation: Uuid,
        payload: Vec<u8>,
    },
    Forward {
        from: Uuid,
        descriptor: DescriptorId,
        to: Uuid,
        expire_timeout: i64,
        copy_allowed: bool,
    },
    MarkRead {
        conversation: Uuid,
        descriptor: DescriptorId,
        timestamp: i64,
    },
    DeleteDescriptor {
        conversation: Uuid,
        descriptor: DescriptorId,
    },
    UpdateMessage {
        conversation: Uuid,
        descriptor: DescriptorId,
        message: Option<String>,
        copy_allowed: Option<bool>,
        expire_timeout: Option<i64>,
    },
    Annotate {
        conversation: Uuid,
        descriptor: DescriptorId,
        kind: AnnotationKind,
        value: i64,
    },
    ResetConversation {
        conversation: Uuid,
        min_sequence_id: i64,
        peer_bounds: Vec<(Uuid, i64)>,
        keep_media: bool,
    },
    InviteGroup {
        group: Uuid,
        contact: Uuid,
        group_name: String,
    },
    WithdrawInvite {
        contact: Uuid,
        descriptor: DescriptorId,
    },
    JoinGroup {
        via: Uuid,
        group_id: Uuid,
        member_id: Uuid,
        permissions: i64,
        public_key: Option<String>,
        secret: Option<Vec<u8>>,
    },
    LeaveGroup {
        group: Uuid,
    },
    UpdateGroupMember {
        group: Uuid,
        member: Uuid,
        permissions: i64,
    },
    DeleteConversation {
        conversation: Uuid,
    },
    SetForeground(bool),
    EnterBackground,
    SetOnline(bool),
    IncomingConnection {
        conversation: Uuid,
        link: Arc<dyn PeerLink>,
    },
    LinkStateChanged {
        conversation: Uuid,
        state: LinkState,
        reason: ErrorCode,
    },
    PacketReceived {
        conversation: Uuid,
        bytes: Vec<u8>,
    },
    Shutdown,
}

/// Public handle to the engine; cheap to clone.
///
/// All methods enqueue a command onto the run loop and return immediately.
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::UnboundedSender<Command>,
    events: EventBus,
}

impl Engine {
    /// Start the engine run loop on the current tokio runtime.
    pub fn start(store: Store, factory: Arc<dyn LinkFactory>, config: EngineConfig) -> Engine {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventBus::new(256);
        let runtime = Runtime::new(store, factory, config, events.clone());
        tokio::spawn(runtime.run(rx));
        Engine { tx, events }
    }

    /// The event bus carrying lifecycle events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("engine is shut down; command dropped");
        }
    }

    /// Queue a text message for delivery.
    pub fn send_message(
        &self,
        conversation: Uuid,
        message: String,
        reply_to: Option<DescriptorId>,
        expire_timeout: i64,
    ) {
        self.send(Command::SendMessage {
            conversation,
            message,
            reply_to,
            expire_timeout,
        });
    }

    /// Queue a file (or image/audio/video/named-file) for delivery.
    pub fn send_file(&self, conversation: Uuid, kind: DescriptorType, file: FileInfo) {
        self.send(Command::SendFile {
            conversation,
            kind,
            file,
        });
    }

    /// Queue a geolocation share.
    pub fn send_geolocation(
        &self,
        conversation: Uuid,
        latitude: f64,
        longitude: f64,
        altitude: f64,
    ) {
        self.send(Command::SendGeolocation {
            conversation,
            latitude,
            longitude,
            altitude,
        });
    }

    /// Queue a twincode card share.
    pub fn send_twincode(
        &self,
        conversation: Uuid,
        twincode_id: Uuid,
        name: Option<String>,
        description: Option<String>,
    ) {
        self.send(Command::SendTwincode {
            conversation,
            twincode_id,
            name,
            description,
        });
    }

    /// Fire a transient signal (typing, ...); dropped when no link is open.
    pub fn send_transient(&self, conversation: Uuid, payload: Vec<u8>) {
        self.send(Command::SendTransient {
            conversation,
            payload,
        });
    }

    /// Queue a realtime command sidecar; dropped when no link is open.
    pub fn send_command(&self, conversation: Uuid, payload: Vec<u8>) {
        self.send(Command::SendCommand {
            conversation,
            payload,
        });
    }

    /// Forward a descriptor into another conversation.
    pub fn forward(
        &self,
        from: Uuid,
        descriptor: DescriptorId,
        to: Uuid,
        expire_timeout: i64,
        copy_allowed: bool,
    ) {
        self.send(Command::Forward {
            from,
            descriptor,
            to,
            expire_timeout,
            copy_allowed,
        });
    }

    /// Record a read timestamp locally and push it to the sender.
    pub fn mark_read(&self, conversation: Uuid, descriptor: DescriptorId, timestamp: i64) {
        self.send(Command::MarkRead {
            conversation,
            descriptor,
            timestamp,
        });
    }

    /// Delete our copy of a descriptor and notify the peer.
    pub fn delete_descriptor(&self, conversation: Uuid, descriptor: DescriptorId) {
        self.send(Command::DeleteDescriptor {
            conversation,
            descriptor,
        });
    }

    /// Edit a sent message (body, copy-allowed flag, expiration).
    pub fn update_message(
        &self,
        conversation: Uuid,
        descriptor: DescriptorId,
        message: Option<String>,
        copy_allowed: Option<bool>,
        expire_timeout: Option<i64>,
    ) {
        self.send(Command::UpdateMessage {
            conversation,
            descriptor,
            message,
            copy_allowed,
            expire_timeout,
        });
    }

    /// Apply one of our annotations and synchronize it to the peer.
    pub fn annotate(
        &self,
        conversation: Uuid,
        descriptor: DescriptorId,
        kind: AnnotationKind,
        value: i64,
    ) {
        self.send(Command::Annotate {
            conversation,
            descriptor,
            kind,
            value,
        });
    }

    /// Reset a conversation up to per-owner sequence bounds.
    pub fn reset_conversation(
        &self,
        conversation: Uuid,
        min_sequence_id: i64,
        peer_bounds: Vec<(Uuid, i64)>,
        keep_media: bool,
    ) {
        self.send(Command::ResetConversation {
            conversation,
            min_sequence_id,
            peer_bounds,
            keep_media,
        });
    }

    /// Invite a contact into a group we belong to.
    pub fn invite_group(&self, group: Uuid, contact: Uuid, group_name: String) {
        self.send(Command::InviteGroup {
            group,
            contact,
            group_name,
        });
    }

    /// Withdraw a pending group invitation.
    pub fn withdraw_invitation(&self, contact: Uuid, descriptor: DescriptorId) {
        self.send(Command::WithdrawInvite {
            contact,
            descriptor,
        });
    }

    /// Join a group we were invited to, over the inviter's conversation.
    pub fn join_group(
        &self,
        via: Uuid,
        group_id: Uuid,
        member_id: Uuid,
        permissions: i64,
        public_key: Option<String>,
        secret: Option<Vec<u8>>,
    ) {
        self.send(Command::JoinGroup {
            via,
            group_id,
            member_id,
            permissions,
            public_key,
            secret,
        });
    }

    /// Leave a group: fan a leave out to every member.
    pub fn leave_group(&self, group: Uuid) {
        self.send(Command::LeaveGroup { group });
    }

    /// Push a member permission change to every member.
    pub fn update_group_member(&self, group: Uuid, member: Uuid, permissions: i64) {
        self.send(Command::UpdateGroupMember {
            group,
            member,
            permissions,
        });
    }

    /// Delete a conversation with its descriptors and operations.
    pub fn delete_conversation(&self, conversation: Uuid) {
        self.send(Command::DeleteConversation { conversation });
    }

    /// Announce the host process foreground state.
    pub fn set_foreground(&self, foreground: bool) {
        self.send(Command::SetForeground(foreground));
    }

    /// The app stops producing near-term writes; promote deferred work.
    pub fn enter_background(&self) {
        self.send(Command::EnterBackground);
    }

    /// Announce backend connectivity.
    pub fn set_online(&self, online: bool) {
        self.send(Command::SetOnline(online));
    }

    /// Offer an inbound link for a conversation (transport integration).
    pub fn incoming_connection(&self, conversation: Uuid, link: Arc<dyn PeerLink>) {
        self.send(Command::IncomingConnection { conversation, link });
    }

    /// Report a link state change (transport integration).
    pub fn link_state_changed(&self, conversation: Uuid, state: LinkState, reason: ErrorCode) {
        self.send(Command::LinkStateChanged {
            conversation,
            state,
            reason,
        });
    }

    /// Deliver an inbound IQ frame (transport integration).
    pub fn packet_received(&self, conversation: Uuid, bytes: Vec<u8>) {
        self.send(Command::PacketReceived {
            conversation,
            bytes,
        });
    }

    /// Stop the run loop; queued work stays persisted.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }
}

/// One active (or opening) peer link.
pub(crate) struct Connection {
    pub(crate) link: Arc<dyn PeerLink>,
    pub(crate) state: LinkState,
    pub(crate) last_activity: i64,
    /// In-flight request ids mapped to operation row ids.
    pub(crate) pending_requests: HashMap<i64, DatabaseId>,
    /// Inbound file transfers keyed by `(owner twincode, sequence)`.
    pub(crate) assemblies: HashMap<(Uuid, i64), FileAssembly>,
    /// Thumbnails arriving ahead of their file descriptor.
    pub(crate) thumbnails: HashMap<(Uuid, i64), Vec<u8>>,
}

/// Receiver-side progress of one inbound file.
pub(crate) struct FileAssembly {
    pub(crate) assembly: ChunkAssembly,
    pub(crate) descriptor_db_id: DatabaseId,
    pub(crate) path: PathBuf,
}

/// Run-loop state; single-writer by construction.
pub(crate) struct Runtime {
    pub(crate) store: Store,
    pub(crate) factory: Arc<dyn LinkFactory>,
    pub(crate) config: EngineConfig,
    pub(crate) events: EventBus,
    pub(crate) scheduler: Scheduler,
    pub(crate) backoff: HashMap<DatabaseId, Backoff>,
    pub(crate) connections: HashMap<DatabaseId, Connection>,
    pub(crate) conversations: HashMap<DatabaseId, Conversation>,
    pub(crate) by_uuid: HashMap<Uuid, DatabaseId>,
    pub(crate) foreground: bool,
    pub(crate) online: bool,
    pub(crate) next_idle_check: Option<i64>,
    /// Synthetic (negative) ids handed to transient operations.
    pub(crate) next_transient_id: DatabaseId,
    pub(crate) loaded: bool,
}

impl Runtime {
    pub(crate) fn new(
        store: Store,
        factory: Arc<dyn LinkFactory>,
        config: EngineConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            factory,
            config,
            events,
            scheduler: Scheduler::new(),
            backoff: HashMap::new(),
            connections: HashMap::new(),
            conversations: HashMap::new(),
            by_uuid: HashMap::new(),
            foreground: true,
            online: false,
            next_idle_check: None,
            next_transient_id: -1,
            loaded: false,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.load(now_ms());
        loop {
            let wake = self.next_wakeup();
            let sleep = match wake {
                Some(at) => {
                    let delta = (at - now_ms()).max(0) as u64;
                    tokio::time::sleep(std::time::Duration::from_millis(delta))
                }
                None => tokio::time::sleep(std::time::Duration::from_secs(3_600)),
            };
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                () = sleep => self.on_timer(now_ms()),
            }
        }
        tracing::info!("engine run loop stopped");
    }

    /// Load persisted operations, expiring rows past the retention age.
    pub(crate) fn load(&mut self, now: i64) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        let rows = match self.store.load_operations(now) {
            Ok(rows) => rows,
            Err(e) => {
                self.database_error("operation load", &e);
                return;
            }
        };
        let mut count = 0usize;
        for row in &rows {
            if let Some(operation) = PendingOperation::from_row(row) {
                self.scheduler.enqueue(operation);
                count += 1;
            }
        }
        tracing::info!(count, "loaded pending operations");
    }

    fn next_wakeup(&self) -> Option<i64> {
        match (self.scheduler.next_deadline(), self.next_idle_check) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    fn on_timer(&mut self, now: i64) {
        if let Some(at) = self.next_idle_check {
            if now >= at {
                self.check_idle(now);
            }
        }
        let due = self.scheduler.take_due(now);
        for (index, conversation_id) in due.into_iter().enumerate() {
            if index == 0 {
                self.run_operations(conversation_id, now);
            } else {
                // Stagger the rest to avoid a thundering herd of opens.
                let stagger = self.config.scheduler.stagger_ms * index as i64;
                self.scheduler.schedule(conversation_id, now + stagger);
            }
        }
    }

    pub(crate) fn database_error(&self, context: &str, error: &colloquy_db::DbError) {
        tracing::error!(context, error = %error, "database error");
        self.events.emit(EngineEvent::DatabaseError {
            detail: format!("{context}: {error}"),
        });
    }

    /// Resolve a conversation by uuid, loading and caching it.
    pub(crate) fn conversation_by_uuid(&mut self, uuid: &Uuid) -> Option<Conversation> {
        if let Some(id) = self.by_uuid.get(uuid) {
            return self.conversations.get(id).cloned();
        }
        match self.store.get_conversation_by_uuid(uuid) {
            Ok(Some(conversation)) => {
                self.by_uuid.insert(*uuid, conversation.database_id);
                self.conversations
                    .insert(conversation.database_id, conversation.clone());
                Some(conversation)
            }
            Ok(None) => None,
            Err(e) => {
                self.database_error("conversation lookup", &e);
                None
            }
        }
    }

    /// Resolve a conversation by row id, loading and caching it.
    pub(crate) fn conversation_by_id(&mut self, id: DatabaseId) -> Option<Conversation> {
        if let Some(conversation) = self.conversations.get(&id) {
            return Some(conversation.clone());
        }
        match self.store.get_conversation(id) {
            Ok(Some(conversation)) => {
                self.by_uuid.insert(conversation.uuid, id);
                self.conversations.insert(id, conversation.clone());
                Some(conversation)
            }
            Ok(None) => None,
            Err(e) => {
                self.database_error("conversation lookup", &e);
                None
            }
        }
    }

    pub(crate) fn cache_conversation(&mut self, conversation: &Conversation) {
        self.by_uuid
            .insert(conversation.uuid, conversation.database_id);
        self.conversations
            .insert(conversation.database_id, conversation.clone());
    }

    /// The row descriptors of this conversation hang off: the group row
    /// for member rows, the conversation itself otherwise.
    pub(crate) fn content_conversation(&mut self, conversation: &Conversation) -> Conversation {
        match conversation.group_id {
            Some(group_id) if group_id != conversation.database_id => self
                .conversation_by_id(group_id)
                .unwrap_or_else(|| conversation.clone()),
            _ => conversation.clone(),
        }
    }

    /// The rows that carry peer links for this conversation: the member
    /// rows for a group, the conversation itself otherwise.
    pub(crate) fn link_conversations(&mut self, conversation: &Conversation) -> Vec<Conversation> {
        if conversation.is_group() {
            match self.store.group_members(conversation.database_id) {
                Ok(members) => members
                    .into_iter()
                    .filter(|member| {
                        member.has_peer() && member.state != Some(GroupState::Left)
                    })
                    .collect(),
                Err(e) => {
                    self.database_error("group members", &e);
                    Vec::new()
                }
            }
        } else {
            vec![conversation.clone()]
        }
    }

    pub(crate) fn our_device_state(&self, conversation_id: DatabaseId) -> u32 {
        let mut state = DEVICE_STATE_VALID;
        if self.foreground {
            state |= DEVICE_STATE_FOREGROUND;
        }
        if self.scheduler.has_pending(conversation_id) {
            state |= DEVICE_STATE_HAS_OPERATIONS;
        }
        state
    }

    fn connection_limit(&self) -> usize {
        if self.foreground {
            self.config.connections.max_foreground
        } else {
            self.config.connections.max_background
        }
    }

    fn handle(&mut self, command: Command) {
        let now = now_ms();
        match command {
            Command::SendMessage {
                conversation,
                message,
                reply_to,
                expire_timeout,
            } => self.cmd_send_descriptor(conversation, now, move |id, conv_id, created| {
                let mut descriptor = Descriptor::object(id, conv_id, created, message);
                descriptor.envelope_mut().reply_to = reply_to;
                descriptor.envelope_mut().expire_timeout = expire_timeout;
                (descriptor, OperationType::PushObject)
            }),
            Command::SendFile {
                conversation,
                kind,
                file,
            } => self.cmd_send_descriptor(conversation, now, move |id, conv_id, created| {
                (
                    Descriptor::file(id, conv_id, created, kind, file),
                    OperationType::PushFile,
                )
            }),
            Command::SendGeolocation {
                conversation,
                latitude,
                longitude,
                altitude,
            } => self.cmd_send_descriptor(conversation, now, move |id, conv_id, created| {
                (
                    Descriptor::Geolocation(colloquy_model::GeolocationDescriptor {
                        envelope: colloquy_model::Envelope::outgoing(id, conv_id, created),
                        latitude,
                        longitude,
                        altitude,
                    }),
                    OperationType::PushGeolocation,
                )
            }),
            Command::SendTwincode {
                conversation,
                twincode_id,
                name,
                description,
            } => self.cmd_send_descriptor(conversation, now, move |id, conv_id, created| {
                (
                    Descriptor::Twincode(colloquy_model::TwincodeDescriptor {
                        envelope: colloquy_model::Envelope::outgoing(id, conv_id, created),
                        twincode_id,
                        name,
                        description,
                    }),
                    OperationType::PushTwincode,
                )
            }),
            Command::SendTransient {
                conversation,
                payload,
            } => self.cmd_send_transient(conversation, OperationType::PushTransientObject, payload, now),
            Command::SendCommand {
                conversation,
                payload,
            } => self.cmd_send_transient(conversation, OperationType::PushCommand, payload, now),
            Command::Forward {
                from,
                descriptor,
                to,
                expire_timeout,
                copy_allowed,
            } => self.cmd_forward(from, descriptor, to, expire_timeout, copy_allowed, now),
            Command::MarkRead {
                conversation,
                descriptor,
                timestamp,
            } => self.cmd_timestamp(conversation, descriptor, TimestampKind::Read, timestamp, now),
            Command::DeleteDescriptor {
                conversation,
                descriptor,
            } => self.cmd_delete_descriptor(conversation, descriptor, now),
            Command::UpdateMessage {
                conversation,
                descriptor,
                message,
                copy_allowed,
                expire_timeout,
            } => self.cmd_update_message(
                conversation,
                descriptor,
                message,
                copy_allowed,
                expire_timeout,
                now,
            ),
            Command::Annotate {
                conversation,
                descriptor,
                kind,
                value,
            } => self.cmd_annotate(conversation, descriptor, kind, value, now),
            Command::ResetConversation {
                conversation,
                min_sequence_id,
                peer_bounds,
                keep_media,
            } => self.cmd_reset(conversation, min_sequence_id, peer_bounds, keep_media, now),
            Command::InviteGroup {
                group,
                contact,
                group_name,
            } => self.cmd_invite_group(group, contact, group_name, now),
            Command::WithdrawInvite {
                contact,
                descriptor,
            } => self.cmd_withdraw_invite(contact, descriptor, now),
            Command::JoinGroup {
                via,
                group_id,
                member_id,
                permissions,
                public_key,
                secret,
            } => self.cmd_join_group(via, group_id, member_id, permissions, public_key, secret, now),
            Command::LeaveGroup { group } => self.cmd_leave_group(group, now),
            Command::UpdateGroupMember {
                group,
                member,
                permissions,
            } => self.cmd_update_group_member(group, member, permissions, now),
            Command::DeleteConversation { conversation } => {
                self.cmd_delete_conversation(conversation)
            }
            Command::SetForeground(foreground) => {
                self.foreground = foreground;
                if !foreground {
                    // Background transition also promotes deferred work.
                    self.promote_deferred(now);
                }
            }
            Command::EnterBackground => {
                self.foreground = false;
                self.promote_deferred(now);
            }
            Command::SetOnline(online) => self.cmd_set_online(online, now),
            Command::IncomingConnection { conversation, link } => {
                self.cmd_incoming_connection(conversation, link, now)
            }
            Command::LinkStateChanged {
                conversation,
                state,
                reason,
            } => self.cmd_link_state_changed(conversation, state, reason, now),
            Command::PacketReceived {
                conversation,
                bytes,
            } => self.cmd_packet_received(conversation, bytes, now),
            Command::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------
    // Enqueue paths
    // -----------------------------------------------------------------

    fn cmd_send_descriptor(
        &mut self,
        conversation: Uuid,
        now: i64,
        build: impl FnOnce(DescriptorId, DatabaseId, i64) -> (Descriptor, OperationType),
    ) {
        let Some(mut conversation) = self.conversation_by_uuid(&conversation) else {
            tracing::warn!(%conversation, "send for unknown conversation dropped");
            return;
        };
        let mut op_type = OperationType::PushObject;
        let created = {
            let conv_id = conversation.database_id;
            let op_type_out = &mut op_type;
            self.store
                .create_descriptor(&mut conversation, now, move |id, created| {
                    let (descriptor, ty) = build(id, conv_id, created);
                    *op_type_out = ty;
                    descriptor
                })
        };
        let descriptor = match created {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.database_error("descriptor create", &e);
                return;
            }
        };
        self.cache_conversation(&conversation);
        for target in self.link_conversations(&conversation) {
            self.enqueue_operation(
                &target,
                op_type,
                Some(descriptor.envelope().id.database_id),
                None,
                false,
                now,
            );
        }
    }

    fn cmd_send_transient(
        &mut self,
        conversation: Uuid,
        op_type: OperationType,
        payload: Vec<u8>,
        now: i64,
    ) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            return;
        };
        let open = self
            .connections
            .get(&conversation.database_id)
            .is_some_and(|connection| connection.state == LinkState::Open);
        if !open {
            // Transient signals are only meaningful right now.
            tracing::debug!(
                conversation = conversation.database_id,
                "no open link; transient dropped"
            );
            return;
        }
        let mut operation =
            PendingOperation::new(conversation.database_id, op_type, None, None, now);
        operation.id = self.next_transient_id;
        self.next_transient_id -= 1;
        operation.transient_payload = Some(payload);
        self.scheduler.enqueue(operation);
        self.run_operations(conversation.database_id, now);
    }

    fn cmd_forward(
        &mut self,
        from: Uuid,
        descriptor: DescriptorId,
        to: Uuid,
        expire_timeout: i64,
        copy_allowed: bool,
        now: i64,
    ) {
        let Some(source_conversation) = self.conversation_by_uuid(&from) else {
            return;
        };
        let Some(mut target) = self.conversation_by_uuid(&to) else {
            return;
        };
        let source = match self
            .store
            .load_descriptor(source_conversation.database_id, &descriptor)
        {
            Ok(Some(source)) => source,
            Ok(None) => return,
            Err(e) => {
                self.database_error("forward load", &e);
                return;
            }
        };
        if !source.can_forward() {
            tracing::warn!(descriptor = %descriptor, "descriptor cannot be forwarded");
            return;
        }
        let created = self.store.create_descriptor(&mut target, now, |id, created| {
            source
                .create_forward(
                    id,
                    0,
                    created,
                    expire_timeout,
                    None,
                    copy_allowed,
                )
                .unwrap_or_else(|| Descriptor::object(id, 0, created, String::new()))
        });
        let forwarded = match created {
            Ok(forwarded) => forwarded,
            Err(e) => {
                self.database_error("forward create", &e);
                return;
            }
        };
        self.cache_conversation(&target);
        let op_type = match forwarded.descriptor_type() {
            ty if ty.has_file() => OperationType::PushFile,
            DescriptorType::Geolocation => OperationType::PushGeolocation,
            DescriptorType::Twincode => OperationType::PushTwincode,
            _ => OperationType::PushObject,
        };
        // Record the forward on the source descriptor.
        let annotation = colloquy_model::Annotation {
            conversation_id: source_conversation.database_id,
            descriptor_id: source.envelope().id.database_id,
            peer_twincode: None,
            kind: AnnotationKind::Forward,
            value: 0,
            creation_date: now,
            notification_id: None,
        };
        if let Err(e) = self.store.annotate(&annotation) {
            self.database_error("forward annotation", &e);
        }
        self.enqueue_operation(
            &target,
            op_type,
            Some(forwarded.envelope().id.database_id),
            None,
            false,
            now,
        );
    }

    fn cmd_timestamp(
        &mut self,
        conversation: Uuid,
        descriptor: DescriptorId,
        kind: TimestampKind,
        timestamp: i64,
        now: i64,
    ) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            return;
        };
        let content_conversation = self.content_conversation(&conversation);
        let loaded = match self
            .store
            .load_descriptor(content_conversation.database_id, &descriptor)
        {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return,
            Err(e) => {
                self.database_error("timestamp load", &e);
                return;
            }
        };
        let id = loaded.envelope().id;
        if kind == TimestampKind::Delete && loaded.envelope().peer_delete_date > 0 {
            // The peer already dropped its copy; nothing to reconcile.
            match self.store.delete_descriptor_row(id.database_id) {
                Ok(operation_ids) => {
                    self.scheduler.evict_ids(&operation_ids);
                    self.events.emit(EngineEvent::DescriptorDeleted {
                        conversation_id: content_conversation.database_id,
                        descriptor_id: id,
                        peer_initiated: false,
                    });
                }
                Err(e) => self.database_error("descriptor delete", &e),
            }
            return;
        }
        let column = match kind {
            TimestampKind::Read => colloquy_db::DateColumn::Read,
            TimestampKind::Delete => colloquy_db::DateColumn::Delete,
            TimestampKind::PeerDelete => colloquy_db::DateColumn::PeerDelete,
        };
        if let Err(e) = self.store.set_descriptor_date(id.database_id, column, timestamp) {
            self.database_error("timestamp write", &e);
            return;
        }
        self.events.emit(EngineEvent::DescriptorUpdated {
            conversation_id: content_conversation.database_id,
            descriptor_id: id,
        });
        // Read receipts can wait for the next natural link.
        let deferrable = kind == TimestampKind::Read;
        for target in self.link_conversations(&conversation) {
            let content = OperationContent::Timestamp {
                kind,
                twincode: id.twincode_outbound_id,
                sequence_id: id.sequence_id,
                timestamp,
            };
            self.enqueue_operation(
                &target,
                OperationType::UpdateDescriptorTimestamp,
                Some(id.database_id),
                Some(content),
                deferrable,
                now,
            );
        }
    }

    fn cmd_delete_descriptor(&mut self, conversation: Uuid, descriptor: DescriptorId, now: i64) {
        self.cmd_timestamp(conversation, descriptor, TimestampKind::Delete, now, now);
    }

    fn cmd_update_message(
        &mut self,
        conversation: Uuid,
        descriptor: DescriptorId,
        message: Option<String>,
        copy_allowed: Option<bool>,
        expire_timeout: Option<i64>,
        now: i64,
    ) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            return;
        };
        let content_conversation = self.content_conversation(&conversation);
        let loaded = match self
            .store
            .load_descriptor(content_conversation.database_id, &descriptor)
        {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return,
            Err(e) => {
                self.database_error("update load", &e);
                return;
            }
        };
        // Only the owner edits content.
        if loaded.envelope().id.twincode_outbound_id != conversation.twincode_outbound {
            tracing::warn!(descriptor = %descriptor, "refusing to edit a peer descriptor");
            return;
        }
        let mut updated = (*loaded).clone();
        let mut update_flags = 0u32;
        if let Some(message) = message {
            if let Descriptor::Object(ref mut object) = updated {
                object.message = message;
                update_flags |= UPDATE_MESSAGE;
            }
        }
        if let Some(copy_allowed) = copy_allowed {
            updated
                .envelope_mut()
                .set_flag(FLAG_COPY_ALLOWED, copy_allowed);
            update_flags |= UPDATE_COPY_ALLOWED;
        }
        if let Some(expire_timeout) = expire_timeout {
            updated.envelope_mut().expire_timeout = expire_timeout;
            update_flags |= UPDATE_EXPIRATION;
        }
        if update_flags == 0 {
            return;
        }
        updated.envelope_mut().update_date = now;
        updated.envelope_mut().set_flag(FLAG_UPDATED, true);
        let id = updated.envelope().id;
        let stored = match self.store.update_descriptor(updated) {
            Ok(stored) => stored,
            Err(e) => {
                self.database_error("update write", &e);
                return;
            }
        };
        self.events.emit(EngineEvent::DescriptorUpdated {
            conversation_id: content_conversation.database_id,
            descriptor_id: stored.envelope().id,
        });
        for target in self.link_conversations(&conversation) {
            self.enqueue_operation(
                &target,
                OperationType::UpdateObject,
                Some(id.database_id),
                Some(OperationContent::UpdateObject { update_flags }),
                false,
                now,
            );
        }
    }

    fn cmd_annotate(
        &mut self,
        conversation: Uuid,
        descriptor: DescriptorId,
        kind: AnnotationKind,
        value: i64,
        now: i64,
    ) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            return;
        };
        let content_conversation = self.content_conversation(&conversation);
        let loaded = match self
            .store
            .load_descriptor(content_conversation.database_id, &descriptor)
        {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return,
            Err(e) => {
                self.database_error("annotate load", &e);
                return;
            }
        };
        let id = loaded.envelope().id;
        let annotation = colloquy_model::Annotation {
            conversation_id: content_conversation.database_id,
            descriptor_id: id.database_id,
            peer_twincode: None,
            kind,
            value,
            creation_date: now,
            notification_id: None,
        };
        if let Err(e) = self.store.annotate(&annotation) {
            self.database_error("annotate write", &e);
            return;
        }
        self.events.emit(EngineEvent::DescriptorUpdated {
            conversation_id: content_conversation.database_id,
            descriptor_id: id,
        });
        for target in self.link_conversations(&conversation) {
            self.enqueue_operation(
                &target,
                OperationType::UpdateAnnotations,
                Some(id.database_id),
                None,
                false,
                now,
            );
        }
    }

    fn cmd_reset(
        &mut self,
        conversation: Uuid,
        min_sequence_id: i64,
        peer_bounds: Vec<(Uuid, i64)>,
        keep_media: bool,
        now: i64,
    ) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            return;
        };
        for target in self.link_conversations(&conversation) {
            let content = OperationContent::Reset {
                min_sequence_id,
                peer_bounds: peer_bounds.clone(),
                reset_members: false,
                keep_media,
            };
            self.enqueue_operation(
                &target,
                OperationType::ResetConversation,
                None,
                Some(content),
                false,
                now,
            );
        }
    }

    fn cmd_invite_group(&mut self, group: Uuid, contact: Uuid, group_name: String, now: i64) {
        let Some(group) = self.conversation_by_uuid(&group) else {
            return;
        };
        if !group.is_group() {
            tracing::warn!(conversation = group.database_id, "invite target is not a group");
            return;
        }
        let Some(mut contact) = self.conversation_by_uuid(&contact) else {
            return;
        };
        let group_twincode = group.twincode_outbound;
        // The inviter slot is our member twincode; a fresh twincode is
        // allocated for the invited member.
        let inviter = group.twincode_outbound;
        let invited_member = Uuid::new_v4();
        let created = self.store.create_descriptor(&mut contact, now, |id, created| {
            Descriptor::Invitation(colloquy_model::InvitationDescriptor {
                envelope: colloquy_model::Envelope::outgoing(id, 0, created),
                group_name,
                group_twincode,
                public_key: None,
                inviter,
                member: invited_member,
                status: colloquy_types::InvitationStatus::Pending,
            })
        });
        let descriptor = match created {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.database_error("invitation create", &e);
                return;
            }
        };
        self.cache_conversation(&contact);
        if let Err(e) = self.store.link_invitation(
            descriptor.envelope().id.database_id,
            group.database_id,
            inviter,
        ) {
            self.database_error("invitation link", &e);
        }
        self.enqueue_operation(
            &contact,
            OperationType::InviteGroup,
            Some(descriptor.envelope().id.database_id),
            None,
            false,
            now,
        );
    }

    fn cmd_withdraw_invite(&mut self, contact: Uuid, descriptor: DescriptorId, now: i64) {
        let Some(contact) = self.conversation_by_uuid(&contact) else {
            return;
        };
        let loaded = match self.store.load_descriptor(contact.database_id, &descriptor) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return,
            Err(e) => {
                self.database_error("withdraw load", &e);
                return;
            }
        };
        let Descriptor::Invitation(invitation) = (*loaded).clone() else {
            tracing::warn!(descriptor = %descriptor, "withdraw target is not an invitation");
            return;
        };
        if !invitation.can_transition(colloquy_types::InvitationStatus::Withdrawn) {
            return;
        }
        let mut withdrawn = invitation;
        withdrawn.status = colloquy_types::InvitationStatus::Withdrawn;
        let id = withdrawn.envelope.id;
        match self.store.update_descriptor(Descriptor::Invitation(withdrawn)) {
            Ok(_) => {
                self.events.emit(EngineEvent::DescriptorUpdated {
                    conversation_id: contact.database_id,
                    descriptor_id: id,
                });
            }
            Err(e) => {
                self.database_error("withdraw write", &e);
                return;
            }
        }
        self.enqueue_operation(
            &contact,
            OperationType::WithdrawInviteGroup,
            Some(id.database_id),
            None,
            false,
            now,
        );
    }

    fn cmd_join_group(
        &mut self,
        via: Uuid,
        group_id: Uuid,
        member_id: Uuid,
        permissions: i64,
        public_key: Option<String>,
        secret: Option<Vec<u8>>,
        now: i64,
    ) {
        let Some(conversation) = self.conversation_by_uuid(&via) else {
            return;
        };
        let content = OperationContent::JoinGroup {
            group_id,
            member_id,
            permissions,
            public_key,
            secret,
        };
        self.enqueue_operation(
            &conversation,
            OperationType::JoinGroup,
            None,
            Some(content),
            false,
            now,
        );
    }

    fn cmd_leave_group(&mut self, group: Uuid, now: i64) {
        let Some(group_conversation) = self.conversation_by_uuid(&group) else {
            return;
        };
        if !group_conversation.is_group() {
            return;
        }
        if let Err(e) = self
            .store
            .set_group_state(group_conversation.database_id, GroupState::Leaving)
        {
            self.database_error("leave group", &e);
            return;
        }
        self.conversations.remove(&group_conversation.database_id);
        let members = match self.store.group_members(group_conversation.database_id) {
            Ok(members) => members,
            Err(e) => {
                self.database_error("leave group members", &e);
                return;
            }
        };
        for member in members {
            let Some(member_twincode) = member.peer_twincode_outbound else {
                continue;
            };
            let content = OperationContent::LeaveGroup {
                group_id: group_conversation.twincode_outbound,
                member_id: member_twincode,
            };
            self.enqueue_operation(
                &member,
                OperationType::LeaveGroup,
                None,
                Some(content),
                false,
                now,
            );
        }
    }

    fn cmd_update_group_member(&mut self, group: Uuid, member: Uuid, permissions: i64, now: i64) {
        let Some(group_conversation) = self.conversation_by_uuid(&group) else {
            return;
        };
        if !group_conversation.is_group() {
            return;
        }
        let members = match self.store.group_members(group_conversation.database_id) {
            Ok(members) => members,
            Err(e) => {
                self.database_error("update member", &e);
                return;
            }
        };
        for target in &members {
            if target.peer_twincode_outbound == Some(member) {
                if let Err(e) = self
                    .store
                    .update_member_permissions(target.database_id, permissions as u64)
                {
                    self.database_error("update member write", &e);
                }
                self.conversations.remove(&target.database_id);
            }
        }
        for target in members {
            if target.peer_twincode_outbound.is_none() {
                continue;
            }
            let content = OperationContent::UpdateMember {
                group_id: group_conversation.twincode_outbound,
                member_id: member,
                permissions,
                signed_off: false,
                signature: None,
            };
            self.enqueue_operation(
                &target,
                OperationType::UpdateGroupMember,
                None,
                Some(content),
                false,
                now,
            );
        }
    }

    fn cmd_delete_conversation(&mut self, conversation: Uuid) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            return;
        };
        let id = conversation.database_id;
        if let Some(connection) = self.connections.remove(&id) {
            connection.link.close(ErrorCode::Success);
            self.events.emit(EngineEvent::ConversationDisconnected {
                conversation_id: id,
                reason: ErrorCode::Success,
            });
        }
        self.scheduler.remove_conversation(id);
        self.backoff.remove(&id);
        self.conversations.remove(&id);
        self.by_uuid.remove(&conversation.uuid);
        if let Err(e) = self.store.delete_conversation_by_id(id) {
            self.database_error("conversation delete", &e);
        }
    }

    fn cmd_set_online(&mut self, online: bool, now: i64) {
        self.online = online;
        if !online {
            return;
        }
        // Prefer accepting inbound links first when background.
        let delay = if self.foreground {
            0
        } else {
            self.config.scheduler.delay_after_online_ms
        };
        for conversation_id in self.scheduler.conversations_with_work() {
            self.scheduler.schedule(conversation_id, now + delay);
        }
    }

    fn promote_deferred(&mut self, now: i64) {
        for conversation_id in self.scheduler.promote_all() {
            self.scheduler.schedule(conversation_id, now);
        }
    }

    /// Persist (when persistent) and queue an operation, then try to run.
    pub(crate) fn enqueue_operation(
        &mut self,
        conversation: &Conversation,
        op_type: OperationType,
        descriptor_id: Option<DatabaseId>,
        content: Option<OperationContent>,
        deferrable: bool,
        now: i64,
    ) {
        let mut operation = PendingOperation::new(
            conversation.database_id,
            op_type,
            descriptor_id,
            content,
            now,
        );
        if op_type.is_persistent() {
            let blob = operation.serialize();
            let chunk_start = (op_type == OperationType::PushFile).then_some(operation.chunk_start);
            match self.store.enqueue_operation(
                now,
                conversation.database_id,
                op_type,
                descriptor_id,
                chunk_start,
                blob.as_deref(),
            ) {
                Ok(id) => operation.id = id,
                Err(e) => {
                    self.database_error("operation enqueue", &e);
                    return;
                }
            }
        } else {
            operation.id = self.next_transient_id;
            self.next_transient_id -= 1;
        }
        self.events.emit(EngineEvent::OperationQueued {
            conversation_id: conversation.database_id,
            operation_id: operation.id,
            op_type,
        });

        let open = self
            .connections
            .get(&conversation.database_id)
            .is_some_and(|connection| connection.state == LinkState::Open);
        if !open && deferrable {
            self.scheduler.park_deferrable(operation);
            return;
        }
        self.scheduler.enqueue(operation);
        self.run_operations(conversation.database_id, now);
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    fn cmd_incoming_connection(&mut self, conversation: Uuid, link: Arc<dyn PeerLink>, now: i64) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            link.close(ErrorCode::Gone);
            return;
        };
        let id = conversation.database_id;
        if self.connections.contains_key(&id) {
            // An existing link (ours or theirs) wins.
            link.close(ErrorCode::Busy);
            return;
        }
        let Some(peer) = conversation.peer_twincode_outbound else {
            link.close(ErrorCode::Busy);
            return;
        };
        if !conversation.accepts_incoming_from(&peer) {
            // Our outgoing attempt owns the tie-break.
            link.close(ErrorCode::Busy);
            return;
        }
        self.connections.insert(
            id,
            Connection {
                link,
                state: LinkState::Opening,
                last_activity: now,
                pending_requests: HashMap::new(),
                assemblies: HashMap::new(),
                thumbnails: HashMap::new(),
            },
        );
    }

    fn cmd_link_state_changed(
        &mut self,
        conversation: Uuid,
        state: LinkState,
        reason: ErrorCode,
        now: i64,
    ) {
        let Some(conversation) = self.conversation_by_uuid(&conversation) else {
            return;
        };
        let id = conversation.database_id;
        match state {
            LinkState::Open => {
                let Some(connection) = self.connections.get_mut(&id) else {
                    return;
                };
                connection.state = LinkState::Open;
                connection.last_activity = now;
                let peer_state = connection.link.peer_device_state();
                if let Err(e) = self.store.touch_last_connect(id, now) {
                    self.database_error("last connect", &e);
                }
                self.backoff.entry(id).or_default().reset();
                if self.next_idle_check.is_none() {
                    self.next_idle_check =
                        Some(now + self.config.connections.first_idle_check_ms);
                }
                self.events
                    .emit(EngineEvent::ConversationConnected { conversation_id: id });
                self.scheduler.promote(id);
                if peer_state & DEVICE_STATE_SYNCHRONIZE_KEYS != 0 {
                    self.enqueue_operation(
                        &conversation,
                        OperationType::SynchronizeConversation,
                        None,
                        None,
                        false,
                        now,
                    );
                }
                self.run_operations(id, now);
            }
            LinkState::Closed => {
                if self.connections.remove(&id).is_some() {
                    self.events.emit(EngineEvent::ConversationDisconnected {
                        conversation_id: id,
                        reason,
                    });
                }
                self.on_link_down(id, reason, now);
            }
            other => {
                if let Some(connection) = self.connections.get_mut(&id) {
                    connection.state = other;
                }
            }
        }
    }

    /// Reset in-flight state after a link went away and arm the retry.
    pub(crate) fn on_link_down(&mut self, conversation_id: DatabaseId, reason: ErrorCode, now: i64) {
        let dropped = self.scheduler.reset_for_reconnect(conversation_id);
        if dropped > 0 {
            tracing::debug!(conversation = conversation_id, dropped, "transient operations dropped");
        }
        let backoff = self.backoff.entry(conversation_id).or_default();
        backoff.on_terminated(reason, now, &self.config.scheduler.backoff_ms);
        if self.scheduler.has_pending(conversation_id) {
            let at = backoff.next_attempt().max(now);
            self.scheduler.schedule(conversation_id, at);
        }
        if self.connections.is_empty() {
            self.next_idle_check = None;
        }
    }

    /// Drive one conversation: open a link when needed, pump when open.
    pub(crate) fn run_operations(&mut self, conversation_id: DatabaseId, now: i64) {
        let Some(conversation) = self.conversation_by_id(conversation_id) else {
            self.scheduler.remove_conversation(conversation_id);
            return;
        };
        if !conversation.has_peer() {
            return;
        }
        match self.connections.get(&conversation_id).map(|c| c.state) {
            Some(LinkState::Open) => self.pump_operations_inner(&conversation, now, false),
            Some(_) => {} // opening or closing; state changes drive us
            None => self.start_outgoing(&conversation, now),
        }
    }

    fn start_outgoing(&mut self, conversation: &Conversation, now: i64) {
        let id = conversation.database_id;
        if !self.scheduler.has_pending(id) {
            return;
        }
        if !self.online {
            return;
        }
        if self.connections.len() >= self.connection_limit() {
            self.scheduler.schedule(id, now + LIMIT_RETRY_MS);
            return;
        }
        let backoff = self.backoff.entry(id).or_default();
        if !backoff.ready(now) {
            let at = backoff.next_attempt();
            self.scheduler.schedule(id, at);
            return;
        }
        if let Err(e) = self.store.touch_last_retry(id, now) {
            self.database_error("last retry", &e);
        }
        match self.factory.start_outgoing(conversation) {
            Ok(link) => {
                self.connections.insert(
                    id,
                    Connection {
                        link,
                        state: LinkState::Opening,
                        last_activity: now,
                        pending_requests: HashMap::new(),
                        assemblies: HashMap::new(),
                        thumbnails: HashMap::new(),
                    },
                );
            }
            Err(code) => {
                tracing::debug!(conversation = id, ?code, "outgoing connection failed");
                self.on_link_down(id, code, now);
            }
        }
    }

    /// Close a link from our side and account for the termination.
    pub(crate) fn close_connection(&mut self, conversation_id: DatabaseId, reason: ErrorCode, now: i64) {
        if let Some(connection) = self.connections.remove(&conversation_id) {
            connection.link.close(reason);
            self.events.emit(EngineEvent::ConversationDisconnected {
                conversation_id,
                reason,
            });
        }
        self.on_link_down(conversation_id, reason, now);
    }

    fn check_idle(&mut self, now: i64) {
        let mut to_close: Vec<DatabaseId> = Vec::new();
        for (id, connection) in &self.connections {
            if connection.state != LinkState::Open {
                continue;
            }
            let mut threshold = if self.foreground {
                self.config.connections.idle_foreground_ms
            } else {
                self.config.connections.idle_background_ms
            };
            let transfer_active = !connection.assemblies.is_empty();
            if transfer_active || self.scheduler.has_pending(*id) {
                threshold *= 2;
            }
            if connection.link.peer_device_state() & DEVICE_STATE_HAS_OPERATIONS != 0 {
                threshold += self.config.connections.peer_pending_grace_ms;
            }
            if now - connection.last_activity > threshold {
                to_close.push(*id);
            }
        }
        for id in to_close {
            tracing::debug!(conversation = id, "closing idle link");
            self.close_connection(id, ErrorCode::Success, now);
        }
        self.next_idle_check = (!self.connections.is_empty())
            .then_some(now + self.config.connections.idle_check_period_ms);
    }

    /// Dispatch queued operations on an open link, one response in flight
    /// per conversation (file chunks windowed separately). Called after a
    /// response completed an operation.
    pub(crate) fn pump_operations(&mut self, conversation: &Conversation, now: i64) {
        self.pump_operations_inner(conversation, now, true);
    }

    fn pump_operations_inner(
        &mut self,
        conversation: &Conversation,
        now: i64,
        mut after_completion: bool,
    ) {
        let id = conversation.database_id;
        loop {
            let Some(connection) = self.connections.get(&id) else {
                return;
            };
            if connection.state != LinkState::Open {
                return;
            }
            let link = connection.link.clone();
            let device_state = self.our_device_state(id);

            let Some(operation) = self.scheduler.pick_idle(id) else {
                // The drained-and-both-background close applies only once
                // traffic actually completed; an idle fresh link is the
                // idle sweep's business.
                if after_completion {
                    self.maybe_close_idle_done(conversation, now);
                }
                return;
            };
            let operation_id = operation.id;
            let op_type = operation.op_type;
            let descriptor_id = operation.descriptor_id;
            let mut ctx = ExecuteContext {
                link: link.as_ref(),
                store: &self.store,
                conversation,
                device_state,
                now,
            };
            let code = operation.execute(&mut ctx);
            let request_id = operation.request_id;

            match code {
                ErrorCode::Queued => {
                    if let Some(connection) = self.connections.get_mut(&id) {
                        connection.pending_requests.insert(request_id, operation_id);
                        connection.last_activity = now;
                    }
                    if op_type == OperationType::PushFile {
                        self.pump_file(conversation, operation_id, now);
                    }
                    // Pipeline depth is one: wait for the response.
                    return;
                }
                ErrorCode::Success => {
                    self.finish_operation(id, operation_id, op_type, now);
                    after_completion = true;
                }
                ErrorCode::Expired => {
                    self.drop_operation(id, operation_id, op_type, None);
                }
                ErrorCode::BadRequest => {
                    self.drop_operation(id, operation_id, op_type, Some(ErrorCode::BadRequest));
                }
                ErrorCode::FeatureNotSupportedByPeer => {
                    if let Some(descriptor_id) = descriptor_id {
                        if let Err(e) = self.store.mark_descriptor_failed(descriptor_id) {
                            self.database_error("descriptor fail mark", &e);
                        }
                    }
                    self.drop_operation(
                        id,
                        operation_id,
                        op_type,
                        Some(ErrorCode::FeatureNotSupportedByPeer),
                    );
                }
                ErrorCode::DatabaseError => {
                    tracing::error!(operation = operation_id, "execution hit a database error");
                    return;
                }
                code => {
                    // Transient or fatal: the operation stays queued; the
                    // link will terminate and backoff takes over.
                    tracing::debug!(operation = operation_id, ?code, "dispatch failed");
                    return;
                }
            }
        }
    }

    /// Keep transmitting file chunks while the window has room.
    pub(crate) fn pump_file(
        &mut self,
        conversation: &Conversation,
        operation_id: DatabaseId,
        now: i64,
    ) {
        let id = conversation.database_id;
        loop {
            let Some(connection) = self.connections.get(&id) else {
                return;
            };
            if connection.state != LinkState::Open {
                return;
            }
            let link = connection.link.clone();
            let device_state = self.our_device_state(id);

            let Some(operation) = self.scheduler.find_by_id(id, operation_id) else {
                return;
            };
            if !operation.is_ready_to_send() {
                return;
            }
            let mut ctx = ExecuteContext {
                link: link.as_ref(),
                store: &self.store,
                conversation,
                device_state,
                now,
            };
            let code = operation.execute(&mut ctx);
            let request_id = operation.request_id;
            match code {
                ErrorCode::Queued => {
                    if let Some(connection) = self.connections.get_mut(&id) {
                        connection.pending_requests.insert(request_id, operation_id);
                        connection.last_activity = now;
                    }
                }
                ErrorCode::Expired => {
                    self.drop_operation(id, operation_id, OperationType::PushFile, None);
                    return;
                }
                code => {
                    tracing::debug!(operation = operation_id, ?code, "chunk dispatch stopped");
                    return;
                }
            }
        }
    }

    /// Close an open link when both sides are done and background.
    fn maybe_close_idle_done(&mut self, conversation: &Conversation, now: i64) {
        let id = conversation.database_id;
        let Some(connection) = self.connections.get(&id) else {
            return;
        };
        if self.scheduler.has_pending(id) {
            return;
        }
        let peer_state = connection.link.peer_device_state();
        if peer_state & DEVICE_STATE_HAS_OPERATIONS != 0 {
            return;
        }
        if self.foreground || peer_state & DEVICE_STATE_FOREGROUND != 0 {
            return;
        }
        self.close_connection(id, ErrorCode::Success, now);
    }

    /// Remove a completed operation from the queue and the table.
    pub(crate) fn finish_operation(
        &mut self,
        conversation_id: DatabaseId,
        operation_id: DatabaseId,
        op_type: OperationType,
        now: i64,
    ) {
        if let Some(operation) = self.scheduler.take_by_id(conversation_id, operation_id) {
            if operation.op_type.is_persistent() {
                if let Err(e) = self.store.delete_operation(operation.id) {
                    self.database_error("operation delete", &e);
                }
            }
        }
        if let Some(connection) = self.connections.get_mut(&conversation_id) {
            connection.last_activity = now;
            connection
                .pending_requests
                .retain(|_, op| *op != operation_id);
        }
        self.events.emit(EngineEvent::OperationCompleted {
            conversation_id,
            operation_id,
            op_type,
        });
    }

    /// Remove a dead operation; `error` says whether to surface a failure.
    pub(crate) fn drop_operation(
        &mut self,
        conversation_id: DatabaseId,
        operation_id: DatabaseId,
        op_type: OperationType,
        error: Option<ErrorCode>,
    ) {
        if let Some(operation) = self.scheduler.take_by_id(conversation_id, operation_id) {
            if operation.op_type.is_persistent() {
                if let Err(e) = self.store.delete_operation(operation.id) {
                    self.database_error("operation delete", &e);
                }
            }
        }
        if let Some(connection) = self.connections.get_mut(&conversation_id) {
            connection
                .pending_requests
                .retain(|_, op| *op != operation_id);
        }
        match error {
            Some(error) => {
                self.events.emit(EngineEvent::OperationFailed {
                    conversation_id,
                    operation_id,
                    op_type,
                    error,
                });
            }
            None => {
                tracing::debug!(operation = operation_id, "expired operation removed");
            }
        }
    }
}
