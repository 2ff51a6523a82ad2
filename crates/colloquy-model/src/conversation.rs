//! Conversations and group members.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use colloquy_types::{DatabaseId, GroupState};

/// What kind of conversation a row represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    /// One-to-one with a contact.
    Contact,
    /// A group; its row id doubles as the group id.
    Group,
    /// One member of a group; shares the group's subject.
    GroupMember,
}

/// The persistent relationship under which descriptors flow.
///
/// A group is stored as one `Group` row whose `group_id` equals its own
/// row id, plus one `GroupMember` row per member pointing back at it.
/// Back-pointers stay in the database; in memory the scheduler resolves
/// conversations through an id-keyed map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Local row id.
    pub database_id: DatabaseId,
    /// Group row id; `None` for contacts, own id for groups.
    pub group_id: Option<DatabaseId>,
    /// Stable conversation identifier.
    pub uuid: Uuid,
    /// Creation time, epoch milliseconds.
    pub creation_date: i64,
    /// Repository object this conversation is about.
    pub subject: Uuid,
    /// For member rows created from an invitation, the invited contact.
    pub invited_contact: Option<Uuid>,
    /// The peer's twincode outbound; `None` for group rows themselves.
    pub peer_twincode_outbound: Option<Uuid>,
    /// Our twincode outbound used on this conversation.
    pub twincode_outbound: Uuid,
    /// This device's instance id.
    pub resource_id: Uuid,
    /// The peer device instance we last talked to.
    pub peer_resource_id: Option<Uuid>,
    /// What the peer may do in this conversation.
    pub permissions: u64,
    /// What members may do with the group roster (groups only).
    pub join_permissions: u64,
    /// Membership state (groups and members only).
    pub state: Option<GroupState>,
    /// Next local sequence id handed to an outgoing descriptor.
    pub next_sequence_id: i64,
    /// Last successful link open.
    pub last_connect_date: Option<i64>,
    /// Last outgoing attempt.
    pub last_retry_date: Option<i64>,
    /// Conversation flag bitmap.
    pub flags: u64,
}

impl Conversation {
    /// Classify the row.
    pub fn kind(&self) -> ConversationKind {
        match self.group_id {
            None => ConversationKind::Contact,
            Some(group_id) if group_id == self.database_id => ConversationKind::Group,
            Some(_) => ConversationKind::GroupMember,
        }
    }

    /// Whether a peer device can be reached for this conversation.
    ///
    /// Group rows themselves have no peer; their members do.
    pub fn has_peer(&self) -> bool {
        self.peer_twincode_outbound.is_some()
    }

    /// Whether this is the group row (not a member, not a contact).
    pub fn is_group(&self) -> bool {
        self.kind() == ConversationKind::Group
    }

    /// Whether this is a member row of some group.
    pub fn is_group_member(&self) -> bool {
        self.kind() == ConversationKind::GroupMember
    }

    /// Tie-break for simultaneous connection attempts: the side whose
    /// twincode sorts lower keeps its incoming slot.
    pub fn accepts_incoming_from(&self, peer_twincode: &Uuid) -> bool {
        self.twincode_outbound.as_bytes() < peer_twincode.as_bytes()
    }
}
