//! Persisted type codes.
//!
//! Every enum here has a stable numeric code stored in the database or on
//! the wire. Unknown codes decode to `None` so that records written by a
//! newer revision are dropped rather than crashing the reader.

use serde::{Deserialize, Serialize};

/// Stable descriptor type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DescriptorType {
    /// Base descriptor with no payload.
    Descriptor = 1,
    /// Text message.
    Object = 2,
    /// Transient signal, never persisted.
    Transient = 3,
    /// Raw file.
    File = 4,
    /// Image file.
    Image = 5,
    /// Audio file.
    Audio = 6,
    /// Video file.
    Video = 7,
    /// File with a user-facing name.
    NamedFile = 8,
    /// Group invitation.
    Invitation = 9,
    /// Geolocation share.
    Geolocation = 10,
    /// Twincode card share.
    Twincode = 11,
    /// Call record.
    Call = 12,
    /// Conversation clear marker.
    Clear = 13,
}

impl DescriptorType {
    /// Decode a persisted type code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Descriptor),
            2 => Some(Self::Object),
            3 => Some(Self::Transient),
            4 => Some(Self::File),
            5 => Some(Self::Image),
            6 => Some(Self::Audio),
            7 => Some(Self::Video),
            8 => Some(Self::NamedFile),
            9 => Some(Self::Invitation),
            10 => Some(Self::Geolocation),
            11 => Some(Self::Twincode),
            12 => Some(Self::Call),
            13 => Some(Self::Clear),
            _ => None,
        }
    }

    /// The persisted code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this type carries a file blob on disk.
    pub fn has_file(self) -> bool {
        matches!(
            self,
            Self::File | Self::Image | Self::Audio | Self::Video | Self::NamedFile
        )
    }
}

/// Stable operation type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationType {
    /// Ask the peer to delete everything up to a sequence bound.
    ResetConversation = 0,
    /// Reconcile history after a reconnect.
    SynchronizeConversation = 1,
    /// Deliver a text message descriptor.
    PushObject = 2,
    /// Fire-and-forget signal (typing, ...). Never persisted.
    PushTransientObject = 3,
    /// Deliver a file descriptor and its byte stream.
    PushFile = 4,
    /// Push a read/delete/peer-delete timestamp.
    UpdateDescriptorTimestamp = 5,
    /// Invite a contact into a group.
    InviteGroup = 6,
    /// Withdraw a pending group invitation.
    WithdrawInviteGroup = 7,
    /// Join a group we were invited to.
    JoinGroup = 8,
    /// Leave a group.
    LeaveGroup = 9,
    /// Update a group member's permissions.
    UpdateGroupMember = 10,
    /// Deliver a geolocation descriptor.
    PushGeolocation = 11,
    /// Deliver a twincode card descriptor.
    PushTwincode = 12,
    /// Transient realtime command sidecar. Never persisted.
    PushCommand = 13,
    /// Synchronize our annotation rows for a descriptor.
    UpdateAnnotations = 14,
    /// Server-brokered group join.
    InvokeJoinGroup = 15,
    /// Server-brokered group leave.
    InvokeLeaveGroup = 16,
    /// Server-brokered member addition.
    InvokeAddMemberGroup = 17,
    /// Push content/flag/expiration edits for a sent message.
    UpdateObject = 18,
}

impl OperationType {
    /// Decode a persisted type code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ResetConversation),
            1 => Some(Self::SynchronizeConversation),
            2 => Some(Self::PushObject),
            3 => Some(Self::PushTransientObject),
            4 => Some(Self::PushFile),
            5 => Some(Self::UpdateDescriptorTimestamp),
            6 => Some(Self::InviteGroup),
            7 => Some(Self::WithdrawInviteGroup),
            8 => Some(Self::JoinGroup),
            9 => Some(Self::LeaveGroup),
            10 => Some(Self::UpdateGroupMember),
            11 => Some(Self::PushGeolocation),
            12 => Some(Self::PushTwincode),
            13 => Some(Self::PushCommand),
            14 => Some(Self::UpdateAnnotations),
            15 => Some(Self::InvokeJoinGroup),
            16 => Some(Self::InvokeLeaveGroup),
            17 => Some(Self::InvokeAddMemberGroup),
            18 => Some(Self::UpdateObject),
            _ => None,
        }
    }

    /// The persisted code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether operations of this type survive a restart.
    pub fn is_persistent(self) -> bool {
        !matches!(self, Self::PushTransientObject | Self::PushCommand)
    }

    /// Whether this operation delivers a descriptor to the peer.
    pub fn is_push(self) -> bool {
        matches!(
            self,
            Self::PushObject
                | Self::PushFile
                | Self::PushGeolocation
                | Self::PushTwincode
                | Self::InviteGroup
        )
    }
}

/// Annotation kind codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AnnotationKind {
    /// The descriptor was forwarded somewhere by us.
    Forward = 1,
    /// The descriptor is itself a forward of another descriptor.
    Forwarded = 2,
    /// The descriptor was saved out of the conversation.
    Save = 3,
    /// Emoji reaction; the value selects the emoji.
    Like = 4,
    /// Poll answer; the value selects the choice.
    Poll = 5,
}

impl AnnotationKind {
    /// Decode a persisted kind code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Forward),
            2 => Some(Self::Forwarded),
            3 => Some(Self::Save),
            4 => Some(Self::Like),
            5 => Some(Self::Poll),
            _ => None,
        }
    }

    /// The persisted code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Group conversation membership state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GroupState {
    /// We received an invitation and have not answered.
    Invited = 0,
    /// We are a member.
    Joined = 1,
    /// Our leave is queued but not yet acknowledged.
    Leaving = 2,
    /// We left; history is retained until purge.
    Left = 3,
}

impl GroupState {
    /// Decode a persisted state code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Invited),
            1 => Some(Self::Joined),
            2 => Some(Self::Leaving),
            3 => Some(Self::Left),
            _ => None,
        }
    }

    /// The persisted code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Status of an invitation descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InvitationStatus {
    /// Sent, not answered.
    Pending = 0,
    /// The invitee joined the group.
    Joined = 1,
    /// The inviter withdrew the invitation.
    Withdrawn = 2,
    /// The invitee accepted but has not completed the join.
    Accepted = 3,
}

impl InvitationStatus {
    /// Decode a persisted status code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Joined),
            2 => Some(Self::Withdrawn),
            3 => Some(Self::Accepted),
            _ => None,
        }
    }

    /// The persisted code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Which timestamp an `UpdateDescriptorTimestamp` operation carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TimestampKind {
    /// The peer read the descriptor.
    Read = 1,
    /// The sender deleted the descriptor.
    Delete = 2,
    /// The receiver deleted the descriptor.
    PeerDelete = 3,
}

impl TimestampKind {
    /// Decode a persisted kind code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Read),
            2 => Some(Self::Delete),
            3 => Some(Self::PeerDelete),
            _ => None,
        }
    }

    /// The persisted code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_type_roundtrip() {
        for code in 1..=13u8 {
            let ty = DescriptorType::from_code(code).expect("known code");
            assert_eq!(ty.code(), code);
        }
        assert!(DescriptorType::from_code(0).is_none());
        assert!(DescriptorType::from_code(14).is_none());
    }

    #[test]
    fn test_operation_type_roundtrip() {
        for code in 0..=18u8 {
            let ty = OperationType::from_code(code).expect("known code");
            assert_eq!(ty.code(), code);
        }
        assert!(OperationType::from_code(19).is_none());
    }

    #[test]
    fn test_transient_operations_not_persistent() {
        assert!(!OperationType::PushTransientObject.is_persistent());
        assert!(!OperationType::PushCommand.is_persistent());
        assert!(OperationType::PushObject.is_persistent());
        assert!(OperationType::ResetConversation.is_persistent());
    }

    #[test]
    fn test_file_types() {
        assert!(DescriptorType::Image.has_file());
        assert!(DescriptorType::NamedFile.has_file());
        assert!(!DescriptorType::Object.has_file());
        assert!(!DescriptorType::Invitation.has_file());
    }

    #[test]
    fn test_annotation_kind_codes() {
        assert_eq!(AnnotationKind::Forward.code(), 1);
        assert_eq!(AnnotationKind::Poll.code(), 5);
        assert!(AnnotationKind::from_code(6).is_none());
    }
}
