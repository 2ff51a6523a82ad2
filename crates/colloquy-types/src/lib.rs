//! # colloquy-types
//!
//! Shared domain types used across the colloquy workspace: identifiers,
//! the error-code taxonomy, persisted type codes, bitmasks, and the
//! tuning constants of the scheduler and the file-transfer window.
//!
//! All timestamps in the engine are Unix epoch milliseconds (`i64`).
//! A value of `0` means "pending" and `-1` is the failure sentinel.

pub mod codes;
pub mod error;
pub mod id;

pub use codes::{
    AnnotationKind, DescriptorType, GroupState, InvitationStatus, OperationType, TimestampKind,
};
pub use error::ErrorCode;
pub use id::{DatabaseId, DescriptorId};

/// Timestamp sentinel: the send/receive/read action failed permanently.
pub const TIMESTAMP_FAILED: i64 = -1;

/// Timestamp sentinel: the action has not happened yet.
pub const TIMESTAMP_PENDING: i64 = 0;

/// Sliding-window size for file transfer, in bytes.
pub const DATA_WINDOW_SIZE: i64 = 262_144;

/// Upper bound on the payload of a single file-chunk IQ, in bytes.
pub const MAX_CHUNK_SIZE: usize = 262_144;

/// Durable chunk offset before the peer has acknowledged anything.
pub const NOT_INITIALIZED: i64 = -1;

/// Request-id value of an operation that is not in flight.
pub const NO_REQUEST_ID: i64 = 0;

/// Operations older than this are expired during the load sweep (14 days).
pub const OPERATION_MAX_AGE_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Maximum active members plus pending invitations in one group.
pub const MAX_GROUP_MEMBERS: usize = 100;

/// Reconnection backoff table, indexed by slot.
pub const BACKOFF_DELAYS_MS: [i64; 7] = [
    20_000,    // 20 s
    30_000,    // 30 s
    240_000,   // 4 min
    960_000,   // 16 min
    1_920_000, // 32 min
    3_600_000, // 60 min
    7_200_000, // 120 min
];

/// Active-connection limit while the host process is foreground.
pub const MAX_ACTIVE_CONNECTIONS_FOREGROUND: usize = 16;

/// Active-connection limit while the host process is background.
pub const MAX_ACTIVE_CONNECTIONS_BACKGROUND: usize = 8;

/// Cadence of the idle sweep while any link is open.
pub const IDLE_CHECK_PERIOD_MS: i64 = 5_000;

/// Delay before the first idle sweep after the first link opens.
pub const FIRST_IDLE_CHECK_MS: i64 = 10_000;

/// Idle threshold before closing a link, foreground.
pub const IDLE_TIMEOUT_FOREGROUND_MS: i64 = 120_000;

/// Idle threshold before closing a link, background.
pub const IDLE_TIMEOUT_BACKGROUND_MS: i64 = 5_000;

/// Extra idle allowance when the peer signals pending operations.
pub const PEER_PENDING_GRACE_MS: i64 = 5_000;

/// Deferral of the first scheduling pass after coming online, background.
pub const DELAY_AFTER_ONLINE_MS: i64 = 500;

/// Stagger between per-conversation dispatches in one scheduling pass.
pub const OPERATION_STAGGER_MS: i64 = 50;

/// Peer device state bit: the state word is populated.
pub const DEVICE_STATE_VALID: u32 = 0x01;
/// Peer device state bit: the peer application is foreground.
pub const DEVICE_STATE_FOREGROUND: u32 = 0x02;
/// Peer device state bit: the peer has operations queued for us.
pub const DEVICE_STATE_HAS_OPERATIONS: u32 = 0x04;
/// Peer device state bit: the peer wants a key synchronization pass.
pub const DEVICE_STATE_SYNCHRONIZE_KEYS: u32 = 0x08;

/// Descriptor flag: the receiver may copy/forward the content.
pub const FLAG_COPY_ALLOWED: u32 = 0x01;
/// Descriptor flag: a thumbnail accompanies the content.
pub const FLAG_HAS_THUMBNAIL: u32 = 0x02;
/// Descriptor flag: the content was edited after sending.
pub const FLAG_UPDATED: u32 = 0x04;
/// Descriptor flag (calls): the call was not answered.
pub const FLAG_CALL_MISSED: u32 = 0x10;
/// Descriptor flag (calls): the call carried video.
pub const FLAG_CALL_VIDEO: u32 = 0x20;
/// Descriptor flag (calls): the call was initiated by us.
pub const FLAG_CALL_OUTGOING: u32 = 0x40;

/// Conversation permission bit: peer may send messages.
pub const PERMISSION_SEND_MESSAGE: u64 = 0x01;
/// Conversation permission bit: peer may send files and media.
pub const PERMISSION_SEND_FILE: u64 = 0x02;
/// Conversation permission bit: peer may send geolocations.
pub const PERMISSION_SEND_GEOLOCATION: u64 = 0x04;
/// Conversation permission bit: peer may send twincode cards.
pub const PERMISSION_SEND_TWINCODE: u64 = 0x08;
/// Conversation permission bit: peer may update its sent messages.
pub const PERMISSION_UPDATE_MESSAGE: u64 = 0x10;
/// Group join permission bit: member may invite further members.
pub const PERMISSION_INVITE_MEMBER: u64 = 0x20;
/// Group join permission bit: member may remove other members.
pub const PERMISSION_REMOVE_MEMBER: u64 = 0x40;
/// Default permission set granted to a new contact conversation.
pub const DEFAULT_PERMISSIONS: u64 = PERMISSION_SEND_MESSAGE
    | PERMISSION_SEND_FILE
    | PERMISSION_SEND_GEOLOCATION
    | PERMISSION_SEND_TWINCODE
    | PERMISSION_UPDATE_MESSAGE;

/// Update flag for `UpdateObject`: the message body changed.
pub const UPDATE_MESSAGE: u32 = 0x01;
/// Update flag for `UpdateObject`: the copy-allowed flag changed.
pub const UPDATE_COPY_ALLOWED: u32 = 0x02;
/// Update flag for `UpdateObject`: the expiration timeout changed.
pub const UPDATE_EXPIRATION: u32 = 0x04;

/// Current Unix time in epoch milliseconds.
pub fn now_ms() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_table_is_monotonic() {
        for pair in BACKOFF_DELAYS_MS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(BACKOFF_DELAYS_MS[0], 20_000);
        assert_eq!(BACKOFF_DELAYS_MS[6], 120 * 60 * 1000);
    }

    #[test]
    fn test_operation_max_age() {
        assert_eq!(OPERATION_MAX_AGE_MS, 1_209_600_000);
    }

    #[test]
    fn test_now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
