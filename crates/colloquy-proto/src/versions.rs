//! Version gates.
//!
//! Every request kind has a minimum negotiated peer version. Senders
//! facing an older peer either fall back to an older schema (descriptor
//! envelope v3) or fail the operation with `FeatureNotSupportedByPeer`.

use colloquy_model::{ENVELOPE_VERSION_3, ENVELOPE_VERSION_4};
use colloquy_types::OperationType;

use crate::link::PeerLink;

/// Protocol major version of the conversation IQ set.
pub const MAJOR_VERSION: i32 = 2;

/// Base conversation set (push, reset, timestamps, groups).
pub const MINOR_VERSION_7: i32 = 7;
/// Envelope v4 extensions (expiration, addressing) and twincode cards.
pub const MINOR_VERSION_12: i32 = 12;
/// Annotation synchronization and realtime commands.
pub const MINOR_VERSION_18: i32 = 18;
/// Message edits.
pub const MINOR_VERSION_20: i32 = 20;

/// The minimum peer version required for one operation type.
pub fn required_version(op_type: OperationType) -> (i32, i32) {
    let minor = match op_type {
        OperationType::PushTwincode => MINOR_VERSION_12,
        OperationType::UpdateAnnotations | OperationType::PushCommand => MINOR_VERSION_18,
        OperationType::UpdateObject => MINOR_VERSION_20,
        _ => MINOR_VERSION_7,
    };
    (MAJOR_VERSION, minor)
}

/// Whether a link can carry one operation type at all.
pub fn supports(link: &dyn PeerLink, op_type: OperationType) -> bool {
    let (major, minor) = required_version(op_type);
    link.is_supported(major, minor)
}

/// The descriptor envelope generation to encode for a link.
pub fn envelope_version_for(link: &dyn PeerLink) -> i32 {
    if link.is_supported(MAJOR_VERSION, MINOR_VERSION_12) {
        ENVELOPE_VERSION_4
    } else {
        ENVELOPE_VERSION_3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::ErrorCode;
    use std::path::PathBuf;

    struct VersionLink(i32);

    impl PeerLink for VersionLink {
        fn send_packet(&self, _bytes: Vec<u8>) -> Result<(), ErrorCode> {
            Ok(())
        }
        fn new_request_id(&self) -> i64 {
            1
        }
        fn max_peer_major_version(&self) -> i32 {
            MAJOR_VERSION
        }
        fn max_peer_minor_version(&self, _major: i32) -> i32 {
            self.0
        }
        fn best_chunk_size(&self) -> usize {
            16_384
        }
        fn files_dir(&self) -> Option<PathBuf> {
            None
        }
        fn peer_device_state(&self) -> u32 {
            0
        }
        fn close(&self, _reason: colloquy_types::ErrorCode) {}
    }

    #[test]
    fn test_required_versions() {
        assert_eq!(required_version(OperationType::PushObject), (2, 7));
        assert_eq!(required_version(OperationType::PushTwincode), (2, 12));
        assert_eq!(required_version(OperationType::UpdateAnnotations), (2, 18));
        assert_eq!(required_version(OperationType::UpdateObject), (2, 20));
    }

    #[test]
    fn test_old_peer_gets_envelope_v3() {
        assert_eq!(envelope_version_for(&VersionLink(7)), ENVELOPE_VERSION_3);
        assert_eq!(envelope_version_for(&VersionLink(12)), ENVELOPE_VERSION_4);
        assert_eq!(envelope_version_for(&VersionLink(20)), ENVELOPE_VERSION_4);
    }

    #[test]
    fn test_update_object_gate() {
        assert!(!supports(&VersionLink(18), OperationType::UpdateObject));
        assert!(supports(&VersionLink(20), OperationType::UpdateObject));
    }
}
