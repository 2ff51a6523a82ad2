//! The transport capability consumed by the engine.
//!
//! A `PeerLink` is one transient authenticated channel to one peer device.
//! The engine never owns the transport; it sends serialized IQs, draws
//! request ids, and reads the negotiated version and tuning hints. Inbound
//! IQs and state changes are delivered to the engine's command channel by
//! the transport integration, not through this trait.

use std::path::PathBuf;

use colloquy_types::ErrorCode;

/// Lifecycle of a peer link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing happened yet.
    Init,
    /// Connection attempt in progress.
    Opening,
    /// IQs may flow.
    Open,
    /// Teardown initiated.
    Closing,
    /// Terminated; the reason travels with the state-change event.
    Closed,
}

/// Per-link transport contract.
pub trait PeerLink: Send + Sync {
    /// Transmit one serialized IQ. Sends are serialized by the link.
    fn send_packet(&self, bytes: Vec<u8>) -> Result<(), ErrorCode>;

    /// Draw the next request id; monotonic per link, never zero.
    fn new_request_id(&self) -> i64;

    /// Highest protocol major version the peer supports.
    fn max_peer_major_version(&self) -> i32;

    /// Highest minor version the peer supports for a major version.
    fn max_peer_minor_version(&self, major: i32) -> i32;

    /// Whether the peer supports at least `(major, minor)`.
    fn is_supported(&self, major: i32, minor: i32) -> bool {
        let peer_major = self.max_peer_major_version();
        if peer_major != major {
            return peer_major > major;
        }
        self.max_peer_minor_version(major) >= minor
    }

    /// The transport's currently advised chunk size, in bytes.
    fn best_chunk_size(&self) -> usize;

    /// Directory holding file blobs, when the execution context has one.
    fn files_dir(&self) -> Option<PathBuf>;

    /// Peer device state bitmask (`DEVICE_STATE_*`).
    fn peer_device_state(&self) -> u32;

    /// Initiate teardown. The transport reports the final `Closed` state
    /// change with the given reason through the engine's command channel.
    fn close(&self, reason: ErrorCode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FixedLink {
        major: i32,
        minor: i32,
        next_id: AtomicI64,
    }

    impl PeerLink for FixedLink {
        fn send_packet(&self, _bytes: Vec<u8>) -> Result<(), ErrorCode> {
            Ok(())
        }
        fn new_request_id(&self) -> i64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
        fn max_peer_major_version(&self) -> i32 {
            self.major
        }
        fn max_peer_minor_version(&self, major: i32) -> i32 {
            if major == self.major {
                self.minor
            } else {
                0
            }
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
        fn close(&self, _reason: ErrorCode) {}
    }

    #[test]
    fn test_version_support() {
        let link = FixedLink {
            major: 2,
            minor: 18,
            next_id: AtomicI64::new(1),
        };
        assert!(link.is_supported(2, 7));
        assert!(link.is_supported(2, 18));
        assert!(!link.is_supported(2, 20));
        assert!(link.is_supported(1, 99));
        assert!(!link.is_supported(3, 0));
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let link = FixedLink {
            major: 2,
            minor: 20,
            next_id: AtomicI64::new(1),
        };
        let first = link.new_request_id();
        let second = link.new_request_id();
        assert!(second > first);
    }
}
