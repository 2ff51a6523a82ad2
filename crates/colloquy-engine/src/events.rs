//! Engine event emission.
//!
//! Events are pushed from the engine run loop to subscribers over a
//! bounded broadcast channel; a slow subscriber loses the oldest events,
//! never blocks the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use colloquy_types::{DatabaseId, DescriptorId, ErrorCode, OperationType};

/// An event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// An operation was persisted and queued.
    OperationQueued {
        conversation_id: DatabaseId,
        operation_id: DatabaseId,
        op_type: OperationType,
    },
    /// An operation completed and was removed.
    OperationCompleted {
        conversation_id: DatabaseId,
        operation_id: DatabaseId,
        op_type: OperationType,
    },
    /// An operation failed terminally and was removed.
    OperationFailed {
        conversation_id: DatabaseId,
        operation_id: DatabaseId,
        op_type: OperationType,
        error: ErrorCode,
    },
    /// A new descriptor arrived from a peer.
    DescriptorReceived {
        conversation_id: DatabaseId,
        descriptor_id: DescriptorId,
    },
    /// A stored descriptor changed (timestamps, edits, annotations).
    DescriptorUpdated {
        conversation_id: DatabaseId,
        descriptor_id: DescriptorId,
    },
    /// A descriptor was removed.
    DescriptorDeleted {
        conversation_id: DatabaseId,
        descriptor_id: DescriptorId,
        peer_initiated: bool,
    },
    /// A peer link reached the open state.
    ConversationConnected { conversation_id: DatabaseId },
    /// A peer link terminated.
    ConversationDisconnected {
        conversation_id: DatabaseId,
        reason: ErrorCode,
    },
    /// A group invitation arrived.
    GroupInvited {
        conversation_id: DatabaseId,
        descriptor_id: DescriptorId,
    },
    /// A group roster was resolved after a join.
    GroupJoined {
        group_id: DatabaseId,
        members: Vec<(Uuid, u64)>,
    },
    /// A member left a group.
    GroupLeft {
        group_id: DatabaseId,
        member: Uuid,
    },
    /// A transient signal arrived (typing, ...). Never persisted.
    TransientReceived {
        conversation_id: DatabaseId,
        payload: Vec<u8>,
    },
    /// A realtime command arrived. Never persisted.
    CommandReceived {
        conversation_id: DatabaseId,
        payload: Vec<u8>,
    },
    /// The persistence layer failed; surfaced, never self-repaired.
    DatabaseError { detail: String },
}

/// Event bus for broadcasting engine events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: EngineEvent) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Get the current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::ConversationConnected { conversation_id: 7 });

        match rx.try_recv().expect("receive event") {
            EngineEvent::ConversationConnected { conversation_id } => {
                assert_eq!(conversation_id, 7);
            }
            other => unreachable!("wrong event: {other:?}"),
        }
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(EngineEvent::DatabaseError {
            detail: "nobody listening".into(),
        });
        assert_eq!(bus.sequence(), 1);
    }
}
