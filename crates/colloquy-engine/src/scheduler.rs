//! Scheduler state: per-conversation operation queues, the deadline set,
//! and the deferrable parking lot.
//!
//! All of this is owned by the engine run loop; there is no locking here.
//! The deadline set orders `(deadline, conversation)` pairs; any deadline
//! change removes and re-inserts the pair to keep the ordering invariant.

use std::collections::{BTreeSet, HashMap, VecDeque};

use colloquy_proto::PendingOperation;
use colloquy_types::{DatabaseId, NO_REQUEST_ID};

/// Queues and deadlines of every conversation with work.
#[derive(Default)]
pub struct Scheduler {
    queues: HashMap<DatabaseId, VecDeque<PendingOperation>>,
    waiting: BTreeSet<(i64, DatabaseId)>,
    scheduled: HashMap<DatabaseId, i64>,
    deferrable: HashMap<DatabaseId, Vec<PendingOperation>>,
}

impl Scheduler {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation to its conversation queue (enqueue order is
    /// delivery order).
    pub fn enqueue(&mut self, operation: PendingOperation) {
        self.queues
            .entry(operation.conversation_id)
            .or_default()
            .push_back(operation);
    }

    /// Park an operation for a closed conversation until promotion.
    pub fn park_deferrable(&mut self, operation: PendingOperation) {
        self.deferrable
            .entry(operation.conversation_id)
            .or_default()
            .push(operation);
    }

    /// Promote parked operations of one conversation into its queue.
    pub fn promote(&mut self, conversation_id: DatabaseId) -> usize {
        let Some(parked) = self.deferrable.remove(&conversation_id) else {
            return 0;
        };
        let count = parked.len();
        let queue = self.queues.entry(conversation_id).or_default();
        for operation in parked {
            queue.push_back(operation);
        }
        count
    }

    /// Promote every parked operation; returns the touched conversations.
    pub fn promote_all(&mut self) -> Vec<DatabaseId> {
        let conversations: Vec<DatabaseId> = self.deferrable.keys().copied().collect();
        for conversation_id in &conversations {
            self.promote(*conversation_id);
        }
        conversations
    }

    /// Arm (or move) a conversation's wake-up deadline.
    pub fn schedule(&mut self, conversation_id: DatabaseId, deadline: i64) {
        if let Some(previous) = self.scheduled.insert(conversation_id, deadline) {
            self.waiting.remove(&(previous, conversation_id));
        }
        self.waiting.insert((deadline, conversation_id));
    }

    /// Drop a conversation's wake-up deadline.
    pub fn unschedule(&mut self, conversation_id: DatabaseId) {
        if let Some(deadline) = self.scheduled.remove(&conversation_id) {
            self.waiting.remove(&(deadline, conversation_id));
        }
    }

    /// The earliest armed deadline, when any.
    pub fn next_deadline(&self) -> Option<i64> {
        self.waiting.first().map(|(deadline, _)| *deadline)
    }

    /// Pop every conversation whose deadline has arrived.
    pub fn take_due(&mut self, now: i64) -> Vec<DatabaseId> {
        let mut due = Vec::new();
        while let Some(&(deadline, conversation_id)) = self.waiting.first() {
            if deadline > now {
                break;
            }
            self.waiting.remove(&(deadline, conversation_id));
            self.scheduled.remove(&conversation_id);
            due.push(conversation_id);
        }
        due
    }

    /// The first operation of a conversation not yet in flight.
    pub fn pick_idle(&mut self, conversation_id: DatabaseId) -> Option<&mut PendingOperation> {
        self.queues
            .get_mut(&conversation_id)?
            .iter_mut()
            .find(|operation| operation.request_id == NO_REQUEST_ID)
    }

    /// One operation by its row id.
    pub fn find_by_id(
        &mut self,
        conversation_id: DatabaseId,
        operation_id: DatabaseId,
    ) -> Option<&mut PendingOperation> {
        self.queues
            .get_mut(&conversation_id)?
            .iter_mut()
            .find(|operation| operation.id == operation_id)
    }

    /// After a link went away: clear in-flight request ids (responses
    /// will never come), drop transfer state so the next link re-probes,
    /// and discard transient operations, which are only meaningful live.
    pub fn reset_for_reconnect(&mut self, conversation_id: DatabaseId) -> usize {
        let Some(queue) = self.queues.get_mut(&conversation_id) else {
            return 0;
        };
        let mut dropped = 0;
        queue.retain(|operation| {
            let keep = operation.op_type.is_persistent();
            if !keep {
                dropped += 1;
            }
            keep
        });
        for operation in queue.iter_mut() {
            operation.request_id = NO_REQUEST_ID;
            operation.transfer = None;
        }
        if queue.is_empty() {
            self.queues.remove(&conversation_id);
        }
        dropped
    }

    /// The operation awaiting the given request id.
    pub fn find_by_request(
        &mut self,
        conversation_id: DatabaseId,
        request_id: i64,
    ) -> Option<&mut PendingOperation> {
        self.queues
            .get_mut(&conversation_id)?
            .iter_mut()
            .find(|operation| operation.request_id == request_id)
    }

    /// Remove and return the operation awaiting the given request id.
    pub fn take_by_request(
        &mut self,
        conversation_id: DatabaseId,
        request_id: i64,
    ) -> Option<PendingOperation> {
        let queue = self.queues.get_mut(&conversation_id)?;
        let index = queue
            .iter()
            .position(|operation| operation.request_id == request_id)?;
        let operation = queue.remove(index);
        if queue.is_empty() {
            self.queues.remove(&conversation_id);
        }
        operation
    }

    /// Remove and return one operation by its row id.
    pub fn take_by_id(
        &mut self,
        conversation_id: DatabaseId,
        operation_id: DatabaseId,
    ) -> Option<PendingOperation> {
        let queue = self.queues.get_mut(&conversation_id)?;
        let index = queue
            .iter()
            .position(|operation| operation.id == operation_id)?;
        let operation = queue.remove(index);
        if queue.is_empty() {
            self.queues.remove(&conversation_id);
        }
        operation
    }

    /// Evict operations by row id across every queue (descriptor deletes
    /// return these from the shared transaction).
    pub fn evict_ids(&mut self, ids: &[DatabaseId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut evicted = 0;
        self.queues.retain(|_, queue| {
            queue.retain(|operation| {
                let keep = !ids.contains(&operation.id);
                if !keep {
                    evicted += 1;
                }
                keep
            });
            !queue.is_empty()
        });
        for parked in self.deferrable.values_mut() {
            parked.retain(|operation| {
                let keep = !ids.contains(&operation.id);
                if !keep {
                    evicted += 1;
                }
                keep
            });
        }
        evicted
    }

    /// Drop every trace of a conversation; returns its queued operations.
    pub fn remove_conversation(&mut self, conversation_id: DatabaseId) -> Vec<PendingOperation> {
        self.unschedule(conversation_id);
        self.deferrable.remove(&conversation_id);
        self.queues
            .remove(&conversation_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Whether a conversation has queued work.
    pub fn has_pending(&self, conversation_id: DatabaseId) -> bool {
        self.queues
            .get(&conversation_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Queued operation count of one conversation.
    pub fn pending_count(&self, conversation_id: DatabaseId) -> usize {
        self.queues
            .get(&conversation_id)
            .map_or(0, VecDeque::len)
    }

    /// Conversations that currently have queued work.
    pub fn conversations_with_work(&self) -> Vec<DatabaseId> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether any queue or parking lot holds work.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.deferrable.is_empty()
    }
}
