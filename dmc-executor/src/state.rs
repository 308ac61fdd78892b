//! Execution states and the per-shard pool that buckets them.

use crate::address::{creation_address, salted_creation_address};
use crate::types::{BlockNumber, ContextId, ExecutionMessage, Seq};
use alloy_primitives::Address;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// In-flight record of one transaction's call tree.
#[derive(Debug, Clone)]
pub struct ExecutiveState {
    pub context_id: ContextId,
    /// The one message this state currently owns.
    pub message: ExecutionMessage,
    /// Seqs of the frames still waiting for a return, innermost last.
    pub call_stack: Vec<Seq>,
    /// Caller address and seq for each open frame, used by the revert-stack accounting.
    pub revert_stack: Vec<(Address, Seq)>,
    pub next_seq: Seq,
    /// Transaction was marked safe for the unordered DAG path.
    pub dag_eligible: bool,
    /// Invocations pushed and returns popped, for balance checks.
    pub calls: u64,
    pub returns: u64,
    /// Times deadlock resolution reverted this transaction.
    pub deadlock_reverts: u32,
    /// The current revert came from deadlock resolution and the transaction
    /// re-runs once it has fully unwound.
    pub retry_pending: bool,
    initial_message: ExecutionMessage,
}

impl ExecutiveState {
    /// Creates the state for a freshly built transaction message.
    pub fn new(message: ExecutionMessage, dag_eligible: bool) -> Self {
        Self {
            context_id: message.context_id,
            initial_message: message.clone(),
            message,
            call_stack: Vec::new(),
            revert_stack: Vec::new(),
            next_seq: 0,
            dag_eligible,
            calls: 0,
            returns: 0,
            deadlock_reverts: 0,
            retry_pending: false,
        }
    }

    /// Opens a frame for the current invocation and stamps its seq on the message.
    pub fn push_frame(&mut self) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.call_stack.push(seq);
        self.message.seq = seq;
        self.calls += 1;
        seq
    }

    /// Closes the innermost frame. Returns the parent seq, or `None` when the
    /// call tree is complete.
    pub fn pop_frame(&mut self) -> Option<Seq> {
        self.call_stack.pop();
        self.returns += 1;
        let parent = self.call_stack.last().copied();
        if let Some(seq) = parent {
            self.message.seq = seq;
        }
        parent
    }

    /// Fills in the target of a creation message. `seq` is the seq the new frame
    /// will receive. A top-level address is pinned so retries create the same contract.
    pub fn resolve_creation_address(&mut self, number: BlockNumber, seq: Seq) -> Address {
        let address = match self.message.create_salt {
            Some(salt) => salted_creation_address(self.message.from, &self.message.data, salt),
            None => creation_address(number, self.context_id, seq),
        };
        self.message.to = Some(address);
        if self.call_stack.is_empty() && self.initial_message.to.is_none() {
            self.initial_message.to = Some(address);
        }
        address
    }

    /// Restores the transaction's initial message for another attempt. Seq
    /// numbering keeps counting so frames of the aborted attempt are never reused.
    pub fn reset_for_retry(&mut self) {
        self.message = self.initial_message.clone();
        self.call_stack.clear();
        self.revert_stack.clear();
        self.retry_pending = false;
    }

    pub fn initial_message(&self) -> &ExecutionMessage {
        &self.initial_message
    }
}

/// Bucket a pooled state waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolStatus {
    NeedPrepare,
    NeedSend,
    Locked,
    NeedScheduleOut,
}

impl PoolStatus {
    fn index(self) -> usize {
        match self {
            PoolStatus::NeedPrepare => 0,
            PoolStatus::NeedSend => 1,
            PoolStatus::Locked => 2,
            PoolStatus::NeedScheduleOut => 3,
        }
    }
}

/// States owned by one shard, keyed by context id.
///
/// A context is in at most one bucket. A state in no bucket is in flight to
/// the worker.
#[derive(Debug, Default)]
pub struct ExecutivePool {
    states: BTreeMap<ContextId, ExecutiveState>,
    status: HashMap<ContextId, PoolStatus>,
    buckets: [BTreeSet<ContextId>; 4],
}

impl ExecutivePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a state to the pool in the given bucket, replacing any previous
    /// state of the same context.
    pub fn insert(&mut self, state: ExecutiveState, status: PoolStatus) {
        let context_id = state.context_id;
        self.unmark(context_id);
        self.states.insert(context_id, state);
        self.mark(context_id, status);
    }

    /// Moves a pooled context into `status`. Returns false for unknown contexts.
    pub fn mark(&mut self, context_id: ContextId, status: PoolStatus) -> bool {
        if !self.states.contains_key(&context_id) {
            return false;
        }
        self.unmark(context_id);
        self.status.insert(context_id, status);
        self.buckets[status.index()].insert(context_id);
        true
    }

    /// Takes a context out of its bucket without removing the state.
    pub fn unmark(&mut self, context_id: ContextId) {
        if let Some(old) = self.status.remove(&context_id) {
            self.buckets[old.index()].remove(&context_id);
        }
    }

    /// Empties a bucket, returning its contexts in ascending order.
    pub fn take(&mut self, status: PoolStatus) -> Vec<ContextId> {
        let ids = std::mem::take(&mut self.buckets[status.index()]);
        for id in &ids {
            self.status.remove(id);
        }
        ids.into_iter().collect()
    }

    /// Contexts in a bucket, ascending.
    pub fn ids(&self, status: PoolStatus) -> Vec<ContextId> {
        self.buckets[status.index()].iter().copied().collect()
    }

    pub fn count(&self, status: PoolStatus) -> usize {
        self.buckets[status.index()].len()
    }

    pub fn status_of(&self, context_id: ContextId) -> Option<PoolStatus> {
        self.status.get(&context_id).copied()
    }

    pub fn get(&self, context_id: ContextId) -> Option<&ExecutiveState> {
        self.states.get(&context_id)
    }

    pub fn get_mut(&mut self, context_id: ContextId) -> Option<&mut ExecutiveState> {
        self.states.get_mut(&context_id)
    }

    /// Removes a state and hands over its ownership.
    pub fn remove(&mut self, context_id: ContextId) -> Option<ExecutiveState> {
        self.unmark(context_id);
        self.states.remove(&context_id)
    }

    pub fn contains(&self, context_id: ContextId) -> bool {
        self.states.contains_key(&context_id)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// All states, ascending by context id.
    pub fn states(&self) -> impl Iterator<Item = &ExecutiveState> {
        self.states.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    fn state(context_id: ContextId) -> ExecutiveState {
        ExecutiveState::new(
            ExecutionMessage::invocation(
                context_id,
                Address::ZERO,
                Some(Address::repeat_byte(1)),
                Bytes::new(),
            ),
            false,
        )
    }

    #[test]
    fn test_call_stack_discipline() {
        let mut s = state(0);
        assert_eq!(s.push_frame(), 0);
        assert_eq!(s.push_frame(), 1);
        assert_eq!(s.message.seq, 1);
        assert_eq!(s.pop_frame(), Some(0));
        assert_eq!(s.message.seq, 0);
        assert_eq!(s.pop_frame(), None);
        assert_eq!((s.calls, s.returns), (2, 2));
        // Seqs are never reused.
        assert_eq!(s.push_frame(), 2);
    }

    #[test]
    fn test_pool_buckets_are_exclusive() {
        let mut pool = ExecutivePool::new();
        pool.insert(state(2), PoolStatus::NeedPrepare);
        pool.insert(state(1), PoolStatus::NeedPrepare);
        assert_eq!(pool.ids(PoolStatus::NeedPrepare), vec![1, 2]);

        assert!(pool.mark(1, PoolStatus::Locked));
        assert_eq!(pool.ids(PoolStatus::NeedPrepare), vec![2]);
        assert_eq!(pool.status_of(1), Some(PoolStatus::Locked));

        assert_eq!(pool.take(PoolStatus::NeedPrepare), vec![2]);
        assert_eq!(pool.status_of(2), None);
        assert!(pool.contains(2));
        assert!(!pool.mark(9, PoolStatus::NeedSend));

        assert!(pool.remove(1).is_some());
        assert_eq!(pool.count(PoolStatus::Locked), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_retry_restores_initial_message() {
        let mut s = state(4);
        s.push_frame();
        s.message.into_revert();
        s.retry_pending = true;
        s.reset_for_retry();
        assert_eq!(s.message.kind, crate::types::MessageKind::Message);
        assert!(s.call_stack.is_empty());
        assert_eq!(s.next_seq, 1);
    }

    #[test]
    fn test_retry_keeps_top_level_creation_address() {
        let message = ExecutionMessage::invocation(3, Address::ZERO, None, Bytes::new());
        let mut s = ExecutiveState::new(message, false);
        let address = s.resolve_creation_address(1, s.next_seq);
        assert_eq!(address, creation_address(1, 3, 0));
        s.push_frame();
        // A nested creation does not touch the pinned address.
        s.message.to = None;
        s.resolve_creation_address(1, s.next_seq);
        s.push_frame();

        s.reset_for_retry();
        assert_eq!(s.initial_message().to, Some(address));
        assert_eq!(s.message.to, Some(address));
        assert_eq!(s.next_seq, 2);
    }
}
