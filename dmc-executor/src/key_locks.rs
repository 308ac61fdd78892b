//! Key-lock graph for serializing conflicting storage accesses.
//!
//! Every storage key of every contract has at most one holding context. A
//! context may hold a key through several of its frames at once, so ownership
//! is recorded per `(context, seq)` and a key is free again once the last of
//! those frames releases it. Acquisition never blocks: a refused caller is
//! remembered as waiting on the key, which forms the wait-for graph used by
//! deadlock detection.

use crate::types::{ContextId, Seq};
use alloy_primitives::{Address, Bytes};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};

/// A storage key scoped to its contract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    pub contract: Address,
    pub key: Bytes,
}

impl LockKey {
    pub fn new(contract: Address, key: Bytes) -> Self {
        Self { contract, key }
    }
}

/// Current owner of a key.
#[derive(Debug, Clone)]
struct Holder {
    context_id: ContextId,
    seqs: BTreeSet<Seq>,
}

/// Shared lock table plus the wait-for edges between contexts.
///
/// Structure:
/// - holders: LockKey -> (ContextId, {Seq})
/// - held: ContextId -> {LockKey}
/// - waiting: ContextId -> LockKey
#[derive(Debug, Default)]
pub struct KeyLockGraph {
    holders: DashMap<LockKey, Holder>,
    held: DashMap<ContextId, HashSet<LockKey>>,
    waiting: DashMap<ContextId, LockKey>,
}

impl KeyLockGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to take `key` of `contract` for the frame `(context_id, seq)`.
    ///
    /// Succeeds when the key is free or already held by the same context. On
    /// refusal the context is recorded as waiting on the key.
    pub fn acquire(&self, contract: Address, key: Bytes, context_id: ContextId, seq: Seq) -> bool {
        let lock_key = LockKey::new(contract, key);
        let granted = {
            let mut entry = self.holders.entry(lock_key.clone()).or_insert_with(|| Holder {
                context_id,
                seqs: BTreeSet::new(),
            });
            if entry.context_id == context_id {
                entry.seqs.insert(seq);
                true
            } else {
                false
            }
        };

        if granted {
            self.held.entry(context_id).or_default().insert(lock_key);
            self.waiting.remove(&context_id);
        } else {
            tracing::trace!(context_id, seq, %contract, "key lock refused");
            self.waiting.insert(context_id, lock_key);
        }
        granted
    }

    /// Records every key a frame reports holding. Returns false if any of them
    /// is owned by another context, which the caller treats as a consistency
    /// failure of the worker.
    pub fn batch_acquire(
        &self,
        contract: Address,
        keys: &[Bytes],
        context_id: ContextId,
        seq: Seq,
    ) -> bool {
        let mut all = true;
        for key in keys {
            if !self.acquire(contract, key.clone(), context_id, seq) {
                all = false;
            }
        }
        if !all {
            // A refused batch entry is not a real wait.
            self.waiting.remove(&context_id);
        }
        all
    }

    /// Releases every key the frame `(context_id, seq)` holds.
    pub fn release(&self, context_id: ContextId, seq: Seq) {
        let Some(mut keys) = self.held.get_mut(&context_id) else {
            return;
        };
        let mut freed = Vec::new();
        for lock_key in keys.iter() {
            let now_free = match self.holders.get_mut(lock_key) {
                Some(mut holder) if holder.context_id == context_id => {
                    holder.seqs.remove(&seq);
                    holder.seqs.is_empty()
                }
                _ => false,
            };
            if now_free {
                freed.push(lock_key.clone());
            }
        }
        for lock_key in &freed {
            self.holders
                .remove_if(lock_key, |_, h| h.context_id == context_id && h.seqs.is_empty());
            keys.remove(lock_key);
        }
        let empty = keys.is_empty();
        drop(keys);
        if empty {
            self.held.remove_if(&context_id, |_, k| k.is_empty());
        }
    }

    /// Releases everything held by a context and forgets its wait.
    pub fn release_context(&self, context_id: ContextId) {
        if let Some((_, keys)) = self.held.remove(&context_id) {
            for lock_key in keys {
                self.holders.remove_if(&lock_key, |_, h| h.context_id == context_id);
            }
        }
        self.waiting.remove(&context_id);
    }

    /// Forgets that a context waits on anything.
    pub fn cancel_wait(&self, context_id: ContextId) {
        self.waiting.remove(&context_id);
    }

    /// Holder of a key, if any.
    pub fn holder(&self, contract: Address, key: &Bytes) -> Option<ContextId> {
        self.holders
            .get(&LockKey::new(contract, key.clone()))
            .map(|h| h.context_id)
    }

    /// Key the context is waiting on.
    pub fn waiting_on(&self, context_id: ContextId) -> Option<LockKey> {
        self.waiting.get(&context_id).map(|k| k.clone())
    }

    /// True if following waiter -> holder edges from `context_id` leads back to it.
    pub fn detect_deadlock(&self, context_id: ContextId) -> bool {
        self.deadlock_cycle(context_id).is_some()
    }

    /// Members of the wait-for cycle through `context_id`, starting with it.
    ///
    /// Every context waits on at most one key and every key has one holder,
    /// so the walk is a simple chain that either ends or repeats.
    pub fn deadlock_cycle(&self, context_id: ContextId) -> Option<Vec<ContextId>> {
        let mut path = vec![context_id];
        let mut visited = HashSet::from([context_id]);
        let mut current = context_id;
        loop {
            let lock_key = self.waiting.get(&current)?.clone();
            let holder = self.holders.get(&lock_key)?.context_id;
            if holder == context_id {
                return Some(path);
            }
            if !visited.insert(holder) {
                // A cycle that does not pass through `context_id`.
                return None;
            }
            path.push(holder);
            current = holder;
        }
    }

    /// Keys of `contract` currently held by contexts other than `context_id`,
    /// sorted so the snapshot sent to a worker is deterministic.
    pub fn key_locks_not_held_by(&self, contract: Address, context_id: ContextId) -> Vec<Bytes> {
        let mut keys: Vec<Bytes> = self
            .holders
            .iter()
            .filter(|e| e.key().contract == contract && e.value().context_id != context_id)
            .map(|e| e.key().key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of held keys.
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_acquire_and_release() {
        let graph = KeyLockGraph::new();
        let contract = Address::repeat_byte(1);

        assert!(graph.acquire(contract, key("a"), 1, 0));
        // Same context, different frame.
        assert!(graph.acquire(contract, key("a"), 1, 1));
        assert!(!graph.acquire(contract, key("a"), 2, 0));
        assert_eq!(graph.waiting_on(2).map(|k| k.key), Some(key("a")));

        graph.release(1, 1);
        assert_eq!(graph.holder(contract, &key("a")), Some(1));
        graph.release(1, 0);
        assert_eq!(graph.holder(contract, &key("a")), None);

        assert!(graph.acquire(contract, key("a"), 2, 0));
        assert_eq!(graph.waiting_on(2), None);
    }

    #[test]
    fn test_keys_are_scoped_by_contract() {
        let graph = KeyLockGraph::new();
        assert!(graph.acquire(Address::repeat_byte(1), key("a"), 1, 0));
        assert!(graph.acquire(Address::repeat_byte(2), key("a"), 2, 0));
        assert_eq!(
            graph.key_locks_not_held_by(Address::repeat_byte(1), 2),
            vec![key("a")]
        );
        assert!(graph.key_locks_not_held_by(Address::repeat_byte(1), 1).is_empty());
    }

    #[test]
    fn test_two_cycle_detection() {
        let graph = KeyLockGraph::new();
        let x = Address::repeat_byte(0x0a);
        let y = Address::repeat_byte(0x0b);

        assert!(graph.acquire(x, key("k1"), 0, 0));
        assert!(graph.acquire(y, key("k2"), 1, 0));
        assert!(!graph.acquire(y, key("k2"), 0, 1));
        assert!(!graph.detect_deadlock(0));
        assert!(!graph.acquire(x, key("k1"), 1, 1));

        assert!(graph.detect_deadlock(0));
        assert!(graph.detect_deadlock(1));
        assert_eq!(graph.deadlock_cycle(1), Some(vec![1, 0]));

        graph.release_context(1);
        assert!(!graph.detect_deadlock(0));
        assert!(graph.acquire(y, key("k2"), 0, 1));
    }

    #[test]
    fn test_chain_without_cycle() {
        let graph = KeyLockGraph::new();
        let c = Address::repeat_byte(3);
        assert!(graph.acquire(c, key("a"), 0, 0));
        assert!(graph.acquire(c, key("b"), 1, 0));
        assert!(!graph.acquire(c, key("a"), 1, 1));
        assert!(!graph.acquire(c, key("b"), 2, 0));
        assert!(!graph.detect_deadlock(2));
        assert!(!graph.detect_deadlock(1));
    }

    #[test]
    fn test_n_cycle_detection() {
        let graph = KeyLockGraph::new();
        let c = Address::repeat_byte(4);
        let n = 5u64;
        let keys: Vec<Bytes> = (0..n).map(|i| Bytes::from(vec![i as u8])).collect();
        for i in 0..n {
            assert!(graph.acquire(c, keys[i as usize].clone(), i, 0));
        }
        for i in 0..n {
            let next = ((i + 1) % n) as usize;
            assert!(!graph.acquire(c, keys[next].clone(), i, 1));
        }
        let cycle = graph.deadlock_cycle(2).unwrap();
        assert_eq!(cycle.len(), n as usize);
        assert_eq!(cycle[0], 2);
    }

    #[test]
    fn test_batch_acquire_conflict() {
        let graph = KeyLockGraph::new();
        let c = Address::repeat_byte(5);
        assert!(graph.batch_acquire(c, &[key("a"), key("b")], 1, 0));
        assert!(!graph.batch_acquire(c, &[key("b")], 2, 0));
        assert_eq!(graph.waiting_on(2), None);
        assert_eq!(graph.len(), 2);
    }

    proptest! {
        #[test]
        fn test_no_key_has_two_holders(
            ops in proptest::collection::vec((0u64..4, 0u64..3, 0u8..4, any::<bool>()), 1..200)
        ) {
            let graph = KeyLockGraph::new();
            let c = Address::repeat_byte(9);
            let mut model: std::collections::HashMap<u8, ContextId> = Default::default();
            for (ctx, seq, k, release) in ops {
                if release {
                    graph.release_context(ctx);
                    model.retain(|_, holder| *holder != ctx);
                } else {
                    let granted = graph.acquire(c, Bytes::from(vec![k]), ctx, seq);
                    match model.get(&k) {
                        Some(holder) => prop_assert_eq!(granted, *holder == ctx),
                        None => {
                            prop_assert!(granted);
                            model.insert(k, ctx);
                        }
                    }
                }
                for (k, holder) in &model {
                    prop_assert_eq!(graph.holder(c, &Bytes::from(vec![*k])), Some(*holder));
                }
            }
        }
    }
}
