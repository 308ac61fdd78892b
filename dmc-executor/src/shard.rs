//! Per-contract deterministic message-passing executor.
//!
//! A [`DmcExecutor`] owns every execution state currently addressed to its
//! contract. Each round the orchestrator calls [`DmcExecutor::prepare`] until
//! no state moves between shards, then [`DmcExecutor::go`] sends the sendable
//! states to the worker as one batch and files the replies back into the pool.
//!
//! # Classification
//!
//! - invocation for another contract: handed out to that contract's shard
//! - invocation for this contract: a new frame is pushed, then sent
//! - return: the frame is popped; an empty stack ends the transaction
//! - key lock: sent again once the key is granted, parked as locked otherwise

use crate::error::ShardError;
use crate::key_locks::KeyLockGraph;
use crate::state::{ExecutivePool, ExecutiveState, PoolStatus};
use crate::types::{BlockNumber, ContextId, ExecutionMessage, MessageKind, Seq, TermId};
use crate::worker::ContractWorker;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How returns find their way back to the calling frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallAccounting {
    /// Returns are routed by the `to` address the worker puts on them.
    #[cfg_attr(not(feature = "revert-stack"), default)]
    Standard,
    /// Returns are routed by a revert stack of caller addresses kept by the
    /// scheduler. The callee shard unwinds the frame and hands the result to
    /// the parent shard as a pre-finish/pre-revert message.
    #[cfg_attr(feature = "revert-stack", default)]
    RevertStack,
}

impl CallAccounting {
    pub fn is_revert_stack(&self) -> bool {
        matches!(self, CallAccounting::RevertStack)
    }
}

/// Per-block shard settings.
#[derive(Debug, Clone, Copy)]
pub struct ShardConfig {
    pub accounting: CallAccounting,
    /// Deadlock reverts after which a transaction's revert becomes final.
    pub deadlock_retry_limit: u32,
    /// Marks every outgoing message read-only.
    pub static_call: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            accounting: CallAccounting::default(),
            deadlock_retry_limit: 3,
            static_call: false,
        }
    }
}

/// Outcome of one [`DmcExecutor::go`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// No state left in the pool.
    Finished,
    /// States remain; prepare and go again.
    Paused,
}

/// What to do with a state after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageHint {
    NeedSend,
    ScheduleOut,
    Locked,
    End,
}

/// Result of a preparation pass.
#[derive(Debug, Default)]
pub struct Prepared {
    /// States addressed to other contracts. Ownership passes to the caller.
    pub scheduled_out: Vec<ExecutiveState>,
    /// States whose call tree completed.
    pub finished: Vec<ExecutiveState>,
}

impl Prepared {
    pub fn has_schedule_out(&self) -> bool {
        !self.scheduled_out.is_empty()
    }
}

/// Executor shard for one contract address.
pub struct DmcExecutor {
    contract: Address,
    number: BlockNumber,
    term: TermId,
    worker: Arc<dyn ContractWorker>,
    key_locks: Arc<KeyLockGraph>,
    pool: ExecutivePool,
    config: ShardConfig,
}

impl DmcExecutor {
    pub fn new(
        contract: Address,
        number: BlockNumber,
        term: TermId,
        worker: Arc<dyn ContractWorker>,
        key_locks: Arc<KeyLockGraph>,
        config: ShardConfig,
    ) -> Self {
        Self {
            contract,
            number,
            term,
            worker,
            key_locks,
            pool: ExecutivePool::new(),
            config,
        }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn pool(&self) -> &ExecutivePool {
        &self.pool
    }

    /// True once every state has left the shard.
    pub fn has_finished(&self) -> bool {
        self.pool.is_empty()
    }

    /// Adds a transaction's initial message.
    pub fn submit(&mut self, message: ExecutionMessage, dag_eligible: bool) {
        self.schedule_in(ExecutiveState::new(message, dag_eligible));
    }

    /// Takes ownership of a state handed over by another shard.
    pub fn schedule_in(&mut self, state: ExecutiveState) {
        trace!(
            contract = %self.contract,
            context_id = state.context_id,
            kind = %state.message.kind,
            "schedule in"
        );
        self.pool.insert(state, PoolStatus::NeedPrepare);
    }

    /// Takes ownership of a state whose message is a fresh worker reply
    /// produced outside [`DmcExecutor::go`], as on the DAG path.
    pub fn receive(&mut self, state: ExecutiveState) -> Result<(), ShardError> {
        let context_id = state.context_id;
        let message = state.message.clone();
        self.pool.insert(state, PoolStatus::NeedPrepare);
        self.pool.unmark(context_id);
        self.receive_outputs(&[context_id], vec![message])
    }

    /// Releases the frame locks of states whose latest message is a return.
    pub fn release_outdated_lock(&mut self) {
        for context_id in self.pool.ids(PoolStatus::NeedPrepare) {
            if let Some(state) = self.pool.get(context_id) {
                if state.message.kind.is_return() {
                    self.key_locks.release(context_id, state.message.seq);
                }
            }
        }
    }

    /// Classifies every state waiting for preparation.
    pub fn prepare(&mut self) -> Result<Prepared, ShardError> {
        let mut prepared = Prepared::default();

        for context_id in self.pool.take(PoolStatus::NeedScheduleOut) {
            if let Some(state) = self.pool.remove(context_id) {
                prepared.scheduled_out.push(state);
            }
        }

        for context_id in self.pool.take(PoolStatus::NeedPrepare) {
            let Some(mut state) = self.pool.remove(context_id) else {
                continue;
            };
            match self.handle_message(&mut state)? {
                MessageHint::NeedSend => self.pool.insert(state, PoolStatus::NeedSend),
                MessageHint::Locked => self.pool.insert(state, PoolStatus::Locked),
                MessageHint::ScheduleOut => prepared.scheduled_out.push(state),
                MessageHint::End => prepared.finished.push(state),
            }
        }

        Ok(prepared)
    }

    /// Retries the lock of every locked state. Returns true when this shard
    /// has nothing to send afterwards.
    pub fn unlock_prepare(&mut self) -> bool {
        let mut unlocked = false;
        for context_id in self.pool.ids(PoolStatus::Locked) {
            let Some(state) = self.pool.get(context_id) else {
                continue;
            };
            let MessageKind::KeyLock { acquired } = &state.message.kind else {
                continue;
            };
            if self
                .key_locks
                .acquire(state.message.from, acquired.clone(), context_id, state.message.seq)
            {
                trace!(contract = %self.contract, context_id, "key lock granted");
                self.pool.mark(context_id, PoolStatus::NeedSend);
                unlocked = true;
            }
        }
        !unlocked && self.pool.count(PoolStatus::NeedSend) == 0
    }

    /// First wait-for cycle through one of this shard's locked states.
    pub fn detect_deadlock(&self) -> Option<Vec<ContextId>> {
        self.pool
            .ids(PoolStatus::Locked)
            .into_iter()
            .find_map(|context_id| self.key_locks.deadlock_cycle(context_id))
    }

    /// Reverts the frame of a locked context. Returns false if the context is
    /// not locked here.
    pub fn revert_locked(&mut self, context_id: ContextId) -> bool {
        if self.pool.status_of(context_id) != Some(PoolStatus::Locked) {
            return false;
        }
        let limit = self.config.deadlock_retry_limit;
        let Some(state) = self.pool.get_mut(context_id) else {
            return false;
        };
        state.message.into_revert();
        state.deadlock_reverts += 1;
        state.retry_pending = state.deadlock_reverts <= limit;
        debug!(
            contract = %self.contract,
            context_id,
            seq = state.message.seq,
            reverts = state.deadlock_reverts,
            retry = state.retry_pending,
            "revert deadlocked context"
        );
        self.key_locks.cancel_wait(context_id);
        self.pool.mark(context_id, PoolStatus::NeedSend)
    }

    /// Sends every sendable state to the worker and files the replies.
    pub async fn go(&mut self) -> Result<ShardStatus, ShardError> {
        if self.pool.is_empty() {
            return Ok(ShardStatus::Finished);
        }
        let ids = self.pool.take(PoolStatus::NeedSend);
        if ids.is_empty() {
            return Ok(ShardStatus::Paused);
        }

        let mut batch = Vec::with_capacity(ids.len());
        for &context_id in &ids {
            if let Some(state) = self.pool.get(context_id) {
                let mut message = state.message.clone();
                let to = message.to.unwrap_or(self.contract);
                message.key_locks = self.key_locks.key_locks_not_held_by(to, context_id);
                message.static_call |= self.config.static_call;
                trace!(contract = %self.contract, "send {}", message);
                batch.push(message);
            }
        }

        let outputs = match self
            .worker
            .execute_transactions(self.term, self.contract, batch)
            .await
        {
            Ok(outputs) => outputs,
            Err(e) => {
                for &context_id in &ids {
                    self.pool.mark(context_id, PoolStatus::NeedSend);
                }
                warn!(contract = %self.contract, error = %e, "batch execution failed");
                return Err(e.into());
            }
        };

        self.receive_outputs(&ids, outputs)?;
        Ok(ShardStatus::Paused)
    }

    fn receive_outputs(
        &mut self,
        sent: &[ContextId],
        outputs: Vec<ExecutionMessage>,
    ) -> Result<(), ShardError> {
        let mut pending: BTreeSet<ContextId> = sent.iter().copied().collect();

        // The worker already dropped the locks of returned frames; mirror that
        // before recording what the other frames now hold.
        for output in &outputs {
            if output.kind.is_return() {
                self.key_locks.release(output.context_id, output.seq);
            }
        }
        for output in &outputs {
            if !output.kind.is_return()
                && !output.key_locks.is_empty()
                && !self
                    .key_locks
                    .batch_acquire(self.contract, &output.key_locks, output.context_id, output.seq)
            {
                return Err(ShardError::LockConflict(output.context_id));
            }
        }

        for output in outputs {
            let context_id = output.context_id;
            if !pending.remove(&context_id) {
                warn!(contract = %self.contract, context_id, "unexpected output");
                return Err(ShardError::UnknownContext(context_id));
            }
            trace!(contract = %self.contract, "recv {}", output);
            let status = {
                let Some(state) = self.pool.get_mut(context_id) else {
                    return Err(ShardError::UnknownContext(context_id));
                };
                state.message = output;
                route_output(self.contract, self.config.accounting, state)
            };
            self.pool.mark(context_id, status);
        }

        match pending.first() {
            Some(&context_id) => Err(ShardError::MissingResponse(context_id)),
            None => Ok(()),
        }
    }

    fn handle_message(&self, state: &mut ExecutiveState) -> Result<MessageHint, ShardError> {
        let context_id = state.context_id;

        match &state.message.kind {
            MessageKind::TxHash | MessageKind::Message => {
                let target = match state.message.to {
                    Some(to) => to,
                    None => {
                        let next = state.next_seq;
                        state.resolve_creation_address(self.number, next)
                    }
                };
                if target != self.contract {
                    return Ok(MessageHint::ScheduleOut);
                }
                if self.config.accounting.is_revert_stack() {
                    let parent = state.call_stack.last().copied().unwrap_or_default();
                    state.revert_stack.push((state.message.from, parent));
                }
                let seq = state.push_frame();
                trace!(context_id, seq, contract = %self.contract, "execute");
            }
            MessageKind::Finished(_) | MessageKind::Revert(_) => {
                self.key_locks.release(context_id, state.message.seq);
                if state.call_stack.is_empty() {
                    return Err(ShardError::StackUnderflow(context_id));
                }
                let caller = if self.config.accounting.is_revert_stack() {
                    state.revert_stack.pop()
                } else {
                    None
                };
                if state.pop_frame().is_none() {
                    return self.finish(state);
                }
                state.message.create = false;
                if let Some((caller, _)) = caller {
                    state.message.to = Some(caller);
                    if caller != self.contract {
                        into_handoff(&mut state.message);
                        return Ok(MessageHint::ScheduleOut);
                    }
                }
                trace!(context_id, seq = state.message.seq, "unwind to parent");
            }
            MessageKind::PreFinish(_) | MessageKind::PreRevert(_) => {
                from_handoff(&mut state.message);
                state.message.create = false;
            }
            MessageKind::RevertKeyLock => {
                state.message.into_revert();
                self.key_locks.cancel_wait(context_id);
                trace!(context_id, seq = state.message.seq, "revert by key lock");
            }
            MessageKind::KeyLock { acquired } => {
                if !self.key_locks.acquire(
                    state.message.from,
                    acquired.clone(),
                    context_id,
                    state.message.seq,
                ) {
                    trace!(
                        context_id,
                        seq = state.message.seq,
                        contract = %state.message.from,
                        "waiting key"
                    );
                    return Ok(MessageHint::Locked);
                }
            }
            MessageKind::SendBack => {
                state.message.kind = if state.message.transaction_hash != B256::ZERO {
                    MessageKind::TxHash
                } else {
                    MessageKind::Message
                };
                if state.message.to.is_none() {
                    let seq: Seq = state.message.seq;
                    state.resolve_creation_address(self.number, seq);
                }
            }
        }

        Ok(MessageHint::NeedSend)
    }

    /// Retires a completed call tree, or restarts it after a deadlock revert.
    fn finish(&self, state: &mut ExecutiveState) -> Result<MessageHint, ShardError> {
        self.key_locks.release_context(state.context_id);
        if state.retry_pending {
            debug!(
                context_id = state.context_id,
                attempt = state.deadlock_reverts,
                "retry transaction"
            );
            state.reset_for_retry();
            return self.handle_message(state);
        }
        Ok(MessageHint::End)
    }
}

fn route_output(
    contract: Address,
    accounting: CallAccounting,
    state: &ExecutiveState,
) -> PoolStatus {
    let message = &state.message;
    let stays = if message.kind.is_return() {
        accounting.is_revert_stack() || state.call_stack.len() == 1 || message.to == Some(contract)
    } else {
        message.to.map_or(true, |to| to == contract)
    };
    if stays {
        PoolStatus::NeedPrepare
    } else {
        PoolStatus::NeedScheduleOut
    }
}

fn into_handoff(message: &mut ExecutionMessage) {
    message.kind = match std::mem::replace(&mut message.kind, MessageKind::SendBack) {
        MessageKind::Finished(r) => MessageKind::PreFinish(r),
        MessageKind::Revert(r) => MessageKind::PreRevert(r),
        other => other,
    };
}

fn from_handoff(message: &mut ExecutionMessage) {
    message.kind = match std::mem::replace(&mut message.kind, MessageKind::SendBack) {
        MessageKind::PreFinish(r) => MessageKind::Finished(r),
        MessageKind::PreRevert(r) => MessageKind::Revert(r),
        other => other,
    };
}
