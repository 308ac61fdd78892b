//! Core types for deterministic message-passing execution.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one transaction's whole call tree within a block.
pub type ContextId = u64;

/// Sequence number of one call frame within a context.
pub type Seq = u64;

/// Block height.
pub type BlockNumber = u64;

/// Generation of a scheduler instance, carried by every worker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TermId(pub u64);

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term#{}", self.0)
    }
}

/// Event emitted by a contract frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Payload carried by a return message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallResult {
    /// Zero on success, a worker-defined code otherwise.
    pub status: i32,
    pub logs: Vec<LogEntry>,
    pub new_contract_address: Option<Address>,
}

impl CallResult {
    /// Result attached to a revert synthesized by the scheduler.
    pub fn reverted(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

/// Status code used when the scheduler itself reverts a frame.
pub const STATUS_REVERTED_BY_SCHEDULER: i32 = 16;

/// Kind of an execution message, with the payload specific to that kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Invocation that references its transaction by hash.
    TxHash,
    /// Invocation that carries its own call data.
    Message,
    /// Successful return of a frame.
    Finished(CallResult),
    /// Failed return of a frame.
    Revert(CallResult),
    /// The frame must wait for `acquired`, a storage key of the `from` contract.
    KeyLock { acquired: Bytes },
    /// The worker hands the message back for re-dispatch.
    SendBack,
    /// The worker asks to revert the frame that was waiting on a key.
    RevertKeyLock,
    /// Successful return already unwound on the callee side, only needs delivery
    /// to the parent frame. Produced by the revert-stack accounting.
    PreFinish(CallResult),
    /// Failed return already unwound on the callee side.
    PreRevert(CallResult),
}

impl MessageKind {
    /// True for `TxHash` and `Message`.
    pub fn is_invocation(&self) -> bool {
        matches!(self, MessageKind::TxHash | MessageKind::Message)
    }

    /// True for `Finished` and `Revert`.
    pub fn is_return(&self) -> bool {
        matches!(self, MessageKind::Finished(_) | MessageKind::Revert(_))
    }

    /// True for the two hand-off variants.
    pub fn is_handoff(&self) -> bool {
        matches!(self, MessageKind::PreFinish(_) | MessageKind::PreRevert(_))
    }

    /// Return payload, if this is any kind of return.
    pub fn call_result(&self) -> Option<&CallResult> {
        match self {
            MessageKind::Finished(r)
            | MessageKind::Revert(r)
            | MessageKind::PreFinish(r)
            | MessageKind::PreRevert(r) => Some(r),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::TxHash => "TXHASH",
            MessageKind::Message => "MESSAGE",
            MessageKind::Finished(_) => "FINISHED",
            MessageKind::Revert(_) => "REVERT",
            MessageKind::KeyLock { .. } => "KEY_LOCK",
            MessageKind::SendBack => "SEND_BACK",
            MessageKind::RevertKeyLock => "REVERT_KEY_LOCK",
            MessageKind::PreFinish(_) => "PRE_FINISH",
            MessageKind::PreRevert(_) => "PRE_REVERT",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request or response exchanged with a contract-execution worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMessage {
    pub kind: MessageKind,
    pub context_id: ContextId,
    pub seq: Seq,
    /// Zero for messages that do not originate from a transaction body.
    pub transaction_hash: B256,
    pub origin: Address,
    pub from: Address,
    /// `None` requests a contract creation.
    pub to: Option<Address>,
    pub depth: u32,
    pub gas_available: u64,
    pub value: U256,
    pub static_call: bool,
    pub create: bool,
    pub create_salt: Option<U256>,
    pub abi: String,
    /// Call data on invocations, output on returns.
    pub data: Bytes,
    /// On requests: keys of `to` held by other contexts.
    /// On responses: keys the `from` frame holds.
    pub key_locks: Vec<Bytes>,
}

impl ExecutionMessage {
    /// Creates an invocation of `to` on behalf of `origin`.
    pub fn invocation(
        context_id: ContextId,
        origin: Address,
        to: Option<Address>,
        data: Bytes,
    ) -> Self {
        Self {
            kind: MessageKind::Message,
            context_id,
            seq: 0,
            transaction_hash: B256::ZERO,
            origin,
            from: origin,
            to,
            depth: 0,
            gas_available: 0,
            value: U256::ZERO,
            static_call: false,
            create: to.is_none(),
            create_salt: None,
            abi: String::new(),
            data,
            key_locks: Vec::new(),
        }
    }

    /// Turns this message into a scheduler-initiated revert of the current frame.
    pub fn into_revert(&mut self) {
        self.kind = MessageKind::Revert(CallResult::reverted(STATUS_REVERTED_BY_SCHEDULER));
        self.create = false;
        self.key_locks.clear();
    }

    /// The contract whose shard should process this message next.
    pub fn target(&self) -> Option<Address> {
        self.to
    }
}

impl fmt::Display for ExecutionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}|ctx={}|seq={}|{}->{}]",
            self.kind,
            self.context_id,
            self.seq,
            self.from,
            self.to.map(|a| a.to_string()).unwrap_or_else(|| "<create>".into())
        )
    }
}

/// Header fields a worker needs to open a block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: BlockNumber,
    pub version: u32,
    pub timestamp: u64,
    pub parent_hash: B256,
    pub gas_used: u64,
    pub state_root: B256,
    pub txs_root: B256,
    pub receipts_root: B256,
    pub sealer: u64,
}

impl BlockHeader {
    /// Header hash: keccak over the fields in declaration order.
    pub fn hash(&self) -> B256 {
        let mut data = Vec::with_capacity(8 + 4 + 8 + 32 * 4 + 8 + 8);
        data.extend_from_slice(&self.number.to_be_bytes());
        data.extend_from_slice(&self.version.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(self.parent_hash.as_slice());
        data.extend_from_slice(&self.gas_used.to_be_bytes());
        data.extend_from_slice(self.state_root.as_slice());
        data.extend_from_slice(self.txs_root.as_slice());
        data.extend_from_slice(self.receipts_root.as_slice());
        data.extend_from_slice(&self.sealer.to_be_bytes());
        alloy_primitives::keccak256(&data)
    }
}
