//! Interface of the remote contract-execution worker.

use crate::types::{BlockHeader, BlockNumber, ExecutionMessage, TermId};
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use thiserror::Error;

/// Parameters shared by the storage and worker sides of a two-phase commit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TwoPcParams {
    /// Block being committed.
    pub number: BlockNumber,
    /// Table holding the row that decides the commit.
    pub primary_table: String,
    /// Key of that row within `primary_table`.
    pub primary_key: String,
    /// Start timestamp assigned by storage prepare.
    pub timestamp: u64,
}

/// Failure reported by a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker restarted and no longer serves the caller's term.
    #[error("term mismatch: worker serves {actual}, request carried {expected}")]
    TermMismatch { expected: TermId, actual: TermId },

    #[error("worker unavailable: {0}")]
    Unavailable(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("two-phase commit step failed: {0}")]
    TwoPhase(String),
}

impl WorkerError {
    pub fn is_term_mismatch(&self) -> bool {
        matches!(self, WorkerError::TermMismatch { .. })
    }
}

/// A process that executes contract code on behalf of the scheduler.
///
/// Every call carries the caller's [`TermId`]. A worker that has restarted
/// since the term was issued answers with [`WorkerError::TermMismatch`].
#[async_trait]
pub trait ContractWorker: Send + Sync {
    /// Opens a new block.
    async fn next_block_header(&self, term: TermId, header: &BlockHeader)
        -> Result<(), WorkerError>;

    /// Runs one step for each message of a batch addressed to `contract`.
    /// The reply holds exactly one message per request context.
    async fn execute_transactions(
        &self,
        term: TermId,
        contract: Address,
        messages: Vec<ExecutionMessage>,
    ) -> Result<Vec<ExecutionMessage>, WorkerError>;

    /// Runs one step of a single message.
    async fn execute_transaction(
        &self,
        term: TermId,
        message: ExecutionMessage,
    ) -> Result<ExecutionMessage, WorkerError>;

    /// Read-only variant of [`ContractWorker::execute_transaction`].
    async fn call(
        &self,
        term: TermId,
        message: ExecutionMessage,
    ) -> Result<ExecutionMessage, WorkerError>;

    /// Runs conflict-free transactions to completion in any order.
    async fn dag_execute_transactions(
        &self,
        term: TermId,
        messages: Vec<ExecutionMessage>,
    ) -> Result<Vec<ExecutionMessage>, WorkerError>;

    /// Incremental state hash of the block's writes on this worker.
    async fn get_hash(&self, term: TermId, number: BlockNumber) -> Result<B256, WorkerError>;

    async fn prepare(&self, term: TermId, params: &TwoPcParams) -> Result<(), WorkerError>;

    async fn commit(&self, term: TermId, params: &TwoPcParams) -> Result<(), WorkerError>;

    async fn rollback(&self, term: TermId, params: &TwoPcParams) -> Result<(), WorkerError>;

    async fn get_code(&self, term: TermId, contract: Address) -> Result<Bytes, WorkerError>;

    async fn get_abi(&self, term: TermId, contract: Address) -> Result<String, WorkerError>;

    /// Drops all uncommitted state.
    async fn reset(&self, term: TermId) -> Result<(), WorkerError>;
}
