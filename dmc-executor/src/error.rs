//! Errors raised by a contract shard.

use crate::types::ContextId;
use crate::worker::WorkerError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("worker returned no message for context {0}")]
    MissingResponse(ContextId),

    #[error("worker returned a message for unknown context {0}")]
    UnknownContext(ContextId),

    #[error("context {0} reports holding a key owned by another context")]
    LockConflict(ContextId),

    #[error("return for context {0} with an empty call stack")]
    StackUnderflow(ContextId),
}

impl ShardError {
    pub fn is_term_mismatch(&self) -> bool {
        matches!(self, ShardError::Worker(e) if e.is_term_mismatch())
    }
}
