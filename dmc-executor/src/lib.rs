//! Deterministic message-passing (DMC) execution engine.
//!
//! This crate holds the per-contract half of the block scheduler: the shards
//! that carry a transaction's nested calls from contract to contract, and the
//! key-lock graph that serializes conflicting storage accesses between
//! transactions without a global lock.
//!
//! # Core Components
//!
//! - **KeyLockGraph**: shared key ownership plus wait-for edges for deadlock detection
//! - **ExecutiveState / ExecutivePool**: one transaction's call stack and the per-shard buckets
//! - **DmcExecutor**: the shard that classifies messages and exchanges batches with a worker
//! - **ContractWorker**: the interface of the remote contract-execution process
//!
//! # Round Overview
//!
//! 1. Every shard prepares until no state moves between shards
//! 2. Locked states retry their key; if no shard can make progress a
//!    wait-for cycle is broken by reverting one of its members
//! 3. Every shard sends its sendable states to its worker in parallel
//! 4. Replies are filed back into the pools and the round repeats until
//!    every pool is empty
//!
//! # Example
//!
//! ```rust,ignore
//! use dmc_executor::{DmcExecutor, KeyLockGraph, ShardConfig, TermId};
//! use std::sync::Arc;
//!
//! let locks = Arc::new(KeyLockGraph::new());
//! let config = ShardConfig::default();
//! let mut shard = DmcExecutor::new(contract, number, TermId(1), worker, locks, config);
//! shard.submit(message, false);
//! loop {
//!     let prepared = shard.prepare()?;
//!     if shard.go().await? == ShardStatus::Finished {
//!         break;
//!     }
//! }
//! ```

pub mod address;
pub mod error;
pub mod key_locks;
pub mod shard;
pub mod state;
pub mod types;
pub mod worker;

pub use address::{creation_address, salted_creation_address};
pub use error::ShardError;
pub use key_locks::{KeyLockGraph, LockKey};
pub use shard::{CallAccounting, DmcExecutor, Prepared, ShardConfig, ShardStatus};
pub use state::{ExecutivePool, ExecutiveState, PoolStatus};
pub use types::{
    BlockHeader, BlockNumber, CallResult, ContextId, ExecutionMessage, LogEntry, MessageKind, Seq,
    TermId, STATUS_REVERTED_BY_SCHEDULER,
};
pub use worker::{ContractWorker, TwoPcParams, WorkerError};
