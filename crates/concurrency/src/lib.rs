//! Transactional memory engine for txcell
//!
//! This crate implements the runtime behind `run_transaction`:
//! - TxCell: versioned cells with per-cell write-stamp locks
//! - Per-thread transaction contexts with commutes and side effects
//! - TransactionManager: stamp allocation, two-phase commit, retry
//!   driver, version reclamation, commit observers
//! - Conditional subscriptions re-fired by commit trigger sets
//!
//! Committed state is strictly serializable: commit order is total and
//! determined by write-stamp order, handed out under a single stamp
//! lock. A transaction with start stamp `s` observes exactly the
//! writes with commit stamp <= `s`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cell;
pub mod conditional;
pub mod context;
pub mod manager;

pub use cell::TxCell;
pub use conditional::{cancel_conditional, conditional, ConditionalHandle};
pub use context::{
    assert_in_transaction, current_start_stamp, in_transaction, on_commit, on_rollback,
    side_effect,
};
pub use manager::{rollback, run_transaction, when_committing, CommitNotice, ObserverHandle};

// Re-export the shared core types for convenience
pub use txcell_core::{CellId, Enlistable, Owner, Result, Stamp, StmError, WriteStamp};
