//! Error types for the transactional memory runtime
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ## Error Categories
//!
//! - **Retry-class**: conflicts that the `run_transaction` driver
//!   catches and resolves by re-executing the body. Never visible to
//!   user code.
//! - **Contract violations**: programmer errors (commute overlap,
//!   forbidden enlist, empty conditional read set, mutation outside a
//!   transaction). Surfaced, not retried.
//! - **User-triggered**: explicit rollback, observer veto.
//!
//! ### Usage
//!
//! ```ignore
//! match result {
//!     Err(e) if e.is_retryable() => {
//!         // only reachable outside run_transaction's own loop
//!     }
//!     Err(e) if e.is_contract_violation() => {
//!         // fix the calling code
//!     }
//!     Err(e) => { /* user rollback or veto */ }
//!     Ok(value) => { /* success */ }
//! }
//! ```

use crate::stamp::Stamp;
use crate::types::CellId;
use thiserror::Error;

/// Result type alias for transactional operations
pub type Result<T> = std::result::Result<T, StmError>;

/// Error types for the transactional memory runtime
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StmError {
    /// A write attempt found the cell's head version beyond the
    /// transaction's start stamp. Retry-class.
    #[error("write collision on {cell}: head advanced past start stamp {start}")]
    WriteCollision {
        /// The contended cell
        cell: CellId,
        /// The transaction's start stamp
        start: Stamp,
    },

    /// A re-read of a cell this transaction already wrote found the
    /// head version beyond the start stamp. Retry-class.
    #[error("writable read collision on {cell}: head advanced past start stamp {start}")]
    WritableReadCollision {
        /// The contended cell
        cell: CellId,
        /// The transaction's start stamp
        start: Stamp,
    },

    /// A commute's enlistments overlap the outer transaction's
    /// enlistments at commit time. Programmer contract violation.
    #[error("commute enlistment overlaps outer enlistment on {cell}")]
    InvalidCommute {
        /// The overlapping cell
        cell: CellId,
    },

    /// Inside a strict commute, an access touched a cell outside the
    /// commute's affecting set. Programmer contract violation.
    #[error("enlist of {attempted} forbidden inside strict commute of {allowed}")]
    ForbiddenEnlist {
        /// The single cell the commute is permitted to touch
        allowed: CellId,
        /// The cell the access tried to enlist
        attempted: CellId,
    },

    /// A conditional's test enlisted no cells, so it could never be
    /// triggered. Programmer contract violation.
    #[error("conditional test enlisted no cells")]
    EmptyConditionalReadSet,

    /// A mutating operation was invoked without an active transaction.
    #[error("{operation} requires an active transaction")]
    OutOfTransaction {
        /// The operation that was attempted
        operation: &'static str,
    },

    /// User-triggered rollback. With `retry: true` the driver restarts
    /// the body; with `retry: false` the transaction terminates
    /// without commit and this error propagates.
    #[error("transaction rolled back by user (retry: {retry})")]
    ExplicitRollback {
        /// Whether the driver should re-execute the body
        retry: bool,
    },

    /// A commit observer vetoed the commit between phase 1 and
    /// phase 2. The transaction rolls back in full; the allocated
    /// stamp is left as a gap.
    #[error("commit vetoed by observer: {reason}")]
    CommitVetoed {
        /// Why the observer refused the commit
        reason: String,
    },
}

impl StmError {
    /// Create a WriteCollision error
    pub fn write_collision(cell: CellId, start: Stamp) -> Self {
        StmError::WriteCollision { cell, start }
    }

    /// Create a WritableReadCollision error
    pub fn writable_read_collision(cell: CellId, start: Stamp) -> Self {
        StmError::WritableReadCollision { cell, start }
    }

    /// Create an InvalidCommute error
    pub fn invalid_commute(cell: CellId) -> Self {
        StmError::InvalidCommute { cell }
    }

    /// Create a ForbiddenEnlist error
    pub fn forbidden_enlist(allowed: CellId, attempted: CellId) -> Self {
        StmError::ForbiddenEnlist { allowed, attempted }
    }

    /// Create an OutOfTransaction error
    pub fn out_of_transaction(operation: &'static str) -> Self {
        StmError::OutOfTransaction { operation }
    }

    /// Create a CommitVetoed error
    pub fn commit_vetoed(reason: impl Into<String>) -> Self {
        StmError::CommitVetoed {
            reason: reason.into(),
        }
    }

    /// Check if the `run_transaction` driver should resolve this error
    /// by re-executing the body
    ///
    /// Retry-class errors are caught by the driver and never visible
    /// to user code.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StmError::WriteCollision { .. }
                | StmError::WritableReadCollision { .. }
                | StmError::ExplicitRollback { retry: true }
        )
    }

    /// Check if this error is a programmer contract violation
    ///
    /// Contract violations indicate a bug in the calling code - don't
    /// retry, fix the call site.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            StmError::InvalidCommute { .. }
                | StmError::ForbiddenEnlist { .. }
                | StmError::EmptyConditionalReadSet
                | StmError::OutOfTransaction { .. }
        )
    }

    /// Get the cell this error is about, if any
    pub fn cell(&self) -> Option<CellId> {
        match self {
            StmError::WriteCollision { cell, .. } => Some(*cell),
            StmError::WritableReadCollision { cell, .. } => Some(*cell),
            StmError::InvalidCommute { cell } => Some(*cell),
            StmError::ForbiddenEnlist { attempted, .. } => Some(*attempted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_write_collision() {
        let cell = CellId::next();
        let err = StmError::write_collision(cell, Stamp::new(5));
        let msg = err.to_string();
        assert!(msg.contains("write collision"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn test_error_display_forbidden_enlist() {
        let a = CellId::next();
        let b = CellId::next();
        let err = StmError::forbidden_enlist(a, b);
        let msg = err.to_string();
        assert!(msg.contains("strict commute"));
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
    }

    #[test]
    fn test_error_display_out_of_transaction() {
        let err = StmError::out_of_transaction("write");
        assert!(err.to_string().contains("write requires an active transaction"));
    }

    #[test]
    fn test_is_retryable() {
        let cell = CellId::next();

        assert!(StmError::write_collision(cell, Stamp::ZERO).is_retryable());
        assert!(StmError::writable_read_collision(cell, Stamp::ZERO).is_retryable());
        assert!(StmError::ExplicitRollback { retry: true }.is_retryable());

        assert!(!StmError::ExplicitRollback { retry: false }.is_retryable());
        assert!(!StmError::invalid_commute(cell).is_retryable());
        assert!(!StmError::EmptyConditionalReadSet.is_retryable());
        assert!(!StmError::out_of_transaction("read_old").is_retryable());
        assert!(!StmError::commit_vetoed("audit refused").is_retryable());
    }

    #[test]
    fn test_is_contract_violation() {
        let cell = CellId::next();

        assert!(StmError::invalid_commute(cell).is_contract_violation());
        assert!(StmError::forbidden_enlist(cell, cell).is_contract_violation());
        assert!(StmError::EmptyConditionalReadSet.is_contract_violation());
        assert!(StmError::out_of_transaction("write").is_contract_violation());

        assert!(!StmError::write_collision(cell, Stamp::ZERO).is_contract_violation());
        assert!(!StmError::ExplicitRollback { retry: false }.is_contract_violation());
    }

    #[test]
    fn test_cell_accessor() {
        let cell = CellId::next();
        assert_eq!(StmError::write_collision(cell, Stamp::ZERO).cell(), Some(cell));
        assert_eq!(StmError::invalid_commute(cell).cell(), Some(cell));
        assert_eq!(StmError::EmptyConditionalReadSet.cell(), None);
        assert_eq!(StmError::out_of_transaction("write").cell(), None);
    }

    #[test]
    fn test_error_pattern_matching() {
        let err = StmError::ExplicitRollback { retry: false };
        match err {
            StmError::ExplicitRollback { retry } => assert!(!retry),
            _ => panic!("Wrong error variant"),
        }
    }
}
