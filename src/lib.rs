//! # txcell
//!
//! Software transactional memory: group reads and writes to shared,
//! in-memory cells into atomic transactions that either commit as a
//! whole or have no visible effect.
//!
//! txcell provides optimistic multi-version concurrency control with
//! snapshot isolation, commutable updates that avoid conflicts between
//! disjoint transactions, and conditional transactions that re-run
//! reactively when their read set changes.
//!
//! # Quick Start
//!
//! ```no_run
//! use txcell::{run_transaction, TxCell};
//!
//! fn main() -> txcell::Result<()> {
//!     let a = TxCell::new(100_i64);
//!     let b = TxCell::new(0_i64);
//!
//!     // Atomic transfer: either both writes land or neither does.
//!     run_transaction(|| {
//!         a.modify(|v| *v -= 10)?;
//!         b.modify(|v| *v += 10)
//!     })?;
//!
//!     // Commutes defer until commit and do not conflict with
//!     // disjoint transactions touching the same cell.
//!     run_transaction(|| a.commute(|v| *v += 1))?;
//!
//!     assert_eq!(a.get()?, 91);
//!     assert_eq!(b.get()?, 10);
//!     Ok(())
//! }
//! ```
//!
//! # Concepts
//!
//! | Concept | Purpose | Key API |
//! |---------|---------|---------|
//! | **Cell** | versioned transactional location | [`TxCell::new`], [`TxCell::get`], [`TxCell::set`], [`TxCell::modify`] |
//! | **Transaction** | atomic, retried on conflict | [`run_transaction`], [`rollback`] |
//! | **Commute** | conflict-free deferred update | [`TxCell::commute`] |
//! | **Conditional** | reactive re-run on change | [`conditional`], [`cancel_conditional`] |
//! | **Side effects** | deferred until fate is known | [`side_effect`], [`on_commit`], [`on_rollback`] |
//! | **Observers** | process-wide commit hook | [`when_committing`] |
//!
//! Internal crates (core, concurrency) are re-exported here; only this
//! surface is stable.

pub use txcell_concurrency::*;
