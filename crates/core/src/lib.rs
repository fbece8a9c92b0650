//! Core types for the txcell transactional memory runtime
//!
//! This crate holds the pieces shared by every layer above it:
//! - Stamp: the monotonically increasing 64-bit snapshot/commit version
//! - WriteStamp: the per-cell lock word held between commit phases
//! - CellId / Owner: cell identity and opaque grouping
//! - Enlistable: the dynamic-dispatch capability set the transaction
//!   manager uses to drive heterogeneous cells through two-phase commit
//! - StmError: the unified error model

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod stamp;
pub mod traits;
pub mod types;

pub use error::{Result, StmError};
pub use stamp::{Stamp, WriteStamp};
pub use traits::Enlistable;
pub use types::{CellId, Owner};
