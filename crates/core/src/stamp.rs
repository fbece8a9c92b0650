//! Stamp types for snapshot and commit versioning
//!
//! Every committed transaction advances the global stamp by one. A
//! transaction reads at its *start stamp* (the global stamp at open
//! time) and, if it writes, commits at a freshly allocated stamp that
//! is strictly greater than every previously committed one.
//!
//! ## Invariants
//!
//! - Stamps are monotonically increasing; they are never reused.
//! - A version record with stamp `v` is visible to a transaction with
//!   start stamp `s` iff `v <= s`.
//! - Stamp gaps may occur when a commit fails after its stamp was
//!   allocated (e.g. an observer veto). Consumers must not assume
//!   stamps are contiguous.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread::{self, ThreadId};

/// A snapshot or commit version
///
/// Produced only by the transaction manager's global counter. Start
/// stamps are read-only snapshot positions; write stamps are assigned
/// at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp(u64);

impl Stamp {
    /// The initial stamp; cells are created with their first version here.
    pub const ZERO: Stamp = Stamp(0);

    /// Create a stamp from its raw value
    pub const fn new(raw: u64) -> Self {
        Stamp(raw)
    }

    /// Get the numeric value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The next stamp in sequence
    ///
    /// Used by the commit path to propose a write stamp of
    /// `last_stamp + 1`.
    #[inline]
    pub const fn next(&self) -> Stamp {
        Stamp(self.0 + 1)
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The per-cell lock word held between phase 1 and phase 2 of commit
///
/// A cell whose write-stamp slot is occupied has a committer between
/// its commit-check and its commit (or rollback). The `version` is the
/// proposed commit stamp; per the data model it may still be
/// unassigned, and an unassigned version must be treated as "this
/// write may land in any snapshot" by waiting readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStamp {
    /// Thread currently committing this cell
    pub owner: ThreadId,
    /// Proposed commit stamp, once assigned
    pub version: Option<Stamp>,
}

impl WriteStamp {
    /// Create a write stamp owned by the calling thread
    pub fn for_current_thread(version: Stamp) -> Self {
        WriteStamp {
            owner: thread::current().id(),
            version: Some(version),
        }
    }

    /// Whether a reader with the given start stamp must wait for this
    /// writer to finish
    ///
    /// True while the version is unassigned or not beyond the reader's
    /// snapshot: in both cases the in-flight write belongs in the
    /// reader's snapshot, so reading the old head would be stale.
    #[inline]
    pub fn blocks(&self, start: Stamp) -> bool {
        match self.version {
            None => true,
            Some(v) => v <= start,
        }
    }

    /// Whether the calling thread holds this write stamp
    #[inline]
    pub fn held_by_current_thread(&self) -> bool {
        self.owner == thread::current().id()
    }
}
