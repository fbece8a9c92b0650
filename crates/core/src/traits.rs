//! The enlistment capability trait
//!
//! Cells of heterogeneous value types participate in a transaction
//! through this object-safe capability set. The transaction context
//! stores enlisted cells as `Arc<dyn Enlistable>` and the manager
//! drives two-phase commit, rollback, and version reclamation through
//! it without knowing any cell's value type.
//!
//! Thread safety: all methods must be safe to call concurrently from
//! multiple threads (requires Send + Sync). Per-thread state (the
//! pending write of the calling transaction) is keyed internally by
//! thread identity.

use crate::stamp::{Stamp, WriteStamp};
use crate::types::{CellId, Owner};

/// Capability set of a transactionally managed cell
///
/// `can_commit`/`commit`/`rollback` implement the two-phase commit
/// hooks; `trim` implements version reclamation; `has_changes` and
/// `owner` let the manager and higher layers classify participants.
pub trait Enlistable: Send + Sync {
    /// Identity of this cell
    fn id(&self) -> CellId;

    /// Whether the calling thread's transaction has a pending write
    /// on this cell
    fn has_changes(&self) -> bool;

    /// Phase 1 check: may the calling transaction commit this cell?
    ///
    /// Returns true only if no other thread holds the cell's write
    /// stamp and the head version does not exceed `start`. When the
    /// cell has a pending write for the calling thread, a true return
    /// also claims the write stamp with `claim`.
    fn can_commit(&self, start: Stamp, claim: WriteStamp) -> bool;

    /// Phase 2 apply: link the pending write (if any) as the new head
    /// at the claimed stamp, release the write stamp, and wake parked
    /// readers. Without a pending write this only clears local state.
    fn commit(&self);

    /// Discard the calling thread's pending write and release the
    /// write stamp if this thread holds it.
    fn rollback(&self);

    /// Detach history older than the newest record whose version is
    /// at or below `below`. Safe against concurrent chain walkers.
    fn trim(&self, below: Stamp);

    /// Opaque identity of the logical object this cell belongs to
    fn owner(&self) -> Option<Owner>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The manager stores participants as trait objects; the trait
    /// must stay object-safe.
    #[test]
    fn test_enlistable_trait_object() {
        fn accepts(_e: &dyn Enlistable) {}
        let _ = accepts as fn(&dyn Enlistable);
    }

    #[test]
    fn test_enlistable_is_send_sync() {
        fn assert_send<T: Send + ?Sized>() {}
        fn assert_sync<T: Sync + ?Sized>() {}

        assert_send::<Box<dyn Enlistable>>();
        assert_sync::<Box<dyn Enlistable>>();
    }
}
