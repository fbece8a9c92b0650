//! Cell identity types
//!
//! Cells are identified by a process-unique `CellId`, allocated from an
//! atomic counter at construction. Identity is what the transaction
//! context keys its enlistment set by, and what the conditional
//! subscriber indexes subscriptions under (never cell references, so
//! cells do not transitively own their subscribers).

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque identity grouping cells that belong to one logical object
///
/// Higher layers (transactional dictionaries, sequences) attach the
/// same owner to every cell of a structure; the core only carries it
/// through the enlistment trait.
pub type Owner = Arc<dyn Any + Send + Sync>;

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a transactional cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(u64);

impl CellId {
    /// Allocate a fresh cell id
    ///
    /// # Panics
    ///
    /// Panics if the id counter reaches `u64::MAX` (overflow).
    pub fn next() -> CellId {
        let id = NEXT_CELL_ID
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .expect("cell id overflow: u64::MAX reached");
        CellId(id)
    }

    /// Get the numeric value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_ids_are_unique() {
        let a = CellId::next();
        let b = CellId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_cell_ids_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| CellId::next()).collect::<Vec<_>>()))
            .collect();

        let mut all: Vec<CellId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn test_cell_id_display() {
        let id = CellId::next();
        assert_eq!(id.to_string(), format!("cell:{}", id.as_u64()));
    }
}
