//! The versioned transactional cell
//!
//! `TxCell<T>` is a single transactionally managed location. It owns:
//!
//! - a head pointer to a chain of version records ordered by strictly
//!   decreasing stamp; the oldest reachable record ends the chain
//! - a write-stamp slot, the cell-level lock a committer holds between
//!   phase 1 and phase 2, with a parker readers wait on
//! - a per-thread pending slot holding the tentative value written by
//!   the current transaction
//!
//! Reads resolve against the transaction's start stamp by walking the
//! chain to the newest record at or below it. Writes stay pending and
//! thread-private until commit links them as the new head. Records are
//! never mutated after linking (only the `older` link is detached by
//! reclamation), so concurrent walkers that advanced past a detach
//! point keep a consistent view.

use crate::context::{self, CommuteDisposition};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use txcell_core::{CellId, Enlistable, Owner, Result, Stamp, StmError, WriteStamp};

struct VersionRecord<T> {
    version: Stamp,
    value: T,
    /// Next-older record; write-locked only at the reclamation detach
    /// point, read-locked per hop by chain walkers
    older: RwLock<Option<Arc<VersionRecord<T>>>>,
}

/// The write-stamp slot and its parker
struct LockSlot {
    state: Mutex<Option<WriteStamp>>,
    released: Condvar,
}

struct CellInner<T> {
    id: CellId,
    owner: Option<Owner>,
    head: RwLock<Arc<VersionRecord<T>>>,
    lock: LockSlot,
    /// Tentative new value per writing thread; present only while the
    /// thread's current transaction has written this cell
    pending: DashMap<ThreadId, T>,
}

/// A single transactionally managed value
///
/// Cloning the handle is cheap and shares the underlying cell. All
/// access from inside a transaction enlists the cell with the current
/// thread's context; reads outside a transaction return the committed
/// head value without enlisting.
///
/// # Example
///
/// ```ignore
/// let balance = TxCell::new(100_i64);
/// run_transaction(|| {
///     let b = balance.get()?;
///     balance.set(b - 10)
/// })?;
/// ```
pub struct TxCell<T: Clone + Send + Sync + 'static> {
    inner: Arc<CellInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for TxCell<T> {
    fn clone(&self) -> Self {
        TxCell {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static + Default> Default for TxCell<T> {
    fn default() -> Self {
        TxCell::new(T::default())
    }
}

fn current_tid() -> ThreadId {
    thread::current().id()
}

impl<T: Clone + Send + Sync + 'static> TxCell<T> {
    /// Create a cell holding `initial` at version zero
    pub fn new(initial: T) -> Self {
        Self::build(initial, None)
    }

    /// Create a cell with an opaque owner identity
    ///
    /// Higher layers attach the same owner to every cell of a logical
    /// object so participants can be grouped at commit time.
    pub fn with_owner(initial: T, owner: Owner) -> Self {
        Self::build(initial, Some(owner))
    }

    fn build(initial: T, owner: Option<Owner>) -> Self {
        TxCell {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                owner,
                head: RwLock::new(Arc::new(VersionRecord {
                    version: Stamp::ZERO,
                    value: initial,
                    older: RwLock::new(None),
                })),
                lock: LockSlot {
                    state: Mutex::new(None),
                    released: Condvar::new(),
                },
                pending: DashMap::new(),
            }),
        }
    }

    /// Identity of this cell
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// This cell as a commit participant
    pub fn as_enlistable(&self) -> Arc<dyn Enlistable> {
        Arc::clone(&self.inner) as Arc<dyn Enlistable>
    }

    #[cfg(test)]
    pub(crate) fn head_version(&self) -> Stamp {
        self.inner.head_version()
    }

    /// Read the cell's value
    ///
    /// Inside a transaction this returns the snapshot value as of the
    /// start stamp, or the transaction's own pending write. Outside a
    /// transaction it returns the committed head value without
    /// enlisting.
    pub fn get(&self) -> Result<T> {
        if !context::in_transaction() {
            return Ok(self.inner.head.read().value.clone());
        }
        self.touch()?;
        let start = self.start_stamp();
        if let Some(pending) = self.inner.pending.get(&current_tid()) {
            // We wrote this cell; if the head moved past our snapshot
            // in the meantime the write can no longer commit.
            if self.inner.head_version() > start {
                return Err(StmError::writable_read_collision(self.inner.id, start));
            }
            return Ok(pending.clone());
        }
        Ok(self.inner.read_at(start))
    }

    /// Read the committed snapshot value, ignoring any pending write
    /// made by this transaction
    pub fn read_old(&self) -> Result<T> {
        if !context::in_transaction() {
            return Err(StmError::out_of_transaction("read_old"));
        }
        self.touch()?;
        Ok(self.inner.read_at(self.start_stamp()))
    }

    /// Write a tentative new value
    ///
    /// The value stays private to this transaction until commit.
    pub fn set(&self, value: T) -> Result<()> {
        if !context::in_transaction() {
            return Err(StmError::out_of_transaction("set"));
        }
        self.touch()?;
        self.check_writable()?;
        self.inner.pending.insert(current_tid(), value);
        Ok(())
    }

    /// Read-modify-write in one step
    pub fn modify(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        if !context::in_transaction() {
            return Err(StmError::out_of_transaction("modify"));
        }
        self.touch()?;
        self.check_writable()?;
        let mut value = match self.inner.pending.get(&current_tid()) {
            Some(pending) => pending.clone(),
            None => self.inner.read_at(self.start_stamp()),
        };
        f(&mut value);
        self.inner.pending.insert(current_tid(), value);
        Ok(())
    }

    /// Defer a commuting update until commit
    ///
    /// The closure runs just before commit under a fresh start stamp,
    /// so disjoint transactions commuting the same cell do not
    /// conflict. The commute is *strict*: while it executes it may
    /// touch only this cell. If this transaction has already enlisted
    /// the cell (or commutes are blocked), the closure degenerates to
    /// an immediate ordinary modify.
    pub fn commute(&self, f: impl Fn(&mut T) + 'static) -> Result<()> {
        if !context::in_transaction() {
            return Err(StmError::out_of_transaction("commute"));
        }
        let cell = self.clone();
        let f = Rc::new(f);
        let apply = {
            let f = Rc::clone(&f);
            move || cell.modify(|v| f(v))
        };
        match context::defer_commute(self.inner.id, Rc::new(apply))? {
            CommuteDisposition::Deferred => Ok(()),
            CommuteDisposition::Degenerate => self.modify(|v| f(v)),
        }
    }

    fn start_stamp(&self) -> Stamp {
        context::current_start_stamp().expect("cell touched outside a transaction")
    }

    /// First-touch protocol: enlist, wait out competing writers whose
    /// stamp belongs in our snapshot, then degenerate broken commutes
    fn touch(&self) -> Result<()> {
        let enlistable = self.as_enlistable();
        if context::enlist(&enlistable)? {
            self.inner.wait_for_writer(self.start_stamp());
            context::degenerate_for(self.inner.id)?;
        }
        Ok(())
    }

    /// A write attempt collides whenever the head has advanced past
    /// our snapshot, whether or not this transaction wrote the cell
    /// before; the writable-read kind is reserved for re-reads.
    fn check_writable(&self) -> Result<()> {
        let start = self.start_stamp();
        if self.inner.head_version() > start {
            return Err(StmError::write_collision(self.inner.id, start));
        }
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> CellInner<T> {
    fn head_version(&self) -> Stamp {
        self.head.read().version
    }

    /// Snapshot selection: the newest record at or below `at`
    ///
    /// Falls back to the oldest reachable record; reclamation
    /// guarantees that record is at or below every live start stamp.
    fn read_at(&self, at: Stamp) -> T {
        let mut record = Arc::clone(&self.head.read());
        loop {
            if record.version <= at {
                return record.value.clone();
            }
            let next = record.older.read().clone();
            match next {
                Some(older) => record = older,
                None => return record.value.clone(),
            }
        }
    }

    /// Park until no competing writer's in-flight stamp belongs in the
    /// given snapshot
    #[cfg(not(feature = "spin-wait"))]
    fn wait_for_writer(&self, start: Stamp) {
        let mut slot = self.lock.state.lock();
        while slot
            .as_ref()
            .is_some_and(|ws| !ws.held_by_current_thread() && ws.blocks(start))
        {
            self.lock.released.wait(&mut slot);
        }
    }

    /// Spin until no competing writer's in-flight stamp belongs in the
    /// given snapshot
    #[cfg(feature = "spin-wait")]
    fn wait_for_writer(&self, start: Stamp) {
        loop {
            {
                let slot = self.lock.state.lock();
                if !slot
                    .as_ref()
                    .is_some_and(|ws| !ws.held_by_current_thread() && ws.blocks(start))
                {
                    return;
                }
            }
            std::hint::spin_loop();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Enlistable for CellInner<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn has_changes(&self) -> bool {
        self.pending.contains_key(&current_tid())
    }

    fn can_commit(&self, start: Stamp, claim: WriteStamp) -> bool {
        let mut slot = self.lock.state.lock();
        if let Some(holder) = slot.as_ref() {
            if holder.owner != claim.owner {
                return false;
            }
        }
        if self.head_version() > start {
            return false;
        }
        if self.has_changes() {
            *slot = Some(claim);
        }
        true
    }

    fn commit(&self) {
        if let Some((_, value)) = self.pending.remove(&current_tid()) {
            let mut slot = self.lock.state.lock();
            let version = slot
                .as_ref()
                .and_then(|ws| ws.version)
                .expect("write stamp missing or unassigned at commit");
            {
                let mut head = self.head.write();
                let previous = Arc::clone(&head);
                *head = Arc::new(VersionRecord {
                    version,
                    value,
                    older: RwLock::new(Some(previous)),
                });
            }
            *slot = None;
            drop(slot);
            self.lock.released.notify_all();
        }
    }

    fn rollback(&self) {
        self.pending.remove(&current_tid());
        let mut slot = self.lock.state.lock();
        if slot.as_ref().is_some_and(WriteStamp::held_by_current_thread) {
            *slot = None;
            drop(slot);
            self.lock.released.notify_all();
        }
    }

    fn trim(&self, below: Stamp) {
        // Find the newest record at or below the threshold and detach
        // everything older than it.
        let mut record = Arc::clone(&self.head.read());
        loop {
            if record.version <= below {
                break;
            }
            let next = record.older.read().clone();
            match next {
                Some(older) => record = older,
                None => return,
            }
        }
        *record.older.write() = None;
    }

    fn owner(&self) -> Option<Owner> {
        self.owner.clone()
    }
}
