//! Transaction manager: stamp allocation, commit coordination, and
//! version reclamation
//!
//! A single process-wide manager sequences every transaction:
//!
//! 1. `begin` pairs reading the global stamp with insertion into the
//!    active-start multiset in one uninterruptable step, so a
//!    transaction is either fully live or fully absent to the
//!    reclaimer.
//! 2. The retry driver runs the body, catching retry-class errors and
//!    re-executing from a fresh start stamp.
//! 3. Commit is two-phase: phase 1 claims per-cell write stamps and
//!    allocates the commit stamp under the single stamp lock; phase 2
//!    links new versions outside the lock. Commutes execute just
//!    before phase 1 under a refreshed start stamp.
//! 4. Every Nth commit, a single-executor reclaimer trims version
//!    chains below the minimum active start stamp.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. Read-only fast path: commit() every enlisted cell, done
//! 2. Execute deferred commutes under a refreshed start stamp
//! 3. Assert commute enlistments are disjoint from outer enlistments
//! 4. Lock stamp_lock; propose write stamp = last_stamp + 1
//! 5. can_commit(proposed) over the commute set; on refusal roll the
//!    commute set back and restart from 2
//! 6. can_commit(proposed) over the outer set at the ORIGINAL start
//!    stamp; on refusal roll everything back and retry the whole body
//! 7. Advance last_stamp to the proposed stamp; unlock
//! 8. Notify commit observers (may veto -> full rollback, no retry)
//! 9. commit() every participant; enqueue changed cells for
//!    reclamation; close; deliver on_commit effects; fire conditionals
//! ```
//!
//! Stamp gaps may occur if a commit fails after stamp allocation (an
//! observer veto). Consumers must not assume stamps are contiguous;
//! a gap means no data was committed at that stamp.

use crate::conditional::ConditionalRegistry;
use crate::context::{self, Commute, CommuteState, TxContext};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use txcell_core::{CellId, Enlistable, Result, Stamp, StmError, WriteStamp};

/// Commits between reclamation passes
const RECLAIM_EVERY: u64 = 32;

/// What a commit observer sees between phase 1 and phase 2
pub struct CommitNotice<'a> {
    /// The freshly allocated commit stamp
    pub stamp: Stamp,
    /// Identities of the cells with actual changes
    pub changed: &'a [CellId],
}

type Observer = Arc<dyn Fn(&CommitNotice<'_>) -> Result<()> + Send + Sync>;

/// Handle to a registered commit observer
pub struct ObserverHandle {
    id: u64,
}

impl ObserverHandle {
    /// Unregister the observer
    pub fn cancel(self) {
        MANAGER.observers.write().retain(|(id, _)| *id != self.id);
    }
}

struct RetiredEntry {
    version: Stamp,
    cells: Vec<Arc<dyn Enlistable>>,
}

/// Process-wide transaction coordination state
///
/// Initialized at first use, never torn down. Thread-local contexts
/// index into this runtime.
pub(crate) struct TransactionManager {
    /// Monotonically increasing global stamp; sole writer is the
    /// commit path under `stamp_lock`
    last_stamp: AtomicU64,
    /// Serializes write-stamp assignment (phase 1 only)
    stamp_lock: Mutex<()>,
    /// Start stamps of live transactions, as a multiset
    active_starts: Mutex<BTreeMap<u64, usize>>,
    /// Cells that accumulated history, tagged with the commit stamp
    /// that superseded them; multi-producer, single-consumer
    retired: Mutex<VecDeque<RetiredEntry>>,
    commit_tally: AtomicU64,
    /// Single-executor flag for the reclaimer
    reclaiming: AtomicBool,
    pub(crate) subscriptions: ConditionalRegistry,
    observers: RwLock<Vec<(u64, Observer)>>,
    next_observer_id: AtomicU64,
}

pub(crate) static MANAGER: Lazy<TransactionManager> = Lazy::new(TransactionManager::new);

impl TransactionManager {
    fn new() -> Self {
        TransactionManager {
            last_stamp: AtomicU64::new(0),
            stamp_lock: Mutex::new(()),
            active_starts: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(VecDeque::new()),
            commit_tally: AtomicU64::new(0),
            reclaiming: AtomicBool::new(false),
            subscriptions: ConditionalRegistry::new(),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn last_stamp(&self) -> Stamp {
        Stamp::new(self.last_stamp.load(Ordering::SeqCst))
    }

    /// Open a transaction: allocate the start stamp and register it in
    /// the active set in one step
    fn begin(&self) {
        let mut actives = self.active_starts.lock();
        let start = self.last_stamp();
        *actives.entry(start.as_u64()).or_insert(0) += 1;
        drop(actives);
        context::open(start);
    }

    fn release_start(&self, start: Stamp) {
        let mut actives = self.active_starts.lock();
        if let Some(count) = actives.get_mut(&start.as_u64()) {
            *count -= 1;
            if *count == 0 {
                actives.remove(&start.as_u64());
            }
        }
    }

    /// Roll back and tear down the current transaction, if one is open
    ///
    /// Rolls back every enlisted cell, delivers `on_rollback` effects
    /// in registration order, and releases the start stamp. A no-op
    /// when the context is already closed (commit owns its own
    /// teardown).
    fn abort_if_open(&self) {
        if let Some(ctx) = context::close() {
            for cell in ctx.enlisted.cells() {
                cell.rollback();
            }
            self.release_start(ctx.start_stamp);
            for fx in ctx.side_effects {
                if let Some(f) = fx.on_rollback {
                    f();
                }
            }
        }
    }

    /// Two-phase commit of the current transaction
    ///
    /// On success the context is closed and side effects delivered.
    /// On failure the commute set has been rolled back; the caller
    /// tears down the rest via `abort_if_open`.
    fn try_commit(&self) -> Result<()> {
        let (start, has_writes, commutes) = context::try_with(|ctx| {
            let commutes = mem::take(&mut ctx.commutes);
            let has_writes = ctx.enlisted.cells().iter().any(|c| c.has_changes());
            (ctx.start_stamp, has_writes, commutes)
        })
        .expect("commit requires an active transaction");

        let commutes: Vec<Commute> = commutes
            .into_iter()
            .filter(|c| c.state == CommuteState::Ok)
            .collect();

        // Read-only fast path: nothing to lock, nothing to publish.
        if commutes.is_empty() && !has_writes {
            let ctx = context::close().expect("commit requires an active transaction");
            for cell in ctx.enlisted.cells() {
                cell.commit();
            }
            self.finish(ctx, Vec::new())?;
            return Ok(());
        }

        let outer = context::try_with(|ctx| ctx.enlisted.cells_cloned())
            .expect("commit requires an active transaction");

        loop {
            // Execute commutes under a refreshed start stamp, isolated
            // from the outer enlistments.
            let (commute_cells, commute_start) = if commutes.is_empty() {
                (Vec::new(), start)
            } else {
                self.run_commute_phase(&commutes)?
            };

            // Commuted enlistments overlapping the outer set is a
            // programmer error: the commute did not commute.
            if let Some(overlap) = commute_cells
                .iter()
                .find(|c| outer.iter().any(|o| o.id() == c.id()))
            {
                let cell = overlap.id();
                for c in &commute_cells {
                    c.rollback();
                }
                return Err(StmError::invalid_commute(cell));
            }

            // Phase 1: claim write stamps under the stamp lock.
            let guard = self.stamp_lock.lock();
            let proposed = Stamp::new(
                self.last_stamp
                    .load(Ordering::SeqCst)
                    .checked_add(1)
                    .expect("stamp counter overflow: u64::MAX reached"),
            );
            let claim = WriteStamp::for_current_thread(proposed);

            let commute_ok = commute_cells
                .iter()
                .all(|c| c.can_commit(commute_start, claim));
            if !commute_ok {
                for c in &commute_cells {
                    c.rollback();
                }
                drop(guard);
                // Commute failure retries only the commutes, under an
                // again-refreshed stamp.
                continue;
            }

            let mut refused = None;
            for cell in &outer {
                if !cell.can_commit(start, claim) {
                    refused = Some(cell.id());
                    break;
                }
            }
            if let Some(cell) = refused {
                for c in commute_cells.iter().chain(outer.iter()) {
                    c.rollback();
                }
                drop(guard);
                // The whole body must re-run at a fresh start stamp.
                return Err(StmError::write_collision(cell, start));
            }

            self.last_stamp.store(proposed.as_u64(), Ordering::SeqCst);
            drop(guard);

            // Between the phases: observers may veto. The stamp is
            // already allocated and stays as a gap on veto.
            let trigger: Vec<Arc<dyn Enlistable>> = commute_cells
                .iter()
                .chain(outer.iter())
                .filter(|c| c.has_changes())
                .cloned()
                .collect();
            let changed: Vec<CellId> = trigger.iter().map(|c| c.id()).collect();
            if let Err(veto) = self.notify_observers(proposed, &changed) {
                tracing::error!(stamp = proposed.as_u64(), error = %veto, "commit vetoed after stamp allocation");
                for c in &commute_cells {
                    c.rollback();
                }
                return Err(veto);
            }

            // Phase 2: publish, outside the stamp lock.
            for cell in commute_cells.iter().chain(outer.iter()) {
                cell.commit();
            }
            if !trigger.is_empty() {
                self.retired.lock().push_back(RetiredEntry {
                    version: proposed,
                    cells: trigger.clone(),
                });
            }

            let ctx = context::close().expect("commit requires an active transaction");
            self.finish(ctx, changed)?;
            return Ok(());
        }
    }

    /// Post-commit teardown: release the start stamp, deliver
    /// on_commit effects in order, tick the reclaimer, fire
    /// conditionals on the trigger set
    fn finish(&self, ctx: TxContext, trigger: Vec<CellId>) -> Result<()> {
        self.release_start(ctx.start_stamp);
        for fx in ctx.side_effects {
            if let Some(f) = fx.on_commit {
                f();
            }
        }
        self.maybe_reclaim();
        if !trigger.is_empty() {
            self.subscriptions.notify(&trigger)?;
        }
        Ok(())
    }

    /// Execute deferred commutes into an isolated context under a
    /// refreshed start stamp, retrying the whole batch on conflict
    ///
    /// Returns the commute enlistments and the stamp they ran at; the
    /// enlistments are merged into the committing set only after the
    /// commit decision.
    fn run_commute_phase(
        &self,
        commutes: &[Commute],
    ) -> Result<(Vec<Arc<dyn Enlistable>>, Stamp)> {
        loop {
            let fresh = self.last_stamp();
            let (result, captured) = context::run_isolated(fresh, || {
                for commute in commutes {
                    let allowed = commute.affecting.first().copied();
                    context::with_block_enlist(allowed, || (commute.perform)())?;
                }
                Ok(())
            });
            match result {
                Ok(()) => return Ok((captured, fresh)),
                Err(e) if e.is_retryable() => {
                    for cell in &captured {
                        cell.rollback();
                    }
                }
                Err(e) => {
                    for cell in &captured {
                        cell.rollback();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn notify_observers(&self, stamp: Stamp, changed: &[CellId]) -> Result<()> {
        let observers: Vec<Observer> = self
            .observers
            .read()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        let notice = CommitNotice { stamp, changed };
        for observer in observers {
            observer(&notice)?;
        }
        Ok(())
    }

    /// Trim obsolete versions once every `RECLAIM_EVERY` commits
    ///
    /// Drains retired entries older than the minimum active start
    /// stamp and trims each referenced cell once. The retained record
    /// of every trimmed cell has version <= threshold <= any live
    /// start stamp, so every live transaction can still locate its
    /// snapshot.
    fn maybe_reclaim(&self) {
        let tally = self.commit_tally.fetch_add(1, Ordering::SeqCst) + 1;
        if tally % RECLAIM_EVERY != 0 {
            return;
        }
        if self
            .reclaiming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let threshold = {
            let actives = self.active_starts.lock();
            actives
                .keys()
                .next()
                .copied()
                .map(Stamp::new)
                .unwrap_or_else(|| self.last_stamp())
        };

        let mut due: FxHashMap<CellId, Arc<dyn Enlistable>> = FxHashMap::default();
        {
            let mut retired = self.retired.lock();
            while retired.front().is_some_and(|e| e.version < threshold) {
                let entry = retired.pop_front().expect("front checked above");
                for cell in entry.cells {
                    due.insert(cell.id(), cell);
                }
            }
        }

        if !due.is_empty() {
            tracing::debug!(
                threshold = threshold.as_u64(),
                cells = due.len(),
                "reclaiming obsolete versions"
            );
            for cell in due.values() {
                cell.trim(threshold);
            }
        }
        self.reclaiming.store(false, Ordering::SeqCst);
    }
}

/// Run `body` as an atomic transaction
///
/// On the outermost call this opens a context at a fresh start stamp,
/// executes the body, and commits two-phase; conflicts re-execute the
/// body at a new stamp until it commits. Nested calls join the
/// enclosing transaction. Retry-class errors never escape; all other
/// errors roll the transaction back (running `on_rollback` effects)
/// and propagate.
pub fn run_transaction<T>(mut body: impl FnMut() -> Result<T>) -> Result<T> {
    if context::in_transaction() {
        return body();
    }
    let manager = &*MANAGER;
    loop {
        manager.begin();
        match body() {
            Ok(value) => match manager.try_commit() {
                Ok(()) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::trace!(error = %e, "commit conflict, retrying transaction");
                    manager.abort_if_open();
                }
                Err(e) => {
                    manager.abort_if_open();
                    return Err(e);
                }
            },
            Err(e) if e.is_retryable() => {
                tracing::trace!(error = %e, "transaction body conflict, retrying");
                manager.abort_if_open();
            }
            Err(e) => {
                manager.abort_if_open();
                return Err(e);
            }
        }
    }
}

/// Abort the current transaction
///
/// Returns the error the body should propagate: with `retry: true`
/// the driver restarts the body at a fresh start stamp; with
/// `retry: false` the transaction terminates without commit and the
/// error surfaces from `run_transaction`.
pub fn rollback<T>(retry: bool) -> Result<T> {
    Err(StmError::ExplicitRollback { retry })
}

/// Register a process-wide commit observer
///
/// The observer runs on every committing thread between phase 1 and
/// phase 2, seeing the allocated stamp and the changed cells. It may
/// veto the commit by returning an error: the transaction rolls back
/// in full and the error propagates without retry. Observers must not
/// start transactions.
pub fn when_committing(
    f: impl Fn(&CommitNotice<'_>) -> Result<()> + Send + Sync + 'static,
) -> ObserverHandle {
    let id = MANAGER.next_observer_id.fetch_add(1, Ordering::SeqCst);
    MANAGER.observers.write().push((id, Arc::new(f)));
    ObserverHandle { id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::TxCell;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_nested_run_transaction_joins() {
        let cell = TxCell::new(1_i32);
        run_transaction(|| {
            cell.set(2)?;
            run_transaction(|| {
                // Same context: the outer pending write is visible.
                assert_eq!(cell.get()?, 2);
                cell.set(3)
            })?;
            assert_eq!(cell.get()?, 3);
            Ok(())
        })
        .unwrap();
        assert_eq!(cell.get().unwrap(), 3);
    }

    #[test]
    fn test_commit_stamps_strictly_increase() {
        let cell = TxCell::new(0_i32);
        let mut stamps = Vec::new();
        for i in 0..5 {
            run_transaction(|| cell.set(i)).unwrap();
            stamps.push(MANAGER.last_stamp());
        }
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_read_only_transaction_leaves_head_untouched() {
        let cell = TxCell::new(5_i32);
        run_transaction(|| cell.set(6)).unwrap();
        let before = cell.head_version();
        run_transaction(|| cell.get()).unwrap();
        assert_eq!(cell.head_version(), before);
        assert_eq!(cell.get().unwrap(), 6);
    }

    #[test]
    fn test_explicit_rollback_no_retry_surfaces() {
        let cell = TxCell::new(1_i32);
        let result: Result<()> = run_transaction(|| {
            cell.set(99)?;
            rollback(false)
        });
        assert_eq!(result, Err(StmError::ExplicitRollback { retry: false }));
        assert_eq!(cell.get().unwrap(), 1);
    }

    #[test]
    fn test_explicit_rollback_with_retry_reruns_body() {
        let cell = TxCell::new(0_i32);
        let attempts = AtomicUsize::new(0);
        run_transaction(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            cell.set(n as i32 + 10)?;
            if n == 0 {
                return rollback(true);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(cell.get().unwrap(), 11);
    }

    #[test]
    fn test_observer_sees_changed_cells_and_can_veto() {
        let cell = TxCell::new(0_i32);
        let id = cell.id();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_in_observer = Arc::clone(&seen);
        let handle = when_committing(move |notice| {
            if notice.changed.contains(&id) {
                seen_in_observer.fetch_add(1, Ordering::SeqCst);
                return Err(StmError::commit_vetoed("audit refused"));
            }
            Ok(())
        });

        let result = run_transaction(|| cell.set(42));
        assert!(matches!(result, Err(StmError::CommitVetoed { .. })));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        // Vetoed commit left no trace.
        assert_eq!(cell.get().unwrap(), 0);

        handle.cancel();
        run_transaction(|| cell.set(42)).unwrap();
        assert_eq!(cell.get().unwrap(), 42);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reclamation_trims_below_min_active_start() {
        let cell = TxCell::new(0_i32);
        // Enough commits to cross several reclamation intervals.
        for i in 0..(RECLAIM_EVERY as i32 * 3) {
            run_transaction(|| cell.set(i)).unwrap();
        }
        // With no live readers the chain should have been cut down;
        // the head must of course survive.
        assert_eq!(cell.get().unwrap(), RECLAIM_EVERY as i32 * 3 - 1);
    }
}
