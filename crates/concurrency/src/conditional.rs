//! Reactive conditional transactions
//!
//! `conditional(test, body)` registers a subscription that re-runs
//! whenever a commit changes any cell the test reads. The registry
//! indexes subscriptions by cell identity, never by cell reference,
//! so cells do not transitively own their subscribers, and a cancelled
//! subscription signals "inactive" through its emptied read set to any
//! trigger that already captured it.
//!
//! On every trigger the test is re-run in isolation; when its read set
//! drifts, the subscription is re-indexed under the new cells. The
//! body runs inside the re-fire transaction, so its writes commit
//! atomically with the reaction and can themselves trigger further
//! subscriptions.

use crate::context;
use crate::manager::{run_transaction, MANAGER};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use txcell_core::{CellId, Result, StmError};

type TestFn = Box<dyn Fn() -> Result<bool> + Send + Sync>;
type BodyFn = Box<dyn Fn() -> Result<bool> + Send + Sync>;

struct Subscription {
    id: u64,
    test: TestFn,
    body: BodyFn,
    /// Cells this subscription is currently indexed under; empty means
    /// inactive
    read_set: Mutex<FxHashSet<CellId>>,
}

/// Handle to a registered conditional
///
/// Cancelling removes the subscription from every index entry; a
/// trigger that already captured it observes the emptied read set and
/// skips it.
pub struct ConditionalHandle {
    sub: Arc<Subscription>,
}

impl std::fmt::Debug for ConditionalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalHandle")
            .field("id", &self.sub.id)
            .finish()
    }
}

impl ConditionalHandle {
    /// Deactivate this conditional
    pub fn cancel(&self) {
        MANAGER.subscriptions.deactivate(&self.sub);
    }
}

/// The cell -> subscription index
pub(crate) struct ConditionalRegistry {
    index: DashMap<CellId, Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl ConditionalRegistry {
    pub(crate) fn new() -> Self {
        ConditionalRegistry {
            index: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, test: TestFn, body: BodyFn) -> Result<ConditionalHandle> {
        let sub = Arc::new(Subscription {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            test,
            body,
            read_set: Mutex::new(FxHashSet::default()),
        });

        // The return value is ignored at registration; only the read
        // set matters.
        let (_, ids) = capture_read_set(sub.test.as_ref())?;
        if ids.is_empty() {
            return Err(StmError::EmptyConditionalReadSet);
        }

        *sub.read_set.lock() = ids.clone();
        for id in &ids {
            self.index.entry(*id).or_default().push(Arc::clone(&sub));
        }
        Ok(ConditionalHandle { sub })
    }

    /// Fire every subscription whose read set intersects the trigger
    /// set of a just-completed commit
    pub(crate) fn notify(&self, trigger: &[CellId]) -> Result<()> {
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        let mut fired: Vec<Arc<Subscription>> = Vec::new();
        for id in trigger {
            if let Some(entry) = self.index.get(id) {
                for sub in entry.iter() {
                    if seen.insert(sub.id) {
                        fired.push(Arc::clone(sub));
                    }
                }
            }
        }
        // Index guards dropped: re-firing re-enters the registry.
        for sub in fired {
            self.refire(&sub)?;
        }
        Ok(())
    }

    fn refire(&self, sub: &Arc<Subscription>) -> Result<()> {
        if sub.read_set.lock().is_empty() {
            return Ok(());
        }

        let mut outcome = None;
        run_transaction(|| {
            let (ready, ids) = capture_read_set(sub.test.as_ref())?;
            let keep = if ready { (sub.body)()? } else { true };
            outcome = Some((ids, keep));
            Ok(())
        })?;

        let (ids, keep) = outcome.expect("re-fire transaction completed");
        if ids.is_empty() {
            self.deactivate(sub);
            return Err(StmError::EmptyConditionalReadSet);
        }
        self.reindex(sub, ids);
        if !keep {
            self.deactivate(sub);
        }
        Ok(())
    }

    /// Move the subscription's index entries to its freshly observed
    /// read set
    fn reindex(&self, sub: &Arc<Subscription>, new_ids: FxHashSet<CellId>) {
        let mut held = sub.read_set.lock();
        if held.is_empty() {
            // Cancelled while firing; do not resurrect.
            return;
        }
        for id in new_ids.difference(&held) {
            self.index.entry(*id).or_default().push(Arc::clone(sub));
        }
        for id in held.difference(&new_ids) {
            self.unindex(*id, sub.id);
        }
        *held = new_ids;
    }

    fn deactivate(&self, sub: &Arc<Subscription>) {
        let mut held = sub.read_set.lock();
        for id in held.iter() {
            self.unindex(*id, sub.id);
        }
        held.clear();
    }

    fn unindex(&self, id: CellId, sub_id: u64) {
        if let Some(mut entry) = self.index.get_mut(&id) {
            entry.retain(|s| s.id != sub_id);
        }
        self.index.remove_if(&id, |_, subs| subs.is_empty());
    }
}

/// Run a read-set probe in an isolated sub-context
///
/// Inside a transaction the probe sees the enclosing snapshot but its
/// enlistments are captured separately and rolled back; outside, a
/// transaction is opened around it.
fn capture_read_set(f: &(dyn Fn() -> Result<bool> + Send + Sync)) -> Result<(bool, FxHashSet<CellId>)> {
    if context::in_transaction() {
        capture_isolated(f)
    } else {
        let mut outcome = None;
        run_transaction(|| {
            outcome = Some(capture_isolated(f)?);
            Ok(())
        })?;
        Ok(outcome.expect("capture transaction completed"))
    }
}

fn capture_isolated(
    f: &(dyn Fn() -> Result<bool> + Send + Sync),
) -> Result<(bool, FxHashSet<CellId>)> {
    let start = context::current_start_stamp().expect("capture requires an active transaction");
    let (result, captured) = context::run_isolated(start, || f());
    let ids = captured.iter().map(|c| c.id()).collect();
    for cell in &captured {
        cell.rollback();
    }
    result.map(|ready| (ready, ids))
}

/// Register a reactive conditional transaction
///
/// `test` is evaluated immediately to capture its read set (its result
/// is ignored at registration). Afterwards, every commit that changes
/// a cell in the read set re-runs `test` in a new transaction; when it
/// returns true, `body` runs in that same transaction. A body
/// returning false removes the subscription. A test that touches no
/// cells fails with [`StmError::EmptyConditionalReadSet`].
pub fn conditional(
    test: impl Fn() -> Result<bool> + Send + Sync + 'static,
    body: impl Fn() -> Result<bool> + Send + Sync + 'static,
) -> Result<ConditionalHandle> {
    MANAGER
        .subscriptions
        .register(Box::new(test), Box::new(body))
}

/// Cancel a registered conditional
pub fn cancel_conditional(handle: &ConditionalHandle) {
    handle.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::TxCell;

    #[test]
    fn test_conditional_with_empty_read_set_fails() {
        let result = conditional(|| Ok(true), || Ok(true));
        assert_eq!(result.unwrap_err(), StmError::EmptyConditionalReadSet);
    }

    #[test]
    fn test_conditional_fires_on_trigger() {
        let flag = TxCell::new(false);
        let counter = TxCell::new(0_i32);

        let test_flag = flag.clone();
        let body_counter = counter.clone();
        let _handle = conditional(
            move || test_flag.get(),
            move || {
                body_counter.modify(|n| *n += 1)?;
                Ok(true)
            },
        )
        .unwrap();

        run_transaction(|| flag.set(true)).unwrap();
        assert_eq!(counter.get().unwrap(), 1);

        // Writing true again still changes the cell, so the
        // subscription fires again.
        run_transaction(|| flag.set(true)).unwrap();
        assert_eq!(counter.get().unwrap(), 2);
    }

    #[test]
    fn test_conditional_not_fired_when_test_false() {
        let flag = TxCell::new(false);
        let counter = TxCell::new(0_i32);

        let test_flag = flag.clone();
        let body_counter = counter.clone();
        let _handle = conditional(
            move || test_flag.get(),
            move || {
                body_counter.modify(|n| *n += 1)?;
                Ok(true)
            },
        )
        .unwrap();

        // The trigger fires, but the test comes back false: no body.
        run_transaction(|| flag.set(false)).unwrap();
        assert_eq!(counter.get().unwrap(), 0);
    }

    #[test]
    fn test_body_returning_false_unsubscribes() {
        let flag = TxCell::new(false);
        let counter = TxCell::new(0_i32);

        let test_flag = flag.clone();
        let body_counter = counter.clone();
        let _handle = conditional(
            move || test_flag.get(),
            move || {
                body_counter.modify(|n| *n += 1)?;
                Ok(false)
            },
        )
        .unwrap();

        run_transaction(|| flag.set(true)).unwrap();
        run_transaction(|| flag.set(true)).unwrap();
        assert_eq!(counter.get().unwrap(), 1);
    }

    #[test]
    fn test_cancel_stops_firing() {
        let flag = TxCell::new(false);
        let counter = TxCell::new(0_i32);

        let test_flag = flag.clone();
        let body_counter = counter.clone();
        let handle = conditional(
            move || test_flag.get(),
            move || {
                body_counter.modify(|n| *n += 1)?;
                Ok(true)
            },
        )
        .unwrap();

        run_transaction(|| flag.set(true)).unwrap();
        assert_eq!(counter.get().unwrap(), 1);

        cancel_conditional(&handle);
        run_transaction(|| flag.set(true)).unwrap();
        assert_eq!(counter.get().unwrap(), 1);
    }

    #[test]
    fn test_registration_does_not_enlist_into_enclosing_transaction() {
        let probe = TxCell::new(1_i32);
        let other = TxCell::new(0_i32);

        run_transaction(|| {
            let probe_for_test = probe.clone();
            let _handle = conditional(move || Ok(probe_for_test.get()? > 0), || Ok(true))?;
            // The registration probe read `probe`, but that read was
            // isolated: this transaction has only touched `other`.
            other.set(5)
        })
        .unwrap();
        assert_eq!(other.get().unwrap(), 5);
    }

    #[test]
    fn test_reindex_follows_test_read_set() {
        let selector = TxCell::new(false);
        let a = TxCell::new(0_i32);
        let b = TxCell::new(0_i32);
        let counter = TxCell::new(0_i32);

        let (sel, aa, bb) = (selector.clone(), a.clone(), b.clone());
        let body_counter = counter.clone();
        let _handle = conditional(
            move || {
                // Reads `a` or `b` depending on the selector: the read
                // set drifts between firings.
                if sel.get()? {
                    Ok(bb.get()? > 0)
                } else {
                    Ok(aa.get()? > 0)
                }
            },
            move || {
                body_counter.modify(|n| *n += 1)?;
                Ok(true)
            },
        )
        .unwrap();

        // Flip the selector: the subscription re-indexes onto `b`.
        run_transaction(|| selector.set(true)).unwrap();
        let after_flip = counter.get().unwrap();

        // `a` is no longer in the read set: no fire.
        run_transaction(|| a.set(1)).unwrap();
        assert_eq!(counter.get().unwrap(), after_flip);

        // `b` is: fires, and the test is now true.
        run_transaction(|| b.set(1)).unwrap();
        assert_eq!(counter.get().unwrap(), after_flip + 1);
    }
}
