//! Per-thread transaction context
//!
//! Each thread runs at most one transaction at a time; its state lives
//! in a thread-local slot installed by the manager on the outermost
//! `run_transaction` entry. The context tracks:
//!
//! - the start stamp (the snapshot every read resolves against)
//! - the ordered set of enlisted cells
//! - pending commutes and their degeneration state
//! - deferred side effects
//! - the control flags for commute execution (`commute_time`,
//!   `block_enlist`, `block_commute`)
//!
//! ## Commute degeneration
//!
//! A commute stays deferred only while its isolation holds. The moment
//! its affecting cell is enlisted by the surrounding transaction the
//! commute is *broken*: it must now execute inside the transaction, in
//! registration order, so later reads observe its result. Degeneration
//! runs with `block_commute` set at the outermost level, so commutes
//! issued from inside a degenerating commute execute immediately
//! instead of deferring again.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;
use txcell_core::{CellId, Enlistable, Result, Stamp, StmError};

/// A deferred, re-runnable commute closure
pub(crate) type CommuteFn = Rc<dyn Fn() -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommuteState {
    /// Still deferred; will run in the commit-time commute phase
    Ok,
    /// Isolation broken by an enlistment; must run in-transaction
    Broken,
    /// Already ran in-transaction
    Executed,
}

pub(crate) struct Commute {
    pub perform: CommuteFn,
    pub affecting: SmallVec<[CellId; 1]>,
    pub state: CommuteState,
}

/// Deferred actions delivered after the transaction's fate is decided
pub(crate) struct SideEffect {
    pub on_commit: Option<Box<dyn FnOnce()>>,
    pub on_rollback: Option<Box<dyn FnOnce()>>,
}

/// Ordered set of enlisted cells
///
/// Order is enlistment order; membership is by cell identity.
#[derive(Default)]
pub(crate) struct EnlistedSet {
    order: Vec<Arc<dyn Enlistable>>,
    ids: FxHashSet<CellId>,
}

impl EnlistedSet {
    /// Insert a cell; returns true iff it was not already present
    pub fn insert(&mut self, cell: Arc<dyn Enlistable>) -> bool {
        if self.ids.insert(cell.id()) {
            self.order.push(cell);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.ids.contains(&id)
    }

    pub fn cells(&self) -> &[Arc<dyn Enlistable>] {
        &self.order
    }

    pub fn cells_cloned(&self) -> Vec<Arc<dyn Enlistable>> {
        self.order.clone()
    }

    pub fn ids_cloned(&self) -> FxHashSet<CellId> {
        self.ids.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn into_cells(self) -> Vec<Arc<dyn Enlistable>> {
        self.order
    }
}

pub(crate) struct TxContext {
    pub start_stamp: Stamp,
    pub enlisted: EnlistedSet,
    pub commutes: Vec<Commute>,
    pub side_effects: Vec<SideEffect>,
    /// Index of the commute currently executing during degeneration;
    /// None outside commute execution
    pub commute_time: Option<usize>,
    /// The single cell a strict commute is permitted to enlist
    pub block_enlist: Option<CellId>,
    /// When set, newly issued commutes degenerate immediately
    pub block_commute: bool,
}

impl TxContext {
    fn new(start_stamp: Stamp) -> Self {
        TxContext {
            start_stamp,
            enlisted: EnlistedSet::default(),
            commutes: Vec::new(),
            side_effects: Vec::new(),
            commute_time: None,
            block_enlist: None,
            block_commute: false,
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<TxContext>> = const { RefCell::new(None) };
}

/// Install a fresh context for the outermost transaction on this thread
pub(crate) fn open(start: Stamp) {
    CONTEXT.with(|c| {
        let mut slot = c.borrow_mut();
        debug_assert!(slot.is_none(), "transaction context already open");
        *slot = Some(TxContext::new(start));
    });
}

/// Tear down and return this thread's context
pub(crate) fn close() -> Option<TxContext> {
    CONTEXT.with(|c| c.borrow_mut().take())
}

/// Run `f` against the active context; None when no transaction is open
pub(crate) fn try_with<R>(f: impl FnOnce(&mut TxContext) -> R) -> Option<R> {
    CONTEXT.with(|c| c.borrow_mut().as_mut().map(f))
}

/// Check if the current thread has an active transaction
pub fn in_transaction() -> bool {
    CONTEXT.with(|c| c.borrow().is_some())
}

/// The start stamp of the current transaction, if one is active
pub fn current_start_stamp() -> Option<Stamp> {
    try_with(|ctx| ctx.start_stamp)
}

/// Fail with [`StmError::OutOfTransaction`] unless a transaction is active
pub fn assert_in_transaction() -> Result<()> {
    if in_transaction() {
        Ok(())
    } else {
        Err(StmError::out_of_transaction("assert_in_transaction"))
    }
}

/// Register deferred side effects with the current transaction
///
/// `on_commit` runs after a successful commit; `on_rollback` runs on
/// every rollback, including conflict retries. Delivery is in
/// registration order.
pub fn side_effect(
    on_commit: impl FnOnce() + 'static,
    on_rollback: impl FnOnce() + 'static,
) -> Result<()> {
    push_side_effect(SideEffect {
        on_commit: Some(Box::new(on_commit)),
        on_rollback: Some(Box::new(on_rollback)),
    })
}

/// Register a commit-only side effect
pub fn on_commit(f: impl FnOnce() + 'static) -> Result<()> {
    push_side_effect(SideEffect {
        on_commit: Some(Box::new(f)),
        on_rollback: None,
    })
}

/// Register a rollback-only side effect
pub fn on_rollback(f: impl FnOnce() + 'static) -> Result<()> {
    push_side_effect(SideEffect {
        on_commit: None,
        on_rollback: Some(Box::new(f)),
    })
}

fn push_side_effect(fx: SideEffect) -> Result<()> {
    try_with(|ctx| ctx.side_effects.push(fx))
        .ok_or(StmError::out_of_transaction("side_effect"))
}

/// First-touch registration of a cell with the current transaction
///
/// Returns true iff the cell was not previously enlisted. Fails with
/// [`StmError::ForbiddenEnlist`] when a strict commute is executing
/// and the cell is not its affecting cell; the check applies whether
/// or not the cell was already enlisted, so a strict commute cannot
/// touch foreign cells at all.
pub(crate) fn enlist(cell: &Arc<dyn Enlistable>) -> Result<bool> {
    try_with(|ctx| {
        if let Some(allowed) = ctx.block_enlist {
            if allowed != cell.id() {
                return Err(StmError::forbidden_enlist(allowed, cell.id()));
            }
        }
        Ok(ctx.enlisted.insert(Arc::clone(cell)))
    })
    .unwrap_or(Err(StmError::out_of_transaction("enlist")))
}

/// Outcome of a commute registration attempt
pub(crate) enum CommuteDisposition {
    /// Registered; will run in the commit-time commute phase
    Deferred,
    /// Isolation is already broken; the caller must execute inline
    Degenerate,
}

/// Register a deferred commute, unless its isolation is already broken
///
/// A commute degenerates immediately when commutes are blocked (we are
/// inside a degenerating commute or the commit-time commute phase) or
/// when the affecting cell is already enlisted.
pub(crate) fn defer_commute(
    affecting: CellId,
    perform: CommuteFn,
) -> Result<CommuteDisposition> {
    try_with(|ctx| {
        if ctx.block_commute || ctx.enlisted.contains(affecting) {
            return CommuteDisposition::Degenerate;
        }
        ctx.commutes.push(Commute {
            perform,
            affecting: SmallVec::from_elem(affecting, 1),
            state: CommuteState::Ok,
        });
        CommuteDisposition::Deferred
    })
    .ok_or(StmError::out_of_transaction("commute"))
}

/// Run `f` with `block_enlist` set to `allowed`, restoring the
/// previous value afterwards
pub(crate) fn with_block_enlist<R>(
    allowed: Option<CellId>,
    f: impl FnOnce() -> Result<R>,
) -> Result<R> {
    let saved = try_with(|ctx| mem::replace(&mut ctx.block_enlist, allowed))
        .ok_or(StmError::out_of_transaction("commute"))?;
    let result = f();
    try_with(|ctx| ctx.block_enlist = saved);
    result
}

/// Break and execute commutes affected by a fresh enlistment
///
/// Called after a cell is newly enlisted. Marks every still-deferred
/// commute whose affecting set contains the cell as Broken, then
/// executes broken commutes in registration order up to the current
/// `commute_time` limit. On normal exit of the outermost run, all
/// non-deferred commutes are removed from the list.
pub(crate) fn degenerate_for(cell: CellId) -> Result<()> {
    let any_broken = try_with(|ctx| {
        let mut any = false;
        for commute in &mut ctx.commutes {
            if commute.state == CommuteState::Ok && commute.affecting.contains(&cell) {
                commute.state = CommuteState::Broken;
                any = true;
            }
        }
        any
    })
    .unwrap_or(false);

    if !any_broken {
        return Ok(());
    }
    run_broken_commutes()
}

fn run_broken_commutes() -> Result<()> {
    // The limit is the index of the commute we are currently inside,
    // so nested degeneration only executes commutes that precede it;
    // at the outermost level everything broken runs.
    let (entry_time, outermost) = try_with(|ctx| {
        let entry = ctx.commute_time;
        let outermost = entry.is_none();
        if outermost {
            ctx.block_commute = true;
        }
        (entry, outermost)
    })
    .unwrap_or((None, false));

    let result = loop {
        let next = try_with(|ctx| {
            let limit = entry_time.unwrap_or(ctx.commutes.len());
            let found = ctx
                .commutes
                .iter()
                .position(|c| c.state == CommuteState::Broken)
                .filter(|&i| i < limit);
            if let Some(i) = found {
                ctx.commutes[i].state = CommuteState::Executed;
                ctx.commute_time = Some(i);
                Some((
                    Rc::clone(&ctx.commutes[i].perform),
                    ctx.commutes[i].affecting.first().copied(),
                ))
            } else {
                None
            }
        })
        .flatten();

        let (perform, allowed) = match next {
            Some(pair) => pair,
            None => break Ok(()),
        };
        if let Err(e) = with_block_enlist(allowed, || perform()) {
            break Err(e);
        }
    };

    try_with(|ctx| {
        ctx.commute_time = entry_time;
        if outermost {
            ctx.block_commute = false;
            if result.is_ok() {
                ctx.commutes.retain(|c| c.state == CommuteState::Ok);
            }
        }
    });
    result
}

/// Run `f` against an isolated sub-context, capturing its enlistments
///
/// The caller's enlistments, commutes and commute flags are parked for
/// the duration; `f` sees an empty enlistment set, the given start
/// stamp, and `block_commute` in force. Side effects keep accumulating
/// on the shared list. Returns `f`'s result together with the cells
/// the isolated run enlisted (also on error, so the caller can roll
/// them back).
///
/// Used by the commit-time commute phase and by conditional read-set
/// capture.
pub(crate) fn run_isolated<R>(
    start: Stamp,
    f: impl FnOnce() -> Result<R>,
) -> (Result<R>, Vec<Arc<dyn Enlistable>>) {
    struct Saved {
        start_stamp: Stamp,
        enlisted: EnlistedSet,
        commutes: Vec<Commute>,
        commute_time: Option<usize>,
        block_enlist: Option<CellId>,
        block_commute: bool,
    }

    let saved = try_with(|ctx| Saved {
        start_stamp: mem::replace(&mut ctx.start_stamp, start),
        enlisted: mem::take(&mut ctx.enlisted),
        commutes: mem::take(&mut ctx.commutes),
        commute_time: ctx.commute_time.take(),
        block_enlist: ctx.block_enlist.take(),
        block_commute: mem::replace(&mut ctx.block_commute, true),
    })
    .expect("isolated run requires an active transaction");

    let result = f();

    let captured = try_with(|ctx| {
        ctx.start_stamp = saved.start_stamp;
        ctx.commutes = saved.commutes;
        ctx.commute_time = saved.commute_time;
        ctx.block_enlist = saved.block_enlist;
        ctx.block_commute = saved.block_commute;
        mem::replace(&mut ctx.enlisted, saved.enlisted).into_cells()
    })
    .expect("isolated run requires an active transaction");

    (result, captured)
}
