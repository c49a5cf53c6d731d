//! Batched stack mutations.
//!
//! Every logical stack operation runs inside exactly one transaction: ops
//! are recorded while the operation computes its new stack value, then
//! committed as a single batch to the host's [`TransactionBackend`]. Units'
//! committed visibility flags change only after the backend acknowledges
//! the batch, so `is_visible` reads always reflect what is actually on
//! screen. The commit happens on failure too, carrying whatever partial
//! mutations the operation recorded before failing.

use super::{NavStack, RegionId, SingleStack, StackHostState, StackItem, TableStack};
use crate::core::Lens;
use crate::effect::RouteEffect;
use futures::future::BoxFuture;
use log::trace;
use std::fmt;
use std::sync::Arc;

/// One display mutation within a transaction batch.
#[derive(Clone, Debug)]
pub enum TxnOp {
    /// Place a freshly constructed unit into the region, visible.
    Add { region: RegionId, item: StackItem },
    Show(StackItem),
    Hide(StackItem),
}

/// Applies committed batches to the real display layer.
///
/// `apply` resolves when the platform has acknowledged the whole batch.
/// Implementations only move things on screen; the committed visibility
/// flags on the units are maintained by the transaction itself.
pub trait TransactionBackend: Send + Sync + fmt::Debug {
    fn apply(&self, ops: Vec<TxnOp>) -> BoxFuture<'static, ()>;
}

/// An open batch of display mutations.
#[derive(Debug)]
pub struct StackTransaction {
    backend: Arc<dyn TransactionBackend>,
    ops: Vec<TxnOp>,
}

impl StackTransaction {
    pub(crate) fn begin(backend: Arc<dyn TransactionBackend>) -> Self {
        Self {
            backend,
            ops: Vec::new(),
        }
    }

    pub fn add(&mut self, region: RegionId, item: &StackItem) {
        self.ops.push(TxnOp::Add {
            region,
            item: item.clone(),
        });
    }

    pub fn show(&mut self, item: &StackItem) {
        self.ops.push(TxnOp::Show(item.clone()));
    }

    pub fn hide(&mut self, item: &StackItem) {
        self.ops.push(TxnOp::Hide(item.clone()));
    }

    /// Commits the batch and, once acknowledged, folds the recorded ops
    /// into the units' committed visibility flags.
    pub async fn commit(self) {
        trace!(target: "switchyard::stack", "committing {} ops", self.ops.len());
        self.backend.apply(self.ops.clone()).await;
        for op in &self.ops {
            match op {
                TxnOp::Add { item, .. } | TxnOp::Show(item) => {
                    item.unit.controller().set_visible(true);
                }
                TxnOp::Hide(item) => item.unit.controller().set_visible(false),
            }
        }
    }
}

/// The state stack routes see while a transaction is open: the focused
/// stack value, the host's display region, and the open batch.
pub struct StackTxnState<S> {
    pub state: S,
    pub region: RegionId,
    pub txn: StackTransaction,
}

/// Wraps an inner effect in a transaction over the host's backend:
/// begin, run, commit once, also when the inner effect failed.
pub fn in_transaction<R>(
    inner: RouteEffect<StackTxnState<StackHostState>, R>,
) -> RouteEffect<StackHostState, R>
where
    R: Send + 'static,
{
    RouteEffect::new(move |host_state: StackHostState, cxt| {
        let inner = inner.clone();
        Box::pin(async move {
            let txn = StackTransaction::begin(Arc::clone(&host_state.backend));
            let region = host_state.host.region();
            let (inner_state, result) = inner
                .run(
                    StackTxnState {
                        state: host_state,
                        region,
                        txn,
                    },
                    cxt,
                )
                .await;
            let StackTxnState { state, txn, .. } = inner_state;
            txn.commit().await;
            (state, result)
        })
    })
}

/// Focuses an in-transaction effect through a lens, carrying the open
/// transaction across the focus boundary.
pub fn map_inner<S, Sub, R>(
    inner: RouteEffect<StackTxnState<Sub>, R>,
    lens: Lens<S, Sub>,
) -> RouteEffect<StackTxnState<S>, R>
where
    S: Send + 'static,
    Sub: Send + 'static,
    R: Send + 'static,
{
    RouteEffect::new(move |outer: StackTxnState<S>, cxt| {
        let inner = inner.clone();
        let lens = lens.clone();
        Box::pin(async move {
            let StackTxnState { state, region, txn } = outer;
            let focused = lens.get(&state);
            let (sub, result) = inner
                .run(
                    StackTxnState {
                        state: focused,
                        region,
                        txn,
                    },
                    cxt,
                )
                .await;
            let StackTxnState {
                state: focused,
                txn,
                ..
            } = sub;
            (
                StackTxnState {
                    state: lens.set(state, focused),
                    region,
                    txn,
                },
                result,
            )
        })
    })
}

/// Dispatches on the stack variant, running the matching branch. Both
/// branches see the same region and open transaction.
pub fn fold_stack<R>(
    single: RouteEffect<StackTxnState<SingleStack>, R>,
    table: RouteEffect<StackTxnState<TableStack>, R>,
) -> RouteEffect<StackTxnState<NavStack>, R>
where
    R: Send + 'static,
{
    RouteEffect::new(move |outer: StackTxnState<NavStack>, cxt| {
        let single = single.clone();
        let table = table.clone();
        Box::pin(async move {
            let StackTxnState { state, region, txn } = outer;
            match state {
                NavStack::Single(stack) => {
                    let (inner, result) = single
                        .run(
                            StackTxnState {
                                state: stack,
                                region,
                                txn,
                            },
                            cxt,
                        )
                        .await;
                    let StackTxnState { state, txn, .. } = inner;
                    (
                        StackTxnState {
                            state: NavStack::Single(state),
                            region,
                            txn,
                        },
                        result,
                    )
                }
                NavStack::Table(stack) => {
                    let (inner, result) = table
                        .run(
                            StackTxnState {
                                state: stack,
                                region,
                                txn,
                            },
                            cxt,
                        )
                        .await;
                    let StackTxnState { state, txn, .. } = inner;
                    (
                        StackTxnState {
                            state: NavStack::Table(state),
                            region,
                            txn,
                        },
                        result,
                    )
                }
            }
        })
    })
}
