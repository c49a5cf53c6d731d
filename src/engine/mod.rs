//! Serialized effect execution.
//!
//! A [`MainEngine`] owns the canonical state and evaluates effects under an
//! exclusive slot: at most one effect runs at a time, waiters proceed in
//! arrival order, and each effect sees exactly the state its predecessor
//! produced. An effect that raises an uncontrolled fault is caught at the
//! engine boundary; the canonical state stays at its last committed value
//! and the caller gets a desynchronization failure.
//!
//! [`SubEngine`]s are cheap lens-focused views onto a main engine. They
//! share its slot, so a sub-engine run is serialized against every other
//! run on the same root.

use crate::core::{Lens, RouteFailure, RouteResult};
use crate::cxt::{RouteCxt, SideEffectError};
use crate::effect::RouteEffect;
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Common surface of main and sub engines.
#[async_trait]
pub trait Engine<S>: Send + Sync
where
    S: Clone + Send + 'static,
{
    fn cxt(&self) -> Arc<RouteCxt>;

    /// Evaluates one effect under the engine's exclusive slot and resolves
    /// with its result once the new state is installed.
    async fn run<R>(&self, effect: RouteEffect<S, R>) -> RouteResult<R>
    where
        R: Send + 'static;

    /// Fire-and-forget variant of [`run`](Engine::run) for callers outside
    /// an async context; the result is handed to `callback` when done.
    fn run_callback<R, F>(self: Arc<Self>, effect: RouteEffect<S, R>, callback: F)
    where
        R: Send + 'static,
        F: FnOnce(RouteResult<R>) + Send + 'static,
        Self: Sized + 'static,
    {
        tokio::spawn(async move {
            let result = self.run(effect).await;
            callback(result);
        });
    }

    /// Enqueues work on the context's ordered side-effect queue.
    fn submit_side_effect<F>(&self, work: F)
    where
        F: Future<Output = Result<(), SideEffectError>> + Send + 'static,
        Self: Sized,
    {
        self.cxt().submit_side_effect(work);
    }
}

/// The single writer of a canonical state value.
pub struct MainEngine<S> {
    state: Mutex<S>,
    cxt: Arc<RouteCxt>,
}

impl<S> MainEngine<S>
where
    S: Clone + Send + 'static,
{
    pub fn new(initial: S, cxt: Arc<RouteCxt>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            cxt,
        })
    }

    /// Convenience constructor creating a fresh context along the way.
    /// Must be called from within a tokio runtime.
    pub fn create(initial: S) -> Arc<Self> {
        Self::new(initial, RouteCxt::new())
    }

    /// A view of this engine focused on a sub-state.
    pub fn derive<S2>(self: &Arc<Self>, lens: Lens<S, S2>) -> SubEngine<S, S2>
    where
        S2: Clone + Send + 'static,
    {
        SubEngine {
            root: Arc::clone(self),
            lens,
        }
    }
}

#[async_trait]
impl<S> Engine<S> for MainEngine<S>
where
    S: Clone + Send + 'static,
{
    fn cxt(&self) -> Arc<RouteCxt> {
        Arc::clone(&self.cxt)
    }

    async fn run<R>(&self, effect: RouteEffect<S, R>) -> RouteResult<R>
    where
        R: Send + 'static,
    {
        // The tokio mutex queues waiters fairly, giving a strict arrival
        // order over state mutations.
        let mut slot = self.state.lock().await;
        debug!(target: "switchyard::engine", "exclusive slot acquired");
        let before = slot.clone();
        let evaluation =
            AssertUnwindSafe(effect.run(before.clone(), Arc::clone(&self.cxt)))
                .catch_unwind()
                .await;
        let (next, result) = match evaluation {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    target: "switchyard::engine",
                    "effect panicked ({}); keeping the last committed state",
                    panic_message(&*panic)
                );
                (
                    before,
                    RouteResult::Failure(RouteFailure::desynchronization(
                        "effect raised an uncontrolled fault; \
                         canonical state kept at its last committed value",
                    )),
                )
            }
        };
        *slot = next;
        debug!(target: "switchyard::engine", "state installed, slot released");
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// A lens-focused view onto a [`MainEngine`]. Cloning is cheap; all clones
/// share the root's slot and state.
pub struct SubEngine<Root, S> {
    root: Arc<MainEngine<Root>>,
    lens: Lens<Root, S>,
}

impl<Root, S> Clone for SubEngine<Root, S> {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            lens: self.lens.clone(),
        }
    }
}

impl<Root, S> SubEngine<Root, S>
where
    Root: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    /// Focuses further down; the lenses compose.
    pub fn derive<S2>(&self, lens: Lens<S, S2>) -> SubEngine<Root, S2>
    where
        S2: Clone + Send + 'static,
    {
        SubEngine {
            root: Arc::clone(&self.root),
            lens: self.lens.compose(&lens),
        }
    }
}

#[async_trait]
impl<Root, S> Engine<S> for SubEngine<Root, S>
where
    Root: Clone + Send + 'static,
    S: Clone + Send + 'static,
{
    fn cxt(&self) -> Arc<RouteCxt> {
        self.root.cxt()
    }

    async fn run<R>(&self, effect: RouteEffect<S, R>) -> RouteResult<R>
    where
        R: Send + 'static,
    {
        self.root.run(effect.map_state(self.lens.clone())).await
    }
}
