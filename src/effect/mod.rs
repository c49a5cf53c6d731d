//! The composable effect type.
//!
//! A [`RouteEffect<S, R>`] is an opaque asynchronous function from a state
//! and a [`RouteCxt`] to a new state paired with a [`RouteResult<R>`]. It is
//! a pure value: building one performs nothing, and the same effect can be
//! evaluated any number of times. Two invariants hold for every effect:
//!
//! - an effect always returns a state, even when it fails; partial
//!   mutations already applied are preserved;
//! - a `Failure` result short-circuits [`and_then`](RouteEffect::and_then)
//!   chains but is never used for non-local control transfer.
//!
//! Effects over nested state are addressed through [`Lens`] focusing
//! ([`map_state`](RouteEffect::map_state)), so a step mutating a deep
//! sub-state needs no awareness of its ancestors.

use crate::core::{Lens, RouteFailure, RouteResult};
use crate::cxt::RouteCxt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

type EffectFn<S, R> = dyn Fn(S, Arc<RouteCxt>) -> BoxFuture<'static, (S, RouteResult<R>)> + Send + Sync;

/// A state- and context-dependent asynchronous action with a typed result.
pub struct RouteEffect<S, R> {
    run: Arc<EffectFn<S, R>>,
}

impl<S, R> Clone for RouteEffect<S, R> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<S, R> RouteEffect<S, R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    /// Wraps a raw effect function.
    pub fn new(
        f: impl Fn(S, Arc<RouteCxt>) -> BoxFuture<'static, (S, RouteResult<R>)>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self { run: Arc::new(f) }
    }

    /// Wraps a synchronous state transformer.
    pub fn from_fn(
        f: impl Fn(S, &RouteCxt) -> (S, RouteResult<R>) + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        Self::new(move |state, cxt| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(state, &cxt) })
        })
    }

    /// Evaluates the effect. Callers other than tests go through an engine;
    /// direct evaluation provides no serialization guarantee.
    pub fn run(&self, state: S, cxt: Arc<RouteCxt>) -> BoxFuture<'static, (S, RouteResult<R>)> {
        (self.run)(state, cxt)
    }

    /// The central sequencing primitive: run `self`; on success feed its
    /// value into `f` and run the produced effect against the resulting
    /// state. On failure `f` is never invoked and `self`'s resulting state
    /// and failure are returned as-is.
    pub fn and_then<R2, F>(&self, f: F) -> RouteEffect<S, R2>
    where
        R2: Send + 'static,
        F: Fn(R) -> RouteEffect<S, R2> + Send + Sync + 'static,
    {
        let first = self.clone();
        let f = Arc::new(f);
        RouteEffect::new(move |state, cxt| {
            let first = first.clone();
            let f = Arc::clone(&f);
            Box::pin(async move {
                let (state, result) = first.run(state, cxt.clone()).await;
                match result {
                    RouteResult::Success(value) => f(value).run(state, cxt).await,
                    RouteResult::Failure(failure) => (state, RouteResult::Failure(failure)),
                }
            })
        })
    }

    /// Escape hatch: run `self`, then hand the resulting state, context and
    /// success value to an arbitrary asynchronous continuation.
    pub fn transform<R2, F, Fut>(&self, f: F) -> RouteEffect<S, R2>
    where
        R2: Send + 'static,
        F: Fn(S, Arc<RouteCxt>, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (S, RouteResult<R2>)> + Send + 'static,
    {
        let first = self.clone();
        let f = Arc::new(f);
        RouteEffect::new(move |state, cxt| {
            let first = first.clone();
            let f = Arc::clone(&f);
            Box::pin(async move {
                let (state, result) = first.run(state, cxt.clone()).await;
                match result {
                    RouteResult::Success(value) => f(state, cxt, value).await,
                    RouteResult::Failure(failure) => (state, RouteResult::Failure(failure)),
                }
            })
        })
    }

    /// Post-processes the success value.
    pub fn map<R2>(&self, f: impl Fn(R) -> R2 + Send + Sync + 'static) -> RouteEffect<S, R2>
    where
        R2: Send + 'static,
    {
        let f = Arc::new(f);
        self.transform(move |state, _cxt, value| {
            let f = Arc::clone(&f);
            async move { (state, RouteResult::Success(f(value))) }
        })
    }

    /// Narrows the success value; a miss becomes a typed precondition
    /// failure naming `what`.
    pub fn narrow<R2>(
        &self,
        what: impl Into<String>,
        f: impl Fn(R) -> Option<R2> + Send + Sync + 'static,
    ) -> RouteEffect<S, R2>
    where
        R2: Send + 'static,
    {
        let what = what.into();
        let f = Arc::new(f);
        self.transform(move |state, _cxt, value| {
            let what = what.clone();
            let f = Arc::clone(&f);
            async move {
                let result = match f(value) {
                    Some(narrowed) => RouteResult::Success(narrowed),
                    None => RouteResult::Failure(RouteFailure::precondition(format!(
                        "narrowing failed: value is not a {what}"
                    ))),
                };
                (state, result)
            }
        })
    }

    /// Runs this effect against an inner state reached through `lens`,
    /// splicing the resulting inner state back into the outer one. The rest
    /// of the outer state is untouched.
    pub fn map_state<S2>(&self, lens: Lens<S2, S>) -> RouteEffect<S2, R>
    where
        S2: Send + 'static,
    {
        let inner = self.clone();
        RouteEffect::new(move |outer, cxt| {
            let inner = inner.clone();
            let lens = lens.clone();
            Box::pin(async move {
                let focused = lens.get(&outer);
                let (focused, result) = inner.run(focused, cxt).await;
                (lens.set(outer, focused), result)
            })
        })
    }

    /// Like [`map_state`](Self::map_state) for an optional focus: an absent
    /// inner state is a precondition failure and the outer state is
    /// returned unchanged.
    pub fn map_state_option<S2>(&self, lens: Lens<S2, Option<S>>) -> RouteEffect<S2, R>
    where
        S2: Send + 'static,
    {
        let inner = self.clone();
        RouteEffect::new(move |outer, cxt| {
            let inner = inner.clone();
            let lens = lens.clone();
            Box::pin(async move {
                match lens.get(&outer) {
                    Some(focused) => {
                        let (focused, result) = inner.run(focused, cxt).await;
                        (lens.set(outer, Some(focused)), result)
                    }
                    None => (
                        outer,
                        RouteResult::Failure(RouteFailure::precondition(
                            "focus state is absent: lens produced no inner state",
                        )),
                    ),
                }
            })
        })
    }

    /// Runs `second` on the state produced by `self`, pairing the results.
    /// A failure of `self` short-circuits; `second` then never runs.
    pub fn zip_with<R2>(&self, second: RouteEffect<S, R2>) -> RouteEffect<S, (R, R2)>
    where
        R2: Send + 'static,
    {
        let first = self.clone();
        RouteEffect::new(move |state, cxt| {
            let first = first.clone();
            let second = second.clone();
            Box::pin(async move {
                let (state, result) = first.run(state, cxt.clone()).await;
                match result {
                    RouteResult::Success(a) => {
                        let (state, result) = second.run(state, cxt).await;
                        (state, result.map(|b| (a, b)))
                    }
                    RouteResult::Failure(failure) => (state, RouteResult::Failure(failure)),
                }
            })
        })
    }
}

impl<S, R> RouteEffect<S, Option<R>>
where
    S: Send + 'static,
    R: Send + 'static,
{
    /// Converts a `None` success into a precondition failure naming `what`.
    pub fn some_or_fail(&self, what: impl Into<String>) -> RouteEffect<S, R> {
        let what = what.into();
        self.transform(move |state, _cxt, value| {
            let what = what.clone();
            async move {
                let result = match value {
                    Some(value) => RouteResult::Success(value),
                    None => RouteResult::Failure(RouteFailure::precondition(format!(
                        "{what}: result must not be absent"
                    ))),
                };
                (state, result)
            }
        })
    }
}

impl<S, S2> RouteEffect<S, Lens<S, S2>>
where
    S: Send + 'static,
    S2: Send + 'static,
{
    /// Focus through a lens produced by this effect: run `inner` against the
    /// focused state and splice its result back into the outer state.
    pub fn compose_state<R>(&self, inner: RouteEffect<S2, R>) -> RouteEffect<S, R>
    where
        R: Send + 'static,
    {
        let lens_effect = self.clone();
        RouteEffect::new(move |state, cxt| {
            let lens_effect = lens_effect.clone();
            let inner = inner.clone();
            Box::pin(async move {
                let (state, lens_result) = lens_effect.run(state, cxt.clone()).await;
                match lens_result {
                    RouteResult::Success(lens) => {
                        let focused = lens.get(&state);
                        let (focused, result) = inner.run(focused, cxt).await;
                        (lens.set(state, focused), result)
                    }
                    RouteResult::Failure(failure) => (state, RouteResult::Failure(failure)),
                }
            })
        })
    }
}

/// No-op effect: succeeds with unit, state unchanged.
pub fn unit<S: Send + 'static>() -> RouteEffect<S, ()> {
    RouteEffect::from_fn(|state, _| (state, RouteResult::Success(())))
}

/// Succeeds with a snapshot of the current state, state unchanged.
pub fn get_state<S: Clone + Send + 'static>() -> RouteEffect<S, S> {
    RouteEffect::from_fn(|state: S, _| {
        let snapshot = state.clone();
        (state, RouteResult::Success(snapshot))
    })
}

/// An effect that always fails, state unchanged.
pub fn fail<S: Send + 'static, R: Send + 'static>(failure: RouteFailure) -> RouteEffect<S, R> {
    RouteEffect::from_fn(move |state, _| (state, RouteResult::Failure(failure.clone())))
}

/// Lifts an externally supplied asynchronous computation into an effect;
/// the state passes through unchanged. `f` is a factory so the effect stays
/// re-runnable.
pub fn from_async<S, T, F, Fut>(f: F) -> RouteEffect<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let f = Arc::new(f);
    RouteEffect::new(move |state, _cxt| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let value = f().await;
            (state, RouteResult::Success(value))
        })
    })
}

/// Runs two effects over independent sub-states, combining results
/// pairwise. Each branch always runs to completion regardless of the
/// other's outcome; the pair fails if either branch failed.
pub fn zip<S1, S2, R1, R2>(
    first: &RouteEffect<S1, R1>,
    second: &RouteEffect<S2, R2>,
) -> RouteEffect<(S1, S2), (R1, R2)>
where
    S1: Send + 'static,
    S2: Send + 'static,
    R1: Send + 'static,
    R2: Send + 'static,
{
    let first = first.clone();
    let second = second.clone();
    RouteEffect::new(move |(s1, s2), cxt| {
        let first = first.clone();
        let second = second.clone();
        Box::pin(async move {
            let (s1, r1) = first.run(s1, cxt.clone()).await;
            let (s2, r2) = second.run(s2, cxt).await;
            ((s1, s2), r1.and_then(|a| r2.map(|b| (a, b))))
        })
    })
}
