//! Lenses: pure get/set pairs focusing an outer state onto an inner state.
//!
//! Every piece of navigation state in this crate is an immutable value;
//! effects address nested state (a host's stack inside the container list,
//! the stack inside a host binding) by composing lenses instead of holding
//! references into ancestors.

use std::sync::Arc;

/// A get/set pair from an outer state `S` to an inner state `A`.
///
/// `get` clones the focused value out; `set` consumes the outer state and
/// splices a new inner value in. Composition is plain function composition,
/// no reflection involved.
///
/// # Example
///
/// ```rust
/// use switchyard::core::Lens;
///
/// #[derive(Clone, PartialEq, Debug)]
/// struct Outer {
///     count: u32,
///     label: String,
/// }
///
/// let count = Lens::new(|o: &Outer| o.count, |mut o: Outer, c| {
///     o.count = c;
///     o
/// });
///
/// let outer = Outer { count: 1, label: "a".into() };
/// assert_eq!(count.get(&outer), 1);
/// let outer = count.set(outer, 5);
/// assert_eq!(outer.count, 5);
/// assert_eq!(outer.label, "a");
/// ```
pub struct Lens<S, A> {
    get: Arc<dyn Fn(&S) -> A + Send + Sync>,
    set: Arc<dyn Fn(S, A) -> S + Send + Sync>,
}

impl<S, A> Clone for Lens<S, A> {
    fn clone(&self) -> Self {
        Self {
            get: Arc::clone(&self.get),
            set: Arc::clone(&self.set),
        }
    }
}

impl<S, A> Lens<S, A>
where
    S: 'static,
    A: 'static,
{
    pub fn new(
        get: impl Fn(&S) -> A + Send + Sync + 'static,
        set: impl Fn(S, A) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    pub fn get(&self, outer: &S) -> A {
        (self.get)(outer)
    }

    pub fn set(&self, outer: S, inner: A) -> S {
        (self.set)(outer, inner)
    }

    pub fn modify(&self, outer: S, f: impl FnOnce(A) -> A) -> S {
        let inner = self.get(&outer);
        self.set(outer, f(inner))
    }

    /// Composes with a lens focusing deeper: `S -> A -> B` becomes `S -> B`.
    pub fn compose<B: 'static>(&self, next: &Lens<A, B>) -> Lens<S, B> {
        let outer = self.clone();
        let outer_for_set = self.clone();
        let next_get = next.clone();
        let next_set = next.clone();
        Lens::new(
            move |s: &S| next_get.get(&outer.get(s)),
            move |s: S, b: B| {
                let a = outer_for_set.get(&s);
                let a = next_set.set(a, b);
                outer_for_set.set(s, a)
            },
        )
    }
}

impl<S> Lens<S, S>
where
    S: Clone + 'static,
{
    /// The identity lens; the inner state is the outer state.
    pub fn identity() -> Self {
        Lens::new(|s: &S| s.clone(), |_, s| s)
    }
}

impl<S, A> Lens<S, Option<A>>
where
    S: 'static,
    A: 'static,
{
    /// Composes through an optional focus: an absent inner state makes `get`
    /// yield `None` and `set` leave the outer state untouched.
    pub fn compose_option<B: 'static>(&self, next: &Lens<A, B>) -> Lens<S, Option<B>> {
        let outer = self.clone();
        let outer_for_set = self.clone();
        let next_get = next.clone();
        let next_set = next.clone();
        Lens::new(
            move |s: &S| outer.get(s).map(|a| next_get.get(&a)),
            move |s: S, b: Option<B>| match (outer_for_set.get(&s), b) {
                (Some(a), Some(b)) => {
                    let a = next_set.set(a, b);
                    outer_for_set.set(s, Some(a))
                }
                _ => s,
            },
        )
    }
}
