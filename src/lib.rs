//! Switchyard: composable navigation effects with a serialized state engine.
//!
//! Navigation logic is written as values of [`RouteEffect`]: asynchronous
//! functions from a state to a new state plus a typed result, composed with
//! `and_then` and focused onto sub-states through [`Lens`]es. A
//! [`MainEngine`] evaluates effects one at a time against the canonical
//! state, so concurrent callers never observe or produce interleaved
//! mutations. On top of this sit the container tracker
//! ([`containers`](crate::containers)) and the hierarchical navigation
//! stacks ([`stack`](crate::stack)).
//!
//! # Core Concepts
//!
//! - **Effect**: a re-runnable `RouteEffect<S, R>` value; building one
//!   performs nothing
//! - **Engine**: the single writer of a state, serializing all effect runs
//! - **Lens**: bidirectional focus used to run effects over nested state
//! - **Stack**: Single (one LIFO history) or Table (parallel tagged
//!   histories) navigation state per hosting container
//!
//! # Example
//!
//! ```rust
//! use switchyard::{Engine, MainEngine, RouteEffect, RouteResult};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = MainEngine::create(Vec::<String>::new());
//! let visit = RouteEffect::from_fn(|mut trail: Vec<String>, _cxt| {
//!     trail.push("settings".into());
//!     let depth = trail.len();
//!     (trail, RouteResult::Success(depth))
//! });
//! let result = engine.run(visit).await;
//! assert_eq!(result, RouteResult::Success(1));
//! # }
//! ```

pub mod containers;
pub mod core;
pub mod cxt;
pub mod effect;
pub mod engine;
pub mod stack;

// Re-export commonly used types
pub use containers::{
    ContainerHandle, ContainerRecord, ContainerSpec, ContainersState, LifecycleEvent, NavIdentity,
    SavedState,
};
pub use self::core::{FailureKind, Lens, RouteFailure, RouteResult};
pub use cxt::RouteCxt;
pub use effect::RouteEffect;
pub use engine::{Engine, MainEngine, SubEngine};
pub use stack::{
    FinishResult, NavStack, RegionId, StackHost, StackHostState, StackItem, UnitBuilder,
    UnitRegistry,
};
