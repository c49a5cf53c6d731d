//! Core value types: the success/failure union and lens plumbing.
//!
//! Everything in this module is a pure value with no effects attached,
//! following the "pure core, imperative shell" philosophy; the effect
//! machinery in [`crate::effect`] threads these values through
//! asynchronous steps.

mod lens;
mod result;

pub use lens::Lens;
pub use result::{Cause, FailureKind, RouteFailure, RouteResult};
