//! Success/failure union threaded through every effect step.
//!
//! `RouteResult` is deliberately not `std::result::Result`: a failed step
//! still produces a state, and failures are plain data carried alongside it,
//! never unwound through the call stack.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Shared, cloneable cause attached to a failure.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Classification of a [`RouteFailure`].
///
/// Mirrors the failure taxonomy used across the crate:
///
/// - `Construction`: a unit or container could not be built
/// - `Resolution`: a target, tag, or container could not be found
/// - `Precondition`: no top container, absent focus state, failed narrowing
/// - `Desynchronization`: an uncontrolled fault was caught at the engine
///   boundary and the canonical state was forcibly kept at its last
///   committed value
/// - `Other`: free-form failures raised by caller-supplied effects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Construction,
    Resolution,
    Precondition,
    Desynchronization,
    Other,
}

impl FailureKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Construction => "construction",
            Self::Resolution => "resolution",
            Self::Precondition => "precondition",
            Self::Desynchronization => "desynchronization",
            Self::Other => "other",
        }
    }
}

/// A failed effect step: classification, human-readable message, and an
/// optional underlying cause.
///
/// Failures are values. They short-circuit sequencing (see
/// [`RouteEffect::and_then`](crate::effect::RouteEffect::and_then)) but never
/// terminate the process.
#[derive(Clone, Debug)]
pub struct RouteFailure {
    pub kind: FailureKind,
    pub message: String,
    pub cause: Option<Cause>,
}

impl RouteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        kind: FailureKind,
        message: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn construction(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Construction, message)
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Resolution, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Precondition, message)
    }

    pub fn desynchronization(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Desynchronization, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

// Causes are compared by presence only; two failures with the same kind and
// message are the same failure for branching purposes.
impl PartialEq for RouteFailure {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.cause.is_some() == other.cause.is_some()
    }
}

impl fmt::Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.name(), self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}

impl StdError for RouteFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn StdError + 'static))
    }
}

/// Result of an effect step: either a success value or a [`RouteFailure`].
///
/// # Example
///
/// ```rust
/// use switchyard::core::{FailureKind, RouteFailure, RouteResult};
///
/// let ok: RouteResult<i32> = RouteResult::Success(2);
/// let doubled = ok.map(|n| n * 2);
/// assert_eq!(doubled, RouteResult::Success(4));
///
/// let failed: RouteResult<i32> =
///     RouteResult::Failure(RouteFailure::resolution("target not found"));
/// // Failure short-circuits: the closure is never invoked.
/// let chained = failed.and_then(|n| RouteResult::Success(n + 1));
/// assert!(chained.is_failure());
/// assert_eq!(chained.failure().unwrap().kind, FailureKind::Resolution);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum RouteResult<T> {
    Success(T),
    Failure(RouteFailure),
}

impl<T> RouteResult<T> {
    pub fn success(value: T) -> Self {
        Self::Success(value)
    }

    pub fn fail(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(RouteFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// The success value, discarding any failure.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&RouteFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RouteResult<U> {
        match self {
            Self::Success(value) => RouteResult::Success(f(value)),
            Self::Failure(failure) => RouteResult::Failure(failure),
        }
    }

    /// Chains a dependent computation; a failure passes through untouched.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> RouteResult<U>) -> RouteResult<U> {
        match self {
            Self::Success(value) => f(value),
            Self::Failure(failure) => RouteResult::Failure(failure),
        }
    }

    pub fn into_result(self) -> Result<T, RouteFailure> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(failure) => Err(failure),
        }
    }
}

impl<T> From<Result<T, RouteFailure>> for RouteResult<T> {
    fn from(result: Result<T, RouteFailure>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(failure) => Self::Failure(failure),
        }
    }
}
