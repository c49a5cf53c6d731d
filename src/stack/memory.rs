//! In-memory display layer for headless hosts and tests.

use super::{NavUnit, TransactionBackend, TxnOp, UnitController, UnitHandle};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A [`TransactionBackend`] that records every committed batch and
/// acknowledges immediately.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    commits: Mutex<Vec<Vec<TxnOp>>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commit_count(&self) -> usize {
        relock(&self.commits).len()
    }

    pub fn committed_ops(&self) -> Vec<Vec<TxnOp>> {
        relock(&self.commits).clone()
    }
}

impl TransactionBackend for MemoryBackend {
    fn apply(&self, ops: Vec<TxnOp>) -> BoxFuture<'static, ()> {
        relock(&self.commits).push(ops);
        Box::pin(async {})
    }
}

/// A [`NavUnit`] with no display attached. Records every relayed result it
/// receives.
#[derive(Debug)]
pub struct MemoryUnit {
    name: String,
    controller: UnitController,
    received: Mutex<Vec<(i32, i32, Option<Value>)>>,
}

impl MemoryUnit {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            controller: UnitController::new(),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Results relayed to this unit, in delivery order, as
    /// `(request_code, result_code, payload)`.
    pub fn received_results(&self) -> Vec<(i32, i32, Option<Value>)> {
        relock(&self.received).clone()
    }

    /// A registry constructor producing units named `name`, ignoring args.
    pub fn constructor(
        name: impl Into<String>,
    ) -> impl Fn(&Value) -> Result<UnitHandle, super::ConstructError> + Send + Sync + 'static {
        let name = name.into();
        move |_args| Ok(Self::new(name.clone()))
    }
}

impl NavUnit for MemoryUnit {
    fn controller(&self) -> &UnitController {
        &self.controller
    }

    fn on_unit_result(&self, request_code: i32, result_code: i32, payload: Option<&Value>) {
        relock(&self.received).push((request_code, result_code, payload.cloned()));
    }
}
