//! Top-level container tracking.
//!
//! A container is a top-level navigational unit hosting visual sub-units.
//! The canonical root state is [`ContainersState`]: an ordered list of
//! [`ContainerRecord`]s, oldest first, last entry on top. Containers are
//! tracked by [`NavIdentity`] rather than live-reference identity so that
//! state survives container recreation: the identity is written into the
//! save-state payload and read back on the next created event.

use crate::core::{Lens, RouteFailure, RouteResult};
use crate::cxt::RouteCxt;
use crate::effect::RouteEffect;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Key under which a record's identity is persisted into saved state.
pub const SAVED_IDENTITY_KEY: &str = "switchyard__identity";

/// Process-lifetime-durable opaque token identifying a container or unit
/// independent of its live reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct NavIdentity(u64);

impl NavIdentity {
    /// Allocates a fresh identity from the process-wide counter.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NavIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A live top-level container supplied by platform glue.
pub trait Container: Send + Sync + fmt::Debug {
    /// Declared kind, checked against the kind a [`ContainerSpec`] asked for.
    fn kind(&self) -> &str;

    /// Asks the platform to close this container. The corresponding
    /// destroyed event arrives later through the lifecycle stream.
    fn request_close(&self);
}

pub type ContainerHandle = Arc<dyn Container>;

/// Sidecar value attached to a record; downcast by the owning module.
pub type Extra = Arc<dyn Any + Send + Sync>;

/// Serializable save-state payload, the write-back target of a save-state
/// lifecycle event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedState {
    values: serde_json::Map<String, Value>,
}

impl SavedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn put_identity(&mut self, identity: NavIdentity) {
        self.put(SAVED_IDENTITY_KEY, Value::from(identity.raw()));
    }

    pub fn identity(&self) -> Option<NavIdentity> {
        self.get(SAVED_IDENTITY_KEY)
            .and_then(Value::as_u64)
            .map(NavIdentity)
    }
}

/// Ordered per-container lifecycle events, fed in by platform glue through
/// [`RouteCxt::publish`].
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    Created {
        container: ContainerHandle,
        saved: Option<SavedState>,
    },
    Started(ContainerHandle),
    Resumed(ContainerHandle),
    Paused(ContainerHandle),
    Stopped(ContainerHandle),
    SaveState {
        container: ContainerHandle,
        out: Arc<Mutex<SavedState>>,
    },
    Destroyed(ContainerHandle),
    ResultDelivered {
        identity: NavIdentity,
        request_code: i32,
        result_code: i32,
        payload: Option<Value>,
    },
}

/// Tracking record for one live container.
#[derive(Clone)]
pub struct ContainerRecord {
    pub identity: NavIdentity,
    pub container: ContainerHandle,
    pub extras: HashMap<String, Extra>,
    /// Set once the container's identity has been written to saved state;
    /// such a record survives the destroy event and waits for the matching
    /// created event to re-associate.
    pub awaiting_restore: bool,
}

impl ContainerRecord {
    pub fn new(identity: NavIdentity, container: ContainerHandle) -> Self {
        Self {
            identity,
            container,
            extras: HashMap::new(),
            awaiting_restore: false,
        }
    }

    pub fn extra(&self, key: &str) -> Option<&Extra> {
        self.extras.get(key)
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Extra) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

impl fmt::Debug for ContainerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRecord")
            .field("identity", &self.identity)
            .field("container", &self.container)
            .field("extras", &self.extras.keys().collect::<Vec<_>>())
            .field("awaiting_restore", &self.awaiting_restore)
            .finish()
    }
}

/// The canonical root state: every tracked container, oldest first.
#[derive(Clone, Debug, Default)]
pub struct ContainersState {
    pub records: Vec<ContainerRecord>,
}

impl ContainersState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top(&self) -> Option<&ContainerRecord> {
        self.records.last()
    }

    pub fn find_by_identity(&self, identity: NavIdentity) -> Option<&ContainerRecord> {
        self.records.iter().find(|r| r.identity == identity)
    }

    pub fn find_by_handle(&self, handle: &ContainerHandle) -> Option<&ContainerRecord> {
        self.records
            .iter()
            .find(|r| Arc::ptr_eq(&r.container, handle))
    }

    fn replace(mut self, identity: NavIdentity, record: ContainerRecord) -> Self {
        for slot in &mut self.records {
            if slot.identity == identity {
                *slot = record;
                break;
            }
        }
        self
    }
}

/// Folds one lifecycle event into the container list.
///
/// - `Created` appends a fresh record, or re-associates an existing record
///   when the saved state carries its identity (recreation).
/// - `SaveState` writes the record's identity into the payload and marks
///   the record as surviving the upcoming destroy.
/// - `Destroyed` removes the record unless it awaits restoration.
/// - All other events leave the state unchanged.
pub fn lifecycle_effect(event: LifecycleEvent) -> RouteEffect<ContainersState, ()> {
    RouteEffect::from_fn(move |state: ContainersState, _cxt| {
        let state = fold_event(state, &event);
        (state, RouteResult::Success(()))
    })
}

fn fold_event(mut state: ContainersState, event: &LifecycleEvent) -> ContainersState {
    match event {
        LifecycleEvent::Created { container, saved } => {
            let saved_identity = saved.as_ref().and_then(SavedState::identity);
            if let Some(identity) = saved_identity {
                if let Some(existing) = state.find_by_identity(identity) {
                    debug!(
                        target: "switchyard::containers",
                        "re-associating container {identity} with a new live reference"
                    );
                    let mut record = existing.clone();
                    record.container = Arc::clone(container);
                    record.awaiting_restore = false;
                    return state.replace(identity, record);
                }
            }
            if state.find_by_handle(container).is_none() {
                state
                    .records
                    .push(ContainerRecord::new(NavIdentity::next(), Arc::clone(container)));
            }
            state
        }
        LifecycleEvent::SaveState { container, out } => {
            if let Some(record) = state.find_by_handle(container) {
                let identity = record.identity;
                if let Ok(mut payload) = out.lock() {
                    payload.put_identity(identity);
                }
                let mut record = record.clone();
                record.awaiting_restore = true;
                return state.replace(identity, record);
            }
            state
        }
        LifecycleEvent::Destroyed(container) => {
            state.records.retain(|record| {
                !Arc::ptr_eq(&record.container, container) || record.awaiting_restore
            });
            state
        }
        _ => state,
    }
}

/// Recipe for bringing a new container on screen: the declared kind plus a
/// launch action that asks the platform to create it.
#[derive(Clone)]
pub struct ContainerSpec {
    kind: String,
    launch: Arc<dyn Fn(&RouteCxt) + Send + Sync>,
}

impl ContainerSpec {
    pub fn new(kind: impl Into<String>, launch: impl Fn(&RouteCxt) + Send + Sync + 'static) -> Self {
        Self {
            kind: kind.into(),
            launch: Arc::new(launch),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Launches a container and waits for its created event.
///
/// The new record is appended (unless the lifecycle fold already appended
/// it) even when the created container turns out to be of the wrong kind;
/// in that case the result is a construction failure but the stray
/// container stays tracked.
pub fn push_container(spec: ContainerSpec) -> RouteEffect<ContainersState, ContainerHandle> {
    RouteEffect::new(move |mut state: ContainersState, cxt| {
        let spec = spec.clone();
        Box::pin(async move {
            // Subscribe before launching so the created event cannot slip by.
            let mut events = cxt.subscribe();
            (spec.launch)(&cxt);
            let container = loop {
                use tokio::sync::broadcast::error::RecvError;
                match events.recv().await {
                    Ok(LifecycleEvent::Created { container, .. }) => break container,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        return (
                            state,
                            RouteResult::Failure(RouteFailure::precondition(
                                "lifecycle event stream closed while waiting for creation",
                            )),
                        );
                    }
                }
            };
            if state.find_by_handle(&container).is_none() {
                state
                    .records
                    .push(ContainerRecord::new(NavIdentity::next(), Arc::clone(&container)));
            }
            let result = if container.kind() == spec.kind() {
                RouteResult::Success(container)
            } else {
                RouteResult::Failure(RouteFailure::construction(format!(
                    "launch succeeded but created container has the wrong kind: \
                     wanted '{}', got '{}'",
                    spec.kind(),
                    container.kind()
                )))
            };
            (state, result)
        })
    })
}

/// Closes the topmost container and drops its record. Fails when the list
/// is empty.
pub fn finish_top() -> RouteEffect<ContainersState, ()> {
    RouteEffect::from_fn(|mut state: ContainersState, _cxt| match state.records.pop() {
        Some(record) => {
            record.container.request_close();
            (state, RouteResult::Success(()))
        }
        None => (
            state,
            RouteResult::Failure(RouteFailure::precondition(
                "finish_top failed: have no top container",
            )),
        ),
    })
}

/// Closes the container tracked under `identity` and drops its record.
pub fn finish_container(identity: NavIdentity) -> RouteEffect<ContainersState, ()> {
    RouteEffect::from_fn(move |mut state: ContainersState, _cxt| {
        match state.find_by_identity(identity) {
            Some(record) => {
                record.container.request_close();
                state.records.retain(|r| r.identity != identity);
                (state, RouteResult::Success(()))
            }
            None => {
                let listing = state
                    .records
                    .iter()
                    .map(|r| r.identity.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                (
                    state,
                    RouteResult::Failure(RouteFailure::resolution(format!(
                        "finish_container failed: target {identity} not found, tracked: [{listing}]"
                    ))),
                )
            }
        }
    })
}

/// Looks a live handle up in the record list.
pub fn find_container(handle: ContainerHandle) -> RouteEffect<ContainersState, Option<ContainerRecord>> {
    RouteEffect::from_fn(move |state: ContainersState, _cxt| {
        let found = state.find_by_handle(&handle).cloned();
        (state, RouteResult::Success(found))
    })
}

/// Lens from the root state to the record tracked under `identity`.
pub fn record_lens(identity: NavIdentity) -> Lens<ContainersState, Option<ContainerRecord>> {
    Lens::new(
        move |state: &ContainersState| state.find_by_identity(identity).cloned(),
        move |state: ContainersState, record| match record {
            Some(record) => state.replace(identity, record),
            None => state,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureKind;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[derive(Debug)]
    pub(crate) struct FakeContainer {
        kind: &'static str,
        closed: AtomicBool,
    }

    impl FakeContainer {
        pub(crate) fn new(kind: &'static str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                closed: AtomicBool::new(false),
            })
        }

        fn closed(&self) -> bool {
            self.closed.load(AtomicOrdering::SeqCst)
        }
    }

    impl Container for FakeContainer {
        fn kind(&self) -> &str {
            self.kind
        }

        fn request_close(&self) {
            self.closed.store(true, AtomicOrdering::SeqCst);
        }
    }

    async fn fold(state: ContainersState, event: LifecycleEvent) -> ContainersState {
        let cxt = RouteCxt::new();
        let (state, result) = lifecycle_effect(event).run(state, cxt).await;
        assert!(result.is_success());
        state
    }

    #[tokio::test]
    async fn created_appends_and_destroyed_removes() {
        let container = FakeContainer::new("screen");
        let handle: ContainerHandle = container.clone();
        let state = fold(
            ContainersState::new(),
            LifecycleEvent::Created {
                container: Arc::clone(&handle),
                saved: None,
            },
        )
        .await;
        assert_eq!(state.records.len(), 1);

        // A duplicate created event for the same live reference is ignored.
        let state = fold(
            state,
            LifecycleEvent::Created {
                container: Arc::clone(&handle),
                saved: None,
            },
        )
        .await;
        assert_eq!(state.records.len(), 1);

        let state = fold(state, LifecycleEvent::Destroyed(handle)).await;
        assert!(state.records.is_empty());
    }

    #[tokio::test]
    async fn identity_survives_destroy_and_recreate() {
        let first: ContainerHandle = FakeContainer::new("screen");
        let state = fold(
            ContainersState::new(),
            LifecycleEvent::Created {
                container: Arc::clone(&first),
                saved: None,
            },
        )
        .await;
        let identity = state.records[0].identity;

        // Platform asks the container to save state before destroying it.
        let out = Arc::new(Mutex::new(SavedState::new()));
        let state = fold(
            state,
            LifecycleEvent::SaveState {
                container: Arc::clone(&first),
                out: Arc::clone(&out),
            },
        )
        .await;
        let saved = out.lock().unwrap().clone();
        assert_eq!(saved.identity(), Some(identity));

        let state = fold(state, LifecycleEvent::Destroyed(Arc::clone(&first))).await;
        // The record waits for the matching created event.
        assert_eq!(state.records.len(), 1);

        let second: ContainerHandle = FakeContainer::new("screen");
        let state = fold(
            state,
            LifecycleEvent::Created {
                container: Arc::clone(&second),
                saved: Some(saved),
            },
        )
        .await;
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records[0].identity, identity);
        assert!(Arc::ptr_eq(&state.records[0].container, &second));
        assert!(!state.records[0].awaiting_restore);
    }

    #[tokio::test]
    async fn push_container_waits_for_creation_and_checks_kind() {
        let cxt = RouteCxt::new();
        let container: ContainerHandle = FakeContainer::new("settings");
        let spec = ContainerSpec::new("settings", |_: &RouteCxt| {});
        // A separate task publishes the created event after a short delay,
        // as real platform glue would.
        let publisher = {
            let cxt = Arc::clone(&cxt);
            let container = Arc::clone(&container);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cxt.publish(LifecycleEvent::Created {
                    container,
                    saved: None,
                });
            })
        };
        let (state, result) = push_container(spec).run(ContainersState::new(), cxt).await;
        publisher.await.unwrap();
        assert_eq!(state.records.len(), 1);
        assert!(Arc::ptr_eq(&result.ok().unwrap(), &container));
    }

    #[tokio::test]
    async fn push_container_kind_mismatch_still_tracks() {
        let cxt = RouteCxt::new();
        let container: ContainerHandle = FakeContainer::new("other");
        let publisher = {
            let cxt = Arc::clone(&cxt);
            let container = Arc::clone(&container);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cxt.publish(LifecycleEvent::Created {
                    container,
                    saved: None,
                });
            })
        };
        let spec = ContainerSpec::new("settings", |_: &RouteCxt| {});
        let (state, result) = push_container(spec).run(ContainersState::new(), cxt).await;
        publisher.await.unwrap();
        assert_eq!(state.records.len(), 1);
        assert_eq!(result.failure().unwrap().kind, FailureKind::Construction);
    }

    #[tokio::test]
    async fn finish_top_closes_and_pops() {
        let cxt = RouteCxt::new();
        let container = FakeContainer::new("screen");
        let state = ContainersState {
            records: vec![ContainerRecord::new(NavIdentity::next(), container.clone())],
        };
        let (state, result) = finish_top().run(state, Arc::clone(&cxt)).await;
        assert!(result.is_success());
        assert!(state.records.is_empty());
        assert!(container.closed());

        let (_, result) = finish_top().run(state, cxt).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Precondition);
    }

    #[tokio::test]
    async fn finish_container_targets_by_identity() {
        let cxt = RouteCxt::new();
        let a = FakeContainer::new("a");
        let b = FakeContainer::new("b");
        let ida = NavIdentity::next();
        let idb = NavIdentity::next();
        let state = ContainersState {
            records: vec![
                ContainerRecord::new(ida, a.clone()),
                ContainerRecord::new(idb, b.clone()),
            ],
        };
        let (state, result) = finish_container(ida).run(state, Arc::clone(&cxt)).await;
        assert!(result.is_success());
        assert!(a.closed());
        assert!(!b.closed());
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records[0].identity, idb);

        let (_, result) = finish_container(ida).run(state, cxt).await;
        assert_eq!(result.failure().unwrap().kind, FailureKind::Resolution);
    }

    #[test]
    fn record_lens_reads_and_writes_one_record() {
        let ida = NavIdentity::next();
        let idb = NavIdentity::next();
        let state = ContainersState {
            records: vec![
                ContainerRecord::new(ida, FakeContainer::new("a")),
                ContainerRecord::new(idb, FakeContainer::new("b")),
            ],
        };
        let lens = record_lens(ida);
        let focused = lens.get(&state).unwrap();
        assert_eq!(focused.identity, ida);

        let mut updated = focused.clone();
        updated.awaiting_restore = true;
        let state = lens.set(state, Some(updated));
        assert!(state.records[0].awaiting_restore);
        assert!(!state.records[1].awaiting_restore);

        // An unknown identity has no focus; writes through it are inert.
        let ghost = record_lens(NavIdentity::next());
        assert!(ghost.get(&state).is_none());
        let unchanged = ghost.set(state.clone(), None);
        assert_eq!(unchanged.records.len(), state.records.len());
    }
}
