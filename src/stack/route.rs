//! Stack operations, expressed as effects.
//!
//! The public operations ([`push_unit`], [`switch_tag`], [`finish_unit`])
//! run against a host's [`StackHostState`] and each execute inside exactly
//! one transaction. [`run_on_host`] lifts them to the root
//! [`ContainersState`] through the host's binding, and [`attach_host`] /
//! [`push_host_container`] establish that binding in the first place.

use super::transaction::{fold_stack, in_transaction, map_inner, StackTxnState};
use super::{
    NavStack, SingleStack, StackHost, StackHostState, StackItem, TableStack, TableTag,
    TransactionBackend, UnitBuilder, UnitHandle, UnitRegistry, NO_REQUEST,
};
use crate::containers::{
    find_container, finish_container, push_container, ContainerHandle, ContainerSpec,
    ContainersState, Extra, LifecycleEvent, NavIdentity,
};
use crate::core::{FailureKind, Lens, RouteFailure, RouteResult};
use crate::cxt::RouteCxt;
use crate::effect::{self, RouteEffect};
use log::debug;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Key under which a container record carries its stack binding.
pub const STACK_BINDING_KEY: &str = "switchyard__stack_binding";

/// Resolution of a finish operation: which item left the stack and which
/// predecessor, if any, was revealed in its place.
#[derive(Clone, Debug, PartialEq)]
pub struct FinishTarget {
    /// Table tag the finished item lived under; absent on Single stacks.
    pub tag: Option<TableTag>,
    pub predecessor: Option<StackItem>,
    pub target: StackItem,
}

/// Whether a finish was absorbed by the stack or must propagate to the
/// hosting container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishResult {
    FinishedWithinStack,
    RequestParentFinish,
}

/// Lens from a host's state to its live stack value.
pub fn stack_lens() -> Lens<StackHostState, NavStack> {
    Lens::new(
        |host_state: &StackHostState| host_state.stack.clone(),
        |mut host_state: StackHostState, stack| {
            host_state.stack = stack;
            host_state
        },
    )
}

/// Constructs a unit through the registry. A constructor error becomes a
/// construction failure carrying the cause.
pub fn create_unit<S>(
    registry: Arc<UnitRegistry>,
    builder: UnitBuilder,
) -> RouteEffect<S, UnitHandle>
where
    S: Send + 'static,
{
    RouteEffect::from_fn(move |state, _cxt| match registry.construct(builder.kind(), builder.args()) {
        Ok(unit) => (state, RouteResult::Success(unit)),
        Err(error) => {
            let message = format!("failed to construct unit of kind '{}'", builder.kind());
            (
                state,
                RouteResult::Failure(RouteFailure::with_cause(
                    FailureKind::Construction,
                    message,
                    error,
                )),
            )
        }
    })
}

fn push_at_single(
    builder: UnitBuilder,
    unit: UnitHandle,
) -> RouteEffect<StackTxnState<SingleStack>, StackItem> {
    RouteEffect::from_fn(move |mut vd: StackTxnState<SingleStack>, _cxt| {
        let item = StackItem::new(Arc::clone(&unit), builder.unit_tag().map(str::to_string));
        debug!(target: "switchyard::stack", "push {} onto single stack", item.identity);
        let to_hide: Vec<StackItem> = vd
            .state
            .items
            .iter()
            .filter(|existing| existing.unit.is_visible())
            .cloned()
            .collect();
        for hidden in &to_hide {
            vd.txn.hide(hidden);
        }
        vd.txn.add(vd.region, &item);
        vd.state.items.push(item.clone());
        (vd, RouteResult::Success(item))
    })
}

fn push_at_table(
    builder: UnitBuilder,
    unit: UnitHandle,
) -> RouteEffect<StackTxnState<TableStack>, StackItem> {
    RouteEffect::from_fn(move |mut vd: StackTxnState<TableStack>, _cxt| {
        // Tag resolution order: explicit, then current, then the default.
        let target_tag: TableTag = builder
            .stack_tag()
            .map(str::to_string)
            .or_else(|| vd.state.current_tag().map(str::to_string))
            .unwrap_or_else(|| vd.state.default_tag.clone());
        let leaving = vd
            .state
            .current_tag()
            .filter(|current| *current != target_tag)
            .map(str::to_string);
        if let Some(previous) = leaving {
            let to_hide: Vec<StackItem> = vd
                .state
                .list(&previous)
                .iter()
                .filter(|existing| existing.unit.is_visible())
                .cloned()
                .collect();
            for hidden in &to_hide {
                vd.txn.hide(hidden);
            }
        }
        let siblings: Vec<StackItem> = vd
            .state
            .list(&target_tag)
            .iter()
            .filter(|existing| existing.unit.is_visible())
            .cloned()
            .collect();
        for hidden in &siblings {
            vd.txn.hide(hidden);
        }
        let item = StackItem::new(Arc::clone(&unit), builder.unit_tag().map(str::to_string));
        debug!(
            target: "switchyard::stack",
            "push {} onto table tag '{target_tag}'", item.identity
        );
        vd.txn.add(vd.region, &item);
        vd.state
            .table
            .entry(target_tag.clone())
            .or_default()
            .push(item.clone());
        vd.state.current = Some((target_tag, Some(item.clone())));
        (vd, RouteResult::Success(item))
    })
}

fn switch_at_table(
    registry: Arc<UnitRegistry>,
    target_tag: TableTag,
    silent: bool,
) -> RouteEffect<StackTxnState<TableStack>, Option<StackItem>> {
    RouteEffect::from_fn(move |mut vd: StackTxnState<TableStack>, _cxt| {
        if vd.state.current_tag() == Some(target_tag.as_str()) {
            // Switching to the current tag is an intentional no-op.
            let item = vd.state.list(&target_tag).last().cloned();
            return (vd, RouteResult::Success(item));
        }
        debug!(target: "switchyard::stack", "switch to table tag '{target_tag}'");
        if !silent {
            if let Some(previous) = vd.state.current_tag().map(str::to_string) {
                let to_hide: Vec<StackItem> = vd
                    .state
                    .list(&previous)
                    .iter()
                    .filter(|existing| existing.unit.is_visible())
                    .cloned()
                    .collect();
                for hidden in &to_hide {
                    vd.txn.hide(hidden);
                }
            }
        }
        if let Some(revived) = vd.state.list(&target_tag).last().cloned() {
            if !silent {
                vd.txn.show(&revived);
            }
            vd.state.current = Some((target_tag.clone(), Some(revived.clone())));
            return (vd, RouteResult::Success(Some(revived)));
        }
        let Some(kind) = vd.state.defaults.get(&target_tag).cloned() else {
            // No history and no default: the tag becomes current but empty.
            vd.state.current = Some((target_tag.clone(), None));
            return (vd, RouteResult::Success(None));
        };
        match registry.construct(&kind, &Value::Null) {
            Ok(unit) => {
                let item = StackItem::new(unit, Some(target_tag.clone()));
                vd.txn.add(vd.region, &item);
                if silent {
                    vd.txn.hide(&item);
                }
                vd.state
                    .table
                    .entry(target_tag.clone())
                    .or_default()
                    .push(item.clone());
                vd.state.current = Some((target_tag.clone(), Some(item.clone())));
                (vd, RouteResult::Success(Some(item)))
            }
            Err(error) => (
                vd,
                RouteResult::Failure(RouteFailure::with_cause(
                    FailureKind::Construction,
                    format!("failed to construct default unit for tag '{target_tag}'"),
                    error,
                )),
            ),
        }
    })
}

fn single_target(
    stack: &SingleStack,
    wanted: Option<NavIdentity>,
) -> Result<FinishTarget, RouteFailure> {
    let position = match wanted {
        Some(identity) => stack
            .items
            .iter()
            .position(|item| item.identity == identity),
        None => stack.items.len().checked_sub(1),
    };
    let Some(position) = position else {
        let listing = stack
            .items
            .iter()
            .map(|item| item.identity.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(RouteFailure::resolution(format!(
            "finish target not found on single stack, present: [{listing}]"
        )));
    };
    Ok(FinishTarget {
        tag: None,
        predecessor: position.checked_sub(1).map(|i| stack.items[i].clone()),
        target: stack.items[position].clone(),
    })
}

fn table_target(
    stack: &TableStack,
    wanted: Option<NavIdentity>,
) -> Result<FinishTarget, RouteFailure> {
    let located = match wanted {
        Some(identity) => stack.table.iter().find_map(|(tag, items)| {
            items
                .iter()
                .position(|item| item.identity == identity)
                .map(|position| (tag.clone(), position))
        }),
        None => stack.current_tag().map(str::to_string).and_then(|tag| {
            stack.list(&tag).len().checked_sub(1).map(|p| (tag, p))
        }),
    };
    let Some((tag, position)) = located else {
        return Err(RouteFailure::resolution(
            "finish target not found on any table tag",
        ));
    };
    let items = stack.list(&tag);
    Ok(FinishTarget {
        predecessor: position.checked_sub(1).map(|i| items[i].clone()),
        target: items[position].clone(),
        tag: Some(tag),
    })
}

fn relay_finish_result(
    finishing: &StackItem,
    predecessor: Option<&StackItem>,
    cxt: &RouteCxt,
) {
    let request_code = finishing.unit.controller().request_code();
    if request_code == NO_REQUEST {
        return;
    }
    let Some(predecessor) = predecessor else {
        return;
    };
    let (result_code, payload) = finishing
        .unit
        .controller()
        .take_reply()
        .unwrap_or((NO_REQUEST, None));
    predecessor
        .unit
        .on_unit_result(request_code, result_code, payload.as_ref());
    cxt.publish(LifecycleEvent::ResultDelivered {
        identity: predecessor.identity,
        request_code,
        result_code,
        payload,
    });
}

fn finish_at_single(
    wanted: Option<NavIdentity>,
) -> RouteEffect<StackTxnState<SingleStack>, (Option<FinishTarget>, FinishResult)> {
    RouteEffect::from_fn(move |mut vd: StackTxnState<SingleStack>, cxt| {
        let target = match single_target(&vd.state, wanted) {
            Ok(target) => target,
            // An empty stack with no explicit target has nothing to pop;
            // the finish belongs to the hosting container.
            Err(_) if wanted.is_none() => {
                return (
                    vd,
                    RouteResult::Success((None, FinishResult::RequestParentFinish)),
                );
            }
            Err(failure) => return (vd, RouteResult::Failure(failure)),
        };
        debug!(target: "switchyard::stack", "finish {} on single stack", target.target.identity);
        vd.state
            .items
            .retain(|item| item.identity != target.target.identity);
        vd.txn.hide(&target.target);
        if let Some(predecessor) = &target.predecessor {
            vd.txn.show(predecessor);
        }
        relay_finish_result(&target.target, target.predecessor.as_ref(), cxt);
        let outcome = if vd.state.items.is_empty() {
            FinishResult::RequestParentFinish
        } else {
            FinishResult::FinishedWithinStack
        };
        (vd, RouteResult::Success((Some(target), outcome)))
    })
}

fn finish_at_table(
    wanted: Option<NavIdentity>,
) -> RouteEffect<StackTxnState<TableStack>, (Option<FinishTarget>, FinishResult)> {
    RouteEffect::from_fn(move |mut vd: StackTxnState<TableStack>, cxt| {
        let target = match table_target(&vd.state, wanted) {
            Ok(target) => target,
            Err(_) if wanted.is_none() => {
                return (
                    vd,
                    RouteResult::Success((None, FinishResult::RequestParentFinish)),
                );
            }
            Err(failure) => return (vd, RouteResult::Failure(failure)),
        };
        let tag = target.tag.clone().unwrap_or_default();
        debug!(
            target: "switchyard::stack",
            "finish {} on table tag '{tag}'", target.target.identity
        );
        if let Some(items) = vd.state.table.get_mut(&tag) {
            items.retain(|item| item.identity != target.target.identity);
        }
        vd.txn.hide(&target.target);
        if let Some(predecessor) = &target.predecessor {
            vd.txn.show(predecessor);
        }
        relay_finish_result(&target.target, target.predecessor.as_ref(), cxt);
        let was_current = vd
            .state
            .current
            .as_ref()
            .and_then(|(_, item)| item.as_ref())
            .map(|item| item.identity == target.target.identity)
            .unwrap_or(false);
        if was_current {
            vd.state.current = target
                .predecessor
                .clone()
                .map(|predecessor| (tag.clone(), Some(predecessor)));
        }
        let outcome = if vd.state.list(&tag).is_empty() {
            FinishResult::RequestParentFinish
        } else {
            FinishResult::FinishedWithinStack
        };
        (vd, RouteResult::Success((Some(target), outcome)))
    })
}

/// Constructs a unit and pushes it onto the host's stack, hiding whatever
/// was visible before it. One transaction, committed once.
pub fn push_unit(
    registry: &Arc<UnitRegistry>,
    builder: UnitBuilder,
) -> RouteEffect<StackHostState, StackItem> {
    let registry = Arc::clone(registry);
    create_unit::<StackHostState>(registry, builder.clone()).and_then(move |unit| {
        let single = push_at_single(builder.clone(), Arc::clone(&unit));
        let table = push_at_table(builder.clone(), unit);
        in_transaction(map_inner(fold_stack(single, table), stack_lens()))
    })
}

/// Makes `tag` the current tag of a Table stack, revealing its existing
/// top or constructing the configured default unit when the tag is empty.
/// With `silent` the stack bookkeeping changes but nothing moves on screen.
/// Fails with a precondition on Single stacks.
pub fn switch_tag(
    registry: &Arc<UnitRegistry>,
    tag: impl Into<TableTag>,
    silent: bool,
) -> RouteEffect<StackHostState, Option<StackItem>> {
    let single = effect::fail(RouteFailure::precondition(
        "switch_tag requires a Table stack",
    ));
    let table = switch_at_table(Arc::clone(registry), tag.into(), silent);
    in_transaction(map_inner(fold_stack(single, table), stack_lens()))
}

/// Removes an item from the host's stack, revealing its predecessor and
/// relaying its reply. `target` of `None` means the top of the current
/// history; an explicit target that cannot be found is a resolution
/// failure. Finishing the last item asks the hosting container to finish.
pub fn finish_unit(
    target: Option<NavIdentity>,
) -> RouteEffect<StackHostState, (Option<FinishTarget>, FinishResult)> {
    in_transaction(map_inner(
        fold_stack(finish_at_single(target), finish_at_table(target)),
        stack_lens(),
    ))
}

/// Marks the pushed item as expecting a reply under `request_code`; when
/// it later finishes, its reply is relayed to its predecessor.
pub fn expect_reply<S>(
    push: RouteEffect<S, StackItem>,
    request_code: i32,
) -> RouteEffect<S, StackItem>
where
    S: Send + 'static,
{
    push.map(move |item| {
        item.unit.controller().set_request_code(request_code);
        item
    })
}

/// Resolves with the `(result_code, payload)` of the next reply relayed
/// under `request_code`. Subscribes immediately; the returned future may
/// be awaited later without missing the delivery.
pub fn await_reply(
    cxt: &RouteCxt,
    request_code: i32,
) -> impl Future<Output = Option<(i32, Option<Value>)>> + Send + 'static {
    let mut events = cxt.subscribe();
    async move {
        loop {
            use tokio::sync::broadcast::error::RecvError;
            match events.recv().await {
                Ok(LifecycleEvent::ResultDelivered {
                    request_code: delivered,
                    result_code,
                    payload,
                    ..
                }) if delivered == request_code => return Some((result_code, payload)),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Binds a stack host to the container tracked under `container`: the host
/// learns its container identity and the record gains the stack binding.
/// Re-attaching the same host after a recreation keeps the existing stack.
pub fn attach_host(
    host: Arc<StackHost>,
    backend: Arc<dyn TransactionBackend>,
    container: NavIdentity,
) -> RouteEffect<ContainersState, ()> {
    RouteEffect::from_fn(move |mut state: ContainersState, _cxt| {
        let Some(record) = state
            .records
            .iter_mut()
            .find(|record| record.identity == container)
        else {
            return (
                state,
                RouteResult::Failure(RouteFailure::resolution(format!(
                    "attach_host failed: container {container} is not tracked"
                ))),
            );
        };
        host.bind_identity(container);
        let already_bound = record
            .extra(STACK_BINDING_KEY)
            .and_then(|extra| Arc::clone(extra).downcast::<StackHostState>().ok())
            .is_some_and(|binding| Arc::ptr_eq(&binding.host, &host));
        if !already_bound {
            let binding = StackHostState {
                host: Arc::clone(&host),
                stack: host.init_stack().clone(),
                backend: Arc::clone(&backend),
            };
            record
                .extras
                .insert(STACK_BINDING_KEY.to_string(), Arc::new(binding) as Extra);
        }
        (state, RouteResult::Success(()))
    })
}

/// Lens from the root state to the given host's stack binding. The focus
/// is absent while the host is not attached to any tracked container.
pub fn host_state_lens(host: Arc<StackHost>) -> Lens<ContainersState, Option<StackHostState>> {
    let host_for_get = Arc::clone(&host);
    Lens::new(
        move |state: &ContainersState| {
            state.records.iter().find_map(|record| {
                let extra = record.extra(STACK_BINDING_KEY)?;
                let binding = Arc::clone(extra).downcast::<StackHostState>().ok()?;
                Arc::ptr_eq(&binding.host, &host_for_get).then(|| (*binding).clone())
            })
        },
        move |mut state: ContainersState, binding| {
            let Some(binding) = binding else {
                return state;
            };
            let bound_host = Arc::clone(&binding.host);
            if let Some(record) = state.records.iter_mut().find(|record| {
                record
                    .extra(STACK_BINDING_KEY)
                    .and_then(|extra| Arc::clone(extra).downcast::<StackHostState>().ok())
                    .is_some_and(|existing| Arc::ptr_eq(&existing.host, &bound_host))
            }) {
                record
                    .extras
                    .insert(STACK_BINDING_KEY.to_string(), Arc::new(binding) as Extra);
            }
            state
        },
    )
}

/// Lifts a host-level effect to the root state through the host's binding.
/// Running against an unattached host is a precondition failure.
pub fn run_on_host<R>(
    host: &Arc<StackHost>,
    effect: RouteEffect<StackHostState, R>,
) -> RouteEffect<ContainersState, R>
where
    R: Send + 'static,
{
    effect.map_state_option(host_state_lens(Arc::clone(host)))
}

/// Launches a container and attaches `host` to it in one step.
pub fn push_host_container(
    spec: ContainerSpec,
    host: Arc<StackHost>,
    backend: Arc<dyn TransactionBackend>,
) -> RouteEffect<ContainersState, ContainerHandle> {
    push_container(spec).and_then(move |handle| {
        let host = Arc::clone(&host);
        let backend = Arc::clone(&backend);
        let result_handle = Arc::clone(&handle);
        find_container(Arc::clone(&handle))
            .some_or_fail("record for the created container")
            .and_then(move |record| {
                let result_handle = Arc::clone(&result_handle);
                attach_host(Arc::clone(&host), Arc::clone(&backend), record.identity)
                    .map(move |_| Arc::clone(&result_handle))
            })
    })
}

/// Propagates a finish outcome upward: a finish absorbed by the stack is a
/// no-op here, a parent-finish request closes the host's container.
pub fn escalate_finish(
    host: &Arc<StackHost>,
    outcome: FinishResult,
) -> RouteEffect<ContainersState, ()> {
    match outcome {
        FinishResult::FinishedWithinStack => effect::unit(),
        FinishResult::RequestParentFinish => match host.identity() {
            Some(identity) => finish_container(identity),
            None => effect::fail(RouteFailure::precondition(
                "cannot escalate finish: host is not attached to a container",
            )),
        },
    }
}
