//! Property-based tests for effect composition and stack invariants.
//!
//! These tests use proptest to verify properties hold across
//! many randomly generated inputs.

use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use switchyard::stack::{
    finish_unit, push_unit, switch_tag, MemoryBackend, MemoryUnit, NavStack, StackHost,
    StackHostState, StackItem, TableTag, UnitBuilder, UnitRegistry,
};
use switchyard::{
    Engine, Lens, MainEngine, RegionId, RouteCxt, RouteEffect, RouteFailure, RouteResult,
};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime")
}

const TAGS: [&str; 3] = ["inbox", "search", "profile"];

#[derive(Clone, Debug)]
enum StackOp {
    Push(Option<TableTag>),
    Switch(TableTag),
    Finish,
}

prop_compose! {
    fn arbitrary_tag()(index in 0..TAGS.len()) -> TableTag {
        TAGS[index].to_string()
    }
}

fn arbitrary_op() -> impl Strategy<Value = StackOp> {
    prop_oneof![
        prop::option::of(arbitrary_tag()).prop_map(StackOp::Push),
        arbitrary_tag().prop_map(StackOp::Switch),
        Just(StackOp::Finish),
    ]
}

fn registry() -> Arc<UnitRegistry> {
    Arc::new(UnitRegistry::new().register("screen", MemoryUnit::constructor("screen")))
}

fn table_host(backend: Arc<MemoryBackend>) -> StackHostState {
    let defaults: HashMap<TableTag, String> = TAGS
        .iter()
        .map(|tag| (tag.to_string(), "screen".to_string()))
        .collect();
    let stack = NavStack::table(defaults, TAGS[0]);
    StackHostState {
        host: StackHost::new(RegionId(1), stack.clone()),
        stack,
        backend,
    }
}

fn single_host(backend: Arc<MemoryBackend>) -> StackHostState {
    StackHostState {
        host: StackHost::new(RegionId(1), NavStack::single()),
        stack: NavStack::single(),
        backend,
    }
}

fn all_items(stack: &NavStack) -> Vec<StackItem> {
    match stack {
        NavStack::Single(single) => single.items.clone(),
        NavStack::Table(table) => table.table.values().flatten().cloned().collect(),
    }
}

async fn apply_op(
    state: StackHostState,
    op: &StackOp,
    registry: &Arc<UnitRegistry>,
    cxt: Arc<RouteCxt>,
) -> StackHostState {
    match op {
        StackOp::Push(tag) => {
            let mut builder = UnitBuilder::new("screen");
            if let Some(tag) = tag {
                builder = builder.with_stack_tag(tag.clone());
            }
            let (state, result) = push_unit(registry, builder).run(state, cxt).await;
            assert!(result.is_success());
            state
        }
        StackOp::Switch(tag) => {
            let (state, result) = switch_tag(registry, tag.clone(), false)
                .run(state, cxt)
                .await;
            assert!(result.is_success());
            state
        }
        StackOp::Finish => {
            let (state, result) = finish_unit(None).run(state, cxt).await;
            assert!(result.is_success());
            state
        }
    }
}

proptest! {
    /// On a Single stack, exactly the top item is visible after any
    /// push/finish sequence, and everything beneath it is hidden.
    #[test]
    fn single_stack_shows_exactly_the_top(pushes in prop::collection::vec(any::<bool>(), 0..20)) {
        runtime().block_on(async {
            let cxt = RouteCxt::new();
            let registry = registry();
            let mut state = single_host(MemoryBackend::new());
            for push in &pushes {
                let op = if *push { StackOp::Push(None) } else { StackOp::Finish };
                state = apply_op(state, &op, &registry, Arc::clone(&cxt)).await;
                let items = all_items(&state.stack);
                let visible: Vec<_> = items.iter().filter(|i| i.unit.is_visible()).collect();
                match items.last() {
                    Some(top) => {
                        prop_assert_eq!(visible.len(), 1);
                        prop_assert_eq!(visible[0].identity, top.identity);
                    }
                    None => prop_assert!(visible.is_empty()),
                }
            }
            Ok(())
        })?;
    }

    /// On a Table stack, at most one unit is visible after any sequence of
    /// pushes, non-silent switches and finishes, and units outside the
    /// current tag are always hidden.
    #[test]
    fn table_stack_never_shows_two_units(ops in prop::collection::vec(arbitrary_op(), 0..20)) {
        runtime().block_on(async {
            let cxt = RouteCxt::new();
            let registry = registry();
            let mut state = table_host(MemoryBackend::new());
            for op in &ops {
                state = apply_op(state, op, &registry, Arc::clone(&cxt)).await;
                let NavStack::Table(table) = &state.stack else { unreachable!() };
                let visible: Vec<_> = all_items(&state.stack)
                    .into_iter()
                    .filter(|i| i.unit.is_visible())
                    .collect();
                prop_assert!(visible.len() <= 1);
                let current = table.current.as_ref().map(|(tag, _)| tag.as_str());
                for (tag, items) in &table.table {
                    if Some(tag.as_str()) != current {
                        prop_assert!(items.iter().all(|i| !i.unit.is_visible()));
                    }
                }
            }
            Ok(())
        })?;
    }

    /// Every operation commits exactly one transaction batch, and pushed
    /// items carry unique identities.
    #[test]
    fn one_commit_per_operation_and_unique_identities(
        ops in prop::collection::vec(arbitrary_op(), 0..20),
    ) {
        runtime().block_on(async {
            let cxt = RouteCxt::new();
            let registry = registry();
            let backend = MemoryBackend::new();
            let mut state = table_host(Arc::clone(&backend));
            for op in &ops {
                state = apply_op(state, op, &registry, Arc::clone(&cxt)).await;
            }
            prop_assert_eq!(backend.commit_count(), ops.len());
            let identities: Vec<_> = all_items(&state.stack).iter().map(|i| i.identity).collect();
            let distinct: HashSet<_> = identities.iter().copied().collect();
            prop_assert_eq!(distinct.len(), identities.len());
            Ok(())
        })?;
    }

    /// A failure at position k of an and_then chain leaves exactly the
    /// first k mutations applied and skips the rest.
    #[test]
    fn failure_preserves_the_prefix_of_mutations(total in 1..12usize, fail_at in 0..12usize) {
        prop_assume!(fail_at < total);
        runtime().block_on(async {
            let cxt = RouteCxt::new();
            let mut chain: RouteEffect<Vec<usize>, ()> =
                RouteEffect::from_fn(|state, _| (state, RouteResult::Success(())));
            for step in 0..total {
                let failing = step == fail_at;
                chain = chain.and_then(move |_| {
                    RouteEffect::from_fn(move |mut state: Vec<usize>, _| {
                        if failing {
                            return (
                                state,
                                RouteResult::Failure(RouteFailure::resolution("injected")),
                            );
                        }
                        state.push(step);
                        (state, RouteResult::Success(()))
                    })
                });
            }
            let (state, result) = chain.run(vec![], cxt).await;
            prop_assert!(result.is_failure());
            prop_assert_eq!(state, (0..fail_at).collect::<Vec<_>>());
            Ok(())
        })?;
    }

    /// Running effects through an engine one after another is the same as
    /// folding the state directly.
    #[test]
    fn engine_runs_equal_a_direct_fold(increments in prop::collection::vec(1..100u64, 0..16)) {
        runtime().block_on(async {
            let engine = MainEngine::create(0u64);
            for increment in &increments {
                let increment = *increment;
                let effect = RouteEffect::from_fn(move |state: u64, _| {
                    (state + increment, RouteResult::Success(()))
                });
                prop_assert!(engine.run(effect).await.is_success());
            }
            let snapshot = engine
                .run(switchyard::effect::get_state())
                .await
                .ok()
                .expect("snapshot");
            prop_assert_eq!(snapshot, increments.iter().sum::<u64>());
            Ok(())
        })?;
    }

    /// Lens round trips: what you set is what you get, and setting back
    /// what you got changes nothing.
    #[test]
    fn lens_laws_hold_for_composed_lenses(
        outer in any::<u32>(),
        label in ".*",
        inner in any::<u32>(),
    ) {
        let first: Lens<(u32, (String, u32)), (String, u32)> = Lens::new(
            |state: &(u32, (String, u32))| state.1.clone(),
            |mut state: (u32, (String, u32)), nested| {
                state.1 = nested;
                state
            },
        );
        let second: Lens<(String, u32), u32> = Lens::new(
            |nested: &(String, u32)| nested.1,
            |mut nested: (String, u32), value| {
                nested.1 = value;
                nested
            },
        );
        let lens = first.compose(&second);
        let state = (outer, (label, 0u32));

        let updated = lens.set(state.clone(), inner);
        prop_assert_eq!(lens.get(&updated), inner);
        let same = lens.set(state.clone(), lens.get(&state));
        prop_assert_eq!(same, state);
    }
}
