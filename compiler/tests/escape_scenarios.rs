//! End-to-end tests of escape analysis and its transforms on the sample modules

use compiler::ir::escape::{
    AnalysisContext, EscAnalyzer, EscState, EscapeAnalysisPass, EscapeOptions, EscapeReport,
    NodeKind, SummaryCache,
};
use compiler::ir::optimization::OptimizationPass;
use compiler::ir::ssa::VarPromotion;
use compiler::ir::{
    BytecodeRepository, IrBuilder, IrFunction, IrInstruction, IrModule, IrType, IrValue,
    MethodFlags, MethodId,
};
use compiler::samples::{Sample, Scenario};
use std::sync::Arc;

fn sample(scenario: Scenario) -> Sample {
    compiler::logging::init_test();
    scenario.build().expect("sample builds")
}

/// Run the escape pass once with a private cache and return the report of
/// `method`
fn run_pass(module: &mut IrModule, method: MethodId, options: EscapeOptions) -> EscapeReport {
    let cache = Arc::new(SummaryCache::new());
    let mut pass = EscapeAnalysisPass::with_cache(options, cache);
    let result = pass.run_on_module(module);
    assert_eq!(result.stat("methods_failed"), 0);
    let name = module.get_function(method).unwrap().name.clone();
    pass.take_reports()
        .into_iter()
        .find(|r| r.method == name)
        .expect("report for method")
}

fn count(f: &IrFunction, pred: impl Fn(&IrInstruction) -> bool) -> usize {
    f.cfg
        .blocks
        .values()
        .flat_map(|b| b.instructions.iter())
        .filter(|i| pred(i))
        .count()
}

fn allocations(f: &IrFunction) -> usize {
    count(f, |i| matches!(i, IrInstruction::NewObj { .. }))
}

fn plain_monitors(f: &IrFunction) -> usize {
    count(f, |i| i.plain_monitor().is_some())
}

fn guarded_enters(f: &IrFunction) -> usize {
    count(f, |i| matches!(i, IrInstruction::MonitorEnter { guarded: true, .. }))
}

fn first_allocation(report: &EscapeReport) -> compiler::ir::escape::ObjectReport {
    report
        .objects
        .iter()
        .find(|o| o.kind == NodeKind::Object)
        .cloned()
        .expect("an allocation")
}

#[test]
fn test_sum_of_fields_is_fully_scalarized() {
    let Sample { mut module, entry } = sample(Scenario::SumOfFields);
    let report = run_pass(&mut module, entry, EscapeOptions::default());

    let obj = first_allocation(&report);
    assert_eq!(obj.state, EscState::NoEscape);
    assert!(!obj.out_escaped);
    assert_eq!(report.scalar.local, 1);
    assert!(report.ssa.is_some());

    let f = module.get_function(entry).unwrap();
    assert_eq!(allocations(f), 0);
    assert_eq!(count(f, |i| matches!(i, IrInstruction::LdInd { .. })), 0);
    assert_eq!(count(f, |i| matches!(i, IrInstruction::StInd { .. })), 0);
    assert!(f.vars.is_empty());
    assert!(f.verify().is_ok());
}

#[test]
fn test_static_store_keeps_object_and_monitors() {
    let Sample { mut module, entry } = sample(Scenario::StaticStore);
    let report = run_pass(&mut module, entry, EscapeOptions::default());

    assert_eq!(first_allocation(&report).state, EscState::GlobalEscape);
    assert_eq!(report.monitors.removed, 0);
    assert_eq!(report.scalar.local + report.scalar.escaped, 0);

    let f = module.get_function(entry).unwrap();
    assert_eq!(allocations(f), 1);
    assert_eq!(plain_monitors(f), 2);
}

#[test]
fn test_local_lock_is_removed_and_object_scalarized() {
    let Sample { mut module, entry } = sample(Scenario::LocalLock);
    let report = run_pass(&mut module, entry, EscapeOptions::default());

    assert_eq!(first_allocation(&report).state, EscState::NoEscape);
    assert_eq!(report.monitors.removed, 2);
    assert_eq!(report.scalar.local, 1);

    let f = module.get_function(entry).unwrap();
    assert_eq!(plain_monitors(f), 0);
    assert_eq!(guarded_enters(f), 0);
    assert_eq!(allocations(f), 0);
}

#[test]
fn test_object_passed_twice_is_recreated_per_call() {
    let Sample { mut module, entry } = sample(Scenario::PassedTwice);
    let report = run_pass(&mut module, entry, EscapeOptions::default());

    let obj = first_allocation(&report);
    assert_eq!(obj.state, EscState::ArgEscape);
    assert!(!obj.virtual_call);
    assert!(report.states.values().all(|s| *s != EscState::GlobalEscape));
    assert_eq!(report.scalar.escaped, 1);

    let f = module.get_function(entry).unwrap();
    // One lazily executed allocation ahead of each call
    assert_eq!(allocations(f), 2);
    assert_eq!(
        count(f, |i| matches!(i, IrInstruction::DirectCall { .. })),
        2
    );
    assert!(f.verify().is_ok());
}

#[test]
fn test_passed_twice_without_escaped_replacement() {
    let Sample { mut module, entry } = sample(Scenario::PassedTwice);
    let options = EscapeOptions {
        scalarize_escaped: false,
        ..EscapeOptions::default()
    };
    let report = run_pass(&mut module, entry, options);
    assert_eq!(report.scalar.escaped, 0);
    assert_eq!(allocations(module.get_function(entry).unwrap()), 1);
}

#[test]
fn test_this_lock_is_guarded_by_caller_flag() {
    let Sample { mut module, entry } = sample(Scenario::ThisLock);
    let report = run_pass(&mut module, entry, EscapeOptions::default());

    assert_eq!(report.monitors.this_guarded, 2);
    assert_eq!(report.monitors.save_flag_calls, 2);
    assert!(report.summary.monitor_on_this);

    let f = module.get_function(entry).unwrap();
    assert_eq!(plain_monitors(f), 0);
    assert_eq!(guarded_enters(f), 1);
    let helpers = count(f, |i| matches!(i, IrInstruction::VmHelperCall { .. }));
    // One flag load at entry and one save in front of each call
    assert_eq!(helpers, 3);
}

#[test]
fn test_virtual_lock_is_acquired_lazily() {
    let Sample { mut module, entry } = sample(Scenario::VirtualLock);
    let report = run_pass(&mut module, entry, EscapeOptions::default());

    let obj = first_allocation(&report);
    assert!(obj.virtual_call);
    assert_ne!(obj.state, EscState::GlobalEscape);
    assert_eq!(report.monitors.removed, 0);
    assert!(report.monitors.virtual_guarded > 0);

    let f = module.get_function(entry).unwrap();
    assert_eq!(plain_monitors(f), 0);

    // The block making the virtual call is entered either with the lock
    // already held or through a block acquiring it
    let call_block = f
        .cfg
        .blocks
        .values()
        .find(|b| {
            b.instructions
                .iter()
                .any(|i| matches!(i, IrInstruction::IndirectCall { .. }))
        })
        .unwrap();
    let acquires = call_block
        .predecessors
        .iter()
        .filter_map(|p| f.cfg.get_block(*p))
        .filter(|p| {
            p.instructions
                .iter()
                .any(|i| matches!(i, IrInstruction::MonitorEnter { guarded: true, .. }))
        })
        .count();
    assert_eq!(acquires, 1);
    assert!(f.verify().is_ok());
}

#[test]
fn test_virtual_lock_kept_when_disabled() {
    let Sample { mut module, entry } = sample(Scenario::VirtualLock);
    let options = EscapeOptions {
        sync_removal_virtual: false,
        ..EscapeOptions::default()
    };
    let report = run_pass(&mut module, entry, options);
    assert_eq!(report.monitors.virtual_guarded, 0);
    assert_eq!(plain_monitors(module.get_function(entry).unwrap()), 2);
}

#[test]
fn test_final_field_of_loaded_object_read_once() {
    let Sample { mut module, entry } = sample(Scenario::FinalReads);
    let report = run_pass(&mut module, entry, EscapeOptions::default());
    assert_eq!(report.scalar.final_fields, 1);

    let f = module.get_function(entry).unwrap();
    assert_eq!(
        count(f, |i| matches!(i, IrInstruction::LdFieldAddr { .. })),
        1
    );
}

#[test]
fn test_removed_monitors_never_belong_to_escaping_objects() {
    for scenario in Scenario::ALL {
        let Sample { mut module, .. } = sample(scenario);
        let before: Vec<(String, usize)> = module
            .functions
            .values()
            .map(|f| (f.name.clone(), plain_monitors(f)))
            .collect();

        let mut pass = EscapeAnalysisPass::with_cache(
            EscapeOptions::default(),
            Arc::new(SummaryCache::new()),
        );
        pass.run_on_module(&mut module);

        for report in pass.reports() {
            let escaping = report
                .objects
                .iter()
                .any(|o| o.kind == NodeKind::Object && (o.state.is_global() || o.virtual_call));
            let had = before
                .iter()
                .find(|(name, _)| *name == report.method)
                .map(|(_, n)| *n)
                .unwrap_or(0);
            if escaping && had > 0 && report.monitors.removed == 0 {
                let f = module.function_by_name(&report.method).unwrap();
                assert!(
                    plain_monitors(f) + guarded_enters(f) > 0,
                    "{}: every lock vanished",
                    report.method
                );
            }
            assert!(report.trace.is_monotone(), "{}: state improved", report.method);
        }
    }
}

#[test]
fn test_second_run_changes_nothing() {
    for scenario in Scenario::ALL {
        let Sample { mut module, .. } = sample(scenario);
        let cache = Arc::new(SummaryCache::new());
        let mut pass = EscapeAnalysisPass::with_cache(EscapeOptions::default(), cache.clone());
        pass.run_on_module(&mut module);
        let once = module.clone();

        let mut again = EscapeAnalysisPass::with_cache(EscapeOptions::default(), cache);
        let result = again.run_on_module(&mut module);
        assert!(!result.modified, "{} changed on the second run", scenario);
        for report in again.reports() {
            assert!(!report.changed(), "{}: {} changed", scenario, report.method);
        }
        for (id, f) in &module.functions {
            let first = once.get_function(*id).unwrap();
            assert_eq!(
                f.cfg.instruction_count(),
                first.cfg.instruction_count(),
                "{}: {}",
                scenario,
                f.name
            );
        }
    }
}

#[test]
fn test_callee_summary_is_reused() {
    let Sample { mut module, .. } = sample(Scenario::PassedTwice);
    let cache = Arc::new(SummaryCache::new());
    let mut pass = EscapeAnalysisPass::with_cache(EscapeOptions::analysis_only(), cache.clone());
    pass.run_on_module(&mut module);

    let first = cache.stats();
    assert_eq!(first.entries, 2);
    let key = module
        .registry
        .find_method("Pair", "inspect")
        .and_then(|m| module.registry.method_key(m))
        .unwrap();
    let summary = cache.get(&key).unwrap();

    pass.run_on_module(&mut module);
    let second = cache.stats();
    assert_eq!(second.inserts, first.inserts);
    assert!(second.hits > first.hits);
    assert!(Arc::ptr_eq(&summary, &cache.get(&key).unwrap()));
}

#[test]
fn test_depth_limit_makes_arguments_escape() {
    let Sample { module, entry } = sample(Scenario::PassedTwice);
    let repository = BytecodeRepository::capture(&module);
    let ssa = VarPromotion;

    let state_with_depth = |max_depth: usize| {
        let cache = SummaryCache::new();
        let options = EscapeOptions {
            max_depth,
            ..EscapeOptions::analysis_only()
        };
        let ctx = AnalysisContext {
            cache: &cache,
            source: &repository,
            options: &options,
            ssa: &ssa,
        };
        let mut body = module.get_function(entry).unwrap().clone();
        let report = EscAnalyzer::new(ctx, 0).analyze(&mut body).unwrap();
        (first_allocation(&report).state, cache.len())
    };

    // No callee may be analyzed: the argument is handed to unknown code
    assert_eq!(state_with_depth(0), (EscState::GlobalEscape, 1));
    // One level is enough to learn that inspect keeps nothing
    assert_eq!(state_with_depth(1), (EscState::ArgEscape, 2));
}

#[test]
fn test_summaries_survive_save_and_load() {
    let Sample { mut module, .. } = sample(Scenario::ThisLock);
    let cache = Arc::new(SummaryCache::new());
    let mut pass = EscapeAnalysisPass::with_cache(EscapeOptions::analysis_only(), cache.clone());
    pass.run_on_module(&mut module);

    let path = std::env::temp_dir().join(format!("escjit-it-{}.esum", std::process::id()));
    cache.save(&path).unwrap();
    let restored = SummaryCache::new();
    assert_eq!(restored.load(&path).unwrap(), cache.len());
    let _ = std::fs::remove_file(&path);

    for (a, b) in cache.snapshot().iter().zip(restored.snapshot().iter()) {
        assert_eq!(**a, **b);
    }
}

/// `link(a, h) { h.next = a }`, called as
/// `o = new Node; enter o; link(o, Node.root); exit o`
fn linked_into_static() -> (IrModule, MethodId, MethodId) {
    let mut b = IrBuilder::new("linked");
    let node = b.registry_mut().add_class("Node");
    let next = b
        .registry_mut()
        .add_field(node, "next", IrType::Object(node), false);
    let root = b
        .registry_mut()
        .add_static_field(node, "root", IrType::Object(node));
    let link = b.registry_mut().add_method(
        node,
        "link",
        vec![IrType::Object(node), IrType::Object(node)],
        IrType::Void,
        MethodFlags::static_method(),
    );
    let entry = b.registry_mut().add_method(
        node,
        "publishLocked",
        vec![],
        IrType::Void,
        MethodFlags::static_method(),
    );

    b.start_function(link).unwrap();
    let a = b.param(0).unwrap();
    let h = b.param(1).unwrap();
    b.build_put_field(h, next, a).unwrap();
    b.build_return(None).unwrap();
    b.finish_function();

    b.start_function(entry).unwrap();
    let o = b.build_new_obj(node).unwrap();
    let s = b.build_get_static(root).unwrap();
    b.build_monitor_enter(o).unwrap();
    b.build_call(link, vec![o, s]).unwrap();
    b.build_monitor_exit(o).unwrap();
    b.build_return(None).unwrap();
    b.finish_function();

    (b.finish(), entry, link)
}

#[test]
fn test_object_stored_into_argument_field_keeps_its_lock() {
    compiler::logging::init_test();
    let (mut module, entry, link) = linked_into_static();
    let cache = Arc::new(SummaryCache::new());
    let mut pass = EscapeAnalysisPass::with_cache(EscapeOptions::default(), cache.clone());
    pass.run_on_module(&mut module);

    let key = module.registry.method_key(link).unwrap();
    let summary = cache.get(&key).unwrap();
    assert_eq!(summary.param(0).unwrap().state, EscState::GlobalEscape);

    let name = module.get_function(entry).unwrap().name.clone();
    let report = pass
        .take_reports()
        .into_iter()
        .find(|r| r.method == name)
        .unwrap();
    assert_eq!(first_allocation(&report).state, EscState::GlobalEscape);
    assert_eq!(report.monitors.removed, 0);
    assert_eq!(report.scalar.local + report.scalar.escaped, 0);
    assert_eq!(plain_monitors(module.get_function(entry).unwrap()), 2);
}

/// `id(p) { return p }`, called as
/// `o = new Box; o.x = 1; r = id(o); r.x = 5; return o.x`
fn returned_alias() -> (IrModule, MethodId) {
    let mut b = IrBuilder::new("returned_alias");
    let class = b.registry_mut().add_class("Box");
    let x = b.registry_mut().add_field(class, "x", IrType::I32, false);
    let id = b.registry_mut().add_method(
        class,
        "id",
        vec![IrType::Object(class)],
        IrType::Object(class),
        MethodFlags::static_method(),
    );
    let entry = b.registry_mut().add_method(
        class,
        "writeThroughResult",
        vec![],
        IrType::I32,
        MethodFlags::static_method(),
    );

    b.start_function(id).unwrap();
    let p = b.param(0).unwrap();
    b.build_return(Some(p)).unwrap();
    b.finish_function();

    b.start_function(entry).unwrap();
    let o = b.build_new_obj(class).unwrap();
    let one = b.build_i32(1).unwrap();
    b.build_put_field(o, x, one).unwrap();
    let r = b.build_call(id, vec![o]).unwrap().unwrap();
    let five = b.build_i32(5).unwrap();
    b.build_put_field(r, x, five).unwrap();
    let v = b.build_get_field(o, x).unwrap();
    b.build_return(Some(v)).unwrap();
    b.finish_function();

    (b.finish(), entry)
}

#[test]
fn test_object_returned_by_callee_keeps_its_fields_in_memory() {
    compiler::logging::init_test();
    let (mut module, entry) = returned_alias();
    let report = run_pass(&mut module, entry, EscapeOptions::default());

    assert_eq!(first_allocation(&report).state, EscState::ArgEscape);
    assert_eq!(report.scalar.escaped, 0);

    let f = module.get_function(entry).unwrap();
    assert_eq!(allocations(f), 1);
    // Both stores of x and the final read go through memory
    assert_eq!(count(f, |i| matches!(i, IrInstruction::StInd { .. })), 2);
    assert_eq!(count(f, |i| matches!(i, IrInstruction::LdInd { .. })), 1);
    assert_eq!(count(f, |i| matches!(i, IrInstruction::LdVar { .. })), 0);
    assert!(count(f, |i| matches!(
        i,
        IrInstruction::Const {
            value: IrValue::I32(5),
            ..
        }
    )) == 1);
}

mod properties {
    use compiler::ir::escape::{
        propagate, BuiltGraph, CallOracle, CalleeMethodInfo, ConnectionGraph, EdgeKind, EscState,
        NodeKind,
    };
    use compiler::ir::{IrBlockId, MethodId, RefKind};
    use proptest::prelude::*;
    use std::sync::Arc;

    struct NoCallees;

    impl CallOracle for NoCallees {
        fn is_opaque(&self, _method: MethodId) -> bool {
            true
        }

        fn summary(&mut self, _method: MethodId) -> Option<Arc<CalleeMethodInfo>> {
            None
        }
    }

    const KINDS: [NodeKind; 7] = [
        NodeKind::Object,
        NodeKind::LdObj,
        NodeKind::Local,
        NodeKind::InstanceField,
        NodeKind::StaticField,
        NodeKind::ExitVal,
        NodeKind::DefArg,
    ];

    fn edge_kind(k: u8) -> EdgeKind {
        match k % 3 {
            0 => EdgeKind::Defer,
            1 => EdgeKind::Point,
            _ => EdgeKind::Field,
        }
    }

    fn graph_from(kinds: &[usize], edges: &[(usize, usize, u8)]) -> ConnectionGraph {
        let mut graph = ConnectionGraph::new();
        let ids: Vec<_> = kinds
            .iter()
            .map(|k| graph.add_node(KINDS[*k % KINDS.len()], RefKind::Reference))
            .collect();
        for (from, to, kind) in edges {
            let from = ids[*from % ids.len()];
            let to = ids[*to % ids.len()];
            graph.add_edge(from, to, edge_kind(*kind), None);
        }
        graph
    }

    fn reachable_from_statics(graph: &ConnectionGraph) -> Vec<compiler::ir::escape::CnGNodeId> {
        let mut seen = std::collections::BTreeSet::new();
        let mut stack: Vec<_> = graph
            .node_ids()
            .filter(|id| graph.node(*id).kind == NodeKind::StaticField)
            .collect();
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(graph.edges_from(id).iter().map(|t| t.to));
            }
        }
        seen.into_iter().collect()
    }

    proptest! {
        #[test]
        fn propagation_never_improves_a_state(
            kinds in prop::collection::vec(0usize..7, 1..24),
            edges in prop::collection::vec((0usize..64, 0usize..64, 0u8..3), 0..48),
        ) {
            let graph = graph_from(&kinds, &edges);
            let mut built = BuiltGraph { graph, calls: Vec::new(), global_seeds: Vec::new() };
            let trace = propagate(&mut built, &mut NoCallees, &|_: IrBlockId| false);

            prop_assert!(trace.is_monotone());
            let last = trace.final_states().unwrap();
            let states = built.graph.states();
            prop_assert_eq!(last, states.as_slice());
            for id in reachable_from_statics(&built.graph) {
                prop_assert_eq!(built.graph.node(id).state(), EscState::GlobalEscape);
            }
        }

        #[test]
        fn meet_is_a_lower_bound(a in 0usize..3, b in 0usize..3) {
            let states = [EscState::GlobalEscape, EscState::ArgEscape, EscState::NoEscape];
            let (a, b) = (states[a], states[b]);
            let m = a.meet(b);
            prop_assert!(m <= a && m <= b);
            prop_assert_eq!(m, b.meet(a));
            prop_assert_eq!(a.meet(a), a);
        }
    }
}
