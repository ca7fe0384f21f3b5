//! Escape state propagation
//!
//! Ordered sweeps over a built connection graph:
//! 1. Global roots (static fields, caught and thrown values, arguments of
//!    opaque calls, builder seeds) make everything they reach global. Normal
//!    returns only mark what they reach as out-escaped.
//! 2. Formal parameters: objects they reach become global, everything else
//!    out-escaped.
//! 3. Call sites: virtual calls mark their arguments arg-escaping and
//!    virtual-call reached; direct calls adopt the callee summary, or go
//!    global when there is none.
//! 4. Field and element slots of escaping objects, loaded values and call
//!    results linked to caller arguments settle to a fixpoint. Merges and
//!    casts then take the meet of what flows into them.
//! 5. Objects allocated inside loops are flagged.
//!
//! Every update goes through `ConnectionGraph::lower_state`, so states only
//! ever move toward `GlobalEscape`.

use super::cng::{CnGNodeId, ConnectionGraph, EdgeKind, EscState, NodeKind};
use super::graph_builder::{BuiltGraph, CallTarget};
use super::summary::CalleeMethodInfo;
use crate::ir::{IrBlockId, MethodId};
use fxhash::FxHashSet;
use log::trace;
use std::sync::Arc;

/// What the propagator may learn about direct callees
pub trait CallOracle {
    /// Native, unresolved or otherwise unanalyzable callee
    fn is_opaque(&self, method: MethodId) -> bool;

    /// Summary of an analyzable callee, computed on demand. `None` when no
    /// summary can be produced.
    fn summary(&mut self, method: MethodId) -> Option<Arc<CalleeMethodInfo>>;
}

/// Node states recorded after each sweep
#[derive(Debug, Clone, Default)]
pub struct PropagationTrace {
    pub sweeps: Vec<(&'static str, Vec<EscState>)>,
}

impl PropagationTrace {
    /// Whether no node's state ever improved from one sweep to the next
    pub fn is_monotone(&self) -> bool {
        self.sweeps.windows(2).all(|pair| {
            let (before, after) = (&pair[0].1, &pair[1].1);
            before.len() == after.len() && before.iter().zip(after).all(|(b, a)| a <= b)
        })
    }

    pub fn final_states(&self) -> Option<&[EscState]> {
        self.sweeps.last().map(|(_, states)| states.as_slice())
    }
}

/// Run every sweep over `built`. `in_loop` tells whether a block lies inside
/// a loop body.
pub fn propagate(
    built: &mut BuiltGraph,
    oracle: &mut dyn CallOracle,
    in_loop: &dyn Fn(IrBlockId) -> bool,
) -> PropagationTrace {
    let mut propagator = Propagator {
        graph: &mut built.graph,
        trace: PropagationTrace::default(),
    };
    propagator.snapshot("initial");

    // Sweep 1
    let mut roots: Vec<CnGNodeId> = built.global_seeds.clone();
    let mut returns = Vec::new();
    for id in propagator.graph.node_ids() {
        let node = propagator.graph.node(id);
        match node.kind {
            NodeKind::StaticField | NodeKind::CatchVal => roots.push(id),
            NodeKind::ExitVal if node.thrown => roots.push(id),
            NodeKind::ExitVal => returns.push(id),
            _ if node.state().is_global() => roots.push(id),
            _ => {}
        }
    }
    for call in &built.calls {
        let opaque = match call.target {
            CallTarget::Runtime => true,
            CallTarget::Direct(method) => oracle.is_opaque(method),
            CallTarget::Indirect(_) => false,
        };
        if opaque {
            roots.extend(call.args.iter().map(|(_, slot)| *slot));
        }
    }
    propagator.walk(roots, |g, id| {
        g.lower_state(id, EscState::GlobalEscape);
    });
    propagator.walk(returns, |g, id| {
        g.node_mut(id).out_escaped = true;
    });
    propagator.snapshot("globals");

    // Sweep 2
    let params: Vec<CnGNodeId> = propagator
        .graph
        .node_ids()
        .filter(|id| propagator.graph.node(*id).kind == NodeKind::DefArg)
        .collect();
    propagator.walk(params, |g, id| {
        if g.node(id).kind.is_object_like() {
            g.lower_state(id, EscState::GlobalEscape);
        } else {
            g.node_mut(id).out_escaped = true;
        }
    });
    propagator.snapshot("params");

    // Sweep 3
    for call in &built.calls {
        let slots: Vec<(usize, CnGNodeId)> = call.args.clone();
        match call.target {
            CallTarget::Runtime => {
                if let Some(result) = call.result {
                    propagator.graph.lower_state(result, EscState::GlobalEscape);
                }
            }
            CallTarget::Indirect(_) => {
                propagator.walk(slots.iter().map(|(_, s)| *s), |g, id| {
                    g.lower_state(id, EscState::ArgEscape);
                    g.node_mut(id).virtual_call = true;
                });
                if let Some(result) = call.result {
                    propagator.graph.lower_state(result, EscState::GlobalEscape);
                }
            }
            CallTarget::Direct(method) if oracle.is_opaque(method) => {
                if let Some(result) = call.result {
                    propagator.graph.lower_state(result, EscState::GlobalEscape);
                }
            }
            CallTarget::Direct(method) => match oracle.summary(method) {
                None => {
                    trace!("no summary for {}, arguments escape", method);
                    propagator.walk(slots.iter().map(|(_, s)| *s), |g, id| {
                        g.lower_state(id, EscState::GlobalEscape);
                    });
                    if let Some(result) = call.result {
                        propagator.graph.lower_state(result, EscState::GlobalEscape);
                    }
                }
                Some(summary) => {
                    for (position, slot) in slots {
                        let param = summary.param(position);
                        let state = match param {
                            Some(p) if !p.state.is_global() => EscState::ArgEscape,
                            _ => EscState::GlobalEscape,
                        };
                        let virtual_call = param.map(|p| p.virtual_call).unwrap_or(false);
                        propagator.walk([slot], |g, id| {
                            g.lower_state(id, state);
                            if virtual_call {
                                g.node_mut(id).virtual_call = true;
                            }
                        });
                        if let (Some(result), Some(p)) = (call.result, param) {
                            if p.returned {
                                propagator.graph.node_mut(result).caller_args.push(slot);
                            }
                        }
                    }
                    if let Some(result) = call.result {
                        if summary.return_state.is_global() {
                            propagator.graph.lower_state(result, EscState::GlobalEscape);
                        }
                    }
                }
            },
        }
    }
    propagator.snapshot("calls");

    // Sweep 4
    propagator.settle_slots();
    propagator.snapshot("fields");
    propagator.settle_aliases();
    propagator.snapshot("aliases");

    // Sweep 5
    for id in propagator.graph.node_ids().collect::<Vec<_>>() {
        let node = propagator.graph.node(id);
        if node.kind == NodeKind::Object {
            if let Some(def) = node.def {
                if in_loop(def.block) {
                    propagator.graph.node_mut(id).loop_created = true;
                }
            }
        }
    }

    propagator.trace
}

struct Propagator<'g> {
    graph: &'g mut ConnectionGraph,
    trace: PropagationTrace,
}

impl Propagator<'_> {
    fn snapshot(&mut self, sweep: &'static str) {
        self.trace.sweeps.push((sweep, self.graph.states()));
    }

    /// Depth-first walk over every edge kind from `roots`, visiting each node
    /// at most once
    fn walk(
        &mut self,
        roots: impl IntoIterator<Item = CnGNodeId>,
        mut visit: impl FnMut(&mut ConnectionGraph, CnGNodeId),
    ) {
        let mut visited = FxHashSet::default();
        let mut stack: Vec<CnGNodeId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            visit(self.graph, id);
            stack.extend(self.graph.edges_from(id).iter().map(|t| t.to));
        }
    }

    fn mark_out(&mut self, id: CnGNodeId) -> bool {
        let node = self.graph.node_mut(id);
        if node.out_escaped {
            false
        } else {
            node.out_escaped = true;
            true
        }
    }

    /// Push states from holders to what they hold until nothing changes
    fn settle_slots(&mut self) {
        loop {
            let mut changed = false;
            for id in self.graph.node_ids().collect::<Vec<_>>() {
                let edges = self.graph.edges_from(id).to_vec();
                for edge in edges {
                    let holder = self.graph.node(id);
                    let (state, out) = (holder.state(), holder.out_escaped);
                    match edge.kind {
                        EdgeKind::Field | EdgeKind::Defer => {
                            changed |= self.graph.lower_state(edge.to, state);
                            if out {
                                changed |= self.mark_out(edge.to);
                            }
                        }
                        // A loaded value is whatever its slot holds
                        EdgeKind::Point => {
                            let slot = self.graph.node(edge.to);
                            let (slot_state, slot_out) = (slot.state(), slot.out_escaped);
                            changed |= self.graph.lower_state(id, slot_state);
                            changed |= self.graph.lower_state(edge.to, state);
                            if slot_out {
                                changed |= self.mark_out(id);
                            }
                            if out {
                                changed |= self.mark_out(edge.to);
                            }
                        }
                    }
                }

                let node = self.graph.node(id);
                if node.kind == NodeKind::RetVal && !node.caller_args.is_empty() {
                    let args = node.caller_args.clone();
                    for arg in args {
                        let met = self
                            .graph
                            .node(id)
                            .state()
                            .meet(self.graph.node(arg).state());
                        changed |= self.graph.lower_state(id, met);
                        changed |= self.graph.lower_state(arg, met);
                        if self.graph.node(id).out_escaped {
                            changed |= self.mark_out(arg);
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Merges and casts take the meet of every value flowing into them
    fn settle_aliases(&mut self) {
        let aliases: Vec<CnGNodeId> = self
            .graph
            .node_ids()
            .filter(|id| {
                let node = self.graph.node(*id);
                node.kind == NodeKind::Local || node.is_rename()
            })
            .collect();
        loop {
            let mut changed = false;
            for &id in &aliases {
                let inputs: Vec<CnGNodeId> = self.graph.targets(id, EdgeKind::Defer).collect();
                for input in inputs {
                    let state = self.graph.node(input).state();
                    changed |= self.graph.lower_state(id, state);
                }
            }
            if !changed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::escape::cng::InstLoc;
    use crate::ir::escape::graph_builder::CallRecord;
    use crate::ir::escape::summary::ParamEscape;
    use crate::ir::{FieldId, FieldKey, MethodKey, RefKind};

    struct FixedOracle {
        summary: Option<Arc<CalleeMethodInfo>>,
        asked: usize,
    }

    impl CallOracle for FixedOracle {
        fn is_opaque(&self, method: MethodId) -> bool {
            method.0 == 99
        }

        fn summary(&mut self, _method: MethodId) -> Option<Arc<CalleeMethodInfo>> {
            self.asked += 1;
            self.summary.clone()
        }
    }

    fn no_loops(_: IrBlockId) -> bool {
        false
    }

    fn built(graph: ConnectionGraph, calls: Vec<CallRecord>) -> BuiltGraph {
        BuiltGraph {
            graph,
            calls,
            global_seeds: Vec::new(),
        }
    }

    fn call_with_arg(graph: &mut ConnectionGraph, target: CallTarget, value: CnGNodeId) -> CallRecord {
        let loc = InstLoc::new(IrBlockId::entry(), 7);
        let slot = graph.get_or_create_arg(loc, 0);
        graph.add_edge(slot, value, EdgeKind::Defer, None);
        CallRecord {
            loc,
            target,
            args: vec![(0, slot)],
            result: None,
        }
    }

    #[test]
    fn test_static_store_is_global_with_fields() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        let inner = g.add_node(NodeKind::Object, RefKind::Reference);
        let stat = g.get_or_create_field(FieldKey::Resolved(FieldId(0)), None, RefKind::Reference);
        let slot = g.get_or_create_field(FieldKey::Resolved(FieldId(1)), Some(obj), RefKind::Reference);
        g.add_edge(stat, obj, EdgeKind::Defer, None);
        g.add_edge(obj, slot, EdgeKind::Field, None);
        g.add_edge(slot, inner, EdgeKind::Defer, None);
        let mut b = built(g, vec![]);

        let mut oracle = FixedOracle { summary: None, asked: 0 };
        let trace = propagate(&mut b, &mut oracle, &no_loops);
        assert!(trace.is_monotone());
        assert!(b.graph.node(obj).state().is_global());
        assert!(b.graph.node(inner).state().is_global());
    }

    #[test]
    fn test_return_only_marks_out_escaped() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        let exit = g.add_node(NodeKind::ExitVal, RefKind::Reference);
        g.add_edge(exit, obj, EdgeKind::Defer, None);
        let mut b = built(g, vec![]);

        let mut oracle = FixedOracle { summary: None, asked: 0 };
        propagate(&mut b, &mut oracle, &no_loops);
        assert_eq!(b.graph.node(obj).state(), EscState::NoEscape);
        assert!(b.graph.node(obj).out_escaped);
    }

    #[test]
    fn test_thrown_value_is_global() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        let exit = g.add_node(NodeKind::ExitVal, RefKind::Reference);
        g.node_mut(exit).thrown = true;
        g.add_edge(exit, obj, EdgeKind::Defer, None);
        let mut b = built(g, vec![]);

        let mut oracle = FixedOracle { summary: None, asked: 0 };
        propagate(&mut b, &mut oracle, &no_loops);
        assert!(b.graph.node(obj).state().is_global());
    }

    #[test]
    fn test_virtual_call_never_consults_summary() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        let call = call_with_arg(&mut g, CallTarget::Indirect(MethodId(1)), obj);
        let mut b = built(g, vec![call]);

        let mut oracle = FixedOracle { summary: None, asked: 0 };
        propagate(&mut b, &mut oracle, &no_loops);
        assert_eq!(oracle.asked, 0);
        assert_eq!(b.graph.node(obj).state(), EscState::ArgEscape);
        assert!(b.graph.node(obj).virtual_call);
    }

    #[test]
    fn test_direct_call_adopts_summary() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        let call = call_with_arg(&mut g, CallTarget::Direct(MethodId(1)), obj);
        let mut b = built(g, vec![call]);

        let summary = CalleeMethodInfo {
            key: MethodKey::new("C", "m", "(C)V"),
            params: vec![ParamEscape {
                index: 0,
                state: EscState::NoEscape,
                returned: false,
                virtual_call: false,
            }],
            return_state: EscState::GlobalEscape,
            monitor_on_this: false,
        };
        let mut oracle = FixedOracle {
            summary: Some(Arc::new(summary)),
            asked: 0,
        };
        propagate(&mut b, &mut oracle, &no_loops);
        assert_eq!(oracle.asked, 1);
        assert_eq!(b.graph.node(obj).state(), EscState::ArgEscape);
        assert!(!b.graph.node(obj).virtual_call);
    }

    #[test]
    fn test_missing_summary_and_opaque_callee_are_global() {
        let mut g = ConnectionGraph::new();
        let a = g.add_node(NodeKind::Object, RefKind::Reference);
        let b_obj = g.add_node(NodeKind::Object, RefKind::Reference);
        let c1 = call_with_arg(&mut g, CallTarget::Direct(MethodId(1)), a);
        let mut c2 = call_with_arg(&mut g, CallTarget::Direct(MethodId(99)), b_obj);
        c2.loc = InstLoc::new(IrBlockId::entry(), 8);
        let mut b = built(g, vec![c1, c2]);

        let mut oracle = FixedOracle { summary: None, asked: 0 };
        propagate(&mut b, &mut oracle, &no_loops);
        assert!(b.graph.node(a).state().is_global());
        assert!(b.graph.node(b_obj).state().is_global());
    }

    #[test]
    fn test_merge_takes_meet_without_polluting_inputs() {
        let mut g = ConnectionGraph::new();
        let fresh = g.add_node(NodeKind::Object, RefKind::Reference);
        let global = g.add_node(NodeKind::Object, RefKind::Reference);
        g.lower_state(global, EscState::GlobalEscape);
        let phi = g.add_node(NodeKind::Local, RefKind::Reference);
        g.add_edge(phi, fresh, EdgeKind::Defer, None);
        g.add_edge(phi, global, EdgeKind::Defer, None);
        let mut b = built(g, vec![]);

        let mut oracle = FixedOracle { summary: None, asked: 0 };
        let trace = propagate(&mut b, &mut oracle, &no_loops);
        assert!(trace.is_monotone());
        assert!(b.graph.node(phi).state().is_global());
        assert_eq!(b.graph.node(fresh).state(), EscState::NoEscape);
    }

    #[test]
    fn test_loaded_value_inherits_slot_state() {
        let mut g = ConnectionGraph::new();
        let param = g.add_node(NodeKind::DefArg, RefKind::Reference);
        let slot = g.get_or_create_field(FieldKey::Resolved(FieldId(2)), Some(param), RefKind::Reference);
        let loaded = g.add_node(NodeKind::LdObj, RefKind::Reference);
        g.add_edge(param, slot, EdgeKind::Field, None);
        g.add_edge(loaded, slot, EdgeKind::Point, None);
        let holder = g.add_node(NodeKind::Object, RefKind::Reference);
        let holder_slot =
            g.get_or_create_field(FieldKey::Resolved(FieldId(3)), Some(holder), RefKind::Reference);
        g.add_edge(holder, holder_slot, EdgeKind::Field, None);
        let call = call_with_arg(&mut g, CallTarget::Indirect(MethodId(5)), holder);
        g.add_edge(holder_slot, loaded, EdgeKind::Defer, None);
        let mut b = built(g, vec![call]);

        let mut oracle = FixedOracle { summary: None, asked: 0 };
        let trace = propagate(&mut b, &mut oracle, &no_loops);
        assert!(trace.is_monotone());
        assert!(b.graph.node(loaded).out_escaped);
        // Reached through the holder passed to a virtual call
        assert!(b.graph.node(loaded).state() <= EscState::ArgEscape);
        assert!(b.graph.node(slot).state() <= EscState::ArgEscape);
    }

    #[test]
    fn test_loop_created_flag() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        g.node_mut(obj).def = Some(InstLoc::new(IrBlockId(3), 0));
        let mut b = built(g, vec![]);
        let mut oracle = FixedOracle { summary: None, asked: 0 };
        propagate(&mut b, &mut oracle, &|block| block == IrBlockId(3));
        assert!(b.graph.node(obj).loop_created);
    }
}
