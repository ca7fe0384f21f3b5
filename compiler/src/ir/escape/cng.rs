//! Connection graph
//!
//! Nodes and edges live in dense vectors owned by one graph and are addressed
//! by `CnGNodeId`. A graph is built for one method at one recursion depth and
//! dropped when that analysis completes.
//!
//! Edges run from a holder to what it may hold:
//! - `field -DEFER-> stored value`, `merge -DEFER-> input`,
//!   `actual arg -DEFER-> argument`, `exit -DEFER-> returned value`
//! - `loaded value -POINT-> field it was loaded from`
//! - `object -FIELD-> field slot`

use crate::ir::{FieldKey, IrBlockId, IrId, RefKind, VarId};
use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CnGNodeId(u32);

impl CnGNodeId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CnGNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Escape lattice. `GlobalEscape` is the absorbing bottom; states only ever
/// move down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscState {
    GlobalEscape = 1,
    ArgEscape = 2,
    NoEscape = 3,
}

impl EscState {
    pub fn meet(self, other: EscState) -> EscState {
        self.min(other)
    }

    pub fn is_global(self) -> bool {
        self == EscState::GlobalEscape
    }
}

impl fmt::Display for EscState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscState::GlobalEscape => "global",
            EscState::ArgEscape => "arg",
            EscState::NoEscape => "none",
        };
        f.write_str(s)
    }
}

/// Structural role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Result of `NewObj`, `NewArray` or a string literal
    Object,
    /// Result of a call
    RetVal,
    /// Reference loaded from memory, or a cast of another reference
    LdObj,
    /// Exception received by `Catch`
    CatchVal,
    StaticField,
    InstanceField,
    /// All elements of one array
    ArrayElem,
    /// Reference argument slot of one call site
    ActArg,
    /// Formal parameter
    DefArg,
    /// Value leaving the method through `Return` or `Throw`
    ExitVal,
    /// Phi or non-SSA variable merging other references
    Local,
}

impl NodeKind {
    pub fn is_object_like(self) -> bool {
        matches!(self, NodeKind::Object | NodeKind::RetVal | NodeKind::LdObj)
    }

    pub fn is_field(self) -> bool {
        matches!(
            self,
            NodeKind::StaticField | NodeKind::InstanceField | NodeKind::ArrayElem
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Object => "obj",
            NodeKind::RetVal => "retval",
            NodeKind::LdObj => "ldobj",
            NodeKind::CatchVal => "catch",
            NodeKind::StaticField => "static",
            NodeKind::InstanceField => "field",
            NodeKind::ArrayElem => "elem",
            NodeKind::ActArg => "actarg",
            NodeKind::DefArg => "defarg",
            NodeKind::ExitVal => "exit",
            NodeKind::Local => "local",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    Point,
    Defer,
    Field,
}

/// Position of an instruction. An index equal to the block's instruction
/// count denotes its terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstLoc {
    pub block: IrBlockId,
    pub index: usize,
}

impl InstLoc {
    pub fn new(block: IrBlockId, index: usize) -> Self {
        Self { block, index }
    }
}

#[derive(Debug, Clone)]
pub struct CnGNode {
    pub id: CnGNodeId,
    pub kind: NodeKind,
    pub ref_kind: RefKind,
    /// Register this node was created for, if any
    pub value: Option<IrId>,
    pub def: Option<InstLoc>,
    state: EscState,
    /// Leaves the method through a normal return
    pub out_escaped: bool,
    /// Reaches the receiver or an argument of a virtual call
    pub virtual_call: bool,
    /// Allocated inside a loop body
    pub loop_created: bool,
    /// Register renamed by a cast
    pub rename_of: Option<IrId>,
    origin: Option<CnGNodeId>,
    /// Caller argument slots whose value this call result may be
    pub caller_args: Vec<CnGNodeId>,
    pub field: Option<FieldKey>,
    /// Object owning this field or element slot
    pub base: Option<CnGNodeId>,
    /// Index into the builder's call records for actual args and call results
    pub call: Option<usize>,
    pub arg_index: Option<usize>,
    pub thrown: bool,
}

impl CnGNode {
    fn new(id: CnGNodeId, kind: NodeKind, ref_kind: RefKind) -> Self {
        Self {
            id,
            kind,
            ref_kind,
            value: None,
            def: None,
            state: EscState::NoEscape,
            out_escaped: false,
            virtual_call: false,
            loop_created: false,
            rename_of: None,
            origin: None,
            caller_args: Vec::new(),
            field: None,
            base: None,
            call: None,
            arg_index: None,
            thrown: false,
        }
    }

    pub fn state(&self) -> EscState {
        self.state
    }

    pub fn is_rename(&self) -> bool {
        self.rename_of.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeTarget {
    pub to: CnGNodeId,
    pub kind: EdgeKind,
    pub inst: Option<InstLoc>,
}

/// Outgoing edges of one node
#[derive(Debug, Clone)]
pub struct CnGEdge {
    pub from: CnGNodeId,
    pub targets: SmallVec<[EdgeTarget; 4]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FieldSlot {
    key: FieldKey,
    base: Option<CnGNodeId>,
}

#[derive(Debug, Default)]
pub struct ConnectionGraph {
    nodes: Vec<CnGNode>,
    edges: Vec<CnGEdge>,
    value_nodes: FxHashMap<IrId, CnGNodeId>,
    field_nodes: FxHashMap<FieldSlot, CnGNodeId>,
    elem_nodes: FxHashMap<CnGNodeId, CnGNodeId>,
    arg_nodes: FxHashMap<(InstLoc, usize), CnGNodeId>,
    var_nodes: FxHashMap<VarId, CnGNodeId>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, kind: NodeKind, ref_kind: RefKind) -> CnGNodeId {
        let id = CnGNodeId::new(self.nodes.len());
        self.nodes.push(CnGNode::new(id, kind, ref_kind));
        self.edges.push(CnGEdge {
            from: id,
            targets: SmallVec::new(),
        });
        id
    }

    pub fn node(&self, id: CnGNodeId) -> &CnGNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: CnGNodeId) -> &mut CnGNode {
        &mut self.nodes[id.index()]
    }

    pub fn nodes(&self) -> &[CnGNode] {
        &self.nodes
    }

    pub fn node_ids(&self) -> impl Iterator<Item = CnGNodeId> {
        (0..self.nodes.len()).map(CnGNodeId::new)
    }

    /// Make `value` name `node`. Copies share the node of their source.
    pub fn bind_value(&mut self, value: IrId, node: CnGNodeId) {
        self.value_nodes.insert(value, node);
    }

    pub fn node_of_value(&self, value: IrId) -> Option<CnGNodeId> {
        self.value_nodes.get(&value).copied()
    }

    /// Every register with a node, in register order
    pub fn values(&self) -> Vec<(IrId, CnGNodeId)> {
        let mut values: Vec<_> = self.value_nodes.iter().map(|(v, n)| (*v, *n)).collect();
        values.sort();
        values
    }

    /// Node for `key`, shared by every address computation of the same field
    /// on the same object. Static fields pass no base.
    pub fn get_or_create_field(
        &mut self,
        key: FieldKey,
        base: Option<CnGNodeId>,
        ref_kind: RefKind,
    ) -> CnGNodeId {
        let slot = FieldSlot {
            key: key.clone(),
            base,
        };
        if let Some(id) = self.field_nodes.get(&slot) {
            return *id;
        }
        let kind = if base.is_some() {
            NodeKind::InstanceField
        } else {
            NodeKind::StaticField
        };
        let id = self.add_node(kind, ref_kind);
        let node = self.node_mut(id);
        node.field = Some(key);
        node.base = base;
        if base.is_none() {
            node.state = EscState::GlobalEscape;
        }
        self.field_nodes.insert(slot, id);
        id
    }

    pub fn get_or_create_elem(&mut self, array: CnGNodeId, ref_kind: RefKind) -> CnGNodeId {
        if let Some(id) = self.elem_nodes.get(&array) {
            return *id;
        }
        let id = self.add_node(NodeKind::ArrayElem, ref_kind);
        self.node_mut(id).base = Some(array);
        self.elem_nodes.insert(array, id);
        id
    }

    pub fn get_or_create_arg(&mut self, call: InstLoc, index: usize) -> CnGNodeId {
        if let Some(id) = self.arg_nodes.get(&(call, index)) {
            return *id;
        }
        let id = self.add_node(NodeKind::ActArg, RefKind::Reference);
        let node = self.node_mut(id);
        node.def = Some(call);
        node.arg_index = Some(index);
        self.arg_nodes.insert((call, index), id);
        id
    }

    pub fn get_or_create_var(&mut self, var: VarId, ref_kind: RefKind) -> CnGNodeId {
        if let Some(id) = self.var_nodes.get(&var) {
            return *id;
        }
        let id = self.add_node(NodeKind::Local, ref_kind);
        self.var_nodes.insert(var, id);
        id
    }

    /// Add `from -> to`. Self loops are dropped. Field slots and actual args
    /// keep at most one edge of each kind to the same target, and so does
    /// every edge into a field slot.
    pub fn add_edge(
        &mut self,
        from: CnGNodeId,
        to: CnGNodeId,
        kind: EdgeKind,
        inst: Option<InstLoc>,
    ) -> bool {
        if from == to {
            return false;
        }
        let from_kind = self.node(from).kind;
        let set_like = kind == EdgeKind::Field
            || from_kind.is_field()
            || from_kind == NodeKind::ActArg
            || self.node(to).kind.is_field();
        let edge = &mut self.edges[from.index()];
        if set_like && edge.targets.iter().any(|t| t.to == to && t.kind == kind) {
            return false;
        }
        edge.targets.push(EdgeTarget { to, kind, inst });
        true
    }

    pub fn edges_from(&self, id: CnGNodeId) -> &[EdgeTarget] {
        &self.edges[id.index()].targets
    }

    pub fn edge(&self, id: CnGNodeId) -> &CnGEdge {
        &self.edges[id.index()]
    }

    pub fn targets(&self, id: CnGNodeId, kind: EdgeKind) -> impl Iterator<Item = CnGNodeId> + '_ {
        self.edges_from(id)
            .iter()
            .filter(move |t| t.kind == kind)
            .map(|t| t.to)
    }

    /// Field and element slots of an object
    pub fn field_targets(&self, id: CnGNodeId) -> Vec<CnGNodeId> {
        self.targets(id, EdgeKind::Field).collect()
    }

    /// Lower the state of `id` to `state` if that is worse; returns whether
    /// anything changed
    pub fn lower_state(&mut self, id: CnGNodeId, state: EscState) -> bool {
        let node = &mut self.nodes[id.index()];
        if state < node.state {
            log::trace!("{} {} {} -> {}", id, node.kind, node.state, state);
            node.state = state;
            true
        } else {
            false
        }
    }

    /// Node a cast ultimately renames, following chains of casts. Non-cast
    /// nodes are their own origin. The result is cached on first lookup.
    pub fn resolve_origin(&mut self, id: CnGNodeId) -> Option<CnGNodeId> {
        let mut chain = Vec::new();
        let mut current = id;
        let mut seen = FxHashSet::default();
        let origin = loop {
            let node = self.node(current);
            if let Some(origin) = node.origin {
                break origin;
            }
            let Some(src) = node.rename_of else {
                break current;
            };
            if !seen.insert(current) {
                return None;
            }
            chain.push(current);
            current = self.node_of_value(src)?;
        };
        for renamed in chain {
            self.nodes[renamed.index()].origin = Some(origin);
        }
        Some(origin)
    }

    /// Origin of a node without filling the cache
    pub fn origin_of(&self, id: CnGNodeId) -> CnGNodeId {
        let mut current = id;
        for _ in 0..self.nodes.len() {
            let node = self.node(current);
            if let Some(origin) = node.origin {
                return origin;
            }
            match node.rename_of.and_then(|src| self.node_of_value(src)) {
                Some(next) if next != current => current = next,
                _ => return current,
            }
        }
        current
    }

    /// Loaded object a merge or cast stands for, when every value flowing into
    /// it comes from that single load
    pub fn load_origin(&self, id: CnGNodeId) -> Option<CnGNodeId> {
        let mut found = None;
        let mut visited = FxHashSet::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let node = self.node(current);
            let is_alias = node.kind == NodeKind::Local || node.is_rename();
            if !is_alias {
                if node.kind != NodeKind::LdObj {
                    return None;
                }
                match found {
                    Some(prev) if prev != current => return None,
                    _ => found = Some(current),
                }
                continue;
            }
            stack.extend(self.targets(current, EdgeKind::Defer));
        }
        found
    }

    /// Snapshot of every node's state, in node order
    pub fn states(&self) -> Vec<EscState> {
        self.nodes.iter().map(|n| n.state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FieldId;

    #[test]
    fn test_meet_moves_toward_global() {
        assert_eq!(EscState::NoEscape.meet(EscState::ArgEscape), EscState::ArgEscape);
        assert_eq!(EscState::ArgEscape.meet(EscState::GlobalEscape), EscState::GlobalEscape);
        assert_eq!(EscState::GlobalEscape.meet(EscState::NoEscape), EscState::GlobalEscape);
        assert!(EscState::GlobalEscape < EscState::ArgEscape);
    }

    #[test]
    fn test_lower_state_is_monotone() {
        let mut g = ConnectionGraph::new();
        let n = g.add_node(NodeKind::Object, RefKind::Reference);
        assert!(g.lower_state(n, EscState::ArgEscape));
        assert!(!g.lower_state(n, EscState::NoEscape));
        assert_eq!(g.node(n).state(), EscState::ArgEscape);
        assert!(g.lower_state(n, EscState::GlobalEscape));
        assert!(!g.lower_state(n, EscState::ArgEscape));
    }

    #[test]
    fn test_field_nodes_are_shared_per_object() {
        let mut g = ConnectionGraph::new();
        let a = g.add_node(NodeKind::Object, RefKind::Reference);
        let b = g.add_node(NodeKind::Object, RefKind::Reference);
        let key = FieldKey::Resolved(FieldId(0));
        let fa = g.get_or_create_field(key.clone(), Some(a), RefKind::Primitive);
        assert_eq!(g.get_or_create_field(key.clone(), Some(a), RefKind::Primitive), fa);
        assert_ne!(g.get_or_create_field(key.clone(), Some(b), RefKind::Primitive), fa);

        let s1 = g.get_or_create_field(key.clone(), None, RefKind::Reference);
        let s2 = g.get_or_create_field(key, None, RefKind::Reference);
        assert_eq!(s1, s2);
        assert_eq!(g.node(s1).kind, NodeKind::StaticField);
        assert!(g.node(s1).state().is_global());

        let unresolved = FieldKey::Unresolved {
            class_name: "C".into(),
            name: "f".into(),
        };
        assert_ne!(g.get_or_create_field(unresolved, Some(a), RefKind::Primitive), fa);
    }

    #[test]
    fn test_edge_dedup_rules() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        let val = g.add_node(NodeKind::Object, RefKind::Reference);
        let local = g.add_node(NodeKind::Local, RefKind::Reference);
        let field = g.get_or_create_field(FieldKey::Resolved(FieldId(1)), Some(obj), RefKind::Reference);

        assert!(g.add_edge(obj, field, EdgeKind::Field, None));
        assert!(!g.add_edge(obj, field, EdgeKind::Field, None));
        assert!(g.add_edge(field, val, EdgeKind::Defer, None));
        assert!(!g.add_edge(field, val, EdgeKind::Defer, None));
        assert!(g.add_edge(val, field, EdgeKind::Defer, None));
        assert!(!g.add_edge(val, field, EdgeKind::Defer, None));
        assert!(!g.add_edge(local, local, EdgeKind::Defer, None));
        assert!(g.add_edge(local, val, EdgeKind::Defer, None));
        assert!(g.add_edge(local, val, EdgeKind::Defer, None));
        assert_eq!(g.edges_from(local).len(), 2);
    }

    #[test]
    fn test_resolve_origin_follows_cast_chain() {
        let mut g = ConnectionGraph::new();
        let obj = g.add_node(NodeKind::Object, RefKind::Reference);
        g.bind_value(IrId::new(1), obj);
        let c1 = g.add_node(NodeKind::LdObj, RefKind::Reference);
        g.node_mut(c1).rename_of = Some(IrId::new(1));
        g.bind_value(IrId::new(2), c1);
        let c2 = g.add_node(NodeKind::LdObj, RefKind::Reference);
        g.node_mut(c2).rename_of = Some(IrId::new(2));

        assert_eq!(g.origin_of(c2), obj);
        assert_eq!(g.resolve_origin(c2), Some(obj));
        assert_eq!(g.resolve_origin(c1), Some(obj));
        assert_eq!(g.resolve_origin(obj), Some(obj));

        let dangling = g.add_node(NodeKind::LdObj, RefKind::Reference);
        g.node_mut(dangling).rename_of = Some(IrId::new(99));
        assert_eq!(g.resolve_origin(dangling), None);
    }

    #[test]
    fn test_load_origin_through_merges() {
        let mut g = ConnectionGraph::new();
        let load = g.add_node(NodeKind::LdObj, RefKind::Reference);
        let other = g.add_node(NodeKind::LdObj, RefKind::Reference);
        let phi = g.add_node(NodeKind::Local, RefKind::Reference);
        g.add_edge(phi, load, EdgeKind::Defer, None);
        assert_eq!(g.load_origin(phi), Some(load));
        g.add_edge(phi, other, EdgeKind::Defer, None);
        assert_eq!(g.load_origin(phi), None);
    }
}
