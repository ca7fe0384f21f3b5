//! Connection graph construction
//!
//! Two passes over the reachable blocks in reverse postorder. The first pass
//! creates a node for every instruction producing a tracked reference and for
//! every field slot, argument slot and exit value; the second replays the same
//! instructions and adds the edges, once both endpoints exist.
//!
//! Null constants are not tracked. Stores and loads through an address whose
//! base is untracked make the stored or loaded value a global seed.

use super::cng::{CnGNodeId, ConnectionGraph, EdgeKind, EscState, InstLoc, NodeKind};
use super::error::{EscapeError, EscapeResult};
use crate::ir::{
    IrBlockId, IrFunction, IrId, IrInstruction, IrTerminator, IrType, IrValue, MethodId, RefKind,
    TypeRegistry, VmHelper,
};
use fxhash::{FxHashMap, FxHashSet};
use log::debug;

/// What a call site calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Direct(MethodId),
    /// Virtual call; the id is the declared target
    Indirect(MethodId),
    /// Runtime helper, treated as native code
    Runtime,
}

/// One call site with reference arguments or a reference result
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub loc: InstLoc,
    pub target: CallTarget,
    /// (argument position, actual-arg node)
    pub args: Vec<(usize, CnGNodeId)>,
    pub result: Option<CnGNodeId>,
}

#[derive(Debug)]
pub struct BuiltGraph {
    pub graph: ConnectionGraph,
    pub calls: Vec<CallRecord>,
    /// Nodes that escape globally for reasons only the builder sees
    pub global_seeds: Vec<CnGNodeId>,
}

/// Build the connection graph of `function`
pub fn build_graph(function: &IrFunction, registry: &TypeRegistry) -> EscapeResult<BuiltGraph> {
    let order = function.cfg.reverse_postorder();
    let mut builder = GraphBuilder {
        function,
        registry,
        reachable: order.iter().copied().collect(),
        graph: ConnectionGraph::new(),
        calls: Vec::new(),
        call_index: FxHashMap::default(),
        global_seeds: Vec::new(),
        untracked: FxHashSet::default(),
        addresses: FxHashMap::default(),
        untracked_addresses: FxHashSet::default(),
        exits: FxHashMap::default(),
    };

    for &block in &order {
        builder.create_nodes(block)?;
    }
    for &block in &order {
        builder.connect(block)?;
    }

    debug!(
        "connection graph of {}: {} nodes, {} calls, {} global seeds",
        function.name,
        builder.graph.len(),
        builder.calls.len(),
        builder.global_seeds.len()
    );

    Ok(BuiltGraph {
        graph: builder.graph,
        calls: builder.calls,
        global_seeds: builder.global_seeds,
    })
}

struct GraphBuilder<'a> {
    function: &'a IrFunction,
    registry: &'a TypeRegistry,
    reachable: FxHashSet<IrBlockId>,
    graph: ConnectionGraph,
    calls: Vec<CallRecord>,
    call_index: FxHashMap<InstLoc, usize>,
    global_seeds: Vec<CnGNodeId>,
    /// Null constants and copies or casts of them
    untracked: FxHashSet<IrId>,
    /// Address register -> field or element node
    addresses: FxHashMap<IrId, CnGNodeId>,
    untracked_addresses: FxHashSet<IrId>,
    exits: FxHashMap<IrBlockId, CnGNodeId>,
}

impl GraphBuilder<'_> {
    fn failure(&self, context: String) -> EscapeError {
        EscapeError::failure(self.function.name.clone(), context)
    }

    fn is_ref(&self, value: IrId) -> bool {
        self.function.is_reference(value)
    }

    fn var_is_ref(&self, var: crate::ir::VarId) -> EscapeResult<bool> {
        self.function
            .vars
            .get(&var)
            .map(|v| v.ty.is_reference())
            .ok_or_else(|| self.failure(format!("unknown variable {}", var)))
    }

    /// Node of a reference operand. `None` for untracked values; a reference
    /// with neither is an internal error.
    fn lookup(&self, value: IrId, loc: InstLoc) -> EscapeResult<Option<CnGNodeId>> {
        if let Some(node) = self.graph.node_of_value(value) {
            return Ok(Some(node));
        }
        if self.untracked.contains(&value) {
            return Ok(None);
        }
        Err(self.failure(format!(
            "no connection graph node for {} used at {}:{}",
            value, loc.block, loc.index
        )))
    }

    fn value_node(&mut self, kind: NodeKind, ref_kind: RefKind, value: IrId, loc: InstLoc) -> CnGNodeId {
        let id = self.graph.add_node(kind, ref_kind);
        let node = self.graph.node_mut(id);
        node.value = Some(value);
        node.def = Some(loc);
        self.graph.bind_value(value, id);
        id
    }

    fn ref_kind_of(&self, value: IrId) -> RefKind {
        self.function
            .value_type(value)
            .map(IrType::ref_kind)
            .unwrap_or(RefKind::Reference)
    }

    // === Pass 1: nodes ===

    fn create_nodes(&mut self, block_id: IrBlockId) -> EscapeResult<()> {
        let function = self.function;
        let Some(block) = function.cfg.get_block(block_id) else {
            return Ok(());
        };

        for phi in &block.phi_nodes {
            if phi.ty.is_reference() {
                let loc = InstLoc::new(block_id, 0);
                let id = self.value_node(NodeKind::Local, phi.ty.ref_kind(), phi.dest, loc);
                self.graph.node_mut(id).def = None;
            }
        }

        for (index, inst) in block.instructions.iter().enumerate() {
            self.create_for_instruction(InstLoc::new(block_id, index), inst)?;
        }

        let loc = InstLoc::new(block_id, block.instructions.len());
        let exit = match &block.terminator {
            IrTerminator::Return { value: Some(v) } if self.is_ref(*v) => Some(false),
            IrTerminator::Throw { .. } => Some(true),
            _ => None,
        };
        if let Some(thrown) = exit {
            let id = self.graph.add_node(NodeKind::ExitVal, RefKind::Reference);
            let node = self.graph.node_mut(id);
            node.def = Some(loc);
            node.thrown = thrown;
            self.exits.insert(block_id, id);
        }
        Ok(())
    }

    fn create_for_instruction(&mut self, loc: InstLoc, inst: &IrInstruction) -> EscapeResult<()> {
        match inst {
            IrInstruction::Const { dest, value } => match value {
                IrValue::Null => {
                    self.untracked.insert(*dest);
                }
                IrValue::String(_) => {
                    let id = self.value_node(NodeKind::Object, RefKind::Reference, *dest, loc);
                    self.graph.lower_state(id, EscState::GlobalEscape);
                }
                _ => {}
            },

            IrInstruction::Copy { dest, src } => {
                if self.is_ref(*src) || self.is_ref(*dest) {
                    match self.lookup(*src, loc)? {
                        Some(node) => self.graph.bind_value(*dest, node),
                        None => {
                            self.untracked.insert(*dest);
                        }
                    }
                }
            }

            IrInstruction::DefArg { dest, index } => {
                if self.is_ref(*dest) {
                    let id = self.value_node(NodeKind::DefArg, self.ref_kind_of(*dest), *dest, loc);
                    self.graph.node_mut(id).arg_index = Some(*index as usize);
                }
            }

            IrInstruction::BinOp { .. } | IrInstruction::Cmp { .. } => {}

            IrInstruction::NewObj { dest, class } => {
                let id = self.value_node(NodeKind::Object, RefKind::Reference, *dest, loc);
                if !self.registry.is_class_resolved(*class) || self.registry.is_class_finalizable(*class) {
                    debug!("{} allocates unresolved or finalizable class {}", dest, class);
                    self.graph.lower_state(id, EscState::GlobalEscape);
                }
            }

            IrInstruction::NewArray { dest, elem, .. } => {
                let ref_kind = IrType::array_of(elem.clone()).ref_kind();
                self.value_node(NodeKind::Object, ref_kind, *dest, loc);
            }

            IrInstruction::LdFieldAddr { dest, base, field } => {
                let Some(base_node) = self.lookup(*base, loc)? else {
                    self.untracked_addresses.insert(*dest);
                    return Ok(());
                };
                let desc = self
                    .registry
                    .field(*field)
                    .ok_or_else(|| self.failure(format!("unknown field {}", field)))?;
                let ref_kind = desc.ty.ref_kind();
                let key = self.registry.field_key(*field);
                let id = self.graph.get_or_create_field(key, Some(base_node), ref_kind);
                self.graph.node_mut(id).def.get_or_insert(loc);
                self.addresses.insert(*dest, id);
            }

            IrInstruction::LdStaticAddr { dest, field } => {
                let desc = self
                    .registry
                    .field(*field)
                    .ok_or_else(|| self.failure(format!("unknown field {}", field)))?;
                let ref_kind = desc.ty.ref_kind();
                let key = self.registry.field_key(*field);
                let id = self.graph.get_or_create_field(key, None, ref_kind);
                self.graph.node_mut(id).def.get_or_insert(loc);
                self.addresses.insert(*dest, id);
            }

            IrInstruction::LdElemAddr { dest, array, .. } => {
                let Some(array_node) = self.lookup(*array, loc)? else {
                    self.untracked_addresses.insert(*dest);
                    return Ok(());
                };
                let ref_kind = self
                    .function
                    .value_type(*array)
                    .and_then(IrType::array_element)
                    .map(IrType::ref_kind)
                    .unwrap_or(RefKind::Reference);
                let id = self.graph.get_or_create_elem(array_node, ref_kind);
                self.graph.node_mut(id).def.get_or_insert(loc);
                self.addresses.insert(*dest, id);
            }

            IrInstruction::LdInd { dest, addr, ty } => {
                if ty.is_reference() {
                    let id = self.value_node(NodeKind::LdObj, ty.ref_kind(), *dest, loc);
                    if self.untracked_addresses.contains(addr) {
                        self.global_seeds.push(id);
                    }
                }
            }

            IrInstruction::StInd { .. } => {}

            IrInstruction::LdVar { dest, var } => {
                if self.var_is_ref(*var)? {
                    let id = self.graph.get_or_create_var(*var, self.ref_kind_of(*dest));
                    self.graph.bind_value(*dest, id);
                }
            }

            IrInstruction::StVar { var, src } => {
                if self.var_is_ref(*var)? {
                    self.graph.get_or_create_var(*var, self.ref_kind_of(*src));
                }
            }

            IrInstruction::Cast { dest, src, ty } | IrInstruction::CheckCast { dest, src, ty } => {
                if ty.is_reference() || self.is_ref(*src) {
                    if self.untracked.contains(src) {
                        self.untracked.insert(*dest);
                    } else {
                        let id = self.value_node(NodeKind::LdObj, ty.ref_kind(), *dest, loc);
                        self.graph.node_mut(id).rename_of = Some(*src);
                    }
                }
            }

            IrInstruction::CheckNull { .. } => {}

            IrInstruction::DirectCall { dest, method, args } => {
                self.record_call(loc, CallTarget::Direct(*method), args, *dest);
            }
            IrInstruction::IndirectCall { dest, method, args } => {
                self.record_call(loc, CallTarget::Indirect(*method), args, *dest);
            }
            IrInstruction::VmHelperCall { dest, helper, args } => match helper {
                // Lock flag helpers only see primitives and the receiver,
                // which they never retain
                VmHelper::LoadThisLockFlag | VmHelper::SaveThisLockFlag => {}
                VmHelper::Runtime(_) => self.record_call(loc, CallTarget::Runtime, args, *dest),
            },

            IrInstruction::Catch { dest, ty } => {
                if ty.is_reference() {
                    let id = self.value_node(NodeKind::CatchVal, ty.ref_kind(), *dest, loc);
                    self.graph.lower_state(id, EscState::GlobalEscape);
                }
            }

            IrInstruction::MonitorEnter { .. }
            | IrInstruction::MonitorExit { .. }
            | IrInstruction::MethodMarker { .. } => {}

            IrInstruction::Intrinsic { dest, name, .. } => {
                if let Some(dest) = dest {
                    if self.is_ref(*dest) {
                        return Err(self.failure(format!(
                            "intrinsic `{}` produces reference {} the analysis cannot model",
                            name, dest
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn record_call(&mut self, loc: InstLoc, target: CallTarget, args: &[IrId], dest: Option<IrId>) {
        let index = self.calls.len();
        let mut arg_nodes = Vec::new();
        for (position, arg) in args.iter().enumerate() {
            if !self.is_ref(*arg) || self.untracked.contains(arg) {
                continue;
            }
            let id = self.graph.get_or_create_arg(loc, position);
            self.graph.node_mut(id).call = Some(index);
            arg_nodes.push((position, id));
        }
        let result = dest.filter(|d| self.is_ref(*d)).map(|d| {
            let id = self.value_node(NodeKind::RetVal, self.ref_kind_of(d), d, loc);
            self.graph.node_mut(id).call = Some(index);
            id
        });
        self.calls.push(CallRecord {
            loc,
            target,
            args: arg_nodes,
            result,
        });
        self.call_index.insert(loc, index);
    }

    // === Pass 2: edges ===

    fn connect(&mut self, block_id: IrBlockId) -> EscapeResult<()> {
        let function = self.function;
        let Some(block) = function.cfg.get_block(block_id) else {
            return Ok(());
        };

        for phi in &block.phi_nodes {
            let Some(merge) = self.graph.node_of_value(phi.dest) else {
                continue;
            };
            let loc = InstLoc::new(block_id, 0);
            for (pred, input) in &phi.incoming {
                if !self.reachable.contains(pred) {
                    continue;
                }
                if let Some(node) = self.lookup(*input, loc)? {
                    self.graph.add_edge(merge, node, EdgeKind::Defer, None);
                }
            }
        }

        for (index, inst) in block.instructions.iter().enumerate() {
            self.connect_instruction(InstLoc::new(block_id, index), inst)?;
        }

        if let Some(exit) = self.exits.get(&block_id).copied() {
            let loc = InstLoc::new(block_id, block.instructions.len());
            let value = match &block.terminator {
                IrTerminator::Return { value: Some(v) } => Some(*v),
                IrTerminator::Throw { exception } => Some(*exception),
                _ => None,
            };
            if let Some(value) = value {
                if let Some(node) = self.lookup(value, loc)? {
                    self.graph.add_edge(exit, node, EdgeKind::Defer, Some(loc));
                }
            }
        }
        Ok(())
    }

    fn connect_instruction(&mut self, loc: InstLoc, inst: &IrInstruction) -> EscapeResult<()> {
        match inst {
            IrInstruction::StInd { addr, value } => {
                if !self.is_ref(*value) {
                    return Ok(());
                }
                let Some(stored) = self.lookup(*value, loc)? else {
                    return Ok(());
                };
                match self.addresses.get(addr).copied() {
                    Some(slot) => {
                        if !self.graph.node(slot).ref_kind.is_reference() {
                            return Err(self.failure(format!(
                                "reference {} stored into primitive slot {} at {}:{}",
                                value, slot, loc.block, loc.index
                            )));
                        }
                        self.graph.add_edge(slot, stored, EdgeKind::Defer, Some(loc));
                    }
                    None if self.untracked_addresses.contains(addr) => {
                        self.global_seeds.push(stored);
                    }
                    None => {
                        return Err(self.failure(format!("store through unknown address {}", addr)));
                    }
                }
            }

            IrInstruction::LdInd { dest, addr, ty } if ty.is_reference() => {
                let Some(loaded) = self.graph.node_of_value(*dest) else {
                    return Err(self.failure(format!("load {} has no node", dest)));
                };
                match self.addresses.get(addr).copied() {
                    Some(slot) => {
                        self.graph.add_edge(loaded, slot, EdgeKind::Point, Some(loc));
                    }
                    None if self.untracked_addresses.contains(addr) => {}
                    None => {
                        return Err(self.failure(format!("load through unknown address {}", addr)));
                    }
                }
            }

            IrInstruction::LdFieldAddr { dest, field, .. } => {
                if let Some(slot) = self.addresses.get(dest).copied() {
                    if let Some(base) = self.graph.node(slot).base {
                        // The backing array of a string is the string itself
                        let kind = if self.registry.is_string_value_field(*field) {
                            EdgeKind::Defer
                        } else {
                            EdgeKind::Field
                        };
                        self.graph.add_edge(base, slot, kind, Some(loc));
                    }
                }
            }

            IrInstruction::LdElemAddr { dest, .. } => {
                if let Some(slot) = self.addresses.get(dest).copied() {
                    if let Some(base) = self.graph.node(slot).base {
                        self.graph.add_edge(base, slot, EdgeKind::Field, Some(loc));
                    }
                }
            }

            IrInstruction::StVar { var, src } => {
                if self.var_is_ref(*var)? {
                    let var_node = self.graph.get_or_create_var(*var, self.ref_kind_of(*src));
                    if let Some(node) = self.lookup(*src, loc)? {
                        self.graph.add_edge(var_node, node, EdgeKind::Defer, Some(loc));
                    }
                }
            }

            IrInstruction::Cast { dest, .. } | IrInstruction::CheckCast { dest, .. } => {
                if let Some(cast) = self.graph.node_of_value(*dest) {
                    if self.graph.node(cast).is_rename() {
                        let origin = self.graph.resolve_origin(cast).ok_or_else(|| {
                            self.failure(format!("cannot resolve the origin of cast {}", dest))
                        })?;
                        self.graph.add_edge(cast, origin, EdgeKind::Defer, Some(loc));
                    }
                }
            }

            IrInstruction::DirectCall { args, .. }
            | IrInstruction::IndirectCall { args, .. }
            | IrInstruction::VmHelperCall { args, .. } => {
                if let Some(index) = self.call_index.get(&loc).copied() {
                    let slots = self.calls[index].args.clone();
                    for (position, slot) in slots {
                        if let Some(node) = self.lookup(args[position], loc)? {
                            self.graph.add_edge(slot, node, EdgeKind::Defer, Some(loc));
                        }
                    }
                }
            }

            IrInstruction::Intrinsic { args, .. } => {
                for arg in args {
                    if self.is_ref(*arg) {
                        if let Some(node) = self.lookup(*arg, loc)? {
                            self.global_seeds.push(node);
                        }
                    }
                }
            }

            IrInstruction::MonitorEnter { obj, .. }
            | IrInstruction::MonitorExit { obj, .. }
            | IrInstruction::CheckNull { obj } => {
                self.lookup(*obj, loc)?;
            }

            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, IrType, MethodFlags};

    #[test]
    fn test_store_and_load_edges() {
        let mut builder = IrBuilder::new("cng");
        let point = builder.registry_mut().add_class("Point");
        let holder = builder.registry_mut().add_class("Holder");
        let next = builder
            .registry_mut()
            .add_field(holder, "next", IrType::Object(point), false);
        let m = builder.registry_mut().add_method(
            holder,
            "run",
            vec![],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let h = builder.build_new_obj(holder).unwrap();
        let p = builder.build_new_obj(point).unwrap();
        builder.build_put_field(h, next, p).unwrap();
        let loaded = builder.build_get_field(h, next).unwrap();
        builder.build_return(None).unwrap();
        builder.finish_function();
        let module = builder.finish();
        let function = module.get_function(m).unwrap();

        let built = build_graph(function, &module.registry).unwrap();
        let g = &built.graph;
        let hn = g.node_of_value(h).unwrap();
        let pn = g.node_of_value(p).unwrap();
        let ln = g.node_of_value(loaded).unwrap();
        assert_eq!(g.node(ln).kind, NodeKind::LdObj);

        // Both address computations share one field node
        let fields = g.field_targets(hn);
        assert_eq!(fields.len(), 1);
        let field = fields[0];
        assert_eq!(g.targets(field, EdgeKind::Defer).collect::<Vec<_>>(), vec![pn]);
        assert_eq!(g.targets(ln, EdgeKind::Point).collect::<Vec<_>>(), vec![field]);
        assert!(built.global_seeds.is_empty());
    }

    #[test]
    fn test_calls_create_arg_slots_and_results() {
        let mut builder = IrBuilder::new("cng");
        let class = builder.registry_mut().add_class("C");
        let callee = builder.registry_mut().add_method(
            class,
            "id",
            vec![IrType::Object(class)],
            IrType::Object(class),
            MethodFlags::static_method(),
        );
        let m = builder.registry_mut().add_method(
            class,
            "run",
            vec![],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let obj = builder.build_new_obj(class).unwrap();
        let result = builder.build_call(callee, vec![obj]).unwrap().unwrap();
        builder.build_return(None).unwrap();
        builder.finish_function();
        let module = builder.finish();

        let built = build_graph(module.get_function(m).unwrap(), &module.registry).unwrap();
        assert_eq!(built.calls.len(), 1);
        let call = &built.calls[0];
        assert_eq!(call.target, CallTarget::Direct(callee));
        assert_eq!(call.args.len(), 1);
        let (position, slot) = call.args[0];
        assert_eq!(position, 0);
        assert_eq!(built.graph.node(slot).kind, NodeKind::ActArg);
        let objn = built.graph.node_of_value(obj).unwrap();
        assert_eq!(built.graph.targets(slot, EdgeKind::Defer).collect::<Vec<_>>(), vec![objn]);
        let ret = call.result.unwrap();
        assert_eq!(built.graph.node_of_value(result), Some(ret));
        assert_eq!(built.graph.node(ret).kind, NodeKind::RetVal);
    }

    #[test]
    fn test_unmodelled_reference_intrinsic_fails() {
        let mut builder = IrBuilder::new("cng");
        let class = builder.registry_mut().add_class("C");
        let m = builder.registry_mut().add_method(
            class,
            "run",
            vec![],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        builder
            .build_intrinsic("magic", vec![], Some(IrType::Object(class)))
            .unwrap();
        builder.build_return(None).unwrap();
        builder.finish_function();
        let module = builder.finish();

        let err = build_graph(module.get_function(m).unwrap(), &module.registry).unwrap_err();
        assert!(err.is_compiler_failure());
    }

    #[test]
    fn test_null_base_store_seeds_value() {
        let mut builder = IrBuilder::new("cng");
        let class = builder.registry_mut().add_class("C");
        let f = builder
            .registry_mut()
            .add_field(class, "f", IrType::Object(class), false);
        let m = builder.registry_mut().add_method(
            class,
            "run",
            vec![],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let null = builder.build_null().unwrap();
        let obj = builder.build_new_obj(class).unwrap();
        builder.build_put_field(null, f, obj).unwrap();
        builder.build_return(None).unwrap();
        builder.finish_function();
        let module = builder.finish();

        let built = build_graph(module.get_function(m).unwrap(), &module.registry).unwrap();
        assert_eq!(built.global_seeds, vec![built.graph.node_of_value(obj).unwrap()]);
    }

    #[test]
    fn test_string_value_address_defers_to_string() {
        let mut builder = IrBuilder::new("cng");
        let string = builder.registry_mut().add_class("String");
        let value = builder.registry_mut().add_field(
            string,
            "value",
            IrType::array_of(IrType::Char),
            true,
        );
        let m = builder.registry_mut().add_method(
            string,
            "chars",
            vec![],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let s = builder.build_new_obj(string).unwrap();
        builder.build_field_addr(s, value).unwrap();
        builder.build_field_addr(s, value).unwrap();
        builder.build_return(None).unwrap();
        builder.finish_function();
        let module = builder.finish();

        let built = build_graph(module.get_function(m).unwrap(), &module.registry).unwrap();
        let g = &built.graph;
        let sn = g.node_of_value(s).unwrap();
        assert!(g.field_targets(sn).is_empty());
        let deferred: Vec<_> = g.targets(sn, EdgeKind::Defer).collect();
        assert_eq!(deferred.len(), 1);
        assert_eq!(g.node(deferred[0]).kind, NodeKind::InstanceField);
        assert_eq!(g.edges_from(sn).len(), 1);
    }
}
