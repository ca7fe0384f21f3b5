//! Scalar replacement
//!
//! Allocations are rewritten in one of three ways, tried in order:
//! - an object that never escapes and never meets a call has its fields
//!   moved into method variables and the allocation disappears;
//! - an object only handed to direct calls lives in variables between the
//!   calls, and is materialized right before the first call that needs it;
//! - otherwise, final fields read repeatedly are read once and kept in a
//!   variable.
//!
//! The variables introduced here are left for SSA repair.

use super::cng::{CnGNode, CnGNodeId, ConnectionGraph, EdgeKind, EscState, NodeKind};
use super::error::{EscapeError, EscapeResult};
use super::monitors::aliases_of;
use super::options::EscapeOptions;
use crate::ir::loop_analysis::DominatorTree;
use crate::ir::{
    ClassId, DefSite, FieldId, IrBlockId, IrFunction, IrId, IrInstruction, IrTerminator, IrType,
    IrValue, TypeRegistry, VarId,
};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalarStats {
    /// Allocations removed outright
    pub local: usize,
    /// Allocations deferred to the calls receiving them
    pub escaped: usize,
    pub final_fields: usize,
    pub instructions_removed: usize,
}

impl ScalarStats {
    pub fn changed(&self) -> bool {
        self.local + self.escaped + self.final_fields > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Field(FieldId),
    Elem(i64),
}

#[derive(Debug, Clone)]
enum Allocation {
    Object(ClassId),
    Array { elem: IrType, len: Option<i64> },
}

/// A load or store of one slot. `value` is the loaded register or the
/// stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Access {
    block: IrBlockId,
    index: usize,
    value: IrId,
}

#[derive(Debug, Default)]
struct ObjectUses {
    addrs: BTreeMap<IrId, Slot>,
    loads: BTreeMap<Slot, Vec<Access>>,
    stores: BTreeMap<Slot, Vec<Access>>,
    /// Slots whose address is used by something other than a load or store
    leaked: BTreeSet<Slot>,
    calls: Vec<(IrBlockId, usize)>,
    null_checks: bool,
    /// The reference itself flows somewhere it must stay materialized
    pinned: bool,
}

impl ObjectUses {
    fn note(&mut self, value: IrId, aliases: &BTreeSet<IrId>) {
        if aliases.contains(&value) {
            self.pinned = true;
        }
        if let Some(slot) = self.addrs.get(&value) {
            self.leaked.insert(*slot);
        }
    }

    fn slots(&self) -> BTreeSet<Slot> {
        self.loads.keys().chain(self.stores.keys()).copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    /// The single store of the field
    Store,
    /// The first load of the field
    Load,
}

type SlotVars = BTreeMap<Slot, (VarId, IrType)>;

/// Apply scalar replacement to every allocation and loaded object in `graph`
pub fn replace_scalars(
    function: &mut IrFunction,
    graph: &ConnectionGraph,
    options: &EscapeOptions,
    registry: &TypeRegistry,
) -> EscapeResult<ScalarStats> {
    let mut stats = ScalarStats::default();
    let before = function.cfg.instruction_count();

    for node in graph.nodes() {
        let Some(value) = node.value else {
            continue;
        };
        match node.kind {
            NodeKind::Object => {
                let Some((alloc_block, alloc_index, alloc)) = allocation(function, value) else {
                    continue;
                };
                let aliases = aliases_of(graph, node.id);
                let uses = collect_uses(function, &aliases);

                if fully_local(node, &alloc, &uses, registry) {
                    replace_local(function, value, &alloc, &aliases, &uses, registry)?;
                    debug!("{}: {} replaced by scalars", function.name, value);
                    stats.local += 1;
                    continue;
                }
                if let Allocation::Object(class) = alloc {
                    if options.scalarize_escaped
                        && escaped_candidate(function, node, class, &uses, registry)
                        && !returned_by_call(graph, node.id)
                        && profitable(function, alloc_block, alloc_index, &uses, options.profit_ratio)
                    {
                        replace_escaped(function, value, class, &aliases, &uses, registry)?;
                        debug!("{}: {} materialized at its calls", function.name, value);
                        stats.escaped += 1;
                        continue;
                    }
                }
                if options.scalarize_final_fields {
                    stats.final_fields +=
                        cache_final_fields(function, value, &uses, Anchor::Store, options, registry);
                }
            }
            NodeKind::LdObj if !node.is_rename() && options.scalarize_final_fields => {
                let aliases = load_aliases(graph, node.id);
                let uses = collect_uses(function, &aliases);
                stats.final_fields +=
                    cache_final_fields(function, value, &uses, Anchor::Load, options, registry);
            }
            _ => {}
        }
    }

    stats.instructions_removed = before.saturating_sub(function.cfg.instruction_count());
    Ok(stats)
}

fn allocation(function: &IrFunction, value: IrId) -> Option<(IrBlockId, usize, Allocation)> {
    let DefSite::Inst { block, index } = function.locate_def(value)? else {
        return None;
    };
    let alloc = match function.cfg.get_block(block)?.instructions.get(index)? {
        IrInstruction::NewObj { class, .. } => Allocation::Object(*class),
        IrInstruction::NewArray { elem, len, .. } => Allocation::Array {
            elem: elem.clone(),
            len: function.constants().get(len).and_then(|v| v.as_i64()),
        },
        _ => return None,
    };
    Some((block, index, alloc))
}

/// Registers standing for the object loaded by `node`: casts of it and
/// merges fed by nothing else
fn load_aliases(graph: &ConnectionGraph, node: CnGNodeId) -> BTreeSet<IrId> {
    graph
        .values()
        .into_iter()
        .filter(|(_, n)| graph.origin_of(*n) == node || graph.load_origin(*n) == Some(node))
        .map(|(value, _)| value)
        .collect()
}

fn collect_uses(function: &IrFunction, aliases: &BTreeSet<IrId>) -> ObjectUses {
    let mut uses = ObjectUses::default();
    let constants = function.constants();

    for block in function.cfg.blocks.values() {
        for inst in &block.instructions {
            match inst {
                IrInstruction::LdFieldAddr { dest, base, field } if aliases.contains(base) => {
                    uses.addrs.insert(*dest, Slot::Field(*field));
                }
                IrInstruction::LdElemAddr { dest, array, index } if aliases.contains(array) => {
                    match constants.get(index).and_then(|v| v.as_i64()) {
                        Some(k) => {
                            uses.addrs.insert(*dest, Slot::Elem(k));
                        }
                        None => uses.pinned = true,
                    }
                }
                _ => {}
            }
        }
    }

    for (id, block) in &function.cfg.blocks {
        for phi in &block.phi_nodes {
            for (_, value) in &phi.incoming {
                uses.note(*value, aliases);
            }
        }
        for (index, inst) in block.instructions.iter().enumerate() {
            let at = |value| Access {
                block: *id,
                index,
                value,
            };
            match inst {
                IrInstruction::LdInd { dest, addr, .. } => {
                    if let Some(slot) = uses.addrs.get(addr).copied() {
                        uses.loads.entry(slot).or_default().push(at(*dest));
                        continue;
                    }
                }
                IrInstruction::StInd { addr, value } => {
                    if let Some(slot) = uses.addrs.get(addr).copied() {
                        uses.stores.entry(slot).or_default().push(at(*value));
                        uses.note(*value, aliases);
                        continue;
                    }
                }
                IrInstruction::LdFieldAddr { base, .. } if aliases.contains(base) => continue,
                IrInstruction::LdElemAddr { array, .. } if aliases.contains(array) => continue,
                IrInstruction::Copy { src, .. } | IrInstruction::Cast { src, .. }
                    if aliases.contains(src) =>
                {
                    continue
                }
                IrInstruction::CheckNull { obj } if aliases.contains(obj) => {
                    uses.null_checks = true;
                    continue;
                }
                IrInstruction::MethodMarker { obj: Some(obj), .. } if aliases.contains(obj) => {
                    continue
                }
                IrInstruction::DirectCall { args, .. } if args.iter().any(|a| aliases.contains(a)) => {
                    uses.calls.push((*id, index));
                    for arg in args {
                        if let Some(slot) = uses.addrs.get(arg).copied() {
                            uses.leaked.insert(slot);
                        }
                    }
                    continue;
                }
                _ => {}
            }
            for used in inst.uses() {
                uses.note(used, aliases);
            }
        }
        for used in block.terminator.uses() {
            uses.note(used, aliases);
        }
    }
    uses
}

fn fully_local(
    node: &CnGNode,
    alloc: &Allocation,
    uses: &ObjectUses,
    registry: &TypeRegistry,
) -> bool {
    if node.state().is_global() || node.virtual_call || uses.pinned {
        return false;
    }
    if !uses.calls.is_empty() || !uses.leaked.is_empty() {
        return false;
    }
    match alloc {
        Allocation::Object(class) => {
            !registry.is_class_finalizable(*class)
                && uses.slots().iter().all(|s| matches!(s, Slot::Field(_)))
        }
        // Arrays qualify when every access hits one in-bounds constant index
        Allocation::Array { len, .. } => {
            let slots = uses.slots();
            let Some(len) = len else {
                return false;
            };
            slots.len() <= 1
                && slots
                    .iter()
                    .all(|s| matches!(s, Slot::Elem(k) if *k >= 0 && k < len))
        }
    }
}

fn escaped_candidate(
    function: &IrFunction,
    node: &CnGNode,
    class: ClassId,
    uses: &ObjectUses,
    registry: &TypeRegistry,
) -> bool {
    node.state() == EscState::ArgEscape
        && !node.virtual_call
        && !node.out_escaped
        && !uses.pinned
        && uses.leaked.is_empty()
        && !uses.calls.is_empty()
        && !registry.is_class_finalizable(class)
        && uses.slots().iter().all(|s| matches!(s, Slot::Field(_)))
        && uses.calls.iter().all(|(block, _)| {
            function
                .cfg
                .get_block(*block)
                .map(|b| b.dispatch.is_none())
                .unwrap_or(false)
        })
}

/// Whether some call may hand `unit` back through its result. Writes through
/// that result would bypass the field variables.
fn returned_by_call(graph: &ConnectionGraph, unit: CnGNodeId) -> bool {
    graph
        .nodes()
        .iter()
        .filter(|n| n.kind == NodeKind::RetVal)
        .flat_map(|n| n.caller_args.iter())
        .flat_map(|slot| graph.targets(*slot, EdgeKind::Defer))
        .any(|arg| graph.origin_of(arg) == unit)
}

/// Whether exits reached from the allocation without passing a receiving
/// call carry at least `ratio` times the entry frequency
fn profitable(
    function: &IrFunction,
    alloc_block: IrBlockId,
    alloc_index: usize,
    uses: &ObjectUses,
    ratio: f64,
) -> bool {
    if ratio <= 0.0 {
        return true;
    }
    let call_blocks: BTreeSet<IrBlockId> = uses.calls.iter().map(|(b, _)| *b).collect();
    if uses
        .calls
        .iter()
        .any(|(b, i)| *b == alloc_block && *i > alloc_index)
    {
        return false;
    }

    let mut weight = 0.0;
    let mut seen = BTreeSet::from([alloc_block]);
    let mut queue = VecDeque::from([alloc_block]);
    while let Some(id) = queue.pop_front() {
        let Some(block) = function.cfg.get_block(id) else {
            continue;
        };
        if matches!(block.terminator, IrTerminator::Return { .. }) {
            weight += block.metadata.frequency;
        }
        for succ in block.successors() {
            if !call_blocks.contains(&succ) && seen.insert(succ) {
                queue.push_back(succ);
            }
        }
    }

    let entry = function
        .cfg
        .get_block(function.entry_block())
        .map(|b| b.metadata.frequency)
        .filter(|f| *f > 0.0)
        .unwrap_or(1.0);
    weight >= ratio * entry
}

fn slot_type(alloc: &Allocation, slot: Slot, registry: &TypeRegistry) -> Option<IrType> {
    match (alloc, slot) {
        (Allocation::Object(_), Slot::Field(field)) => registry.field(field).map(|f| f.ty.clone()),
        (Allocation::Array { elem, .. }, Slot::Elem(_)) => Some(elem.clone()),
        _ => None,
    }
}

fn slot_name(slot: Slot, registry: &TypeRegistry) -> String {
    match slot {
        Slot::Field(field) => registry
            .field(field)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| field.to_string()),
        Slot::Elem(k) => format!("[{}]", k),
    }
}

fn declare_slot_vars(
    function: &mut IrFunction,
    value: IrId,
    alloc: &Allocation,
    uses: &ObjectUses,
    registry: &TypeRegistry,
) -> EscapeResult<SlotVars> {
    let mut vars = SlotVars::new();
    for slot in uses.slots() {
        let ty = slot_type(alloc, slot, registry).ok_or_else(|| {
            EscapeError::failure(
                function.name.clone(),
                format!("no type for slot {:?} of {}", slot, value),
            )
        })?;
        let var = function.declare_var(format!("{}.{}", value, slot_name(slot, registry)), ty.clone());
        vars.insert(slot, (var, ty));
    }
    Ok(vars)
}

/// Turn loads and stores of the tracked slots into variable accesses
fn rewrite_accesses(function: &mut IrFunction, uses: &ObjectUses, vars: &SlotVars) {
    let var_of = |addr: &IrId| uses.addrs.get(addr).and_then(|s| vars.get(s)).map(|(v, _)| *v);
    for block in function.cfg.blocks.values_mut() {
        for inst in &mut block.instructions {
            let replacement = match inst {
                IrInstruction::LdInd { dest, addr, .. } => var_of(addr).map(|var| IrInstruction::LdVar {
                    dest: *dest,
                    var,
                }),
                IrInstruction::StInd { addr, value } => var_of(addr).map(|var| IrInstruction::StVar {
                    var,
                    src: *value,
                }),
                _ => None,
            };
            if let Some(replacement) = replacement {
                *inst = replacement;
            }
        }
    }
}

/// Remove field and element addresses of the object that lost every use
fn drop_dead_addresses(function: &mut IrFunction, uses: &ObjectUses) {
    let counts = function.use_counts();
    let dead = |dest: &IrId| uses.addrs.contains_key(dest) && !counts.contains_key(dest);
    for block in function.cfg.blocks.values_mut() {
        block.instructions.retain(|inst| {
            !matches!(
                inst,
                IrInstruction::LdFieldAddr { dest, .. } | IrInstruction::LdElemAddr { dest, .. }
                    if dead(dest)
            )
        });
    }
}

/// Remove copies, casts and null checks of the object. Markers naming it
/// name null instead.
fn drop_aliases(function: &mut IrFunction, aliases: &BTreeSet<IrId>) {
    let marked = function
        .cfg
        .blocks
        .values()
        .flat_map(|b| b.instructions.iter())
        .any(|inst| matches!(inst, IrInstruction::MethodMarker { obj: Some(o), .. } if aliases.contains(o)));
    let null = marked.then(|| function.insert_entry_const(IrValue::Null, IrType::Null));

    for block in function.cfg.blocks.values_mut() {
        block.instructions.retain(|inst| match inst {
            IrInstruction::Copy { dest, .. } | IrInstruction::Cast { dest, .. } => {
                !aliases.contains(dest)
            }
            IrInstruction::CheckNull { obj } => !aliases.contains(obj),
            _ => true,
        });
        for inst in &mut block.instructions {
            if let IrInstruction::MethodMarker { obj, .. } = inst {
                if obj.map_or(false, |o| aliases.contains(&o)) {
                    *obj = null;
                }
            }
        }
    }
}

fn default_inits(function: &mut IrFunction, vars: &SlotVars) -> Vec<IrInstruction> {
    let mut init = Vec::with_capacity(vars.len() * 2);
    for (var, ty) in vars.values() {
        let dest = function.alloc_typed_reg(ty.clone());
        init.push(IrInstruction::Const {
            dest,
            value: ty.default_value(),
        });
        init.push(IrInstruction::StVar { var: *var, src: dest });
    }
    init
}

/// Replace the allocation of `value`, which must be unused by now, with `init`
fn replace_allocation(
    function: &mut IrFunction,
    value: IrId,
    init: Vec<IrInstruction>,
) -> EscapeResult<()> {
    if function.use_counts().get(&value).copied().unwrap_or(0) > 0 {
        return Err(EscapeError::failure(
            function.name.clone(),
            format!("{} still used after scalar replacement", value),
        ));
    }
    let Some(DefSite::Inst { block, index }) = function.locate_def(value) else {
        return Err(EscapeError::failure(
            function.name.clone(),
            format!("allocation {} not found", value),
        ));
    };
    if let Some(block) = function.cfg.get_block_mut(block) {
        block.instructions.splice(index..=index, init);
    }
    Ok(())
}

fn replace_local(
    function: &mut IrFunction,
    value: IrId,
    alloc: &Allocation,
    aliases: &BTreeSet<IrId>,
    uses: &ObjectUses,
    registry: &TypeRegistry,
) -> EscapeResult<()> {
    let vars = declare_slot_vars(function, value, alloc, uses, registry)?;
    rewrite_accesses(function, uses, &vars);
    drop_dead_addresses(function, uses);
    drop_aliases(function, aliases);
    let init = default_inits(function, &vars);
    replace_allocation(function, value, init)
}

fn replace_escaped(
    function: &mut IrFunction,
    value: IrId,
    class: ClassId,
    aliases: &BTreeSet<IrId>,
    uses: &ObjectUses,
    registry: &TypeRegistry,
) -> EscapeResult<()> {
    let object_ty = IrType::Object(class);
    let vars = declare_slot_vars(function, value, &Allocation::Object(class), uses, registry)?;
    rewrite_accesses(function, uses, &vars);
    drop_dead_addresses(function, uses);
    let holder = function.declare_var(format!("{}.obj", value), object_ty.clone());
    let made = function.declare_var(format!("{}.made", value), IrType::I32);

    let materialize = Materialize {
        class,
        aliases,
        vars: &vars,
        holder,
        made,
        null_check: uses.null_checks,
        registry,
    };
    let mut calls = call_sites(function, aliases);
    calls.sort();
    for (block, index) in calls.into_iter().rev() {
        materialize.at_call(function, block, index)?;
    }

    drop_aliases(function, aliases);
    let mut init = default_inits(function, &vars);
    let null = function.alloc_typed_reg(object_ty);
    let zero = function.alloc_typed_reg(IrType::I32);
    init.extend([
        IrInstruction::Const {
            dest: null,
            value: IrValue::Null,
        },
        IrInstruction::StVar {
            var: holder,
            src: null,
        },
        IrInstruction::Const {
            dest: zero,
            value: IrValue::I32(0),
        },
        IrInstruction::StVar { var: made, src: zero },
    ]);
    replace_allocation(function, value, init)
}

fn call_sites(function: &IrFunction, aliases: &BTreeSet<IrId>) -> Vec<(IrBlockId, usize)> {
    let mut sites = Vec::new();
    for (id, block) in &function.cfg.blocks {
        for (index, inst) in block.instructions.iter().enumerate() {
            if let IrInstruction::DirectCall { args, .. } = inst {
                if args.iter().any(|a| aliases.contains(a)) {
                    sites.push((*id, index));
                }
            }
        }
    }
    sites
}

struct Materialize<'a> {
    class: ClassId,
    aliases: &'a BTreeSet<IrId>,
    vars: &'a SlotVars,
    holder: VarId,
    made: VarId,
    null_check: bool,
    registry: &'a TypeRegistry,
}

impl Materialize<'_> {
    /// Make the object exist before the call at `index`, flush the field
    /// variables into it and reload the mutable ones afterwards
    fn at_call(&self, function: &mut IrFunction, block: IrBlockId, index: usize) -> EscapeResult<()> {
        let object_ty = IrType::Object(self.class);
        let call_block = function.cfg.split_block(block, index).ok_or_else(|| {
            EscapeError::failure(function.name.clone(), "cannot split before call".to_string())
        })?;

        let fresh = function.alloc_typed_reg(object_ty.clone());
        let one = function.alloc_typed_reg(IrType::I32);
        let make = function.cfg.create_block();
        let frequency = function
            .cfg
            .get_block(block)
            .map(|b| b.metadata.frequency)
            .unwrap_or(0.0);
        if let Some(make_block) = function.cfg.get_block_mut(make) {
            make_block.instructions = vec![
                IrInstruction::NewObj {
                    dest: fresh,
                    class: self.class,
                },
                IrInstruction::StVar {
                    var: self.holder,
                    src: fresh,
                },
                IrInstruction::Const {
                    dest: one,
                    value: IrValue::I32(1),
                },
                IrInstruction::StVar {
                    var: self.made,
                    src: one,
                },
            ];
            make_block.terminator = IrTerminator::Branch { target: call_block };
            make_block.metadata.frequency = frequency;
        }

        let flag = function.alloc_typed_reg(IrType::I32);
        if let Some(head) = function.cfg.get_block_mut(block) {
            head.instructions.push(IrInstruction::LdVar {
                dest: flag,
                var: self.made,
            });
        }
        function.cfg.replace_terminator(
            block,
            IrTerminator::CondBranch {
                condition: flag,
                true_target: call_block,
                false_target: make,
            },
        );

        let current = function.alloc_typed_reg(object_ty);
        let mut before = vec![IrInstruction::LdVar {
            dest: current,
            var: self.holder,
        }];
        let mut after = Vec::new();
        for (slot, (var, ty)) in self.vars {
            let Slot::Field(field) = *slot else {
                continue;
            };
            let v = function.alloc_typed_reg(ty.clone());
            let addr = function.alloc_typed_reg(IrType::address_of(ty.clone()));
            before.extend([
                IrInstruction::LdVar { dest: v, var: *var },
                IrInstruction::LdFieldAddr {
                    dest: addr,
                    base: current,
                    field,
                },
                IrInstruction::StInd { addr, value: v },
            ]);

            let is_final = self.registry.field(field).map(|f| f.is_final).unwrap_or(false);
            if !is_final {
                let reloaded = function.alloc_typed_reg(ty.clone());
                let addr = function.alloc_typed_reg(IrType::address_of(ty.clone()));
                after.extend([
                    IrInstruction::LdFieldAddr {
                        dest: addr,
                        base: current,
                        field,
                    },
                    IrInstruction::LdInd {
                        dest: reloaded,
                        addr,
                        ty: ty.clone(),
                    },
                    IrInstruction::StVar {
                        var: *var,
                        src: reloaded,
                    },
                ]);
            }
        }
        if self.null_check {
            before.push(IrInstruction::CheckNull { obj: current });
        }

        let Some(post) = function.cfg.get_block_mut(call_block) else {
            return Ok(());
        };
        let call_at = before.len();
        post.instructions.splice(0..0, before);
        if let Some(IrInstruction::DirectCall { args, .. }) = post.instructions.get_mut(call_at) {
            for arg in args.iter_mut() {
                if self.aliases.contains(arg) {
                    *arg = current;
                }
            }
        }
        post.instructions.splice(call_at + 1..call_at + 1, after);
        Ok(())
    }
}

/// Whether access `a` executes before `b` on every path reaching `b`
fn precedes(domtree: &DominatorTree, a: Access, b: Access) -> bool {
    if a.block == b.block {
        a.index < b.index
    } else {
        domtree.dominates(a.block, b.block)
    }
}

/// Read each repeatedly loaded final field once and serve the other loads
/// from a variable. Returns the number of fields cached.
fn cache_final_fields(
    function: &mut IrFunction,
    value: IrId,
    uses: &ObjectUses,
    anchor_kind: Anchor,
    options: &EscapeOptions,
    registry: &TypeRegistry,
) -> usize {
    let threshold = options.min_final_loads.max(1);
    function.cfg.rebuild_predecessors();
    let domtree = DominatorTree::compute(function);

    let mut replaced: Vec<(Access, VarId)> = Vec::new();
    let mut anchors: Vec<(Access, VarId)> = Vec::new();
    for (slot, loads) in &uses.loads {
        let Slot::Field(field) = *slot else {
            continue;
        };
        let Some(desc) = registry.field(field) else {
            continue;
        };
        if !desc.is_final || uses.leaked.contains(slot) {
            continue;
        }
        let stores = uses.stores.get(slot).map(Vec::as_slice).unwrap_or(&[]);
        let (anchor, served) = match anchor_kind {
            Anchor::Store => {
                let [store] = stores else {
                    continue;
                };
                let served: Vec<Access> = loads
                    .iter()
                    .copied()
                    .filter(|l| precedes(&domtree, *store, *l))
                    .collect();
                if served.len() < threshold {
                    continue;
                }
                (*store, served)
            }
            Anchor::Load => {
                if !stores.is_empty() {
                    continue;
                }
                let best = loads
                    .iter()
                    .map(|a| {
                        let served: Vec<Access> = loads
                            .iter()
                            .copied()
                            .filter(|l| precedes(&domtree, *a, *l))
                            .collect();
                        (*a, served)
                    })
                    .max_by_key(|(a, served)| (served.len(), std::cmp::Reverse(*a)));
                match best {
                    Some((anchor, served)) if !served.is_empty() && served.len() + 1 >= threshold => {
                        (anchor, served)
                    }
                    _ => continue,
                }
            }
        };

        let var = function.declare_var(format!("{}.{}", value, desc.name), desc.ty.clone());
        anchors.push((anchor, var));
        replaced.extend(served.into_iter().map(|l| (l, var)));
    }

    for (load, var) in &replaced {
        if let Some(block) = function.cfg.get_block_mut(load.block) {
            if let Some(inst) = block.instructions.get_mut(load.index) {
                *inst = IrInstruction::LdVar {
                    dest: load.value,
                    var: *var,
                };
            }
        }
    }
    anchors.sort();
    let cached = anchors.len();
    for (anchor, var) in anchors.into_iter().rev() {
        if let Some(block) = function.cfg.get_block_mut(anchor.block) {
            block.instructions.insert(
                anchor.index + 1,
                IrInstruction::StVar {
                    var,
                    src: anchor.value,
                },
            );
        }
    }
    if cached > 0 {
        drop_dead_addresses(function, uses);
        debug!("{}: {} final fields of {} cached", function.name, cached, value);
    }
    cached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::escape::graph_builder::build_graph;
    use crate::ir::{IrBuilder, IrModule, MethodFlags, MethodId};

    struct Pair {
        module: IrModule,
        method: MethodId,
        x: FieldId,
    }

    /// `p = new Pair; p.x = 1; p.y = 2; [call(p) ...]; return p.x + p.y`
    fn pair(calls: usize, final_x: bool) -> Pair {
        let mut builder = IrBuilder::new("pairs");
        let class = builder.registry_mut().add_class("Pair");
        let x = builder
            .registry_mut()
            .add_field(class, "x", IrType::I32, final_x);
        let y = builder
            .registry_mut()
            .add_field(class, "y", IrType::I32, false);
        let inspect = builder.registry_mut().add_method(
            class,
            "inspect",
            vec![IrType::Object(class)],
            IrType::Void,
            MethodFlags::static_method(),
        );
        let method = builder.registry_mut().add_method(
            class,
            "sum",
            vec![],
            IrType::I32,
            MethodFlags::static_method(),
        );
        builder.start_function(method).unwrap();
        let p = builder.build_new_obj(class).unwrap();
        let one = builder.build_i32(1).unwrap();
        let two = builder.build_i32(2).unwrap();
        builder.build_put_field(p, x, one).unwrap();
        builder.build_put_field(p, y, two).unwrap();
        for _ in 0..calls {
            builder.build_call(inspect, vec![p]).unwrap();
        }
        let a = builder.build_get_field(p, x).unwrap();
        let b = builder.build_get_field(p, y).unwrap();
        let c = builder.build_get_field(p, x).unwrap();
        let s = builder
            .build_binop(crate::ir::BinaryOp::Add, a, b)
            .unwrap();
        let s = builder
            .build_binop(crate::ir::BinaryOp::Add, s, c)
            .unwrap();
        builder.build_return(Some(s)).unwrap();
        builder.finish_function();
        Pair {
            module: builder.finish(),
            method,
            x,
        }
    }

    fn count(f: &IrFunction, pred: impl Fn(&IrInstruction) -> bool) -> usize {
        f.cfg
            .blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| pred(i))
            .count()
    }

    fn new_objs(f: &IrFunction) -> usize {
        count(f, |i| matches!(i, IrInstruction::NewObj { .. }))
    }

    #[test]
    fn test_local_object_becomes_variables() {
        let Pair {
            mut module, method, ..
        } = pair(0, false);
        let registry = module.registry.clone();
        let f = module.get_function_mut(method).unwrap();
        let built = build_graph(f, &registry).unwrap();

        let stats = replace_scalars(f, &built.graph, &EscapeOptions::default(), &registry).unwrap();
        assert_eq!(stats.local, 1);
        assert_eq!(new_objs(f), 0);
        assert_eq!(count(f, |i| matches!(i, IrInstruction::LdInd { .. })), 0);
        assert_eq!(count(f, |i| matches!(i, IrInstruction::LdFieldAddr { .. })), 0);
        assert_eq!(f.vars.len(), 2);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_escaped_object_materialized_per_call() {
        let Pair {
            mut module, method, ..
        } = pair(2, false);
        let registry = module.registry.clone();
        let f = module.get_function_mut(method).unwrap();
        let mut built = build_graph(f, &registry).unwrap();
        let obj = built
            .graph
            .node_ids()
            .find(|id| built.graph.node(*id).kind == NodeKind::Object)
            .unwrap();
        built.graph.lower_state(obj, EscState::ArgEscape);

        let stats = replace_scalars(f, &built.graph, &EscapeOptions::default(), &registry).unwrap();
        assert_eq!(stats.escaped, 1);
        // One guarded allocation in front of each call
        assert_eq!(new_objs(f), 2);
        let vars: Vec<&str> = f.vars.values().map(|v| v.name.as_str()).collect();
        assert!(vars.iter().any(|n| n.ends_with(".made")));
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_object_returned_by_callee_is_not_materialized() {
        let Pair {
            mut module, method, ..
        } = pair(1, false);
        let registry = module.registry.clone();
        let f = module.get_function_mut(method).unwrap();
        let mut built = build_graph(f, &registry).unwrap();
        let obj = built
            .graph
            .node_ids()
            .find(|id| built.graph.node(*id).kind == NodeKind::Object)
            .unwrap();
        built.graph.lower_state(obj, EscState::ArgEscape);
        // The callee hands its argument back as the call result
        let slot = built
            .graph
            .node_ids()
            .find(|id| built.graph.node(*id).kind == NodeKind::ActArg)
            .unwrap();
        let result = built
            .graph
            .add_node(NodeKind::RetVal, crate::ir::RefKind::Reference);
        built.graph.node_mut(result).caller_args.push(slot);

        let stats = replace_scalars(f, &built.graph, &EscapeOptions::default(), &registry).unwrap();
        assert_eq!(stats.escaped, 0);
        assert_eq!(new_objs(f), 1);
        assert!(f.vars.is_empty());
    }

    #[test]
    fn test_global_object_keeps_allocation_but_caches_final_field() {
        let Pair {
            mut module,
            method,
            x,
        } = pair(0, true);
        let registry = module.registry.clone();
        let f = module.get_function_mut(method).unwrap();
        let mut built = build_graph(f, &registry).unwrap();
        let obj = built
            .graph
            .node_ids()
            .find(|id| built.graph.node(*id).kind == NodeKind::Object)
            .unwrap();
        built.graph.lower_state(obj, EscState::GlobalEscape);

        let stats = replace_scalars(f, &built.graph, &EscapeOptions::default(), &registry).unwrap();
        assert_eq!(stats.local + stats.escaped, 0);
        assert_eq!(stats.final_fields, 1);
        assert_eq!(new_objs(f), 1);
        // Both reads of x come from the variable; y is still loaded
        assert_eq!(count(f, |i| matches!(i, IrInstruction::LdVar { .. })), 2);
        assert_eq!(
            count(f, |i| matches!(i, IrInstruction::LdFieldAddr { field, .. } if *field == x)),
            1
        );
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_final_fields_disabled() {
        let Pair {
            mut module, method, ..
        } = pair(0, true);
        let registry = module.registry.clone();
        let f = module.get_function_mut(method).unwrap();
        let mut built = build_graph(f, &registry).unwrap();
        let obj = built
            .graph
            .node_ids()
            .find(|id| built.graph.node(*id).kind == NodeKind::Object)
            .unwrap();
        built.graph.lower_state(obj, EscState::GlobalEscape);

        let options = EscapeOptions {
            scalarize_final_fields: false,
            ..EscapeOptions::default()
        };
        let stats = replace_scalars(f, &built.graph, &options, &registry).unwrap();
        assert!(!stats.changed());
    }

    #[test]
    fn test_unprofitable_escape_is_left_alone() {
        let Pair {
            mut module, method, ..
        } = pair(1, false);
        let registry = module.registry.clone();
        let f = module.get_function_mut(method).unwrap();
        let mut built = build_graph(f, &registry).unwrap();
        let obj = built
            .graph
            .node_ids()
            .find(|id| built.graph.node(*id).kind == NodeKind::Object)
            .unwrap();
        built.graph.lower_state(obj, EscState::ArgEscape);

        // Every path to the exit passes the call
        let options = EscapeOptions {
            profit_ratio: 0.5,
            scalarize_final_fields: false,
            ..EscapeOptions::default()
        };
        let stats = replace_scalars(f, &built.graph, &options, &registry).unwrap();
        assert_eq!(stats.escaped, 0);
        assert_eq!(new_objs(f), 1);
    }
}
