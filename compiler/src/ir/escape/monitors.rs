//! Monitor elimination
//!
//! Plain monitors are grouped into lock units by the node governing their
//! operand. A unit is then handled by the first rule that applies:
//! - a fresh object that neither escapes globally nor reaches a virtual call
//!   loses its monitors, and exception edges left without a throwing
//!   instruction are dropped;
//! - the receiver of a synchronized method has its monitors guarded by the
//!   flag the caller passes through `LoadThisLockFlag`;
//! - a fresh object reaching a virtual call is locked lazily, right before
//!   the first call inside the lock region that receives it.
//!
//! Monitors the transform emits carry `guarded = true` and are never
//! reconsidered.

use super::cng::{CnGNodeId, ConnectionGraph, NodeKind};
use super::error::{EscapeError, EscapeResult};
use super::AnalysisContext;
use crate::ir::loop_analysis::DominatorTree;
use crate::ir::{
    DefSite, IrBlockId, IrFunction, IrId, IrInstruction, IrTerminator, IrType, IrValue, VmHelper,
};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub removed: usize,
    /// Monitors on `this` placed behind the caller's lock flag
    pub this_guarded: usize,
    /// Lazy acquires and guarded releases emitted for virtual-call objects
    pub virtual_guarded: usize,
    pub save_flag_calls: usize,
    pub kept: usize,
    pub blocks_removed: usize,
}

impl MonitorStats {
    pub fn changed(&self) -> bool {
        self.removed + self.this_guarded + self.virtual_guarded + self.save_flag_calls > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct MonitorSite {
    block: IrBlockId,
    index: usize,
    enter: bool,
}

/// Remove or guard the plain monitors of `function`
pub fn eliminate_monitors(
    function: &mut IrFunction,
    graph: &ConnectionGraph,
    ctx: &AnalysisContext<'_>,
) -> EscapeResult<MonitorStats> {
    let options = ctx.options;
    let mut stats = MonitorStats::default();

    let mut units: BTreeMap<CnGNodeId, BTreeSet<IrId>> = BTreeMap::new();
    for block in function.cfg.blocks.values() {
        for inst in &block.instructions {
            let Some((obj, _)) = inst.plain_monitor() else {
                continue;
            };
            match graph.node_of_value(obj) {
                Some(node) => {
                    units.entry(graph.origin_of(node)).or_default().insert(obj);
                }
                None => stats.kept += 1,
            }
        }
    }

    let mut this_flag = None;
    for (unit, operands) in &units {
        let node = graph.node(*unit);
        let sites = scan_monitors(function, operands);
        if node.state().is_global() {
            stats.kept += sites.len();
            continue;
        }
        match node.kind {
            NodeKind::Object if !node.virtual_call => {
                remove_unit(function, &sites, &mut stats);
                debug!("{}: removed {} monitors on {}", function.name, sites.len(), unit);
            }
            NodeKind::Object if options.sync_removal_virtual => {
                match lazy_lock(function, graph, *unit, operands)? {
                    Some(guarded) => {
                        stats.virtual_guarded += guarded;
                        debug!("{}: lazy lock on {}", function.name, unit);
                    }
                    None => stats.kept += sites.len(),
                }
            }
            NodeKind::DefArg
                if options.sync_removal_this
                    && node.arg_index == Some(0)
                    && !node.virtual_call
                    && function.is_synchronized
                    && !function.is_static =>
            {
                let flag = load_this_flag(function, &mut this_flag)?;
                stats.this_guarded += guard_with_flag(function, operands, flag)?;
            }
            _ => stats.kept += sites.len(),
        }
    }

    if options.sync_removal_this {
        stats.save_flag_calls += save_lock_flags(function, graph, ctx, this_flag)?;
    }
    Ok(stats)
}

fn scan_monitors(function: &IrFunction, operands: &BTreeSet<IrId>) -> Vec<MonitorSite> {
    let mut sites = Vec::new();
    for (id, block) in &function.cfg.blocks {
        for (index, inst) in block.instructions.iter().enumerate() {
            if let Some((obj, enter)) = inst.plain_monitor() {
                if operands.contains(&obj) {
                    sites.push(MonitorSite {
                        block: *id,
                        index,
                        enter,
                    });
                }
            }
        }
    }
    sites
}

fn remove_unit(function: &mut IrFunction, sites: &[MonitorSite], stats: &mut MonitorStats) {
    let touched: BTreeSet<IrBlockId> = sites.iter().map(|s| s.block).collect();
    for site in sites.iter().rev() {
        if let Some(block) = function.cfg.get_block_mut(site.block) {
            block.instructions.remove(site.index);
        }
    }
    stats.removed += sites.len();
    let touched: Vec<IrBlockId> = touched.into_iter().collect();
    if function.cfg.drop_dead_dispatch_edges(&touched) > 0 {
        stats.blocks_removed += function.cfg.remove_unreachable_blocks();
    }
}

fn broken(function: &IrFunction, what: &str) -> EscapeError {
    EscapeError::failure(function.name.clone(), what.to_string())
}

fn load_this_flag(function: &mut IrFunction, flag: &mut Option<IrId>) -> EscapeResult<IrId> {
    if let Some(flag) = flag {
        return Ok(*flag);
    }
    let this = function
        .this_reg()
        .ok_or_else(|| broken(function, "synchronized instance method without receiver"))?;
    let dest = function.alloc_typed_reg(IrType::I32);
    let at = function.entry_insertion_point();
    let entry = function.entry_block();
    if let Some(block) = function.cfg.get_block_mut(entry) {
        block.instructions.insert(
            at,
            IrInstruction::VmHelperCall {
                dest: Some(dest),
                helper: VmHelper::LoadThisLockFlag,
                args: vec![this],
            },
        );
    }
    *flag = Some(dest);
    Ok(dest)
}

/// Isolate the instruction at `index` in its own block. Returns
/// `(head, isolated, tail)`; `head` still branches to `isolated`.
fn isolate(
    function: &mut IrFunction,
    block: IrBlockId,
    index: usize,
) -> EscapeResult<(IrBlockId, IrBlockId, IrBlockId)> {
    let tail = function
        .cfg
        .split_block(block, index + 1)
        .ok_or_else(|| broken(function, "cannot split after monitor"))?;
    let isolated = function
        .cfg
        .split_block(block, index)
        .ok_or_else(|| broken(function, "cannot split before monitor"))?;
    Ok((block, isolated, tail))
}

fn mark_guarded(function: &mut IrFunction, block: IrBlockId) {
    let Some(block) = function.cfg.get_block_mut(block) else {
        return;
    };
    for inst in &mut block.instructions {
        match inst {
            IrInstruction::MonitorEnter { guarded, .. } | IrInstruction::MonitorExit { guarded, .. } => {
                *guarded = true
            }
            _ => {}
        }
    }
}

/// Skip every monitor of the unit when `flag` is set
fn guard_with_flag(
    function: &mut IrFunction,
    operands: &BTreeSet<IrId>,
    flag: IrId,
) -> EscapeResult<usize> {
    let mut sites = scan_monitors(function, operands);
    sites.sort();
    for site in sites.iter().rev() {
        let (head, monitor, tail) = isolate(function, site.block, site.index)?;
        mark_guarded(function, monitor);
        function.cfg.replace_terminator(
            head,
            IrTerminator::CondBranch {
                condition: flag,
                true_target: tail,
                false_target: monitor,
            },
        );
    }
    Ok(sites.len())
}

pub(super) fn aliases_of(graph: &ConnectionGraph, unit: CnGNodeId) -> BTreeSet<IrId> {
    graph
        .values()
        .into_iter()
        .filter(|(_, node)| graph.origin_of(*node) == unit)
        .map(|(value, _)| value)
        .collect()
}

fn receives(inst: &IrInstruction, aliases: &BTreeSet<IrId>) -> bool {
    match inst {
        IrInstruction::DirectCall { args, .. } | IrInstruction::IndirectCall { args, .. } => {
            args.iter().any(|a| aliases.contains(a))
        }
        _ => false,
    }
}

/// Every use of the object is one the lazy lock can account for
fn uses_are_lockable(function: &IrFunction, aliases: &BTreeSet<IrId>) -> bool {
    for block in function.cfg.blocks.values() {
        if block
            .phi_nodes
            .iter()
            .any(|phi| phi.incoming.iter().any(|(_, v)| aliases.contains(v)))
        {
            return false;
        }
        if block.terminator.uses().iter().any(|v| aliases.contains(v)) {
            return false;
        }
        for inst in &block.instructions {
            let ok = match inst {
                IrInstruction::StInd { value, .. } => !aliases.contains(value),
                IrInstruction::StVar { src, .. } => !aliases.contains(src),
                IrInstruction::VmHelperCall { args, .. } | IrInstruction::Intrinsic { args, .. } => {
                    !args.iter().any(|a| aliases.contains(a))
                }
                _ => true,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

/// Calls receiving the object between the enter and the matching exits.
/// `None` when the region runs into the enter again, another enter, or
/// leaves the method while locked.
fn lock_region(
    function: &IrFunction,
    enter: MonitorSite,
    operands: &BTreeSet<IrId>,
    aliases: &BTreeSet<IrId>,
) -> Option<Vec<(IrBlockId, usize)>> {
    let mut calls = Vec::new();
    let mut visited = BTreeSet::new();
    let mut work = vec![(enter.block, enter.index + 1)];
    while let Some((id, start)) = work.pop() {
        if start == 0 && !visited.insert(id) {
            continue;
        }
        let block = function.cfg.get_block(id)?;
        let mut closed = false;
        let mut throws = false;
        for (index, inst) in block.instructions.iter().enumerate().skip(start) {
            if id == enter.block && index == enter.index {
                return None;
            }
            match inst.plain_monitor() {
                Some((obj, false)) if operands.contains(&obj) => {
                    closed = true;
                    break;
                }
                Some((obj, true)) if operands.contains(&obj) => return None,
                _ => {}
            }
            if receives(inst, aliases) {
                calls.push((id, index));
            }
            throws |= inst.can_throw();
        }
        if closed {
            if throws {
                work.extend(block.dispatch.map(|d| (d, 0)));
            }
            continue;
        }
        match block.terminator {
            IrTerminator::Return { .. } => return None,
            IrTerminator::Throw { .. } if block.dispatch.is_none() => return None,
            _ => {}
        }
        work.extend(block.all_successors().into_iter().map(|s| (s, 0)));
    }
    Some(calls)
}

fn reaches(function: &IrFunction, from: IrBlockId, target: IrBlockId) -> bool {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<IrBlockId> = function
        .cfg
        .get_block(from)
        .map(|b| b.all_successors().into())
        .unwrap_or_default();
    while let Some(id) = queue.pop_front() {
        if id == target {
            return true;
        }
        if seen.insert(id) {
            if let Some(block) = function.cfg.get_block(id) {
                queue.extend(block.all_successors());
            }
        }
    }
    false
}

/// Replace the single enter of a virtual-call object by lazy acquires in
/// front of the calls that receive it. Returns the number of guarded monitor
/// instructions, or `None` when the unit does not qualify.
fn lazy_lock(
    function: &mut IrFunction,
    graph: &ConnectionGraph,
    unit: CnGNodeId,
    operands: &BTreeSet<IrId>,
) -> EscapeResult<Option<usize>> {
    let sites = scan_monitors(function, operands);
    let enters: Vec<MonitorSite> = sites.iter().copied().filter(|s| s.enter).collect();
    let [enter] = enters.as_slice() else {
        return Ok(None);
    };
    let enter = *enter;
    let Some(object) = graph.node(unit).value else {
        return Ok(None);
    };
    let aliases = aliases_of(graph, unit);
    if !uses_are_lockable(function, &aliases) {
        return Ok(None);
    }

    function.cfg.rebuild_predecessors();
    let domtree = DominatorTree::compute(function);
    let def_block = match function.locate_def(object) {
        Some(DefSite::Inst { block, .. }) => block,
        _ => return Ok(None),
    };
    if !domtree.dominates(def_block, enter.block) {
        return Ok(None);
    }
    let Some(mut calls) = lock_region(function, enter, operands, &aliases) else {
        return Ok(None);
    };
    if calls.is_empty() || calls.iter().any(|(b, _)| reaches(function, *b, enter.block)) {
        return Ok(None);
    }

    let locked = function.declare_var("locked", IrType::I32);
    let mut guarded = 0;

    calls.sort();
    for &(block, index) in calls.iter().rev() {
        let call_block = function
            .cfg
            .split_block(block, index)
            .ok_or_else(|| broken(function, "cannot split before call"))?;
        let one = function.alloc_typed_reg(IrType::I32);
        let acquire = function.cfg.create_block();
        if let Some(a) = function.cfg.get_block_mut(acquire) {
            a.instructions = vec![
                IrInstruction::Const {
                    dest: one,
                    value: IrValue::I32(1),
                },
                IrInstruction::MonitorEnter {
                    obj: object,
                    guarded: true,
                },
                IrInstruction::StVar {
                    var: locked,
                    src: one,
                },
            ];
            a.terminator = IrTerminator::Branch { target: call_block };
        }
        function.cfg.inherit_dispatch(acquire, block);

        let flag = function.alloc_typed_reg(IrType::I32);
        if let Some(b) = function.cfg.get_block_mut(block) {
            b.instructions.push(IrInstruction::LdVar {
                dest: flag,
                var: locked,
            });
        }
        function.cfg.replace_terminator(
            block,
            IrTerminator::CondBranch {
                condition: flag,
                true_target: call_block,
                false_target: acquire,
            },
        );
        guarded += 1;
    }

    let mut exits: Vec<MonitorSite> = scan_monitors(function, operands)
        .into_iter()
        .filter(|s| !s.enter)
        .collect();
    exits.sort();
    for site in exits.iter().rev() {
        let (head, release, tail) = isolate(function, site.block, site.index)?;
        mark_guarded(function, release);
        let zero = function.alloc_typed_reg(IrType::I32);
        if let Some(r) = function.cfg.get_block_mut(release) {
            r.instructions.push(IrInstruction::Const {
                dest: zero,
                value: IrValue::I32(0),
            });
            r.instructions.push(IrInstruction::StVar {
                var: locked,
                src: zero,
            });
        }
        let flag = function.alloc_typed_reg(IrType::I32);
        if let Some(h) = function.cfg.get_block_mut(head) {
            h.instructions.push(IrInstruction::LdVar {
                dest: flag,
                var: locked,
            });
        }
        function.cfg.replace_terminator(
            head,
            IrTerminator::CondBranch {
                condition: flag,
                true_target: release,
                false_target: tail,
            },
        );
        guarded += 1;
    }

    let enter = scan_monitors(function, operands)
        .into_iter()
        .find(|s| s.enter)
        .ok_or_else(|| broken(function, "lock enter vanished"))?;
    if let Some(b) = function.cfg.get_block_mut(enter.block) {
        b.instructions.remove(enter.index);
    }
    function.cfg.drop_dead_dispatch_edges(&[enter.block]);

    let zero = function.alloc_typed_reg(IrType::I32);
    let at = function.entry_insertion_point();
    let entry = function.entry_block();
    if let Some(b) = function.cfg.get_block_mut(entry) {
        b.instructions.insert(
            at,
            IrInstruction::StVar {
                var: locked,
                src: zero,
            },
        );
        b.instructions.insert(
            at,
            IrInstruction::Const {
                dest: zero,
                value: IrValue::I32(0),
            },
        );
    }
    Ok(Some(guarded))
}

/// Tell synchronized callees whether their receiver is already safe. Returns
/// the number of `SaveThisLockFlag` calls inserted.
fn save_lock_flags(
    function: &mut IrFunction,
    graph: &ConnectionGraph,
    ctx: &AnalysisContext<'_>,
    this_flag: Option<IrId>,
) -> EscapeResult<usize> {
    let registry = ctx.source.registry();
    let this_node = function
        .this_reg()
        .and_then(|this| graph.node_of_value(this))
        .map(|n| graph.origin_of(n));

    enum Flag {
        Existing(IrId),
        AlwaysSafe,
    }

    let mut inserts: Vec<(IrBlockId, usize, Flag)> = Vec::new();
    for (id, block) in &function.cfg.blocks {
        for (index, inst) in block.instructions.iter().enumerate() {
            let IrInstruction::DirectCall { method, args, .. } = inst else {
                continue;
            };
            let Some(desc) = registry.method(*method) else {
                continue;
            };
            if desc.is_static() {
                continue;
            }
            let already_saved = index > 0
                && matches!(
                    block.instructions[index - 1],
                    IrInstruction::VmHelperCall {
                        helper: VmHelper::SaveThisLockFlag,
                        ..
                    }
                );
            if already_saved {
                continue;
            }
            let Some(receiver) = args
                .first()
                .and_then(|a| graph.node_of_value(*a))
                .map(|n| graph.origin_of(n))
            else {
                continue;
            };
            let flag = if Some(receiver) == this_node {
                match this_flag {
                    Some(flag) => Flag::Existing(flag),
                    None => continue,
                }
            } else {
                let node = graph.node(receiver);
                if node.kind != NodeKind::Object || node.state().is_global() || node.virtual_call {
                    continue;
                }
                Flag::AlwaysSafe
            };
            let Some(summary) = registry.method_key(*method).and_then(|k| ctx.cache.get(&k)) else {
                continue;
            };
            let receiver_safe = summary.param(0).is_some_and(|p| !p.state.is_global());
            if receiver_safe && (desc.is_synchronized() || summary.monitor_on_this) {
                inserts.push((*id, index, flag));
            }
        }
    }

    let count = inserts.len();
    for (block, index, flag) in inserts.into_iter().rev() {
        let mut code = Vec::new();
        let flag = match flag {
            Flag::Existing(flag) => flag,
            Flag::AlwaysSafe => {
                let one = function.alloc_typed_reg(IrType::I32);
                code.push(IrInstruction::Const {
                    dest: one,
                    value: IrValue::I32(1),
                });
                one
            }
        };
        code.push(IrInstruction::VmHelperCall {
            dest: None,
            helper: VmHelper::SaveThisLockFlag,
            args: vec![flag],
        });
        if let Some(b) = function.cfg.get_block_mut(block) {
            b.instructions.splice(index..index, code);
        }
    }
    Ok(count)
}
