//! SSA Repair
//!
//! Transforms introduce non-SSA variables (`LdVar`/`StVar`) and split blocks.
//! SSA repair promotes every variable back into registers: phis are placed on
//! the iterated dominance frontier of the storing blocks, and a renaming walk
//! over the dominator tree turns each `LdVar` into a `Copy` of the reaching
//! definition. Variables read before any store observe their type's default.

use super::loop_analysis::DominatorTree;
use super::{IrBlockId, IrFunction, IrId, IrInstruction, IrPhiNode, IrType, VarId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Restores SSA form after a transform has introduced variables
pub trait SsaRepair: Sync {
    fn name(&self) -> &'static str;

    fn repair(&self, function: &mut IrFunction) -> SsaRepairStats;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SsaRepairStats {
    pub vars_promoted: usize,
    pub phis_inserted: usize,
    pub phis_pruned: usize,
    pub loads_rewritten: usize,
}

/// Promotes every variable of a function to SSA registers
#[derive(Debug, Default, Clone, Copy)]
pub struct VarPromotion;

type BlockPhis = BTreeMap<IrBlockId, Vec<(VarId, IrId)>>;

impl SsaRepair for VarPromotion {
    fn name(&self) -> &'static str {
        "var-promotion"
    }

    fn repair(&self, function: &mut IrFunction) -> SsaRepairStats {
        let mut stats = SsaRepairStats::default();
        if function.vars.is_empty() {
            return stats;
        }

        function.cfg.remove_unreachable_blocks();
        split_stores_after_throws(function);
        function.cfg.rebuild_predecessors();

        let vars: Vec<(VarId, IrType)> = function
            .vars
            .iter()
            .map(|(id, v)| (*id, v.ty.clone()))
            .collect();
        let domtree = DominatorTree::compute(function);
        let frontiers = domtree.dominance_frontiers(&function.cfg);

        // Blocks storing each variable
        let mut def_blocks: HashMap<VarId, BTreeSet<IrBlockId>> = HashMap::new();
        for block in function.cfg.blocks.values() {
            for inst in &block.instructions {
                if let IrInstruction::StVar { var, .. } = inst {
                    def_blocks.entry(*var).or_default().insert(block.id);
                }
            }
        }

        let mut block_phis: BlockPhis = BTreeMap::new();
        let mut phi_dests: HashSet<IrId> = HashSet::new();
        for (var, ty) in &vars {
            let Some(defs) = def_blocks.get(var) else {
                continue;
            };
            for block in DominatorTree::iterated_frontier(&frontiers, defs.iter().copied()) {
                let dest = function.alloc_typed_reg(ty.clone());
                if let Some(b) = function.cfg.get_block_mut(block) {
                    b.add_phi(IrPhiNode {
                        dest,
                        incoming: Vec::new(),
                        ty: ty.clone(),
                    });
                    block_phis.entry(block).or_default().push((*var, dest));
                    phi_dests.insert(dest);
                    stats.phis_inserted += 1;
                }
            }
        }

        let mut defaults: Vec<IrId> = Vec::with_capacity(vars.len());
        let mut stacks: HashMap<VarId, Vec<IrId>> = HashMap::new();
        for (var, ty) in &vars {
            let value = function.insert_entry_const(ty.default_value(), ty.clone());
            defaults.push(value);
            stacks.insert(*var, vec![value]);
        }

        let entry = function.cfg.entry_block;
        rename_block(function, &domtree, entry, &mut stacks, &block_phis, &mut stats);

        stats.vars_promoted = function.vars.len();
        function.vars.clear();

        stats.phis_pruned = prune_dead_phis(function, &phi_dests);
        remove_unused_defaults(function, &defaults);

        debug!(
            "SSA repair of {}: {} vars, {} phis ({} pruned), {} loads",
            function.name,
            stats.vars_promoted,
            stats.phis_inserted,
            stats.phis_pruned,
            stats.loads_rewritten
        );
        stats
    }
}

/// Split blocks with an exception successor so that no variable store follows
/// a throwing instruction. The handler then observes the block's final value
/// of every variable at each throw point.
fn split_stores_after_throws(function: &mut IrFunction) {
    let mut worklist: Vec<IrBlockId> = function.cfg.blocks.keys().copied().collect();
    while let Some(id) = worklist.pop() {
        let split_at = function.cfg.get_block(id).and_then(|block| {
            block.dispatch?;
            let mut thrown = false;
            for (i, inst) in block.instructions.iter().enumerate() {
                if thrown && matches!(inst, IrInstruction::StVar { .. }) {
                    return Some(i);
                }
                thrown |= inst.can_throw();
            }
            None
        });
        if let Some(at) = split_at {
            if let Some(tail) = function.cfg.split_block(id, at) {
                worklist.push(tail);
            }
        }
    }
}

fn rename_block(
    function: &mut IrFunction,
    domtree: &DominatorTree,
    block: IrBlockId,
    stacks: &mut HashMap<VarId, Vec<IrId>>,
    block_phis: &BlockPhis,
    stats: &mut SsaRepairStats,
) {
    let mut pushed: Vec<VarId> = Vec::new();

    for (var, dest) in block_phis.get(&block).into_iter().flatten() {
        stacks.entry(*var).or_default().push(*dest);
        pushed.push(*var);
    }

    if let Some(b) = function.cfg.get_block_mut(block) {
        let mut kept = Vec::with_capacity(b.instructions.len());
        for inst in b.instructions.drain(..) {
            match inst {
                IrInstruction::LdVar { dest, var } => {
                    match stacks.get(&var).and_then(|s| s.last()).copied() {
                        Some(src) => {
                            kept.push(IrInstruction::Copy { dest, src });
                            stats.loads_rewritten += 1;
                        }
                        None => kept.push(IrInstruction::LdVar { dest, var }),
                    }
                }
                IrInstruction::StVar { var, src } => {
                    stacks.entry(var).or_default().push(src);
                    pushed.push(var);
                }
                other => kept.push(other),
            }
        }
        b.instructions = kept;
    }

    let succs = function
        .cfg
        .get_block(block)
        .map(|b| b.all_successors())
        .unwrap_or_default();
    for succ in succs {
        let Some(phis) = block_phis.get(&succ) else {
            continue;
        };
        for (var, dest) in phis {
            let Some(value) = stacks.get(var).and_then(|s| s.last()).copied() else {
                continue;
            };
            if let Some(phi) = function
                .cfg
                .get_block_mut(succ)
                .and_then(|b| b.phi_nodes.iter_mut().find(|p| p.dest == *dest))
            {
                phi.incoming.push((block, value));
            }
        }
    }

    for child in domtree.children(block).to_vec() {
        rename_block(function, domtree, child, stacks, block_phis, stats);
    }

    for var in pushed {
        if let Some(stack) = stacks.get_mut(&var) {
            stack.pop();
        }
    }
}

/// Remove inserted phis nothing reads, other than themselves or other dead phis
fn prune_dead_phis(function: &mut IrFunction, inserted: &HashSet<IrId>) -> usize {
    let mut removed = 0;
    loop {
        let counts = function.use_counts();
        let dead: HashSet<IrId> = function
            .cfg
            .blocks
            .values()
            .flat_map(|b| b.phi_nodes.iter())
            .filter(|phi| inserted.contains(&phi.dest))
            .filter(|phi| {
                let self_uses = phi.incoming.iter().filter(|(_, v)| *v == phi.dest).count();
                counts.get(&phi.dest).copied().unwrap_or(0) == self_uses
            })
            .map(|phi| phi.dest)
            .collect();
        if dead.is_empty() {
            return removed;
        }
        for block in function.cfg.blocks.values_mut() {
            let before = block.phi_nodes.len();
            block.phi_nodes.retain(|phi| !dead.contains(&phi.dest));
            removed += before - block.phi_nodes.len();
        }
    }
}

fn remove_unused_defaults(function: &mut IrFunction, defaults: &[IrId]) {
    let counts = function.use_counts();
    let unused: HashSet<IrId> = defaults
        .iter()
        .copied()
        .filter(|d| counts.get(d).copied().unwrap_or(0) == 0)
        .collect();
    let entry = function.cfg.entry_block;
    if let Some(block) = function.cfg.get_block_mut(entry) {
        block.instructions.retain(|inst| match inst {
            IrInstruction::Const { dest, .. } => !unused.contains(dest),
            _ => true,
        });
    }
}
