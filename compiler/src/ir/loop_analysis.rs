//! Loop and Dominance Analysis
//!
//! This module provides the control-flow analyses the escape transforms rely on:
//! - Dominator tree computation (iterative dataflow algorithm)
//! - Dominance frontiers, for SSA repair
//! - Natural loop detection via back-edge identification
//! - Static block frequency estimates when no profile exists
//!
//! Exception edges are ordinary CFG edges for all of these analyses.

use super::{IrBlockId, IrControlFlowGraph, IrFunction};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Dominator tree for a function's control flow graph.
///
/// A block D dominates block B if every path from the entry to B goes through D.
/// The immediate dominator (idom) of B is the closest strict dominator.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator for each block (entry block has no idom)
    idom: HashMap<IrBlockId, IrBlockId>,

    /// Children in the dominator tree, ordered by block id
    children: HashMap<IrBlockId, Vec<IrBlockId>>,

    /// Dominator tree depth for each block (entry = 0)
    depth: HashMap<IrBlockId, usize>,

    /// Blocks reachable from the entry, in reverse postorder
    rpo: Vec<IrBlockId>,

    /// Entry block of the function
    entry: IrBlockId,
}

fn predecessor_map(cfg: &IrControlFlowGraph) -> HashMap<IrBlockId, Vec<IrBlockId>> {
    let mut preds: HashMap<IrBlockId, Vec<IrBlockId>> = HashMap::new();
    for block in cfg.blocks.values() {
        for succ in block.all_successors() {
            let list = preds.entry(succ).or_default();
            if !list.contains(&block.id) {
                list.push(block.id);
            }
        }
    }
    preds
}

impl DominatorTree {
    /// Compute the dominator tree for a function using iterative dataflow.
    ///
    /// This uses Cooper, Harvey, and Kennedy's simple iterative algorithm
    /// which is efficient for typical CFGs and easy to understand.
    pub fn compute(function: &IrFunction) -> Self {
        Self::compute_cfg(&function.cfg)
    }

    pub fn compute_cfg(cfg: &IrControlFlowGraph) -> Self {
        let entry = cfg.entry_block;
        let rpo = cfg.reverse_postorder();
        let rpo_index: HashMap<IrBlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let preds = predecessor_map(cfg);

        // Initialize idom: entry dominates itself, others undefined
        let mut idom: HashMap<IrBlockId, Option<IrBlockId>> = HashMap::new();
        for &block in &rpo {
            idom.insert(block, None);
        }
        idom.insert(entry, Some(entry));

        // Iterative dataflow until fixed point
        let mut changed = true;
        while changed {
            changed = false;

            for &block in &rpo {
                if block == entry {
                    continue;
                }

                let mut new_idom: Option<IrBlockId> = None;
                for &pred in preds.get(&block).map(|p| p.as_slice()).unwrap_or(&[]) {
                    if idom.get(&pred).and_then(|x| *x).is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(current, pred, &idom, &rpo_index),
                    });
                }

                if new_idom != idom.get(&block).copied().flatten() {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        let final_idom: HashMap<IrBlockId, IrBlockId> = idom
            .iter()
            .filter(|(&block, _)| block != entry)
            .filter_map(|(&block, &dom)| dom.map(|d| (block, d)))
            .collect();

        let mut children: HashMap<IrBlockId, Vec<IrBlockId>> = HashMap::new();
        for (&block, &dom) in &final_idom {
            children.entry(dom).or_default().push(block);
        }
        for list in children.values_mut() {
            list.sort();
        }

        // Compute depths via BFS from entry
        let mut depth: HashMap<IrBlockId, usize> = HashMap::new();
        depth.insert(entry, 0);
        let mut queue: VecDeque<IrBlockId> = VecDeque::from([entry]);
        while let Some(block) = queue.pop_front() {
            let d = depth.get(&block).copied().unwrap_or(0);
            for &child in children.get(&block).map(|c| c.as_slice()).unwrap_or(&[]) {
                depth.insert(child, d + 1);
                queue.push_back(child);
            }
        }

        Self {
            idom: final_idom,
            children,
            depth,
            rpo,
            entry,
        }
    }

    /// Find intersection of two dominators in the dominator tree.
    fn intersect(
        mut b1: IrBlockId,
        mut b2: IrBlockId,
        idom: &HashMap<IrBlockId, Option<IrBlockId>>,
        rpo_index: &HashMap<IrBlockId, usize>,
    ) -> IrBlockId {
        while b1 != b2 {
            let mut idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
            let mut idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);

            while idx1 > idx2 {
                match idom.get(&b1) {
                    Some(Some(dom)) => {
                        b1 = *dom;
                        idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b1,
                }
            }

            while idx2 > idx1 {
                match idom.get(&b2) {
                    Some(Some(dom)) => {
                        b2 = *dom;
                        idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b2,
                }
            }
        }
        b1
    }

    pub fn entry(&self) -> IrBlockId {
        self.entry
    }

    /// Get the immediate dominator of a block.
    pub fn idom(&self, block: IrBlockId) -> Option<IrBlockId> {
        self.idom.get(&block).copied()
    }

    /// Get children of a block in the dominator tree.
    pub fn children(&self, block: IrBlockId) -> &[IrBlockId] {
        self.children.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Get the depth of a block in the dominator tree.
    pub fn depth(&self, block: IrBlockId) -> usize {
        self.depth.get(&block).copied().unwrap_or(0)
    }

    /// Reachable blocks in reverse postorder
    pub fn reverse_postorder(&self) -> &[IrBlockId] {
        &self.rpo
    }

    pub fn is_reachable(&self, block: IrBlockId) -> bool {
        block == self.entry || self.idom.contains_key(&block)
    }

    /// Check if block A dominates block B.
    pub fn dominates(&self, a: IrBlockId, b: IrBlockId) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(b) {
            return false;
        }

        let mut current = b;
        while let Some(dom) = self.idom.get(&current) {
            if *dom == a {
                return true;
            }
            current = *dom;
        }

        a == self.entry
    }

    /// Check if block A strictly dominates block B (A dominates B and A != B).
    pub fn strictly_dominates(&self, a: IrBlockId, b: IrBlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Dominance frontier of every reachable block
    pub fn dominance_frontiers(
        &self,
        cfg: &IrControlFlowGraph,
    ) -> BTreeMap<IrBlockId, BTreeSet<IrBlockId>> {
        let preds = predecessor_map(cfg);
        let mut frontiers: BTreeMap<IrBlockId, BTreeSet<IrBlockId>> = BTreeMap::new();

        for &block in &self.rpo {
            if block == self.entry {
                continue;
            }
            let reachable_preds: Vec<IrBlockId> = preds
                .get(&block)
                .map(|p| p.iter().copied().filter(|p| self.is_reachable(*p)).collect())
                .unwrap_or_default();
            if reachable_preds.len() < 2 {
                continue;
            }
            let Some(block_idom) = self.idom(block) else {
                continue;
            };
            for pred in reachable_preds {
                let mut runner = pred;
                while runner != block_idom {
                    frontiers.entry(runner).or_default().insert(block);
                    match self.idom(runner) {
                        Some(next) => runner = next,
                        None => break,
                    }
                }
            }
        }

        frontiers
    }

    /// Iterated dominance frontier of a set of blocks
    pub fn iterated_frontier(
        frontiers: &BTreeMap<IrBlockId, BTreeSet<IrBlockId>>,
        blocks: impl IntoIterator<Item = IrBlockId>,
    ) -> BTreeSet<IrBlockId> {
        let mut result = BTreeSet::new();
        let mut worklist: Vec<IrBlockId> = blocks.into_iter().collect();
        while let Some(block) = worklist.pop() {
            for &df in frontiers.get(&block).into_iter().flatten() {
                if result.insert(df) {
                    worklist.push(df);
                }
            }
        }
        result
    }
}

/// A natural loop in the control flow graph.
///
/// A natural loop is defined by a back edge (an edge from B to H where H dominates B).
/// The loop header is H, and the loop body contains all blocks from which H can be
/// reached without going through H.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    /// Loop header block (entry point of the loop)
    pub header: IrBlockId,

    /// All blocks in the loop body (including header)
    pub blocks: HashSet<IrBlockId>,

    /// Nesting depth (0 = outermost)
    pub nesting_depth: usize,

    /// Parent loop header if this is a nested loop
    pub parent: Option<IrBlockId>,
}

/// Loop nest information for a function.
#[derive(Debug, Clone, Default)]
pub struct LoopNestInfo {
    /// All natural loops indexed by header block
    pub loops: HashMap<IrBlockId, NaturalLoop>,

    /// Map from block to its innermost containing loop header
    pub block_to_loop: HashMap<IrBlockId, IrBlockId>,

    /// Maximum nesting depth in the function
    pub max_depth: usize,
}

impl LoopNestInfo {
    /// Analyze loops in a function.
    pub fn analyze(function: &IrFunction, domtree: &DominatorTree) -> Self {
        let cfg = &function.cfg;
        let preds = predecessor_map(cfg);
        let mut loops: HashMap<IrBlockId, NaturalLoop> = HashMap::new();

        for (&block_id, block) in &cfg.blocks {
            if !domtree.is_reachable(block_id) {
                continue;
            }
            for succ in block.all_successors() {
                // A back edge is an edge to a dominator
                if !domtree.dominates(succ, block_id) {
                    continue;
                }
                let body = Self::find_loop_blocks(&preds, succ, block_id);
                loops
                    .entry(succ)
                    .and_modify(|existing| existing.blocks.extend(body.iter().copied()))
                    .or_insert_with(|| NaturalLoop {
                        header: succ,
                        blocks: body,
                        nesting_depth: 0,
                        parent: None,
                    });
            }
        }

        // The innermost enclosing loop is the smallest other loop containing the header
        let headers: Vec<IrBlockId> = loops.keys().copied().collect();
        let mut parents: HashMap<IrBlockId, IrBlockId> = HashMap::new();
        for &header in &headers {
            let parent = headers
                .iter()
                .filter(|&&other| other != header)
                .filter(|other| loops[*other].blocks.contains(&header))
                .filter(|other| !loops[&header].blocks.contains(*other))
                .min_by_key(|other| loops[*other].blocks.len())
                .copied();
            if let Some(parent) = parent {
                parents.insert(header, parent);
            }
        }

        for &header in &headers {
            let mut depth = 0;
            let mut current = header;
            while let Some(&parent) = parents.get(&current) {
                depth += 1;
                current = parent;
            }
            if let Some(l) = loops.get_mut(&header) {
                l.nesting_depth = depth;
                l.parent = parents.get(&header).copied();
            }
        }

        let max_depth = loops.values().map(|l| l.nesting_depth).max().unwrap_or(0);

        // Map each block to its innermost loop
        let mut block_to_loop: HashMap<IrBlockId, IrBlockId> = HashMap::new();
        for (&header, loop_info) in &loops {
            for &block in &loop_info.blocks {
                let deeper = match block_to_loop.get(&block) {
                    Some(existing) => loop_info.nesting_depth > loops[existing].nesting_depth,
                    None => true,
                };
                if deeper {
                    block_to_loop.insert(block, header);
                }
            }
        }

        Self {
            loops,
            block_to_loop,
            max_depth,
        }
    }

    /// Find all blocks in a natural loop given header and back edge source.
    fn find_loop_blocks(
        preds: &HashMap<IrBlockId, Vec<IrBlockId>>,
        header: IrBlockId,
        back_edge_source: IrBlockId,
    ) -> HashSet<IrBlockId> {
        let mut loop_blocks = HashSet::from([header]);
        if header == back_edge_source {
            return loop_blocks;
        }

        // Work backwards from back_edge_source to find all blocks that can reach header
        let mut worklist = vec![back_edge_source];
        loop_blocks.insert(back_edge_source);
        while let Some(block) = worklist.pop() {
            for &pred in preds.get(&block).map(|p| p.as_slice()).unwrap_or(&[]) {
                if loop_blocks.insert(pred) {
                    worklist.push(pred);
                }
            }
        }

        loop_blocks
    }

    /// Get the loop containing a block, if any.
    pub fn get_loop(&self, block: IrBlockId) -> Option<&NaturalLoop> {
        self.block_to_loop.get(&block).and_then(|h| self.loops.get(h))
    }

    /// Get loop depth for a block (0 if not in any loop).
    pub fn loop_depth(&self, block: IrBlockId) -> usize {
        self.get_loop(block).map(|l| l.nesting_depth + 1).unwrap_or(0)
    }

    /// Check if a block is inside any loop.
    pub fn in_loop(&self, block: IrBlockId) -> bool {
        self.block_to_loop.contains_key(&block)
    }

    /// Check if a block is a loop header.
    pub fn is_loop_header(&self, block: IrBlockId) -> bool {
        self.loops.contains_key(&block)
    }
}

/// Mark loop headers in block metadata.
pub fn annotate_loop_headers(function: &mut IrFunction, loop_info: &LoopNestInfo) {
    for block in function.cfg.blocks.values_mut() {
        block.metadata.is_loop_header = loop_info.is_loop_header(block.id);
    }
}

/// Fill in block frequencies as `10^loop_depth` unless the function already
/// carries a profile. Returns whether estimates were written.
pub fn estimate_block_frequencies(function: &mut IrFunction, loop_info: &LoopNestInfo) -> bool {
    let profiled = function
        .cfg
        .blocks
        .values()
        .any(|b| b.metadata.frequency > 0.0);
    if profiled {
        return false;
    }
    for block in function.cfg.blocks.values_mut() {
        let depth = loop_info.loop_depth(block.id).min(8) as i32;
        block.metadata.frequency = 10f64.powi(depth);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, IrType, MethodFlags};

    fn start(builder: &mut IrBuilder, name: &str) {
        let class = builder.registry_mut().add_class("T");
        let m = builder.registry_mut().add_method(
            class,
            name,
            vec![IrType::Bool],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
    }

    #[test]
    fn test_dominator_tree_simple() {
        // Diamond: entry -> bb1/bb2 -> bb3
        let mut builder = IrBuilder::new("test");
        start(&mut builder, "diamond");

        let cond = builder.param(0).unwrap();
        let bb1 = builder.create_block().unwrap();
        let bb2 = builder.create_block().unwrap();
        let bb3 = builder.create_block().unwrap();
        builder.build_cond_branch(cond, bb1, bb2).unwrap();
        builder.switch_to_block(bb1);
        builder.build_branch(bb3).unwrap();
        builder.switch_to_block(bb2);
        builder.build_branch(bb3).unwrap();
        builder.switch_to_block(bb3);
        builder.build_return(None).unwrap();
        builder.finish_function();

        let function = builder.module.functions.values().next().unwrap();
        let domtree = DominatorTree::compute(function);

        assert!(domtree.dominates(IrBlockId::entry(), bb3));
        assert!(!domtree.dominates(bb1, bb2));
        assert!(!domtree.dominates(bb2, bb1));
        assert_eq!(domtree.idom(bb3), Some(IrBlockId::entry()));

        let df = domtree.dominance_frontiers(&function.cfg);
        assert_eq!(df.get(&bb1), Some(&BTreeSet::from([bb3])));
        assert_eq!(df.get(&bb2), Some(&BTreeSet::from([bb3])));
        assert!(df.get(&IrBlockId::entry()).is_none());
    }

    #[test]
    fn test_simple_loop_detection_and_frequencies() {
        // entry -> header <-> body, header -> exit
        let mut builder = IrBuilder::new("test");
        start(&mut builder, "loop_test");

        let cond = builder.param(0).unwrap();
        let header = builder.create_block().unwrap();
        let body = builder.create_block().unwrap();
        let exit = builder.create_block().unwrap();
        builder.build_branch(header).unwrap();
        builder.switch_to_block(header);
        builder.build_cond_branch(cond, body, exit).unwrap();
        builder.switch_to_block(body);
        builder.build_branch(header).unwrap();
        builder.switch_to_block(exit);
        builder.build_return(None).unwrap();
        builder.finish_function();

        let function = builder.module.functions.values_mut().next().unwrap();
        let domtree = DominatorTree::compute(function);
        let loop_info = LoopNestInfo::analyze(function, &domtree);

        assert_eq!(loop_info.loops.len(), 1);
        assert!(loop_info.is_loop_header(header));
        let the_loop = &loop_info.loops[&header];
        assert!(the_loop.blocks.contains(&body));
        assert!(!the_loop.blocks.contains(&exit));
        assert_eq!(loop_info.loop_depth(body), 1);
        assert_eq!(loop_info.loop_depth(exit), 0);

        assert!(estimate_block_frequencies(function, &loop_info));
        assert_eq!(function.cfg.get_block(body).unwrap().metadata.frequency, 10.0);
        assert_eq!(function.cfg.get_block(exit).unwrap().metadata.frequency, 1.0);
        // A second call keeps the existing estimates
        assert!(!estimate_block_frequencies(function, &loop_info));
    }
}
