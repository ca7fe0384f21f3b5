//! IR Basic Blocks
//!
//! Basic blocks form the nodes of the control flow graph. Besides its normal
//! successors (given by the terminator) every block may carry one exception
//! dispatch successor, taken when any instruction in the block throws.

use super::{IrId, IrInstruction, IrType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A basic block in the IR
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrBasicBlock {
    /// Unique identifier for this block
    pub id: IrBlockId,

    /// Human-readable label (for debugging)
    pub label: Option<String>,

    /// Whether this block handles exceptions
    pub kind: BlockKind,

    /// Instructions in this block (executed sequentially)
    pub instructions: Vec<IrInstruction>,

    /// Terminator (branch, return, throw)
    pub terminator: IrTerminator,

    /// Phi nodes at the beginning of this block
    pub phi_nodes: Vec<IrPhiNode>,

    /// Exception successor
    pub dispatch: Option<IrBlockId>,

    /// Predecessors in the CFG, including exceptional ones
    pub predecessors: Vec<IrBlockId>,

    /// Metadata for optimization hints
    pub metadata: BlockMetadata,
}

/// Unique identifier for basic blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrBlockId(pub u32);

impl IrBlockId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn entry() -> Self {
        Self(0)
    }

    pub fn is_entry(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for IrBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Basic,
    Dispatch,
}

/// Phi node for merging values from different control flow paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrPhiNode {
    /// Destination register for the phi result
    pub dest: IrId,

    /// Incoming values from predecessor blocks
    pub incoming: Vec<(IrBlockId, IrId)>,

    /// Type of the phi node
    pub ty: IrType,
}

/// Terminators that end a basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrTerminator {
    /// Unconditional branch to another block
    Branch { target: IrBlockId },

    /// Branch to `true_target` when `condition` is nonzero
    CondBranch {
        condition: IrId,
        true_target: IrBlockId,
        false_target: IrBlockId,
    },

    /// Return from function
    Return { value: Option<IrId> },

    /// Throw an exception to the dispatch successor, or out of the method
    Throw { exception: IrId },

    /// Unreachable code (also marks an unfinished block)
    Unreachable,
}

impl IrTerminator {
    pub fn uses(&self) -> Vec<IrId> {
        match self {
            IrTerminator::CondBranch { condition, .. } => vec![*condition],
            IrTerminator::Return { value } => value.iter().copied().collect(),
            IrTerminator::Throw { exception } => vec![*exception],
            IrTerminator::Branch { .. } | IrTerminator::Unreachable => vec![],
        }
    }

    pub fn uses_mut(&mut self) -> Vec<&mut IrId> {
        match self {
            IrTerminator::CondBranch { condition, .. } => vec![condition],
            IrTerminator::Return { value } => value.iter_mut().collect(),
            IrTerminator::Throw { exception } => vec![exception],
            IrTerminator::Branch { .. } | IrTerminator::Unreachable => vec![],
        }
    }

    fn retarget(&mut self, from: IrBlockId, to: IrBlockId) {
        match self {
            IrTerminator::Branch { target } if *target == from => *target = to,
            IrTerminator::CondBranch {
                true_target,
                false_target,
                ..
            } => {
                if *true_target == from {
                    *true_target = to;
                }
                if *false_target == from {
                    *false_target = to;
                }
            }
            _ => {}
        }
    }
}

/// Metadata for optimization and analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Estimated execution frequency; zero when no estimate exists
    pub frequency: f64,

    /// Whether this block is a loop header
    pub is_loop_header: bool,
}

impl IrBasicBlock {
    /// Create a new basic block
    pub fn new(id: IrBlockId) -> Self {
        Self {
            id,
            label: None,
            kind: BlockKind::Basic,
            instructions: Vec::new(),
            terminator: IrTerminator::Unreachable,
            phi_nodes: Vec::new(),
            dispatch: None,
            predecessors: Vec::new(),
            metadata: BlockMetadata::default(),
        }
    }

    /// Add an instruction to this block
    pub fn add_instruction(&mut self, inst: IrInstruction) {
        self.instructions.push(inst);
    }

    /// Add a phi node to this block
    pub fn add_phi(&mut self, phi: IrPhiNode) {
        self.phi_nodes.push(phi);
    }

    /// Set the terminator for this block
    pub fn set_terminator(&mut self, term: IrTerminator) {
        self.terminator = term;
    }

    /// Normal successor blocks based on the terminator
    pub fn successors(&self) -> Vec<IrBlockId> {
        match &self.terminator {
            IrTerminator::Branch { target } => vec![*target],
            IrTerminator::CondBranch {
                true_target,
                false_target,
                ..
            } => {
                vec![*true_target, *false_target]
            }
            IrTerminator::Return { .. }
            | IrTerminator::Throw { .. }
            | IrTerminator::Unreachable => Vec::new(),
        }
    }

    /// Normal successors followed by the exception successor
    pub fn all_successors(&self) -> Vec<IrBlockId> {
        let mut succs = self.successors();
        if let Some(dispatch) = self.dispatch {
            succs.push(dispatch);
        }
        succs
    }

    /// Whether control can leave this block through its exception successor
    pub fn can_throw(&self) -> bool {
        matches!(self.terminator, IrTerminator::Throw { .. })
            || self.instructions.iter().any(|inst| inst.can_throw())
    }

    /// Check if this block is terminated properly
    pub fn is_terminated(&self) -> bool {
        !matches!(self.terminator, IrTerminator::Unreachable)
    }
}

/// Control flow graph of one function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrControlFlowGraph {
    /// All basic blocks in the function, ordered by id
    pub blocks: BTreeMap<IrBlockId, IrBasicBlock>,

    /// Entry block ID
    pub entry_block: IrBlockId,

    /// Next available block ID
    pub next_block_id: u32,
}

impl Default for IrControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl IrControlFlowGraph {
    /// Create a new CFG with an entry block
    pub fn new() -> Self {
        let mut blocks = BTreeMap::new();
        let entry_block = IrBlockId::entry();
        blocks.insert(entry_block, IrBasicBlock::new(entry_block));

        Self {
            blocks,
            entry_block,
            next_block_id: 1,
        }
    }

    /// Create a new basic block
    pub fn create_block(&mut self) -> IrBlockId {
        let id = IrBlockId::new(self.next_block_id);
        self.next_block_id += 1;
        self.blocks.insert(id, IrBasicBlock::new(id));
        id
    }

    /// Create a new exception dispatch block
    pub fn create_dispatch_block(&mut self) -> IrBlockId {
        let id = self.create_block();
        if let Some(block) = self.blocks.get_mut(&id) {
            block.kind = BlockKind::Dispatch;
        }
        id
    }

    /// Get a block by ID
    pub fn get_block(&self, id: IrBlockId) -> Option<&IrBasicBlock> {
        self.blocks.get(&id)
    }

    /// Get a mutable block by ID
    pub fn get_block_mut(&mut self, id: IrBlockId) -> Option<&mut IrBasicBlock> {
        self.blocks.get_mut(&id)
    }

    /// Connect two blocks (update predecessors)
    pub fn connect_blocks(&mut self, from: IrBlockId, to: IrBlockId) {
        if let Some(to_block) = self.blocks.get_mut(&to) {
            if !to_block.predecessors.contains(&from) {
                to_block.predecessors.push(from);
            }
        }
    }

    /// Recompute every predecessor list from terminators and dispatch edges
    pub fn rebuild_predecessors(&mut self) {
        let edges: Vec<(IrBlockId, IrBlockId)> = self
            .blocks
            .values()
            .flat_map(|b| b.all_successors().into_iter().map(move |s| (b.id, s)))
            .collect();
        for block in self.blocks.values_mut() {
            block.predecessors.clear();
        }
        for (from, to) in edges {
            self.connect_blocks(from, to);
        }
    }

    /// Blocks reachable from the entry in reverse postorder
    pub fn reverse_postorder(&self) -> Vec<IrBlockId> {
        let mut visited = BTreeSet::new();
        let mut postorder = Vec::with_capacity(self.blocks.len());
        // Iterative DFS: (block, next successor index)
        let mut stack: Vec<(IrBlockId, usize)> = vec![(self.entry_block, 0)];
        visited.insert(self.entry_block);

        while let Some((block, idx)) = stack.pop() {
            let succs = self
                .blocks
                .get(&block)
                .map(|b| b.all_successors())
                .unwrap_or_default();
            if idx < succs.len() {
                stack.push((block, idx + 1));
                let next = succs[idx];
                if self.blocks.contains_key(&next) && visited.insert(next) {
                    stack.push((next, 0));
                }
            } else {
                postorder.push(block);
            }
        }

        postorder.reverse();
        postorder
    }

    /// Split `id` before instruction `at`. The tail, terminator and dispatch
    /// successor move to a new block which the original branches to.
    pub fn split_block(&mut self, id: IrBlockId, at: usize) -> Option<IrBlockId> {
        let len = self.blocks.get(&id)?.instructions.len();
        if at > len {
            return None;
        }
        let new_id = self.create_block();

        let block = self.blocks.get_mut(&id)?;
        let tail = block.instructions.split_off(at);
        let terminator = std::mem::replace(
            &mut block.terminator,
            IrTerminator::Branch { target: new_id },
        );
        let dispatch = block.dispatch;
        let metadata = BlockMetadata {
            frequency: block.metadata.frequency,
            is_loop_header: false,
        };

        let new_block = self.blocks.get_mut(&new_id)?;
        new_block.instructions = tail;
        new_block.terminator = terminator;
        new_block.dispatch = dispatch;
        new_block.metadata = metadata;

        // Normal successors now come from the new block. The dispatch target
        // is reachable from both halves.
        let normal_succs = self.blocks.get(&new_id)?.successors();
        for succ in normal_succs {
            if let Some(succ_block) = self.blocks.get_mut(&succ) {
                for phi in &mut succ_block.phi_nodes {
                    for (pred, _) in &mut phi.incoming {
                        if *pred == id {
                            *pred = new_id;
                        }
                    }
                }
            }
        }
        if let Some(dispatch) = dispatch {
            if let Some(succ_block) = self.blocks.get_mut(&dispatch) {
                for phi in &mut succ_block.phi_nodes {
                    let extra: Vec<_> = phi
                        .incoming
                        .iter()
                        .filter(|(pred, _)| *pred == id)
                        .map(|(_, value)| (new_id, *value))
                        .collect();
                    phi.incoming.extend(extra);
                }
            }
        }

        self.rebuild_predecessors();
        Some(new_id)
    }

    /// Give `id` the exception successor of `from`. Phis in the dispatch block
    /// receive the same inputs from `id` as from `from`.
    pub fn inherit_dispatch(&mut self, id: IrBlockId, from: IrBlockId) {
        let Some(dispatch) = self.blocks.get(&from).and_then(|b| b.dispatch) else {
            return;
        };
        if let Some(block) = self.blocks.get_mut(&id) {
            block.dispatch = Some(dispatch);
        }
        if let Some(target) = self.blocks.get_mut(&dispatch) {
            for phi in &mut target.phi_nodes {
                let extra: Vec<_> = phi
                    .incoming
                    .iter()
                    .filter(|(pred, _)| *pred == from)
                    .map(|(_, value)| (id, *value))
                    .collect();
                phi.incoming.extend(extra);
            }
        }
        self.rebuild_predecessors();
    }

    /// Replace the terminator of `id` and refresh predecessor lists
    pub fn replace_terminator(&mut self, id: IrBlockId, terminator: IrTerminator) {
        if let Some(block) = self.blocks.get_mut(&id) {
            block.terminator = terminator;
        }
        self.rebuild_predecessors();
    }

    /// Redirect the edge `from -> old` to `from -> new`, keeping phi inputs
    pub fn retarget_edge(&mut self, from: IrBlockId, old: IrBlockId, new: IrBlockId) {
        if let Some(block) = self.blocks.get_mut(&from) {
            block.terminator.retarget(old, new);
        }
        self.rebuild_predecessors();
    }

    /// Drop exception edges of the given blocks when nothing in them can throw
    pub fn drop_dead_dispatch_edges(&mut self, candidates: &[IrBlockId]) -> usize {
        let mut dropped = 0;
        for id in candidates {
            if let Some(block) = self.blocks.get_mut(id) {
                if block.dispatch.is_some() && !block.can_throw() {
                    block.dispatch = None;
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.rebuild_predecessors();
            self.prune_phi_inputs();
        }
        dropped
    }

    /// Remove blocks unreachable from the entry, returning how many were removed
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let mut reachable = BTreeSet::new();
        let mut worklist = VecDeque::from([self.entry_block]);
        while let Some(id) = worklist.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(block) = self.blocks.get(&id) {
                worklist.extend(block.all_successors());
            }
        }

        let before = self.blocks.len();
        self.blocks.retain(|id, _| reachable.contains(id));
        let removed = before - self.blocks.len();
        if removed > 0 {
            self.rebuild_predecessors();
            self.prune_phi_inputs();
        }
        removed
    }

    /// Drop phi inputs whose block is no longer a predecessor
    fn prune_phi_inputs(&mut self) {
        for block in self.blocks.values_mut() {
            let preds = block.predecessors.clone();
            for phi in &mut block.phi_nodes {
                phi.incoming.retain(|(pred, _)| preds.contains(pred));
            }
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }

    /// Verify CFG integrity
    pub fn verify(&self) -> Result<(), String> {
        // Check entry block exists
        if !self.blocks.contains_key(&self.entry_block) {
            return Err("Entry block not found".to_string());
        }

        for (id, block) in &self.blocks {
            if !block.is_terminated() {
                return Err(format!("Block {} is not properly terminated", id));
            }

            for succ in block.all_successors() {
                if !self.blocks.contains_key(&succ) {
                    return Err(format!(
                        "Block {} references non-existent successor {}",
                        id, succ
                    ));
                }
            }

            if let Some(dispatch) = block.dispatch {
                if self.blocks.get(&dispatch).map(|b| b.kind) != Some(BlockKind::Dispatch) {
                    return Err(format!(
                        "Block {} has exception successor {} which is not a dispatch block",
                        id, dispatch
                    ));
                }
            }

            for phi in &block.phi_nodes {
                for (pred_block, _) in &phi.incoming {
                    if !block.predecessors.contains(pred_block) {
                        return Err(format!(
                            "Phi node in block {} references non-predecessor block {}",
                            id, pred_block
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
