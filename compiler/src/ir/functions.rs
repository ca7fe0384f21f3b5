//! IR Functions
//!
//! A function is one method body: its parameters, register types, non-SSA
//! variables and control flow graph.

use super::descriptors::MethodId;
use super::{
    IrBlockId, IrControlFlowGraph, IrId, IrInstruction, IrTerminator, IrType, IrValue, VarId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// IR function representation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrFunction {
    /// Method this body belongs to
    pub method: MethodId,

    /// Function name (for dumps and diagnostics)
    pub name: String,

    /// Parameters, including the receiver for instance methods
    pub params: Vec<IrParameter>,

    /// Return type
    pub return_type: IrType,

    pub is_static: bool,

    /// Whether the method body runs under the receiver's monitor
    pub is_synchronized: bool,

    /// Control flow graph (function body)
    pub cfg: IrControlFlowGraph,

    /// Non-SSA variables
    pub vars: BTreeMap<VarId, IrVar>,

    /// Type information for all registers
    pub register_types: HashMap<IrId, IrType>,

    /// Next available register ID
    pub next_reg_id: u32,

    /// Next available variable ID
    pub next_var_id: u32,
}

/// Function parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrParameter {
    pub name: String,
    pub ty: IrType,
    /// Register defined by the parameter's `DefArg`
    pub reg: IrId,
}

/// Non-SSA local variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrVar {
    pub name: String,
    pub ty: IrType,
}

/// Where a register is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefSite {
    Inst { block: IrBlockId, index: usize },
    Phi { block: IrBlockId },
}

impl DefSite {
    pub fn block(&self) -> IrBlockId {
        match self {
            DefSite::Inst { block, .. } | DefSite::Phi { block } => *block,
        }
    }
}

impl IrFunction {
    /// Create a new function whose entry block defines every parameter with
    /// a `DefArg` instruction
    pub fn new(
        method: MethodId,
        name: impl Into<String>,
        params: Vec<(String, IrType)>,
        return_type: IrType,
        is_static: bool,
    ) -> Self {
        let mut function = Self {
            method,
            name: name.into(),
            params: Vec::new(),
            return_type,
            is_static,
            is_synchronized: false,
            cfg: IrControlFlowGraph::new(),
            vars: BTreeMap::new(),
            register_types: HashMap::new(),
            next_reg_id: 0,
            next_var_id: 0,
        };

        let entry = function.cfg.entry_block;
        for (index, (name, ty)) in params.into_iter().enumerate() {
            let reg = function.alloc_typed_reg(ty.clone());
            function.params.push(IrParameter { name, ty, reg });
            if let Some(block) = function.cfg.get_block_mut(entry) {
                block.add_instruction(IrInstruction::DefArg {
                    dest: reg,
                    index: index as u32,
                });
            }
        }

        function
    }

    /// Allocate a new register
    pub fn alloc_reg(&mut self) -> IrId {
        let id = IrId::new(self.next_reg_id);
        self.next_reg_id += 1;
        id
    }

    /// Allocate a new register and record its type
    pub fn alloc_typed_reg(&mut self, ty: IrType) -> IrId {
        let reg = self.alloc_reg();
        self.register_types.insert(reg, ty);
        reg
    }

    /// Declare a non-SSA variable
    pub fn declare_var(&mut self, name: impl Into<String>, ty: IrType) -> VarId {
        let id = VarId(self.next_var_id);
        self.next_var_id += 1;
        self.vars.insert(
            id,
            IrVar {
                name: name.into(),
                ty,
            },
        );
        id
    }

    pub fn value_type(&self, id: IrId) -> Option<&IrType> {
        self.register_types.get(&id)
    }

    pub fn is_reference(&self, id: IrId) -> bool {
        self.value_type(id).map(|t| t.is_reference()).unwrap_or(false)
    }

    /// Get the entry block
    pub fn entry_block(&self) -> IrBlockId {
        self.cfg.entry_block
    }

    /// Get parameter register by index
    pub fn get_param_reg(&self, index: usize) -> Option<IrId> {
        self.params.get(index).map(|p| p.reg)
    }

    /// Receiver register of an instance method
    pub fn this_reg(&self) -> Option<IrId> {
        if self.is_static {
            None
        } else {
            self.get_param_reg(0)
        }
    }

    /// Index in the entry block just past the leading `DefArg`s
    pub fn entry_insertion_point(&self) -> usize {
        self.cfg
            .get_block(self.cfg.entry_block)
            .map(|b| {
                b.instructions
                    .iter()
                    .take_while(|i| matches!(i, IrInstruction::DefArg { .. }))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Insert a constant at the entry block and return its register
    pub fn insert_entry_const(&mut self, value: IrValue, ty: IrType) -> IrId {
        let dest = self.alloc_typed_reg(ty);
        let at = self.entry_insertion_point();
        let entry = self.cfg.entry_block;
        if let Some(block) = self.cfg.get_block_mut(entry) {
            block
                .instructions
                .insert(at, IrInstruction::Const { dest, value });
        }
        dest
    }

    /// Check if this function is a leaf function (doesn't call other functions)
    pub fn is_leaf(&self) -> bool {
        !self
            .cfg
            .blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .any(|inst| {
                matches!(
                    inst,
                    IrInstruction::DirectCall { .. } | IrInstruction::IndirectCall { .. }
                )
            })
    }

    /// Find where a register is defined
    pub fn locate_def(&self, id: IrId) -> Option<DefSite> {
        for (block_id, block) in &self.cfg.blocks {
            if block.phi_nodes.iter().any(|phi| phi.dest == id) {
                return Some(DefSite::Phi { block: *block_id });
            }
            if let Some(index) = block
                .instructions
                .iter()
                .position(|inst| inst.dest() == Some(id))
            {
                return Some(DefSite::Inst {
                    block: *block_id,
                    index,
                });
            }
        }
        None
    }

    /// Map of every register to its definition site
    pub fn def_sites(&self) -> HashMap<IrId, DefSite> {
        let mut sites = HashMap::new();
        for (block_id, block) in &self.cfg.blocks {
            for phi in &block.phi_nodes {
                sites.insert(phi.dest, DefSite::Phi { block: *block_id });
            }
            for (index, inst) in block.instructions.iter().enumerate() {
                if let Some(dest) = inst.dest() {
                    sites.insert(
                        dest,
                        DefSite::Inst {
                            block: *block_id,
                            index,
                        },
                    );
                }
            }
        }
        sites
    }

    /// Number of reads of each register across phis, instructions and terminators
    pub fn use_counts(&self) -> HashMap<IrId, usize> {
        let mut counts: HashMap<IrId, usize> = HashMap::new();
        for block in self.cfg.blocks.values() {
            for phi in &block.phi_nodes {
                for (_, value) in &phi.incoming {
                    *counts.entry(*value).or_default() += 1;
                }
            }
            for inst in &block.instructions {
                for used in inst.uses() {
                    *counts.entry(used).or_default() += 1;
                }
            }
            for used in block.terminator.uses() {
                *counts.entry(used).or_default() += 1;
            }
        }
        counts
    }

    /// Constant values defined in this function
    pub fn constants(&self) -> HashMap<IrId, &IrValue> {
        self.cfg
            .blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .filter_map(|inst| match inst {
                IrInstruction::Const { dest, value } => Some((*dest, value)),
                _ => None,
            })
            .collect()
    }

    /// Blocks that return normally
    pub fn exit_blocks(&self) -> Vec<IrBlockId> {
        self.cfg
            .blocks
            .values()
            .filter(|b| matches!(b.terminator, IrTerminator::Return { .. }))
            .map(|b| b.id)
            .collect()
    }

    /// Verify function integrity
    pub fn verify(&self) -> Result<(), String> {
        self.cfg.verify()?;

        // Verify entry block has no phi nodes
        if let Some(entry) = self.cfg.get_block(self.cfg.entry_block) {
            if !entry.phi_nodes.is_empty() {
                return Err("Entry block cannot have phi nodes".to_string());
            }
        }

        // Every register is defined at most once
        let mut seen = std::collections::HashSet::new();
        for block in self.cfg.blocks.values() {
            let dests = block
                .phi_nodes
                .iter()
                .map(|p| p.dest)
                .chain(block.instructions.iter().filter_map(|i| i.dest()));
            for dest in dests {
                if !seen.insert(dest) {
                    return Err(format!("Register {} defined more than once", dest));
                }
            }
        }

        Ok(())
    }

    /// Compute statistics for this function
    pub fn compute_stats(&self) -> FunctionStats {
        let mut stats = FunctionStats {
            block_count: self.cfg.blocks.len(),
            var_count: self.vars.len(),
            ..FunctionStats::default()
        };

        for block in self.cfg.blocks.values() {
            stats.instruction_count += block.instructions.len();
            stats.phi_count += block.phi_nodes.len();
            stats.allocation_count += block
                .instructions
                .iter()
                .filter(|i| {
                    matches!(
                        i,
                        IrInstruction::NewObj { .. } | IrInstruction::NewArray { .. }
                    )
                })
                .count();
            stats.monitor_count += block
                .instructions
                .iter()
                .filter(|i| {
                    matches!(
                        i,
                        IrInstruction::MonitorEnter { .. } | IrInstruction::MonitorExit { .. }
                    )
                })
                .count();
        }

        stats
    }
}

/// Function statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FunctionStats {
    pub block_count: usize,
    pub instruction_count: usize,
    pub phi_count: usize,
    pub var_count: usize,
    pub allocation_count: usize,
    pub monitor_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ClassId;

    #[test]
    fn test_function_creation() {
        let func = IrFunction::new(
            MethodId(1),
            "add",
            vec![
                ("this".to_string(), IrType::Object(ClassId(0))),
                ("y".to_string(), IrType::I32),
            ],
            IrType::I32,
            false,
        );

        assert_eq!(func.name, "add");
        assert_eq!(func.params.len(), 2);
        assert!(func.is_leaf());
        assert_ne!(func.params[0].reg, func.params[1].reg);
        assert_eq!(func.this_reg(), Some(func.params[0].reg));
        assert_eq!(func.entry_insertion_point(), 2);
        assert!(func.is_reference(func.params[0].reg));
        assert!(!func.is_reference(func.params[1].reg));
    }

    #[test]
    fn test_entry_const_goes_after_args() {
        let mut func = IrFunction::new(
            MethodId(0),
            "f",
            vec![("x".to_string(), IrType::I32)],
            IrType::Void,
            true,
        );
        let c = func.insert_entry_const(IrValue::I32(0), IrType::I32);
        let entry = func.cfg.get_block(func.entry_block()).unwrap();
        assert!(matches!(entry.instructions[0], IrInstruction::DefArg { .. }));
        assert_eq!(entry.instructions[1].dest(), Some(c));
        assert_eq!(
            func.locate_def(c),
            Some(DefSite::Inst {
                block: func.entry_block(),
                index: 1
            })
        );
        assert_eq!(func.this_reg(), None);
    }
}
