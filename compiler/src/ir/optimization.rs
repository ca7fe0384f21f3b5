//! IR Optimization Passes
//!
//! Optimizations are organized into passes that can be run independently.
//! Escape analysis is the main pass; the cleanup passes here tidy up what it
//! leaves behind (dead address computations, copies from SSA repair, blocks
//! cut off by removed exception edges).

use super::escape::{EscapeAnalysisPass, EscapeOptions};
use super::{IrFunction, IrId, IrInstruction, IrModule};
use std::collections::{HashMap, HashSet};

/// Optimization pass trait
pub trait OptimizationPass {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Run the pass on a module
    fn run_on_module(&mut self, module: &mut IrModule) -> OptimizationResult;

    /// Run the pass on a function (default implementation does nothing)
    fn run_on_function(&mut self, _function: &mut IrFunction) -> OptimizationResult {
        OptimizationResult::unchanged()
    }
}

/// Result of an optimization pass
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    /// Whether the IR was modified
    pub modified: bool,

    /// Number of instructions eliminated
    pub instructions_eliminated: usize,

    /// Number of blocks eliminated
    pub blocks_eliminated: usize,

    /// Other statistics
    pub stats: HashMap<String, usize>,
}

impl OptimizationResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Create a result indicating changes
    pub fn changed() -> Self {
        Self {
            modified: true,
            ..Self::default()
        }
    }

    pub fn add_stat(&mut self, key: &str, value: usize) {
        if value > 0 {
            *self.stats.entry(key.to_string()).or_insert(0) += value;
        }
    }

    pub fn stat(&self, key: &str) -> usize {
        self.stats.get(key).copied().unwrap_or(0)
    }

    /// Combine results
    pub fn combine(mut self, other: OptimizationResult) -> Self {
        self.modified |= other.modified;
        self.instructions_eliminated += other.instructions_eliminated;
        self.blocks_eliminated += other.blocks_eliminated;

        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }

        self
    }
}

/// Optimization pass manager
pub struct PassManager {
    passes: Vec<Box<dyn OptimizationPass>>,
    max_iterations: usize,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Create a new pass manager
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            max_iterations: 4,
        }
    }

    /// Add a pass to the manager
    pub fn add_pass<P: OptimizationPass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations.max(1);
        self
    }

    /// Escape analysis followed by cleanup
    pub fn escape_pipeline(options: EscapeOptions) -> Self {
        let mut manager = Self::new();
        manager.add_pass(EscapeAnalysisPass::new(options));
        manager.add_pass(CopyPropagationPass::new());
        manager.add_pass(DeadCodeEliminationPass::new());
        manager.add_pass(UnreachableBlockEliminationPass::new());
        manager
    }

    /// Cleanup passes only, for running after a separately driven escape pass
    pub fn cleanup() -> Self {
        let mut manager = Self::new();
        manager.add_pass(CopyPropagationPass::new());
        manager.add_pass(DeadCodeEliminationPass::new());
        manager.add_pass(UnreachableBlockEliminationPass::new());
        manager
    }

    /// Run all passes until nothing changes
    pub fn run(&mut self, module: &mut IrModule) -> OptimizationResult {
        let mut total_result = OptimizationResult::unchanged();

        for _ in 0..self.max_iterations {
            let mut changed = false;

            for pass in &mut self.passes {
                let result = pass.run_on_module(module);
                if result.modified {
                    changed = true;
                }
                total_result = total_result.combine(result);
            }

            if !changed {
                break;
            }
        }

        total_result
    }
}

/// Dead code elimination pass
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    pub fn new() -> Self {
        Self
    }

    /// Remove dead instructions from a function until none are left
    fn eliminate_dead_instructions(&self, function: &mut IrFunction) -> usize {
        let mut eliminated = 0;
        loop {
            let used: HashSet<IrId> = function.use_counts().into_keys().collect();
            let mut round = 0;

            for block in function.cfg.blocks.values_mut() {
                let phis = block.phi_nodes.len();
                block.phi_nodes.retain(|phi| used.contains(&phi.dest));

                let original_len = block.instructions.len();
                block.instructions.retain(|inst| match inst.dest() {
                    Some(dest) => used.contains(&dest) || inst.has_side_effects(),
                    None => true,
                });
                round += phis - block.phi_nodes.len() + original_len - block.instructions.len();
            }

            if round == 0 {
                return eliminated;
            }
            eliminated += round;
        }
    }
}

impl OptimizationPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run_on_module(&mut self, module: &mut IrModule) -> OptimizationResult {
        let mut result = OptimizationResult::unchanged();
        for function in module.functions.values_mut() {
            result = result.combine(self.run_on_function(function));
        }
        result
    }

    fn run_on_function(&mut self, function: &mut IrFunction) -> OptimizationResult {
        let eliminated = self.eliminate_dead_instructions(function);
        let mut result = OptimizationResult::unchanged();
        if eliminated > 0 {
            result.modified = true;
            result.instructions_eliminated = eliminated;
        }
        result
    }
}

/// Copy propagation pass
#[derive(Default)]
pub struct CopyPropagationPass;

impl CopyPropagationPass {
    pub fn new() -> Self {
        Self
    }

    fn resolve(copies: &HashMap<IrId, IrId>, mut id: IrId) -> IrId {
        let mut steps = 0;
        while let Some(&src) = copies.get(&id) {
            if src == id || steps > copies.len() {
                break;
            }
            id = src;
            steps += 1;
        }
        id
    }
}

impl OptimizationPass for CopyPropagationPass {
    fn name(&self) -> &'static str {
        "copy-propagation"
    }

    fn run_on_module(&mut self, module: &mut IrModule) -> OptimizationResult {
        let mut result = OptimizationResult::unchanged();
        for function in module.functions.values_mut() {
            result = result.combine(self.run_on_function(function));
        }
        result
    }

    fn run_on_function(&mut self, function: &mut IrFunction) -> OptimizationResult {
        let copies: HashMap<IrId, IrId> = function
            .cfg
            .blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .filter_map(|inst| match inst {
                IrInstruction::Copy { dest, src } => Some((*dest, *src)),
                _ => None,
            })
            .collect();
        if copies.is_empty() {
            return OptimizationResult::unchanged();
        }

        let mut replaced = 0;
        for block in function.cfg.blocks.values_mut() {
            for phi in &mut block.phi_nodes {
                for (_, value) in &mut phi.incoming {
                    let resolved = Self::resolve(&copies, *value);
                    if resolved != *value {
                        *value = resolved;
                        replaced += 1;
                    }
                }
            }
            let operands = block
                .instructions
                .iter_mut()
                .filter(|inst| !matches!(inst, IrInstruction::Copy { .. }))
                .flat_map(|inst| inst.uses_mut())
                .chain(block.terminator.uses_mut());
            for operand in operands {
                let resolved = Self::resolve(&copies, *operand);
                if resolved != *operand {
                    *operand = resolved;
                    replaced += 1;
                }
            }
        }

        let mut result = OptimizationResult::unchanged();
        if replaced > 0 {
            result.modified = true;
            result.add_stat("copies_propagated", replaced);
        }
        result
    }
}

/// Unreachable block elimination pass
#[derive(Default)]
pub struct UnreachableBlockEliminationPass;

impl UnreachableBlockEliminationPass {
    pub fn new() -> Self {
        Self
    }
}

impl OptimizationPass for UnreachableBlockEliminationPass {
    fn name(&self) -> &'static str {
        "unreachable-block-elimination"
    }

    fn run_on_module(&mut self, module: &mut IrModule) -> OptimizationResult {
        let mut result = OptimizationResult::unchanged();
        for function in module.functions.values_mut() {
            result = result.combine(self.run_on_function(function));
        }
        result
    }

    fn run_on_function(&mut self, function: &mut IrFunction) -> OptimizationResult {
        let eliminated = function.cfg.remove_unreachable_blocks();
        let mut result = OptimizationResult::unchanged();
        if eliminated > 0 {
            result.modified = true;
            result.blocks_eliminated = eliminated;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, IrType, MethodFlags};

    #[test]
    fn test_copy_propagation_then_dce() {
        let mut builder = IrBuilder::new("test");
        let class = builder.registry_mut().add_class("T");
        let m = builder.registry_mut().add_method(
            class,
            "id",
            vec![IrType::I32],
            IrType::I32,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let x = builder.param(0).unwrap();
        let a = builder.build_copy(x).unwrap();
        let b = builder.build_copy(a).unwrap();
        let _dead = builder.build_i32(42).unwrap();
        builder.build_return(Some(b)).unwrap();
        builder.finish_function();
        let mut module = builder.finish();

        let copy = CopyPropagationPass::new().run_on_module(&mut module);
        assert!(copy.modified);
        let dce = DeadCodeEliminationPass::new().run_on_module(&mut module);
        assert_eq!(dce.instructions_eliminated, 3);

        let f = module.get_function(m).unwrap();
        let entry = f.cfg.get_block(f.entry_block()).unwrap();
        assert_eq!(entry.instructions.len(), 1);
        assert_eq!(entry.terminator.uses(), vec![x]);
    }

    #[test]
    fn test_unreachable_block_elimination() {
        let mut builder = IrBuilder::new("test");
        let class = builder.registry_mut().add_class("T");
        let m = builder.registry_mut().add_method(
            class,
            "f",
            vec![],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let dead = builder.create_block().unwrap();
        builder.build_return(None).unwrap();
        builder.switch_to_block(dead);
        builder.build_return(None).unwrap();
        builder.finish_function();
        let mut module = builder.finish();

        let result = UnreachableBlockEliminationPass::new().run_on_module(&mut module);
        assert_eq!(result.blocks_eliminated, 1);
        assert_eq!(module.get_function(m).unwrap().cfg.blocks.len(), 1);
    }

    #[test]
    fn test_result_combine() {
        let mut a = OptimizationResult::changed();
        a.add_stat("x", 2);
        let mut b = OptimizationResult::unchanged();
        b.add_stat("x", 3);
        b.instructions_eliminated = 4;
        let c = a.combine(b);
        assert!(c.modified);
        assert_eq!(c.stat("x"), 5);
        assert_eq!(c.instructions_eliminated, 4);
    }
}
