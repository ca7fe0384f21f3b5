//! IR Builder
//!
//! This module provides a builder interface for constructing IR in a convenient way.
//! The builder maintains context and provides helper methods for common patterns
//! (field get/put through managed addresses, monitors, calls).

use tracing::debug;

use super::{
    BinaryOp, BlockKind, ClassId, CompareOp, FieldId, IrBlockId, IrFunction, IrId,
    IrInstruction, IrModule, IrPhiNode, IrTerminator, IrType, IrValue, MarkerKind, MethodId,
    TypeRegistry, VarId, VmHelper,
};

/// IR builder for constructing IR modules
pub struct IrBuilder {
    /// The module being built
    pub module: IrModule,

    /// Current function being built
    pub(crate) current_function: Option<MethodId>,

    /// Current basic block being built
    pub(crate) current_block: Option<IrBlockId>,
}

impl IrBuilder {
    /// Create a new IR builder
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module: IrModule::new(module_name),
            current_function: None,
            current_block: None,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.module.registry
    }

    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.module.registry
    }

    // === Module Building ===

    /// Start building the body of a method declared in the registry
    pub fn start_function(&mut self, method: MethodId) -> Option<MethodId> {
        let desc = self.module.registry.method(method)?.clone();
        let params = desc
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                let name = if i == 0 && !desc.is_static() {
                    "this".to_string()
                } else {
                    format!("p{}", i)
                };
                (name, ty.clone())
            })
            .collect();
        let mut function =
            IrFunction::new(method, desc.name.clone(), params, desc.ret.clone(), desc.is_static());
        function.is_synchronized = desc.is_synchronized();

        debug!("Starting function {} ({})", desc.name, method);
        self.current_block = Some(function.entry_block());
        self.current_function = Some(method);
        self.module.add_function(function);
        Some(method)
    }

    /// Finish building the current function
    pub fn finish_function(&mut self) {
        if let Some(func) = self.current_function_mut() {
            func.cfg.rebuild_predecessors();
        }
        self.current_function = None;
        self.current_block = None;
    }

    /// Consume the builder, returning the finished module
    pub fn finish(mut self) -> IrModule {
        if self.current_function.is_some() {
            self.finish_function();
        }
        self.module
    }

    /// Get the current function
    pub fn current_function(&self) -> Option<&IrFunction> {
        self.current_function
            .and_then(|id| self.module.functions.get(&id))
    }

    /// Get the current function mutably
    pub fn current_function_mut(&mut self) -> Option<&mut IrFunction> {
        self.current_function
            .and_then(move |id| self.module.functions.get_mut(&id))
    }

    /// Register of parameter `index` of the current function
    pub fn param(&self, index: usize) -> Option<IrId> {
        self.current_function()?.get_param_reg(index)
    }

    // === Block Building ===

    /// Create a new basic block in the current function
    pub fn create_block(&mut self) -> Option<IrBlockId> {
        self.current_function_mut().map(|f| f.cfg.create_block())
    }

    /// Create a new basic block with a label
    pub fn create_block_with_label(&mut self, label: &str) -> Option<IrBlockId> {
        let block_id = self.create_block()?;
        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(block_id))
            .map(|b| b.label = Some(label.to_string()));
        Some(block_id)
    }

    /// Create an exception dispatch block
    pub fn create_dispatch_block(&mut self) -> Option<IrBlockId> {
        let id = self.create_block()?;
        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(id))
            .map(|b| b.kind = BlockKind::Dispatch)?;
        Some(id)
    }

    /// Route exceptions raised in `block` to `dispatch`
    pub fn set_dispatch(&mut self, block: IrBlockId, dispatch: IrBlockId) -> Option<()> {
        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(block))
            .map(|b| b.dispatch = Some(dispatch))
    }

    pub fn set_frequency(&mut self, block: IrBlockId, frequency: f64) -> Option<()> {
        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(block))
            .map(|b| b.metadata.frequency = frequency)
    }

    /// Switch to building in a different block
    pub fn switch_to_block(&mut self, block: IrBlockId) {
        self.current_block = Some(block);
    }

    /// Get the current block
    pub fn current_block(&self) -> Option<IrBlockId> {
        self.current_block
    }

    // === Register Management ===

    fn alloc_typed(&mut self, ty: IrType) -> Option<IrId> {
        self.current_function_mut().map(|f| f.alloc_typed_reg(ty))
    }

    /// Get the type of a register
    pub fn get_register_type(&self, reg: IrId) -> Option<IrType> {
        self.current_function()?.value_type(reg).cloned()
    }

    /// Declare a non-SSA variable
    pub fn declare_var(&mut self, name: &str, ty: IrType) -> Option<VarId> {
        self.current_function_mut().map(|f| f.declare_var(name, ty))
    }

    // === Instruction Building ===

    /// Add an instruction to the current block
    fn add_instruction(&mut self, inst: IrInstruction) -> Option<()> {
        let block_id = self.current_block?;
        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(block_id))
            .map(|b| b.add_instruction(inst))
    }

    fn add_with_dest(&mut self, ty: IrType, make: impl FnOnce(IrId) -> IrInstruction) -> Option<IrId> {
        let dest = self.alloc_typed(ty)?;
        self.add_instruction(make(dest))?;
        Some(dest)
    }

    /// Build a constant instruction
    pub fn build_const(&mut self, value: IrValue) -> Option<IrId> {
        let ty = match &value {
            IrValue::Void => IrType::Void,
            IrValue::Null => IrType::Null,
            IrValue::Bool(_) => IrType::Bool,
            IrValue::I8(_) => IrType::I8,
            IrValue::I16(_) => IrType::I16,
            IrValue::I32(_) => IrType::I32,
            IrValue::I64(_) => IrType::I64,
            IrValue::Char(_) => IrType::Char,
            IrValue::F32(_) => IrType::F32,
            IrValue::F64(_) => IrType::F64,
            IrValue::String(_) => IrType::Object(self.string_class()),
        };
        self.add_with_dest(ty, |dest| IrInstruction::Const { dest, value })
    }

    fn string_class(&mut self) -> ClassId {
        match self.module.registry.find_class("String") {
            Some(id) => id,
            None => self.module.registry.add_class("String"),
        }
    }

    /// Build an integer constant
    pub fn build_int(&mut self, value: i64, ty: IrType) -> Option<IrId> {
        let ir_value = match ty {
            IrType::I8 => IrValue::I8(value as i8),
            IrType::I16 => IrValue::I16(value as i16),
            IrType::I32 => IrValue::I32(value as i32),
            IrType::I64 => IrValue::I64(value),
            IrType::Char => IrValue::Char(value as u16),
            _ => return None,
        };
        self.build_const(ir_value)
    }

    pub fn build_i32(&mut self, value: i32) -> Option<IrId> {
        self.build_const(IrValue::I32(value))
    }

    /// Build a string literal
    pub fn build_string(&mut self, value: &str) -> Option<IrId> {
        self.build_const(IrValue::String(value.to_string()))
    }

    /// Build a null reference constant
    pub fn build_null(&mut self) -> Option<IrId> {
        self.build_const(IrValue::Null)
    }

    /// Build a copy instruction
    pub fn build_copy(&mut self, src: IrId) -> Option<IrId> {
        let ty = self.get_register_type(src).unwrap_or(IrType::Void);
        self.add_with_dest(ty, |dest| IrInstruction::Copy { dest, src })
    }

    pub fn build_binop(&mut self, op: BinaryOp, left: IrId, right: IrId) -> Option<IrId> {
        let ty = self.get_register_type(left).unwrap_or(IrType::I32);
        self.add_with_dest(ty, |dest| IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        })
    }

    pub fn build_cmp(&mut self, op: CompareOp, left: IrId, right: IrId) -> Option<IrId> {
        self.add_with_dest(IrType::Bool, |dest| IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        })
    }

    // === Allocation ===

    pub fn build_new_obj(&mut self, class: ClassId) -> Option<IrId> {
        self.add_with_dest(IrType::Object(class), |dest| IrInstruction::NewObj { dest, class })
    }

    pub fn build_new_array(&mut self, elem: IrType, len: IrId) -> Option<IrId> {
        let ty = IrType::array_of(elem.clone());
        self.add_with_dest(ty, |dest| IrInstruction::NewArray { dest, elem, len })
    }

    // === Heap Access ===

    pub fn build_field_addr(&mut self, base: IrId, field: FieldId) -> Option<IrId> {
        let ty = self.module.registry.field(field)?.ty.clone();
        self.add_with_dest(IrType::address_of(ty), |dest| IrInstruction::LdFieldAddr {
            dest,
            base,
            field,
        })
    }

    pub fn build_static_addr(&mut self, field: FieldId) -> Option<IrId> {
        let ty = self.module.registry.field(field)?.ty.clone();
        self.add_with_dest(IrType::address_of(ty), |dest| IrInstruction::LdStaticAddr {
            dest,
            field,
        })
    }

    pub fn build_elem_addr(&mut self, array: IrId, index: IrId) -> Option<IrId> {
        let elem = self
            .get_register_type(array)
            .and_then(|t| t.array_element().cloned())?;
        self.add_with_dest(IrType::address_of(elem), |dest| IrInstruction::LdElemAddr {
            dest,
            array,
            index,
        })
    }

    /// Build a load through a managed address
    pub fn build_load(&mut self, addr: IrId) -> Option<IrId> {
        let ty = self
            .get_register_type(addr)
            .and_then(|t| t.pointee().cloned())?;
        self.add_with_dest(ty.clone(), |dest| IrInstruction::LdInd { dest, addr, ty })
    }

    /// Build a store through a managed address
    pub fn build_store(&mut self, addr: IrId, value: IrId) -> Option<()> {
        self.add_instruction(IrInstruction::StInd { addr, value })
    }

    /// `obj.field`
    pub fn build_get_field(&mut self, obj: IrId, field: FieldId) -> Option<IrId> {
        let addr = self.build_field_addr(obj, field)?;
        self.build_load(addr)
    }

    /// `obj.field = value`
    pub fn build_put_field(&mut self, obj: IrId, field: FieldId, value: IrId) -> Option<()> {
        let addr = self.build_field_addr(obj, field)?;
        self.build_store(addr, value)
    }

    pub fn build_get_static(&mut self, field: FieldId) -> Option<IrId> {
        let addr = self.build_static_addr(field)?;
        self.build_load(addr)
    }

    pub fn build_put_static(&mut self, field: FieldId, value: IrId) -> Option<()> {
        let addr = self.build_static_addr(field)?;
        self.build_store(addr, value)
    }

    // === Variables ===

    pub fn build_ld_var(&mut self, var: VarId) -> Option<IrId> {
        let ty = self.current_function()?.vars.get(&var)?.ty.clone();
        self.add_with_dest(ty, |dest| IrInstruction::LdVar { dest, var })
    }

    pub fn build_st_var(&mut self, var: VarId, src: IrId) -> Option<()> {
        self.add_instruction(IrInstruction::StVar { var, src })
    }

    // === Type Operations ===

    pub fn build_cast(&mut self, src: IrId, ty: IrType) -> Option<IrId> {
        self.add_with_dest(ty.clone(), |dest| IrInstruction::Cast { dest, src, ty })
    }

    pub fn build_check_cast(&mut self, src: IrId, ty: IrType) -> Option<IrId> {
        self.add_with_dest(ty.clone(), |dest| IrInstruction::CheckCast { dest, src, ty })
    }

    pub fn build_check_null(&mut self, obj: IrId) -> Option<()> {
        self.add_instruction(IrInstruction::CheckNull { obj })
    }

    // === Calls ===

    fn call_result(&mut self, method: MethodId) -> Option<Option<IrId>> {
        let ret = self.module.registry.method(method)?.ret.clone();
        if ret == IrType::Void {
            Some(None)
        } else {
            Some(Some(self.alloc_typed(ret)?))
        }
    }

    /// Build a statically bound call, returning its result register if any
    pub fn build_call(&mut self, method: MethodId, args: Vec<IrId>) -> Option<Option<IrId>> {
        let dest = self.call_result(method)?;
        self.add_instruction(IrInstruction::DirectCall { dest, method, args })?;
        Some(dest)
    }

    /// Build a virtual call dispatched on `args[0]`
    pub fn build_virtual_call(
        &mut self,
        method: MethodId,
        args: Vec<IrId>,
    ) -> Option<Option<IrId>> {
        let dest = self.call_result(method)?;
        self.add_instruction(IrInstruction::IndirectCall { dest, method, args })?;
        Some(dest)
    }

    pub fn build_helper_call(
        &mut self,
        helper: VmHelper,
        args: Vec<IrId>,
        ret: Option<IrType>,
    ) -> Option<Option<IrId>> {
        let dest = match ret {
            Some(ty) => Some(self.alloc_typed(ty)?),
            None => None,
        };
        self.add_instruction(IrInstruction::VmHelperCall { dest, helper, args })?;
        Some(dest)
    }

    pub fn build_intrinsic(
        &mut self,
        name: &str,
        args: Vec<IrId>,
        ret: Option<IrType>,
    ) -> Option<Option<IrId>> {
        let dest = match ret {
            Some(ty) => Some(self.alloc_typed(ty)?),
            None => None,
        };
        self.add_instruction(IrInstruction::Intrinsic {
            dest,
            name: name.to_string(),
            args,
        })?;
        Some(dest)
    }

    // === Exceptions and Synchronization ===

    pub fn build_catch(&mut self, ty: IrType) -> Option<IrId> {
        self.add_with_dest(ty.clone(), |dest| IrInstruction::Catch { dest, ty })
    }

    pub fn build_monitor_enter(&mut self, obj: IrId) -> Option<()> {
        self.add_instruction(IrInstruction::MonitorEnter {
            obj,
            guarded: false,
        })
    }

    pub fn build_monitor_exit(&mut self, obj: IrId) -> Option<()> {
        self.add_instruction(IrInstruction::MonitorExit {
            obj,
            guarded: false,
        })
    }

    pub fn build_method_marker(&mut self, kind: MarkerKind, obj: Option<IrId>) -> Option<()> {
        let method = self.current_function?;
        self.add_instruction(IrInstruction::MethodMarker { kind, method, obj })
    }

    // === Terminators ===

    fn set_terminator(&mut self, term: IrTerminator) -> Option<()> {
        let block_id = self.current_block?;
        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(block_id))
            .map(|b| b.set_terminator(term))
    }

    /// Build an unconditional branch
    pub fn build_branch(&mut self, target: IrBlockId) -> Option<()> {
        self.set_terminator(IrTerminator::Branch { target })
    }

    /// Build a conditional branch
    pub fn build_cond_branch(
        &mut self,
        condition: IrId,
        true_target: IrBlockId,
        false_target: IrBlockId,
    ) -> Option<()> {
        self.set_terminator(IrTerminator::CondBranch {
            condition,
            true_target,
            false_target,
        })
    }

    /// Build a return
    pub fn build_return(&mut self, value: Option<IrId>) -> Option<()> {
        self.set_terminator(IrTerminator::Return { value })
    }

    pub fn build_throw(&mut self, exception: IrId) -> Option<()> {
        self.set_terminator(IrTerminator::Throw { exception })
    }

    /// Build an unreachable terminator
    pub fn build_unreachable(&mut self) -> Option<()> {
        self.set_terminator(IrTerminator::Unreachable)
    }

    // === Phi Node Building ===

    /// Add a phi node to a block
    pub fn build_phi(&mut self, block: IrBlockId, ty: IrType) -> Option<IrId> {
        let dest = self.alloc_typed(ty.clone())?;
        let phi = IrPhiNode {
            dest,
            incoming: Vec::new(),
            ty,
        };

        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(block))
            .map(|b| b.add_phi(phi))?;

        Some(dest)
    }

    /// Add an incoming value to a phi node
    pub fn add_phi_incoming(
        &mut self,
        block: IrBlockId,
        phi_dest: IrId,
        from_block: IrBlockId,
        value: IrId,
    ) -> Option<()> {
        self.current_function_mut()
            .and_then(|f| f.cfg.get_block_mut(block))
            .and_then(|b| b.phi_nodes.iter_mut().find(|p| p.dest == phi_dest))
            .map(|phi| phi.incoming.push((from_block, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MethodFlags;

    #[test]
    fn test_basic_function_building() {
        let mut builder = IrBuilder::new("test");
        let point = builder.registry_mut().add_class("Point");
        let x = builder.registry_mut().add_field(point, "x", IrType::I32, false);
        let m = builder.registry_mut().add_method(
            point,
            "make",
            vec![IrType::I32],
            IrType::Object(point),
            MethodFlags::static_method(),
        );

        builder.start_function(m).unwrap();
        let arg = builder.param(0).unwrap();
        let obj = builder.build_new_obj(point).unwrap();
        builder.build_put_field(obj, x, arg).unwrap();
        builder.build_return(Some(obj)).unwrap();
        builder.finish_function();

        let module = builder.finish();
        let func = module.get_function(m).unwrap();
        assert_eq!(func.name, "make");
        assert_eq!(func.return_type, IrType::Object(point));
        let entry = func.cfg.get_block(func.entry_block()).unwrap();
        // defarg, newobj, fieldaddr, stind
        assert_eq!(entry.instructions.len(), 4);
        assert!(matches!(entry.terminator, IrTerminator::Return { .. }));
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_control_flow_building() {
        let mut builder = IrBuilder::new("test");
        let main = builder.registry_mut().add_class("Main");
        let m = builder.registry_mut().add_method(
            main,
            "abs",
            vec![IrType::I32],
            IrType::I32,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let x = builder.param(0).unwrap();

        let negative = builder.create_block_with_label("negative").unwrap();
        let positive = builder.create_block_with_label("positive").unwrap();
        let merge = builder.create_block_with_label("merge").unwrap();
        let entry = builder.current_block().unwrap();

        let zero = builder.build_i32(0).unwrap();
        let is_negative = builder.build_cmp(CompareOp::Lt, x, zero).unwrap();
        builder.build_cond_branch(is_negative, negative, positive).unwrap();

        builder.switch_to_block(negative);
        let neg = builder.build_binop(BinaryOp::Sub, zero, x).unwrap();
        builder.build_branch(merge).unwrap();

        builder.switch_to_block(positive);
        builder.build_branch(merge).unwrap();

        builder.switch_to_block(merge);
        let phi = builder.build_phi(merge, IrType::I32).unwrap();
        builder.add_phi_incoming(merge, phi, negative, neg).unwrap();
        builder.add_phi_incoming(merge, phi, positive, x).unwrap();
        builder.build_return(Some(phi)).unwrap();
        builder.finish_function();

        let func = builder.module.get_function(m).unwrap();
        assert!(func.verify().is_ok());
        assert_eq!(func.cfg.get_block(merge).unwrap().predecessors.len(), 2);
        assert_eq!(func.cfg.get_block(negative).unwrap().predecessors, vec![entry]);
    }

    #[test]
    fn test_string_literal_registers_string_class() {
        let mut builder = IrBuilder::new("test");
        let main = builder.registry_mut().add_class("Main");
        let m = builder.registry_mut().add_method(
            main,
            "s",
            vec![],
            IrType::Void,
            MethodFlags::static_method(),
        );
        builder.start_function(m).unwrap();
        let s = builder.build_string("hi").unwrap();
        let string = builder.registry().find_class("String").unwrap();
        assert_eq!(builder.get_register_type(s), Some(IrType::Object(string)));
    }
}
