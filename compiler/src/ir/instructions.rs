//! IR Instructions
//!
//! Defines the instruction set for the intermediate representation.
//! Heap accesses are split into an address computation (`LdFieldAddr`,
//! `LdStaticAddr`, `LdElemAddr`) and an indirect load or store through the
//! resulting managed address.

use super::descriptors::{ClassId, FieldId, MethodId};
use super::{IrId, IrType, IrValue, VarId};
use serde::{Deserialize, Serialize};

/// IR instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrInstruction {
    // === Value Operations ===

    /// Load constant value
    Const { dest: IrId, value: IrValue },

    /// Copy value from one register to another
    Copy { dest: IrId, src: IrId },

    /// Define the incoming method argument at `index`
    DefArg { dest: IrId, index: u32 },

    /// Binary arithmetic operation
    BinOp {
        dest: IrId,
        op: BinaryOp,
        left: IrId,
        right: IrId,
    },

    /// Compare operation
    Cmp {
        dest: IrId,
        op: CompareOp,
        left: IrId,
        right: IrId,
    },

    // === Allocation ===

    /// Allocate a new instance of `class`
    NewObj { dest: IrId, class: ClassId },

    /// Allocate a new array of `len` elements
    NewArray { dest: IrId, elem: IrType, len: IrId },

    // === Heap Addresses and Indirect Access ===

    /// Managed address of an instance field
    LdFieldAddr { dest: IrId, base: IrId, field: FieldId },

    /// Managed address of a static field
    LdStaticAddr { dest: IrId, field: FieldId },

    /// Managed address of an array element
    LdElemAddr { dest: IrId, array: IrId, index: IrId },

    /// Load through a managed address
    LdInd { dest: IrId, addr: IrId, ty: IrType },

    /// Store through a managed address
    StInd { addr: IrId, value: IrId },

    // === Variables ===

    /// Read a non-SSA local variable
    LdVar { dest: IrId, var: VarId },

    /// Write a non-SSA local variable
    StVar { var: VarId, src: IrId },

    // === Type Operations ===

    /// Unchecked reinterpretation to `ty`
    Cast { dest: IrId, src: IrId, ty: IrType },

    /// Checked downcast, throws on failure
    CheckCast { dest: IrId, src: IrId, ty: IrType },

    /// Throws if `obj` is null
    CheckNull { obj: IrId },

    // === Calls ===

    /// Statically bound call
    DirectCall {
        dest: Option<IrId>,
        method: MethodId,
        args: Vec<IrId>,
    },

    /// Virtual call dispatched on `args[0]`; `method` is the declared target
    IndirectCall {
        dest: Option<IrId>,
        method: MethodId,
        args: Vec<IrId>,
    },

    /// Call into a VM runtime helper
    VmHelperCall {
        dest: Option<IrId>,
        helper: VmHelper,
        args: Vec<IrId>,
    },

    // === Exceptions and Synchronization ===

    /// Receive the in-flight exception at the start of a dispatch block
    Catch { dest: IrId, ty: IrType },

    /// Acquire the monitor of `obj`. Guarded monitors were emitted by the
    /// optimizer behind a runtime flag and are never reconsidered.
    MonitorEnter { obj: IrId, guarded: bool },

    /// Release the monitor of `obj`
    MonitorExit { obj: IrId, guarded: bool },

    /// Method entry/exit marker for profilers and debuggers
    MethodMarker {
        kind: MarkerKind,
        method: MethodId,
        obj: Option<IrId>,
    },

    /// Opaque intrinsic the optimizer knows nothing about
    Intrinsic {
        dest: Option<IrId>,
        name: String,
        args: Vec<IrId>,
    },
}

/// Runtime helpers the optimizer emits or recognizes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmHelper {
    /// Returns nonzero when the caller already holds the receiver's monitor
    LoadThisLockFlag,
    /// Records whether the callee's receiver monitor is already held
    SaveThisLockFlag,
    /// Any other runtime entry point, treated as native code
    Runtime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    MethodEntry,
    MethodEnd,
}

/// Binary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Comparison operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl IrInstruction {
    /// Get the destination register if this instruction produces a value
    pub fn dest(&self) -> Option<IrId> {
        match self {
            IrInstruction::Const { dest, .. }
            | IrInstruction::Copy { dest, .. }
            | IrInstruction::DefArg { dest, .. }
            | IrInstruction::BinOp { dest, .. }
            | IrInstruction::Cmp { dest, .. }
            | IrInstruction::NewObj { dest, .. }
            | IrInstruction::NewArray { dest, .. }
            | IrInstruction::LdFieldAddr { dest, .. }
            | IrInstruction::LdStaticAddr { dest, .. }
            | IrInstruction::LdElemAddr { dest, .. }
            | IrInstruction::LdInd { dest, .. }
            | IrInstruction::LdVar { dest, .. }
            | IrInstruction::Cast { dest, .. }
            | IrInstruction::CheckCast { dest, .. }
            | IrInstruction::Catch { dest, .. } => Some(*dest),

            IrInstruction::DirectCall { dest, .. }
            | IrInstruction::IndirectCall { dest, .. }
            | IrInstruction::VmHelperCall { dest, .. }
            | IrInstruction::Intrinsic { dest, .. } => *dest,

            IrInstruction::StInd { .. }
            | IrInstruction::StVar { .. }
            | IrInstruction::CheckNull { .. }
            | IrInstruction::MonitorEnter { .. }
            | IrInstruction::MonitorExit { .. }
            | IrInstruction::MethodMarker { .. } => None,
        }
    }

    /// Get all registers used by this instruction
    pub fn uses(&self) -> Vec<IrId> {
        match self {
            IrInstruction::Const { .. }
            | IrInstruction::DefArg { .. }
            | IrInstruction::NewObj { .. }
            | IrInstruction::LdStaticAddr { .. }
            | IrInstruction::LdVar { .. }
            | IrInstruction::Catch { .. } => vec![],
            IrInstruction::Copy { src, .. }
            | IrInstruction::Cast { src, .. }
            | IrInstruction::CheckCast { src, .. } => vec![*src],
            IrInstruction::BinOp { left, right, .. } | IrInstruction::Cmp { left, right, .. } => {
                vec![*left, *right]
            }
            IrInstruction::NewArray { len, .. } => vec![*len],
            IrInstruction::LdFieldAddr { base, .. } => vec![*base],
            IrInstruction::LdElemAddr { array, index, .. } => vec![*array, *index],
            IrInstruction::LdInd { addr, .. } => vec![*addr],
            IrInstruction::StInd { addr, value } => vec![*addr, *value],
            IrInstruction::StVar { src, .. } => vec![*src],
            IrInstruction::CheckNull { obj }
            | IrInstruction::MonitorEnter { obj, .. }
            | IrInstruction::MonitorExit { obj, .. } => vec![*obj],
            IrInstruction::DirectCall { args, .. }
            | IrInstruction::IndirectCall { args, .. }
            | IrInstruction::VmHelperCall { args, .. }
            | IrInstruction::Intrinsic { args, .. } => args.clone(),
            IrInstruction::MethodMarker { obj, .. } => obj.iter().copied().collect(),
        }
    }

    /// Mutable references to every register this instruction reads
    pub fn uses_mut(&mut self) -> Vec<&mut IrId> {
        match self {
            IrInstruction::Const { .. }
            | IrInstruction::DefArg { .. }
            | IrInstruction::NewObj { .. }
            | IrInstruction::LdStaticAddr { .. }
            | IrInstruction::LdVar { .. }
            | IrInstruction::Catch { .. } => vec![],
            IrInstruction::Copy { src, .. }
            | IrInstruction::Cast { src, .. }
            | IrInstruction::CheckCast { src, .. } => vec![src],
            IrInstruction::BinOp { left, right, .. } | IrInstruction::Cmp { left, right, .. } => {
                vec![left, right]
            }
            IrInstruction::NewArray { len, .. } => vec![len],
            IrInstruction::LdFieldAddr { base, .. } => vec![base],
            IrInstruction::LdElemAddr { array, index, .. } => vec![array, index],
            IrInstruction::LdInd { addr, .. } => vec![addr],
            IrInstruction::StInd { addr, value } => vec![addr, value],
            IrInstruction::StVar { src, .. } => vec![src],
            IrInstruction::CheckNull { obj }
            | IrInstruction::MonitorEnter { obj, .. }
            | IrInstruction::MonitorExit { obj, .. } => vec![obj],
            IrInstruction::DirectCall { args, .. }
            | IrInstruction::IndirectCall { args, .. }
            | IrInstruction::VmHelperCall { args, .. }
            | IrInstruction::Intrinsic { args, .. } => args.iter_mut().collect(),
            IrInstruction::MethodMarker { obj, .. } => obj.iter_mut().collect(),
        }
    }

    /// Replace every use of `from` with `to`, returning whether anything changed
    pub fn replace_uses(&mut self, from: IrId, to: IrId) -> bool {
        let mut changed = false;
        for operand in self.uses_mut() {
            if *operand == from {
                *operand = to;
                changed = true;
            }
        }
        changed
    }

    /// Check if this instruction may raise an exception
    pub fn can_throw(&self) -> bool {
        matches!(
            self,
            IrInstruction::NewObj { .. }
                | IrInstruction::NewArray { .. }
                | IrInstruction::LdElemAddr { .. }
                | IrInstruction::CheckCast { .. }
                | IrInstruction::CheckNull { .. }
                | IrInstruction::DirectCall { .. }
                | IrInstruction::IndirectCall { .. }
                | IrInstruction::VmHelperCall { .. }
                | IrInstruction::MonitorEnter { .. }
                | IrInstruction::MonitorExit { .. }
                | IrInstruction::Intrinsic { .. }
        )
    }

    /// Check if this instruction has side effects beyond defining its result
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            IrInstruction::StInd { .. }
                | IrInstruction::StVar { .. }
                | IrInstruction::CheckNull { .. }
                | IrInstruction::CheckCast { .. }
                | IrInstruction::LdElemAddr { .. }
                | IrInstruction::DirectCall { .. }
                | IrInstruction::IndirectCall { .. }
                | IrInstruction::VmHelperCall { .. }
                | IrInstruction::Catch { .. }
                | IrInstruction::MonitorEnter { .. }
                | IrInstruction::MonitorExit { .. }
                | IrInstruction::MethodMarker { .. }
                | IrInstruction::Intrinsic { .. }
                | IrInstruction::DefArg { .. }
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self,
            IrInstruction::DirectCall { .. }
                | IrInstruction::IndirectCall { .. }
                | IrInstruction::VmHelperCall { .. }
        )
    }

    /// Monitor operand for unguarded monitor instructions
    pub fn plain_monitor(&self) -> Option<(IrId, bool)> {
        match self {
            IrInstruction::MonitorEnter { obj, guarded: false } => Some((*obj, true)),
            IrInstruction::MonitorExit { obj, guarded: false } => Some((*obj, false)),
            _ => None,
        }
    }
}
