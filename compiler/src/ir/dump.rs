//! IR Dump Utility
//!
//! Pretty-prints IR in a human-readable format. Used by the `--show-ir`
//! flag of the driver and when debugging the escape transforms.

use super::{
    BinaryOp, BlockKind, CompareOp, IrBasicBlock, IrControlFlowGraph, IrFunction,
    IrInstruction, IrModule, IrPhiNode, IrTerminator, MarkerKind, VmHelper,
};
use std::fmt::Write;

/// Dump an entire module to a string.
pub fn dump_module(module: &IrModule) -> String {
    let mut out = String::new();
    writeln!(out, "; Module: {}", module.name).unwrap();
    writeln!(out, "; Functions: {}", module.functions.len()).unwrap();
    writeln!(out).unwrap();

    for func in module.functions.values() {
        writeln!(out, "{}", dump_function(func)).unwrap();
    }

    out
}

/// Dump a single function to a string.
pub fn dump_function(func: &IrFunction) -> String {
    let mut out = String::new();

    let params: Vec<String> = func
        .params
        .iter()
        .map(|p| format!("{}: {}", p.reg, p.ty))
        .collect();

    let mut attrs = String::new();
    if func.is_static {
        attrs.push_str(" static");
    }
    if func.is_synchronized {
        attrs.push_str(" synchronized");
    }

    writeln!(
        out,
        "fn @{}({}) -> {}{} {{",
        func.name,
        params.join(", "),
        func.return_type,
        attrs
    )
    .unwrap();

    for (id, var) in &func.vars {
        writeln!(out, "  var {}: {} ; {}", id, var.ty, var.name).unwrap();
    }

    write!(out, "{}", dump_cfg(&func.cfg)).unwrap();

    writeln!(out, "}}").unwrap();
    out
}

/// Dump a CFG to a string.
pub fn dump_cfg(cfg: &IrControlFlowGraph) -> String {
    let mut out = String::new();
    for block in cfg.blocks.values() {
        write!(out, "{}", dump_block(block)).unwrap();
    }
    out
}

/// Dump a basic block to a string.
pub fn dump_block(block: &IrBasicBlock) -> String {
    let mut out = String::new();

    let label = block
        .label
        .as_ref()
        .map(|l| format!(" ; {}", l))
        .unwrap_or_default();
    let kind = match block.kind {
        BlockKind::Basic => "",
        BlockKind::Dispatch => " dispatch",
    };
    let preds: Vec<String> = block.predecessors.iter().map(|p| p.to_string()).collect();
    writeln!(
        out,
        "{}{}:{} ; preds = [{}]",
        block.id,
        kind,
        label,
        preds.join(", ")
    )
    .unwrap();

    for phi in &block.phi_nodes {
        writeln!(out, "    {}", dump_phi(phi)).unwrap();
    }
    for inst in &block.instructions {
        writeln!(out, "    {}", dump_instruction(inst)).unwrap();
    }
    writeln!(out, "    {}", dump_terminator(&block.terminator)).unwrap();
    if let Some(dispatch) = block.dispatch {
        writeln!(out, "    ; unwind -> {}", dispatch).unwrap();
    }

    out
}

pub fn dump_phi(phi: &IrPhiNode) -> String {
    let incoming: Vec<String> = phi
        .incoming
        .iter()
        .map(|(block, value)| format!("[{}, {}]", value, block))
        .collect();
    format!("{} = phi {} {}", phi.dest, phi.ty, incoming.join(", "))
}

fn args(list: &[super::IrId]) -> String {
    list.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn dest_prefix(dest: &Option<super::IrId>) -> String {
    dest.map(|d| format!("{} = ", d)).unwrap_or_default()
}

/// Dump a single instruction to a string.
pub fn dump_instruction(inst: &IrInstruction) -> String {
    match inst {
        IrInstruction::Const { dest, value } => format!("{} = const {}", dest, value),
        IrInstruction::Copy { dest, src } => format!("{} = copy {}", dest, src),
        IrInstruction::DefArg { dest, index } => format!("{} = defarg {}", dest, index),
        IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        } => format!("{} = {} {}, {}", dest, dump_binop(op), left, right),
        IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        } => format!("{} = cmp {} {}, {}", dest, dump_cmpop(op), left, right),
        IrInstruction::NewObj { dest, class } => format!("{} = newobj {}", dest, class),
        IrInstruction::NewArray { dest, elem, len } => {
            format!("{} = newarray {}[{}]", dest, elem, len)
        }
        IrInstruction::LdFieldAddr { dest, base, field } => {
            format!("{} = ldflda {}.{}", dest, base, field)
        }
        IrInstruction::LdStaticAddr { dest, field } => format!("{} = ldsflda {}", dest, field),
        IrInstruction::LdElemAddr { dest, array, index } => {
            format!("{} = ldelema {}[{}]", dest, array, index)
        }
        IrInstruction::LdInd { dest, addr, ty } => format!("{} = ldind {} {}", dest, ty, addr),
        IrInstruction::StInd { addr, value } => format!("stind {}, {}", addr, value),
        IrInstruction::LdVar { dest, var } => format!("{} = ldvar {}", dest, var),
        IrInstruction::StVar { var, src } => format!("stvar {}, {}", var, src),
        IrInstruction::Cast { dest, src, ty } => format!("{} = cast {} to {}", dest, src, ty),
        IrInstruction::CheckCast { dest, src, ty } => {
            format!("{} = checkcast {} to {}", dest, src, ty)
        }
        IrInstruction::CheckNull { obj } => format!("chknull {}", obj),
        IrInstruction::DirectCall { dest, method, args: a } => {
            format!("{}call {}({})", dest_prefix(dest), method, args(a))
        }
        IrInstruction::IndirectCall { dest, method, args: a } => {
            format!("{}callvirt {}({})", dest_prefix(dest), method, args(a))
        }
        IrInstruction::VmHelperCall { dest, helper, args: a } => {
            let name = match helper {
                VmHelper::LoadThisLockFlag => "load_this_lock_flag",
                VmHelper::SaveThisLockFlag => "save_this_lock_flag",
                VmHelper::Runtime(name) => name.as_str(),
            };
            format!("{}vmhelper {}({})", dest_prefix(dest), name, args(a))
        }
        IrInstruction::Catch { dest, ty } => format!("{} = catch {}", dest, ty),
        IrInstruction::MonitorEnter { obj, guarded } => {
            format!("monenter {}{}", obj, if *guarded { " guarded" } else { "" })
        }
        IrInstruction::MonitorExit { obj, guarded } => {
            format!("monexit {}{}", obj, if *guarded { " guarded" } else { "" })
        }
        IrInstruction::MethodMarker { kind, method, obj } => {
            let kind = match kind {
                MarkerKind::MethodEntry => "entry",
                MarkerKind::MethodEnd => "end",
            };
            match obj {
                Some(obj) => format!("marker {} {} {}", kind, method, obj),
                None => format!("marker {} {}", kind, method),
            }
        }
        IrInstruction::Intrinsic { dest, name, args: a } => {
            format!("{}intrinsic {}({})", dest_prefix(dest), name, args(a))
        }
    }
}

pub fn dump_terminator(term: &IrTerminator) -> String {
    match term {
        IrTerminator::Branch { target } => format!("br {}", target),
        IrTerminator::CondBranch {
            condition,
            true_target,
            false_target,
        } => format!("br {}, {}, {}", condition, true_target, false_target),
        IrTerminator::Return { value: Some(v) } => format!("ret {}", v),
        IrTerminator::Return { value: None } => "ret".to_string(),
        IrTerminator::Throw { exception } => format!("throw {}", exception),
        IrTerminator::Unreachable => "unreachable".to_string(),
    }
}

pub fn dump_binop(op: &BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Rem => "rem",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::Shl => "shl",
        BinaryOp::Shr => "shr",
    }
}

pub fn dump_cmpop(op: &CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "eq",
        CompareOp::Ne => "ne",
        CompareOp::Lt => "lt",
        CompareOp::Le => "le",
        CompareOp::Gt => "gt",
        CompareOp::Ge => "ge",
    }
}

/// Dump a function by name from a module
pub fn dump_function_by_name(module: &IrModule, name: &str) -> Option<String> {
    module.function_by_name(name).map(dump_function)
}
