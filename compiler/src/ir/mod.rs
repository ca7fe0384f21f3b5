//! Intermediate Representation (IR) for the escjit optimizer
//!
//! This module defines the SSA-based intermediate representation the escape
//! analyzer and its transforms operate on. The IR is modelled on a managed
//! language JIT:
//! - Typed virtual registers in SSA form, plus non-SSA variables used by
//!   transforms before SSA repair
//! - Object/array allocation, managed field/element addresses and indirect
//!   loads/stores
//! - Monitors, runtime helper calls, direct and virtual calls
//! - An explicit exception-dispatch successor per basic block

pub mod types;
pub mod descriptors;
pub mod instructions;
pub mod blocks;
pub mod functions;
pub mod modules;
pub mod builder;
pub mod dump;
pub mod loop_analysis;
pub mod ssa;
pub mod optimization;
pub mod escape;

pub use types::*;
pub use descriptors::*;
pub use instructions::*;
pub use blocks::*;
pub use functions::*;
pub use modules::*;
pub use builder::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// IR version for compatibility checking of serialized modules
pub const IR_VERSION: u32 = 1;

/// Unique identifier for an SSA register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrId(u32);

impl IrId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn invalid() -> Self {
        Self(u32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for IrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Identifier of a non-SSA local variable (accessed through `LdVar`/`StVar`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
