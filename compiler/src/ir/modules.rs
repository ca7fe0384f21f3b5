//! IR Modules
//!
//! A module is the unit handed to the optimizer: a type registry and the
//! method bodies compiled against it. Nested analyses obtain callee bodies
//! through a [`MethodSource`], which translates a method on demand.

use super::descriptors::{MethodId, TypeRegistry};
use super::{IrFunction, IR_VERSION};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// IR module - represents a compilation unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrModule {
    /// Module name
    pub name: String,

    /// Format version of the serialized module
    #[serde(default = "current_version")]
    pub version: u32,

    /// Classes, fields and methods visible to this module
    pub registry: TypeRegistry,

    /// Method bodies, in insertion order
    pub functions: IndexMap<MethodId, IrFunction>,
}

fn current_version() -> u32 {
    IR_VERSION
}

impl IrModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_registry(name, TypeRegistry::new())
    }

    pub fn with_registry(name: impl Into<String>, registry: TypeRegistry) -> Self {
        Self {
            name: name.into(),
            version: IR_VERSION,
            registry,
            functions: IndexMap::new(),
        }
    }

    pub fn add_function(&mut self, function: IrFunction) -> MethodId {
        let id = function.method;
        self.functions.insert(id, function);
        id
    }

    pub fn get_function(&self, id: MethodId) -> Option<&IrFunction> {
        self.functions.get(&id)
    }

    pub fn get_function_mut(&mut self, id: MethodId) -> Option<&mut IrFunction> {
        self.functions.get_mut(&id)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&IrFunction> {
        self.functions.values().find(|f| f.name == name)
    }

    /// Verify module integrity
    pub fn verify(&self) -> Result<(), String> {
        if self.version != IR_VERSION {
            return Err(format!(
                "Unsupported IR version {} (expected {})",
                self.version, IR_VERSION
            ));
        }
        for (id, function) in &self.functions {
            function
                .verify()
                .map_err(|e| format!("Function {} ({}) error: {}", id, function.name, e))?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(src: &str) -> serde_json::Result<Self> {
        serde_json::from_str(src)
    }

    /// Get module statistics
    pub fn stats(&self) -> ModuleStats {
        ModuleStats {
            function_count: self.functions.len(),
            class_count: self.registry.classes().len(),
            instruction_count: self
                .functions
                .values()
                .map(|f| f.cfg.instruction_count())
                .sum(),
        }
    }
}

/// Module statistics
#[derive(Debug)]
pub struct ModuleStats {
    pub function_count: usize,
    pub class_count: usize,
    pub instruction_count: usize,
}

/// Supplies fresh SSA bodies for methods the analyzer wants to look into
pub trait MethodSource: Sync {
    fn registry(&self) -> &TypeRegistry;

    /// Translate `method` into a fresh body, or `None` if it has none
    fn translate(&self, method: MethodId) -> Option<IrFunction>;
}

impl MethodSource for IrModule {
    fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn translate(&self, method: MethodId) -> Option<IrFunction> {
        self.functions.get(&method).cloned()
    }
}

/// Snapshot of the unoptimized bodies of a module. Callee bodies handed to
/// nested analyses never observe transforms applied to the caller's module.
#[derive(Debug, Clone)]
pub struct BytecodeRepository {
    registry: Arc<TypeRegistry>,
    bodies: HashMap<MethodId, Arc<IrFunction>>,
}

impl BytecodeRepository {
    pub fn capture(module: &IrModule) -> Self {
        Self {
            registry: Arc::new(module.registry.clone()),
            bodies: module
                .functions
                .iter()
                .map(|(id, f)| (*id, Arc::new(f.clone())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl MethodSource for BytecodeRepository {
    fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn translate(&self, method: MethodId) -> Option<IrFunction> {
        self.bodies.get(&method).map(|body| (**body).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrTerminator, IrType, MethodFlags};

    fn sample_module() -> IrModule {
        let mut module = IrModule::new("test");
        let class = module.registry.add_class("Main");
        let m = module
            .registry
            .add_method(class, "run", vec![], IrType::Void, MethodFlags::static_method());
        let mut f = IrFunction::new(m, "run", vec![], IrType::Void, true);
        let entry = f.entry_block();
        f.cfg.get_block_mut(entry).unwrap().terminator = IrTerminator::Return { value: None };
        module.add_function(f);
        module
    }

    #[test]
    fn test_module_creation() {
        let module = IrModule::new("test");
        assert_eq!(module.name, "test");
        assert!(module.functions.is_empty());
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_repository_is_a_snapshot() {
        let mut module = sample_module();
        let m = *module.functions.keys().next().unwrap();
        let repo = BytecodeRepository::capture(&module);

        module.get_function_mut(m).unwrap().name = "renamed".to_string();
        assert_eq!(repo.translate(m).unwrap().name, "run");
        assert_eq!(module.translate(m).unwrap().name, "renamed");
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_json_round_trip_preserves_bodies() {
        let module = sample_module();
        let json = module.to_json().unwrap();
        let back = IrModule::from_json(&json).unwrap();
        assert_eq!(back.functions.len(), 1);
        assert!(back.verify().is_ok());
        assert_eq!(back.stats().instruction_count, module.stats().instruction_count);
    }
}
