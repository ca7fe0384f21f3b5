//! Class, field and method descriptors
//!
//! The type registry is the optimizer's view of the loaded class hierarchy:
//! which classes are resolved, which need finalization, which fields are
//! final and which methods are native or synchronized.

use super::types::IrType;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDesc {
    pub id: ClassId,
    pub name: String,
    /// Unresolved classes are never analyzed precisely
    pub resolved: bool,
    /// Instances must be registered with the finalizer on allocation
    pub finalizable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDesc {
    pub id: FieldId,
    pub owner: ClassId,
    pub name: String,
    pub ty: IrType,
    pub is_static: bool,
    pub is_final: bool,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDesc {
    pub id: MethodId,
    pub owner: ClassId,
    pub name: String,
    pub signature: String,
    /// Parameter types, including the receiver for instance methods
    pub params: Vec<IrType>,
    pub ret: IrType,
    pub flags: MethodFlags,
}

impl MethodDesc {
    pub fn is_static(&self) -> bool {
        self.flags.is_static
    }

    pub fn is_native(&self) -> bool {
        self.flags.is_native
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.is_synchronized
    }

    pub fn is_resolved(&self) -> bool {
        self.flags.resolved
    }

    /// Whether a body can be obtained and analyzed for this method
    pub fn is_analyzable(&self) -> bool {
        self.flags.resolved && !self.flags.is_native
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_native: bool,
    pub is_synchronized: bool,
    pub resolved: bool,
}

impl Default for MethodFlags {
    fn default() -> Self {
        Self {
            is_static: false,
            is_native: false,
            is_synchronized: false,
            resolved: true,
        }
    }
}

impl MethodFlags {
    pub fn instance() -> Self {
        Self::default()
    }

    pub fn static_method() -> Self {
        Self {
            is_static: true,
            ..Self::default()
        }
    }

    pub fn synchronized(mut self) -> Self {
        self.is_synchronized = true;
        self
    }

    pub fn native(mut self) -> Self {
        self.is_native = true;
        self
    }

    pub fn unresolved(mut self) -> Self {
        self.resolved = false;
        self
    }
}

/// Stable identity of a method across compilations: class, name and signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

impl MethodKey {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            signature: signature.into(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}{}", self.class_name, self.method_name, self.signature)
    }
}

/// Identity of a field as seen by the connection graph. Unresolved fields are
/// keyed by owner class and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKey {
    Resolved(FieldId),
    Unresolved { class_name: String, name: String },
}

/// Registry of classes, fields and methods
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeRegistry {
    classes: Vec<ClassDesc>,
    fields: Vec<FieldDesc>,
    methods: Vec<MethodDesc>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resolved, non-finalizable class
    pub fn add_class(&mut self, name: &str) -> ClassId {
        self.add_class_with(name, true, false)
    }

    pub fn add_class_with(&mut self, name: &str, resolved: bool, finalizable: bool) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassDesc {
            id,
            name: name.to_string(),
            resolved,
            finalizable,
        });
        id
    }

    pub fn add_field(&mut self, owner: ClassId, name: &str, ty: IrType, is_final: bool) -> FieldId {
        self.push_field(owner, name, ty, false, is_final, true)
    }

    pub fn add_static_field(&mut self, owner: ClassId, name: &str, ty: IrType) -> FieldId {
        self.push_field(owner, name, ty, true, false, true)
    }

    pub fn add_unresolved_field(&mut self, owner: ClassId, name: &str, ty: IrType) -> FieldId {
        self.push_field(owner, name, ty, false, false, false)
    }

    fn push_field(
        &mut self,
        owner: ClassId,
        name: &str,
        ty: IrType,
        is_static: bool,
        is_final: bool,
        resolved: bool,
    ) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDesc {
            id,
            owner,
            name: name.to_string(),
            ty,
            is_static,
            is_final,
            resolved,
        });
        id
    }

    pub fn add_method(
        &mut self,
        owner: ClassId,
        name: &str,
        params: Vec<IrType>,
        ret: IrType,
        flags: MethodFlags,
    ) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        let signature = format!(
            "({}){}",
            params
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(","),
            ret
        );
        self.methods.push(MethodDesc {
            id,
            owner,
            name: name.to_string(),
            signature,
            params,
            ret,
            flags,
        });
        id
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassDesc> {
        self.classes.get(id.0 as usize)
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDesc> {
        self.fields.get(id.0 as usize)
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodDesc> {
        self.methods.get(id.0 as usize)
    }

    pub fn classes(&self) -> &[ClassDesc] {
        &self.classes
    }

    pub fn methods(&self) -> &[MethodDesc] {
        &self.methods
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.id)
    }

    pub fn find_method(&self, class_name: &str, method_name: &str) -> Option<MethodId> {
        let owner = self.find_class(class_name)?;
        self.methods
            .iter()
            .find(|m| m.owner == owner && m.name == method_name)
            .map(|m| m.id)
    }

    /// Instance fields declared by a class, in declaration order
    pub fn instance_fields(&self, class: ClassId) -> impl Iterator<Item = &FieldDesc> + '_ {
        self.fields
            .iter()
            .filter(move |f| f.owner == class && !f.is_static)
    }

    pub fn is_class_resolved(&self, id: ClassId) -> bool {
        self.class(id).map(|c| c.resolved).unwrap_or(false)
    }

    pub fn is_class_finalizable(&self, id: ClassId) -> bool {
        self.class(id).map(|c| c.finalizable).unwrap_or(false)
    }

    pub fn field_key(&self, id: FieldId) -> FieldKey {
        match self.field(id) {
            Some(desc) if !desc.resolved => FieldKey::Unresolved {
                class_name: self
                    .class(desc.owner)
                    .map(|c| c.name.clone())
                    .unwrap_or_default(),
                name: desc.name.clone(),
            },
            _ => FieldKey::Resolved(id),
        }
    }

    /// The character storage field of `String`, which never carries its own
    /// escape information
    pub fn is_string_value_field(&self, id: FieldId) -> bool {
        self.field(id)
            .and_then(|f| self.class(f.owner).map(|c| (c, f)))
            .map(|(c, f)| c.name == "String" && f.name == "value")
            .unwrap_or(false)
    }

    pub fn method_key(&self, id: MethodId) -> Option<MethodKey> {
        let method = self.method(id)?;
        let class = self.class(method.owner)?;
        Some(MethodKey::new(
            class.name.clone(),
            method.name.clone(),
            method.signature.clone(),
        ))
    }

    pub fn describe_method(&self, id: MethodId) -> String {
        self.method_key(id)
            .map(|k| k.to_string())
            .unwrap_or_else(|| id.to_string())
    }
}
