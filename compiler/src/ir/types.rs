//! IR Type System
//!
//! Defines the value types of the intermediate representation. Reference types
//! (objects, arrays, null) are what the escape analyzer tracks; managed
//! addresses are produced by field/element address computations.

use super::descriptors::ClassId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// IR type representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrType {
    /// Void type (no value)
    Void,

    /// Boolean type
    Bool,

    /// Integer types
    I8,
    I16,
    I32,
    I64,

    /// UTF-16 code unit
    Char,

    /// Floating point types
    F32,
    F64,

    /// Reference to an instance of a class
    Object(ClassId),

    /// Reference to an array with the given element type
    Array(Box<IrType>),

    /// Type of the null constant
    Null,

    /// Managed address of a field or array element holding the pointee type
    Address(Box<IrType>),
}

/// Reference shape of a value, as seen by the connection graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefKind {
    /// Not a reference
    Primitive,
    /// Plain object reference
    Reference,
    /// Array of primitives
    Array,
    /// Array of references
    RefArray,
}

impl RefKind {
    pub fn is_reference(self) -> bool {
        self != RefKind::Primitive
    }
}

impl IrType {
    /// Create an array type
    pub fn array_of(elem: IrType) -> Self {
        IrType::Array(Box::new(elem))
    }

    /// Create a managed address type
    pub fn address_of(pointee: IrType) -> Self {
        IrType::Address(Box::new(pointee))
    }

    /// Check if values of this type are heap references
    pub fn is_reference(&self) -> bool {
        matches!(self, IrType::Object(_) | IrType::Array(_) | IrType::Null)
    }

    /// Reference shape for the connection graph
    pub fn ref_kind(&self) -> RefKind {
        match self {
            IrType::Object(_) | IrType::Null => RefKind::Reference,
            IrType::Array(elem) if elem.is_reference() => RefKind::RefArray,
            IrType::Array(_) => RefKind::Array,
            _ => RefKind::Primitive,
        }
    }

    /// Check if this is a primitive type
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            IrType::Void
                | IrType::Bool
                | IrType::I8
                | IrType::I16
                | IrType::I32
                | IrType::I64
                | IrType::Char
                | IrType::F32
                | IrType::F64
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            IrType::I8 | IrType::I16 | IrType::I32 | IrType::I64 | IrType::Char
        )
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, IrType::F32 | IrType::F64)
    }

    /// Element type if this is an array
    pub fn array_element(&self) -> Option<&IrType> {
        match self {
            IrType::Array(elem) => Some(elem),
            _ => None,
        }
    }

    /// Pointee type if this is a managed address
    pub fn pointee(&self) -> Option<&IrType> {
        match self {
            IrType::Address(ty) => Some(ty),
            _ => None,
        }
    }

    /// Get the default (zero) value for this type, as fields are initialized
    pub fn default_value(&self) -> IrValue {
        match self {
            IrType::Void => IrValue::Void,
            IrType::Bool => IrValue::Bool(false),
            IrType::I8 => IrValue::I8(0),
            IrType::I16 => IrValue::I16(0),
            IrType::I32 => IrValue::I32(0),
            IrType::I64 => IrValue::I64(0),
            IrType::Char => IrValue::Char(0),
            IrType::F32 => IrValue::F32(0.0),
            IrType::F64 => IrValue::F64(0.0),
            IrType::Object(_) | IrType::Array(_) | IrType::Null | IrType::Address(_) => {
                IrValue::Null
            }
        }
    }
}

/// IR constant value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrValue {
    /// No value
    Void,
    /// Null reference
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer values
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Char(u16),
    /// Floating point values
    F32(f32),
    F64(f64),
    /// Interned string literal
    String(String),
}

impl IrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, IrValue::Null)
    }

    /// Integer view of the constant, if it is integral
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            IrValue::Bool(b) => Some(*b as i64),
            IrValue::I8(v) => Some(*v as i64),
            IrValue::I16(v) => Some(*v as i64),
            IrValue::I32(v) => Some(*v as i64),
            IrValue::I64(v) => Some(*v),
            IrValue::Char(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::Bool => write!(f, "bool"),
            IrType::I8 => write!(f, "i8"),
            IrType::I16 => write!(f, "i16"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::Char => write!(f, "char"),
            IrType::F32 => write!(f, "f32"),
            IrType::F64 => write!(f, "f64"),
            IrType::Object(class) => write!(f, "ref {}", class),
            IrType::Array(elem) => write!(f, "[{}]", elem),
            IrType::Null => write!(f, "null"),
            IrType::Address(ty) => write!(f, "&{}", ty),
        }
    }
}

impl fmt::Display for IrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrValue::Void => write!(f, "void"),
            IrValue::Null => write!(f, "null"),
            IrValue::Bool(b) => write!(f, "{}", b),
            IrValue::I8(v) => write!(f, "{}i8", v),
            IrValue::I16(v) => write!(f, "{}i16", v),
            IrValue::I32(v) => write!(f, "{}", v),
            IrValue::I64(v) => write!(f, "{}i64", v),
            IrValue::Char(v) => write!(f, "'\\u{{{:04x}}}'", v),
            IrValue::F32(v) => write!(f, "{}f32", v),
            IrValue::F64(v) => write!(f, "{}", v),
            IrValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_kinds() {
        let obj = IrType::Object(ClassId(1));
        assert_eq!(obj.ref_kind(), RefKind::Reference);
        assert_eq!(IrType::array_of(IrType::I32).ref_kind(), RefKind::Array);
        assert_eq!(IrType::array_of(obj.clone()).ref_kind(), RefKind::RefArray);
        assert_eq!(IrType::I64.ref_kind(), RefKind::Primitive);
        assert_eq!(IrType::address_of(obj).ref_kind(), RefKind::Primitive);
    }

    #[test]
    fn test_type_display() {
        assert_eq!(format!("{}", IrType::I32), "i32");
        assert_eq!(format!("{}", IrType::array_of(IrType::Char)), "[char]");
        assert_eq!(format!("{}", IrType::address_of(IrType::I64)), "&i64");
    }

    #[test]
    fn test_default_values() {
        assert_eq!(IrType::I32.default_value(), IrValue::I32(0));
        assert_eq!(IrType::Object(ClassId(0)).default_value(), IrValue::Null);
        assert_eq!(IrValue::I32(5).as_i64(), Some(5));
        assert_eq!(IrValue::Null.as_i64(), None);
    }
}
