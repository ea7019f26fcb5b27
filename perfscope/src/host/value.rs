//! Runtime values of the host program
//!
//! Reference-type objects are shared (`Arc`) and compare by identity.
//! Value-type structs are copied on load and compare by contents. A
//! [`Value::ByRef`] is a managed pointer to a storage slot, which is how
//! value-type receivers reach instance methods.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::HostError;

/// Heap-allocated instance of a reference type.
#[derive(Debug)]
pub struct Object {
    pub type_name: String,
    pub fields: Mutex<Vec<Value>>,
}

impl Object {
    pub fn new(type_name: impl Into<String>, fields: Vec<Value>) -> Arc<Self> {
        Arc::new(Self { type_name: type_name.into(), fields: Mutex::new(fields) })
    }
}

/// Inline instance of a value type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub type_name: String,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Result of a method that returns nothing
    #[default]
    Unit,
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    Object(Arc<Object>),
    Struct(StructValue),
    /// Managed pointer to a storage slot
    ByRef(Arc<Mutex<Value>>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn object(type_name: &str, fields: Vec<Value>) -> Self {
        Value::Object(Object::new(type_name, fields))
    }

    pub fn new_struct(type_name: &str, fields: Vec<Value>) -> Self {
        Value::Struct(StructValue { type_name: type_name.to_string(), fields })
    }

    pub fn by_ref(value: Value) -> Self {
        Value::ByRef(Arc::new(Mutex::new(value)))
    }

    pub fn as_int(&self) -> Result<i64, HostError> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::ByRef(slot) => slot.lock().as_int(),
            other => Err(mismatch(other, "Int")),
        }
    }

    pub fn as_float(&self) -> Result<f64, HostError> {
        match self {
            Value::Float(v) => Ok(*v),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(v) => Ok(*v as f64),
            Value::ByRef(slot) => slot.lock().as_float(),
            other => Err(mismatch(other, "Float")),
        }
    }

    /// Truthiness used by conditional branches.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Unit | Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) | Value::Struct(_) => true,
            Value::ByRef(slot) => slot.lock().is_truthy(),
        }
    }

    /// Runtime type name used for virtual dispatch.
    pub fn runtime_type(&self) -> Option<String> {
        match self {
            Value::Object(obj) => Some(obj.type_name.clone()),
            Value::Struct(s) => Some(s.type_name.clone()),
            Value::ByRef(slot) => slot.lock().runtime_type(),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "Unit",
            Value::Null => "Null",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::Str(_) => "Str",
            Value::Object(_) => "Object",
            Value::Struct(_) => "Struct",
            Value::ByRef(_) => "ByRef",
        }
    }

    /// Read field `index` through an object, struct or pointer.
    pub fn field(&self, index: u16) -> Result<Value, HostError> {
        let i = usize::from(index);
        match self {
            Value::Object(obj) => obj.fields.lock().get(i).cloned().ok_or_else(|| no_field(self, index)),
            Value::Struct(s) => s.fields.get(i).cloned().ok_or_else(|| no_field(self, index)),
            Value::ByRef(slot) => slot.lock().field(index),
            other => Err(mismatch(other, "Object, Struct or ByRef")),
        }
    }

    /// Write field `index` of the object or pointed-to struct.
    ///
    /// Writing to a struct held by value would only change a copy, so a
    /// bare struct target is rejected.
    pub fn set_field(&self, index: u16, value: Value) -> Result<(), HostError> {
        let i = usize::from(index);
        match self {
            Value::Object(obj) => {
                let mut fields = obj.fields.lock();
                let slot = fields.get_mut(i).ok_or_else(|| no_field(self, index))?;
                *slot = value;
                Ok(())
            }
            Value::ByRef(ptr) => {
                let mut target = ptr.lock();
                match &mut *target {
                    Value::Struct(s) => {
                        let type_name = s.type_name.clone();
                        let slot = s.fields.get_mut(i).ok_or_else(|| HostError::TypeMismatch {
                            context: format!("{type_name} field {index}"),
                            expected: "existing field".to_string(),
                        })?;
                        *slot = value;
                        Ok(())
                    }
                    Value::Object(obj) => Value::Object(Arc::clone(obj)).set_field(index, value),
                    other => Err(mismatch(other, "Struct or Object behind pointer")),
                }
            }
            other => Err(mismatch(other, "Object or ByRef")),
        }
    }
}

fn mismatch(value: &Value, expected: &str) -> HostError {
    HostError::TypeMismatch { context: format!("value of kind {}", value.kind()), expected: expected.to_string() }
}

fn no_field(value: &Value, index: u16) -> HostError {
    HostError::TypeMismatch {
        context: format!("{} field {index}", value.runtime_type().unwrap_or_default()),
        expected: "existing field".to_string(),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) | (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::ByRef(a), Value::ByRef(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Object(obj) => write!(f, "<{}>", obj.type_name),
            Value::Struct(s) => write!(f, "{}{{{} fields}}", s.type_name, s.fields.len()),
            Value::ByRef(slot) => write!(f, "&{}", slot.lock()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objects_compare_by_identity() {
        let a = Value::object("Pawn", vec![Value::Int(1)]);
        let b = Value::object("Pawn", vec![Value::Int(1)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_structs_compare_by_contents() {
        let a = Value::new_struct("Counter", vec![Value::Int(3)]);
        let b = Value::new_struct("Counter", vec![Value::Int(3)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_field_through_pointer() {
        let ptr = Value::by_ref(Value::new_struct("Counter", vec![Value::Int(0)]));
        ptr.set_field(0, Value::Int(9)).unwrap();
        assert_eq!(ptr.field(0).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_set_field_on_bare_struct_rejected() {
        let s = Value::new_struct("Counter", vec![Value::Int(0)]);
        assert!(s.set_field(0, Value::Int(1)).is_err());
    }

    #[test]
    fn test_runtime_type_through_pointer() {
        let ptr = Value::by_ref(Value::object("Colonist", vec![]));
        assert_eq!(ptr.runtime_type().as_deref(), Some("Colonist"));
        assert_eq!(Value::Int(1).runtime_type(), None);
    }
}
