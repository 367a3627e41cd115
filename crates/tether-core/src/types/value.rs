//! Values that flow through the marshaller.

use serde::{Deserialize, Serialize};

use super::address::Address;
use super::descriptor::TypeDescriptor;
use super::ffi::FfiType;

/// A value in a local argument graph or decoded from the target.
///
/// `Pointer` always holds a *local* address (an object in a
/// [`LocalMemory`](crate::translate::LocalMemory)); once translated, pointers
/// travel as `UInt` target addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value
{
    Void,
    Int(i64),
    UInt(u64),
    Float(f64),
    Pointer(Address),
    Record(Vec<Value>),
    Array(Vec<Value>),
    Bytes(Vec<u8>),
}

impl Value
{
    /// The null local pointer.
    pub const NULL: Value = Value::Pointer(Address::ZERO);

    /// A zero value shaped like `ty`.
    #[must_use]
    pub fn zeroed(ty: &TypeDescriptor) -> Value
    {
        match ty {
            TypeDescriptor::Scalar(FfiType::Void) => Value::Void,
            TypeDescriptor::Scalar(kind) if kind.is_float() => Value::Float(0.0),
            TypeDescriptor::Scalar(kind) if kind.is_signed() => Value::Int(0),
            TypeDescriptor::Scalar(_) => Value::UInt(0),
            TypeDescriptor::Pointer(_) => Value::NULL,
            TypeDescriptor::Record(record) => Value::Record(record.fields.iter().map(|f| Value::zeroed(&f.ty)).collect()),
            TypeDescriptor::Array { element, len } => match **element {
                TypeDescriptor::Scalar(FfiType::UInt8 | FfiType::UChar) => Value::Bytes(vec![0; *len]),
                _ => Value::Array(vec![Value::zeroed(element); *len]),
            },
        }
    }

    /// Raw 64-bit pattern of an integer-like value.
    ///
    /// Signed values are reinterpreted, pointers yield their local address.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn as_u64(&self) -> Option<u64>
    {
        match self {
            Value::Int(v) => Some(*v as u64),
            Value::UInt(v) => Some(*v),
            Value::Pointer(address) => Some(address.value()),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn as_i64(&self) -> Option<i64>
    {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => Some(*v as i64),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64>
    {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Field `index` of a record value.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Value>
    {
        match self {
            Value::Record(fields) => fields.get(index),
            _ => None,
        }
    }
}

impl From<i32> for Value
{
    fn from(v: i32) -> Self
    {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value
{
    fn from(v: i64) -> Self
    {
        Value::Int(v)
    }
}

impl From<u32> for Value
{
    fn from(v: u32) -> Self
    {
        Value::UInt(u64::from(v))
    }
}

impl From<u64> for Value
{
    fn from(v: u64) -> Self
    {
        Value::UInt(v)
    }
}

impl From<f64> for Value
{
    fn from(v: f64) -> Self
    {
        Value::Float(v)
    }
}

impl From<Address> for Value
{
    fn from(address: Address) -> Self
    {
        Value::Pointer(address)
    }
}

impl From<Vec<u8>> for Value
{
    fn from(bytes: Vec<u8>) -> Self
    {
        Value::Bytes(bytes)
    }
}
