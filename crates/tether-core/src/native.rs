//! Native type derivation.
//!
//! The target sees pointers as plain unsigned integers of its own width.
//! [`native_type`] rewrites a descriptor accordingly: every pointer becomes a
//! pointer-sized integer, and records containing pointers get a derived
//! counterpart named `<NAME>_NATIVE`. Anything without pointers comes back as
//! the very same [`TypeRef`].

use std::sync::Arc;

use tracing::trace;

use crate::types::{Field, PointerWidth, Record, TypeDescriptor, TypeRef};

/// Map `ty` to its target-native form.
///
/// Idempotent: mapping a native type returns it unchanged.
#[must_use]
pub fn native_type(ty: &TypeRef, width: PointerWidth) -> TypeRef
{
    match &**ty {
        TypeDescriptor::Scalar(_) => Arc::clone(ty),
        TypeDescriptor::Pointer(_) => TypeDescriptor::scalar(width.native_pointer_type()),
        TypeDescriptor::Array { element, len } => {
            let mapped = native_type(element, width);
            if Arc::ptr_eq(&mapped, element) {
                Arc::clone(ty)
            } else {
                TypeDescriptor::array(mapped, *len)
            }
        }
        TypeDescriptor::Record(record) => native_record(ty, record, width),
    }
}

fn native_record(ty: &TypeRef, record: &Record, width: PointerWidth) -> TypeRef
{
    let mut altered = false;
    let fields: Vec<Field> = record
        .fields
        .iter()
        .map(|field| {
            let mapped = native_type(&field.ty, width);
            altered |= !Arc::ptr_eq(&mapped, &field.ty);
            Field {
                name: field.name.clone(),
                ty: mapped,
            }
        })
        .collect();

    if !altered {
        return Arc::clone(ty);
    }

    let name = format!("{}_NATIVE", record.name);
    trace!("Derived {name} for a {width} target");

    #[allow(clippy::cast_possible_truncation)]
    let packing = record.packing.unwrap_or(width.bytes() as u32);
    Arc::new(TypeDescriptor::Record(Record { name, fields, packing: Some(packing) }))
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::FfiType;

    fn unicode_string() -> TypeRef
    {
        TypeDescriptor::record(
            "UNICODE_STRING",
            [
                ("Length", TypeDescriptor::scalar(FfiType::UShort)),
                ("MaximumLength", TypeDescriptor::scalar(FfiType::UShort)),
                ("Buffer", TypeDescriptor::pointer(TypeDescriptor::scalar(FfiType::UInt16))),
            ],
        )
    }

    #[test]
    fn test_pointer_free_types_are_identical()
    {
        let plain = TypeDescriptor::record(
            "POINT",
            [("x", TypeDescriptor::scalar(FfiType::SLong)), ("y", TypeDescriptor::scalar(FfiType::SLong))],
        );
        assert!(Arc::ptr_eq(&native_type(&plain, PointerWidth::Bits64), &plain));

        let bytes = TypeDescriptor::bytes(16);
        assert!(Arc::ptr_eq(&native_type(&bytes, PointerWidth::Bits32), &bytes));
    }

    #[test]
    fn test_pointer_becomes_integer()
    {
        let ptr = TypeDescriptor::opaque_pointer();
        assert_eq!(*native_type(&ptr, PointerWidth::Bits64), TypeDescriptor::Scalar(FfiType::UInt64));
        assert_eq!(*native_type(&ptr, PointerWidth::Bits32), TypeDescriptor::Scalar(FfiType::UInt32));
    }

    #[test]
    fn test_record_with_pointer_is_derived()
    {
        let native = native_type(&unicode_string(), PointerWidth::Bits64);
        let TypeDescriptor::Record(record) = &*native else {
            panic!("expected a record, got {native}");
        };
        assert_eq!(record.name, "UNICODE_STRING_NATIVE");
        assert_eq!(record.packing, Some(8));
        assert_eq!(*record.fields[2].ty, TypeDescriptor::Scalar(FfiType::UInt64));
        assert_eq!(native.size(PointerWidth::Bits64), 16);
    }

    #[test]
    fn test_mapping_is_idempotent()
    {
        for width in [PointerWidth::Bits32, PointerWidth::Bits64] {
            let once = native_type(&unicode_string(), width);
            let twice = native_type(&once, width);
            assert!(Arc::ptr_eq(&once, &twice));
        }
    }

    #[test]
    fn test_array_of_pointers()
    {
        let table = TypeDescriptor::array(TypeDescriptor::opaque_pointer(), 4);
        let native = native_type(&table, PointerWidth::Bits32);
        assert_eq!(native.size(PointerWidth::Bits32), 16);
        assert!(!Arc::ptr_eq(&native, &table));
    }
}
