//! Reachability over a local object graph.

use std::collections::HashSet;

use super::filter::AddressFilter;
use super::memory::{LocalMemory, LocalObject};
use crate::error::{Result, TetherError};
use crate::types::{Address, FfiType, TypeDescriptor, TypeRef, Value};

/// A local object reached while walking an argument graph.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reachable<'m>
{
    pub address: Address,
    pub object: &'m LocalObject,
}

/// Every distinct accepted pointer reachable from `root`, root first.
///
/// Each object is visited once no matter how many pointers alias it, so
/// cycles terminate. Pointers the filter rejects are neither followed nor
/// returned.
///
/// ## Errors
///
/// - `DanglingPointer` if an accepted pointer has no object behind it
/// - `ValueMismatch` if a typed pointer refers to an object of another type
pub(crate) fn reachable_from(root: Address, memory: &LocalMemory, filter: AddressFilter) -> Result<Vec<Reachable<'_>>>
{
    let mut visited = HashSet::new();
    let mut found = Vec::new();
    let mut pending: Vec<(Address, Option<TypeRef>)> = vec![(root, None)];

    while let Some((address, declared)) = pending.pop() {
        if !filter.accepts(address) || !visited.insert(address) {
            continue;
        }

        let object = memory.get(address).ok_or(TetherError::DanglingPointer(address))?;
        if let Some(declared) = declared {
            let opaque = matches!(*declared, TypeDescriptor::Scalar(FfiType::Void));
            if !opaque && *declared != *object.ty {
                return Err(TetherError::mismatch(&*declared, &object.ty));
            }
        }

        found.push(Reachable { address, object });

        let mut children = Vec::new();
        pointers_in(&object.value, &object.ty, &mut children)?;
        // reversed so the walk visits fields in declaration order
        pending.extend(children.into_iter().rev());
    }

    Ok(found)
}

/// Collect the local pointers embedded in `value`, with their declared targets.
fn pointers_in(value: &Value, ty: &TypeDescriptor, out: &mut Vec<(Address, Option<TypeRef>)>) -> Result<()>
{
    match (ty, value) {
        (TypeDescriptor::Pointer(target), Value::Pointer(address)) => {
            out.push((*address, Some(target.clone())));
            Ok(())
        }
        (TypeDescriptor::Record(record), Value::Record(fields)) => {
            if record.fields.len() != fields.len() {
                return Err(TetherError::mismatch(ty, value));
            }
            for (field, field_value) in record.fields.iter().zip(fields) {
                pointers_in(field_value, &field.ty, out)?;
            }
            Ok(())
        }
        (TypeDescriptor::Array { element, .. }, Value::Array(items)) => {
            for item in items {
                pointers_in(item, element, out)?;
            }
            Ok(())
        }
        // raw integers in pointer slots are already target addresses
        _ => Ok(()),
    }
}
