//! Local object memory.
//!
//! Argument graphs are built in a [`LocalMemory`]: every object gets a
//! stable local address, and [`Value::Pointer`] values refer to objects by
//! that address. Pointers can alias and form cycles; the translator follows
//! them the same way it would follow raw pointers in the caller's process.

use std::collections::BTreeMap;

use crate::error::{Result, TetherError};
use crate::types::{Address, PointerWidth, TypeRef, Value};

const LOCAL_BASE: u64 = 0x0001_0000;
const LOCAL_ALIGN: u64 = 16;

/// A typed object living at a local address.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalObject
{
    pub ty: TypeRef,
    pub value: Value,
}

/// Arena of typed local objects.
///
/// ```rust
/// use tether_core::translate::LocalMemory;
/// use tether_core::types::{FfiType, TypeDescriptor, Value};
///
/// let mut memory = LocalMemory::new();
/// let x = memory.place(TypeDescriptor::scalar(FfiType::SInt), Value::Int(4));
/// assert_eq!(memory.value(x), Some(&Value::Int(4)));
/// ```
#[derive(Debug, Clone)]
pub struct LocalMemory
{
    objects: BTreeMap<Address, LocalObject>,
    next: u64,
}

impl Default for LocalMemory
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl LocalMemory
{
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            objects: BTreeMap::new(),
            next: LOCAL_BASE,
        }
    }

    /// Place a new object and return its address.
    ///
    /// The value is not checked against `ty` until it is encoded.
    pub fn place(&mut self, ty: TypeRef, value: Value) -> Address
    {
        let address = Address::new(self.next);
        let size = ty.size(PointerWidth::Bits64).max(1) as u64;
        self.next += size.div_ceil(LOCAL_ALIGN) * LOCAL_ALIGN;
        self.objects.insert(address, LocalObject { ty, value });
        address
    }

    /// Place a zero-initialized object.
    ///
    /// Useful for building cycles: reserve first, [`store`](Self::store) once
    /// every address is known.
    pub fn reserve(&mut self, ty: TypeRef) -> Address
    {
        let value = Value::zeroed(&ty);
        self.place(ty, value)
    }

    /// Replace the value of an existing object.
    ///
    /// ## Errors
    ///
    /// `DanglingPointer` if nothing lives at `address`.
    pub fn store(&mut self, address: Address, value: Value) -> Result<()>
    {
        let object = self
            .objects
            .get_mut(&address)
            .ok_or(TetherError::DanglingPointer(address))?;
        object.value = value;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, address: Address) -> Option<&LocalObject>
    {
        self.objects.get(&address)
    }

    #[must_use]
    pub fn value(&self, address: Address) -> Option<&Value>
    {
        self.get(address).map(|object| &object.value)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.objects.is_empty()
    }
}
