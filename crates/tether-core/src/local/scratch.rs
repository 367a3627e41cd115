//! Caller-owned scratch space.
//!
//! The local transport never hands the device real pointers into the
//! caller's process. Instead, argument values, result slots and I/O buffers
//! live in a [`Scratch`] arena and the request carries their scratch
//! addresses; the device reads and writes through the arena.

use std::collections::BTreeMap;

use crate::device::DeviceError;
use crate::types::Address;

const SCRATCH_BASE: u64 = 0x0020_0000;
const SCRATCH_ALIGN: u64 = 16;

/// Addressable arena of caller-visible buffers.
#[derive(Debug, Clone)]
pub struct Scratch
{
    buffers: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Default for Scratch
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Scratch
{
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            buffers: BTreeMap::new(),
            next: SCRATCH_BASE,
        }
    }

    /// Reserve a zero-filled buffer of `len` bytes.
    pub fn reserve(&mut self, len: usize) -> Address
    {
        let address = self.next;
        let span = (len.max(1) as u64).div_ceil(SCRATCH_ALIGN) * SCRATCH_ALIGN;
        self.next += span;
        self.buffers.insert(address, vec![0; len]);
        Address::new(address)
    }

    /// Reserve a buffer holding a copy of `data`.
    pub fn stage(&mut self, data: &[u8]) -> Address
    {
        let address = self.reserve(data.len());
        if let Some(buffer) = self.buffers.get_mut(&address.value()) {
            buffer.copy_from_slice(data);
        }
        address
    }

    /// Borrow `len` bytes at `address`.
    ///
    /// ## Errors
    ///
    /// `AccessViolation` unless the whole range lies inside one buffer.
    pub fn read(&self, address: Address, len: usize) -> Result<&[u8], DeviceError>
    {
        let (base, offset) = self.locate(address, len)?;
        let buffer = &self.buffers[&base];
        Ok(&buffer[offset..offset + len])
    }

    /// Copy `data` into the buffer at `address`.
    ///
    /// ## Errors
    ///
    /// `AccessViolation` unless the whole range lies inside one buffer.
    pub fn write(&mut self, address: Address, data: &[u8]) -> Result<(), DeviceError>
    {
        let (base, offset) = self.locate(address, data.len())?;
        let buffer = self
            .buffers
            .get_mut(&base)
            .ok_or(DeviceError::AccessViolation { address, len: data.len() })?;
        buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn locate(&self, address: Address, len: usize) -> Result<(u64, usize), DeviceError>
    {
        let violation = DeviceError::AccessViolation { address, len };
        let (base, buffer) = self.buffers.range(..=address.value()).next_back().ok_or(violation.clone())?;
        let offset = usize::try_from(address.value() - base).map_err(|_| violation.clone())?;
        if offset.checked_add(len).is_some_and(|end| end <= buffer.len()) {
            Ok((*base, offset))
        } else {
            Err(violation)
        }
    }
}
