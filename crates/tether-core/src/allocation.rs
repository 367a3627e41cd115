//! # Remote Allocations
//!
//! An [`Allocation`] is a handle to a region of target memory obtained from a
//! broker. It remembers its address and size, reads and writes with bounds
//! checks, and frees itself exactly once.
//!
//! Callers are expected to call [`Allocation::free`] explicitly. Dropping a
//! live handle still releases the region, but logs a warning since that
//! usually means a code path forgot to clean up.

use std::fmt;

use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::{Result, TetherError};
use crate::requests::{Allocate, Free, ReadBytes, WriteBytes};
use crate::types::Address;

enum State
{
    Active
    {
        address: Address,
        size: usize,
    },
    Released,
}

/// A live (or released) region of target memory.
pub struct Allocation<'b>
{
    broker: &'b dyn Broker,
    state: State,
}

impl<'b> Allocation<'b>
{
    /// Allocate `size` bytes through `broker`.
    ///
    /// ## Errors
    ///
    /// - `ZeroSizedAllocation` if `size` is 0
    /// - Whatever the broker reports for the allocation itself
    pub fn new(broker: &'b dyn Broker, size: usize) -> Result<Self>
    {
        if size == 0 {
            return Err(TetherError::ZeroSizedAllocation);
        }

        let address = broker.allocate(&Allocate::new(size))?;
        debug!("Allocated {size} bytes at {address}");
        Ok(Self {
            broker,
            state: State::Active { address, size },
        })
    }

    /// Take ownership of a region that was allocated elsewhere.
    ///
    /// The handle will free it like any other allocation. A size of 0 yields
    /// an already released handle.
    #[must_use]
    pub fn from_raw(broker: &'b dyn Broker, address: Address, size: usize) -> Self
    {
        let state = if size == 0 {
            State::Released
        } else {
            State::Active { address, size }
        };
        Self { broker, state }
    }

    /// Target address, or [`Address::ZERO`] once released.
    #[must_use]
    pub fn address(&self) -> Address
    {
        match self.state {
            State::Active { address, .. } => address,
            State::Released => Address::ZERO,
        }
    }

    /// Size in bytes, or 0 once released.
    #[must_use]
    pub fn len(&self) -> usize
    {
        match self.state {
            State::Active { size, .. } => size,
            State::Released => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    #[must_use]
    pub fn is_released(&self) -> bool
    {
        matches!(self.state, State::Released)
    }

    /// Read the whole region.
    ///
    /// ## Errors
    ///
    /// `AllocationReleased` after [`free`](Self::free), otherwise broker errors.
    pub fn read(&self) -> Result<Vec<u8>>
    {
        let (address, size) = self.active()?;
        self.broker.read_bytes(&ReadBytes::new(address, size))
    }

    /// Read `len` bytes starting `offset` bytes into the region.
    ///
    /// ## Errors
    ///
    /// Same bounds errors as [`write`](Self::write).
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>>
    {
        let (address, size) = self.active()?;
        check_bounds(offset, len, size)?;
        self.broker.read_bytes(&ReadBytes::new(address + offset as u64, len))
    }

    /// Write `data` starting `offset` bytes into the region.
    ///
    /// ## Errors
    ///
    /// - `OffsetOutOfBounds` if `offset >= len()`
    /// - `LengthOutOfBounds` if `offset + data.len() > len()`
    /// - `AllocationReleased` after [`free`](Self::free)
    pub fn write(&self, data: &[u8], offset: usize) -> Result<()>
    {
        let (address, size) = self.active()?;
        check_bounds(offset, data.len(), size)?;
        self.broker.write_bytes(&WriteBytes::new(address + offset as u64, data))
    }

    /// Release the region. Calling this again is a no-op.
    ///
    /// The handle counts as released even if the broker reports an error,
    /// so a region is never freed twice.
    ///
    /// ## Errors
    ///
    /// Whatever the broker reports for the free itself.
    pub fn free(&mut self) -> Result<()>
    {
        match std::mem::replace(&mut self.state, State::Released) {
            State::Active { address, size } => {
                debug!("Freeing {size} bytes at {address}");
                self.broker.free(&Free::new(address))
            }
            State::Released => Ok(()),
        }
    }

    /// Give up ownership without freeing.
    ///
    /// Returns the address and size; the region must be freed by whoever
    /// takes them.
    #[must_use]
    pub fn into_raw(mut self) -> (Address, usize)
    {
        match std::mem::replace(&mut self.state, State::Released) {
            State::Active { address, size } => (address, size),
            State::Released => (Address::ZERO, 0),
        }
    }

    fn active(&self) -> Result<(Address, usize)>
    {
        match self.state {
            State::Active { address, size } => Ok((address, size)),
            State::Released => Err(TetherError::AllocationReleased),
        }
    }
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<()>
{
    if offset >= size {
        return Err(TetherError::OffsetOutOfBounds { offset, size });
    }
    let available = size - offset;
    if len > available {
        return Err(TetherError::LengthOutOfBounds { available, len });
    }
    Ok(())
}

impl Drop for Allocation<'_>
{
    fn drop(&mut self)
    {
        if let State::Active { address, size } = self.state {
            warn!("Allocation of {size} bytes at {address} dropped without being freed");
            if let Err(e) = self.free() {
                warn!("Failed to free allocation at {address}: {e}");
            }
        }
    }
}

impl fmt::Debug for Allocation<'_>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.state {
            State::Active { address, size } => f
                .debug_struct("Allocation")
                .field("address", &address)
                .field("size", &size)
                .finish(),
            State::Released => f.write_str("Allocation(released)"),
        }
    }
}
