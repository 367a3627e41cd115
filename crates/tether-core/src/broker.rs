//! # Broker Trait
//!
//! The single interface every privileged execution channel implements.
//!
//! A broker knows how to do six things on the target and nothing more:
//! report its pointer width, call an exported routine, read bytes, write
//! bytes, allocate a region and free it. Everything else (argument graphs,
//! allocation lifetimes, string helpers) is built on top in safe userland
//! code. Two transports exist:
//!
//! - **Local**: [`LocalBroker`](crate::local::LocalBroker) lays requests out in
//!   a fixed binary format and hands them to a [`Device`](crate::device::Device)
//! - **Remote**: `RemoteBroker` in `tether-protocol` forwards requests over
//!   TCP to a `BrokerServer` wrapping any other broker
//!
//! ## Design Philosophy
//!
//! The trait methods are designed to be:
//! - **Synchronous**: each call blocks until the backend has answered
//! - **Shared**: methods take `&self`; transports serialize internally
//! - **Explicit**: every operation returns a [`Result`]

use std::sync::Arc;

use crate::error::Result;
use crate::requests::{Allocate, CallRequest, Free, ReadBytes, WriteBytes};
use crate::types::{Address, PointerWidth, Value};

/// Main broker interface
///
/// ## Thread Safety
///
/// Brokers are `Send + Sync` so that they can sit behind a server that
/// handles connections on several threads. Implementations guard their
/// backend with a lock; the server serializes dispatch on top of that.
pub trait Broker: Send + Sync
{
    /// Pointer width of the target.
    ///
    /// Fixed for the broker's lifetime. Transports that have to ask a peer
    /// cache the first answer.
    ///
    /// ## Errors
    ///
    /// Transport failures, or `UnsupportedPointerSize` if the backend reports
    /// anything other than 4 or 8.
    fn pointer_width(&self) -> Result<PointerWidth>;

    /// Call `module!function` on the target and return its result.
    ///
    /// Arguments must already be in target-native form: pointers are plain
    /// integers holding target addresses.
    ///
    /// ## Errors
    ///
    /// - `Target`: module or routine missing, or the routine itself failed
    /// - `Marshal`: a value doesn't fit its declared type
    fn call_function(&self, request: &CallRequest) -> Result<Value>;

    /// Read `request.size` bytes starting at `request.address`.
    ///
    /// ## Errors
    ///
    /// `Target` if any byte of the range is not accessible.
    fn read_bytes(&self, request: &ReadBytes) -> Result<Vec<u8>>;

    /// Write `request.data` into already-existing memory.
    ///
    /// ## Errors
    ///
    /// `Target` if any byte of the range is not accessible.
    fn write_bytes(&self, request: &WriteBytes) -> Result<()>;

    /// Allocate `request.size` bytes on the target.
    ///
    /// ## Errors
    ///
    /// `Target` if the backend is out of memory.
    fn allocate(&self, request: &Allocate) -> Result<Address>;

    /// Release a region obtained from [`Broker::allocate`].
    ///
    /// ## Errors
    ///
    /// `Target` if the address was not returned by `allocate` or was
    /// already freed.
    fn free(&self, request: &Free) -> Result<()>;
}

impl<B: Broker + ?Sized> Broker for Box<B>
{
    fn pointer_width(&self) -> Result<PointerWidth>
    {
        (**self).pointer_width()
    }

    fn call_function(&self, request: &CallRequest) -> Result<Value>
    {
        (**self).call_function(request)
    }

    fn read_bytes(&self, request: &ReadBytes) -> Result<Vec<u8>>
    {
        (**self).read_bytes(request)
    }

    fn write_bytes(&self, request: &WriteBytes) -> Result<()>
    {
        (**self).write_bytes(request)
    }

    fn allocate(&self, request: &Allocate) -> Result<Address>
    {
        (**self).allocate(request)
    }

    fn free(&self, request: &Free) -> Result<()>
    {
        (**self).free(request)
    }
}

impl<B: Broker + ?Sized> Broker for Arc<B>
{
    fn pointer_width(&self) -> Result<PointerWidth>
    {
        (**self).pointer_width()
    }

    fn call_function(&self, request: &CallRequest) -> Result<Value>
    {
        (**self).call_function(request)
    }

    fn read_bytes(&self, request: &ReadBytes) -> Result<Vec<u8>>
    {
        (**self).read_bytes(request)
    }

    fn write_bytes(&self, request: &WriteBytes) -> Result<()>
    {
        (**self).write_bytes(request)
    }

    fn allocate(&self, request: &Allocate) -> Result<Address>
    {
        (**self).allocate(request)
    }

    fn free(&self, request: &Free) -> Result<()>
    {
        (**self).free(request)
    }
}
