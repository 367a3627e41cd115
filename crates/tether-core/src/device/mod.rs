//! # Privileged Devices
//!
//! A [`Device`] is whatever actually executes requests with privilege: a
//! kernel driver behind an I/O control code in production, or the
//! [`EmulatedDevice`] in tests and demos. Devices only ever see the binary
//! layout from [`local::layout`](crate::local::layout) plus the caller's
//! [`Scratch`].

mod emulator;
mod routines;

use thiserror::Error;

pub use self::emulator::{EmulatedDevice, Routine, TargetHeap};
pub use self::routines::{install_kernel_routines, KERNEL_MODULE};
use crate::error::TetherError;
use crate::local::Scratch;
use crate::types::{Address, PointerWidth};

/// Errors raised by a device while executing a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError
{
    /// No module of that name is loaded on the target
    #[error("Module {0} not found")]
    ModuleNotFound(String),

    /// The module exists but doesn't export the routine
    #[error("Routine {module}!{function} not found")]
    RoutineNotFound
    {
        module: String,
        function: String,
    },

    /// Part of the range isn't backed by memory
    #[error("Access violation touching {len} bytes at {address}")]
    AccessViolation
    {
        address: Address,
        len: usize,
    },

    /// Freed an address that was never handed out (or was already freed)
    #[error("No allocation found at {0}")]
    NotAllocated(Address),

    /// The target heap is exhausted
    #[error("Out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// The request bytes don't follow the layout
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The kind byte isn't a known request kind
    #[error("Unrecognized request type {0}")]
    UnknownRequestKind(u8),

    /// The routine itself failed
    #[error("{0}")]
    Routine(String),
}

impl From<DeviceError> for TetherError
{
    fn from(e: DeviceError) -> Self
    {
        match e {
            DeviceError::MalformedRequest(_) | DeviceError::UnknownRequestKind(_) => TetherError::Protocol(e.to_string()),
            other => TetherError::Target(other.to_string()),
        }
    }
}

/// A privileged executor of laid-out requests.
pub trait Device: Send
{
    /// Pointer width of the machine the device runs on.
    fn pointer_width(&self) -> PointerWidth;

    /// Execute one request.
    ///
    /// `request` is in the binary layout; results go into `scratch` at the
    /// slots the request names.
    ///
    /// ## Errors
    ///
    /// Any [`DeviceError`].
    fn dispatch(&mut self, request: &[u8], scratch: &mut Scratch) -> Result<(), DeviceError>;
}
