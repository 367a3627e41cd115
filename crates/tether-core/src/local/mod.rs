//! # Local Transport
//!
//! [`LocalBroker`] talks to a privileged [`Device`] on the same machine.
//! Each operation is laid out in the fixed binary format from [`layout`],
//! its inputs and result slots are placed in a fresh [`Scratch`], and the
//! device is asked to execute it. Results are collected from the scratch
//! slots the device wrote.

pub mod layout;
mod scratch;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;
use tracing::debug;

pub use self::layout::{DeviceRequest, RequestKind};
pub use self::scratch::Scratch;
use crate::broker::Broker;
use crate::codec;
use crate::device::Device;
use crate::error::{Result, TetherError};
use crate::requests::{Allocate, CallRequest, Free, ReadBytes, WriteBytes};
use crate::types::{Address, FfiType, PointerWidth, Value};

/// Broker backed by a local privileged device.
///
/// The device sits behind a mutex, so a `LocalBroker` can be shared between
/// threads; requests reach the device one at a time.
pub struct LocalBroker<D: Device>
{
    device: Mutex<D>,
    width: PointerWidth,
}

impl<D: Device> LocalBroker<D>
{
    /// Wrap `device`. Its pointer width is read once here.
    pub fn new(device: D) -> Self
    {
        let width = device.pointer_width();
        Self {
            device: Mutex::new(device),
            width,
        }
    }

    /// Run `f` with exclusive access to the device.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R
    {
        f(&mut self.device.lock())
    }

    fn submit(&self, request: &DeviceRequest, scratch: &mut Scratch) -> Result<()>
    {
        let bytes = request.encode(self.width)?;
        debug!(kind = %request.kind(), len = bytes.len(), "Dispatching request to device");
        self.device.lock().dispatch(&bytes, scratch).map_err(TetherError::from)
    }

    fn read_address(&self, scratch: &Scratch, slot: Address) -> Result<Address>
    {
        let mut raw = scratch.read(slot, self.width.bytes())?;
        Ok(Address::new(raw.read_uint::<LittleEndian>(self.width.bytes())?))
    }
}

impl<D: Device> Broker for LocalBroker<D>
{
    fn pointer_width(&self) -> Result<PointerWidth>
    {
        Ok(self.width)
    }

    fn call_function(&self, request: &CallRequest) -> Result<Value>
    {
        let mut scratch = Scratch::new();

        let mut argument_types = Vec::with_capacity(request.arguments.len());
        let mut argument_slots = Vec::with_capacity(request.arguments.len());
        for argument in &request.arguments {
            if argument.ty == FfiType::Void {
                return Err(TetherError::UnsupportedType(format!(
                    "VOID argument to {}!{}",
                    request.module, request.function
                )));
            }
            let bytes = codec::encode_scalar(&argument.value, argument.ty, self.width)?;
            argument_types.push(argument.ty);
            argument_slots.push(scratch.stage(&bytes));
        }

        let result_size = match request.return_type {
            FfiType::Void => self.width.bytes(),
            ty => ty.size(self.width),
        };
        let result_slot = scratch.reserve(result_size);

        let layout = DeviceRequest::CallFunction {
            module: request.module.clone(),
            function: request.function.clone(),
            return_type: request.return_type,
            argument_types,
            result_slot,
            argument_slots,
        };
        self.submit(&layout, &mut scratch)?;

        if request.return_type == FfiType::Void {
            return Ok(Value::Void);
        }
        let raw = scratch.read(result_slot, result_size)?;
        codec::decode_scalar(raw, request.return_type, self.width)
    }

    fn read_bytes(&self, request: &ReadBytes) -> Result<Vec<u8>>
    {
        let size = layout::layout_size(request.size)?;
        let mut scratch = Scratch::new();
        let buffer = scratch.reserve(request.size);

        self.submit(
            &DeviceRequest::ReadBytes {
                address: request.address,
                buffer,
                size,
            },
            &mut scratch,
        )?;
        Ok(scratch.read(buffer, request.size)?.to_vec())
    }

    fn write_bytes(&self, request: &WriteBytes) -> Result<()>
    {
        let size = layout::layout_size(request.data.len())?;
        let mut scratch = Scratch::new();
        let buffer = scratch.stage(&request.data);

        self.submit(
            &DeviceRequest::WriteBytes {
                address: request.address,
                buffer,
                size,
            },
            &mut scratch,
        )
    }

    fn allocate(&self, request: &Allocate) -> Result<Address>
    {
        let size = layout::layout_size(request.size)?;
        let mut scratch = Scratch::new();
        let result_slot = scratch.reserve(self.width.bytes());

        self.submit(&DeviceRequest::Allocate { size, result_slot }, &mut scratch)?;
        self.read_address(&scratch, result_slot)
    }

    fn free(&self, request: &Free) -> Result<()>
    {
        let mut scratch = Scratch::new();
        self.submit(&DeviceRequest::Free { address: request.address }, &mut scratch)
    }
}
