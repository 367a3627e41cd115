//! An in-process stand-in for the privileged driver.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::{debug, trace};

use super::{Device, DeviceError};
use crate::codec;
use crate::local::{DeviceRequest, Scratch};
use crate::types::{Address, FfiType, PointerWidth, TypeDescriptor, Value};

const HEAP_BASE_32: u64 = 0x8100_0000;
const HEAP_END_32: u64 = 0xffff_0000;
const HEAP_BASE_64: u64 = 0xffff_a000_0000_0000;
const HEAP_END_64: u64 = 0xffff_f000_0000_0000;
const HEAP_ALIGN: u64 = 16;
// unmapped gap between regions so overruns fault
const HEAP_GUARD: u64 = 16;

/// A routine callable through the emulated device.
///
/// Receives the decoded argument values (pointers arrive as `UInt` target
/// addresses) and the target heap so it can dereference them.
pub type Routine = Box<dyn Fn(&mut TargetHeap, &[Value]) -> Result<Value, DeviceError> + Send>;

/// Target memory of the emulated device.
///
/// Regions are handed out from the privileged range for the target width,
/// zero-filled, and separated by unmapped guard gaps.
#[derive(Debug, Clone)]
pub struct TargetHeap
{
    width: PointerWidth,
    regions: BTreeMap<u64, Vec<u8>>,
    next: u64,
    end: u64,
}

impl TargetHeap
{
    #[must_use]
    pub fn new(width: PointerWidth) -> Self
    {
        let (next, end) = match width {
            PointerWidth::Bits32 => (HEAP_BASE_32, HEAP_END_32),
            PointerWidth::Bits64 => (HEAP_BASE_64, HEAP_END_64),
        };
        Self {
            width,
            regions: BTreeMap::new(),
            next,
            end,
        }
    }

    #[must_use]
    pub fn pointer_width(&self) -> PointerWidth
    {
        self.width
    }

    /// Allocate a zero-filled region.
    ///
    /// ## Errors
    ///
    /// `OutOfMemory` once the heap range is exhausted.
    pub fn allocate(&mut self, size: usize) -> Result<Address, DeviceError>
    {
        let span = (size.max(1) as u64).div_ceil(HEAP_ALIGN) * HEAP_ALIGN + HEAP_GUARD;
        let base = self.next;
        self.next = base
            .checked_add(span)
            .filter(|next| *next <= self.end)
            .ok_or(DeviceError::OutOfMemory(size))?;
        self.regions.insert(base, vec![0; size]);
        trace!("Heap region of {size} bytes at 0x{base:x}");
        Ok(Address::new(base))
    }

    /// Release a region by its base address.
    ///
    /// ## Errors
    ///
    /// `NotAllocated` if `address` isn't the base of a live region.
    pub fn free(&mut self, address: Address) -> Result<(), DeviceError>
    {
        self.regions
            .remove(&address.value())
            .map(|_| ())
            .ok_or(DeviceError::NotAllocated(address))
    }

    /// Copy `len` bytes out of target memory.
    ///
    /// ## Errors
    ///
    /// `AccessViolation` unless the range lies inside one live region.
    pub fn read(&self, address: Address, len: usize) -> Result<Vec<u8>, DeviceError>
    {
        let (base, offset) = self.locate(address, len)?;
        Ok(self.regions[&base][offset..offset + len].to_vec())
    }

    /// Copy `data` into target memory.
    ///
    /// ## Errors
    ///
    /// `AccessViolation` unless the range lies inside one live region.
    pub fn write(&mut self, address: Address, data: &[u8]) -> Result<(), DeviceError>
    {
        let (base, offset) = self.locate(address, data.len())?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(DeviceError::AccessViolation { address, len: data.len() })?;
        region[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Decode a value of type `ty` stored at `address`.
    ///
    /// ## Errors
    ///
    /// `AccessViolation` for unmapped memory.
    pub fn read_value(&self, address: Address, ty: &TypeDescriptor) -> Result<Value, DeviceError>
    {
        let bytes = self.read(address, ty.size(self.width))?;
        codec::decode(&bytes, ty, self.width).map_err(|e| DeviceError::Routine(e.to_string()))
    }

    /// Encode `value` as `ty` and store it at `address`.
    ///
    /// ## Errors
    ///
    /// `AccessViolation` for unmapped memory, `Routine` if the value doesn't
    /// fit the type.
    pub fn write_value(&mut self, address: Address, value: &Value, ty: &TypeDescriptor) -> Result<(), DeviceError>
    {
        let bytes = codec::encode(value, ty, self.width, &crate::translate::AddressMap::default())
            .map_err(|e| DeviceError::Routine(e.to_string()))?;
        self.write(address, &bytes)
    }

    /// Number of live regions.
    #[must_use]
    pub fn live_regions(&self) -> usize
    {
        self.regions.len()
    }

    /// Whether `address` is the base of a live region.
    #[must_use]
    pub fn is_allocated(&self, address: Address) -> bool
    {
        self.regions.contains_key(&address.value())
    }

    fn locate(&self, address: Address, len: usize) -> Result<(u64, usize), DeviceError>
    {
        let violation = DeviceError::AccessViolation { address, len };
        let (base, region) = self.regions.range(..=address.value()).next_back().ok_or(violation.clone())?;
        let offset = usize::try_from(address.value() - base).map_err(|_| violation.clone())?;
        if offset.checked_add(len).is_some_and(|end| end <= region.len()) {
            Ok((*base, offset))
        } else {
            Err(violation)
        }
    }
}

/// Emulated privileged device.
///
/// ```rust
/// use tether_core::device::EmulatedDevice;
/// use tether_core::local::LocalBroker;
/// use tether_core::requests::{Allocate, ReadBytes};
/// use tether_core::types::{PointerWidth, Value};
/// use tether_core::Broker;
///
/// let mut device = EmulatedDevice::new(PointerWidth::Bits64);
/// device.register("hal", "Answer", |_, _| Ok(Value::UInt(42)));
///
/// let broker = LocalBroker::new(device);
/// let address = broker.allocate(&Allocate::new(8))?;
/// assert_eq!(broker.read_bytes(&ReadBytes::new(address, 8))?, [0; 8]);
/// # Ok::<(), tether_core::TetherError>(())
/// ```
pub struct EmulatedDevice
{
    heap: TargetHeap,
    modules: HashMap<String, HashMap<String, Routine>>,
}

impl EmulatedDevice
{
    #[must_use]
    pub fn new(width: PointerWidth) -> Self
    {
        Self {
            heap: TargetHeap::new(width),
            modules: HashMap::new(),
        }
    }

    /// A device with the built-in `ntoskrnl` routines installed.
    #[must_use]
    pub fn with_kernel_routines(width: PointerWidth) -> Self
    {
        let mut device = Self::new(width);
        super::install_kernel_routines(&mut device);
        device
    }

    /// Register (or replace) `module!function`.
    pub fn register<F>(&mut self, module: &str, function: &str, routine: F)
    where
        F: Fn(&mut TargetHeap, &[Value]) -> Result<Value, DeviceError> + Send + 'static,
    {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(function.to_string(), Box::new(routine));
    }

    #[must_use]
    pub fn heap(&self) -> &TargetHeap
    {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut TargetHeap
    {
        &mut self.heap
    }

    fn call(&mut self, request: &DeviceRequest, scratch: &mut Scratch) -> Result<(), DeviceError>
    {
        let DeviceRequest::CallFunction {
            module,
            function,
            return_type,
            argument_types,
            result_slot,
            argument_slots,
        } = request
        else {
            return Err(DeviceError::MalformedRequest(format!("expected a call, got {}", request.kind())));
        };

        let width = self.heap.width;
        if argument_types.len() != argument_slots.len() {
            return Err(DeviceError::MalformedRequest(format!(
                "{} argument types but {} argument addresses",
                argument_types.len(),
                argument_slots.len()
            )));
        }

        let routine = self
            .modules
            .get(module)
            .ok_or_else(|| DeviceError::ModuleNotFound(module.clone()))?
            .get(function)
            .ok_or_else(|| DeviceError::RoutineNotFound {
                module: module.clone(),
                function: function.clone(),
            })?;

        let mut arguments = Vec::with_capacity(argument_types.len());
        for (ty, slot) in argument_types.iter().zip(argument_slots) {
            let raw = scratch.read(*slot, ty.size(width))?;
            let value = codec::decode_scalar(raw, *ty, width).map_err(|e| DeviceError::MalformedRequest(e.to_string()))?;
            arguments.push(value);
        }

        debug!("Calling {module}!{function} with {} arguments", arguments.len());
        let result = routine(&mut self.heap, &arguments)?;

        if *return_type != FfiType::Void {
            let bytes = codec::encode_scalar(&result, *return_type, width).map_err(|e| DeviceError::Routine(e.to_string()))?;
            scratch.write(*result_slot, &bytes)?;
        }
        Ok(())
    }
}

impl Device for EmulatedDevice
{
    fn pointer_width(&self) -> PointerWidth
    {
        self.heap.width
    }

    fn dispatch(&mut self, request: &[u8], scratch: &mut Scratch) -> Result<(), DeviceError>
    {
        let width = self.heap.width;
        match DeviceRequest::decode(request, width)? {
            request @ DeviceRequest::CallFunction { .. } => self.call(&request, scratch),
            DeviceRequest::ReadBytes { address, buffer, size } => {
                let data = self.heap.read(address, size as usize)?;
                scratch.write(buffer, &data)
            }
            DeviceRequest::WriteBytes { address, buffer, size } => {
                let data = scratch.read(buffer, size as usize)?.to_vec();
                self.heap.write(address, &data)
            }
            DeviceRequest::Allocate { size, result_slot } => {
                let address = self.heap.allocate(size as usize)?;
                let bytes = codec::encode_scalar(&Value::UInt(address.value()), width.native_pointer_type(), width)
                    .map_err(|e| DeviceError::Routine(e.to_string()))?;
                scratch.write(result_slot, &bytes)
            }
            DeviceRequest::Free { address } => self.heap.free(address),
        }
    }
}

impl fmt::Debug for EmulatedDevice
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut modules: Vec<_> = self.modules.keys().collect();
        modules.sort();
        f.debug_struct("EmulatedDevice")
            .field("heap", &self.heap)
            .field("modules", &modules)
            .finish()
    }
}
