//! Built-in routines for the emulated device.
//!
//! A small subset of `ntoskrnl` exports, enough to drive realistic calls
//! with out-parameters and string buffers end to end.

use super::emulator::{EmulatedDevice, TargetHeap};
use super::DeviceError;
use crate::types::{Address, FfiType, TypeDescriptor, TypeRef, Value};

/// Module name the built-in routines are registered under.
pub const KERNEL_MODULE: &str = "ntoskrnl";

// Longest string RtlInitUnicodeString accepts, in UTF-16 units.
const MAX_USTRING_UNITS: u64 = 0x7fff;

/// Register every built-in routine on `device`.
pub fn install_kernel_routines(device: &mut EmulatedDevice)
{
    device.register(KERNEL_MODULE, "RtlInitUnicodeString", rtl_init_unicode_string);
    device.register(KERNEL_MODULE, "RtlCompareMemory", rtl_compare_memory);
    device.register(KERNEL_MODULE, "RtlFillMemory", rtl_fill_memory);
}

fn argument(args: &[Value], index: usize, routine: &str) -> Result<u64, DeviceError>
{
    args.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| DeviceError::Routine(format!("{routine}: missing argument {index}")))
}

fn unicode_string_native(heap: &TargetHeap) -> TypeRef
{
    TypeDescriptor::record(
        "UNICODE_STRING",
        [
            ("Length", TypeDescriptor::scalar(FfiType::UShort)),
            ("MaximumLength", TypeDescriptor::scalar(FfiType::UShort)),
            ("Buffer", TypeDescriptor::scalar(heap.pointer_width().native_pointer_type())),
        ],
    )
}

/// `VOID RtlInitUnicodeString(PUNICODE_STRING Destination, PCWSTR Source)`
fn rtl_init_unicode_string(heap: &mut TargetHeap, args: &[Value]) -> Result<Value, DeviceError>
{
    let destination = Address::new(argument(args, 0, "RtlInitUnicodeString")?);
    let source = Address::new(argument(args, 1, "RtlInitUnicodeString")?);

    let mut units = 0_u64;
    if !source.is_null() {
        while heap.read(source + units * 2, 2)? != [0, 0] {
            units += 1;
            if units >= MAX_USTRING_UNITS {
                return Err(DeviceError::Routine("RtlInitUnicodeString: source string too long".to_string()));
            }
        }
    }

    let (length, maximum) = if source.is_null() { (0, 0) } else { (units * 2, units * 2 + 2) };
    let value = Value::Record(vec![Value::UInt(length), Value::UInt(maximum), Value::UInt(source.value())]);
    let ty = unicode_string_native(heap);
    heap.write_value(destination, &value, &ty)?;
    Ok(Value::Void)
}

/// `SIZE_T RtlCompareMemory(const VOID* Source1, const VOID* Source2, SIZE_T Length)`
fn rtl_compare_memory(heap: &mut TargetHeap, args: &[Value]) -> Result<Value, DeviceError>
{
    let first = Address::new(argument(args, 0, "RtlCompareMemory")?);
    let second = Address::new(argument(args, 1, "RtlCompareMemory")?);
    let length = usize::try_from(argument(args, 2, "RtlCompareMemory")?)
        .map_err(|_| DeviceError::Routine("RtlCompareMemory: length too large".to_string()))?;

    let a = heap.read(first, length)?;
    let b = heap.read(second, length)?;
    let matching = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    Ok(Value::UInt(matching as u64))
}

/// `VOID RtlFillMemory(VOID* Destination, SIZE_T Length, UCHAR Fill)`
fn rtl_fill_memory(heap: &mut TargetHeap, args: &[Value]) -> Result<Value, DeviceError>
{
    let destination = Address::new(argument(args, 0, "RtlFillMemory")?);
    let length = usize::try_from(argument(args, 1, "RtlFillMemory")?)
        .map_err(|_| DeviceError::Routine("RtlFillMemory: length too large".to_string()))?;
    #[allow(clippy::cast_possible_truncation)]
    let fill = argument(args, 2, "RtlFillMemory")? as u8;

    heap.write(destination, &vec![fill; length])?;
    Ok(Value::Void)
}
