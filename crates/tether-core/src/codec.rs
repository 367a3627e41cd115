//! Value encoding.
//!
//! Converts [`Value`]s to and from the little-endian C representation of a
//! descriptor on a given target. Encoding is only ever done against native
//! types (see [`native_type`](crate::native::native_type)), so a pointer
//! value lands in an integer slot; if the slot's local address has a remote
//! counterpart in the supplied [`AddressMap`], the remote address is written
//! instead.
//!
//! Integer encoding truncates like a C cast. Decoding yields `Int` for signed
//! types, `UInt` for unsigned ones and pointers, `Float` for both float
//! types, and `Bytes` for arrays of byte-sized unsigned elements.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TetherError};
use crate::translate::AddressMap;
use crate::types::{FfiType, PointerWidth, TypeDescriptor, Value};

/// Encode `value` as `ty`.
///
/// The result is exactly `ty.size(width)` bytes long.
///
/// ## Errors
///
/// `ValueMismatch` if the value's shape doesn't fit the type, `Marshal` if a
/// pointer doesn't fit its slot.
pub fn encode(value: &Value, ty: &TypeDescriptor, width: PointerWidth, map: &AddressMap) -> Result<Vec<u8>>
{
    let mut out = vec![0; ty.size(width)];
    write_value(value, ty, width, map, &mut out)?;
    Ok(out)
}

/// Encode a single scalar argument.
///
/// ## Errors
///
/// Same as [`encode`].
pub fn encode_scalar(value: &Value, ty: FfiType, width: PointerWidth) -> Result<Vec<u8>>
{
    encode(value, &TypeDescriptor::Scalar(ty), width, &AddressMap::default())
}

/// Decode `bytes` as `ty`.
///
/// ## Errors
///
/// `EncodedSizeMismatch` if `bytes` isn't exactly `ty.size(width)` long.
pub fn decode(bytes: &[u8], ty: &TypeDescriptor, width: PointerWidth) -> Result<Value>
{
    let expected = ty.size(width);
    if bytes.len() != expected {
        return Err(TetherError::EncodedSizeMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    read_value(bytes, ty, width)
}

/// Decode a single scalar.
///
/// ## Errors
///
/// Same as [`decode`].
pub fn decode_scalar(bytes: &[u8], ty: FfiType, width: PointerWidth) -> Result<Value>
{
    decode(bytes, &TypeDescriptor::Scalar(ty), width)
}

/// Convert `value` to what a C cast to `ty` would produce.
///
/// ## Errors
///
/// Same as [`encode`].
pub fn cast(value: &Value, ty: FfiType, width: PointerWidth) -> Result<Value>
{
    let bytes = encode_scalar(value, ty, width)?;
    decode_scalar(&bytes, ty, width)
}

fn write_value(value: &Value, ty: &TypeDescriptor, width: PointerWidth, map: &AddressMap, out: &mut [u8]) -> Result<()>
{
    match ty {
        TypeDescriptor::Scalar(kind) => write_scalar(value, *kind, width, map, out),
        TypeDescriptor::Pointer(_) => write_scalar(value, FfiType::Pointer, width, map, out),
        TypeDescriptor::Record(record) => {
            let Value::Record(fields) = value else {
                return Err(TetherError::mismatch(ty, value));
            };
            if fields.len() != record.fields.len() {
                return Err(TetherError::mismatch(ty, value));
            }

            let layout = record.layout(width);
            for ((field, field_value), offset) in record.fields.iter().zip(fields).zip(layout.offsets) {
                let size = field.ty.size(width);
                write_value(field_value, &field.ty, width, map, &mut out[offset..offset + size])?;
            }
            Ok(())
        }
        TypeDescriptor::Array { element, len } => {
            let stride = element.size(width);
            match value {
                Value::Bytes(bytes) if stride == 1 && bytes.len() == *len => {
                    out.copy_from_slice(bytes);
                    Ok(())
                }
                Value::Array(items) if items.len() == *len => {
                    for (item, chunk) in items.iter().zip(out.chunks_exact_mut(stride.max(1))) {
                        write_value(item, element, width, map, chunk)?;
                    }
                    Ok(())
                }
                _ => Err(TetherError::mismatch(ty, value)),
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_scalar(value: &Value, kind: FfiType, width: PointerWidth, map: &AddressMap, out: &mut [u8]) -> Result<()>
{
    let len = out.len();
    let mut slot = out;
    match kind {
        FfiType::Void => match value {
            Value::Void => Ok(()),
            _ => Err(TetherError::mismatch(kind, value)),
        },
        FfiType::Float => {
            let v = value.as_f64().ok_or_else(|| TetherError::mismatch(kind, value))?;
            slot.write_f32::<LittleEndian>(v as f32)?;
            Ok(())
        }
        FfiType::Double => {
            let v = value.as_f64().ok_or_else(|| TetherError::mismatch(kind, value))?;
            slot.write_f64::<LittleEndian>(v)?;
            Ok(())
        }
        _ => {
            let bits = match value {
                Value::Pointer(local) => {
                    let resolved = map.resolve(*local);
                    if len < 8 && !width.fits(resolved) {
                        return Err(too_wide(resolved, len));
                    }
                    resolved
                }
                Value::UInt(raw) if kind == FfiType::Pointer && !width.fits(*raw) => {
                    return Err(too_wide(*raw, len));
                }
                Value::Int(_) | Value::UInt(_) => value.as_u64().unwrap_or_default(),
                _ => return Err(TetherError::mismatch(kind, value)),
            };
            slot.write_uint::<LittleEndian>(low_bytes(bits, len), len)?;
            Ok(())
        }
    }
}

fn too_wide(address: u64, len: usize) -> TetherError
{
    TetherError::Marshal(format!("address 0x{address:x} doesn't fit a {len} byte slot"))
}

/// Keep the low `len` bytes, like a C cast to a narrower integer.
fn low_bytes(bits: u64, len: usize) -> u64
{
    if len >= 8 {
        bits
    } else {
        bits & ((1_u64 << (len * 8)) - 1)
    }
}

fn read_value(bytes: &[u8], ty: &TypeDescriptor, width: PointerWidth) -> Result<Value>
{
    match ty {
        TypeDescriptor::Scalar(kind) => read_scalar(bytes, *kind),
        TypeDescriptor::Pointer(_) => read_scalar(bytes, FfiType::Pointer),
        TypeDescriptor::Record(record) => {
            let layout = record.layout(width);
            let fields = record
                .fields
                .iter()
                .zip(layout.offsets)
                .map(|(field, offset)| read_value(&bytes[offset..offset + field.ty.size(width)], &field.ty, width))
                .collect::<Result<_>>()?;
            Ok(Value::Record(fields))
        }
        TypeDescriptor::Array { element, len } => match **element {
            TypeDescriptor::Scalar(FfiType::UInt8 | FfiType::UChar) => Ok(Value::Bytes(bytes.to_vec())),
            _ => {
                let stride = element.size(width).max(1);
                let items = bytes
                    .chunks_exact(stride)
                    .take(*len)
                    .map(|chunk| read_value(chunk, element, width))
                    .collect::<Result<_>>()?;
                Ok(Value::Array(items))
            }
        },
    }
}

fn read_scalar(bytes: &[u8], kind: FfiType) -> Result<Value>
{
    let mut raw = bytes;
    let value = match kind {
        FfiType::Void => Value::Void,
        FfiType::Float => Value::Float(f64::from(raw.read_f32::<LittleEndian>()?)),
        FfiType::Double => Value::Float(raw.read_f64::<LittleEndian>()?),
        // read_int sign-extends from the slot width
        _ if kind.is_signed() => Value::Int(raw.read_int::<LittleEndian>(bytes.len())?),
        _ => Value::UInt(raw.read_uint::<LittleEndian>(bytes.len())?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::Address;

    #[test]
    fn test_every_scalar_round_trips()
    {
        for width in [PointerWidth::Bits32, PointerWidth::Bits64] {
            for ty in FfiType::ALL {
                let value = if ty == FfiType::Void {
                    Value::Void
                } else if ty.is_float() {
                    Value::Float(1.5)
                } else if ty.is_signed() {
                    Value::Int(-2)
                } else {
                    Value::UInt(0x7f)
                };
                let bytes = encode_scalar(&value, ty, width).unwrap();
                assert_eq!(bytes.len(), ty.size(width), "{ty}");
                assert_eq!(decode_scalar(&bytes, ty, width).unwrap(), value, "{ty} on {width}");
            }
        }
    }

    #[test]
    fn test_integers_truncate_like_c()
    {
        let width = PointerWidth::Bits64;
        assert_eq!(cast(&Value::Int(0x1_0000_0005), FfiType::UInt32, width).unwrap(), Value::UInt(5));
        assert_eq!(cast(&Value::UInt(0xff), FfiType::SInt8, width).unwrap(), Value::Int(-1));
        assert_eq!(cast(&Value::Int(-1), FfiType::UInt16, width).unwrap(), Value::UInt(0xffff));
    }

    #[test]
    fn test_record_layout_bytes()
    {
        let ty = TypeDescriptor::record(
            "UNICODE_STRING_NATIVE",
            [
                ("Length", TypeDescriptor::scalar(FfiType::UShort)),
                ("MaximumLength", TypeDescriptor::scalar(FfiType::UShort)),
                ("Buffer", TypeDescriptor::scalar(FfiType::UInt64)),
            ],
        );
        let value = Value::Record(vec![Value::UInt(8), Value::UInt(10), Value::UInt(0x1122)]);
        let bytes = encode(&value, &ty, PointerWidth::Bits64, &AddressMap::default()).unwrap();
        assert_eq!(bytes, [8, 0, 10, 0, 0, 0, 0, 0, 0x22, 0x11, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode(&bytes, &ty, PointerWidth::Bits64).unwrap(), value);
    }

    #[test]
    fn test_pointer_slot_uses_address_map()
    {
        let mut map = AddressMap::default();
        map.insert(Address::new(0x10000), Address::new(0xdead_0000));
        let slot = TypeDescriptor::Scalar(FfiType::UInt32);

        let mapped = encode(&Value::Pointer(Address::new(0x10000)), &slot, PointerWidth::Bits32, &map).unwrap();
        assert_eq!(mapped, 0xdead_0000_u32.to_le_bytes());

        let unmapped = encode(&Value::Pointer(Address::new(0x20000)), &slot, PointerWidth::Bits32, &map).unwrap();
        assert_eq!(unmapped, 0x20000_u32.to_le_bytes());

        let null = encode(&Value::NULL, &slot, PointerWidth::Bits32, &map).unwrap();
        assert_eq!(null, [0; 4]);
    }

    #[test]
    fn test_pointer_too_wide_for_slot()
    {
        let slot = TypeDescriptor::Scalar(FfiType::UInt32);
        let err = encode(
            &Value::Pointer(Address::new(0x1_0000_0000)),
            &slot,
            PointerWidth::Bits32,
            &AddressMap::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TetherError::Marshal(_)));
    }

    #[test]
    fn test_raw_address_too_wide_for_pointer_slot()
    {
        let err = encode_scalar(&Value::UInt(0x1_0000_0000), FfiType::Pointer, PointerWidth::Bits32).unwrap_err();
        assert_eq!(err.to_string(), "Marshalling error: address 0x100000000 doesn't fit a 4 byte slot");

        let fits = encode_scalar(&Value::UInt(0xffff_fffc), FfiType::Pointer, PointerWidth::Bits32).unwrap();
        assert_eq!(fits, [0xfc, 0xff, 0xff, 0xff]);
        // plain integer slots still truncate
        assert_eq!(
            encode_scalar(&Value::UInt(0x1_0000_0002), FfiType::UInt32, PointerWidth::Bits32).unwrap(),
            [2, 0, 0, 0]
        );
    }

    #[test]
    fn test_byte_arrays_decode_as_bytes()
    {
        let ty = TypeDescriptor::Array {
            element: TypeDescriptor::scalar(FfiType::UInt8),
            len: 3,
        };
        let bytes = encode(&Value::Bytes(vec![1, 2, 3]), &ty, PointerWidth::Bits64, &AddressMap::default()).unwrap();
        assert_eq!(decode(&bytes, &ty, PointerWidth::Bits64).unwrap(), Value::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_shape_mismatch()
    {
        let ty = TypeDescriptor::Scalar(FfiType::SInt);
        let err = encode(&Value::Bytes(vec![1]), &ty, PointerWidth::Bits64, &AddressMap::default()).unwrap_err();
        assert!(matches!(err, TetherError::ValueMismatch { .. }));

        let err = decode(&[0; 3], &ty, PointerWidth::Bits64).unwrap_err();
        assert!(matches!(err, TetherError::EncodedSizeMismatch { expected: 4, actual: 3 }));
    }
}
