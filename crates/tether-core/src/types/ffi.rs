//! Primitive FFI vocabulary.
//!
//! [`FfiType`] is the closed set of machine types a target routine can take
//! or return. Its discriminants are the single-byte tags used on every wire
//! (the local binary layout and the remote protocol), so they must never be
//! reordered.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};

/// Primitive machine type
///
/// Sizes follow the LLP64 model of the target: `int` and `long` are both
/// 4 bytes, `POINTER` is whatever the target's pointer width is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FfiType
{
    Void = 0,
    UInt8 = 1,
    SInt8 = 2,
    UInt16 = 3,
    SInt16 = 4,
    UInt32 = 5,
    SInt32 = 6,
    UInt64 = 7,
    SInt64 = 8,
    Float = 9,
    Double = 10,
    UChar = 11,
    SChar = 12,
    UShort = 13,
    SShort = 14,
    UInt = 15,
    SInt = 16,
    ULong = 17,
    SLong = 18,
    Pointer = 19,
}

impl FfiType
{
    /// Every type, in tag order.
    pub const ALL: [FfiType; 20] = [
        FfiType::Void,
        FfiType::UInt8,
        FfiType::SInt8,
        FfiType::UInt16,
        FfiType::SInt16,
        FfiType::UInt32,
        FfiType::SInt32,
        FfiType::UInt64,
        FfiType::SInt64,
        FfiType::Float,
        FfiType::Double,
        FfiType::UChar,
        FfiType::SChar,
        FfiType::UShort,
        FfiType::SShort,
        FfiType::UInt,
        FfiType::SInt,
        FfiType::ULong,
        FfiType::SLong,
        FfiType::Pointer,
    ];

    /// The one-byte wire tag.
    #[must_use]
    pub const fn tag(self) -> u8
    {
        self as u8
    }

    /// Size in bytes of a value of this type on the target.
    #[must_use]
    pub const fn size(self, width: PointerWidth) -> usize
    {
        match self {
            FfiType::Void => 0,
            FfiType::UInt8 | FfiType::SInt8 | FfiType::UChar | FfiType::SChar => 1,
            FfiType::UInt16 | FfiType::SInt16 | FfiType::UShort | FfiType::SShort => 2,
            FfiType::UInt32
            | FfiType::SInt32
            | FfiType::Float
            | FfiType::UInt
            | FfiType::SInt
            | FfiType::ULong
            | FfiType::SLong => 4,
            FfiType::UInt64 | FfiType::SInt64 | FfiType::Double => 8,
            FfiType::Pointer => width.bytes(),
        }
    }

    /// Whether values of this type are two's-complement signed integers.
    #[must_use]
    pub const fn is_signed(self) -> bool
    {
        matches!(
            self,
            FfiType::SInt8
                | FfiType::SInt16
                | FfiType::SInt32
                | FfiType::SInt64
                | FfiType::SChar
                | FfiType::SShort
                | FfiType::SInt
                | FfiType::SLong
        )
    }

    /// Whether values of this type are IEEE-754 floats.
    #[must_use]
    pub const fn is_float(self) -> bool
    {
        matches!(self, FfiType::Float | FfiType::Double)
    }

    /// Upper-case C-ish name used in logs and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self {
            FfiType::Void => "VOID",
            FfiType::UInt8 => "UINT8",
            FfiType::SInt8 => "SINT8",
            FfiType::UInt16 => "UINT16",
            FfiType::SInt16 => "SINT16",
            FfiType::UInt32 => "UINT32",
            FfiType::SInt32 => "SINT32",
            FfiType::UInt64 => "UINT64",
            FfiType::SInt64 => "SINT64",
            FfiType::Float => "FLOAT",
            FfiType::Double => "DOUBLE",
            FfiType::UChar => "UCHAR",
            FfiType::SChar => "SCHAR",
            FfiType::UShort => "USHORT",
            FfiType::SShort => "SSHORT",
            FfiType::UInt => "UINT",
            FfiType::SInt => "SINT",
            FfiType::ULong => "ULONG",
            FfiType::SLong => "SLONG",
            FfiType::Pointer => "POINTER",
        }
    }
}

impl From<FfiType> for u8
{
    fn from(ty: FfiType) -> Self
    {
        ty.tag()
    }
}

impl TryFrom<u8> for FfiType
{
    type Error = TetherError;

    fn try_from(tag: u8) -> Result<Self>
    {
        FfiType::ALL
            .get(usize::from(tag))
            .copied()
            .ok_or(TetherError::UnknownFfiType(tag))
    }
}

impl fmt::Display for FfiType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

/// Pointer width of a target.
///
/// Fixed for a broker's lifetime. Also decides which addresses the
/// translator treats as belonging to the privileged range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PointerWidth
{
    /// 4-byte pointers
    Bits32,
    /// 8-byte pointers
    Bits64,
}

impl PointerWidth
{
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize
    {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    /// Build from a reported pointer size in bytes.
    ///
    /// ## Errors
    ///
    /// `UnsupportedPointerSize` for anything other than 4 or 8.
    pub fn from_bytes(size: usize) -> Result<Self>
    {
        match size {
            4 => Ok(PointerWidth::Bits32),
            8 => Ok(PointerWidth::Bits64),
            other => Err(TetherError::UnsupportedPointerSize(other)),
        }
    }

    /// The unsigned integer type that holds a native pointer.
    #[must_use]
    pub const fn native_pointer_type(self) -> FfiType
    {
        match self {
            PointerWidth::Bits32 => FfiType::UInt32,
            PointerWidth::Bits64 => FfiType::UInt64,
        }
    }

    /// Whether `address` is representable in this width.
    #[must_use]
    pub const fn fits(self, address: u64) -> bool
    {
        match self {
            PointerWidth::Bits32 => address <= u32::MAX as u64,
            PointerWidth::Bits64 => true,
        }
    }
}

impl From<PointerWidth> for u8
{
    fn from(width: PointerWidth) -> Self
    {
        match width {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }
}

impl TryFrom<u8> for PointerWidth
{
    type Error = TetherError;

    fn try_from(size: u8) -> Result<Self>
    {
        PointerWidth::from_bytes(usize::from(size))
    }
}

impl fmt::Display for PointerWidth
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}
