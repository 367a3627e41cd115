//! Fixed binary request layout understood by the privileged device.
//!
//! Every request starts with a one-byte kind. Strings and arrays are prefixed
//! with a one-byte length, addresses are little-endian and as wide as the
//! target's pointers, sizes are little-endian `u32`.
//!
//! | Kind | Fields after the kind byte |
//! |---|---|
//! | 1 call  | module · function · return type · argument types · result slot · argument slots |
//! | 2 read  | address · result buffer · size |
//! | 3 write | address · source buffer · size |
//! | 4 alloc | size · result slot |
//! | 5 free  | address |

use std::fmt;
use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::device::DeviceError;
use crate::error::{Result, TetherError};
use crate::types::{Address, FfiType, PointerWidth};

/// Request kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind
{
    Invalid = 0,
    CallFunction = 1,
    ReadBytes = 2,
    WriteBytes = 3,
    Allocate = 4,
    Free = 5,
}

impl TryFrom<u8> for RequestKind
{
    type Error = DeviceError;

    fn try_from(byte: u8) -> std::result::Result<Self, DeviceError>
    {
        match byte {
            1 => Ok(RequestKind::CallFunction),
            2 => Ok(RequestKind::ReadBytes),
            3 => Ok(RequestKind::WriteBytes),
            4 => Ok(RequestKind::Allocate),
            5 => Ok(RequestKind::Free),
            other => Err(DeviceError::UnknownRequestKind(other)),
        }
    }
}

impl fmt::Display for RequestKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            RequestKind::Invalid => "INVALID",
            RequestKind::CallFunction => "CALL_FUNCTION",
            RequestKind::ReadBytes => "READ_BYTES",
            RequestKind::WriteBytes => "WRITE_BYTES",
            RequestKind::Allocate => "ALLOCATE",
            RequestKind::Free => "FREE",
        };
        f.write_str(name)
    }
}

/// A request as seen by the device.
///
/// Addresses in `result_slot`, `argument_slots` and `buffer` refer to the
/// caller's [`Scratch`](super::Scratch), everything else to target memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest
{
    CallFunction
    {
        module: String,
        function: String,
        return_type: FfiType,
        argument_types: Vec<FfiType>,
        result_slot: Address,
        argument_slots: Vec<Address>,
    },
    ReadBytes
    {
        address: Address,
        buffer: Address,
        size: u32,
    },
    WriteBytes
    {
        address: Address,
        buffer: Address,
        size: u32,
    },
    Allocate
    {
        size: u32,
        result_slot: Address,
    },
    Free
    {
        address: Address,
    },
}

impl DeviceRequest
{
    #[must_use]
    pub fn kind(&self) -> RequestKind
    {
        match self {
            DeviceRequest::CallFunction { .. } => RequestKind::CallFunction,
            DeviceRequest::ReadBytes { .. } => RequestKind::ReadBytes,
            DeviceRequest::WriteBytes { .. } => RequestKind::WriteBytes,
            DeviceRequest::Allocate { .. } => RequestKind::Allocate,
            DeviceRequest::Free { .. } => RequestKind::Free,
        }
    }

    /// Lay the request out for a target of the given width.
    ///
    /// ## Errors
    ///
    /// `Marshal` for non-ASCII or over-long names, more than 255 arguments,
    /// or an address that doesn't fit the pointer width.
    pub fn encode(&self, width: PointerWidth) -> Result<Vec<u8>>
    {
        let mut writer = LayoutWriter::new(width);
        writer.byte(self.kind() as u8)?;

        match self {
            DeviceRequest::CallFunction {
                module,
                function,
                return_type,
                argument_types,
                result_slot,
                argument_slots,
            } => {
                writer.name(module)?;
                writer.name(function)?;
                writer.byte(return_type.tag())?;
                writer.count(argument_types.len(), "argument types")?;
                for ty in argument_types {
                    writer.byte(ty.tag())?;
                }
                writer.address(*result_slot)?;
                writer.count(argument_slots.len(), "argument addresses")?;
                for slot in argument_slots {
                    writer.address(*slot)?;
                }
            }
            DeviceRequest::ReadBytes { address, buffer, size } | DeviceRequest::WriteBytes { address, buffer, size } => {
                writer.address(*address)?;
                writer.address(*buffer)?;
                writer.size(*size)?;
            }
            DeviceRequest::Allocate { size, result_slot } => {
                writer.size(*size)?;
                writer.address(*result_slot)?;
            }
            DeviceRequest::Free { address } => writer.address(*address)?,
        }

        Ok(writer.finish())
    }

    /// Parse a request laid out by [`encode`](Self::encode).
    ///
    /// ## Errors
    ///
    /// `MalformedRequest` for truncated input, overrunning length prefixes,
    /// unknown type tags or trailing bytes; `UnknownRequestKind` for a bad
    /// kind byte.
    pub fn decode(bytes: &[u8], width: PointerWidth) -> std::result::Result<Self, DeviceError>
    {
        let mut reader = LayoutReader::new(bytes, width);
        let kind = RequestKind::try_from(reader.byte()?)?;

        let request = match kind {
            RequestKind::CallFunction => {
                let module = reader.name()?;
                let function = reader.name()?;
                let return_type = reader.tag()?;
                let count = reader.byte()?;
                let argument_types = (0..count).map(|_| reader.tag()).collect::<std::result::Result<_, _>>()?;
                let result_slot = reader.address()?;
                let count = reader.byte()?;
                let argument_slots = (0..count)
                    .map(|_| reader.address())
                    .collect::<std::result::Result<_, _>>()?;
                DeviceRequest::CallFunction {
                    module,
                    function,
                    return_type,
                    argument_types,
                    result_slot,
                    argument_slots,
                }
            }
            RequestKind::ReadBytes => DeviceRequest::ReadBytes {
                address: reader.address()?,
                buffer: reader.address()?,
                size: reader.size()?,
            },
            RequestKind::WriteBytes => DeviceRequest::WriteBytes {
                address: reader.address()?,
                buffer: reader.address()?,
                size: reader.size()?,
            },
            RequestKind::Allocate => DeviceRequest::Allocate {
                size: reader.size()?,
                result_slot: reader.address()?,
            },
            RequestKind::Free => DeviceRequest::Free {
                address: reader.address()?,
            },
            RequestKind::Invalid => return Err(DeviceError::UnknownRequestKind(0)),
        };

        reader.finish()?;
        Ok(request)
    }
}

/// Convert a buffer length to the layout's `u32` size field.
///
/// ## Errors
///
/// `Marshal` for buffers over `u32::MAX` bytes.
pub fn layout_size(len: usize) -> Result<u32>
{
    u32::try_from(len).map_err(|_| TetherError::Marshal(format!("buffer of {len} bytes is too large")))
}

struct LayoutWriter
{
    width: PointerWidth,
    buf: Vec<u8>,
}

impl LayoutWriter
{
    fn new(width: PointerWidth) -> Self
    {
        Self { width, buf: Vec::new() }
    }

    fn byte(&mut self, byte: u8) -> Result<()>
    {
        self.buf.write_u8(byte)?;
        Ok(())
    }

    fn count(&mut self, len: usize, what: &str) -> Result<()>
    {
        let len = u8::try_from(len).map_err(|_| TetherError::Marshal(format!("too many {what} ({len})")))?;
        self.byte(len)
    }

    fn name(&mut self, name: &str) -> Result<()>
    {
        if !name.is_ascii() {
            return Err(TetherError::Marshal(format!("name {name:?} is not ASCII")));
        }
        self.count(name.len(), "name bytes")?;
        self.buf.write_all(name.as_bytes())?;
        Ok(())
    }

    fn address(&mut self, address: Address) -> Result<()>
    {
        if !self.width.fits(address.value()) {
            return Err(TetherError::Marshal(format!(
                "address {address} doesn't fit a {} pointer",
                self.width
            )));
        }
        self.buf.write_uint::<LittleEndian>(address.value(), self.width.bytes())?;
        Ok(())
    }

    fn size(&mut self, size: u32) -> Result<()>
    {
        self.buf.write_u32::<LittleEndian>(size)?;
        Ok(())
    }

    fn finish(self) -> Vec<u8>
    {
        self.buf
    }
}

struct LayoutReader<'a>
{
    cursor: Cursor<&'a [u8]>,
    width: PointerWidth,
}

impl<'a> LayoutReader<'a>
{
    fn new(bytes: &'a [u8], width: PointerWidth) -> Self
    {
        Self {
            cursor: Cursor::new(bytes),
            width,
        }
    }

    fn remaining(&self) -> u64
    {
        (self.cursor.get_ref().len() as u64).saturating_sub(self.cursor.position())
    }

    /// Run one read, turning a short buffer into `MalformedRequest`.
    fn read<T>(
        &mut self,
        what: &str,
        read: impl FnOnce(&mut Cursor<&'a [u8]>) -> io::Result<T>,
    ) -> std::result::Result<T, DeviceError>
    {
        let offset = self.cursor.position();
        let left = self.remaining();
        read(&mut self.cursor).map_err(|_| {
            DeviceError::MalformedRequest(format!(
                "{what} at offset {offset} overruns the request ({left} bytes left)"
            ))
        })
    }

    fn byte(&mut self) -> std::result::Result<u8, DeviceError>
    {
        self.read("byte", |cursor| cursor.read_u8())
    }

    fn tag(&mut self) -> std::result::Result<FfiType, DeviceError>
    {
        let tag = self.byte()?;
        FfiType::try_from(tag).map_err(|e| DeviceError::MalformedRequest(e.to_string()))
    }

    fn name(&mut self) -> std::result::Result<String, DeviceError>
    {
        let mut raw = vec![0; usize::from(self.byte()?)];
        self.read("name", |cursor| cursor.read_exact(&mut raw))?;
        if !raw.is_ascii() {
            return Err(DeviceError::MalformedRequest("name is not ASCII".to_string()));
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn address(&mut self) -> std::result::Result<Address, DeviceError>
    {
        let width = self.width.bytes();
        self.read("address", |cursor| cursor.read_uint::<LittleEndian>(width)).map(Address::new)
    }

    fn size(&mut self) -> std::result::Result<u32, DeviceError>
    {
        self.read("size", |cursor| cursor.read_u32::<LittleEndian>())
    }

    fn finish(self) -> std::result::Result<(), DeviceError>
    {
        match self.remaining() {
            0 => Ok(()),
            left => Err(DeviceError::MalformedRequest(format!("{left} trailing bytes"))),
        }
    }
}
