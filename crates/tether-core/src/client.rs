//! # Client
//!
//! The user-facing entry point. A [`Client`] owns a broker and a registry of
//! declared functions, checks calls against their declarations, translates
//! pointer-graph arguments and offers a few memory helpers on top.
//!
//! ## Example
//!
//! ```rust
//! use tether_core::device::EmulatedDevice;
//! use tether_core::local::LocalBroker;
//! use tether_core::types::{FfiFunction, FfiType, PointerWidth, Value};
//! use tether_core::Client;
//!
//! let mut device = EmulatedDevice::new(PointerWidth::Bits64);
//! device.register("hal", "Twice", |_, args| Ok(Value::Int(args[0].as_i64().unwrap_or(0) * 2)));
//!
//! let mut client = Client::new(LocalBroker::new(device));
//! client.declare("hal", FfiFunction::new("Twice", FfiType::SInt).param("x", FfiType::SInt));
//! assert_eq!(client.call("hal", "Twice", &[Value::Int(21)])?, Value::Int(42));
//! # Ok::<(), tether_core::TetherError>(())
//! ```

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::allocation::Allocation;
use crate::broker::Broker;
use crate::codec;
use crate::error::{Result, TetherError};
use crate::native::native_type;
use crate::requests::{CallRequest, FfiArgument, ReadBytes, WriteBytes};
use crate::translate::{Argument, LocalMemory, TranslatedArgs, Translator};
use crate::types::{Address, FfiFunction, FunctionRegistry, TypeDescriptor, TypeRef, Value};

// Upper bound for NUL-terminated string reads.
const MAX_STRING_BYTES: usize = 0x1_0000;

/// Options for [`Client::ex_call`].
#[derive(Debug, Clone)]
pub struct ExCallOptions
{
    /// Reinterpret the raw return value as this type.
    pub return_type: Option<TypeRef>,
    /// Re-read translated arguments after the call.
    pub read_back: bool,
}

impl Default for ExCallOptions
{
    fn default() -> Self
    {
        Self {
            return_type: None,
            read_back: true,
        }
    }
}

/// Result of [`Client::ex_call`].
///
/// The caller owns `allocations` and should free them once done with any
/// target addresses the call produced.
#[derive(Debug)]
pub struct ExCallOutcome<'b>
{
    pub return_value: Value,
    /// Read-back values, or the translated values if read-back was off
    pub arguments: Vec<Value>,
    pub allocations: Vec<Allocation<'b>>,
}

/// Declares and calls target functions through a broker.
pub struct Client<B: Broker>
{
    broker: B,
    functions: FunctionRegistry,
}

impl<B: Broker> Client<B>
{
    pub fn new(broker: B) -> Self
    {
        Self {
            broker,
            functions: FunctionRegistry::new(),
        }
    }

    pub fn broker(&self) -> &B
    {
        &self.broker
    }

    /// Declare (or redeclare) a function exported by `module`.
    pub fn declare(&mut self, module: &str, function: FfiFunction)
    {
        self.functions.set(module, function);
    }

    /// Declare several functions; returns their names.
    pub fn declare_all(&mut self, module: &str, functions: impl IntoIterator<Item = FfiFunction>) -> Vec<String>
    {
        functions
            .into_iter()
            .map(|function| {
                let name = function.name.clone();
                self.functions.set(module, function);
                name
            })
            .collect()
    }

    #[must_use]
    pub fn is_declared(&self, module: &str, function: &str) -> bool
    {
        self.functions.exists(module, function)
    }

    /// Call a declared function with target-native arguments.
    ///
    /// ## Errors
    ///
    /// - `UndeclaredFunction` if nothing was declared under that name
    /// - `ArgumentCount` if `args` doesn't match the declaration
    /// - Broker errors
    pub fn call(&self, module: &str, function: &str, args: &[Value]) -> Result<Value>
    {
        let declaration = self.functions.get(module, function)?;
        check_arity(declaration, args.len())?;

        let arguments = declaration
            .parameters
            .iter()
            .zip(args)
            .map(|(param, value)| FfiArgument::new(param.ty, value.clone()))
            .collect();

        debug!("Calling {module}!{function}");
        self.broker
            .call_function(&CallRequest::new(module, function, declaration.return_type, arguments))
    }

    /// Call a declared function, copying pointer-graph arguments to the
    /// target first.
    ///
    /// The argument count is checked before anything is allocated.
    ///
    /// ## Errors
    ///
    /// Everything [`call`](Self::call) and [`Translator::translate`] report,
    /// plus read failures during return-value casting or read-back.
    pub fn ex_call(
        &self,
        module: &str,
        function: &str,
        memory: &LocalMemory,
        args: Vec<Argument>,
        options: ExCallOptions,
    ) -> Result<ExCallOutcome<'_>>
    {
        let declaration = self.functions.get(module, function)?;
        check_arity(declaration, args.len())?;

        let translator = Translator::new(&self.broker)?;
        let translated = translator.translate(memory, args)?;

        match self.complete_call(module, function, &translated, &options) {
            Ok((return_value, arguments)) => Ok(ExCallOutcome {
                return_value,
                arguments,
                allocations: translated.into_allocations(),
            }),
            Err(e) => {
                if let Err(release_err) = translated.release() {
                    warn!("Failed to release allocations for {module}!{function}: {release_err}");
                }
                Err(e)
            }
        }
    }

    fn complete_call(
        &self,
        module: &str,
        function: &str,
        translated: &TranslatedArgs<'_>,
        options: &ExCallOptions,
    ) -> Result<(Value, Vec<Value>)>
    {
        let raw = self.call(module, function, &translated.values())?;

        let return_value = match &options.return_type {
            Some(ty) => self.cast_return_value(&raw, ty)?,
            None => raw,
        };

        let arguments = if options.read_back {
            translated.read_back()?
        } else {
            translated.values()
        };

        Ok((return_value, arguments))
    }

    fn cast_return_value(&self, raw: &Value, ty: &TypeRef) -> Result<Value>
    {
        let width = self.broker.pointer_width()?;
        match &**ty {
            TypeDescriptor::Scalar(kind) => codec::cast(raw, *kind, width),
            TypeDescriptor::Pointer(target) => {
                let address = raw.as_u64().ok_or_else(|| TetherError::mismatch(ty, raw))?;
                if address == 0 {
                    return Ok(Value::Void);
                }
                let native = native_type(target, width);
                let size = native.size(width);
                if size == 0 {
                    return Ok(Value::UInt(address));
                }
                let bytes = self.read_bytes(Address::new(address), size)?;
                codec::decode(&bytes, &native, width)
            }
            _ => Err(TetherError::UnsupportedType(format!("{ty} as a return type"))),
        }
    }

    /// ## Errors
    ///
    /// Broker errors.
    pub fn read_bytes(&self, address: Address, size: usize) -> Result<Vec<u8>>
    {
        self.broker.read_bytes(&ReadBytes::new(address, size))
    }

    /// ## Errors
    ///
    /// Broker errors.
    pub fn write_bytes(&self, address: Address, data: &[u8]) -> Result<()>
    {
        self.broker.write_bytes(&WriteBytes::new(address, data))
    }

    /// Read a NUL-terminated ASCII string.
    ///
    /// ## Errors
    ///
    /// `Marshal` for non-ASCII bytes or a missing terminator, broker errors.
    pub fn read_string(&self, address: Address) -> Result<String>
    {
        let bytes = self.read_terminated(address, 1)?;
        if !bytes.is_ascii() {
            return Err(TetherError::Marshal(format!("string at {address} is not ASCII")));
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read a NUL-terminated UTF-16LE string.
    ///
    /// ## Errors
    ///
    /// `Marshal` for invalid UTF-16 or a missing terminator, broker errors.
    pub fn read_wide_string(&self, address: Address) -> Result<String>
    {
        let bytes = self.read_terminated(address, 2)?;
        let mut units = vec![0; bytes.len() / 2];
        LittleEndian::read_u16_into(&bytes[..units.len() * 2], &mut units);
        String::from_utf16(&units).map_err(|e| TetherError::Marshal(format!("string at {address}: {e}")))
    }

    /// Allocate `size` bytes on the target.
    ///
    /// ## Errors
    ///
    /// `ZeroSizedAllocation` for 0, broker errors.
    pub fn allocate(&self, size: usize) -> Result<Allocation<'_>>
    {
        Allocation::new(&self.broker, size)
    }

    /// Read `unit`-byte characters until an all-zero one, exclusive.
    fn read_terminated(&self, address: Address, unit: usize) -> Result<Vec<u8>>
    {
        let mut out = Vec::new();
        let mut cursor = address;
        loop {
            let ch = self.read_bytes(cursor, unit)?;
            if ch.iter().all(|b| *b == 0) {
                return Ok(out);
            }
            out.extend_from_slice(&ch);
            if out.len() >= MAX_STRING_BYTES {
                return Err(TetherError::Marshal(format!(
                    "no terminator within {MAX_STRING_BYTES} bytes of {address}"
                )));
            }
            cursor = cursor + unit as u64;
        }
    }
}

fn check_arity(declaration: &FfiFunction, given: usize) -> Result<()>
{
    let expected = declaration.parameters.len();
    if expected == given {
        Ok(())
    } else {
        Err(TetherError::ArgumentCount {
            function: declaration.name.clone(),
            expected,
            given,
        })
    }
}
